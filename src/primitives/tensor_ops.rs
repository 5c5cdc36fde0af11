//! Core Tensor Operations
//!
//! Device selection, parameter initialization, and the segmented/grouped
//! primitives that back the attention engine: batched matmul keyed by
//! contiguous row ranges, softmax grouped by an index array, and scatter
//! summation.

use crate::{GraphAttentionError, Result};
use candle_core::{DType, Device, Shape, Tensor, Var, D};
use serde::{Deserialize, Serialize};
use tracing::info;

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
///
/// Set `AN_GRAPH_NO_GPU=1` to force CPU-only mode.
pub fn gpu_disabled() -> bool {
    std::env::var("AN_GRAPH_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `AN_GRAPH_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon - M1/M2/M3)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    // Check for forced CPU mode
    if gpu_disabled() {
        info!("💻 Using CPU device (AN_GRAPH_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("🍎 Using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("🟢 Using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    // Fallback to CPU
    info!("💻 Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

/// Check if Metal is available (respects AN_GRAPH_NO_GPU)
#[cfg(feature = "metal")]
pub fn metal_available() -> bool {
    !gpu_disabled() && Device::new_metal(0).is_ok()
}

/// Check if Metal is available (always false when `metal` feature is not enabled)
#[cfg(not(feature = "metal"))]
pub fn metal_available() -> bool {
    false
}

/// Check if CUDA is available (respects AN_GRAPH_NO_GPU)
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    !gpu_disabled() && Device::new_cuda(0).is_ok()
}

/// Check if CUDA is available (always false when `cuda` feature is not enabled)
#[cfg(not(feature = "cuda"))]
pub fn cuda_available() -> bool {
    false
}

/// Check if any GPU is available and enabled
pub fn gpu_available() -> bool {
    !gpu_disabled() && (metal_available() || cuda_available())
}

// ============================================================================
// Parameter Initialization
// ============================================================================

/// Glorot (Xavier) uniform initialization
///
/// Samples uniformly from `[-a, a]` with `a = sqrt(6 / (fan_in + fan_out))`,
/// where the fans are taken from the last two dims. Keeps activation variance
/// roughly constant through a linear transform.
pub fn glorot<S: Into<Shape>>(shape: S, device: &Device) -> Result<Tensor> {
    let shape: Shape = shape.into();
    let dims = shape.dims();
    if dims.len() < 2 {
        return Err(GraphAttentionError::Config(format!(
            "glorot initialization needs at least 2 dims, got {:?}",
            dims
        )));
    }
    let fan_in = dims[dims.len() - 2];
    let fan_out = dims[dims.len() - 1];
    let bound = (6.0f32 / (fan_in + fan_out) as f32).sqrt();
    Tensor::rand(-bound, bound, shape, device)
        .map_err(|e| GraphAttentionError::Tensor(format!("glorot rand failed: {}", e)))
}

/// Glorot-initialized trainable variable
pub fn glorot_var<S: Into<Shape>>(shape: S, device: &Device) -> Result<Var> {
    Var::from_tensor(&glorot(shape, device)?)
        .map_err(|e| GraphAttentionError::Tensor(format!("glorot var failed: {}", e)))
}

/// All-ones trainable variable
///
/// The neutral initialization for relation priors and skip gates.
pub fn ones_var<S: Into<Shape>>(shape: S, device: &Device) -> Result<Var> {
    Var::ones(shape, DType::F32, device)
        .map_err(|e| GraphAttentionError::Tensor(format!("ones var failed: {}", e)))
}

// ============================================================================
// Segmented Matmul
// ============================================================================

/// Batched matrix multiply keyed by contiguous row ranges
///
/// Segment `i` covers rows `ptr[i]..ptr[i + 1]` of `input` and is multiplied
/// by `weights[i]`; the per-segment products are concatenated back in order,
/// so the output has exactly as many rows as the input. No padding to a
/// uniform segment size is required.
///
/// `ptr` must exactly partition the input rows: `ptr[0] == 0`, entries
/// non-decreasing, last entry equal to the row count, and one segment per
/// weight matrix. Any violation is an error — a silently shifted boundary
/// would attribute rows to the wrong weight matrix.
pub fn segment_matmul(input: &Tensor, ptr: &[usize], weights: &[Tensor]) -> Result<Tensor> {
    let (rows, _cols) = input
        .dims2()
        .map_err(|e| GraphAttentionError::Tensor(format!("segment_matmul dims2 failed: {}", e)))?;

    if weights.is_empty() {
        return Err(GraphAttentionError::Tensor(
            "segment_matmul requires at least one segment".into(),
        ));
    }
    if ptr.len() != weights.len() + 1 {
        return Err(GraphAttentionError::Tensor(format!(
            "segment_matmul boundary table has {} entries for {} segments (want {})",
            ptr.len(),
            weights.len(),
            weights.len() + 1
        )));
    }
    if ptr[0] != 0 {
        return Err(GraphAttentionError::Tensor(format!(
            "segment_matmul boundaries must start at 0, got {}",
            ptr[0]
        )));
    }
    for w in ptr.windows(2) {
        if w[1] < w[0] {
            return Err(GraphAttentionError::Tensor(format!(
                "segment_matmul boundaries must be non-decreasing, got {} then {}",
                w[0], w[1]
            )));
        }
    }
    if ptr[ptr.len() - 1] != rows {
        return Err(GraphAttentionError::Tensor(format!(
            "segment_matmul boundaries cover {} rows but input has {}",
            ptr[ptr.len() - 1],
            rows
        )));
    }

    let mut pieces = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let len = ptr[i + 1] - ptr[i];
        if len == 0 {
            continue;
        }
        let seg = input
            .narrow(0, ptr[i], len)
            .map_err(|e| GraphAttentionError::Tensor(format!("segment narrow failed: {}", e)))?;
        pieces.push(seg.matmul(w).map_err(|e| {
            GraphAttentionError::Tensor(format!("segment {} matmul failed: {}", i, e))
        })?);
    }

    if pieces.is_empty() {
        // All segments empty: produce a 0-row result with the output width.
        let (_, n_out) = weights[0]
            .dims2()
            .map_err(|e| GraphAttentionError::Tensor(format!("weight dims2 failed: {}", e)))?;
        return Tensor::zeros((0, n_out), input.dtype(), input.device())
            .map_err(|e| GraphAttentionError::Tensor(format!("empty output failed: {}", e)));
    }

    Tensor::cat(&pieces, 0)
        .map_err(|e| GraphAttentionError::Tensor(format!("segment cat failed: {}", e)))
}

// ============================================================================
// Grouped Softmax and Scatter Aggregation
// ============================================================================

/// Numerically stable softmax grouped by an index array
///
/// `scores` is `[e, heads]` (f32) and `index` maps each row to a group in
/// `0..num_groups`; rows sharing a group index are normalized together,
/// independently per head. No sorting of `index` is required.
///
/// Each group's scores are shifted by the group maximum before
/// exponentiation. Softmax is invariant under a per-group shift, so
/// rebuilding the shift as a constant tensor is exact and leaves the
/// gradient path through the remaining ops untouched.
pub fn scatter_softmax(scores: &Tensor, index: &Tensor, num_groups: usize) -> Result<Tensor> {
    let (e, h) = scores
        .dims2()
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax dims2 failed: {}", e)))?;
    let idx_len = index
        .dims1()
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax index dims failed: {}", e)))?;
    if idx_len != e {
        return Err(GraphAttentionError::Tensor(format!(
            "scatter_softmax got {} scores for {} indices",
            e, idx_len
        )));
    }
    if e == 0 {
        return Ok(scores.clone());
    }

    let idx = index
        .to_vec1::<u32>()
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax index read failed: {}", e)))?;
    let vals = scores
        .to_vec2::<f32>()
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax score read failed: {}", e)))?;

    // Per-(group, head) maxima
    let mut maxes = vec![f32::NEG_INFINITY; num_groups * h];
    for (row, &g) in idx.iter().enumerate() {
        let g = g as usize;
        if g >= num_groups {
            return Err(GraphAttentionError::Tensor(format!(
                "scatter_softmax index {} out of range for {} groups",
                g, num_groups
            )));
        }
        for c in 0..h {
            let slot = &mut maxes[g * h + c];
            *slot = slot.max(vals[row][c]);
        }
    }

    let shift: Vec<f32> = idx
        .iter()
        .flat_map(|&g| maxes[g as usize * h..(g as usize + 1) * h].iter().copied())
        .collect();
    let shift = Tensor::from_vec(shift, (e, h), scores.device())
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax shift failed: {}", e)))?;

    let exp = scores
        .sub(&shift)
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax sub failed: {}", e)))?
        .exp()
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax exp failed: {}", e)))?;

    let sums = scatter_sum(&exp, index, num_groups)?;
    let denom = sums
        .index_select(index, 0)
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax gather failed: {}", e)))?
        .affine(1.0, 1e-16)
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax epsilon failed: {}", e)))?;

    exp.div(&denom)
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_softmax div failed: {}", e)))
}

/// Sum rows of `source` into `num_groups` buckets given by `index`
///
/// `source` is `[e, ...]`; the result is `[num_groups, ...]` with row `g`
/// holding the sum of all source rows whose index is `g`. Groups without any
/// rows stay zero.
pub fn scatter_sum(source: &Tensor, index: &Tensor, num_groups: usize) -> Result<Tensor> {
    let dims = source.dims();
    if dims.is_empty() {
        return Err(GraphAttentionError::Tensor(
            "scatter_sum needs at least 1 dim".into(),
        ));
    }
    let idx_len = index
        .dims1()
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_sum index dims failed: {}", e)))?;
    if idx_len != dims[0] {
        return Err(GraphAttentionError::Tensor(format!(
            "scatter_sum got {} rows for {} indices",
            dims[0], idx_len
        )));
    }

    let mut out_dims = dims.to_vec();
    out_dims[0] = num_groups;
    let zeros = Tensor::zeros(out_dims, source.dtype(), source.device())
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_sum zeros failed: {}", e)))?;
    if dims[0] == 0 {
        return Ok(zeros);
    }

    zeros
        .index_add(index, source, 0)
        .map_err(|e| GraphAttentionError::Tensor(format!("scatter_sum index_add failed: {}", e)))
}

// ============================================================================
// Grouping Reductions
// ============================================================================

/// Reduction used to combine tensors produced by different relations
///
/// `Cat` concatenates along the last dim, `Stack` stacks along a new dim 1;
/// the rest reduce a stacked dim 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupAggr {
    #[default]
    Sum,
    Mean,
    Min,
    Max,
    Cat,
    Stack,
}

/// Combine a list of same-shaped tensors with the given reduction
///
/// Returns `None` for an empty list. A singleton list is returned as-is
/// except under `Stack`, which always adds the stacking dim.
pub fn group_tensors(xs: &[Tensor], aggr: GroupAggr) -> Result<Option<Tensor>> {
    if xs.is_empty() {
        return Ok(None);
    }
    if aggr == GroupAggr::Stack {
        return Tensor::stack(xs, 1)
            .map(Some)
            .map_err(|e| GraphAttentionError::Tensor(format!("group stack failed: {}", e)));
    }
    if xs.len() == 1 {
        return Ok(Some(xs[0].clone()));
    }
    if aggr == GroupAggr::Cat {
        return Tensor::cat(xs, D::Minus1)
            .map(Some)
            .map_err(|e| GraphAttentionError::Tensor(format!("group cat failed: {}", e)));
    }

    let stacked = Tensor::stack(xs, 0)
        .map_err(|e| GraphAttentionError::Tensor(format!("group stack failed: {}", e)))?;
    let out = match aggr {
        GroupAggr::Sum => stacked.sum(0),
        GroupAggr::Mean => stacked.mean(0),
        GroupAggr::Min => stacked.min(0),
        GroupAggr::Max => stacked.max(0),
        GroupAggr::Cat | GroupAggr::Stack => unreachable!("handled above"),
    }
    .map_err(|e| GraphAttentionError::Tensor(format!("group reduce failed: {}", e)))?;
    Ok(Some(out))
}
