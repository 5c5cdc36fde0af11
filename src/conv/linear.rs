//! Per-type linear projection strategies
//!
//! Projects a heterogeneous feature dict (one tensor per node type, possibly
//! with different widths) to a fixed output width per type. Two strategies
//! with identical numerics sit behind [`HeteroProjector`]:
//!
//! - [`GroupedLinear`]: zero-pads features and weights to the widest input
//!   and issues a single segmented matmul keyed by node type
//! - [`PerTypeLinear`]: one dense projection per node type in sequence
//!
//! The strategy is picked once at construction; forward logic never branches
//! on it.

use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;
use crate::primitives::{glorot, glorot_var, segment_matmul};
use crate::{GraphAttentionError, Result};

/// Projection strategy selected at layer construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectorStrategy {
    /// One segmented matmul keyed by node type
    #[default]
    Grouped,
    /// Sequential dense projection per node type
    PerType,
}

/// Maps per-type feature slots to per-type projected tensors
///
/// Slots are aligned to node type registration order; absent slots stay
/// absent. Implementations are pure functions of their parameters.
pub trait HeteroProjector: std::fmt::Debug {
    /// Project every present slot to the configured output width
    fn project(&self, xs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>>;

    /// Trainable parameters in declaration order
    fn trainable_vars(&self) -> Vec<Var>;

    /// `(name, parameter)` pairs, e.g. `k_lin.author.weight`
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)>;

    /// Re-initialize all parameters in place (Glorot weights, zero biases)
    fn reset_parameters(&self) -> Result<()>;
}

/// Build a projector for the given strategy
pub fn new_projector(
    strategy: ProjectorStrategy,
    metadata: &Metadata,
    in_channels: &[usize],
    out_channels: usize,
    device: &Device,
) -> Result<Box<dyn HeteroProjector>> {
    match strategy {
        ProjectorStrategy::Grouped => Ok(Box::new(GroupedLinear::new(
            metadata,
            in_channels,
            out_channels,
            device,
        )?)),
        ProjectorStrategy::PerType => Ok(Box::new(PerTypeLinear::new(
            metadata,
            in_channels,
            out_channels,
            device,
        )?)),
    }
}

// ============================================================================
// Shared parameter block
// ============================================================================

/// Per-type weight/bias pairs shared by both strategies
#[derive(Debug)]
struct TypeLinearParams {
    names: Vec<String>,
    in_channels: Vec<usize>,
    out_channels: usize,
    weights: Vec<Var>,
    biases: Vec<Var>,
}

impl TypeLinearParams {
    fn new(
        metadata: &Metadata,
        in_channels: &[usize],
        out_channels: usize,
        device: &Device,
    ) -> Result<Self> {
        if in_channels.len() != metadata.num_node_types() {
            return Err(GraphAttentionError::Config(format!(
                "{} input widths for {} node types",
                in_channels.len(),
                metadata.num_node_types()
            )));
        }

        let mut weights = Vec::with_capacity(in_channels.len());
        let mut biases = Vec::with_capacity(in_channels.len());
        for &c_in in in_channels {
            weights.push(glorot_var((c_in, out_channels), device)?);
            biases.push(
                Var::zeros(out_channels, DType::F32, device)
                    .map_err(|e| GraphAttentionError::Tensor(format!("bias var failed: {}", e)))?,
            );
        }

        Ok(Self {
            names: metadata.node_types().to_vec(),
            in_channels: in_channels.to_vec(),
            out_channels,
            weights,
            biases,
        })
    }

    fn check_slot(&self, slot: usize, x: &Tensor) -> Result<usize> {
        let (n, c) = x
            .dims2()
            .map_err(|e| GraphAttentionError::Tensor(format!("feature dims failed: {}", e)))?;
        if c != self.in_channels[slot] {
            return Err(GraphAttentionError::Config(format!(
                "node type '{}' has {} feature columns, expected {}",
                self.names[slot], c, self.in_channels[slot]
            )));
        }
        Ok(n)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.weights
            .iter()
            .chain(self.biases.iter())
            .cloned()
            .collect()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = Vec::with_capacity(self.names.len() * 2);
        for (i, name) in self.names.iter().enumerate() {
            params.push((format!("{}.{}.weight", prefix, name), self.weights[i].clone()));
            params.push((format!("{}.{}.bias", prefix, name), self.biases[i].clone()));
        }
        params
    }

    fn reset_parameters(&self) -> Result<()> {
        for (i, w) in self.weights.iter().enumerate() {
            let device = w.as_tensor().device().clone();
            w.set(&glorot((self.in_channels[i], self.out_channels), &device)?)
                .map_err(|e| GraphAttentionError::Tensor(format!("weight reset failed: {}", e)))?;
            let zeros = Tensor::zeros(self.out_channels, DType::F32, &device)
                .map_err(|e| GraphAttentionError::Tensor(format!("bias zeros failed: {}", e)))?;
            self.biases[i]
                .set(&zeros)
                .map_err(|e| GraphAttentionError::Tensor(format!("bias reset failed: {}", e)))?;
        }
        Ok(())
    }
}

// ============================================================================
// Sequential per-type strategy
// ============================================================================

/// Dense `x · W + b` per node type, one call per present type
#[derive(Debug)]
pub struct PerTypeLinear {
    params: TypeLinearParams,
}

impl PerTypeLinear {
    pub fn new(
        metadata: &Metadata,
        in_channels: &[usize],
        out_channels: usize,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            params: TypeLinearParams::new(metadata, in_channels, out_channels, device)?,
        })
    }
}

impl HeteroProjector for PerTypeLinear {
    fn project(&self, xs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        if xs.len() != self.params.names.len() {
            return Err(GraphAttentionError::Config(format!(
                "{} feature slots for {} node types",
                xs.len(),
                self.params.names.len()
            )));
        }

        let mut out = Vec::with_capacity(xs.len());
        for (i, slot) in xs.iter().enumerate() {
            let Some(x) = slot else {
                out.push(None);
                continue;
            };
            self.params.check_slot(i, x)?;
            let y = x
                .matmul(self.params.weights[i].as_tensor())
                .map_err(|e| GraphAttentionError::Tensor(format!("projection matmul failed: {}", e)))?
                .broadcast_add(self.params.biases[i].as_tensor())
                .map_err(|e| GraphAttentionError::Tensor(format!("projection bias failed: {}", e)))?;
            out.push(Some(y));
        }
        Ok(out)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.params.trainable_vars()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        self.params.named_parameters(prefix)
    }

    fn reset_parameters(&self) -> Result<()> {
        self.params.reset_parameters()
    }
}

// ============================================================================
// Grouped strategy
// ============================================================================

/// One segmented matmul over all present node types
///
/// Features and weights are zero-padded to the widest registered input; the
/// padded feature columns only ever meet padded (zero) weight rows, so the
/// result matches [`PerTypeLinear`] exactly while issuing a single batched
/// multiply.
#[derive(Debug)]
pub struct GroupedLinear {
    params: TypeLinearParams,
    max_in: usize,
}

impl GroupedLinear {
    pub fn new(
        metadata: &Metadata,
        in_channels: &[usize],
        out_channels: usize,
        device: &Device,
    ) -> Result<Self> {
        let max_in = in_channels.iter().copied().max().unwrap_or(0);
        Ok(Self {
            params: TypeLinearParams::new(metadata, in_channels, out_channels, device)?,
            max_in,
        })
    }

    fn pad_cols(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c) = x
            .dims2()
            .map_err(|e| GraphAttentionError::Tensor(format!("pad dims failed: {}", e)))?;
        if c == self.max_in {
            return Ok(x.clone());
        }
        let pad = Tensor::zeros((n, self.max_in - c), x.dtype(), x.device())
            .map_err(|e| GraphAttentionError::Tensor(format!("pad zeros failed: {}", e)))?;
        Tensor::cat(&[x, &pad], 1)
            .map_err(|e| GraphAttentionError::Tensor(format!("pad cat failed: {}", e)))
    }

    fn pad_weight(&self, w: &Tensor) -> Result<Tensor> {
        let (rows, cols) = w
            .dims2()
            .map_err(|e| GraphAttentionError::Tensor(format!("weight dims failed: {}", e)))?;
        if rows == self.max_in {
            return Ok(w.clone());
        }
        let pad = Tensor::zeros((self.max_in - rows, cols), w.dtype(), w.device())
            .map_err(|e| GraphAttentionError::Tensor(format!("weight pad zeros failed: {}", e)))?;
        Tensor::cat(&[w, &pad], 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("weight pad cat failed: {}", e)))
    }
}

impl HeteroProjector for GroupedLinear {
    fn project(&self, xs: &[Option<Tensor>]) -> Result<Vec<Option<Tensor>>> {
        if xs.len() != self.params.names.len() {
            return Err(GraphAttentionError::Config(format!(
                "{} feature slots for {} node types",
                xs.len(),
                self.params.names.len()
            )));
        }

        let mut present: Vec<(usize, usize)> = Vec::new(); // (slot, rows)
        let mut padded = Vec::new();
        let mut weights = Vec::new();
        let mut ptr = vec![0usize];
        let mut count = 0usize;
        for (i, slot) in xs.iter().enumerate() {
            let Some(x) = slot else { continue };
            let n = self.params.check_slot(i, x)?;
            padded.push(self.pad_cols(x)?);
            weights.push(self.pad_weight(self.params.weights[i].as_tensor())?);
            count += n;
            ptr.push(count);
            present.push((i, n));
        }

        let mut out = vec![None; xs.len()];
        if present.is_empty() {
            return Ok(out);
        }

        let input = Tensor::cat(&padded, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("grouped cat failed: {}", e)))?;
        let projected = segment_matmul(&input, &ptr, &weights)?;

        let mut row = 0usize;
        for &(i, n) in &present {
            let y = projected
                .narrow(0, row, n)
                .map_err(|e| GraphAttentionError::Tensor(format!("grouped narrow failed: {}", e)))?
                .broadcast_add(self.params.biases[i].as_tensor())
                .map_err(|e| GraphAttentionError::Tensor(format!("grouped bias failed: {}", e)))?;
            out[i] = Some(y);
            row += n;
        }
        Ok(out)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.params.trainable_vars()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        self.params.named_parameters(prefix)
    }

    fn reset_parameters(&self) -> Result<()> {
        self.params.reset_parameters()
    }
}
