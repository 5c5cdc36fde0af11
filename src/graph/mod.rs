//! Graph Connectivity
//!
//! Per-edge-type connectivity in dense coordinate form or destination-major
//! compressed sparse form, plus the offset bookkeeping that merges per-type
//! edge lists into one global attention pass.
//!
//! All indices are `u32`. Indices out of range relative to the per-type node
//! counts are undefined behavior: the layer does not validate or repair them,
//! and the backing index kernels may either error or attribute messages to
//! the wrong rows.

use candle_core::{Device, Tensor};

use crate::{GraphAttentionError, Result};

// ============================================================================
// Representations
// ============================================================================

/// Destination-major compressed sparse adjacency
///
/// `rowptr` has `num_dst + 1` monotone entries; the source nodes of all edges
/// into destination `d` are `col[rowptr[d]..rowptr[d + 1]]`.
#[derive(Debug, Clone)]
pub struct CsrAdjacency {
    rowptr: Tensor,
    col: Tensor,
    num_src: usize,
}

impl CsrAdjacency {
    /// Build from a `[num_dst + 1]` u32 row pointer and `[nnz]` u32 column
    /// (source) indices
    ///
    /// Fails when `rowptr` is empty, non-monotone, or does not end at the
    /// number of column entries.
    pub fn new(rowptr: Tensor, col: Tensor, num_src: usize) -> Result<Self> {
        let ptr = rowptr
            .to_vec1::<u32>()
            .map_err(|e| GraphAttentionError::Graph(format!("rowptr read failed: {}", e)))?;
        let nnz = col
            .dims1()
            .map_err(|e| GraphAttentionError::Graph(format!("col dims failed: {}", e)))?;

        if ptr.is_empty() {
            return Err(GraphAttentionError::Graph(
                "csr rowptr must have at least one entry".into(),
            ));
        }
        if ptr[0] != 0 {
            return Err(GraphAttentionError::Graph(format!(
                "csr rowptr must start at 0, got {}",
                ptr[0]
            )));
        }
        for w in ptr.windows(2) {
            if w[1] < w[0] {
                return Err(GraphAttentionError::Graph(format!(
                    "csr rowptr must be non-decreasing, got {} then {}",
                    w[0], w[1]
                )));
            }
        }
        if ptr[ptr.len() - 1] as usize != nnz {
            return Err(GraphAttentionError::Graph(format!(
                "csr rowptr ends at {} but col has {} entries",
                ptr[ptr.len() - 1],
                nnz
            )));
        }

        Ok(Self {
            rowptr,
            col,
            num_src,
        })
    }

    /// Number of destination rows
    pub fn num_dst(&self) -> Result<usize> {
        let n = self
            .rowptr
            .dims1()
            .map_err(|e| GraphAttentionError::Graph(format!("rowptr dims failed: {}", e)))?;
        Ok(n - 1)
    }

    /// Number of source columns
    pub fn num_src(&self) -> usize {
        self.num_src
    }

    /// Number of stored edges
    pub fn num_edges(&self) -> Result<usize> {
        self.col
            .dims1()
            .map_err(|e| GraphAttentionError::Graph(format!("col dims failed: {}", e)))
    }

    /// Row pointer tensor
    pub fn rowptr(&self) -> &Tensor {
        &self.rowptr
    }

    /// Column (source index) tensor
    pub fn col(&self) -> &Tensor {
        &self.col
    }
}

/// Edge list of one edge type, in that type's local 0-based numbering
#[derive(Debug, Clone)]
pub enum EdgeIndex {
    /// Dense coordinate pairs `[2, num_edges]` u32: row 0 holds source
    /// indices, row 1 destination indices
    Coo(Tensor),
    /// Destination-major compressed sparse adjacency
    Csr(CsrAdjacency),
}

impl EdgeIndex {
    /// Number of edges in either representation
    pub fn num_edges(&self) -> Result<usize> {
        match self {
            Self::Coo(t) => {
                let (two, e) = t.dims2().map_err(|e| {
                    GraphAttentionError::Graph(format!("coo dims failed: {}", e))
                })?;
                if two != 2 {
                    return Err(GraphAttentionError::Graph(format!(
                        "coo edge index must be [2, e], got [{}, {}]",
                        two, e
                    )));
                }
                Ok(e)
            }
            Self::Csr(csr) => csr.num_edges(),
        }
    }

    /// Local (source, destination) index vectors in coordinate form
    ///
    /// CSR input is expanded destination-major; COO input keeps its edge
    /// order. Both orders feed the same grouped softmax, so the choice of
    /// representation never changes the attention result.
    pub fn coo_vecs(&self) -> Result<(Vec<u32>, Vec<u32>)> {
        match self {
            Self::Coo(t) => {
                self.num_edges()?; // shape check
                let rows = t
                    .to_vec2::<u32>()
                    .map_err(|e| GraphAttentionError::Graph(format!("coo read failed: {}", e)))?;
                Ok((rows[0].clone(), rows[1].clone()))
            }
            Self::Csr(csr) => {
                let ptr = csr
                    .rowptr
                    .to_vec1::<u32>()
                    .map_err(|e| GraphAttentionError::Graph(format!("rowptr read failed: {}", e)))?;
                let col = csr
                    .col
                    .to_vec1::<u32>()
                    .map_err(|e| GraphAttentionError::Graph(format!("col read failed: {}", e)))?;

                let mut dst = Vec::with_capacity(col.len());
                for d in 0..ptr.len() - 1 {
                    for _ in ptr[d]..ptr[d + 1] {
                        dst.push(d as u32);
                    }
                }
                Ok((col, dst))
            }
        }
    }

    /// Materialize as a `[2, num_edges]` coordinate tensor
    pub fn to_coo(&self, device: &Device) -> Result<Tensor> {
        let (src, dst) = self.coo_vecs()?;
        let e = src.len();
        let mut data = src;
        data.extend_from_slice(&dst);
        Tensor::from_vec(data, (2, e), device)
            .map_err(|e| GraphAttentionError::Graph(format!("coo build failed: {}", e)))
    }

    /// Materialize as a destination-major compressed adjacency
    ///
    /// Stable counting sort by destination: edges of one destination keep
    /// their relative order.
    pub fn to_csr(&self, num_dst: usize, num_src: usize, device: &Device) -> Result<CsrAdjacency> {
        let (src, dst) = self.coo_vecs()?;

        let mut counts = vec![0u32; num_dst];
        for &d in &dst {
            if d as usize >= num_dst {
                return Err(GraphAttentionError::Graph(format!(
                    "destination index {} out of range for {} rows",
                    d, num_dst
                )));
            }
            counts[d as usize] += 1;
        }

        let mut rowptr = vec![0u32; num_dst + 1];
        for d in 0..num_dst {
            rowptr[d + 1] = rowptr[d] + counts[d];
        }

        let mut cursor: Vec<u32> = rowptr[..num_dst].to_vec();
        let mut col = vec![0u32; src.len()];
        for (s, d) in src.iter().zip(dst.iter()) {
            let slot = cursor[*d as usize];
            col[slot as usize] = *s;
            cursor[*d as usize] += 1;
        }

        let rowptr = Tensor::from_vec(rowptr, num_dst + 1, device)
            .map_err(|e| GraphAttentionError::Graph(format!("rowptr build failed: {}", e)))?;
        let col_len = col.len();
        let col = Tensor::from_vec(col, col_len, device)
            .map_err(|e| GraphAttentionError::Graph(format!("col build failed: {}", e)))?;
        CsrAdjacency::new(rowptr, col, num_src)
    }
}

// ============================================================================
// Edge Index Combiner
// ============================================================================

/// One edge type's local edge list together with its block offsets
#[derive(Debug, Clone)]
pub struct EdgeBlock {
    /// Local source indices, 0-based within the source type
    pub src: Vec<u32>,
    /// Local destination indices, 0-based within the destination type
    pub dst: Vec<u32>,
    /// Offset of this edge type's source block in the relation-major key space
    pub src_offset: usize,
    /// Offset of the destination type's slice in the global node space
    pub dst_offset: usize,
}

/// Merged edge lists across edge types, expressed in the shared index spaces
#[derive(Debug)]
pub struct CombinedEdges {
    /// `[total_edges]` u32 source indices into the relation-major key space
    pub src: Tensor,
    /// `[total_edges]` u32 destination indices into the global node space
    pub dst: Tensor,
    /// Per-block edge counts, in block order
    pub counts: Vec<usize>,
}

impl CombinedEdges {
    /// Total number of merged edges
    pub fn num_edges(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Offset every block's local indices into the shared spaces and concatenate
///
/// Adds `src_offset` to each block's source indices and `dst_offset` to its
/// destination indices, then concatenates all blocks in the given order.
/// Local indices themselves are not range-checked (see module docs).
pub fn combine_edge_indices(blocks: &[EdgeBlock], device: &Device) -> Result<CombinedEdges> {
    let total: usize = blocks.iter().map(|b| b.src.len()).sum();
    let mut src = Vec::with_capacity(total);
    let mut dst = Vec::with_capacity(total);
    let mut counts = Vec::with_capacity(blocks.len());

    for block in blocks {
        if block.src.len() != block.dst.len() {
            return Err(GraphAttentionError::Graph(format!(
                "edge block has {} sources but {} destinations",
                block.src.len(),
                block.dst.len()
            )));
        }
        let src_off = u32::try_from(block.src_offset).map_err(|_| {
            GraphAttentionError::Graph(format!("source offset {} overflows u32", block.src_offset))
        })?;
        let dst_off = u32::try_from(block.dst_offset).map_err(|_| {
            GraphAttentionError::Graph(format!(
                "destination offset {} overflows u32",
                block.dst_offset
            ))
        })?;
        src.extend(block.src.iter().map(|&i| i + src_off));
        dst.extend(block.dst.iter().map(|&i| i + dst_off));
        counts.push(block.src.len());
    }

    let src = Tensor::from_vec(src, total, device)
        .map_err(|e| GraphAttentionError::Graph(format!("combined src build failed: {}", e)))?;
    let dst = Tensor::from_vec(dst, total, device)
        .map_err(|e| GraphAttentionError::Graph(format!("combined dst build failed: {}", e)))?;

    Ok(CombinedEdges { src, dst, counts })
}
