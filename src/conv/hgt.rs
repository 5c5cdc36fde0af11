//! Heterogeneous Graph Transformer convolution
//!
//! Implements the HGT operator (Hu et al. 2020, <https://arxiv.org/abs/2003.01332>):
//! per-relation scaled dot-product attention over typed node features.
//!
//! ```text
//! score(e) = (Q[dst] · A_rel K[src]) / sqrt(d) * p_rel      per head
//! α(e)     = softmax over edges sharing dst                  per head
//! out[dst] = Σ α(e) · M_rel V[src]                           heads flattened
//! ```
//!
//! Every forward pass runs one batched projection over node types, one
//! segmented matmul over (relation, head) pairs, and one grouped softmax over
//! the combined edge list. Node types that receive no message report an
//! explicit `None`, never a zero tensor.

use std::collections::HashMap;
use std::fmt;

use candle_core::{Device, Tensor, Var, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::linear::{new_projector, HeteroProjector, ProjectorStrategy};
use crate::graph::{combine_edge_indices, EdgeBlock, EdgeIndex};
use crate::metadata::{EdgeTypeId, Metadata, NodeSlices, NodeTypeId};
use crate::primitives::{
    gelu, glorot, glorot_var, group_tensors, ones_var, scatter_softmax, scatter_sum,
    segment_matmul, sigmoid, GroupAggr,
};
use crate::{GraphAttentionError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Input feature widths, one per node type or shared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InChannels {
    /// Same input width for every node type
    Uniform(usize),
    /// Explicit width per node type label
    PerType(HashMap<String, usize>),
}

impl InChannels {
    /// Expand to one width per registered node type, in registry order
    pub fn resolve(&self, metadata: &Metadata) -> Result<Vec<usize>> {
        match self {
            Self::Uniform(c) => Ok(vec![*c; metadata.num_node_types()]),
            Self::PerType(map) => {
                for name in map.keys() {
                    metadata.node_type_id(name)?;
                }
                metadata
                    .node_types()
                    .iter()
                    .map(|name| {
                        map.get(name).copied().ok_or_else(|| {
                            GraphAttentionError::Config(format!(
                                "missing input width for node type '{}'",
                                name
                            ))
                        })
                    })
                    .collect()
            }
        }
    }
}

impl From<usize> for InChannels {
    fn from(c: usize) -> Self {
        Self::Uniform(c)
    }
}

impl From<HashMap<String, usize>> for InChannels {
    fn from(map: HashMap<String, usize>) -> Self {
        Self::PerType(map)
    }
}

/// Layer configuration
///
/// `heads` defaults to 1 and `group` to [`GroupAggr::Sum`], matching the
/// reference operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HgtConfig {
    pub in_channels: InChannels,
    pub out_channels: usize,
    pub heads: usize,
    pub group: GroupAggr,
}

impl HgtConfig {
    pub fn new(in_channels: impl Into<InChannels>, out_channels: usize) -> Self {
        Self {
            in_channels: in_channels.into(),
            out_channels,
            heads: 1,
            group: GroupAggr::Sum,
        }
    }

    /// Builder: set the number of attention heads
    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    /// Builder: set the relation-prior grouping reduction
    pub fn with_group(mut self, group: GroupAggr) -> Self {
        self.group = group;
        self
    }
}

// ============================================================================
// Relation parameter store
// ============================================================================

/// Per-relation attention/message transforms and priors, plus per-type skip
/// gates
///
/// `a_rel`/`m_rel` are `[heads, d, d]` Glorot-initialized; `p_rel` (`[heads]`)
/// and the scalar skip gates start at the neutral all-ones value. Indexed by
/// the registry's dense ids.
#[derive(Debug)]
pub struct RelationStore {
    a_rel: Vec<Var>,
    m_rel: Vec<Var>,
    p_rel: Vec<Var>,
    skip: Vec<Var>,
    edge_keys: Vec<String>,
    node_names: Vec<String>,
    heads: usize,
    head_dim: usize,
}

impl RelationStore {
    fn new(metadata: &Metadata, heads: usize, head_dim: usize, device: &Device) -> Result<Self> {
        let mut a_rel = Vec::with_capacity(metadata.num_edge_types());
        let mut m_rel = Vec::with_capacity(metadata.num_edge_types());
        let mut p_rel = Vec::with_capacity(metadata.num_edge_types());
        let mut edge_keys = Vec::with_capacity(metadata.num_edge_types());
        for et in metadata.edge_type_ids() {
            a_rel.push(glorot_var((heads, head_dim, head_dim), device)?);
            m_rel.push(glorot_var((heads, head_dim, head_dim), device)?);
            p_rel.push(ones_var(heads, device)?);
            edge_keys.push(metadata.edge_type_key(et));
        }

        let mut skip = Vec::with_capacity(metadata.num_node_types());
        for _ in 0..metadata.num_node_types() {
            skip.push(ones_var(1, device)?);
        }

        Ok(Self {
            a_rel,
            m_rel,
            p_rel,
            skip,
            edge_keys,
            node_names: metadata.node_types().to_vec(),
            heads,
            head_dim,
        })
    }

    /// Attention transform of an edge type, `[heads, d, d]`
    pub fn a_rel(&self, et: EdgeTypeId) -> &Var {
        &self.a_rel[et.index()]
    }

    /// Message transform of an edge type, `[heads, d, d]`
    pub fn m_rel(&self, et: EdgeTypeId) -> &Var {
        &self.m_rel[et.index()]
    }

    /// Per-head prior of an edge type, `[heads]`
    pub fn p_rel(&self, et: EdgeTypeId) -> &Var {
        &self.p_rel[et.index()]
    }

    /// Scalar skip gate of a node type, `[1]`
    pub fn skip(&self, nt: NodeTypeId) -> &Var {
        &self.skip[nt.index()]
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.a_rel
            .iter()
            .chain(self.m_rel.iter())
            .chain(self.p_rel.iter())
            .chain(self.skip.iter())
            .cloned()
            .collect()
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = Vec::with_capacity(self.edge_keys.len() * 3 + self.node_names.len());
        for (i, key) in self.edge_keys.iter().enumerate() {
            params.push((format!("a_rel.{}", key), self.a_rel[i].clone()));
            params.push((format!("m_rel.{}", key), self.m_rel[i].clone()));
            params.push((format!("p_rel.{}", key), self.p_rel[i].clone()));
        }
        for (i, name) in self.node_names.iter().enumerate() {
            params.push((format!("skip.{}", name), self.skip[i].clone()));
        }
        params
    }

    fn reset_parameters(&self) -> Result<()> {
        for i in 0..self.edge_keys.len() {
            let device = self.a_rel[i].as_tensor().device().clone();
            self.a_rel[i]
                .set(&glorot((self.heads, self.head_dim, self.head_dim), &device)?)
                .map_err(|e| GraphAttentionError::Tensor(format!("a_rel reset failed: {}", e)))?;
            self.m_rel[i]
                .set(&glorot((self.heads, self.head_dim, self.head_dim), &device)?)
                .map_err(|e| GraphAttentionError::Tensor(format!("m_rel reset failed: {}", e)))?;
            let ones = Tensor::ones(self.heads, candle_core::DType::F32, &device)
                .map_err(|e| GraphAttentionError::Tensor(format!("p_rel ones failed: {}", e)))?;
            self.p_rel[i]
                .set(&ones)
                .map_err(|e| GraphAttentionError::Tensor(format!("p_rel reset failed: {}", e)))?;
        }
        for gate in &self.skip {
            let device = gate.as_tensor().device().clone();
            let ones = Tensor::ones(1, candle_core::DType::F32, &device)
                .map_err(|e| GraphAttentionError::Tensor(format!("skip ones failed: {}", e)))?;
            gate.set(&ones)
                .map_err(|e| GraphAttentionError::Tensor(format!("skip reset failed: {}", e)))?;
        }
        Ok(())
    }
}

// ============================================================================
// The layer
// ============================================================================

/// Heterogeneous Graph Transformer convolution layer
///
/// Construct once from a [`Metadata`] registry and an [`HgtConfig`]; call
/// [`forward`](Self::forward) per batch. Parameters are read-only during
/// forward and are only mutated by the external optimizer between calls.
pub struct HgtConv {
    metadata: Metadata,
    in_channels: Vec<usize>,
    out_channels: usize,
    heads: usize,
    head_dim: usize,
    group: GroupAggr,
    k_lin: Box<dyn HeteroProjector>,
    q_lin: Box<dyn HeteroProjector>,
    v_lin: Box<dyn HeteroProjector>,
    a_lin: Box<dyn HeteroProjector>,
    rel: RelationStore,
    device: Device,
}

impl HgtConv {
    /// Build the layer with the default (grouped) projection strategy
    pub fn new(config: HgtConfig, metadata: Metadata, device: &Device) -> Result<Self> {
        Self::with_strategy(config, metadata, ProjectorStrategy::default(), device)
    }

    /// Build the layer with an explicit projection strategy
    ///
    /// All configuration checks run before any parameter is allocated:
    /// `out_channels` must be a positive multiple of `heads`, a per-type
    /// input map must cover every registered node type, and `Cat`/`Stack`
    /// prior grouping is rejected when a node type is the destination of
    /// more than one relation (no per-head scalar exists there).
    pub fn with_strategy(
        config: HgtConfig,
        metadata: Metadata,
        strategy: ProjectorStrategy,
        device: &Device,
    ) -> Result<Self> {
        if config.heads == 0 {
            return Err(GraphAttentionError::Config(
                "'heads' must be at least 1".into(),
            ));
        }
        if config.out_channels == 0 || !config.out_channels.is_multiple_of(config.heads) {
            return Err(GraphAttentionError::Config(format!(
                "'out_channels' (got {}) must be a positive multiple of the number of heads (got {})",
                config.out_channels, config.heads
            )));
        }
        if matches!(config.group, GroupAggr::Cat | GroupAggr::Stack) {
            for nt in metadata.node_type_ids() {
                let incoming = metadata.relations_into(nt);
                if incoming.len() > 1 {
                    return Err(GraphAttentionError::Config(format!(
                        "{:?} prior grouping needs a unique relation per destination, but node type '{}' receives {}",
                        config.group,
                        metadata.node_type_name(nt),
                        incoming.len()
                    )));
                }
            }
        }
        let in_channels = config.in_channels.resolve(&metadata)?;
        let head_dim = config.out_channels / config.heads;

        let k_lin = new_projector(strategy, &metadata, &in_channels, config.out_channels, device)?;
        let q_lin = new_projector(strategy, &metadata, &in_channels, config.out_channels, device)?;
        let v_lin = new_projector(strategy, &metadata, &in_channels, config.out_channels, device)?;
        let a_out = vec![config.out_channels; metadata.num_node_types()];
        let a_lin = new_projector(strategy, &metadata, &a_out, config.out_channels, device)?;

        let rel = RelationStore::new(&metadata, config.heads, head_dim, device)?;

        debug!(
            "HgtConv: {} node types, {} edge types, out_channels={}, heads={}",
            metadata.num_node_types(),
            metadata.num_edge_types(),
            config.out_channels,
            config.heads
        );

        Ok(Self {
            metadata,
            in_channels,
            out_channels: config.out_channels,
            heads: config.heads,
            head_dim,
            group: config.group,
            k_lin,
            q_lin,
            v_lin,
            a_lin,
            rel,
            device: device.clone(),
        })
    }

    /// The type registry this layer was built for
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Relation parameter store (transforms, priors, skip gates)
    pub fn relation_store(&self) -> &RelationStore {
        &self.rel
    }

    /// All trainable parameters
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.k_lin.trainable_vars();
        vars.extend(self.q_lin.trainable_vars());
        vars.extend(self.v_lin.trainable_vars());
        vars.extend(self.a_lin.trainable_vars());
        vars.extend(self.rel.trainable_vars());
        vars
    }

    /// `(name, parameter)` pairs for string-keyed optimizer lookup
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.k_lin.named_parameters("k_lin");
        params.extend(self.q_lin.named_parameters("q_lin"));
        params.extend(self.v_lin.named_parameters("v_lin"));
        params.extend(self.a_lin.named_parameters("a_lin"));
        params.extend(self.rel.named_parameters());
        params
    }

    /// Re-initialize every parameter in place
    pub fn reset_parameters(&self) -> Result<()> {
        self.k_lin.reset_parameters()?;
        self.q_lin.reset_parameters()?;
        self.v_lin.reset_parameters()?;
        self.a_lin.reset_parameters()?;
        self.rel.reset_parameters()
    }

    /// Effective per-head prior of an edge type
    ///
    /// Grouped combination of the `p_rel` of every registered relation
    /// sharing this edge type's destination — a parameter-space quantity,
    /// independent of which relations are present in a given call.
    fn relation_prior(&self, et: EdgeTypeId) -> Result<Tensor> {
        let dst = self.metadata.dst_of(et);
        let shared: Vec<Tensor> = self
            .metadata
            .relations_into(dst)
            .iter()
            .map(|t| self.rel.p_rel(*t).as_tensor().clone())
            .collect();
        let grouped = group_tensors(&shared, self.group)?.ok_or_else(|| {
            GraphAttentionError::Config(format!(
                "edge type '{}' has no registered relations into its destination",
                self.metadata.edge_type_key(et)
            ))
        })?;
        let flat = grouped
            .flatten_all()
            .map_err(|e| GraphAttentionError::Tensor(format!("prior flatten failed: {}", e)))?;
        let len = flat
            .dims1()
            .map_err(|e| GraphAttentionError::Tensor(format!("prior dims failed: {}", e)))?;
        if len != self.heads {
            return Err(GraphAttentionError::Config(format!(
                "grouped prior for '{}' has {} entries, expected one per head ({})",
                self.metadata.edge_type_key(et),
                len,
                self.heads
            )));
        }
        Ok(flat)
    }

    /// Compute updated embeddings for every node type
    ///
    /// `x_dict` maps node type labels to `[n, in_channels]` features;
    /// `edge_index_dict` maps edge type triples to local edge lists in
    /// either representation. Returns one entry per key of `x_dict`:
    /// `Some(tensor)` for types that received at least one message, `None`
    /// otherwise (a type with zero feature rows always reports `None`).
    ///
    /// Edge indices out of range for their type's node count are undefined
    /// behavior and are not validated here.
    pub fn forward(
        &self,
        x_dict: &HashMap<String, Tensor>,
        edge_index_dict: &HashMap<(String, String, String), EdgeIndex>,
    ) -> Result<HashMap<String, Option<Tensor>>> {
        let num_types = self.metadata.num_node_types();
        let h = self.heads;
        let d = self.head_dim;

        // Resolve features into registry-ordered slots. Unknown labels are
        // fatal; zero-row tensors count as absent.
        let mut xs: Vec<Option<Tensor>> = vec![None; num_types];
        for (name, x) in x_dict {
            let id = self.metadata.node_type_id(name)?;
            let (n, c) = x
                .dims2()
                .map_err(|e| GraphAttentionError::Tensor(format!("feature dims failed: {}", e)))?;
            if c != self.in_channels[id.index()] {
                return Err(GraphAttentionError::Config(format!(
                    "node type '{}' has {} feature columns, expected {}",
                    name,
                    c,
                    self.in_channels[id.index()]
                )));
            }
            if n == 0 {
                continue;
            }
            xs[id.index()] = Some(x.clone());
        }

        // Every edge key must resolve, present or not in the registry order walk below
        for key in edge_index_dict.keys() {
            self.metadata.edge_type_id(&key.0, &key.1, &key.2)?;
        }

        // K/Q/V per node type, viewed [n, heads, d]
        let k_dict = split_heads(self.k_lin.project(&xs)?, h, d)?;
        let q_dict = split_heads(self.q_lin.project(&xs)?, h, d)?;
        let v_dict = split_heads(self.v_lin.project(&xs)?, h, d)?;

        // Edge types taking part in this call, in registry order. Relations
        // without edges contribute nothing; relations with edges need
        // features on both endpoints.
        let mut kept: Vec<(EdgeTypeId, &EdgeIndex)> = Vec::new();
        for et in self.metadata.edge_type_ids() {
            let triple = &self.metadata.edge_types()[et.index()];
            let Some(index) = edge_index_dict.get(triple) else {
                continue;
            };
            if index.num_edges()? == 0 {
                continue;
            }
            let src = self.metadata.src_of(et);
            let dst = self.metadata.dst_of(et);
            if xs[src.index()].is_none() || xs[dst.index()].is_none() {
                let missing = if xs[src.index()].is_none() { src } else { dst };
                return Err(GraphAttentionError::Graph(format!(
                    "edge type {:?} has edges but node type '{}' has no features",
                    triple,
                    self.metadata.node_type_name(missing)
                )));
            }
            kept.push((et, index));
        }

        if kept.is_empty() {
            let mut out = HashMap::with_capacity(x_dict.len());
            for name in x_dict.keys() {
                out.insert(name.clone(), None);
            }
            return Ok(out);
        }

        // Relation-major K/V: one segmented matmul per tensor with one
        // segment per (edge type, head) pair. Rows go head-major per block so
        // each segment holds exactly one head of one source type.
        let mut k_ins = Vec::with_capacity(kept.len());
        let mut v_ins = Vec::with_capacity(kept.len());
        let mut a_weights = Vec::with_capacity(kept.len() * h);
        let mut m_weights = Vec::with_capacity(kept.len() * h);
        let mut ptr = vec![0usize];
        let mut count = 0usize;
        let mut block_rows = Vec::with_capacity(kept.len());
        let mut key_offsets = Vec::with_capacity(kept.len());
        let mut key_rows = 0usize;
        for (et, _) in &kept {
            let src = self.metadata.src_of(*et);
            let k_src = typed_slot(&k_dict, src.index())?;
            let v_src = typed_slot(&v_dict, src.index())?;
            let n_src = k_src.dims()[0];

            k_ins.push(head_major(k_src, h, n_src, d)?);
            v_ins.push(head_major(v_src, h, n_src, d)?);
            for head in 0..h {
                count += n_src;
                ptr.push(count);
                a_weights.push(rel_head(self.rel.a_rel(*et), head)?);
                m_weights.push(rel_head(self.rel.m_rel(*et), head)?);
            }
            block_rows.push(n_src);
            key_offsets.push(key_rows);
            key_rows += n_src;
        }

        let k_cat = Tensor::cat(&k_ins, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("k cat failed: {}", e)))?;
        let v_cat = Tensor::cat(&v_ins, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("v cat failed: {}", e)))?;
        let k_flat = segment_matmul(&k_cat, &ptr, &a_weights)?;
        let v_flat = segment_matmul(&v_cat, &ptr, &m_weights)?;
        let k_out = node_major_blocks(&k_flat, &block_rows, h, d)?;
        let v_out = node_major_blocks(&v_flat, &block_rows, h, d)?;

        // Query/output space: node types concatenated in registry order
        let counts: Vec<usize> = (0..num_types)
            .map(|i| xs[i].as_ref().map(|t| t.dims()[0]).unwrap_or(0))
            .collect();
        let slices = NodeSlices::from_counts(&counts);
        let q_parts: Vec<Tensor> = q_dict.iter().flatten().cloned().collect();
        let q_all = Tensor::cat(&q_parts, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("q cat failed: {}", e)))?;

        // Merge edge lists into the shared index spaces, with the per-edge
        // relation prior aligned to the same order
        let mut blocks = Vec::with_capacity(kept.len());
        let mut prior_parts = Vec::with_capacity(kept.len());
        for (i, (et, index)) in kept.iter().enumerate() {
            let (src_vec, dst_vec) = index.coo_vecs()?;
            let n_edges = src_vec.len();
            blocks.push(EdgeBlock {
                src: src_vec,
                dst: dst_vec,
                src_offset: key_offsets[i],
                dst_offset: slices.start(self.metadata.dst_of(*et)),
            });
            let p = self.relation_prior(*et)?;
            let p_block = p
                .unsqueeze(0)
                .map_err(|e| GraphAttentionError::Tensor(format!("prior unsqueeze failed: {}", e)))?
                .expand((n_edges, h))
                .map_err(|e| GraphAttentionError::Tensor(format!("prior expand failed: {}", e)))?
                .contiguous()
                .map_err(|e| GraphAttentionError::Tensor(format!("prior contiguous failed: {}", e)))?;
            prior_parts.push(p_block);
        }
        let combined = combine_edge_indices(&blocks, &self.device)?;
        let prior = Tensor::cat(&prior_parts, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("prior cat failed: {}", e)))?;

        debug!(
            "HGT forward: {} nodes, {} edges across {} relations",
            slices.total(),
            combined.num_edges(),
            kept.len()
        );

        // Attention scores, normalized per (destination node, head)
        let q_i = q_all
            .index_select(&combined.dst, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("q gather failed: {}", e)))?;
        let k_j = k_out
            .index_select(&combined.src, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("k gather failed: {}", e)))?;
        let v_j = v_out
            .index_select(&combined.src, 0)
            .map_err(|e| GraphAttentionError::Tensor(format!("v gather failed: {}", e)))?;

        let score = q_i
            .mul(&k_j)
            .map_err(|e| GraphAttentionError::Tensor(format!("score mul failed: {}", e)))?
            .sum(D::Minus1)
            .map_err(|e| GraphAttentionError::Tensor(format!("score sum failed: {}", e)))?
            .affine(1.0 / (d as f64).sqrt(), 0.0)
            .map_err(|e| GraphAttentionError::Tensor(format!("score scale failed: {}", e)))?
            .mul(&prior)
            .map_err(|e| GraphAttentionError::Tensor(format!("score prior failed: {}", e)))?;

        let att = scatter_softmax(&score, &combined.dst, slices.total())?;
        let att3 = att
            .unsqueeze(2)
            .map_err(|e| GraphAttentionError::Tensor(format!("att unsqueeze failed: {}", e)))?;
        let weighted = v_j
            .broadcast_mul(&att3)
            .map_err(|e| GraphAttentionError::Tensor(format!("message weight failed: {}", e)))?;
        let agg = scatter_sum(&weighted, &combined.dst, slices.total())?
            .reshape((slices.total(), self.out_channels))
            .map_err(|e| GraphAttentionError::Tensor(format!("agg reshape failed: {}", e)))?;

        // Compose per-type outputs: gelu → a_lin → skip blend
        let mut messaged = vec![false; num_types];
        for (et, _) in &kept {
            messaged[self.metadata.dst_of(*et).index()] = true;
        }

        let mut agg_slots: Vec<Option<Tensor>> = vec![None; num_types];
        for id in self.metadata.node_type_ids() {
            if !messaged[id.index()] {
                continue;
            }
            let slice = agg
                .narrow(0, slices.start(id), slices.count(id))
                .map_err(|e| GraphAttentionError::Tensor(format!("agg narrow failed: {}", e)))?;
            agg_slots[id.index()] = Some(gelu(&slice)?);
        }
        let transformed = self.a_lin.project(&agg_slots)?;

        let mut out = HashMap::with_capacity(x_dict.len());
        for name in x_dict.keys() {
            let id = self.metadata.node_type_id(name)?;
            let i = id.index();
            let value = match &transformed[i] {
                None => None,
                Some(t) => {
                    if self.out_channels == self.in_channels[i] {
                        let x = typed_slot(&xs, i)?;
                        let gate = sigmoid(self.rel.skip(id).as_tensor())?;
                        let ones = Tensor::ones_like(&gate).map_err(|e| {
                            GraphAttentionError::Tensor(format!("gate ones failed: {}", e))
                        })?;
                        let inv = (&ones - &gate).map_err(|e| {
                            GraphAttentionError::Tensor(format!("gate inv failed: {}", e))
                        })?;
                        let blended = t
                            .broadcast_mul(&gate)
                            .map_err(|e| {
                                GraphAttentionError::Tensor(format!("gate mul failed: {}", e))
                            })?
                            .add(&x.broadcast_mul(&inv).map_err(|e| {
                                GraphAttentionError::Tensor(format!("skip mul failed: {}", e))
                            })?)
                            .map_err(|e| {
                                GraphAttentionError::Tensor(format!("skip add failed: {}", e))
                            })?;
                        Some(blended)
                    } else {
                        Some(t.clone())
                    }
                }
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

impl fmt::Display for HgtConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HgtConv({}, heads={})", self.out_channels, self.heads)
    }
}

// ============================================================================
// Forward helpers
// ============================================================================

/// View each present `[n, heads * d]` slot as `[n, heads, d]`
fn split_heads(slots: Vec<Option<Tensor>>, h: usize, d: usize) -> Result<Vec<Option<Tensor>>> {
    slots
        .into_iter()
        .map(|slot| match slot {
            None => Ok(None),
            Some(t) => {
                let n = t.dims()[0];
                t.reshape((n, h, d))
                    .map(Some)
                    .map_err(|e| GraphAttentionError::Tensor(format!("head split failed: {}", e)))
            }
        })
        .collect()
}

/// Fetch a slot that earlier validation guaranteed to be present
fn typed_slot(slots: &[Option<Tensor>], index: usize) -> Result<&Tensor> {
    slots[index].as_ref().ok_or_else(|| {
        GraphAttentionError::Graph(format!("feature slot {} unexpectedly empty", index))
    })
}

/// `[n, h, d]` → head-major `[h * n, d]`
fn head_major(t: &Tensor, h: usize, n: usize, d: usize) -> Result<Tensor> {
    t.transpose(0, 1)
        .map_err(|e| GraphAttentionError::Tensor(format!("head transpose failed: {}", e)))?
        .contiguous()
        .map_err(|e| GraphAttentionError::Tensor(format!("head contiguous failed: {}", e)))?
        .reshape((h * n, d))
        .map_err(|e| GraphAttentionError::Tensor(format!("head reshape failed: {}", e)))
}

/// Head `h` of a `[heads, d, d]` relation transform
fn rel_head(var: &Var, head: usize) -> Result<Tensor> {
    var.as_tensor()
        .get(head)
        .map_err(|e| GraphAttentionError::Tensor(format!("relation head failed: {}", e)))
}

/// Undo [`head_major`] per block and concatenate node-major
///
/// The flat tensor holds one `[h * n, d]` block per edge type; each comes
/// back as `[n, h, d]` and the blocks stack into the relation-major key
/// space.
fn node_major_blocks(flat: &Tensor, block_rows: &[usize], h: usize, d: usize) -> Result<Tensor> {
    let mut parts = Vec::with_capacity(block_rows.len());
    let mut row = 0usize;
    for &n in block_rows {
        let block = flat
            .narrow(0, row, h * n)
            .map_err(|e| GraphAttentionError::Tensor(format!("block narrow failed: {}", e)))?
            .reshape((h, n, d))
            .map_err(|e| GraphAttentionError::Tensor(format!("block reshape failed: {}", e)))?
            .transpose(0, 1)
            .map_err(|e| GraphAttentionError::Tensor(format!("block transpose failed: {}", e)))?
            .contiguous()
            .map_err(|e| GraphAttentionError::Tensor(format!("block contiguous failed: {}", e)))?;
        parts.push(block);
        row += h * n;
    }
    Tensor::cat(&parts, 0)
        .map_err(|e| GraphAttentionError::Tensor(format!("block cat failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    fn tensor2(vals: &[f32], rows: usize, cols: usize) -> Tensor {
        Tensor::from_vec(vals.to_vec(), (rows, cols), &device()).unwrap()
    }

    fn coo(src: &[u32], dst: &[u32]) -> EdgeIndex {
        let e = src.len();
        let mut data = src.to_vec();
        data.extend_from_slice(dst);
        EdgeIndex::Coo(Tensor::from_vec(data, (2, e), &device()).unwrap())
    }

    fn triple(s: &str, r: &str, d: &str) -> (String, String, String) {
        (s.to_string(), r.to_string(), d.to_string())
    }

    /// Deterministic, name-keyed parameter values. Layers built with permuted
    /// metadata get identical values for identically named parameters.
    fn fill_deterministic(conv: &HgtConv) {
        for (name, var) in conv.named_parameters() {
            let dims = var.as_tensor().dims().to_vec();
            let n = var.as_tensor().elem_count();
            let seed = name
                .bytes()
                .fold(17u32, |a, b| a.wrapping_mul(31).wrapping_add(b as u32));
            let vals: Vec<f32> = (0..n)
                .map(|i| {
                    let x = seed.wrapping_add(i as u32).wrapping_mul(2_654_435_761) >> 16;
                    ((x % 1000) as f32) / 1000.0 - 0.5
                })
                .collect();
            var.set(&Tensor::from_vec(vals, dims, &device()).unwrap()).unwrap();
        }
    }

    fn assert_rows_close(t: &Tensor, expected: &[Vec<f32>], tol: f32) {
        let vals = t.to_vec2::<f32>().unwrap();
        assert_eq!(vals.len(), expected.len(), "row count mismatch");
        for (r, (got, want)) in vals.iter().zip(expected.iter()).enumerate() {
            assert_eq!(got.len(), want.len(), "col count mismatch in row {}", r);
            for (c, (g, w)) in got.iter().zip(want.iter()).enumerate() {
                assert!(
                    (g - w).abs() < tol,
                    "mismatch at [{}][{}]: got {}, want {}",
                    r,
                    c,
                    g,
                    w
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Scalar reference implementation (f32 loops, no batching)
    // ------------------------------------------------------------------

    type Mat = Vec<Vec<f32>>;
    type ParamMap = HashMap<String, (Vec<usize>, Vec<f32>)>;

    fn read_params(conv: &HgtConv) -> ParamMap {
        conv.named_parameters()
            .into_iter()
            .map(|(name, var)| {
                let dims = var.as_tensor().dims().to_vec();
                let vals = var
                    .as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap();
                (name, (dims, vals))
            })
            .collect()
    }

    fn ref_linear(x: &Mat, w: &(Vec<usize>, Vec<f32>), b: &(Vec<usize>, Vec<f32>)) -> Mat {
        let (in_c, out_c) = (w.0[0], w.0[1]);
        x.iter()
            .map(|row| {
                (0..out_c)
                    .map(|j| {
                        let mut s = b.1[j];
                        for i in 0..in_c {
                            s += row[i] * w.1[i * out_c + j];
                        }
                        s
                    })
                    .collect()
            })
            .collect()
    }

    fn ref_gelu(x: f32) -> f32 {
        x / (1.0 + (-1.702 * x).exp())
    }

    fn ref_sigmoid(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Loop-based forward with identical parameters: the gold standard the
    /// batched engine must reproduce.
    fn naive_forward(
        conv: &HgtConv,
        x: &HashMap<String, Mat>,
        edges: &[((String, String, String), Vec<(usize, usize)>)],
    ) -> HashMap<String, Option<Mat>> {
        let params = read_params(conv);
        let p = |name: String| params[&name].clone();
        let meta = conv.metadata();
        let h = conv.heads();
        let dd = conv.out_channels() / h;
        let out_c = conv.out_channels();

        let mut kqv: HashMap<String, (Mat, Mat, Mat)> = HashMap::new();
        for (name, feat) in x {
            if feat.is_empty() {
                continue;
            }
            let k = ref_linear(feat, &p(format!("k_lin.{}.weight", name)), &p(format!("k_lin.{}.bias", name)));
            let q = ref_linear(feat, &p(format!("q_lin.{}.weight", name)), &p(format!("q_lin.{}.bias", name)));
            let v = ref_linear(feat, &p(format!("v_lin.{}.weight", name)), &p(format!("v_lin.{}.bias", name)));
            kqv.insert(name.clone(), (k, q, v));
        }

        // Sum-grouped prior over all registered relations into the destination
        let prior = |dst: &str| -> Vec<f32> {
            let mut acc = vec![0.0f32; h];
            for (s, r, d) in meta.edge_types() {
                if d == dst {
                    let (_, pv) = p(format!("p_rel.{}__{}__{}", s, r, d));
                    for c in 0..h {
                        acc[c] += pv[c];
                    }
                }
            }
            acc
        };

        // Per-destination inbox of (score per head, message per head)
        type Inbox = HashMap<(String, usize), Vec<(Vec<f32>, Vec<Vec<f32>>)>>;
        let mut inbox: Inbox = HashMap::new();
        for ((s_ty, r, d_ty), list) in edges {
            if list.is_empty() {
                continue;
            }
            let (_, av) = p(format!("a_rel.{}__{}__{}", s_ty, r, d_ty));
            let (_, mv) = p(format!("m_rel.{}__{}__{}", s_ty, r, d_ty));
            let pr = prior(d_ty);
            let (k_src, _, v_src) = &kqv[s_ty];
            let (_, q_dst, _) = &kqv[d_ty];

            for &(s, t) in list {
                let mut score = vec![0.0f32; h];
                let mut msg = vec![vec![0.0f32; dd]; h];
                for head in 0..h {
                    let mut kt = vec![0.0f32; dd];
                    let mut vt = vec![0.0f32; dd];
                    for j in 0..dd {
                        for i in 0..dd {
                            kt[j] += k_src[s][head * dd + i] * av[head * dd * dd + i * dd + j];
                            vt[j] += v_src[s][head * dd + i] * mv[head * dd * dd + i * dd + j];
                        }
                    }
                    let mut dot = 0.0f32;
                    for j in 0..dd {
                        dot += q_dst[t][head * dd + j] * kt[j];
                    }
                    score[head] = dot / (dd as f32).sqrt() * pr[head];
                    msg[head] = vt;
                }
                inbox
                    .entry((d_ty.clone(), t))
                    .or_default()
                    .push((score, msg));
            }
        }

        // Softmax per (destination node, head), then weighted sum
        let mut agg: HashMap<String, Mat> = HashMap::new();
        for ((ty, node), items) in &inbox {
            let rows = x[ty].len();
            let slot = agg
                .entry(ty.clone())
                .or_insert_with(|| vec![vec![0.0f32; out_c]; rows]);
            for head in 0..h {
                let m = items
                    .iter()
                    .map(|it| it.0[head])
                    .fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = items.iter().map(|it| (it.0[head] - m).exp()).collect();
                let z: f32 = exps.iter().sum();
                for (it, e) in items.iter().zip(exps.iter()) {
                    for j in 0..dd {
                        slot[*node][head * dd + j] += e / z * it.1[head][j];
                    }
                }
            }
        }

        // Compose
        let mut out = HashMap::new();
        for (name, feat) in x {
            let Some(slot) = agg.get(name) else {
                out.insert(name.clone(), None);
                continue;
            };
            let activated: Mat = slot
                .iter()
                .map(|row| row.iter().map(|&v| ref_gelu(v)).collect())
                .collect();
            let transformed = ref_linear(
                &activated,
                &p(format!("a_lin.{}.weight", name)),
                &p(format!("a_lin.{}.bias", name)),
            );
            let in_c = feat[0].len();
            let final_rows = if out_c == in_c {
                let (_, sv) = p(format!("skip.{}", name));
                let gate = ref_sigmoid(sv[0]);
                transformed
                    .iter()
                    .zip(feat.iter())
                    .map(|(t_row, x_row)| {
                        t_row
                            .iter()
                            .zip(x_row.iter())
                            .map(|(t, x)| gate * t + (1.0 - gate) * x)
                            .collect()
                    })
                    .collect()
            } else {
                transformed
            };
            out.insert(name.clone(), Some(final_rows));
        }
        out
    }

    fn mat(rows: usize, cols: usize, scale: f32) -> Mat {
        (0..rows)
            .map(|r| {
                (0..cols)
                    .map(|c| ((r * cols + c) as f32) * scale - 0.4)
                    .collect()
            })
            .collect()
    }

    fn to_tensor(m: &Mat) -> Tensor {
        let rows = m.len();
        let cols = m[0].len();
        let flat: Vec<f32> = m.iter().flatten().copied().collect();
        tensor2(&flat, rows, cols)
    }

    // ------------------------------------------------------------------
    // End-to-end behavior
    // ------------------------------------------------------------------

    #[test]
    fn test_two_type_scenario_shapes_and_aggregation() {
        // A: 3 nodes dim 4, B: 2 nodes dim 4, edges A→B: (0,0), (1,0), (2,1)
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "rel", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4), meta, &device()).unwrap();
        fill_deterministic(&conv);

        let x_a = mat(3, 4, 0.2);
        let x_b = mat(2, 4, 0.3);
        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&x_a));
        x_dict.insert("b".to_string(), to_tensor(&x_b));

        let mut edges = HashMap::new();
        edges.insert(triple("a", "rel", "b"), coo(&[0, 1, 2], &[0, 0, 1]));

        let out = conv.forward(&x_dict, &edges).unwrap();

        // A receives nothing and must be an explicit None
        assert!(out["a"].is_none());
        let b = out["b"].as_ref().unwrap();
        assert_eq!(b.dims(), &[2, 4]);

        // Row 0 mixes A0/A1 by softmax, row 1 is the singleton message
        // (weight exactly 1) — the scalar reference computes both.
        let mut x_ref = HashMap::new();
        x_ref.insert("a".to_string(), x_a);
        x_ref.insert("b".to_string(), x_b);
        let expected = naive_forward(
            &conv,
            &x_ref,
            &[(triple("a", "rel", "b"), vec![(0, 0), (1, 0), (2, 1)])],
        );
        assert!(expected["a"].is_none());
        assert_rows_close(b, expected["b"].as_ref().unwrap(), 1e-4);
    }

    #[test]
    fn test_matches_naive_reference_multi_head() {
        let meta = Metadata::new(
            vec!["author", "paper", "venue"],
            vec![
                ("author", "writes", "paper"),
                ("paper", "cites", "paper"),
                ("paper", "published_in", "venue"),
            ],
        )
        .unwrap();
        let mut widths = HashMap::new();
        widths.insert("author".to_string(), 4usize);
        widths.insert("paper".to_string(), 6usize);
        widths.insert("venue".to_string(), 4usize);
        let config = HgtConfig::new(widths, 8).with_heads(2);
        let conv = HgtConv::new(config, meta, &device()).unwrap();
        fill_deterministic(&conv);

        let x_author = mat(3, 4, 0.15);
        let x_paper = mat(4, 6, 0.1);
        let x_venue = mat(2, 4, 0.25);
        let mut x_dict = HashMap::new();
        x_dict.insert("author".to_string(), to_tensor(&x_author));
        x_dict.insert("paper".to_string(), to_tensor(&x_paper));
        x_dict.insert("venue".to_string(), to_tensor(&x_venue));

        let writes = vec![(0usize, 0usize), (0, 1), (1, 2), (2, 3), (2, 0)];
        let cites = vec![(1usize, 0usize), (2, 0), (3, 1), (0, 2)];
        let published = vec![(0usize, 0usize), (1, 0), (2, 1), (3, 1)];

        let mut edges = HashMap::new();
        edges.insert(
            triple("author", "writes", "paper"),
            coo(&[0, 0, 1, 2, 2], &[0, 1, 2, 3, 0]),
        );
        edges.insert(triple("paper", "cites", "paper"), coo(&[1, 2, 3, 0], &[0, 0, 1, 2]));
        edges.insert(
            triple("paper", "published_in", "venue"),
            coo(&[0, 1, 2, 3], &[0, 0, 1, 1]),
        );

        let out = conv.forward(&x_dict, &edges).unwrap();

        let mut x_ref = HashMap::new();
        x_ref.insert("author".to_string(), x_author);
        x_ref.insert("paper".to_string(), x_paper);
        x_ref.insert("venue".to_string(), x_venue);
        let expected = naive_forward(
            &conv,
            &x_ref,
            &[
                (triple("author", "writes", "paper"), writes),
                (triple("paper", "cites", "paper"), cites),
                (triple("paper", "published_in", "venue"), published),
            ],
        );

        // author has no incoming relation at all
        assert!(out["author"].is_none());
        assert!(expected["author"].is_none());
        // both input widths differ from out_channels, so no skip blending
        assert_rows_close(
            out["paper"].as_ref().unwrap(),
            expected["paper"].as_ref().unwrap(),
            1e-3,
        );
        assert_rows_close(
            out["venue"].as_ref().unwrap(),
            expected["venue"].as_ref().unwrap(),
            1e-3,
        );
    }

    #[test]
    fn test_projector_strategies_agree_end_to_end() {
        let make = |strategy| {
            let meta = Metadata::new(
                vec!["a", "b"],
                vec![("a", "to", "b"), ("b", "back", "a")],
            )
            .unwrap();
            let mut widths = HashMap::new();
            widths.insert("a".to_string(), 3usize);
            widths.insert("b".to_string(), 5usize);
            let conv = HgtConv::with_strategy(
                HgtConfig::new(widths, 4).with_heads(2),
                meta,
                strategy,
                &device(),
            )
            .unwrap();
            fill_deterministic(&conv);
            conv
        };
        let grouped = make(ProjectorStrategy::Grouped);
        let per_type = make(ProjectorStrategy::PerType);

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(3, 3, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 5, 0.1)));
        let mut edges = HashMap::new();
        edges.insert(triple("a", "to", "b"), coo(&[0, 1, 2], &[0, 1, 1]));
        edges.insert(triple("b", "back", "a"), coo(&[0, 1], &[2, 0]));

        let out_g = grouped.forward(&x_dict, &edges).unwrap();
        let out_p = per_type.forward(&x_dict, &edges).unwrap();
        for key in ["a", "b"] {
            let g = out_g[key].as_ref().unwrap().to_vec2::<f32>().unwrap();
            let p = out_p[key].as_ref().unwrap().to_vec2::<f32>().unwrap();
            assert_eq!(g.len(), p.len());
            for (gr, pr) in g.iter().zip(p.iter()) {
                for (a, b) in gr.iter().zip(pr.iter()) {
                    assert!((a - b).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_edge_type_order_does_not_change_output() {
        let build = |edge_order: Vec<(&str, &str, &str)>| {
            let meta = Metadata::new(vec!["a", "b"], edge_order).unwrap();
            let conv =
                HgtConv::new(HgtConfig::new(4, 4).with_heads(2), meta, &device()).unwrap();
            fill_deterministic(&conv);
            conv
        };
        // Same schema, permuted registration order; parameters are keyed by
        // name, so both layers hold identical values.
        let conv1 = build(vec![("a", "to", "b"), ("a", "also", "b"), ("b", "back", "a")]);
        let conv2 = build(vec![("b", "back", "a"), ("a", "also", "b"), ("a", "to", "b")]);

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(3, 4, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 4, 0.3)));
        let mut edges = HashMap::new();
        edges.insert(triple("a", "to", "b"), coo(&[0, 1], &[0, 1]));
        edges.insert(triple("a", "also", "b"), coo(&[2, 0], &[0, 0]));
        edges.insert(triple("b", "back", "a"), coo(&[0, 1], &[1, 2]));

        let out1 = conv1.forward(&x_dict, &edges).unwrap();
        let out2 = conv2.forward(&x_dict, &edges).unwrap();
        for key in ["a", "b"] {
            let a = out1[key].as_ref().unwrap().to_vec2::<f32>().unwrap();
            let b = out2[key].as_ref().unwrap().to_vec2::<f32>().unwrap();
            for (ar, br) in a.iter().zip(b.iter()) {
                for (x, y) in ar.iter().zip(br.iter()) {
                    assert!((x - y).abs() < 1e-4, "order dependence: {} vs {}", x, y);
                }
            }
        }
    }

    #[test]
    fn test_csr_and_coo_agree() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4).with_heads(2), meta, &device()).unwrap();
        fill_deterministic(&conv);

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(3, 4, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 4, 0.3)));

        let dense = coo(&[0, 1, 2, 0], &[1, 0, 1, 0]);
        let sparse = EdgeIndex::Csr(dense.to_csr(2, 3, &device()).unwrap());

        let mut edges_coo = HashMap::new();
        edges_coo.insert(triple("a", "to", "b"), dense);
        let mut edges_csr = HashMap::new();
        edges_csr.insert(triple("a", "to", "b"), sparse);

        let out_coo = conv.forward(&x_dict, &edges_coo).unwrap();
        let out_csr = conv.forward(&x_dict, &edges_csr).unwrap();

        let a = out_coo["b"].as_ref().unwrap().to_vec2::<f32>().unwrap();
        let b = out_csr["b"].as_ref().unwrap().to_vec2::<f32>().unwrap();
        for (ar, br) in a.iter().zip(b.iter()) {
            for (x, y) in ar.iter().zip(br.iter()) {
                assert!((x - y).abs() < 1e-5, "representations diverge: {} vs {}", x, y);
            }
        }
    }

    #[test]
    fn test_skip_gate_inactive_when_widths_differ() {
        // in_channels 3 != out_channels 4: the gate must have no effect
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(3, 4), meta, &device()).unwrap();
        fill_deterministic(&conv);

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(2, 3, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 3, 0.3)));
        let mut edges = HashMap::new();
        edges.insert(triple("a", "to", "b"), coo(&[0, 1], &[0, 1]));

        let first = conv.forward(&x_dict, &edges).unwrap();
        let skip = conv
            .named_parameters()
            .into_iter()
            .find(|(n, _)| n == "skip.b")
            .unwrap()
            .1;
        skip.set(&Tensor::from_vec(vec![-5.0f32], 1, &device()).unwrap())
            .unwrap();
        let second = conv.forward(&x_dict, &edges).unwrap();

        let a = first["b"].as_ref().unwrap().to_vec2::<f32>().unwrap();
        let b = second["b"].as_ref().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b, "skip gate leaked into a non-matching-width output");
    }

    #[test]
    fn test_skip_gate_active_when_widths_match() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4), meta, &device()).unwrap();
        fill_deterministic(&conv);

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(2, 4, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 4, 0.3)));
        let mut edges = HashMap::new();
        edges.insert(triple("a", "to", "b"), coo(&[0, 1], &[0, 1]));

        let first = conv.forward(&x_dict, &edges).unwrap();
        let skip = conv
            .named_parameters()
            .into_iter()
            .find(|(n, _)| n == "skip.b")
            .unwrap()
            .1;
        skip.set(&Tensor::from_vec(vec![-5.0f32], 1, &device()).unwrap())
            .unwrap();
        let second = conv.forward(&x_dict, &edges).unwrap();

        let a = first["b"].as_ref().unwrap().to_vec2::<f32>().unwrap();
        let b = second["b"].as_ref().unwrap().to_vec2::<f32>().unwrap();
        assert_ne!(a, b, "skip gate had no effect despite matching widths");
    }

    // ------------------------------------------------------------------
    // Missing values and edge cases
    // ------------------------------------------------------------------

    #[test]
    fn test_no_incoming_edges_reports_none() {
        let meta = Metadata::new(
            vec!["a", "b"],
            vec![("a", "to", "b"), ("b", "back", "a")],
        )
        .unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4), meta, &device()).unwrap();

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(3, 4, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 4, 0.3)));
        // Only a→b participates; "back" is registered but not supplied
        let mut edges = HashMap::new();
        edges.insert(triple("a", "to", "b"), coo(&[0, 1], &[0, 1]));

        let out = conv.forward(&x_dict, &edges).unwrap();
        assert!(out["a"].is_none());
        assert!(out["b"].is_some());
    }

    #[test]
    fn test_empty_edge_dict_yields_all_none() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4), meta, &device()).unwrap();

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(3, 4, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 4, 0.3)));

        let out = conv.forward(&x_dict, &HashMap::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.values().all(|v| v.is_none()));
    }

    #[test]
    fn test_zero_row_type_treated_as_absent() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4), meta, &device()).unwrap();

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(3, 4, 0.2)));
        x_dict.insert(
            "b".to_string(),
            Tensor::from_vec(Vec::<f32>::new(), (0, 4), &device()).unwrap(),
        );

        // No edges: the empty type still shows up, as None
        let out = conv.forward(&x_dict, &HashMap::new()).unwrap();
        assert!(out["b"].is_none());

        // Edges into the empty type cannot be satisfied
        let mut edges = HashMap::new();
        edges.insert(triple("a", "to", "b"), coo(&[0], &[0]));
        assert!(conv.forward(&x_dict, &edges).is_err());
    }

    #[test]
    fn test_unknown_node_type_is_fatal() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4), meta, &device()).unwrap();

        let mut x_dict = HashMap::new();
        x_dict.insert("mystery".to_string(), to_tensor(&mat(3, 4, 0.2)));
        let result = conv.forward(&x_dict, &HashMap::new());
        assert!(matches!(result, Err(GraphAttentionError::Metadata(_))));
    }

    #[test]
    fn test_unknown_edge_type_is_fatal() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 4), meta, &device()).unwrap();

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(3, 4, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 4, 0.3)));
        let mut edges = HashMap::new();
        edges.insert(triple("a", "mystery", "b"), coo(&[0], &[0]));
        let result = conv.forward(&x_dict, &edges);
        assert!(matches!(result, Err(GraphAttentionError::Metadata(_))));
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    #[test]
    fn test_rejects_indivisible_heads() {
        let meta = Metadata::new(vec!["a"], vec![("a", "self", "a")]).unwrap();
        let result = HgtConv::new(HgtConfig::new(4, 10).with_heads(3), meta, &device());
        assert!(matches!(result, Err(GraphAttentionError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_heads() {
        let meta = Metadata::new(vec!["a"], vec![("a", "self", "a")]).unwrap();
        let result = HgtConv::new(HgtConfig::new(4, 4).with_heads(0), meta, &device());
        assert!(matches!(result, Err(GraphAttentionError::Config(_))));
    }

    #[test]
    fn test_rejects_cat_group_with_shared_destination() {
        let meta = Metadata::new(
            vec!["a", "b"],
            vec![("a", "to", "b"), ("b", "self", "b")],
        )
        .unwrap();
        let result = HgtConv::new(
            HgtConfig::new(4, 4).with_group(GroupAggr::Cat),
            meta,
            &device(),
        );
        assert!(matches!(result, Err(GraphAttentionError::Config(_))));
    }

    #[test]
    fn test_rejects_incomplete_per_type_widths() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let mut widths = HashMap::new();
        widths.insert("a".to_string(), 4usize);
        let result = HgtConv::new(HgtConfig::new(widths, 4), meta, &device());
        assert!(matches!(result, Err(GraphAttentionError::Config(_))));
    }

    #[test]
    fn test_mean_group_runs() {
        let meta = Metadata::new(
            vec!["a", "b"],
            vec![("a", "to", "b"), ("b", "self", "b")],
        )
        .unwrap();
        let conv = HgtConv::new(
            HgtConfig::new(4, 4).with_group(GroupAggr::Mean),
            meta,
            &device(),
        )
        .unwrap();

        let mut x_dict = HashMap::new();
        x_dict.insert("a".to_string(), to_tensor(&mat(2, 4, 0.2)));
        x_dict.insert("b".to_string(), to_tensor(&mat(2, 4, 0.3)));
        let mut edges = HashMap::new();
        edges.insert(triple("a", "to", "b"), coo(&[0, 1], &[0, 1]));
        edges.insert(triple("b", "self", "b"), coo(&[0, 1], &[1, 0]));

        let out = conv.forward(&x_dict, &edges).unwrap();
        assert_eq!(out["b"].as_ref().unwrap().dims(), &[2, 4]);
    }

    // ------------------------------------------------------------------
    // Parameter bookkeeping
    // ------------------------------------------------------------------

    #[test]
    fn test_named_parameters_cover_relations_and_gates() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 8).with_heads(2), meta, &device()).unwrap();

        let names: Vec<String> = conv.named_parameters().into_iter().map(|(n, _)| n).collect();
        for expected in [
            "k_lin.a.weight",
            "q_lin.b.bias",
            "v_lin.a.weight",
            "a_lin.b.weight",
            "a_rel.a__to__b",
            "m_rel.a__to__b",
            "p_rel.a__to__b",
            "skip.a",
            "skip.b",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
        assert_eq!(conv.trainable_vars().len(), names.len());
    }

    #[test]
    fn test_reset_parameters_restores_neutral_priors() {
        let meta = Metadata::new(vec!["a", "b"], vec![("a", "to", "b")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(4, 8).with_heads(2), meta, &device()).unwrap();
        fill_deterministic(&conv);

        conv.reset_parameters().unwrap();
        for (name, var) in conv.named_parameters() {
            if name.starts_with("p_rel.") || name.starts_with("skip.") {
                let vals: Vec<f32> = var.as_tensor().to_vec1().unwrap();
                assert!(vals.iter().all(|v| *v == 1.0), "{} not reset to ones", name);
            }
        }
    }

    #[test]
    fn test_display() {
        let meta = Metadata::new(vec!["a"], vec![("a", "self", "a")]).unwrap();
        let conv = HgtConv::new(HgtConfig::new(16, 32).with_heads(4), meta, &device()).unwrap();
        assert_eq!(format!("{}", conv), "HgtConv(32, heads=4)");
    }
}
