//! Heterogeneous graph metadata
//!
//! Fixed registry of node types and (source, relation, destination) edge
//! types, known at layer construction. Public lookups use string labels;
//! internally every type gets a dense integer id assigned in registration
//! order, and all parameter stores are indexed by those ids instead of
//! string-joined keys.
//!
//! Registration order is load-bearing: it defines the concatenation order of
//! the global node index space (see [`NodeSlices`]) and the iteration order
//! over relations in the forward pass.

use std::collections::HashMap;

use crate::{GraphAttentionError, Result};

/// Dense id of a registered node type, assigned in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeTypeId(usize);

impl NodeTypeId {
    /// Position of this node type in registration order
    pub fn index(self) -> usize {
        self.0
    }
}

/// Dense id of a registered edge type, assigned in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeTypeId(usize);

impl EdgeTypeId {
    /// Position of this edge type in registration order
    pub fn index(self) -> usize {
        self.0
    }
}

/// Registry of node and edge types for one heterogeneous graph schema
///
/// Constructed once, then shared read-only by the layer. Edge types are
/// ordered triples `(source type, relation label, destination type)`; two
/// relations may share endpoints as long as the relation label differs.
#[derive(Debug, Clone)]
pub struct Metadata {
    node_types: Vec<String>,
    edge_types: Vec<(String, String, String)>,
    node_ids: HashMap<String, NodeTypeId>,
    edge_ids: HashMap<(String, String, String), EdgeTypeId>,
    /// (source, destination) node ids per edge type, same order as `edge_types`
    endpoints: Vec<(NodeTypeId, NodeTypeId)>,
}

impl Metadata {
    /// Build a registry from node type labels and edge type triples
    ///
    /// Fails when the node set is empty, a label or triple is duplicated, or
    /// an edge endpoint names an unregistered node type.
    pub fn new<S: Into<String>>(node_types: Vec<S>, edge_types: Vec<(S, S, S)>) -> Result<Self> {
        let node_types: Vec<String> = node_types.into_iter().map(Into::into).collect();
        let edge_types: Vec<(String, String, String)> = edge_types
            .into_iter()
            .map(|(s, r, d)| (s.into(), r.into(), d.into()))
            .collect();

        if node_types.is_empty() {
            return Err(GraphAttentionError::Metadata(
                "metadata requires at least one node type".into(),
            ));
        }

        let mut node_ids = HashMap::with_capacity(node_types.len());
        for (i, name) in node_types.iter().enumerate() {
            if node_ids.insert(name.clone(), NodeTypeId(i)).is_some() {
                return Err(GraphAttentionError::Metadata(format!(
                    "duplicate node type '{}'",
                    name
                )));
            }
        }

        let mut edge_ids = HashMap::with_capacity(edge_types.len());
        let mut endpoints = Vec::with_capacity(edge_types.len());
        for (i, triple) in edge_types.iter().enumerate() {
            let (src, _rel, dst) = triple;
            let src_id = *node_ids.get(src).ok_or_else(|| {
                GraphAttentionError::Metadata(format!(
                    "edge type {:?} references unregistered source type '{}'",
                    triple, src
                ))
            })?;
            let dst_id = *node_ids.get(dst).ok_or_else(|| {
                GraphAttentionError::Metadata(format!(
                    "edge type {:?} references unregistered destination type '{}'",
                    triple, dst
                ))
            })?;
            if edge_ids.insert(triple.clone(), EdgeTypeId(i)).is_some() {
                return Err(GraphAttentionError::Metadata(format!(
                    "duplicate edge type {:?}",
                    triple
                )));
            }
            endpoints.push((src_id, dst_id));
        }

        Ok(Self {
            node_types,
            edge_types,
            node_ids,
            edge_ids,
            endpoints,
        })
    }

    /// Node type labels in registration order
    pub fn node_types(&self) -> &[String] {
        &self.node_types
    }

    /// Edge type triples in registration order
    pub fn edge_types(&self) -> &[(String, String, String)] {
        &self.edge_types
    }

    pub fn num_node_types(&self) -> usize {
        self.node_types.len()
    }

    pub fn num_edge_types(&self) -> usize {
        self.edge_types.len()
    }

    /// Resolve a node type label; unknown labels are fatal
    pub fn node_type_id(&self, name: &str) -> Result<NodeTypeId> {
        self.node_ids.get(name).copied().ok_or_else(|| {
            GraphAttentionError::Metadata(format!("unknown node type '{}'", name))
        })
    }

    /// Resolve an edge type triple; unknown triples are fatal
    pub fn edge_type_id(&self, src: &str, rel: &str, dst: &str) -> Result<EdgeTypeId> {
        let key = (src.to_string(), rel.to_string(), dst.to_string());
        self.edge_ids.get(&key).copied().ok_or_else(|| {
            GraphAttentionError::Metadata(format!(
                "unknown edge type ('{}', '{}', '{}')",
                src, rel, dst
            ))
        })
    }

    /// Label of a node type id
    pub fn node_type_name(&self, id: NodeTypeId) -> &str {
        &self.node_types[id.0]
    }

    /// `src__rel__dst` label of an edge type id, used for parameter naming
    pub fn edge_type_key(&self, id: EdgeTypeId) -> String {
        let (src, rel, dst) = &self.edge_types[id.0];
        format!("{}__{}__{}", src, rel, dst)
    }

    /// Source node type of an edge type
    pub fn src_of(&self, id: EdgeTypeId) -> NodeTypeId {
        self.endpoints[id.0].0
    }

    /// Destination node type of an edge type
    pub fn dst_of(&self, id: EdgeTypeId) -> NodeTypeId {
        self.endpoints[id.0].1
    }

    /// All edge type ids in registration order
    pub fn edge_type_ids(&self) -> impl Iterator<Item = EdgeTypeId> + '_ {
        (0..self.edge_types.len()).map(EdgeTypeId)
    }

    /// All node type ids in registration order
    pub fn node_type_ids(&self) -> impl Iterator<Item = NodeTypeId> + '_ {
        (0..self.node_types.len()).map(NodeTypeId)
    }

    /// Edge types whose destination is `dst`, in registration order
    pub fn relations_into(&self, dst: NodeTypeId) -> Vec<EdgeTypeId> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, (_, d))| *d == dst)
            .map(|(i, _)| EdgeTypeId(i))
            .collect()
    }
}

/// Contiguous slices of the global node index space
///
/// One slice per node type, concatenated in registration order. Offsets are
/// monotonically non-decreasing and match the per-type row counts of the
/// forward call they were built from; types without features contribute an
/// empty slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSlices {
    /// `offsets[i]..offsets[i + 1]` is the slice of node type `i`
    offsets: Vec<usize>,
}

impl NodeSlices {
    /// Build the offset table from per-type row counts in registration order
    pub fn from_counts(counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        let mut total = 0usize;
        offsets.push(0);
        for &c in counts {
            total += c;
            offsets.push(total);
        }
        Self { offsets }
    }

    /// Start of a node type's slice in the global index space
    pub fn start(&self, id: NodeTypeId) -> usize {
        self.offsets[id.0]
    }

    /// Number of rows in a node type's slice
    pub fn count(&self, id: NodeTypeId) -> usize {
        self.offsets[id.0 + 1] - self.offsets[id.0]
    }

    /// Total number of rows across all node types
    pub fn total(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    /// Number of node types covered by this table
    pub fn num_types(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }
}
