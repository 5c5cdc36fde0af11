//! # an-graph-attention
//!
//! Heterogeneous Graph Transformer (HGT) attention layers over candle tensors.
//!
//! ## Overview
//!
//! This crate implements type-aware attention message passing for graphs with
//! multiple node types and multiple (source, relation, destination) edge
//! types. Per-type feature dicts are projected to keys/queries/values, each
//! relation applies its own learned per-head transform and scalar prior, and
//! one combined sparse attention pass aggregates messages per destination
//! node.
//!
//! Core pieces:
//!
//! - **Metadata**: registry of node and edge types with dense integer ids
//! - **Primitives**: segment matmul, grouped softmax, scatter aggregation
//! - **Graph**: dense coordinate and compressed sparse edge representations
//! - **Conv**: the [`HgtConv`](conv::HgtConv) layer with per-type linear
//!   projection strategies and a learned skip gate
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use an_graph_attention::prelude::*;
//! use std::collections::HashMap;
//!
//! let device = best_device();
//! let metadata = Metadata::new(
//!     vec!["author", "paper"],
//!     vec![("author", "writes", "paper")],
//! )?;
//! let conv = HgtConv::new(HgtConfig::new(64, 64).with_heads(4), metadata, &device)?;
//!
//! let mut x_dict = HashMap::new();
//! x_dict.insert("author".to_string(), author_features);
//! x_dict.insert("paper".to_string(), paper_features);
//!
//! let mut edge_index_dict = HashMap::new();
//! edge_index_dict.insert(
//!     ("author".into(), "writes".into(), "paper".into()),
//!     EdgeIndex::Coo(writes_edges),
//! );
//!
//! let out = conv.forward(&x_dict, &edge_index_dict)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration (M1/M2/M3/M4)
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod conv;
pub mod graph;
pub mod metadata;
pub mod primitives;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for heterogeneous graph attention operations
#[derive(Debug, thiserror::Error)]
pub enum GraphAttentionError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for graph attention operations
pub type Result<T> = std::result::Result<T, GraphAttentionError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{GraphAttentionError, Result};

    // Primitives
    pub use crate::primitives::{
        // Device selection
        best_device, cpu_device, cuda_available, gpu_available, gpu_disabled, metal_available,
        // Initialization
        glorot, glorot_var, ones_var,
        // Grouped/segmented ops
        group_tensors, scatter_softmax, scatter_sum, segment_matmul, GroupAggr,
        // Activations
        gelu, relu, sigmoid, softmax,
    };

    // Metadata
    pub use crate::metadata::{EdgeTypeId, Metadata, NodeSlices, NodeTypeId};

    // Graph connectivity
    pub use crate::graph::{CsrAdjacency, EdgeIndex};

    // Convolution layer
    pub use crate::conv::{HeteroProjector, HgtConfig, HgtConv, InChannels, ProjectorStrategy};
}
