//! Heterogeneous Attention Convolution
//!
//! The Heterogeneous Graph Transformer (HGT) layer and its per-type linear
//! projection strategies.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────┐    ┌───────────────┐
//! │ x per type   │ ─▶ │ K/Q/V project │ ─▶ │ segment batch │
//! │ (dict)       │    │ (per type)    │    │ (per relation)│
//! └──────────────┘    └───────────────┘    └───────┬───────┘
//!                                                  ▼
//! ┌──────────────┐    ┌───────────────┐    ┌───────────────┐
//! │ out per type │ ◀─ │ gelu + a_lin  │ ◀─ │ grouped       │
//! │ (skip blend) │    │ (per type)    │    │ attention     │
//! └──────────────┘    └───────────────┘    └───────────────┘
//! ```
//!
//! Projection runs as one batched call over all node types, and attention as
//! one combined pass over all edge types, instead of per-type loops — the
//! dispatch count per forward is constant in the number of types.

mod hgt;
mod linear;

pub use hgt::{HgtConfig, HgtConv, InChannels, RelationStore};
pub use linear::{new_projector, GroupedLinear, HeteroProjector, PerTypeLinear, ProjectorStrategy};
