//! Heterogeneous graph transformer forward pass
//!
//! Demonstrates: a two-type citation graph pushed through one HGT layer
//!
//! Run with:
//! ```bash
//! cargo run --example hetero_forward
//! ```

use an_graph_attention::prelude::*;
use std::collections::HashMap;

fn main() -> Result<()> {
    let device = best_device();

    // 1. Describe the schema: node types and (src, relation, dst) triples
    let metadata = Metadata::new(
        vec!["author", "paper"],
        vec![("author", "writes", "paper"), ("paper", "cites", "paper")],
    )?;

    // 2. Build the layer: 8 channels in and out, 2 attention heads
    let conv = HgtConv::new(HgtConfig::new(8, 8).with_heads(2), metadata, &device)?;
    println!("layer: {}", conv);
    println!("parameters: {}", conv.trainable_vars().len());

    // 3. Features per node type
    let mut x_dict = HashMap::new();
    x_dict.insert(
        "author".to_string(),
        Tensor::randn(0.0f32, 1.0, (4, 8), &device)?,
    );
    x_dict.insert(
        "paper".to_string(),
        Tensor::randn(0.0f32, 1.0, (3, 8), &device)?,
    );

    // 4. Connectivity per edge type (COO pairs: row 0 = src, row 1 = dst)
    let mut edge_index_dict = HashMap::new();
    edge_index_dict.insert(
        ("author".to_string(), "writes".to_string(), "paper".to_string()),
        EdgeIndex::Coo(Tensor::from_vec(
            vec![0u32, 1, 2, 3, 0, 1, 1, 2],
            (2, 4),
            &device,
        )?),
    );
    edge_index_dict.insert(
        ("paper".to_string(), "cites".to_string(), "paper".to_string()),
        EdgeIndex::Coo(Tensor::from_vec(vec![1u32, 2, 0, 0], (2, 2), &device)?),
    );

    // 5. One forward pass
    let out = conv.forward(&x_dict, &edge_index_dict)?;
    println!("\n--- Updated embeddings ---");
    for (node_type, value) in &out {
        match value {
            Some(t) => println!("  {}: {:?}", node_type, t.dims()),
            None => println!("  {}: no incoming messages", node_type),
        }
    }

    Ok(())
}
