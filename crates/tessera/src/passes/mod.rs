//! Graph-rewriting passes run before and after partitioning.

mod unsqueeze_elimination;

pub use unsqueeze_elimination::UnsqueezeElimination;

use crate::graph::Graph;

/// Canonical interface implemented by rewriting passes that operate on a
/// whole graph.
pub trait GraphTransform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies the transform in place, returning whether the graph was
    /// modified.
    fn apply(&self, graph: &mut Graph) -> anyhow::Result<bool>;
}

/// Runs each transform once in order, returning whether any of them modified
/// the graph.
pub fn apply_transforms(
    graph: &mut Graph,
    transforms: &[Box<dyn GraphTransform>],
) -> anyhow::Result<bool> {
    let mut modified = false;
    for transform in transforms {
        let changed = transform.apply(graph)?;
        tracing::debug!(transform = transform.name(), changed, "applied graph transform");
        modified |= changed;
    }
    Ok(modified)
}
