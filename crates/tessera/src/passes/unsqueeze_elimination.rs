//! Folds `Unsqueeze` nodes fed by constant initializers into the
//! initializer's shape.
//!
//! An `Unsqueeze` whose only input is a graph initializer contributes nothing
//! at run time: the added unit axes can be baked into the constant itself.
//! The pass rewrites the initializer's shape (wholesale replacement, same
//! payload), points every consumer of the unsqueezed value at the constant,
//! and removes the node.

use anyhow::Context;
use tracing::warn;

use crate::graph::{ArgId, Dimension, Graph, NodeIndex, Shape};

use super::GraphTransform;

pub struct UnsqueezeElimination;

struct Candidate {
    node: NodeIndex,
    input: ArgId,
    output: ArgId,
    axes: Vec<i64>,
}

impl GraphTransform for UnsqueezeElimination {
    fn name(&self) -> &'static str {
        "unsqueeze_elimination"
    }

    fn apply(&self, graph: &mut Graph) -> anyhow::Result<bool> {
        graph
            .resolve()
            .context("graph must resolve before unsqueeze elimination")?;

        let mut candidates = Vec::new();
        for node in graph.nodes() {
            if graph.is_sentinel(node.index()) {
                continue;
            }
            if node.op_type() != "Unsqueeze" || graph.input_edge_count(node.index()) != 0 {
                continue;
            }
            let Some(axes) = node.attribute("axes").and_then(|attr| attr.as_i64_array()) else {
                continue;
            };
            let (Some(input), Some(output)) = (node.inputs().first(), node.outputs().first())
            else {
                continue;
            };
            let input_name = graph.arg(*input).name();
            if graph.initializer(input_name).is_none() {
                continue;
            }
            candidates.push(Candidate {
                node: node.index(),
                input: *input,
                output: *output,
                axes: axes.to_vec(),
            });
        }

        let mut removed = Vec::new();
        for candidate in candidates {
            let input_name = graph.arg(candidate.input).name().to_string();
            let literal = graph
                .initializer(&input_name)
                .expect("candidate initializer disappeared")
                .clone();
            let Some(old_dims) = literal.spec.shape.static_dims() else {
                continue;
            };

            let Some(new_dims) = unsqueezed_dims(&old_dims, &candidate.axes) else {
                warn!(
                    node = %candidate.node,
                    initializer = input_name,
                    axes = ?candidate.axes,
                    "unsqueeze axes out of range; leaving node in place"
                );
                continue;
            };
            let new_shape = Shape::new(
                new_dims
                    .iter()
                    .map(|dim| Dimension::Static(*dim))
                    .collect::<Vec<_>>(),
            );

            // Wholesale initializer replacement: remove, then add the same
            // payload under the unsqueezed shape.
            graph.remove_initializer(&input_name);
            graph
                .add_initializer(&input_name, literal.with_shape(new_shape.clone()))
                .context("re-adding reshaped initializer")?;
            graph.arg_mut(candidate.input).set_shape(new_shape);

            graph.rewire_consumers(candidate.output, candidate.input);
            removed.push(candidate.node);
        }

        for node in &removed {
            graph.remove_node(*node).context("removing folded node")?;
        }

        let modified = !removed.is_empty();
        if modified {
            graph
                .resolve()
                .context("graph failed to resolve after unsqueeze elimination")?;
        }
        Ok(modified)
    }
}

/// Computes the unsqueezed dimension list: rank grows by `axes.len()`, each
/// named axis becomes a unit dimension, and the original extents fill the
/// remaining slots in order. Returns `None` when any axis falls outside the
/// new rank or is duplicated.
fn unsqueezed_dims(old_dims: &[usize], axes: &[i64]) -> Option<Vec<usize>> {
    let new_rank = old_dims.len() + axes.len();
    let mut new_dims = vec![0usize; new_rank];
    for axis in axes {
        let index = usize::try_from(*axis).ok()?;
        if index >= new_rank || new_dims[index] != 0 {
            return None;
        }
        new_dims[index] = 1;
    }
    let mut remaining = old_dims.iter();
    for slot in new_dims.iter_mut() {
        if *slot == 0 {
            *slot = *remaining.next()?;
        }
    }
    Some(new_dims)
}

#[cfg(test)]
mod tests {
    use super::unsqueezed_dims;

    #[test]
    fn unsqueeze_prepends_and_appends_unit_axes() {
        assert_eq!(unsqueezed_dims(&[3, 4], &[0]), Some(vec![1, 3, 4]));
        assert_eq!(unsqueezed_dims(&[3, 4], &[0, 3]), Some(vec![1, 3, 4, 1]));
        assert_eq!(unsqueezed_dims(&[5], &[1]), Some(vec![5, 1]));
    }

    #[test]
    fn unsqueeze_rejects_out_of_range_or_duplicate_axes() {
        assert_eq!(unsqueezed_dims(&[3], &[5]), None);
        assert_eq!(unsqueezed_dims(&[3], &[-1]), None);
        assert_eq!(unsqueezed_dims(&[3], &[0, 0]), None);
    }
}
