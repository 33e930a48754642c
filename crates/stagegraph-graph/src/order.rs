//! Cycle detection and topological ordering.

use crate::error::CycleError;
use crate::graph::DependencyGraph;
use crate::registry::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
  Unvisited,
  InProgress,
  Done,
}

/// Compute a deterministic execution order, or report a cycle.
///
/// Depth-first search over upstream adjacency with three-colour marks. Roots
/// are taken in declaration order and each stage is emitted right after its
/// not-yet-emitted dependencies, so a declaration that is already
/// topologically ordered comes back unchanged.
pub fn order(graph: &DependencyGraph) -> Result<Vec<StageId>, CycleError> {
  let mut marks = vec![Mark::Unvisited; graph.len()];
  let mut ordered = Vec::with_capacity(graph.len());
  // (stage, position of the next upstream stage to visit)
  let mut stack: Vec<(StageId, usize)> = Vec::new();

  for root in graph.stage_ids() {
    if marks[root.index()] != Mark::Unvisited {
      continue;
    }
    marks[root.index()] = Mark::InProgress;
    stack.push((root, 0));

    while let Some(frame) = stack.last_mut() {
      let stage = frame.0;
      let Some(&next) = graph.upstream(stage).get(frame.1) else {
        marks[stage.index()] = Mark::Done;
        ordered.push(stage);
        stack.pop();
        continue;
      };
      frame.1 += 1;

      match marks[next.index()] {
        Mark::Unvisited => {
          marks[next.index()] = Mark::InProgress;
          stack.push((next, 0));
        }
        Mark::InProgress => return Err(cycle_from_stack(graph, &stack, next)),
        Mark::Done => {}
      }
    }
  }

  Ok(ordered)
}

/// Slice the stack from the in-progress stage to the top and flip it into
/// edge direction.
fn cycle_from_stack(
  graph: &DependencyGraph,
  stack: &[(StageId, usize)],
  reentered: StageId,
) -> CycleError {
  let start = stack
    .iter()
    .position(|(stage, _)| *stage == reentered)
    .unwrap_or(0);

  let path = stack[start..]
    .iter()
    .rev()
    .map(|(stage, _)| graph.stage_name(*stage).to_string())
    .collect();

  CycleError { path }
}
