//! Ordering guarantees over generated graphs.

use stagegraph_config::{EdgeDef, StageDef};
use stagegraph_graph::{DependencyGraph, GraphError, order};

/// Small deterministic generator so the graphs are repeatable.
struct Lcg(u64);

impl Lcg {
  fn next(&mut self) -> u64 {
    self.0 = self
      .0
      .wrapping_mul(6364136223846793005)
      .wrapping_add(1442695040888963407);
    self.0 >> 33
  }

  fn below(&mut self, bound: u64) -> u64 {
    self.next() % bound
  }
}

/// Random DAG: edges only go from lower to higher rank, then the declaration
/// order is shuffled so it is not already topological.
fn random_dag(seed: u64, stages: usize, edges: usize) -> (Vec<StageDef>, Vec<EdgeDef>) {
  let mut rng = Lcg(seed);
  let names: Vec<String> = (0..stages).map(|i| format!("s{i}")).collect();

  let mut edge_defs = Vec::new();
  for n in 0..edges {
    let a = rng.below(stages as u64) as usize;
    let b = rng.below(stages as u64) as usize;
    if a == b {
      continue;
    }
    let (from, to) = if a < b { (a, b) } else { (b, a) };
    edge_defs.push(EdgeDef::new(format!("v{n}"), &names[from], &names[to]));
  }

  let mut declared: Vec<String> = names.clone();
  for i in (1..declared.len()).rev() {
    let j = rng.below(i as u64 + 1) as usize;
    declared.swap(i, j);
  }

  (declared.into_iter().map(StageDef::new).collect(), edge_defs)
}

#[test]
fn test_every_edge_respected_in_random_dags() {
  for seed in 0..50 {
    let (stages, edges) = random_dag(seed, 30, 60);
    let graph = DependencyGraph::build(&stages, &edges).unwrap();
    let order = order(&graph).unwrap();

    assert_eq!(order.len(), graph.len());
    let mut position = vec![0usize; graph.len()];
    for (i, stage) in order.iter().enumerate() {
      position[stage.index()] = i;
    }
    for edge in graph.edges() {
      assert!(
        position[edge.producer.index()] < position[edge.consumer.index()],
        "seed {seed}: {} must precede {}",
        graph.stage_name(edge.producer),
        graph.stage_name(edge.consumer)
      );
    }
  }
}

#[test]
fn test_order_is_repeatable() {
  let (stages, edges) = random_dag(7, 40, 90);
  let first = order(&DependencyGraph::build(&stages, &edges).unwrap()).unwrap();
  let second = order(&DependencyGraph::build(&stages, &edges).unwrap()).unwrap();
  assert_eq!(first, second);
}

#[test]
fn test_back_edge_in_random_dag_reports_closed_cycle() {
  for seed in 0..20 {
    let (stages, mut edges) = random_dag(seed, 20, 40);
    // Close a loop along an existing edge.
    let Some(first) = edges.first().cloned() else {
      continue;
    };
    edges.push(EdgeDef::new("back", &first.to, &first.from));

    let graph = DependencyGraph::build(&stages, &edges).unwrap();
    let err = order(&graph).unwrap_err();
    assert!(err.path.len() >= 2);

    for i in 0..err.path.len() {
      let from = graph.lookup(&err.path[i]).unwrap();
      let to = graph.lookup(&err.path[(i + 1) % err.path.len()]).unwrap();
      assert!(
        graph.downstream(from).contains(&to),
        "seed {seed}: {} does not feed {}",
        err.path[i],
        err.path[(i + 1) % err.path.len()]
      );
    }
  }
}

#[test]
fn test_structural_errors_precede_cycle_analysis() {
  let stages = vec![StageDef::new("a"), StageDef::new("b")];
  let edges = vec![
    EdgeDef::new("x", "a", "b"),
    EdgeDef::new("y", "b", "a"),
    EdgeDef::new("z", "b", "missing"),
  ];
  let err = DependencyGraph::build(&stages, &edges).unwrap_err();
  assert!(matches!(err, GraphError::UnknownStageReference { .. }));
}
