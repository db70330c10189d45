//! Algorithms over built graphs.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;

use super::{Graph, GraphError, VertexId};

/// Kahn's algorithm. Returns vertices so that every edge points from an
/// earlier entry to a later one.
pub fn topological_sort<V, E>(graph: &Graph<V, E>) -> Result<Vec<VertexId>, GraphError> {
	let mut in_degrees: Vec<usize> = graph.vertices().map(|v| graph.in_degree(v)).collect();
	let mut ready: Vec<VertexId> = graph
		.vertices()
		.filter(|&v| in_degrees[v.index()] == 0)
		.collect();
	let mut order = Vec::with_capacity(graph.vertex_count());

	while let Some(v) = ready.pop() {
		order.push(v);
		for &e in graph.out_edges(v) {
			let t = graph.target(e);
			in_degrees[t.index()] -= 1;
			if in_degrees[t.index()] == 0 {
				ready.push(t);
			}
		}
	}

	if order.len() == graph.vertex_count() {
		Ok(order)
	} else {
		Err(GraphError::CycleDetected)
	}
}

pub fn is_acyclic<V, E>(graph: &Graph<V, E>) -> bool {
	topological_sort(graph).is_ok()
}

/// Dijkstra's single-source shortest paths over a caller-supplied edge
/// weight. Returns one distance per vertex, `None` when unreachable.
pub fn shortest_paths<V, E>(
	graph: &Graph<V, E>,
	source: VertexId,
	mut weight: impl FnMut(super::EdgeId) -> u64,
) -> Vec<Option<u64>> {
	let mut distances: Vec<Option<u64>> = vec![None; graph.vertex_count()];
	let mut heap = BinaryHeap::new();
	distances[source.index()] = Some(0);
	heap.push(Reverse((0u64, source)));

	while let Some(Reverse((distance, v))) = heap.pop() {
		if distances[v.index()] != Some(distance) {
			continue;
		}
		for &e in graph.out_edges(v) {
			let t = graph.target(e);
			let candidate = distance + weight(e);
			if distances[t.index()].is_none_or(|d| candidate < d) {
				distances[t.index()] = Some(candidate);
				heap.push(Reverse((candidate, t)));
			}
		}
	}

	distances
}

#[cfg(test)]
mod tests {
	use super::super::{GraphBuilder, Structure};
	use super::*;

	#[test]
	fn topological_order_respects_edges() {
		let mut builder = GraphBuilder::new(Structure::DirectedAcyclic);
		let vertices: Vec<_> = (0..6).map(|i| builder.add_vertex(i)).collect();
		let edges = [(0, 2), (1, 2), (2, 3), (3, 4), (1, 5), (5, 4)];
		for (s, t) in edges {
			builder.add_edge(vertices[s], vertices[t], ());
		}
		let graph = builder.build().unwrap();

		let order = topological_sort(&graph).unwrap();
		assert_eq!(order.len(), 6);
		let position = |v: VertexId| order.iter().position(|&o| o == v).unwrap();
		for (s, t) in edges {
			assert!(position(vertices[s]) < position(vertices[t]));
		}
	}

	#[test]
	fn shortest_paths_picks_cheaper_route() {
		let mut builder = GraphBuilder::new(Structure::Directed);
		let a = builder.add_vertex(());
		let b = builder.add_vertex(());
		let c = builder.add_vertex(());
		builder.add_edge(a, b, 10u64);
		builder.add_edge(a, c, 1u64);
		builder.add_edge(c, b, 2u64);
		let graph = builder.build().unwrap();

		let weight = |e| *graph.edge(e);
		let distances = shortest_paths(&graph, a, weight);
		assert_eq!(distances[b.index()], Some(3));
		assert_eq!(distances[c.index()], Some(1));
	}
}
