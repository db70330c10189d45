//! Static directed graphs.
//!
//! A [`GraphBuilder`] accumulates vertices and edges and emits an
//! immutable [`Graph`] whose incidence lists are contiguous arrays. The
//! structural requirements (simple graph, optionally acyclic) are
//! checked once at [`GraphBuilder::build`]; the interrupt topology and
//! the routing plan are both modeled this way.

pub mod algo;

use alloc::vec::Vec;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum GraphError {
	#[error("graph contains a cycle")]
	CycleDetected,
	#[error("parallel edge in a simple graph")]
	ParallelEdge,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct VertexId(u32);

impl VertexId {
	pub fn index(self) -> usize {
		self.0 as usize
	}
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EdgeId(u32);

impl EdgeId {
	pub fn index(self) -> usize {
		self.0 as usize
	}
}

/// Structural requirements checked when a graph is built.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Structure {
	/// Directed simple graph.
	Directed,
	/// Directed simple graph without cycles.
	DirectedAcyclic,
}

struct Edge<E> {
	source: VertexId,
	target: VertexId,
	label: E,
}

/// Immutable directed graph with vertex labels `V` and edge labels `E`.
pub struct Graph<V, E> {
	vertices: Vec<V>,
	edges: Vec<Edge<E>>,
	out_offsets: Vec<u32>,
	out_list: Vec<EdgeId>,
	in_offsets: Vec<u32>,
	in_list: Vec<EdgeId>,
}

impl<V, E> Graph<V, E> {
	pub fn vertex_count(&self) -> usize {
		self.vertices.len()
	}

	pub fn edge_count(&self) -> usize {
		self.edges.len()
	}

	pub fn vertices(&self) -> impl Iterator<Item = VertexId> + use<V, E> {
		(0..self.vertices.len() as u32).map(VertexId)
	}

	pub fn edges(&self) -> impl Iterator<Item = EdgeId> + use<V, E> {
		(0..self.edges.len() as u32).map(EdgeId)
	}

	pub fn vertex(&self, id: VertexId) -> &V {
		&self.vertices[id.index()]
	}

	pub fn edge(&self, id: EdgeId) -> &E {
		&self.edges[id.index()].label
	}

	pub fn source(&self, id: EdgeId) -> VertexId {
		self.edges[id.index()].source
	}

	pub fn target(&self, id: EdgeId) -> VertexId {
		self.edges[id.index()].target
	}

	pub fn out_edges(&self, id: VertexId) -> &[EdgeId] {
		let start = self.out_offsets[id.index()] as usize;
		let end = self.out_offsets[id.index() + 1] as usize;
		&self.out_list[start..end]
	}

	pub fn in_edges(&self, id: VertexId) -> &[EdgeId] {
		let start = self.in_offsets[id.index()] as usize;
		let end = self.in_offsets[id.index() + 1] as usize;
		&self.in_list[start..end]
	}

	pub fn out_degree(&self, id: VertexId) -> usize {
		self.out_edges(id).len()
	}

	pub fn in_degree(&self, id: VertexId) -> usize {
		self.in_edges(id).len()
	}

	/// The unique edge from `source` to `target` in a simple graph.
	pub fn find_edge(&self, source: VertexId, target: VertexId) -> Option<EdgeId> {
		self.out_edges(source)
			.iter()
			.copied()
			.find(|&e| self.target(e) == target)
	}
}

/// Accumulates a graph for a one-shot [`build`](Self::build).
pub struct GraphBuilder<V, E> {
	structure: Structure,
	vertices: Vec<V>,
	edges: Vec<(VertexId, VertexId, E)>,
}

impl<V, E> GraphBuilder<V, E> {
	pub const fn new(structure: Structure) -> Self {
		Self {
			structure,
			vertices: Vec::new(),
			edges: Vec::new(),
		}
	}

	pub fn vertex_count(&self) -> usize {
		self.vertices.len()
	}

	pub fn vertex(&self, id: VertexId) -> &V {
		&self.vertices[id.index()]
	}

	pub fn add_vertex(&mut self, label: V) -> VertexId {
		let id = VertexId(self.vertices.len() as u32);
		self.vertices.push(label);
		id
	}

	pub fn add_edge(&mut self, source: VertexId, target: VertexId, label: E) {
		assert!(source.index() < self.vertices.len());
		assert!(target.index() < self.vertices.len());
		self.edges.push((source, target, label));
	}

	pub fn build(&self) -> Result<Graph<V, E>, GraphError>
	where
		V: Clone,
		E: Clone,
	{
		let vertex_count = self.vertices.len();
		let mut edges = Vec::with_capacity(self.edges.len());
		for (source, target, label) in self.edges.iter().cloned() {
			edges.push(Edge {
				source,
				target,
				label,
			});
		}

		let mut out_counts = vec![0u32; vertex_count + 1];
		let mut in_counts = vec![0u32; vertex_count + 1];
		for edge in &edges {
			out_counts[edge.source.index() + 1] += 1;
			in_counts[edge.target.index() + 1] += 1;
		}
		for i in 1..=vertex_count {
			out_counts[i] += out_counts[i - 1];
			in_counts[i] += in_counts[i - 1];
		}

		let mut out_list = vec![EdgeId(0); edges.len()];
		let mut in_list = vec![EdgeId(0); edges.len()];
		let mut out_cursor = out_counts.clone();
		let mut in_cursor = in_counts.clone();
		for (i, edge) in edges.iter().enumerate() {
			let id = EdgeId(i as u32);
			out_list[out_cursor[edge.source.index()] as usize] = id;
			out_cursor[edge.source.index()] += 1;
			in_list[in_cursor[edge.target.index()] as usize] = id;
			in_cursor[edge.target.index()] += 1;
		}

		let graph = Graph {
			vertices: self.vertices.clone(),
			edges,
			out_offsets: out_counts,
			out_list,
			in_offsets: in_counts,
			in_list,
		};

		for v in graph.vertices() {
			let out = graph.out_edges(v);
			for (i, &e) in out.iter().enumerate() {
				for &other in &out[i + 1..] {
					if graph.target(e) == graph.target(other) {
						return Err(GraphError::ParallelEdge);
					}
				}
			}
		}

		if self.structure == Structure::DirectedAcyclic && !algo::is_acyclic(&graph) {
			return Err(GraphError::CycleDetected);
		}

		Ok(graph)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builds_incidence_lists() {
		let mut builder = GraphBuilder::new(Structure::DirectedAcyclic);
		let a = builder.add_vertex("a");
		let b = builder.add_vertex("b");
		let c = builder.add_vertex("c");
		builder.add_edge(a, b, 1);
		builder.add_edge(a, c, 2);
		builder.add_edge(b, c, 3);
		let graph = builder.build().unwrap();

		assert_eq!(graph.out_degree(a), 2);
		assert_eq!(graph.in_degree(c), 2);
		let e = graph.find_edge(a, c).unwrap();
		assert_eq!(*graph.edge(e), 2);
		assert!(graph.find_edge(c, a).is_none());
	}

	#[test]
	fn cycle_is_rejected() {
		let mut builder = GraphBuilder::new(Structure::DirectedAcyclic);
		let a = builder.add_vertex(());
		let b = builder.add_vertex(());
		builder.add_edge(a, b, ());
		builder.add_edge(b, a, ());
		assert_eq!(builder.build().err(), Some(GraphError::CycleDetected));
	}

	#[test]
	fn parallel_edge_is_rejected() {
		let mut builder = GraphBuilder::new(Structure::Directed);
		let a = builder.add_vertex(());
		let b = builder.add_vertex(());
		builder.add_edge(a, b, ());
		builder.add_edge(a, b, ());
		assert_eq!(builder.build().err(), Some(GraphError::ParallelEdge));
	}
}
