//! Routing policies.
//!
//! A policy turns a freshly exploded [`RoutingGraphBuilder`] into a
//! complete routing plan. The stock policy is greedy: it never
//! backtracks, so hardware combinations that defeat the greedy choice
//! are rejected by the builder and reported rather than searched for.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;

use ahash::RandomState;
use hashbrown::HashMap;

use super::domain::RoutingRule;
use super::routing::{RoutingGraph, RoutingGraphBuilder, RoutingNode, RoutingVertexId};

pub trait RoutingPolicy: Send + Sync {
	fn build_routing_graph(&self, builder: RoutingGraphBuilder) -> RoutingGraph;
}

/// Assigns each routable receiver to the currently lightest-loaded legal
/// target, visiting domains in topological order so that upstream loads
/// are final before they are consumed downstream.
pub struct GreedyRoutingPolicy;

struct TargetEntry {
	load: usize,
	order: usize,
	index: usize,
	vertex: RoutingVertexId,
}

impl PartialEq for TargetEntry {
	fn eq(&self, other: &Self) -> bool {
		(self.load, self.order, self.index) == (other.load, other.order, other.index)
	}
}

impl Eq for TargetEntry {}

impl Ord for TargetEntry {
	fn cmp(&self, other: &Self) -> core::cmp::Ordering {
		(self.load, self.order, self.index).cmp(&(other.load, other.order, other.index))
	}
}

impl PartialOrd for TargetEntry {
	fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl RoutingPolicy for GreedyRoutingPolicy {
	fn build_routing_graph(&self, mut builder: RoutingGraphBuilder) -> RoutingGraph {
		let order = builder.snapshot().order.clone();

		// Load of a node = number of devices whose path passes through
		// it. Devices start at 1; forced edges propagate forward.
		let mut loads: HashMap<RoutingNode, usize, RandomState> =
			HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0));

		let mut forced: Vec<(RoutingVertexId, RoutingVertexId)> = builder.edges().collect();
		forced.sort_by_key(|&(source, _)| order.position(&builder.label(source).domain));
		let mut forced_cursor = 0;

		for domain in order.domains() {
			if domain.as_receiver().is_none() {
				let emitter = domain
					.as_emitter()
					.expect("domain is neither receiver nor emitter");
				for index in 0..emitter.emitter_count() {
					loads.insert(RoutingNode::new(domain.clone(), index), 1);
				}
			}

			// Push the loads of this domain's pre-installed edges
			// forward before any downstream domain is visited.
			while forced_cursor < forced.len()
				&& builder.label(forced[forced_cursor].0).domain == *domain
			{
				let (source, target) = forced[forced_cursor];
				let source_load = loads
					.get(builder.label(source))
					.copied()
					.unwrap_or_default();
				*loads.entry(builder.label(target).clone()).or_default() += source_load;
				forced_cursor += 1;
			}

			let Some(routable) = domain.as_routable() else {
				continue;
			};
			let receiver_count = routable.receiver_count();

			if matches!(routable.routing_rule(), RoutingRule::Free) {
				// Every receiver of a freely routable domain has the
				// same candidate targets, so one load-keyed heap serves
				// them all; O(R log T) instead of R scans.
				let first = builder
					.vertex_by_label(&RoutingNode::new(domain.clone(), 0))
					.expect("routable domain must have at least one receiver");
				let mut heap: BinaryHeap<Reverse<TargetEntry>> = builder
					.valid_edges_from(first)
					.into_iter()
					.map(|vertex| {
						let label = builder.label(vertex);
						Reverse(TargetEntry {
							load: loads.get(label).copied().unwrap_or_default(),
							order: order.position(&label.domain),
							index: label.index,
							vertex,
						})
					})
					.collect();

				// Route the heaviest receivers first so they grab the
				// lightest targets.
				let mut receivers: Vec<(usize, usize)> = (0..receiver_count)
					.filter_map(|index| {
						let load = loads
							.get(&RoutingNode::new(domain.clone(), index))
							.copied()
							.unwrap_or_default();
						(load > 0).then_some((index, load))
					})
					.collect();
				receivers.sort_by_key(|&(index, load)| (Reverse(load), index));

				for (index, load) in receivers {
					let source = builder
						.vertex_by_label(&RoutingNode::new(domain.clone(), index))
						.unwrap();
					let Reverse(mut best) = heap.pop().expect("no legal target for receiver");
					builder
						.add_edge(source, best.vertex)
						.expect("greedy choice must be legal");
					best.load += load;
					*loads.entry(builder.label(best.vertex).clone()).or_default() += load;
					heap.push(Reverse(best));
				}
			} else {
				// No structure to exploit; scan the legal targets of
				// each loaded receiver and take the lightest.
				for index in 0..receiver_count {
					let label = RoutingNode::new(domain.clone(), index);
					let load = loads.get(&label).copied().unwrap_or_default();
					if load == 0 {
						continue;
					}
					let source = builder.vertex_by_label(&label).unwrap();
					if builder.out_edge(source).is_some() {
						// Fixed domains arrive with their edges forced.
						continue;
					}
					let mut best: Option<(usize, RoutingVertexId)> = None;
					for candidate in builder.valid_edges_from(source) {
						let candidate_load = loads
							.get(builder.label(candidate))
							.copied()
							.unwrap_or_default();
						if best.is_none_or(|(best_load, _)| candidate_load < best_load) {
							best = Some((candidate_load, candidate));
						}
					}
					let (_, target) = best.expect("no legal target for routed receiver");
					builder
						.add_edge(source, target)
						.expect("greedy choice must be legal");
					*loads.entry(builder.label(target).clone()).or_default() += load;
				}
			}
		}

		builder.build()
	}
}
