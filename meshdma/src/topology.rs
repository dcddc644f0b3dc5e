// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The interconnect between the devices of a mesh.

use petgraph::algo::dijkstra;
use petgraph::graph::{NodeIndex, UnGraph};

use crate::mesh::{linearize_index, DeviceMesh, PhysicalDeviceId};

/// A torus over the mesh: every device links to its wrap-around neighbours
/// along each axis. Hop counts between all device pairs are computed once.
#[derive(Debug)]
pub struct Topology {
    graph: UnGraph<PhysicalDeviceId, ()>,
    // hops[src][dst], indexed by row-major mesh position
    hops: Vec<Vec<usize>>,
}

impl Topology {
    pub fn torus(mesh: &DeviceMesh) -> Self {
        let dims = mesh.dims();
        let mut graph = UnGraph::new_undirected();
        let nodes = mesh
            .devices()
            .iter()
            .map(|id| graph.add_node(*id))
            .collect::<Vec<_>>();

        // for each device, add the connections to their "higher" neighbours.
        for e in mesh.coords() {
            for (d, m) in dims.iter().enumerate() {
                let mut n = e.0.clone();
                n[d] = (e.0[d] + 1) % m;
                let src = nodes[linearize_index(&e.0, dims)];
                let dst = nodes[linearize_index(&n, dims)];
                // an axis of extent 2 would link the pair twice, extent 1 to itself
                if src != dst && graph.find_edge(src, dst).is_none() {
                    graph.add_edge(src, dst, ());
                }
            }
        }

        let hops = nodes
            .iter()
            .map(|&src| {
                let distances = dijkstra(&graph, src, None, |_| 1usize);
                nodes
                    .iter()
                    .map(|dst| distances.get(dst).copied().unwrap_or(usize::MAX))
                    .collect()
            })
            .collect();
        log::debug!(
            "torus over {} devices with {} links",
            graph.node_count(),
            graph.edge_count()
        );
        Self { graph, hops }
    }

    /// Shortest path length between two mesh positions.
    pub fn hops(&self, src: usize, dst: usize) -> usize {
        self.hops[src][dst]
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn neighbors(&self, pos: usize) -> Vec<PhysicalDeviceId> {
        self.graph
            .neighbors(NodeIndex::new(pos))
            .map(|n| self.graph[n])
            .collect()
    }
}
