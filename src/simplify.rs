/*
Copyright (c) 2020 Pierre Marijon <pmarijon@mpi-inf.mpg.de>

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! Graph simplifications: tip clipping, bubble popping and erroneous
//! connection removal, cascaded until a fixed point or the pass budget.
//! Deletions are buffered per sub pass and applied in one shot.

/* crate use */
use log::{info, warn};
use rustc_hash::FxHashSet;

/* local use */
use crate::traversal::{Monument, Terminator};
use crate::unitig::{Direction, NodeGU, NodesDeleter, Strand, UnitigGraph};

/// Topological tip length bound, in kmer sizes.
const TIP_TOPO_KMULT: f64 = 2.5;
/// Coverage based tip length bound, in kmer sizes.
const TIP_RCTC_KMULT: f64 = 10.0;
/// A longer tip goes only when covered below this fraction of its
/// neighborhood.
const TIP_RCTC: f64 = 0.5;
/// Erroneous connection length bound, in kmer sizes.
const EC_LEN_KMULT: f64 = 9.0;
/// An EC goes when covered below the neighborhood median over this factor.
const EC_RCTC: f64 = 4.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct SimplifyReport {
    pub nb_tips: u64,
    pub nb_bubbles: u64,
    pub nb_ec: u64,
    pub nb_passes: u16,
}

/// Run the three passes until nothing changes or the budget is exhausted.
pub fn simplify(graph: &mut UnitigGraph, max_passes: u16) -> SimplifyReport {
    let mut report = SimplifyReport::default();

    for pass in 0..max_passes.max(1) {
        let tips = remove_tips(graph);
        let bubbles = pop_bubbles(graph);
        let ec = remove_erroneous_connections(graph);

        report.nb_tips += tips;
        report.nb_bubbles += bubbles;
        report.nb_ec += ec;
        report.nb_passes = pass + 1;

        info!(
            "simplify pass {}: {} tips, {} bubbles, {} ec",
            pass + 1,
            tips,
            bubbles,
            ec
        );

        if tips + bubbles + ec == 0 {
            break;
        }
    }

    report
}

fn coverage_or_worst(graph: &UnitigGraph, unitig: u64) -> f64 {
    let coverage = graph.mean_abundance(unitig);
    if coverage <= 0.0 {
        warn!(
            "missing abundance for unitig {}, treated as lowest coverage",
            unitig
        );
        0.0
    } else {
        coverage as f64
    }
}

/// A tip has exactly one extremity of degree zero; short ones go
/// unconditionally, longer ones only when clearly under covered compared
/// to the branch they hang from.
fn remove_tips(graph: &mut UnitigGraph) -> u64 {
    let k = graph.k() as f64;
    let mut deleter = NodesDeleter::new();

    for unitig in graph.live_unitigs().collect::<Vec<u64>>() {
        let node = NodeGU::new(unitig, Strand::Forward);
        let nb_in = graph.in_degree(node);
        let nb_out = graph.out_degree(node);

        if (nb_in == 0) == (nb_out == 0) {
            continue;
        }

        let length = graph.length(unitig) as f64;

        if length < TIP_TOPO_KMULT * k {
            deleter.mark_unitig(unitig);
            continue;
        }

        if length < TIP_RCTC_KMULT * k {
            let connected = if nb_out > 0 {
                Direction::Outcoming
            } else {
                Direction::Incoming
            };

            let neighbors = graph.neighbors(node, connected);
            let mean_neighbor = neighbors
                .iter()
                .map(|edge| coverage_or_worst(graph, edge.to.unitig))
                .sum::<f64>()
                / neighbors.len() as f64;

            if coverage_or_worst(graph, unitig) < TIP_RCTC * mean_neighbor {
                deleter.mark_unitig(unitig);
            }
        }
    }

    deleter.apply(graph)
}

/// Monument traversal around every out branching node; a validated bubble
/// keeps its most abundant path, the others are deleted and the kept path
/// receives the averaged abundance of the merged inputs.
fn pop_bubbles(graph: &mut UnitigGraph) -> u64 {
    let monument = Monument::default();
    let mut terminator = Terminator::new();

    let mut deleter = NodesDeleter::new();
    let mut patches: Vec<(u64, f32)> = Vec::new();

    for unitig in graph.live_unitigs().collect::<Vec<u64>>() {
        for &strand in &[Strand::Forward, Strand::Reverse] {
            let node = NodeGU::new(unitig, strand);

            if terminator.is_marked(unitig) || graph.out_degree(node) < 2 {
                continue;
            }

            let result = match monument.explore_branching(
                graph,
                &mut terminator,
                Direction::Outcoming,
                node,
                None,
            ) {
                Some(result) => result,
                None => continue,
            };

            if result.paths.len() < 2 {
                continue;
            }

            let chosen: FxHashSet<u64> = result
                .chosen
                .nodes
                .iter()
                .map(|step| step.unitig)
                .collect();

            let merged_abundance = result
                .paths
                .iter()
                .map(|path| {
                    let mut nodes = vec![node];
                    nodes.extend_from_slice(&path.nodes);
                    graph.path_abundance(&nodes)
                })
                .sum::<f64>()
                / result.paths.len() as f64;

            for path in &result.paths {
                for step in &path.nodes {
                    if step.unitig != result.end.unitig && !chosen.contains(&step.unitig) {
                        deleter.mark_node(*step);
                    }
                }
            }

            for step in &result.chosen.nodes {
                if step.unitig != result.end.unitig {
                    patches.push((step.unitig, merged_abundance as f32));
                }
            }
        }
    }

    let removed = deleter.apply(graph);
    if removed > 0 {
        for (unitig, abundance) in patches {
            if !graph.is_deleted(unitig) {
                graph.set_mean_abundance(unitig, abundance);
            }
        }
    }

    removed
}

/// An erroneous connection is a short, weakly covered unitig strung
/// between two branching regions: its removal leaves both sides attached
/// to the rest of the graph.
fn remove_erroneous_connections(graph: &mut UnitigGraph) -> u64 {
    let k = graph.k() as f64;
    let mut deleter = NodesDeleter::new();

    for unitig in graph.live_unitigs().collect::<Vec<u64>>() {
        let node = NodeGU::new(unitig, Strand::Forward);

        let ins = graph.neighbors(node, Direction::Incoming);
        let outs = graph.neighbors(node, Direction::Outcoming);
        if ins.is_empty() || outs.is_empty() {
            continue;
        }

        let branching_in = ins
            .iter()
            .any(|edge| graph.degree(edge.to, Direction::Outcoming) > 1);
        let branching_out = outs
            .iter()
            .any(|edge| graph.degree(edge.to, Direction::Incoming) > 1);
        if !branching_in || !branching_out {
            continue;
        }

        if graph.length(unitig) as f64 >= EC_LEN_KMULT * k {
            continue;
        }

        let mut neighborhood: Vec<f64> = ins
            .iter()
            .chain(outs.iter())
            .map(|edge| coverage_or_worst(graph, edge.to.unitig))
            .collect();
        neighborhood.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = neighborhood[neighborhood.len() / 2];

        if coverage_or_worst(graph, unitig) < median / EC_RCTC {
            deleter.mark_unitig(unitig);
        }
    }

    deleter.apply(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn graph_of(fasta: &str, k: usize) -> UnitigGraph {
        UnitigGraph::from_reader(Cursor::new(fasta), k).unwrap()
    }

    /// chain 0 -> 1 -> 2 with a short tip 3 on 1, k=5
    fn tip_fasta() -> &'static str {
        ">0 LN:i:14 ka:f:9.0 L:+:1:+\nTTGGTCAATAACCG\n\
         >1 LN:i:7 ka:f:9.0 L:-:0:- L:+:2:+ L:+:3:+\nACCGATT\n\
         >2 LN:i:20 ka:f:9.0 L:-:1:-\nGATTCCATGGACCATTGACA\n\
         >3 LN:i:5 ka:f:1.0 L:-:1:-\nGATTA\n"
    }

    /// bubble 0 -> {1,2} -> 3 with long flanks, k=5
    fn bubble_fasta() -> &'static str {
        ">0 LN:i:16 ka:f:9.0 L:+:1:+ L:+:2:+\nCCGGTTCAGGAATGCA\n\
         >1 LN:i:10 ka:f:9.0 L:-:0:- L:+:3:+\nTGCATTACCG\n\
         >2 LN:i:10 ka:f:3.0 L:-:0:- L:+:3:+\nTGCATAACCG\n\
         >3 LN:i:16 ka:f:9.0 L:-:1:- L:-:2:-\nACCGAATGGCCATTGG\n"
    }

    /// a weak connection 1 between two branching regions, k=5
    fn ec_fasta() -> &'static str {
        ">0 LN:i:14 ka:f:9.0 L:+:1:+ L:+:2:+\nTTGGTCAATAACCG\n\
         >1 LN:i:7 ka:f:1.0 L:-:0:- L:+:3:+\nACCGGTT\n\
         >2 LN:i:14 ka:f:9.0 L:-:0:-\nACCGTATGGCATCC\n\
         >3 LN:i:14 ka:f:9.0 L:-:1:- L:-:4:-\nGGTTACCAGATTCC\n\
         >4 LN:i:14 ka:f:9.0 L:+:3:+\nTCCATGACCAGGTT\n"
    }

    #[test]
    fn tip_is_clipped() {
        let mut graph = graph_of(tip_fasta(), 5);
        let report = simplify(&mut graph, 10);

        assert_eq!(report.nb_tips, 1);
        assert!(graph.is_deleted(3));
        assert!(!graph.is_deleted(0));
        assert!(!graph.is_deleted(1));
        assert!(!graph.is_deleted(2));

        // the chain is whole again
        let path = graph.simple_path_longest(
            NodeGU::new(0, Strand::Forward),
            Direction::Outcoming,
            false,
        );
        assert_eq!(path.nodes.len(), 3);
    }

    #[test]
    fn bubble_keeps_most_abundant_path() {
        let mut graph = graph_of(bubble_fasta(), 5);
        let report = simplify(&mut graph, 10);

        assert!(report.nb_bubbles >= 1);
        assert!(graph.is_deleted(2));
        assert!(!graph.is_deleted(1));

        // kept path abundance was averaged over the merged inputs
        let patched = graph.mean_abundance(1);
        assert!(patched > 3.0 && patched < 9.5, "patched = {}", patched);

        // the surviving graph spells the high coverage contig
        let path = graph.simple_path_longest(
            NodeGU::new(0, Strand::Forward),
            Direction::Outcoming,
            false,
        );
        let seq = graph.path_sequence(&path.nodes);
        assert_eq!(seq, b"CCGGTTCAGGAATGCATTACCGAATGGCCATTGG");
    }

    #[test]
    fn erroneous_connection_is_removed() {
        let mut graph = graph_of(ec_fasta(), 5);
        let report = simplify(&mut graph, 10);

        assert!(report.nb_ec >= 1);
        assert!(graph.is_deleted(1));
        for unitig in [0u64, 2, 3, 4].iter() {
            assert!(!graph.is_deleted(*unitig), "unitig {} deleted", unitig);
        }
    }

    #[test]
    fn simplify_is_monotone_and_idempotent() {
        let mut graph = graph_of(bubble_fasta(), 5);

        simplify(&mut graph, 10);
        let deleted_after_first = graph.nb_deleted();
        let live: Vec<u64> = graph.live_unitigs().collect();

        let report = simplify(&mut graph, 10);
        assert_eq!(report.nb_tips + report.nb_bubbles + report.nb_ec, 0);
        assert_eq!(graph.nb_deleted(), deleted_after_first);
        assert_eq!(graph.live_unitigs().collect::<Vec<u64>>(), live);
    }

    #[test]
    fn equal_coverage_long_tip_survives() {
        // tip shaped end of a chain, longer than the topological bound and
        // as covered as its neighbor: kept
        let fasta = ">0 LN:i:14 ka:f:9.0 L:+:1:+\nTTGGTCAATAACCG\n\
                     >1 LN:i:7 ka:f:9.0 L:-:0:- L:+:2:+\nACCGATT\n\
                     >2 LN:i:20 ka:f:9.0 L:-:1:-\nGATTCCATGGACCATTGACA\n";
        let mut graph = graph_of(fasta, 5);
        let report = simplify(&mut graph, 10);

        assert_eq!(report.nb_tips, 0);
        assert_eq!(graph.nb_deleted(), 0);
    }
}
