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

//! Traversal engines: the BFS frontline, its branching aware variant, and
//! the monument traversal that finds where a branching collapses, lists
//! every path in between, validates the set and picks the most abundant
//! path as the consensus.

/* std use */
use std::collections::VecDeque;

/* crate use */
use rustc_hash::FxHashSet;

/* local use */
use crate::unitig::{Direction, NodeGU, UnitigGraph};

const FRONTLINE_BREADTH: usize = 10;
const IN_BRANCHING_DEPTH_K: usize = 3;

/// Marked nodes shared between traversals, a popped bubble marks its
/// alternative paths so later traversals stop on them.
#[derive(Default)]
pub struct Terminator {
    marked: FxHashSet<u64>,
    enabled: bool,
}

impl Terminator {
    pub fn new() -> Self {
        Terminator {
            marked: FxHashSet::default(),
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Terminator {
            marked: FxHashSet::default(),
            enabled: false,
        }
    }

    pub fn is_marked(&self, unitig: u64) -> bool {
        self.enabled && self.marked.contains(&unitig)
    }

    pub fn mark(&mut self, unitig: u64) {
        if self.enabled {
            self.marked.insert(unitig);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    Marked,
    InBranchingDepth,
    InBranchingBreadth,
    InBranchingOther,
}

struct FrontlineNode {
    node: NodeGU,
    /// first branch this node descends from, propagated layer to layer
    origin: Option<NodeGU>,
}

/// One BFS layer of equal depth nodes.
pub struct Frontline<'a> {
    direction: Direction,
    graph: &'a UnitigGraph,
    queue: VecDeque<FrontlineNode>,
    already: FxHashSet<u64>,
    depth: u32,
    check_in_branching: bool,
    pub stopped_reason: Option<StopReason>,
}

impl<'a> Frontline<'a> {
    pub fn new(direction: Direction, graph: &'a UnitigGraph, start: NodeGU) -> Self {
        let mut already = FxHashSet::default();
        already.insert(start.unitig);

        let mut queue = VecDeque::new();
        queue.push_back(FrontlineNode {
            node: start,
            origin: None,
        });

        Frontline {
            direction,
            graph,
            queue,
            already,
            depth: 0,
            check_in_branching: false,
            stopped_reason: None,
        }
    }

    /// The branching variant refuses large in-branchings at each new node.
    pub fn branching(
        direction: Direction,
        graph: &'a UnitigGraph,
        start: NodeGU,
        previous: Option<NodeGU>,
    ) -> Self {
        let mut frontline = Frontline::new(direction, graph, start);
        frontline.check_in_branching = true;
        if let Some(previous) = previous {
            frontline.already.insert(previous.unitig);
        }
        frontline
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn front(&self) -> Option<NodeGU> {
        self.queue.front().map(|entry| entry.node)
    }

    /// Extend every node of the layer at once into a new layer. False when
    /// a stop condition fired, with the reason recorded.
    pub fn go_next_depth(
        &mut self,
        terminator: &Terminator,
        involved: Option<&mut FxHashSet<NodeGU>>,
    ) -> bool {
        self.stopped_reason = None;
        let mut new_queue: VecDeque<FrontlineNode> = VecDeque::new();
        let mut involved = involved;

        while let Some(current) = self.queue.pop_front() {
            if self.depth > 0 && self.check_in_branching && !self.check(current.node) {
                return false;
            }

            for edge in self.graph.neighbors(current.node, self.direction) {
                if self.already.contains(&edge.to.unitig) {
                    continue;
                }

                if terminator.is_marked(edge.to.unitig) {
                    self.stopped_reason = Some(StopReason::Marked);
                    return false;
                }

                let origin = current.origin.or(Some(edge.to));
                new_queue.push_back(FrontlineNode {
                    node: edge.to,
                    origin,
                });
                self.already.insert(edge.to.unitig);

                if let Some(set) = involved.as_deref_mut() {
                    set.insert(edge.to);
                }
            }
        }

        self.queue = new_queue;
        self.depth += 1;

        true
    }

    /// Recursive check for a large in-branching entering the path sideways:
    /// a plain frontline started from each unexpected predecessor must die
    /// out within bounded depth and breadth.
    fn check(&mut self, node: NodeGU) -> bool {
        let actual = node.reverse();

        for edge in self.graph.neighbors(actual, self.direction) {
            if self.already.contains(&edge.to.unitig) {
                continue;
            }

            let mut inner = Frontline::new(self.direction, self.graph, edge.to);
            inner.already.insert(actual.unitig);
            let terminator = Terminator::disabled();

            loop {
                if !inner.go_next_depth(&terminator, None) {
                    self.stopped_reason = Some(StopReason::InBranchingOther);
                    break;
                }

                if inner.depth() as usize > IN_BRANCHING_DEPTH_K * self.graph.k() {
                    self.stopped_reason = Some(StopReason::InBranchingDepth);
                    break;
                }

                if inner.size() > FRONTLINE_BREADTH {
                    self.stopped_reason = Some(StopReason::InBranchingBreadth);
                    break;
                }

                if inner.size() == 0 {
                    break;
                }
            }

            if inner.size() > 0 {
                return false;
            }
        }

        true
    }
}

/// A frontline that records unexpected parents instead of failing, for a
/// later reachability verdict.
pub struct ReachableFrontline<'a> {
    inner: Frontline<'a>,
    check_later: FxHashSet<NodeGU>,
}

impl<'a> ReachableFrontline<'a> {
    pub fn new(direction: Direction, graph: &'a UnitigGraph, start: NodeGU) -> Self {
        ReachableFrontline {
            inner: Frontline::new(direction, graph, start),
            check_later: FxHashSet::default(),
        }
    }

    pub fn go_next_depth(&mut self, terminator: &Terminator) -> bool {
        // record side parents of the new layer before extending
        let nodes: Vec<NodeGU> = self.inner.queue.iter().map(|entry| entry.node).collect();
        for node in nodes {
            for edge in self.inner.graph.neighbors(node.reverse(), self.inner.direction) {
                if !self.inner.already.contains(&edge.to.unitig) {
                    self.check_later.insert(edge.to);
                }
            }
        }

        self.inner.go_next_depth(terminator, None)
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn depth(&self) -> u32 {
        self.inner.depth()
    }

    /// True when every recorded parent ended up visited anyway.
    pub fn is_reachable(&self) -> bool {
        self.check_later
            .iter()
            .all(|node| self.inner.already.contains(&node.unitig))
    }
}

/// Needleman Wunsch identity of two sequences, normalized by the longer
/// one. Gap -5, mismatch -5, match +10.
pub fn needleman_wunsch(a: &[u8], b: &[u8]) -> f32 {
    const GAP: f32 = -5.0;
    const MISMATCH: f32 = -5.0;
    const MATCH: f32 = 10.0;

    let score_of = |x: u8, y: u8| if x == y { MATCH } else { MISMATCH };

    let n_a = a.len();
    let n_b = b.len();
    if n_a == 0 || n_b == 0 {
        return if n_a == n_b { 1.0 } else { 0.0 };
    }

    let mut score = vec![vec![0.0f32; n_b + 1]; n_a + 1];
    for (i, row) in score.iter_mut().enumerate() {
        row[0] = GAP * i as f32;
    }
    for j in 0..=n_b {
        score[0][j] = GAP * j as f32;
    }

    for i in 1..=n_a {
        for j in 1..=n_b {
            let diagonal = score[i - 1][j - 1] + score_of(a[i - 1], b[j - 1]);
            let delete = score[i - 1][j] + GAP;
            let insert = score[i][j - 1] + GAP;
            score[i][j] = diagonal.max(delete).max(insert);
        }
    }

    // traceback counting matches
    let mut identity = 0.0f32;
    let mut i = n_a;
    let mut j = n_b;
    while i > 0 && j > 0 {
        let current = score[i][j];
        if (current - (score[i - 1][j - 1] + score_of(a[i - 1], b[j - 1]))).abs() < f32::EPSILON {
            if a[i - 1] == b[j - 1] {
                identity += 1.0;
            }
            i -= 1;
            j -= 1;
        } else if (current - (score[i - 1][j] + GAP)).abs() < f32::EPSILON {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    identity / n_a.max(n_b) as f32
}

/// A path between the branching node and the collapse node, start node
/// excluded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BubblePath {
    pub nodes: Vec<NodeGU>,
}

pub struct ExploreResult {
    pub chosen: BubblePath,
    pub paths: Vec<BubblePath>,
    pub end: NodeGU,
    pub involved: FxHashSet<NodeGU>,
}

/// Monument traversal parameters. Simple paths only is the degenerate
/// setting with depth and breadth of one.
pub struct Monument {
    pub max_depth: usize,
    pub max_breadth: usize,
    pub identity_threshold: u32,
}

impl Default for Monument {
    fn default() -> Self {
        Monument {
            max_depth: 500,
            max_breadth: 20,
            identity_threshold: 90,
        }
    }
}

impl Monument {
    pub fn simple_paths_only() -> Self {
        Monument {
            max_depth: 1,
            max_breadth: 1,
            identity_threshold: 90,
        }
    }

    /// Run a branching frontline until it collapses to a single node.
    pub fn find_end_of_branching(
        &self,
        graph: &UnitigGraph,
        terminator: &Terminator,
        direction: Direction,
        start: NodeGU,
        previous: Option<NodeGU>,
        involved: &mut FxHashSet<NodeGU>,
    ) -> Option<(NodeGU, u32)> {
        let mut frontline = Frontline::branching(direction, graph, start, previous);

        loop {
            if !frontline.go_next_depth(terminator, Some(involved)) {
                return None;
            }

            if frontline.depth() as usize > self.max_depth {
                return None;
            }
            if frontline.size() > self.max_breadth {
                return None;
            }
            if frontline.size() == 0 {
                return None;
            }
            if frontline.size() == 1 {
                break;
            }
        }

        frontline.front().map(|end| (end, frontline.depth()))
    }

    /// Every loop free path between start and end within the depth budget.
    /// None when the breadth explodes or a loop is met.
    #[allow(clippy::too_many_arguments)]
    fn consensuses_between(
        &self,
        graph: &UnitigGraph,
        direction: Direction,
        current: NodeGU,
        end: NodeGU,
        depth_budget: i64,
        used: &mut FxHashSet<u64>,
        prefix: &mut Vec<NodeGU>,
        output: &mut Vec<BubblePath>,
    ) -> bool {
        if depth_budget < -1 {
            return false;
        }

        if current.unitig == end.unitig {
            output.push(BubblePath {
                nodes: prefix.clone(),
            });
            return output.len() <= self.max_breadth;
        }

        for edge in graph.neighbors(current, direction) {
            if used.contains(&edge.to.unitig) {
                return false;
            }

            used.insert(edge.to.unitig);
            prefix.push(edge.to);

            let keep_going = self.consensuses_between(
                graph,
                direction,
                edge.to,
                end,
                depth_budget - 1,
                used,
                prefix,
                output,
            );

            prefix.pop();
            used.remove(&edge.to.unitig);

            if !keep_going {
                return false;
            }
        }

        true
    }

    fn validate(
        &self,
        graph: &UnitigGraph,
        start: NodeGU,
        paths: &[BubblePath],
    ) -> Option<BubblePath> {
        if paths.is_empty() {
            return None;
        }

        let spelled: Vec<Vec<u8>> = paths
            .iter()
            .map(|path| graph.path_sequence(&path.nodes))
            .collect();

        let mean = spelled.iter().map(|seq| seq.len()).sum::<usize>() as f64 / spelled.len() as f64;
        let stdev = (spelled
            .iter()
            .map(|seq| (seq.len() as f64 - mean).powi(2))
            .sum::<f64>()
            / spelled.len() as f64)
            .sqrt();

        // large bubbles are not traversed
        if mean > self.max_depth as f64 * graph.k() as f64 {
            return None;
        }

        // a single path here means the others were large deadends
        if spelled.len() == 1 && mean > (graph.k() + 1) as f64 {
            return None;
        }

        if stdev > mean / 5.0 {
            return None;
        }

        for first in 0..spelled.len() {
            for second in first + 1..spelled.len() {
                let identity = needleman_wunsch(&spelled[first], &spelled[second]) * 100.0;
                if (identity as u32) < self.identity_threshold {
                    return None;
                }
            }
        }

        // the most abundant path wins
        let mut best = 0;
        let mut best_abundance = f64::MIN;
        for (index, path) in paths.iter().enumerate() {
            let mut with_start = vec![start];
            with_start.extend_from_slice(&path.nodes);
            let abundance = graph.path_abundance(&with_start);
            if abundance > best_abundance {
                best_abundance = abundance;
                best = index;
            }
        }

        Some(paths[best].clone())
    }

    /// Full bubble exploration from a branching node: find the collapse
    /// node, enumerate, validate, mark every involved extension.
    pub fn explore_branching(
        &self,
        graph: &UnitigGraph,
        terminator: &mut Terminator,
        direction: Direction,
        start: NodeGU,
        previous: Option<NodeGU>,
    ) -> Option<ExploreResult> {
        let mut involved = FxHashSet::default();

        let (end, depth) = self.find_end_of_branching(
            graph,
            terminator,
            direction,
            start,
            previous,
            &mut involved,
        )?;

        let mut paths = Vec::new();
        let mut used = FxHashSet::default();
        used.insert(start.unitig);
        let mut prefix = Vec::new();

        let complete = self.consensuses_between(
            graph,
            direction,
            start,
            end,
            depth as i64 + 1,
            &mut used,
            &mut prefix,
            &mut paths,
        );
        if !complete || paths.is_empty() {
            return None;
        }

        let chosen = self.validate(graph, start, &paths)?;

        for node in &involved {
            terminator.mark(node.unitig);
        }

        Some(ExploreResult {
            chosen,
            paths,
            end,
            involved,
        })
    }
}

/// How far the contig producing traversal is allowed to look.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraversalKind {
    None,
    Unitig,
    Contig,
}

impl std::str::FromStr for TraversalKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, String> {
        match value {
            "none" => Ok(TraversalKind::None),
            "unitig" => Ok(TraversalKind::Unitig),
            "contig" => Ok(TraversalKind::Contig),
            other => Err(format!("'{}' isn't a traversal kind", other)),
        }
    }
}

/// Assemble contigs: walk each untraversed simple path end to end; in
/// contig mode validated bubbles are crossed with the monument consensus.
pub fn assemble(graph: &mut crate::unitig::UnitigGraph, kind: TraversalKind) -> Vec<Vec<u8>> {
    let mut contigs = Vec::new();
    if kind == TraversalKind::None {
        return contigs;
    }

    graph.reset_traversed();
    let monument = Monument::default();
    let mut terminator = Terminator::new();

    for unitig in graph.live_unitigs().collect::<Vec<u64>>() {
        if graph.is_traversed(unitig) {
            continue;
        }

        // walk backward to the start of the simple path
        let seed = crate::unitig::NodeGU::new(unitig, crate::unitig::Strand::Reverse);
        let backward = graph.simple_path_longest(seed, Direction::Outcoming, false);
        let start = backward.nodes.last().copied().unwrap_or(seed).reverse();

        let forward = graph.simple_path_longest(start, Direction::Outcoming, true);
        let mut nodes = forward.nodes;
        let mut ending = forward.ending;

        if kind == TraversalKind::Contig {
            while ending == crate::unitig::PathAdvance::OutBranching {
                let current = *nodes.last().unwrap();
                let explored = match monument.explore_branching(
                    graph,
                    &mut terminator,
                    Direction::Outcoming,
                    current,
                    None,
                ) {
                    Some(result) => result,
                    None => break,
                };

                for step in &explored.involved {
                    graph.set_traversed(step.unitig);
                }
                nodes.extend_from_slice(&explored.chosen.nodes);

                let next = graph.simple_path_longest(explored.end, Direction::Outcoming, true);
                nodes.extend_from_slice(&next.nodes[1..]);
                ending = next.ending;
            }
        }

        contigs.push(graph.path_sequence(&nodes));
    }

    contigs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unitig::Strand;
    use std::io::Cursor;

    /// A bubble, k=5:
    ///   0 --> 1 --> 3
    ///   0 --> 2 --> 3
    /// seq0 = AATGCA, middles differ by one nucleotide, seq3 closes.
    /// seq1 = TGCATTACCG, seq2 = TGCATAACCG, seq3 = ACCGAAT
    fn bubble_fasta() -> &'static str {
        ">0 LN:i:6 ka:f:9.0 L:+:1:+ L:+:2:+\nAATGCA\n\
         >1 LN:i:10 ka:f:9.0 L:-:0:- L:+:3:+\nTGCATTACCG\n\
         >2 LN:i:10 ka:f:3.0 L:-:0:- L:+:3:+\nTGCATAACCG\n\
         >3 LN:i:7 ka:f:9.0 L:-:1:- L:-:2:-\nACCGAAT\n"
    }

    fn bubble() -> UnitigGraph {
        UnitigGraph::from_reader(Cursor::new(bubble_fasta()), 5).unwrap()
    }

    #[test]
    fn needleman_wunsch_identity() {
        assert!((needleman_wunsch(b"ACGT", b"ACGT") - 1.0).abs() < 1e-6);
        assert!(needleman_wunsch(b"ACGT", b"TTTT") < 0.5);

        // one mismatch over ten positions
        let identity = needleman_wunsch(b"ACGTACGTAC", b"ACGTTCGTAC");
        assert!((identity - 0.9).abs() < 1e-6);
    }

    #[test]
    fn frontline_layers() {
        let graph = bubble();
        let terminator = Terminator::disabled();

        let start = NodeGU::new(0, Strand::Forward);
        let mut frontline = Frontline::new(Direction::Outcoming, &graph, start);
        assert_eq!(frontline.size(), 1);

        assert!(frontline.go_next_depth(&terminator, None));
        assert_eq!(frontline.size(), 2); // the two bubble arms

        assert!(frontline.go_next_depth(&terminator, None));
        assert_eq!(frontline.size(), 1); // collapsed on 3
        assert_eq!(frontline.front(), Some(NodeGU::new(3, Strand::Forward)));
    }

    #[test]
    fn frontline_stops_on_marked() {
        let graph = bubble();
        let mut terminator = Terminator::new();
        terminator.mark(1);

        let start = NodeGU::new(0, Strand::Forward);
        let mut frontline = Frontline::new(Direction::Outcoming, &graph, start);

        assert!(!frontline.go_next_depth(&terminator, None));
        assert_eq!(frontline.stopped_reason, Some(StopReason::Marked));
    }

    #[test]
    fn find_end_of_bubble() {
        let graph = bubble();
        let terminator = Terminator::disabled();
        let monument = Monument::default();

        let start = NodeGU::new(0, Strand::Forward);
        let mut involved = FxHashSet::default();
        let found = monument.find_end_of_branching(
            &graph,
            &terminator,
            Direction::Outcoming,
            start,
            None,
            &mut involved,
        );

        let (end, _) = found.expect("bubble end not found");
        assert_eq!(end.unitig, 3);
        assert!(involved.iter().any(|node| node.unitig == 1));
        assert!(involved.iter().any(|node| node.unitig == 2));
    }

    #[test]
    fn explore_picks_most_abundant() {
        let graph = bubble();
        let mut terminator = Terminator::new();
        let monument = Monument::default();

        let start = NodeGU::new(0, Strand::Forward);
        let result = monument
            .explore_branching(&graph, &mut terminator, Direction::Outcoming, start, None)
            .expect("bubble not validated");

        assert_eq!(result.paths.len(), 2);
        assert_eq!(result.end.unitig, 3);
        // unitig 1 has abundance 9, unitig 2 only 3
        assert!(result.chosen.nodes.iter().any(|node| node.unitig == 1));

        // alternatives were marked
        assert!(terminator.is_marked(2));
    }

    #[test]
    fn assemble_unitig_mode_stops_at_branchings() {
        let mut graph = bubble();
        let contigs = assemble(&mut graph, TraversalKind::Unitig);
        assert_eq!(contigs.len(), 4);
    }

    #[test]
    fn assemble_contig_mode_crosses_the_bubble() {
        let mut graph = bubble();
        let contigs = assemble(&mut graph, TraversalKind::Contig);

        assert_eq!(contigs.len(), 1);
        assert_eq!(contigs[0], b"AATGCATTACCGAAT");
    }

    #[test]
    fn reachable_frontline() {
        let graph = bubble();
        let terminator = Terminator::disabled();

        let start = NodeGU::new(0, Strand::Forward);
        let mut frontline = ReachableFrontline::new(Direction::Outcoming, &graph, start);

        while frontline.size() > 0 {
            if !frontline.go_next_depth(&terminator) {
                break;
            }
            if frontline.depth() > 10 {
                break;
            }
        }

        assert!(frontline.is_reachable());
    }
}
