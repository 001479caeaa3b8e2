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

//! The unitig graph: arrays indexed by unitig id, prefix summed adjacency
//! of packed extremity entries, logical deletion through bitsets. A node is
//! an oriented unitig, edges are the (k-1)-overlap links produced by the
//! linking pass.

/* std use */
use std::io::BufRead;

/* crate use */
use anyhow::{Context, Result};
use rustc_hash::FxHashSet;

/* local use */
use crate::error::Error;
use crate::kmer;
use crate::storage::{BuildState, GraphStorage};

/// Which extremity of a unitig holds a boundary kmer. `Both` marks unitigs
/// of length exactly k, whose two extremities coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitigPos {
    Begin = 0,
    End = 1,
    Both = 2,
}

/// `(unitig, rc, pos)` packed into one integer: 61 bits of id, one reverse
/// flag, two position bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtremityInfo {
    pub unitig: u64,
    pub rc: bool,
    pub pos: UnitigPos,
}

impl ExtremityInfo {
    pub fn pack(&self) -> u64 {
        (self.unitig << 3) | ((self.rc as u64) << 2) | self.pos as u64
    }

    pub fn unpack(packed: u64) -> Self {
        ExtremityInfo {
            unitig: packed >> 3,
            rc: packed & 0b100 != 0,
            pos: match packed & 0b11 {
                0 => UnitigPos::Begin,
                1 => UnitigPos::End,
                _ => UnitigPos::Both,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn flip(self) -> Strand {
        match self {
            Strand::Forward => Strand::Reverse,
            Strand::Reverse => Strand::Forward,
        }
    }
}

/// An oriented unitig. Both extremities of the unitig share this value,
/// the strand says in which direction its sequence is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeGU {
    pub unitig: u64,
    pub strand: Strand,
}

impl NodeGU {
    pub fn new(unitig: u64, strand: Strand) -> Self {
        NodeGU { unitig, strand }
    }

    pub fn reverse(self) -> NodeGU {
        NodeGU {
            unitig: self.unitig,
            strand: self.strand.flip(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outcoming,
    Incoming,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Outcoming => Direction::Incoming,
            Direction::Incoming => Direction::Outcoming,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeGU {
    pub from: NodeGU,
    pub to: NodeGU,
    pub direction: Direction,
}

/// Result of one step along a simple path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathAdvance {
    Ok(EdgeGU),
    DeadEnd,
    OutBranching,
    InBranching(EdgeGU),
}

pub struct UnitigGraph {
    k: usize,
    seqs: Vec<String>,
    mean_abundance: Vec<f32>,
    incoming: Vec<u64>,
    incoming_offsets: Vec<u64>,
    outcoming: Vec<u64>,
    outcoming_offsets: Vec<u64>,
    deleted: bv::BitVec<u64>,
    traversed: bv::BitVec<u64>,
}

impl UnitigGraph {
    /// Parse the linked unitig records: `>id LN:i:<len> ka:f:<ab> L:±:<id>:± …`.
    /// Record ids are authoritative: a hole in the id space (a cleaned
    /// graph written back to disk) loads as a deleted unitig.
    pub fn from_reader<R: BufRead>(reader: R, k: usize) -> Result<Self> {
        let mut entries: Vec<(u64, String, f32, Vec<u64>, Vec<u64>)> = Vec::new();

        for record in bio::io::fasta::Reader::from_bufread(reader).records() {
            let record = record.with_context(|| Error::ReadingError {
                filename: "unitigs.fa".to_string(),
            })?;

            let id: u64 = record.id().parse().map_err(|_| Error::ReadingError {
                filename: "unitigs.fa".to_string(),
            })?;

            let mut abundance = 0.0f32;
            let mut incoming = Vec::new();
            let mut outcoming = Vec::new();

            for token in record.desc().unwrap_or("").split_whitespace() {
                if let Some(value) = token.strip_prefix("ka:f:") {
                    abundance = value.parse().unwrap_or(0.0);
                } else if let Some(link) = token.strip_prefix("L:") {
                    let fields: Vec<&str> = link.split(':').collect();
                    if fields.len() != 3 {
                        continue;
                    }

                    let outgoing = fields[0] == "+";
                    let neighbor: u64 = match fields[1].parse() {
                        Ok(value) => value,
                        Err(_) => continue,
                    };
                    // the sign says which end of the neighbor sits at the
                    // junction: '-' its end, '+' its begin
                    let pos = if fields[2] == "-" {
                        UnitigPos::End
                    } else {
                        UnitigPos::Begin
                    };

                    // rc: neighbor read reverse on the forward strand walk
                    let entry = if outgoing {
                        ExtremityInfo {
                            unitig: neighbor,
                            rc: pos == UnitigPos::End,
                            pos,
                        }
                    } else {
                        ExtremityInfo {
                            unitig: neighbor,
                            rc: pos == UnitigPos::Begin,
                            pos,
                        }
                    };

                    if outgoing {
                        outcoming.push(entry.pack());
                    } else {
                        incoming.push(entry.pack());
                    }
                }
            }

            entries.push((
                id,
                String::from_utf8_lossy(record.seq()).to_string(),
                abundance,
                incoming,
                outcoming,
            ));
        }

        let nb = entries
            .iter()
            .map(|entry| entry.0 + 1)
            .max()
            .unwrap_or(0) as usize;

        let mut seqs = vec![String::new(); nb];
        let mut mean_abundance = vec![0.0f32; nb];
        let mut raw_incoming: Vec<Vec<u64>> = vec![Vec::new(); nb];
        let mut raw_outcoming: Vec<Vec<u64>> = vec![Vec::new(); nb];
        let mut deleted = bv::BitVec::new_fill(true, nb as u64);

        for (id, seq, abundance, incoming, outcoming) in entries {
            seqs[id as usize] = seq;
            mean_abundance[id as usize] = abundance;
            raw_incoming[id as usize] = incoming;
            raw_outcoming[id as usize] = outcoming;
            deleted.set(id, false);
        }

        let mut incoming = Vec::new();
        let mut incoming_offsets = Vec::with_capacity(nb + 1);
        let mut outcoming = Vec::new();
        let mut outcoming_offsets = Vec::with_capacity(nb + 1);

        incoming_offsets.push(0);
        outcoming_offsets.push(0);
        for index in 0..nb {
            incoming.extend_from_slice(&raw_incoming[index]);
            outcoming.extend_from_slice(&raw_outcoming[index]);
            incoming_offsets.push(incoming.len() as u64);
            outcoming_offsets.push(outcoming.len() as u64);
        }

        Ok(UnitigGraph {
            k,
            seqs,
            mean_abundance,
            incoming,
            incoming_offsets,
            outcoming,
            outcoming_offsets,
            deleted,
            traversed: bv::BitVec::new_fill(false, nb as u64),
        })
    }

    pub fn load(storage: &GraphStorage, k: usize) -> Result<Self> {
        storage.require(BuildState::BCALM2_DONE, "bcalm + linktigs")?;
        let reader = storage.open_collection("unitigs.fa")?;
        UnitigGraph::from_reader(reader, k)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn nb_unitigs(&self) -> u64 {
        self.seqs.len() as u64
    }

    pub fn nb_deleted(&self) -> u64 {
        (0..self.seqs.len() as u64)
            .filter(|&unitig| self.deleted.get(unitig))
            .count() as u64
    }

    pub fn is_deleted(&self, unitig: u64) -> bool {
        self.deleted.get(unitig)
    }

    pub fn length(&self, unitig: u64) -> usize {
        self.seqs[unitig as usize].len()
    }

    pub fn mean_abundance(&self, unitig: u64) -> f32 {
        self.mean_abundance[unitig as usize]
    }

    pub fn set_mean_abundance(&mut self, unitig: u64, abundance: f32) {
        self.mean_abundance[unitig as usize] = abundance;
    }

    pub fn is_traversed(&self, unitig: u64) -> bool {
        self.traversed.get(unitig)
    }

    pub fn set_traversed(&mut self, unitig: u64) {
        self.traversed.set(unitig, true);
    }

    pub fn reset_traversed(&mut self) {
        self.traversed = bv::BitVec::new_fill(false, self.seqs.len() as u64);
    }

    /// Iterator over the ids of non deleted unitigs.
    pub fn live_unitigs(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.seqs.len() as u64).filter(move |&unitig| !self.deleted.get(unitig))
    }

    /// Sequence of the node, reverse complemented for the reverse strand.
    pub fn node_seq(&self, node: NodeGU) -> Vec<u8> {
        let seq = self.seqs[node.unitig as usize].as_bytes();
        match node.strand {
            Strand::Forward => seq.to_vec(),
            Strand::Reverse => kmer::revcomp_seq(seq),
        }
    }

    fn adjacency(&self, unitig: u64, outgoing: bool) -> &[u64] {
        let (entries, offsets) = if outgoing {
            (&self.outcoming, &self.outcoming_offsets)
        } else {
            (&self.incoming, &self.incoming_offsets)
        };

        let start = offsets[unitig as usize] as usize;
        let end = offsets[unitig as usize + 1] as usize;
        &entries[start..end]
    }

    /// Neighbor edges of `node` along `direction`, O(degree).
    pub fn neighbors(&self, node: NodeGU, direction: Direction) -> Vec<EdgeGU> {
        // walking the reverse strand swaps the two physical lists
        let outgoing_list = match (node.strand, direction) {
            (Strand::Forward, Direction::Outcoming) => true,
            (Strand::Forward, Direction::Incoming) => false,
            (Strand::Reverse, Direction::Outcoming) => false,
            (Strand::Reverse, Direction::Incoming) => true,
        };

        self.adjacency(node.unitig, outgoing_list)
            .iter()
            .map(|&packed| ExtremityInfo::unpack(packed))
            .filter(|extremity| !self.deleted.get(extremity.unitig))
            .map(|extremity| {
                let forward_strand = if extremity.rc {
                    Strand::Reverse
                } else {
                    Strand::Forward
                };
                let strand = match node.strand {
                    Strand::Forward => forward_strand,
                    Strand::Reverse => forward_strand.flip(),
                };

                EdgeGU {
                    from: node,
                    to: NodeGU::new(extremity.unitig, strand),
                    direction,
                }
            })
            .collect()
    }

    pub fn degree(&self, node: NodeGU, direction: Direction) -> usize {
        self.neighbors(node, direction).len()
    }

    pub fn in_degree(&self, node: NodeGU) -> usize {
        self.degree(node, Direction::Incoming)
    }

    pub fn out_degree(&self, node: NodeGU) -> usize {
        self.degree(node, Direction::Outcoming)
    }

    pub fn is_branching(&self, node: NodeGU) -> bool {
        self.in_degree(node).max(self.out_degree(node)) > 1
    }

    /// The node at the opposite extremity of the unitig along `direction`.
    /// Nodes are whole oriented unitigs here, both extremities share one
    /// value, so this is the node itself.
    pub fn unitig_last_node(&self, node: NodeGU, _direction: Direction) -> NodeGU {
        node
    }

    /// One step along a simple path: `Ok` only when this node has a unique
    /// extension whose target has a unique entry.
    pub fn simple_path_avance(&self, node: NodeGU, direction: Direction) -> PathAdvance {
        let edges = self.neighbors(node, direction);

        match edges.len() {
            0 => PathAdvance::DeadEnd,
            1 => {
                let edge = edges[0];
                if self.degree(edge.to, direction.opposite()) > 1 {
                    PathAdvance::InBranching(edge)
                } else {
                    PathAdvance::Ok(edge)
                }
            }
            _ => PathAdvance::OutBranching,
        }
    }

    /// Walk `avance` repeatedly, accumulating nucleotide length and
    /// coverage, optionally marking traversed unitigs. Stops at the first
    /// non `Ok` step or when a unitig repeats (cycle).
    pub fn simple_path_longest(
        &mut self,
        node: NodeGU,
        direction: Direction,
        mark: bool,
    ) -> SimplePath {
        let mut nodes = vec![node];
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        seen.insert(node.unitig);

        let mut length = self.length(node.unitig);
        let mut weighted = self.mean_abundance(node.unitig) as f64 * self.length(node.unitig) as f64;

        let mut current = node;
        let ending;

        loop {
            match self.simple_path_avance(current, direction) {
                PathAdvance::Ok(edge) => {
                    if seen.contains(&edge.to.unitig) {
                        ending = PathAdvance::DeadEnd;
                        break;
                    }
                    seen.insert(edge.to.unitig);
                    nodes.push(edge.to);

                    length += self.length(edge.to.unitig) - (self.k - 1);
                    weighted +=
                        self.mean_abundance(edge.to.unitig) as f64 * self.length(edge.to.unitig) as f64;
                    current = edge.to;
                }
                other => {
                    ending = other;
                    break;
                }
            }
        }

        if mark {
            for step in &nodes {
                self.set_traversed(step.unitig);
            }
        }

        let total_nt: f64 = nodes
            .iter()
            .map(|step| self.length(step.unitig) as f64)
            .sum();

        SimplePath {
            nodes,
            length,
            coverage: (weighted / total_nt) as f32,
            ending,
        }
    }

    /// Sequence spelled by a path of overlapping nodes.
    pub fn path_sequence(&self, nodes: &[NodeGU]) -> Vec<u8> {
        let mut seq = Vec::new();

        for (index, node) in nodes.iter().enumerate() {
            let part = self.node_seq(*node);
            if index == 0 {
                seq.extend_from_slice(&part);
            } else {
                seq.extend_from_slice(&part[self.k - 1..]);
            }
        }

        seq
    }

    /// Mean abundance of a path, weighted by unitig length.
    pub fn path_abundance(&self, nodes: &[NodeGU]) -> f64 {
        let mut weighted = 0.0f64;
        let mut total = 0.0f64;

        for node in nodes {
            let length = self.length(node.unitig) as f64;
            weighted += self.mean_abundance(node.unitig) as f64 * length;
            total += length;
        }

        if total == 0.0 {
            0.0
        } else {
            weighted / total
        }
    }

    fn delete_unitig(&mut self, unitig: u64) {
        self.deleted.set(unitig, true);
    }

    /// Rewrite the adjacency vectors, dropping entries of and toward
    /// deleted unitigs, keeping the prefix sum scheme intact.
    fn compact_adjacency(&mut self) {
        let nb = self.seqs.len();

        let mut incoming = Vec::with_capacity(self.incoming.len());
        let mut incoming_offsets = Vec::with_capacity(nb + 1);
        let mut outcoming = Vec::with_capacity(self.outcoming.len());
        let mut outcoming_offsets = Vec::with_capacity(nb + 1);

        incoming_offsets.push(0);
        outcoming_offsets.push(0);

        for unitig in 0..nb as u64 {
            if !self.deleted.get(unitig) {
                for &packed in self.adjacency(unitig, false) {
                    if !self.deleted.get(ExtremityInfo::unpack(packed).unitig) {
                        incoming.push(packed);
                    }
                }
                for &packed in self.adjacency(unitig, true) {
                    if !self.deleted.get(ExtremityInfo::unpack(packed).unitig) {
                        outcoming.push(packed);
                    }
                }
            }

            incoming_offsets.push(incoming.len() as u64);
            outcoming_offsets.push(outcoming.len() as u64);
        }

        self.incoming = incoming;
        self.incoming_offsets = incoming_offsets;
        self.outcoming = outcoming;
        self.outcoming_offsets = outcoming_offsets;
    }

    /// GFA with S lines for live unitigs and L lines for their links.
    pub fn write_gfa<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(writer, "H\tVN:Z:1.0")?;

        for unitig in self.live_unitigs() {
            writeln!(
                writer,
                "S\t{}\t{}\tLN:i:{}\tka:f:{:.1}",
                unitig,
                self.seqs[unitig as usize],
                self.length(unitig),
                self.mean_abundance(unitig)
            )?;
        }

        for unitig in self.live_unitigs() {
            let node = NodeGU::new(unitig, Strand::Forward);

            for edge in self.neighbors(node, Direction::Outcoming) {
                writeln!(
                    writer,
                    "L\t{}\t+\t{}\t{}\t{}M",
                    unitig,
                    edge.to.unitig,
                    if edge.to.strand == Strand::Forward { '+' } else { '-' },
                    self.k - 1
                )?;
            }
            for edge in self.neighbors(node.reverse(), Direction::Outcoming) {
                writeln!(
                    writer,
                    "L\t{}\t-\t{}\t{}\t{}M",
                    unitig,
                    edge.to.unitig,
                    if edge.to.strand == Strand::Forward { '+' } else { '-' },
                    self.k - 1
                )?;
            }
        }

        Ok(())
    }

    /// Fasta of the live unitigs, ids kept stable.
    pub fn write_fasta<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        for unitig in self.live_unitigs() {
            let node = NodeGU::new(unitig, Strand::Forward);

            // the link sign records which end of the neighbor sits at the
            // junction: an outgoing neighbor entered forward touches by its
            // begin ('+'), an incoming one by its end ('-')
            let mut links = String::new();
            for edge in self.neighbors(node, Direction::Outcoming) {
                links.push_str(&format!(
                    " L:+:{}:{}",
                    edge.to.unitig,
                    if edge.to.strand == Strand::Forward { '+' } else { '-' }
                ));
            }
            for edge in self.neighbors(node, Direction::Incoming) {
                links.push_str(&format!(
                    " L:-:{}:{}",
                    edge.to.unitig,
                    if edge.to.strand == Strand::Forward { '-' } else { '+' }
                ));
            }

            writeln!(
                writer,
                ">{} LN:i:{} ka:f:{:.1}{}\n{}",
                unitig,
                self.length(unitig),
                self.mean_abundance(unitig),
                links,
                self.seqs[unitig as usize]
            )?;
        }

        Ok(())
    }
}

/// Result of `simple_path_longest`.
pub struct SimplePath {
    pub nodes: Vec<NodeGU>,
    pub length: usize,
    pub coverage: f32,
    pub ending: PathAdvance,
}

/// Buffered logical deletions, applied once so no pass observes a half
/// deleted graph.
pub struct NodesDeleter {
    unitigs: Vec<u64>,
}

impl Default for NodesDeleter {
    fn default() -> Self {
        NodesDeleter::new()
    }
}

impl NodesDeleter {
    pub fn new() -> Self {
        NodesDeleter {
            unitigs: Vec::new(),
        }
    }

    pub fn mark_node(&mut self, node: NodeGU) {
        self.unitigs.push(node.unitig);
    }

    pub fn mark_unitig(&mut self, unitig: u64) {
        self.unitigs.push(unitig);
    }

    pub fn is_empty(&self) -> bool {
        self.unitigs.is_empty()
    }

    pub fn nb_marked(&self) -> usize {
        let mut unitigs = self.unitigs.clone();
        unitigs.sort_unstable();
        unitigs.dedup();
        unitigs.len()
    }

    /// Flip the deleted bits then compact the adjacency slices in place.
    pub fn apply(self, graph: &mut UnitigGraph) -> u64 {
        let mut unitigs = self.unitigs;
        unitigs.sort_unstable();
        unitigs.dedup();

        let mut applied = 0u64;
        for unitig in unitigs {
            if !graph.is_deleted(unitig) {
                graph.delete_unitig(unitig);
                applied += 1;
            }
        }

        if applied > 0 {
            graph.compact_adjacency();
        }

        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Three unitigs in a chain: 0 -> 1 -> 2, k=5.
    /// seq0 = TAACCG, seq1 = ACCGATT, seq2 = GATTC
    fn chain_fasta() -> &'static str {
        ">0 LN:i:6 ka:f:4.0 L:+:1:+\nTAACCG\n\
         >1 LN:i:7 ka:f:6.0 L:-:0:- L:+:2:+\nACCGATT\n\
         >2 LN:i:5 ka:f:2.0 L:-:1:-\nGATTC\n"
    }

    fn chain() -> UnitigGraph {
        UnitigGraph::from_reader(Cursor::new(chain_fasta()), 5).unwrap()
    }

    #[test]
    fn pack_unpack_extremity() {
        for &(unitig, rc, pos) in &[
            (0u64, false, UnitigPos::Begin),
            (42, true, UnitigPos::End),
            (1 << 40, true, UnitigPos::Both),
        ] {
            let extremity = ExtremityInfo { unitig, rc, pos };
            assert_eq!(ExtremityInfo::unpack(extremity.pack()), extremity);
        }
    }

    #[test]
    fn navigation_on_chain() {
        let graph = chain();
        assert_eq!(graph.nb_unitigs(), 3);

        let node0 = NodeGU::new(0, Strand::Forward);
        let out = graph.neighbors(node0, Direction::Outcoming);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, NodeGU::new(1, Strand::Forward));

        assert_eq!(graph.in_degree(node0), 0);
        assert_eq!(graph.out_degree(node0), 1);
        assert!(!graph.is_branching(node0));

        // reverse strand flips direction
        let incoming = graph.neighbors(node0.reverse(), Direction::Incoming);
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].to, NodeGU::new(1, Strand::Reverse));
    }

    #[test]
    fn simple_path_walks_the_chain() {
        let mut graph = chain();
        let node0 = NodeGU::new(0, Strand::Forward);

        assert!(matches!(
            graph.simple_path_avance(node0, Direction::Outcoming),
            PathAdvance::Ok(_)
        ));

        let path = graph.simple_path_longest(node0, Direction::Outcoming, true);
        assert_eq!(path.nodes.len(), 3);
        assert_eq!(path.ending, PathAdvance::DeadEnd);
        // 6 + (7-4) + (5-4) nucleotides
        assert_eq!(path.length, 10);
        assert!(graph.is_traversed(1));

        let seq = graph.path_sequence(&path.nodes);
        assert_eq!(seq, b"TAACCGATTC");
    }

    #[test]
    fn deletion_hides_unitig() {
        let mut graph = chain();

        let mut deleter = NodesDeleter::new();
        deleter.mark_unitig(2);
        assert_eq!(deleter.nb_marked(), 1);
        assert_eq!(deleter.apply(&mut graph), 1);

        assert_eq!(graph.nb_deleted(), 1);
        let node1 = NodeGU::new(1, Strand::Forward);
        assert_eq!(graph.out_degree(node1), 0);

        // adjacency was compacted: no stale entries remain
        let path = graph.simple_path_longest(NodeGU::new(0, Strand::Forward), Direction::Outcoming, false);
        assert_eq!(path.nodes.len(), 2);
    }

    #[test]
    fn deletion_is_idempotent() {
        let mut graph = chain();

        let mut deleter = NodesDeleter::new();
        deleter.mark_unitig(2);
        deleter.mark_unitig(2);
        assert_eq!(deleter.apply(&mut graph), 1);

        let mut deleter = NodesDeleter::new();
        deleter.mark_unitig(2);
        assert_eq!(deleter.apply(&mut graph), 0);
    }

    #[test]
    fn path_abundance_is_weighted() {
        let graph = chain();
        let nodes = vec![NodeGU::new(0, Strand::Forward), NodeGU::new(1, Strand::Forward)];

        let abundance = graph.path_abundance(&nodes);
        let expected = (4.0 * 6.0 + 6.0 * 7.0) / 13.0;
        assert!((abundance - expected).abs() < 1e-6);
    }

    #[test]
    fn fasta_roundtrip_preserves_navigation() {
        let graph = chain();
        let mut out = Vec::new();
        graph.write_fasta(&mut out).unwrap();

        let reloaded = UnitigGraph::from_reader(Cursor::new(out), 5).unwrap();
        assert_eq!(reloaded.nb_unitigs(), graph.nb_unitigs());

        for unitig in 0..3u64 {
            for &strand in &[Strand::Forward, Strand::Reverse] {
                let node = NodeGU::new(unitig, strand);
                assert_eq!(
                    reloaded.neighbors(node, Direction::Outcoming),
                    graph.neighbors(node, Direction::Outcoming)
                );
                assert_eq!(
                    reloaded.neighbors(node, Direction::Incoming),
                    graph.neighbors(node, Direction::Incoming)
                );
            }
        }
    }

    #[test]
    fn fasta_roundtrip_keeps_holes_deleted() {
        let mut graph = chain();
        let mut deleter = NodesDeleter::new();
        deleter.mark_unitig(1);
        deleter.apply(&mut graph);

        let mut out = Vec::new();
        graph.write_fasta(&mut out).unwrap();

        let reloaded = UnitigGraph::from_reader(Cursor::new(out), 5).unwrap();
        assert!(reloaded.is_deleted(1));
        assert!(!reloaded.is_deleted(0));
        assert!(!reloaded.is_deleted(2));
        assert_eq!(reloaded.out_degree(NodeGU::new(0, Strand::Forward)), 0);
    }

    #[test]
    fn gfa_output() {
        let graph = chain();
        let mut out = Vec::new();
        graph.write_gfa(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("H\tVN:Z:1.0"));
        assert_eq!(text.matches("\nS\t").count(), 3);
        assert!(text.contains("L\t0\t+\t1\t+\t4M"));
    }
}
