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

//! One minimizer bucket: sequences seeded with single kmers, two sorted
//! index vectors over their boundary (k-1)-mers, and a two pointer sweep
//! deciding which pairs compact. Only ends whose (k-1)-mer minimizer is the
//! bucket minimizer are indexed, the other ends belong to later buckets.

/* crate use */
use anyhow::Result;

/* local use */
use crate::error::Error;
use crate::kmer;
use crate::kmer::KmerInt;

/// Which end of the sequence, as written, the boundary (k-1)-mer came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone)]
struct KmerIndex<T> {
    unitig: u32,
    kmer: T,
    side: Side,
}

struct BucketSequence {
    seq: Vec<u8>,
    abundances: Vec<u32>,
    redirect: Option<u32>,
}

/// A compacted sequence leaving the bucket.
pub struct CompactedSequence {
    pub seq: Vec<u8>,
    pub abundances: Vec<u32>,
}

pub struct Bucket<T> {
    k: usize,
    overlap: usize,
    minimizer: u32,
    seqs: Vec<BucketSequence>,
    left: Vec<KmerIndex<T>>,
    right: Vec<KmerIndex<T>>,
    indexed_left: Vec<bool>,
    indexed_right: Vec<bool>,
    connected_left: Vec<bool>,
    connected_right: Vec<bool>,
}

impl<T: KmerInt> Bucket<T> {
    pub fn new(k: usize, minimizer: u32) -> Self {
        Bucket {
            k,
            overlap: k - 1,
            minimizer,
            seqs: Vec::new(),
            left: Vec::new(),
            right: Vec::new(),
            indexed_left: Vec::new(),
            indexed_right: Vec::new(),
            connected_left: Vec::new(),
            connected_right: Vec::new(),
        }
    }

    pub fn minimizer(&self) -> u32 {
        self.minimizer
    }

    fn beg_int(&self, seq: &[u8]) -> T {
        kmer::seq2bit(&seq[..self.overlap]).unwrap_or_else(|_| T::zero())
    }

    fn end_int(&self, seq: &[u8]) -> T {
        kmer::seq2bit(&seq[seq.len() - self.overlap..]).unwrap_or_else(|_| T::zero())
    }

    /// Seed or reinsert a sequence. Its boundary (k-1)-mer minimizers decide
    /// which ends are indexed in this bucket.
    pub fn add(&mut self, seq: Vec<u8>, abundances: Vec<u32>, left_min: u32, right_min: u32) {
        debug_assert!(seq.len() >= self.k);
        let index = self.seqs.len() as u32;

        let indexed_left = left_min == self.minimizer;
        let indexed_right = right_min == self.minimizer;

        if indexed_left {
            let direct = self.beg_int(&seq);
            let reverse = kmer::revcomp(direct, self.overlap);

            if direct <= reverse {
                self.left.push(KmerIndex {
                    unitig: index,
                    kmer: direct,
                    side: Side::Left,
                });
            }
            if reverse <= direct {
                self.right.push(KmerIndex {
                    unitig: index,
                    kmer: reverse,
                    side: Side::Left,
                });
            }
        }

        if indexed_right {
            let direct = self.end_int(&seq);
            let reverse = kmer::revcomp(direct, self.overlap);

            if direct <= reverse {
                self.right.push(KmerIndex {
                    unitig: index,
                    kmer: direct,
                    side: Side::Right,
                });
            }
            if reverse <= direct {
                self.left.push(KmerIndex {
                    unitig: index,
                    kmer: reverse,
                    side: Side::Right,
                });
            }
        }

        self.seqs.push(BucketSequence {
            seq,
            abundances,
            redirect: None,
        });
        self.indexed_left.push(indexed_left);
        self.indexed_right.push(indexed_right);
        self.connected_left.push(false);
        self.connected_right.push(false);
    }

    fn mark_connected(&mut self, entry: &KmerIndex<T>) {
        match entry.side {
            Side::Left => self.connected_left[entry.unitig as usize] = true,
            Side::Right => self.connected_right[entry.unitig as usize] = true,
        }
    }

    fn resolve(&self, mut index: u32) -> Result<u32> {
        let mut steps = 0usize;

        while let Some(target) = self.seqs[index as usize].redirect {
            index = target;
            steps += 1;
            if steps > self.seqs.len() {
                return Err(Error::RedirectionCycle.into());
            }
        }

        Ok(index)
    }

    /// The sweep over both sorted index vectors: a (k-1)-mer seen exactly
    /// once on each side joins two different sequences, a multiple match is
    /// a branching point and only flags the ends connected.
    pub fn compact(&mut self) -> Result<()> {
        self.left.sort_unstable_by(|a, b| a.kmer.cmp(&b.kmer));
        self.right.sort_unstable_by(|a, b| a.kmer.cmp(&b.kmer));

        let size_left = self.left.len();
        let size_right = self.right.len();

        let sentinel = KmerIndex {
            unitig: u32::MAX,
            kmer: !T::zero(),
            side: Side::Left,
        };
        self.left.push(sentinel.clone());
        self.right.push(sentinel);

        for index in 0..self.seqs.len() {
            self.connected_left[index] = false;
            self.connected_right[index] = false;
        }

        let mut il = 0usize;
        let mut ir = 0usize;

        while il < size_left && ir < size_right {
            let kl = self.left[il].clone();
            let kr = self.right[ir].clone();

            if kl.kmer == kr.kmer {
                if kl.unitig != kr.unitig {
                    self.mark_connected(&kl);
                    self.mark_connected(&kr);
                }

                let mut go = true;
                il += 1;
                ir += 1;

                if self.left[il].kmer == kl.kmer {
                    go = false;
                    if self.left[il].unitig != self.right[ir].unitig {
                        let entry = self.left[il].clone();
                        self.mark_connected(&entry);
                    }
                    loop {
                        il += 1;
                        if il >= self.left.len() || self.left[il].kmer > kr.kmer {
                            break;
                        }
                    }
                }

                if self.right[ir].kmer == kl.kmer {
                    go = false;
                    if self.left[il.min(self.left.len() - 1)].unitig != self.right[ir].unitig {
                        let entry = self.right[ir].clone();
                        self.mark_connected(&entry);
                    }
                    loop {
                        ir += 1;
                        if ir >= self.right.len() || self.right[ir].kmer > kl.kmer {
                            break;
                        }
                    }
                }

                if go {
                    self.compaction(kl.unitig, kr.unitig, kl.kmer)?;
                }
            } else if kl.kmer < kr.kmer {
                loop {
                    il += 1;
                    if il >= self.left.len() || self.left[il].kmer >= kr.kmer {
                        break;
                    }
                }
            } else {
                loop {
                    ir += 1;
                    if ir >= self.right.len() || self.right[ir].kmer >= kl.kmer {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Join the sequences holding the matched (k-1)-mer, one of four
    /// orientation cases. Redirected slots are resolved first so later
    /// matches land on the surviving sequence.
    fn compaction(&mut self, left_index: u32, right_index: u32, matched: T) -> Result<()> {
        let il = self.resolve(left_index)? as usize;
        let ir = self.resolve(right_index)? as usize;
        if il == ir {
            return Ok(());
        }

        let matched_rc = kmer::revcomp(matched, self.overlap);

        let beg1 = self.beg_int(&self.seqs[il].seq);
        let end2 = self.end_int(&self.seqs[ir].seq);

        // case A: end(right) overlaps beg(left), append left's tail to right
        if beg1 == end2 && (end2 == matched || end2 == matched_rc) {
            let tail = self.seqs[il].seq[self.overlap..].to_vec();
            self.seqs[ir].seq.extend_from_slice(&tail);
            self.seqs[il].redirect = Some(ir as u32);

            self.indexed_right[ir] = self.indexed_right[il];
            self.connected_right[ir] = self.connected_right[il];

            let mut moved = std::mem::take(&mut self.seqs[il].abundances);
            self.seqs[ir].abundances.append(&mut moved);
            return Ok(());
        }

        // case B: beg(right) reverse complements beg(left), flip right first
        let beg2_rc = kmer::revcomp(self.beg_int(&self.seqs[ir].seq), self.overlap);
        if beg1 == beg2_rc && (beg1 == matched || beg1 == matched_rc) {
            self.seqs[ir].seq = kmer::revcomp_seq(&self.seqs[ir].seq);
            self.seqs[ir].abundances.reverse();
            self.indexed_left[ir] = self.indexed_right[ir];
            self.connected_left[ir] = self.connected_right[ir];

            let tail = self.seqs[il].seq[self.overlap..].to_vec();
            self.seqs[ir].seq.extend_from_slice(&tail);
            self.seqs[il].redirect = Some(ir as u32);

            self.indexed_right[ir] = self.indexed_right[il];
            self.connected_right[ir] = self.connected_right[il];

            let mut moved = std::mem::take(&mut self.seqs[il].abundances);
            self.seqs[ir].abundances.append(&mut moved);
            return Ok(());
        }

        let end1 = self.end_int(&self.seqs[il].seq);
        let beg2 = self.beg_int(&self.seqs[ir].seq);

        // case C: end(left) overlaps beg(right), append right's tail to left
        if end1 == beg2 && (end1 == matched || end1 == matched_rc) {
            let tail = self.seqs[ir].seq[self.overlap..].to_vec();
            self.seqs[il].seq.extend_from_slice(&tail);
            self.seqs[ir].redirect = Some(il as u32);

            self.indexed_right[il] = self.indexed_right[ir];
            self.connected_right[il] = self.connected_right[ir];

            let mut moved = std::mem::take(&mut self.seqs[ir].abundances);
            self.seqs[il].abundances.append(&mut moved);
            return Ok(());
        }

        // case D: end(left) reverse complements end(right), flip right first
        let end2_rc = kmer::revcomp(end2, self.overlap);
        if end1 == end2_rc && (end1 == matched || end1 == matched_rc) {
            let reversed = kmer::revcomp_seq(&self.seqs[ir].seq);
            self.seqs[il].seq.extend_from_slice(&reversed[self.overlap..]);
            self.seqs[ir].redirect = Some(il as u32);

            self.indexed_right[il] = self.indexed_left[ir];
            self.connected_right[il] = self.connected_left[ir];

            let mut moved = std::mem::take(&mut self.seqs[ir].abundances);
            moved.reverse();
            self.seqs[il].abundances.append(&mut moved);
            return Ok(());
        }

        Ok(())
    }

    /// Sequences that survived the sweep, in slot order.
    pub fn into_compacted(self) -> Vec<CompactedSequence> {
        self.seqs
            .into_iter()
            .filter(|sequence| sequence.redirect.is_none())
            .map(|sequence| CompactedSequence {
                seq: sequence.seq,
                abundances: sequence.abundances,
            })
            .collect()
    }

    #[cfg(test)]
    fn connected(&self, index: usize) -> (bool, bool) {
        (self.connected_left[index], self.connected_right[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINI: u32 = 0;

    fn seeded(k: usize, kmers: &[&str]) -> Bucket<u64> {
        let mut bucket = Bucket::new(k, MINI);
        for kmer in kmers {
            bucket.add(kmer.as_bytes().to_vec(), vec![1], MINI, MINI);
        }
        bucket
    }

    fn outputs(bucket: Bucket<u64>) -> Vec<String> {
        bucket
            .into_compacted()
            .into_iter()
            .map(|sequence| String::from_utf8(sequence.seq).unwrap())
            .collect()
    }

    #[test]
    fn simple_chain() {
        let mut bucket = seeded(5, &["TAACC", "AACCG", "ACCGA"]);
        bucket.compact().unwrap();

        let seqs = outputs(bucket);
        assert_eq!(seqs.len(), 1);
        assert_eq!(
            kmer::canonical_seq(seqs[0].as_bytes()),
            kmer::canonical_seq(b"TAACCGA")
        );
    }

    #[test]
    fn palindromic_overlap_stays_split() {
        // the shared (k-1)-mer GTAC is its own reverse complement: both ends
        // index on both sides, the match is ambiguous and nothing compacts
        let mut bucket = seeded(5, &["CGTAC", "GTACC"]);
        bucket.compact().unwrap();

        assert_eq!(outputs(bucket).len(), 2);
    }

    #[test]
    fn chain_with_reverse_complement_seed() {
        // GTACG is the reverse complement of CGTAC
        let mut bucket = seeded(5, &["ACGTA", "GTACG"]);
        bucket.compact().unwrap();

        let seqs = outputs(bucket);
        assert_eq!(seqs.len(), 1);
        assert_eq!(
            kmer::canonical_seq(seqs[0].as_bytes()),
            kmer::canonical_seq(b"ACGTAC")
        );
    }

    #[test]
    fn branching_blocks_compaction() {
        // ACGTA and TCGTA both end with CGTA: two right entries for the
        // same (k-1)-mer, nothing may compact with CGTAC
        let mut bucket = seeded(5, &["ACGTA", "TCGTA", "CGTAC"]);
        bucket.compact().unwrap();

        let seqs = outputs(bucket);
        assert_eq!(seqs.len(), 3);
    }

    #[test]
    fn abundances_follow_compaction() {
        let mut bucket: Bucket<u64> = Bucket::new(5, MINI);
        bucket.add(b"ACGTA".to_vec(), vec![7], MINI, MINI);
        bucket.add(b"CGTAC".to_vec(), vec![3], MINI, MINI);
        bucket.compact().unwrap();

        let compacted = bucket.into_compacted();
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].abundances.len(), 2);

        let mut abundances = compacted[0].abundances.clone();
        abundances.sort_unstable();
        assert_eq!(abundances, vec![3, 7]);
    }

    #[test]
    fn unindexed_side_is_left_alone() {
        let mut bucket: Bucket<u64> = Bucket::new(5, MINI);
        // right end belongs to another bucket: no right index entry
        bucket.add(b"ACGTA".to_vec(), vec![1], MINI, MINI + 1);
        bucket.add(b"CGTAC".to_vec(), vec![1], MINI + 1, MINI);
        bucket.compact().unwrap();

        let seqs = outputs(bucket);
        assert_eq!(seqs.len(), 2);
    }

    #[test]
    fn connected_flags_on_branching() {
        let mut bucket = seeded(5, &["ACGTA", "TCGTA", "CGTAC"]);
        bucket.compact().unwrap();

        // the shared (k-1)-mer flags the joined ends as connected
        let (_, right0) = bucket.connected(0);
        let (_, right1) = bucket.connected(1);
        assert!(right0 || right1);
    }
}
