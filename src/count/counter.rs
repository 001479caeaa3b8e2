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

//! Partition draining: the open addressing counter of the hash mode, the
//! sort and run length pass of the vector mode, the abundance histogram.

/* crate use */
use itertools::Itertools;

/* local use */
use crate::kmer::KmerInt;

/// Open addressing `kmer -> count` table, linear probing, fixed capacity
/// taken from a memory budget. `increment` reports saturation instead of
/// rehashing, the caller turns that into a partition error.
pub struct OaHash<T> {
    keys: Vec<T>,
    counts: Vec<u32>,
    used: bv::BitVec<u64>,
    mask: usize,
    len: usize,
    limit: usize,
}

/// Bytes of one entry, used by both the table and the configure step
/// (the partition count is inflated accordingly in hash mode).
pub fn hash_entry_bytes<T: KmerInt>() -> usize {
    T::BYTES + std::mem::size_of::<u32>()
}

impl<T: KmerInt> OaHash<T> {
    pub fn with_memory(bytes: u64) -> Self {
        let entries = (bytes / hash_entry_bytes::<T>() as u64).max(1024) as usize;
        // round down to a power of two for mask probing
        let capacity = (1usize << (usize::BITS - 1 - entries.leading_zeros())).max(1024);

        OaHash {
            keys: vec![T::zero(); capacity],
            counts: vec![0u32; capacity],
            used: bv::BitVec::new_fill(false, capacity as u64),
            mask: capacity - 1,
            len: 0,
            limit: capacity / 16 * 15,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// False when the table is saturated and the kmer wasn't recorded.
    #[must_use]
    pub fn increment(&mut self, kmer: T) -> bool {
        let mut slot = (kmer.hash64() as usize) & self.mask;

        loop {
            if !self.used.get(slot as u64) {
                if self.len >= self.limit {
                    return false;
                }

                self.used.set(slot as u64, true);
                self.keys[slot] = kmer;
                self.counts[slot] = 1;
                self.len += 1;
                return true;
            }

            if self.keys[slot] == kmer {
                self.counts[slot] = self.counts[slot].saturating_add(1);
                return true;
            }

            slot = (slot + 1) & self.mask;
        }
    }

    pub fn drain(self) -> impl Iterator<Item = (T, u32)> {
        let used = self.used;
        let counts = self.counts;

        self.keys
            .into_iter()
            .enumerate()
            .filter(move |(slot, _)| used.get(*slot as u64))
            .map(move |(slot, kmer)| (kmer, counts[slot]))
    }
}

/// Sort then run length count a full partition.
pub fn count_sorted<T, F>(mut kmers: Vec<T>, mut emit: F)
where
    T: KmerInt,
    F: FnMut(T, u32),
{
    kmers.sort_unstable();

    for (abundance, kmer) in kmers.into_iter().dedup_with_count() {
        emit(kmer, abundance as u32);
    }
}

/// Last histogram bin, every larger abundance is clamped into it.
pub const H_MAX: usize = 10_000;

/// Abundance histogram. Each drain task owns one, they are merged once at
/// the end of the stage.
#[derive(Clone)]
pub struct Histogram {
    bins: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        Histogram {
            bins: vec![0u64; H_MAX + 1],
        }
    }

    pub fn record(&mut self, abundance: u32) {
        self.bins[(abundance as usize).min(H_MAX)] += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (bin, value) in self.bins.iter_mut().zip(other.bins.iter()) {
            *bin += value;
        }
    }

    pub fn get(&self, abundance: usize) -> u64 {
        self.bins[abundance.min(H_MAX)]
    }

    /// Number of distinct counted kmers.
    pub fn nb_distinct(&self) -> u64 {
        self.bins.iter().sum()
    }

    pub fn save<W: std::io::Write>(&self, writer: &mut W) -> anyhow::Result<()> {
        for (abundance, &value) in self.bins.iter().enumerate() {
            if value > 0 {
                writeln!(writer, "{}\t{}", abundance, value)?;
            }
        }
        Ok(())
    }
}
