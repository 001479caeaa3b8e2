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

//! Bloom filter over solid kmers. Bits live in atomic words so insertion is
//! lock free, queries are plain loads. The two base hashes are combined as
//! h1 + i*h2 instead of recomputing a hash per function.

/* std use */
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/* crate use */
use anyhow::Result;

/* local use */
use crate::kmer;
use crate::kmer::KmerInt;

const SEED0: u64 = 0x2127_599b_f432_5c37;
const SEED1: u64 = 0x9e37_79b9_7f4a_7c15;

/// Bits spent per solid kmer for the target false positive rate.
pub fn nbits_per_kmer(k: usize) -> f64 {
    let lg2 = std::f64::consts::LN_2;
    (16.0 * k as f64 * lg2 * lg2).ln() / (lg2 * lg2)
}

pub struct Bloom {
    words: Vec<AtomicU64>,
    nb_bits: u64,
    nb_hashes: usize,
}

impl Bloom {
    /// Sized for `solid_count` kmers of size `k`.
    pub fn new(solid_count: u64, k: usize) -> Self {
        let per_kmer = nbits_per_kmer(k);
        let nb_bits = ((solid_count.max(1) as f64 * per_kmer).ceil() as u64).max(64);
        let nb_hashes = (0.7 * per_kmer).floor().max(1.0) as usize;

        Bloom::with_size(nb_bits, nb_hashes)
    }

    pub fn with_size(nb_bits: u64, nb_hashes: usize) -> Self {
        let nb_words = ((nb_bits + 63) / 64) as usize;
        let mut words = Vec::with_capacity(nb_words);
        words.resize_with(nb_words, || AtomicU64::new(0));

        Bloom {
            words,
            nb_bits,
            nb_hashes,
        }
    }

    pub fn nb_bits(&self) -> u64 {
        self.nb_bits
    }

    pub fn nb_hashes(&self) -> usize {
        self.nb_hashes
    }

    fn bit_positions<T: KmerInt>(&self, kmer: T) -> (u64, u64) {
        (
            kmer::hash_with_seed(kmer, SEED0),
            kmer::hash_with_seed(kmer, SEED1) | 1,
        )
    }

    pub fn insert<T: KmerInt>(&self, kmer: T) {
        let (h1, h2) = self.bit_positions(kmer);

        for i in 0..self.nb_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.nb_bits;
            self.words[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    pub fn contains<T: KmerInt>(&self, kmer: T) -> bool {
        let (h1, h2) = self.bit_positions(kmer);

        for i in 0..self.nb_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.nb_bits;
            if self.words[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) == 0 {
                return false;
            }
        }

        true
    }

    /// Batched query over the 8 neighbors of a kmer, used by debloom.
    pub fn contains8<T: KmerInt>(&self, kmers: &[T; 8]) -> [bool; 8] {
        let mut out = [false; 8];
        for (slot, &kmer) in kmers.iter().enumerate() {
            out[slot] = self.contains(kmer);
        }
        out
    }

    /// Blob layout: nb_bits, nb_hashes, the two seeds, then the words.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.nb_bits.to_le_bytes())?;
        writer.write_all(&(self.nb_hashes as u32).to_le_bytes())?;
        writer.write_all(&SEED0.to_le_bytes())?;
        writer.write_all(&SEED1.to_le_bytes())?;

        for word in &self.words {
            writer.write_all(&word.load(Ordering::Relaxed).to_le_bytes())?;
        }

        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut u64_buffer = [0u8; 8];
        let mut u32_buffer = [0u8; 4];

        reader.read_exact(&mut u64_buffer)?;
        let nb_bits = u64::from_le_bytes(u64_buffer);
        reader.read_exact(&mut u32_buffer)?;
        let nb_hashes = u32::from_le_bytes(u32_buffer) as usize;
        reader.read_exact(&mut u64_buffer)?;
        reader.read_exact(&mut u64_buffer)?;

        let bloom = Bloom::with_size(nb_bits, nb_hashes);
        for word in &bloom.words {
            reader.read_exact(&mut u64_buffer)?;
            word.store(u64::from_le_bytes(u64_buffer), Ordering::Relaxed);
        }

        Ok(bloom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::seq2bit;

    #[test]
    fn sizing_formula() {
        // k=31 settles around 11.4 bits per kmer and 7 hashes
        let per_kmer = nbits_per_kmer(31);
        assert!(per_kmer > 11.0 && per_kmer < 13.0);

        let bloom = Bloom::new(1000, 31);
        assert_eq!(bloom.nb_hashes(), (0.7 * per_kmer) as usize);
        assert!(bloom.nb_bits() >= 1000 * per_kmer as u64);
    }

    #[test]
    fn no_false_negative() {
        let bloom = Bloom::new(100, 21);
        let kmers: Vec<u64> = (0..100u64).map(|seed| seed.wrapping_mul(0x5851_f42d)).collect();

        for &kmer in &kmers {
            bloom.insert(kmer);
        }
        for &kmer in &kmers {
            assert!(bloom.contains(kmer));
        }
    }

    #[test]
    fn mostly_absent() {
        let bloom = Bloom::new(100, 21);
        for seed in 0..100u64 {
            bloom.insert(seed.wrapping_mul(0x5851_f42d));
        }

        let false_positives = (0..10_000u64)
            .map(|value| value.wrapping_mul(0x9e37_79b9).wrapping_add(12345))
            .filter(|&value| bloom.contains(value))
            .count();

        // expected rate is far below 5%
        assert!(false_positives < 500);
    }

    #[test]
    fn batched_query() {
        let bloom = Bloom::new(10, 5);
        let kmer: u64 = seq2bit(b"ACGTA").unwrap();
        let neighbors = crate::kmer::neighbors(kmer, 5);

        bloom.insert(neighbors[0]);
        bloom.insert(neighbors[5]);

        let hits = bloom.contains8(&neighbors);
        assert!(hits[0]);
        assert!(hits[5]);
    }

    #[test]
    fn save_load_roundtrip() {
        let bloom = Bloom::new(50, 21);
        for seed in 0..50u64 {
            bloom.insert(seed.wrapping_mul(0xdead_beef));
        }

        let mut buffer = Vec::new();
        bloom.save(&mut buffer).unwrap();
        let reloaded = Bloom::load(&mut &buffer[..]).unwrap();

        assert_eq!(reloaded.nb_bits(), bloom.nb_bits());
        assert_eq!(reloaded.nb_hashes(), bloom.nb_hashes());
        for seed in 0..50u64 {
            assert!(reloaded.contains(seed.wrapping_mul(0xdead_beef)));
        }
    }
}
