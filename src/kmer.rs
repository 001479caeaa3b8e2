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

//! 2-bit kmer model: encoding, reverse complement, canonicalisation,
//! sequence tokenization and minimizer computation.
//!
//! Nucleotides are encoded A=0, C=1, G=2, T=3, the complement of x is 3-x
//! and the leftmost nucleotide sits in the most significant occupied 2-bit
//! slot. Kmers are stored in a plain unsigned integer, `u64` up to k=31 and
//! `u128` up to k=63, the pipeline is monomorphized on that width.

/* local use */
use crate::error::Error;

/// Integer backing a 2-bit packed kmer.
pub trait KmerInt:
    Copy
    + Clone
    + Eq
    + PartialEq
    + Ord
    + PartialOrd
    + Default
    + std::fmt::Debug
    + std::hash::Hash
    + Send
    + Sync
    + std::ops::Shl<usize, Output = Self>
    + std::ops::Shr<usize, Output = Self>
    + std::ops::BitAnd<Output = Self>
    + std::ops::BitOr<Output = Self>
    + std::ops::BitXor<Output = Self>
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Not<Output = Self>
{
    const BITS: usize;
    const BYTES: usize;

    fn zero() -> Self;
    fn one() -> Self;
    fn from_nuc(nuc: u8) -> Self;
    fn low2(self) -> u8;
    fn as_u64(self) -> u64;
    fn from_u64(value: u64) -> Self;
    /// Big endian fixed width serialization, leftmost nucleotide in the top
    /// bits of the first byte.
    fn write_be(self, buffer: &mut [u8]);
    fn read_be(buffer: &[u8]) -> Self;
    fn hash64(self) -> u64;
}

fn splitmix64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

impl KmerInt for u64 {
    const BITS: usize = 64;
    const BYTES: usize = 8;

    fn zero() -> Self {
        0
    }

    fn one() -> Self {
        1
    }

    fn from_nuc(nuc: u8) -> Self {
        nuc as u64
    }

    fn low2(self) -> u8 {
        (self & 0b11) as u8
    }

    fn as_u64(self) -> u64 {
        self
    }

    fn from_u64(value: u64) -> Self {
        value
    }

    fn write_be(self, buffer: &mut [u8]) {
        buffer[..8].copy_from_slice(&self.to_be_bytes());
    }

    fn read_be(buffer: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buffer[..8]);
        u64::from_be_bytes(bytes)
    }

    fn hash64(self) -> u64 {
        splitmix64(self)
    }
}

impl KmerInt for u128 {
    const BITS: usize = 128;
    const BYTES: usize = 16;

    fn zero() -> Self {
        0
    }

    fn one() -> Self {
        1
    }

    fn from_nuc(nuc: u8) -> Self {
        nuc as u128
    }

    fn low2(self) -> u8 {
        (self & 0b11) as u8
    }

    fn as_u64(self) -> u64 {
        self as u64
    }

    fn from_u64(value: u64) -> Self {
        value as u128
    }

    fn write_be(self, buffer: &mut [u8]) {
        buffer[..16].copy_from_slice(&self.to_be_bytes());
    }

    fn read_be(buffer: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&buffer[..16]);
        u128::from_be_bytes(bytes)
    }

    fn hash64(self) -> u64 {
        splitmix64(self as u64) ^ splitmix64((self >> 64) as u64 ^ 0x51afd7ed558ccd25)
    }
}

/// Seeded variant of the kmer hash, used by the bloom double hashing.
pub fn hash_with_seed<T: KmerInt>(kmer: T, seed: u64) -> u64 {
    splitmix64(kmer.hash64() ^ seed)
}

/// 2-bit code of one nucleotide, None on anything else than upper/lower acgt.
pub fn nuc2bit(nuc: u8) -> Option<u8> {
    match nuc {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

pub fn bit2nuc(bit: u8) -> u8 {
    match bit & 0b11 {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        _ => b'T',
    }
}

pub fn comp(bit: u8) -> u8 {
    3 - (bit & 0b11)
}

/// Mask keeping the 2k low bits.
pub fn mask<T: KmerInt>(k: usize) -> T {
    if 2 * k >= T::BITS {
        !T::zero()
    } else {
        (T::one() << (2 * k)) - T::one()
    }
}

/// Strict encoding of an ascii slice, errors on the first non ACGT.
pub fn seq2bit<T: KmerInt>(seq: &[u8]) -> Result<T, Error> {
    let mut kmer = T::zero();

    for &nuc in seq {
        match nuc2bit(nuc) {
            Some(bit) => kmer = (kmer << 2) | T::from_nuc(bit),
            None => {
                return Err(Error::BadNucleotide {
                    nucleotide: nuc as char,
                })
            }
        }
    }

    Ok(kmer)
}

pub fn kmer2seq<T: KmerInt>(mut kmer: T, k: usize) -> String {
    let mut seq = vec![0u8; k];

    for position in (0..k).rev() {
        seq[position] = bit2nuc(kmer.low2());
        kmer = kmer >> 2;
    }

    String::from_utf8(seq).unwrap()
}

pub fn revcomp<T: KmerInt>(mut kmer: T, k: usize) -> T {
    let mut rc = T::zero();

    for _ in 0..k {
        rc = (rc << 2) | T::from_nuc(comp(kmer.low2()));
        kmer = kmer >> 2;
    }

    rc
}

pub fn canonical<T: KmerInt>(kmer: T, k: usize) -> T {
    std::cmp::min(kmer, revcomp(kmer, k))
}

pub fn is_forward<T: KmerInt>(kmer: T, k: usize) -> bool {
    kmer <= revcomp(kmer, k)
}

/// A kmer of even size can be its own reverse complement.
pub fn is_palindrome<T: KmerInt>(kmer: T, k: usize) -> bool {
    kmer == revcomp(kmer, k)
}

/// Shift-and-insert on the right end (forward extension).
pub fn extend_right<T: KmerInt>(kmer: T, nuc: u8, k: usize) -> T {
    ((kmer << 2) | T::from_nuc(nuc)) & mask::<T>(k)
}

/// Shift-and-insert on the left end (backward extension).
pub fn extend_left<T: KmerInt>(kmer: T, nuc: u8, k: usize) -> T {
    (kmer >> 2) | (T::from_nuc(nuc) << (2 * (k - 1)))
}

/// The 8 neighbors of a kmer in the de Bruijn graph, canonical form:
/// 4 outgoing then 4 incoming.
pub fn neighbors<T: KmerInt>(kmer: T, k: usize) -> [T; 8] {
    let mut out = [T::zero(); 8];

    for nuc in 0..4u8 {
        out[nuc as usize] = canonical(extend_right(kmer, nuc, k), k);
        out[4 + nuc as usize] = canonical(extend_left(kmer, nuc, k), k);
    }

    out
}

/// Canonical kmer produced by the tokenizer: value, strand of the canonical
/// form relative to the sequence, start offset in the sequence.
pub struct Token<T> {
    pub kmer: T,
    pub forward: bool,
    pub position: usize,
}

/// Restartable iterator over the canonical kmers of a raw ascii sequence,
/// rolling 2-bit windows, restarting after any non ACGT.
pub struct Tokenizer<'a, T> {
    seq: &'a [u8],
    k: usize,
    position: usize,
    loaded: usize,
    forward: T,
    reverse: T,
}

impl<'a, T: KmerInt> Tokenizer<'a, T> {
    pub fn new(seq: &'a [u8], k: usize) -> Self {
        Tokenizer {
            seq,
            k,
            position: 0,
            loaded: 0,
            forward: T::zero(),
            reverse: T::zero(),
        }
    }
}

impl<'a, T: KmerInt> Iterator for Tokenizer<'a, T> {
    type Item = Token<T>;

    fn next(&mut self) -> Option<Token<T>> {
        while self.position < self.seq.len() {
            let nuc = self.seq[self.position];
            self.position += 1;

            match nuc2bit(nuc) {
                Some(bit) => {
                    self.forward = extend_right(self.forward, bit, self.k);
                    self.reverse = extend_left(self.reverse, comp(bit), self.k);
                    self.loaded += 1;

                    if self.loaded >= self.k {
                        let forward = self.forward <= self.reverse;
                        return Some(Token {
                            kmer: if forward { self.forward } else { self.reverse },
                            forward,
                            position: self.position - self.k,
                        });
                    }
                }
                None => {
                    self.loaded = 0;
                    self.forward = T::zero();
                    self.reverse = T::zero();
                }
            }
        }

        None
    }
}

/// Minimizer model: smallest m-mer of a kmer's canonical form, under the
/// lexicographic order by default or a frequency rank order when one is set.
#[derive(Clone)]
pub struct MinimizerModel {
    m: usize,
    order: Option<Vec<u32>>,
}

impl MinimizerModel {
    pub fn new(m: usize) -> Self {
        MinimizerModel { m, order: None }
    }

    pub fn with_frequency_order(m: usize, order: Vec<u32>) -> Self {
        MinimizerModel {
            m,
            order: Some(order),
        }
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn nb_minimizers(&self) -> u64 {
        1u64 << (2 * self.m)
    }

    fn rank(&self, value: u32) -> u32 {
        match &self.order {
            Some(order) => order[value as usize],
            None => value,
        }
    }

    /// Minimizer of the canonical form of `kmer`.
    pub fn minimizer<T: KmerInt>(&self, kmer: T, k: usize) -> u32 {
        debug_assert!(self.m <= k);

        let cano = canonical(kmer, k);
        let mmask = mask::<T>(self.m);

        let mut best = (cano & mmask).as_u64() as u32;
        for shift in 1..=(k - self.m) {
            let window = ((cano >> (2 * shift)) & mmask).as_u64() as u32;
            if self.rank(window) < self.rank(best) {
                best = window;
            }
        }

        best
    }

    /// Minimizer of an ascii fragment (used on unitig boundary (k-1)-mers).
    pub fn minimizer_seq<T: KmerInt>(&self, seq: &[u8]) -> Result<u32, Error> {
        let kmer: T = seq2bit(seq)?;
        Ok(self.minimizer(kmer, seq.len()))
    }
}

/// Reverse complement of an ascii sequence.
pub fn revcomp_seq(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&nuc| match nuc {
            b'A' | b'a' => b'T',
            b'C' | b'c' => b'G',
            b'G' | b'g' => b'C',
            b'T' | b't' => b'A',
            other => other,
        })
        .collect()
}

/// Canonical form of an ascii sequence.
pub fn canonical_seq(seq: &[u8]) -> Vec<u8> {
    let rc = revcomp_seq(seq);
    if seq <= rc.as_slice() {
        seq.to_vec()
    } else {
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let kmer: u64 = seq2bit(b"ACGTA").unwrap();
        assert_eq!(kmer2seq(kmer, 5), "ACGTA");

        assert!(seq2bit::<u64>(b"ACNTA").is_err());
    }

    #[test]
    fn encoding_layout() {
        // leftmost nucleotide in the most significant slot
        let kmer: u64 = seq2bit(b"TAAAA").unwrap();
        assert_eq!(kmer, 0b11 << 8);
    }

    #[test]
    fn reverse_complement() {
        let kmer: u64 = seq2bit(b"ACGTT").unwrap();
        let rc: u64 = seq2bit(b"AACGT").unwrap();
        assert_eq!(revcomp(kmer, 5), rc);
        assert_eq!(revcomp(revcomp(kmer, 5), 5), kmer);
    }

    #[test]
    fn canonical_is_smallest() {
        for seq in [&b"AAACG"[..], b"TTTTT", b"CGCGA"] {
            let kmer: u64 = seq2bit(seq).unwrap();
            let cano = canonical(kmer, 5);
            assert!(cano <= kmer);
            assert!(cano <= revcomp(kmer, 5));
            assert_eq!(cano, canonical(revcomp(kmer, 5), 5));
        }
    }

    #[test]
    fn extension() {
        let kmer: u64 = seq2bit(b"ACGTA").unwrap();
        assert_eq!(kmer2seq(extend_right(kmer, 3, 5), 5), "CGTAT");
        assert_eq!(kmer2seq(extend_left(kmer, 3, 5), 5), "TACGT");
    }

    #[test]
    fn tokenizer_skips_n() {
        let tokens: Vec<Token<u64>> = Tokenizer::new(b"ACGTNACGTT", 4).collect();
        // one window before the N, two after
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].position, 0);
        assert_eq!(tokens[1].position, 5);
        assert_eq!(tokens[2].position, 6);

        for token in &tokens {
            assert_eq!(token.kmer, canonical(token.kmer, 4));
        }
    }

    #[test]
    fn tokenizer_count() {
        let tokens: Vec<Token<u64>> = Tokenizer::new(b"ACGTACGTACGTACGTACGT", 11).collect();
        assert_eq!(tokens.len(), 20 - 11 + 1);
    }

    #[test]
    fn minimizer_stability() {
        let model = MinimizerModel::new(3);
        let kmer: u64 = seq2bit(b"ACGTACGTA").unwrap();

        let direct = model.minimizer(kmer, 9);
        let reverse = model.minimizer(revcomp(kmer, 9), 9);
        assert_eq!(direct, reverse);
        assert!((direct as u64) < model.nb_minimizers());
    }

    #[test]
    fn minimizer_frequency_order() {
        // rank table inverting the natural order makes the largest m-mer win
        let m = 2;
        let nb = 1usize << (2 * m);
        let order: Vec<u32> = (0..nb as u32).rev().collect();
        let model = MinimizerModel::with_frequency_order(m, order);

        let kmer: u64 = seq2bit(b"AATT").unwrap();
        let lexicographic = MinimizerModel::new(m).minimizer(kmer, 4);
        assert_ne!(model.minimizer(kmer, 4), lexicographic);
    }

    #[test]
    fn u128_roundtrip() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGT";
        let kmer: u128 = seq2bit(seq).unwrap();
        assert_eq!(kmer2seq(kmer, seq.len()), String::from_utf8_lossy(seq));
        assert_eq!(revcomp(revcomp(kmer, seq.len()), seq.len()), kmer);
    }

    #[test]
    fn serialization() {
        let kmer: u64 = seq2bit(b"TACGA").unwrap();
        let mut buffer = [0u8; 8];
        kmer.write_be(&mut buffer);
        assert_eq!(u64::read_be(&buffer), kmer);

        // leftmost nucleotide lands in the top bits of the first byte
        let full: u64 = seq2bit(b"TAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        full.write_be(&mut buffer);
        assert_eq!(buffer[0] >> 6, 0b11);
    }
}
