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

//! Minimizer repartition: a fixed table mapping every possible minimizer
//! value to a partition id, built once from a sample scan and reused
//! identically by every later stage.

/* std use */
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

/* crate use */
use anyhow::Result;
use log::info;

/* local use */
use crate::bank;
use crate::kmer;
use crate::kmer::KmerInt;

/// Partition balancing algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Balance {
    /// Walk minimizers in frequency order, advance the partition counter
    /// when the accumulated load reaches total/nb_partitions.
    Frequency,
    /// Place each minimizer, largest load first, into the emptiest
    /// partition. Ties broken by partition id.
    Heap,
}

pub struct Repartitor {
    nb_partitions: u16,
    m: u16,
    nb_passes: u16,
    table: Vec<u16>,
    freq_order: Option<Vec<u32>>,
}

impl Repartitor {
    /// Build a balanced table from per-minimizer kmer loads observed on a
    /// sample. Unseen minimizers map to partition 0.
    pub fn compute(
        loads: &[u64],
        nb_partitions: u16,
        m: u16,
        nb_passes: u16,
        balance: Balance,
    ) -> Self {
        let table = match balance {
            Balance::Frequency => Self::balance_by_frequency(loads, nb_partitions),
            Balance::Heap => Self::balance_by_heap(loads, nb_partitions),
        };

        Repartitor {
            nb_partitions,
            m,
            nb_passes,
            table,
            freq_order: None,
        }
    }

    fn balance_by_frequency(loads: &[u64], nb_partitions: u16) -> Vec<u16> {
        let mut table = vec![0u16; loads.len()];

        let mut seen: Vec<(u64, usize)> = loads
            .iter()
            .enumerate()
            .filter(|(_, &load)| load > 0)
            .map(|(minimizer, &load)| (load, minimizer))
            .collect();
        seen.sort_unstable();

        let total: u64 = seen.iter().map(|(load, _)| load).sum();
        let mean = total / nb_partitions.max(1) as u64;

        let mut accumulated = 0u64;
        let mut partition = 0u16;
        for (load, minimizer) in seen {
            table[minimizer] = partition;
            accumulated += load;
            if accumulated >= mean.max(1) && partition + 1 < nb_partitions {
                accumulated = 0;
                partition += 1;
            }
        }

        table
    }

    fn balance_by_heap(loads: &[u64], nb_partitions: u16) -> Vec<u16> {
        let mut table = vec![0u16; loads.len()];

        let mut bins: Vec<(u64, usize)> = loads
            .iter()
            .enumerate()
            .map(|(minimizer, &load)| (load, minimizer))
            .collect();
        bins.sort_unstable_by(|a, b| b.cmp(a));

        let mut heap: BinaryHeap<Reverse<(u64, u16)>> = (0..nb_partitions)
            .map(|partition| Reverse((0u64, partition)))
            .collect();

        for (load, minimizer) in bins {
            let Reverse((used, partition)) = heap.pop().unwrap();
            table[minimizer] = partition;
            heap.push(Reverse((used + load, partition)));
        }

        table
    }

    pub fn set_frequency_order(&mut self, freq_order: Vec<u32>) {
        self.freq_order = Some(freq_order);
    }

    pub fn get(&self, minimizer: u32) -> u16 {
        self.table[minimizer as usize]
    }

    pub fn nb_partitions(&self) -> u16 {
        self.nb_partitions
    }

    pub fn nb_passes(&self) -> u16 {
        self.nb_passes
    }

    pub fn m(&self) -> u16 {
        self.m
    }

    pub fn nb_minimizers(&self) -> u64 {
        self.table.len() as u64
    }

    pub fn freq_order(&self) -> Option<&Vec<u32>> {
        self.freq_order.as_ref()
    }

    /// Single binary block: nb_partitions, m, nb_minimizers, nb_passes,
    /// mapping, then the optional frequency ranks behind a presence flag.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.nb_partitions.to_le_bytes())?;
        writer.write_all(&self.m.to_le_bytes())?;
        writer.write_all(&(self.table.len() as u64).to_le_bytes())?;
        writer.write_all(&self.nb_passes.to_le_bytes())?;

        for &partition in &self.table {
            writer.write_all(&partition.to_le_bytes())?;
        }

        match &self.freq_order {
            Some(order) => {
                writer.write_all(&[1u8])?;
                for &rank in order {
                    writer.write_all(&rank.to_le_bytes())?;
                }
            }
            None => writer.write_all(&[0u8])?,
        }

        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut u16_buffer = [0u8; 2];
        let mut u64_buffer = [0u8; 8];

        reader.read_exact(&mut u16_buffer)?;
        let nb_partitions = u16::from_le_bytes(u16_buffer);
        reader.read_exact(&mut u16_buffer)?;
        let m = u16::from_le_bytes(u16_buffer);
        reader.read_exact(&mut u64_buffer)?;
        let nb_minimizers = u64::from_le_bytes(u64_buffer);
        reader.read_exact(&mut u16_buffer)?;
        let nb_passes = u16::from_le_bytes(u16_buffer);

        let mut table = Vec::with_capacity(nb_minimizers as usize);
        for _ in 0..nb_minimizers {
            reader.read_exact(&mut u16_buffer)?;
            table.push(u16::from_le_bytes(u16_buffer));
        }

        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag)?;
        let freq_order = if flag[0] == 1 {
            let mut u32_buffer = [0u8; 4];
            let mut order = Vec::with_capacity(nb_minimizers as usize);
            for _ in 0..nb_minimizers {
                reader.read_exact(&mut u32_buffer)?;
                order.push(u32::from_le_bytes(u32_buffer));
            }
            Some(order)
        } else {
            None
        };

        Ok(Repartitor {
            nb_partitions,
            m,
            nb_passes,
            table,
            freq_order,
        })
    }
}

/// Scan at most `max_kmers` kmers of the bank and accumulate the estimated
/// kmer load of every minimizer.
pub fn sample_loads<T: KmerInt>(
    bank: bank::Bank,
    model: &kmer::MinimizerModel,
    k: usize,
    max_kmers: u64,
) -> Result<Vec<u64>> {
    let mut loads = vec![0u64; model.nb_minimizers() as usize];
    let mut sampled = 0u64;

    info!("Begin of minimizer sampling");
    'outer: for sequence in bank {
        let sequence = sequence?;

        for token in kmer::Tokenizer::<T>::new(&sequence.data, k) {
            loads[model.minimizer(token.kmer, k) as usize] += 1;

            sampled += 1;
            if sampled >= max_kmers {
                break 'outer;
            }
        }
    }
    info!("End of minimizer sampling, {} kmers seen", sampled);

    Ok(loads)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_loads() -> Vec<u64> {
        // 16 minimizers (m = 2), a few heavy ones
        let mut loads = vec![0u64; 16];
        loads[1] = 100;
        loads[3] = 80;
        loads[7] = 60;
        loads[8] = 40;
        loads[12] = 20;
        loads
    }

    #[test]
    fn heap_balance_spreads_load() {
        let loads = toy_loads();
        let repartitor = Repartitor::compute(&loads, 4, 2, 1, Balance::Heap);

        let mut per_partition = vec![0u64; 4];
        for (minimizer, &load) in loads.iter().enumerate() {
            per_partition[repartitor.get(minimizer as u32) as usize] += load;
        }

        // heaviest bins land in distinct partitions
        assert_ne!(repartitor.get(1), repartitor.get(3));
        assert_ne!(repartitor.get(1), repartitor.get(7));
        let max = per_partition.iter().max().unwrap();
        let total: u64 = loads.iter().sum();
        assert!(*max <= total / 2);
    }

    #[test]
    fn frequency_balance_covers_all_partitions() {
        let loads = toy_loads();
        let repartitor = Repartitor::compute(&loads, 3, 2, 1, Balance::Frequency);

        for minimizer in 0..16u32 {
            assert!(repartitor.get(minimizer) < 3);
        }
        // unseen minimizer maps to partition 0
        assert_eq!(repartitor.get(0), 0);
    }

    #[test]
    fn save_load_roundtrip() {
        let loads = toy_loads();
        let mut repartitor = Repartitor::compute(&loads, 4, 2, 2, Balance::Heap);
        repartitor.set_frequency_order((0..16u32).collect());

        let mut buffer = Vec::new();
        repartitor.save(&mut buffer).unwrap();

        let reloaded = Repartitor::load(&mut &buffer[..]).unwrap();
        assert_eq!(reloaded.nb_partitions(), 4);
        assert_eq!(reloaded.m(), 2);
        assert_eq!(reloaded.nb_passes(), 2);
        assert_eq!(reloaded.nb_minimizers(), 16);
        for minimizer in 0..16u32 {
            assert_eq!(reloaded.get(minimizer), repartitor.get(minimizer));
        }
        assert_eq!(reloaded.freq_order(), repartitor.freq_order());
    }

    #[test]
    fn deterministic_builds() {
        let loads = toy_loads();
        let first = Repartitor::compute(&loads, 4, 2, 1, Balance::Heap);
        let second = Repartitor::compute(&loads, 4, 2, 1, Balance::Heap);

        for minimizer in 0..16u32 {
            assert_eq!(first.get(minimizer), second.get(minimizer));
        }
    }
}
