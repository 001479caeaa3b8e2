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

//! Debloom: build the bloom filter over solid kmers, then falsify it. Every
//! neighbor of a solid kmer answering "present" is a candidate; candidates
//! that are not actually solid form the critical false positive set. The
//! bloom plus the cFP sidelist give an exact membership test for neighbor
//! queries, which is all graph traversal needs.

/* std use */
use std::io::{Read, Write};
use std::sync::Mutex;

/* crate use */
use anyhow::Result;
use log::info;
use rayon::prelude::*;

/* local use */
use crate::bloom::Bloom;
use crate::count::partition::{PartitionCache, PartitionReader, PartitionSink, SolidReader};
use crate::count::solid_collection;
use crate::error::Error;
use crate::kmer;
use crate::kmer::KmerInt;
use crate::repartitor::Repartitor;
use crate::storage::{BuildState, GraphStorage};

const MBYTE: u64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct DebloomOptions {
    pub k: usize,
    pub nb_cores: usize,
    pub max_memory_mib: u64,
    /// false keeps the raw bloom with an empty sidelist
    pub cascading: bool,
}

pub struct DebloomReport {
    pub nb_solid: u64,
    pub nb_cfp: u64,
    pub bloom_bits: u64,
}

/// Build bloom and cFP from the solid collections of `storage`.
pub fn debloom<T: KmerInt>(storage: &GraphStorage, options: &DebloomOptions) -> Result<DebloomReport> {
    storage.require(BuildState::SORTING_COUNT_DONE, "dsk")?;

    let repart = {
        let mut reader = storage.open_collection("repartitor.bin")?;
        Repartitor::load(&mut reader)?
    };
    let model = kmer::MinimizerModel::new(repart.m() as usize);
    let nb_partitions = repart.nb_partitions() as usize;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.nb_cores.max(1))
        .build()
        .map_err(|_| Error::AllocationFailed {
            name: "thread pool".to_string(),
        })?;

    info!("Begin of bloom construction");
    let mut nb_solid = 0u64;
    for partition in 0..nb_partitions {
        let reader = storage.open_collection(&solid_collection(partition))?;
        nb_solid += SolidReader::<T, _>::new(reader).count() as u64;
    }

    let bloom = Bloom::new(nb_solid, options.k);

    pool.install(|| {
        (0..nb_partitions)
            .into_par_iter()
            .try_for_each(|partition| -> Result<()> {
                let reader = storage.open_collection(&solid_collection(partition))?;
                for (kmer, _) in SolidReader::<T, _>::new(reader) {
                    bloom.insert(kmer);
                }
                Ok(())
            })
    })?;
    info!("End of bloom construction, {} bits", bloom.nb_bits());

    if !options.cascading {
        let mut writer = storage.create_collection("bloom.bin")?;
        bloom.save(&mut writer)?;
        let mut writer = storage.create_collection("cfp.bin")?;
        save_cfp::<T, _>(&mut writer, &[])?;

        storage.set_state(storage.state().with(BuildState::MPHF_DONE))?;

        return Ok(DebloomReport {
            nb_solid,
            nb_cfp: 0,
            bloom_bits: bloom.nb_bits(),
        });
    }

    info!("Begin of candidate enumeration");
    let candidates_dir = storage.group("partitions")?;
    let sink = PartitionSink::new(&candidates_dir, nb_partitions)?;

    pool.install(|| {
        (0..nb_partitions)
            .into_par_iter()
            .try_for_each(|partition| -> Result<()> {
                let reader = storage.open_collection(&solid_collection(partition))?;
                let mut cache = PartitionCache::<T>::new(&sink);

                for (kmer, _) in SolidReader::<T, _>::new(reader) {
                    let neighbors = kmer::neighbors(kmer, options.k);
                    let hits = bloom.contains8(&neighbors);

                    for (slot, &hit) in hits.iter().enumerate() {
                        if hit {
                            let candidate = neighbors[slot];
                            let minimizer = model.minimizer(candidate, options.k);
                            cache.push(repart.get(minimizer) as usize, candidate);
                        }
                    }
                }

                cache.finish()
            })
    })?;
    sink.finish()?;
    info!(
        "End of candidate enumeration, {} candidates",
        sink.info().total()
    );

    info!("Begin of solid exclusion");
    let chunk_capacity = ((options.max_memory_mib.max(1) * MBYTE)
        / (options.nb_cores.max(1) as u64)
        / T::BYTES as u64)
        .max(1024) as usize;

    let survivors: Mutex<Vec<T>> = Mutex::new(Vec::new());

    pool.install(|| {
        (0..nb_partitions)
            .into_par_iter()
            .try_for_each(|partition| -> Result<()> {
                let reader = storage.open_collection(&solid_collection(partition))?;
                let solid: rustc_hash::FxHashSet<T> = SolidReader::<T, _>::new(reader)
                    .map(|(kmer, _)| kmer)
                    .collect();

                // candidates are streamed in bounded chunks, the exclusion
                // pass repeats per chunk and surviving entries accumulate
                let mut candidates = PartitionReader::<T>::open(sink.path(partition))?;
                let mut local = Vec::new();

                loop {
                    let chunk: Vec<T> = candidates.by_ref().take(chunk_capacity).collect();
                    if chunk.is_empty() {
                        break;
                    }

                    for candidate in chunk {
                        if !solid.contains(&candidate) {
                            local.push(candidate);
                        }
                    }
                }

                local.sort_unstable();
                local.dedup();
                survivors.lock().unwrap().append(&mut local);

                Ok(())
            })
    })?;
    sink.remove()?;

    let mut cfp = survivors.into_inner().unwrap();
    cfp.sort_unstable();
    cfp.dedup();
    info!("End of solid exclusion, {} critical false positives", cfp.len());

    {
        let mut writer = storage.create_collection("bloom.bin")?;
        bloom.save(&mut writer)?;
    }
    {
        let mut writer = storage.create_collection("cfp.bin")?;
        save_cfp(&mut writer, &cfp)?;
    }

    storage.set_state(storage.state().with(BuildState::MPHF_DONE))?;

    Ok(DebloomReport {
        nb_solid,
        nb_cfp: cfp.len() as u64,
        bloom_bits: bloom.nb_bits(),
    })
}

fn save_cfp<T: KmerInt, W: Write>(writer: &mut W, cfp: &[T]) -> Result<()> {
    writer.write_all(&(cfp.len() as u64).to_le_bytes())?;

    let mut buffer = vec![0u8; T::BYTES];
    for kmer in cfp {
        kmer.write_be(&mut buffer);
        writer.write_all(&buffer)?;
    }

    Ok(())
}

fn load_cfp<T: KmerInt, R: Read>(reader: &mut R) -> Result<Vec<T>> {
    let mut u64_buffer = [0u8; 8];
    reader.read_exact(&mut u64_buffer)?;
    let count = u64::from_le_bytes(u64_buffer);

    let mut buffer = vec![0u8; T::BYTES];
    let mut cfp = Vec::with_capacity(count as usize);
    for _ in 0..count {
        reader.read_exact(&mut buffer)?;
        cfp.push(T::read_be(&buffer));
    }

    Ok(cfp)
}

/// The composed membership structure: bloom plus the sorted cFP sidelist.
/// Only valid for queries that are neighbors of solid kmers.
pub struct Membership<T> {
    bloom: Bloom,
    cfp: Vec<T>,
    k: usize,
}

impl<T: KmerInt> Membership<T> {
    pub fn load(storage: &GraphStorage, k: usize) -> Result<Self> {
        storage.require(BuildState::MPHF_DONE, "debloom")?;

        let bloom = {
            let mut reader = storage.open_collection("bloom.bin")?;
            Bloom::load(&mut reader)?
        };
        let cfp = {
            let mut reader = storage.open_collection("cfp.bin")?;
            load_cfp(&mut reader)?
        };

        Ok(Membership { bloom, cfp, k })
    }

    pub fn new(bloom: Bloom, cfp: Vec<T>, k: usize) -> Self {
        Membership { bloom, cfp, k }
    }

    pub fn nb_cfp(&self) -> usize {
        self.cfp.len()
    }

    pub fn contains_in_graph(&self, kmer: T) -> bool {
        let cano = kmer::canonical(kmer, self.k);
        self.bloom.contains(cano) && self.cfp.binary_search(&cano).is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::BankFactory;
    use crate::count;
    use crate::repartitor::Balance;
    use std::io::Write as _;

    fn build_counted(sequences: &[&str], k: usize) -> (tempfile::TempDir, GraphStorage) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (index, seq) in sequences.iter().enumerate() {
            writeln!(file, ">seq_{}\n{}", index, seq).unwrap();
        }
        file.flush().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let storage = GraphStorage::create(dir.path().join("graph")).unwrap();

        count::sorting_count::<u64>(
            &BankFactory::new(),
            file.path().to_str().unwrap(),
            &storage,
            &count::CountOptions {
                k,
                m: 5,
                abundance_min: 1,
                max_memory_mib: 64,
                max_disk_mib: 0,
                nb_cores: 2,
                mode: count::PartitionMode::Vector,
                balance: Balance::Heap,
            },
        )
        .unwrap();

        (dir, storage)
    }

    fn solid_set(storage: &GraphStorage, nb_partitions: usize) -> rustc_hash::FxHashSet<u64> {
        let mut solid = rustc_hash::FxHashSet::default();
        for partition in 0..nb_partitions {
            let reader = storage.open_collection(&solid_collection(partition)).unwrap();
            solid.extend(SolidReader::<u64, _>::new(reader).map(|(kmer, _)| kmer));
        }
        solid
    }

    #[test]
    fn debloom_requires_count() {
        let dir = tempfile::tempdir().unwrap();
        let storage = GraphStorage::create(dir.path().join("graph")).unwrap();

        let result = debloom::<u64>(
            &storage,
            &DebloomOptions {
                k: 11,
                nb_cores: 1,
                max_memory_mib: 16,
                cascading: true,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn exact_membership_on_neighbors() {
        let k = 11;
        let (_dir, storage) = build_counted(
            &[
                "CATCGATGCGAGACGCCTGTCGCGGGGAATTGTGG",
                "GGCGGACCACGCTCTGGCTAACGAGCTACCGTTTC",
            ],
            k,
        );

        let report = debloom::<u64>(
            &storage,
            &DebloomOptions {
                k,
                nb_cores: 2,
                max_memory_mib: 16,
                cascading: true,
            },
        )
        .unwrap();

        let membership = Membership::<u64>::load(&storage, k).unwrap();
        assert_eq!(membership.nb_cfp() as u64, report.nb_cfp);

        let repart = {
            let mut reader = storage.open_collection("repartitor.bin").unwrap();
            Repartitor::load(&mut reader).unwrap()
        };
        let solid = solid_set(&storage, repart.nb_partitions() as usize);
        assert_eq!(solid.len() as u64, report.nb_solid);

        // P3: no solid kmer is missed, P4: neighbor queries are exact
        for &kmer in &solid {
            assert!(membership.contains_in_graph(kmer));

            for neighbor in kmer::neighbors(kmer, k).iter() {
                assert_eq!(
                    membership.contains_in_graph(*neighbor),
                    solid.contains(neighbor),
                );
            }
        }
    }
}
