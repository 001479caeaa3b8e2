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

//! Unitig construction: every solid kmer seeds the bucket of the smaller of
//! its two boundary (k-1)-mer minimizers; buckets are compacted in
//! increasing minimizer order and a sequence whose pending extremity
//! minimizer is larger travels on to that bucket. Sequences with no pending
//! extremity are maximal and leave as unitigs. Minimizer ranges are grouped
//! into on disk superbuckets so only one range sits in memory.

/* local mod */
pub mod bucket;
pub mod link;

/* std use */
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/* crate use */
use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;

/* local use */
use crate::count::partition::SolidReader;
use crate::count::solid_collection;
use crate::error::Error;
use crate::kmer;
use crate::kmer::KmerInt;
use crate::repartitor::Repartitor;
use crate::storage::{BuildState, GraphStorage};

const SUPER_BITS: usize = 8;

#[derive(Debug, Clone)]
pub struct BcalmOptions {
    pub k: usize,
    pub nb_cores: usize,
}

/// One sequence travelling between buckets, with its per kmer abundances.
struct SeedRecord {
    target: u32,
    seq: Vec<u8>,
    abundances: Vec<u32>,
}

impl SeedRecord {
    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.target.to_le_bytes())?;
        writer.write_all(&(self.seq.len() as u32).to_le_bytes())?;
        writer.write_all(&self.seq)?;
        writer.write_all(&(self.abundances.len() as u32).to_le_bytes())?;
        for &abundance in &self.abundances {
            writer.write_all(&abundance.to_le_bytes())?;
        }
        Ok(())
    }

    fn read<R: Read>(reader: &mut R) -> Option<SeedRecord> {
        let mut u32_buffer = [0u8; 4];
        if reader.read_exact(&mut u32_buffer).is_err() {
            return None;
        }
        let target = u32::from_le_bytes(u32_buffer);

        reader.read_exact(&mut u32_buffer).ok()?;
        let seq_len = u32::from_le_bytes(u32_buffer) as usize;
        let mut seq = vec![0u8; seq_len];
        reader.read_exact(&mut seq).ok()?;

        reader.read_exact(&mut u32_buffer).ok()?;
        let nb_abundances = u32::from_le_bytes(u32_buffer) as usize;
        let mut abundances = Vec::with_capacity(nb_abundances);
        for _ in 0..nb_abundances {
            reader.read_exact(&mut u32_buffer).ok()?;
            abundances.push(u32::from_le_bytes(u32_buffer));
        }

        Some(SeedRecord {
            target,
            seq,
            abundances,
        })
    }
}

struct SuperBuckets {
    directory: PathBuf,
    shift: usize,
    nb: usize,
}

impl SuperBuckets {
    fn new(directory: &Path, m: usize) -> Self {
        let bits = (2 * m).min(SUPER_BITS);

        SuperBuckets {
            directory: directory.to_path_buf(),
            shift: 2 * m - bits,
            nb: 1usize << bits,
        }
    }

    fn of(&self, minimizer: u32) -> usize {
        (minimizer >> self.shift) as usize
    }

    fn path(&self, super_bucket: usize) -> PathBuf {
        self.directory.join(format!("super-{}.tmp", super_bucket))
    }

    fn append(&self, record: &SeedRecord) -> Result<()> {
        let path = self.path(self.of(record.target));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| Error::CantWriteFile {
                filename: path.display().to_string(),
            })?;

        let mut writer = BufWriter::new(file);
        record.write(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Minimizers of the two boundary (k-1)-mers of a sequence.
fn boundary_minimizers<T: KmerInt>(
    model: &kmer::MinimizerModel,
    seq: &[u8],
    k: usize,
) -> Result<(u32, u32)> {
    let left = model.minimizer_seq::<T>(&seq[..k - 1])?;
    let right = model.minimizer_seq::<T>(&seq[seq.len() - (k - 1)..])?;
    Ok((left, right))
}

/// Build maximal unitigs from the solid collections, writing `unitigs.fa`
/// (one record per unitig, mean abundance in the comment). Links are added
/// by the separate `link` pass.
pub fn build_unitigs<T: KmerInt>(storage: &GraphStorage, options: &BcalmOptions) -> Result<u64> {
    storage.require(BuildState::SORTING_COUNT_DONE, "dsk")?;

    let repart = {
        let mut reader = storage.open_collection("repartitor.bin")?;
        Repartitor::load(&mut reader)?
    };
    let model = kmer::MinimizerModel::new(repart.m() as usize);
    let nb_partitions = repart.nb_partitions() as usize;
    let k = options.k;

    let work_dir = storage.group("buckets")?;
    let supers = SuperBuckets::new(&work_dir, repart.m() as usize);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.nb_cores.max(1))
        .build()
        .map_err(|_| Error::AllocationFailed {
            name: "thread pool".to_string(),
        })?;

    info!("Begin of kmer distribution to buckets");
    {
        let mut writers = Vec::with_capacity(supers.nb);
        for super_bucket in 0..supers.nb {
            let path = supers.path(super_bucket);
            let file = std::fs::File::create(&path).with_context(|| Error::CantWriteFile {
                filename: path.display().to_string(),
            })?;
            writers.push(Mutex::new(BufWriter::new(file)));
        }

        pool.install(|| {
            (0..nb_partitions)
                .into_par_iter()
                .try_for_each(|partition| -> Result<()> {
                    let reader = storage.open_collection(&solid_collection(partition))?;

                    for (solid, count) in SolidReader::<T, _>::new(reader) {
                        let seq = kmer::kmer2seq(solid, k).into_bytes();
                        let (left_min, right_min) =
                            boundary_minimizers::<T>(&model, &seq, k)?;

                        let record = SeedRecord {
                            target: left_min.min(right_min),
                            seq,
                            abundances: vec![count as u32],
                        };

                        let mut guard = writers[supers.of(record.target)].lock().unwrap();
                        record.write(&mut *guard)?;
                    }

                    Ok(())
                })
        })?;

        for writer in &writers {
            writer.lock().unwrap().flush()?;
        }
    }
    info!("End of kmer distribution to buckets");

    info!("Begin of bucket compaction");
    let mut unitigs = storage.create_collection("unitigs.fa")?;
    let mut unitig_counter = 0u64;

    for super_bucket in 0..supers.nb {
        let path = supers.path(super_bucket);

        let mut pending: BTreeMap<u32, Vec<SeedRecord>> = BTreeMap::new();
        {
            let file = std::fs::File::open(&path).with_context(|| Error::CantReadFile {
                filename: path.display().to_string(),
            })?;
            let mut reader = BufReader::new(file);
            while let Some(record) = SeedRecord::read(&mut reader) {
                pending.entry(record.target).or_insert_with(Vec::new).push(record);
            }
        }

        while let Some((&minimizer, _)) = pending.iter().next() {
            let records = pending.remove(&minimizer).unwrap();

            let mut current = bucket::Bucket::<T>::new(k, minimizer);
            for record in records {
                let (left_min, right_min) = boundary_minimizers::<T>(&model, &record.seq, k)?;
                current.add(record.seq, record.abundances, left_min, right_min);
            }

            current.compact()?;

            for compacted in current.into_compacted() {
                let (left_min, right_min) =
                    boundary_minimizers::<T>(&model, &compacted.seq, k)?;

                let next = match (left_min > minimizer, right_min > minimizer) {
                    (true, true) => Some(left_min.min(right_min)),
                    (true, false) => Some(left_min),
                    (false, true) => Some(right_min),
                    (false, false) => None,
                };

                match next {
                    None => {
                        let mean: f64 = compacted.abundances.iter().map(|&a| a as f64).sum::<f64>()
                            / compacted.abundances.len() as f64;
                        writeln!(
                            unitigs,
                            ">{} LN:i:{} ka:f:{:.1}\n{}",
                            unitig_counter,
                            compacted.seq.len(),
                            mean,
                            String::from_utf8_lossy(&compacted.seq)
                        )?;
                        unitig_counter += 1;
                    }
                    Some(target) => {
                        let record = SeedRecord {
                            target,
                            seq: compacted.seq,
                            abundances: compacted.abundances,
                        };

                        if supers.of(target) == super_bucket {
                            pending
                                .entry(target)
                                .or_insert_with(Vec::new)
                                .push(record);
                        } else {
                            supers.append(&record)?;
                        }
                    }
                }
            }
        }

        std::fs::remove_file(&path).ok();
    }

    unitigs.flush()?;
    info!("End of bucket compaction, {} unitigs", unitig_counter);

    Ok(unitig_counter)
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
                m: 3,
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

    fn read_unitigs(storage: &GraphStorage) -> Vec<String> {
        let reader = storage.open_collection("unitigs.fa").unwrap();
        bio::io::fasta::Reader::from_bufread(reader)
            .records()
            .map(|record| String::from_utf8(record.unwrap().seq().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn single_read_single_unitig() {
        let k = 11;
        let sequence = "CATCGATGCGAGACGCCTGTCGCGGGGAATT";
        let (_dir, storage) = build_counted(&[sequence], k);

        let nb = build_unitigs::<u64>(&storage, &BcalmOptions { k, nb_cores: 2 }).unwrap();
        assert_eq!(nb, 1);

        let unitigs = read_unitigs(&storage);
        assert_eq!(
            kmer::canonical_seq(unitigs[0].as_bytes()),
            kmer::canonical_seq(sequence.as_bytes())
        );
    }

    #[test]
    fn every_solid_kmer_in_exactly_one_unitig() {
        let k = 11;
        let sequences = [
            "CATCGATGCGAGACGCCTGTCGCGGGGAATTGTGG",
            "GGCGGACCACGCTCTGGCTAACGAGCTACCGTTTC",
            "CATCGATGCGAGTTTTTTGGCCAACGAGCTACCGT",
        ];
        let (_dir, storage) = build_counted(&sequences, k);

        build_unitigs::<u64>(&storage, &BcalmOptions { k, nb_cores: 2 }).unwrap();

        // collect solid kmers from the counting stage
        let repart = {
            let mut reader = storage.open_collection("repartitor.bin").unwrap();
            Repartitor::load(&mut reader).unwrap()
        };
        let mut solid = rustc_hash::FxHashSet::default();
        for partition in 0..repart.nb_partitions() as usize {
            let reader = storage.open_collection(&solid_collection(partition)).unwrap();
            solid.extend(SolidReader::<u64, _>::new(reader).map(|(kmer, _)| kmer));
        }

        // collect kmers from the unitigs: each solid kmer appears exactly once
        let mut seen = rustc_hash::FxHashMap::default();
        for unitig in read_unitigs(&storage) {
            for token in kmer::Tokenizer::<u64>::new(unitig.as_bytes(), k) {
                *seen.entry(token.kmer).or_insert(0u32) += 1;
            }
        }

        assert_eq!(seen.len(), solid.len());
        for (kmer, occurrences) in seen {
            assert!(solid.contains(&kmer));
            assert_eq!(occurrences, 1, "kmer {} duplicated", kmer);
        }
    }

    #[test]
    fn branching_splits_unitigs() {
        // an X shape: two ins and two outs around the central kmer TGCATCACGGT
        let k = 11;
        let sequences = [
            "AACCTTGGCATGCATCACGGT",
            "TTGGACCACGTGCATCACGGT",
            "TGCATCACGGTTCAGATTACA",
            "TGCATCACGGTCCTTAGGACT",
        ];
        let (_dir, storage) = build_counted(&sequences, k);

        let nb = build_unitigs::<u64>(&storage, &BcalmOptions { k, nb_cores: 2 }).unwrap();
        assert!(nb > 1);
    }
}
