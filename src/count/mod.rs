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

//! Disk streamed kmer counting: estimate the kmer volume, pick a number of
//! passes and partitions holding the disk and memory budgets, then for each
//! pass route canonical kmers to partition files by minimizer and drain
//! each partition with a hash or sort counter, keeping kmers seen at least
//! `abundance_min` times.

/* local mod */
pub mod counter;
pub mod partition;

/* std use */
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/* crate use */
use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;

/* local use */
use crate::bank;
use crate::error::Error;
use crate::kmer;
use crate::kmer::KmerInt;
use crate::repartitor;
use crate::storage::{BuildState, GraphStorage};

const MBYTE: u64 = 1 << 20;
const MAX_OPEN_FILES: u64 = 1024;
const SAMPLE_SEQUENCES: u64 = 5_000;
const SAMPLE_KMERS: u64 = 1_000_000;
const SEQUENCE_BATCH: usize = 4_096;

/// Partition draining strategy: hash uses less disk, vector more memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartitionMode {
    Hash,
    Vector,
}

#[derive(Debug, Clone)]
pub struct CountOptions {
    pub k: usize,
    pub m: usize,
    pub abundance_min: u16,
    pub max_memory_mib: u64,
    pub max_disk_mib: u64,
    pub nb_cores: usize,
    pub mode: PartitionMode,
    pub balance: repartitor::Balance,
}

impl CountOptions {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::KmerSizeNull.into());
        }
        if self.k > 63 {
            return Err(Error::KmerSizeTooLarge { k: self.k as u64 }.into());
        }
        if self.abundance_min == 0 {
            return Err(Error::AbundanceNull.into());
        }
        if self.m >= self.k || self.m > 15 {
            return Err(Error::BadMinimizerSize {
                m: self.m as u64,
                k: self.k as u64,
            }
            .into());
        }
        Ok(())
    }
}

/// Pass and partition counts derived from the volume estimate.
#[derive(Debug, Clone, Copy)]
pub struct CountConfig {
    pub volume_mib: u64,
    pub nb_passes: u16,
    pub nb_partitions: u16,
}

pub fn configure<T: KmerInt>(
    estimation: &bank::BankEstimation,
    options: &CountOptions,
) -> Result<CountConfig> {
    let kmers_nb = estimation
        .total_nt
        .saturating_sub(estimation.nb_sequences * (options.k as u64 - 1));

    let mut volume = kmers_nb * T::BYTES as u64 / MBYTE;
    if volume == 0 {
        volume = 1;
    }

    let max_disk = if options.max_disk_mib == 0 {
        10_000
    } else {
        options.max_disk_mib
    };
    let max_memory = options.max_memory_mib.max(1);

    let mut nb_passes = volume / max_disk + 1;
    let max_open = MAX_OPEN_FILES / 2;

    let nb_partitions = loop {
        let volume_per_pass = volume / nb_passes;
        let mut nb_partitions = (volume_per_pass * options.nb_cores as u64) / max_memory + 1;

        if options.mode == PartitionMode::Hash {
            // inflate for the load factor and the per entry overhead of the
            // open addressing counter
            nb_partitions = (nb_partitions as f64 / 0.7).ceil() as u64;
            nb_partitions = (nb_partitions * counter::hash_entry_bytes::<T>() as u64
                + T::BYTES as u64
                - 1)
                / T::BYTES as u64;
            nb_partitions = (nb_partitions / 2).max(1);
        }

        if nb_partitions >= max_open {
            nb_passes += 1;
            if nb_passes > 4_096 {
                return Err(Error::PartitionBudgetExceeded.into());
            }
        } else {
            break nb_partitions.max(1);
        }
    };

    Ok(CountConfig {
        volume_mib: volume,
        nb_passes: nb_passes as u16,
        nb_partitions: nb_partitions as u16,
    })
}

pub struct CountReport {
    pub config: CountConfig,
    pub nb_solid: u64,
    pub nb_distinct: u64,
    pub total_abundance: u64,
}

/// Name of the solid collection of one partition inside the graph storage.
pub fn solid_collection(partition: usize) -> String {
    format!("solid/part-{}.bin", partition)
}

/// Full counting stage. Writes the repartitor, the per partition solid
/// collections and the abundance histogram into `storage`.
pub fn sorting_count<T: KmerInt>(
    factory: &bank::BankFactory,
    input: &str,
    storage: &GraphStorage,
    options: &CountOptions,
) -> Result<CountReport> {
    options.validate()?;

    let estimation = factory.estimate(input, SAMPLE_SEQUENCES)?;
    let config = configure::<T>(&estimation, options)?;

    info!("config kmer_size {}", options.k);
    info!("config abundance_min {}", options.abundance_min);
    info!("config sequence_number {}", estimation.nb_sequences);
    info!("config kmers_volume {} MB", config.volume_mib);
    info!("config nb_passes {}", config.nb_passes);
    info!("config nb_partitions {}", config.nb_partitions);

    let model = kmer::MinimizerModel::new(options.m);

    info!("Begin of repartitor construction");
    let loads = repartitor::sample_loads::<T>(factory.open(input)?, &model, options.k, SAMPLE_KMERS)?;
    let repart = repartitor::Repartitor::compute(
        &loads,
        config.nb_partitions,
        options.m as u16,
        config.nb_passes,
        options.balance,
    );
    {
        let mut writer = storage.create_collection("repartitor.bin")?;
        repart.save(&mut writer)?;
    }
    info!("End of repartitor construction");

    storage.set_state(storage.state().with(BuildState::CONFIGURATION_DONE))?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.nb_cores.max(1))
        .build()
        .map_err(|_| Error::AllocationFailed {
            name: "thread pool".to_string(),
        })?;

    storage.group("solid")?;
    // truncate any leftover solid collections before the append passes
    for partition in 0..config.nb_partitions as usize {
        storage.create_collection(&solid_collection(partition))?;
    }

    let histogram = Mutex::new(counter::Histogram::new());
    let nb_solid = AtomicU64::new(0);
    let total_abundance = AtomicU64::new(0);

    for pass in 0..config.nb_passes {
        info!("Begin of pass {}/{}", pass + 1, config.nb_passes);

        let partitions_dir = storage.group("partitions")?;
        let sink = partition::PartitionSink::new(&partitions_dir, config.nb_partitions as usize)?;

        fill_partitions::<T>(
            factory, input, &pool, &sink, &model, &repart, options, pass,
        )?;

        info!("pass {} wrote {} kmers", pass + 1, sink.info().total());

        drain_partitions::<T>(
            storage,
            &pool,
            &sink,
            options,
            &histogram,
            &nb_solid,
            &total_abundance,
        )?;

        sink.remove()?;
        info!("End of pass {}/{}", pass + 1, config.nb_passes);
    }

    let histogram = histogram.into_inner().unwrap();
    {
        let mut writer = storage.create_collection("histogram.tsv")?;
        histogram.save(&mut writer)?;
    }

    let report = CountReport {
        config,
        nb_solid: nb_solid.load(Ordering::Relaxed),
        nb_distinct: histogram.nb_distinct(),
        total_abundance: total_abundance.load(Ordering::Relaxed),
    };

    if report.nb_solid == 0 {
        return Err(Error::NoSolidKmer.into());
    }

    storage.set_state(storage.state().with(BuildState::SORTING_COUNT_DONE))?;

    info!("solid kmers {}", report.nb_solid);
    info!("distinct kmers {}", report.nb_distinct);

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn fill_partitions<T: KmerInt>(
    factory: &bank::BankFactory,
    input: &str,
    pool: &rayon::ThreadPool,
    sink: &partition::PartitionSink,
    model: &kmer::MinimizerModel,
    repart: &repartitor::Repartitor,
    options: &CountOptions,
    pass: u16,
) -> Result<()> {
    let mut bank = factory.open(input)?;
    let nb_passes = repart.nb_passes() as u32;

    loop {
        let mut batch = Vec::with_capacity(SEQUENCE_BATCH);
        for sequence in bank.by_ref().take(SEQUENCE_BATCH) {
            batch.push(sequence?);
        }
        if batch.is_empty() {
            break;
        }

        pool.install(|| {
            batch
                .par_chunks(64)
                .try_for_each(|sequences| -> Result<()> {
                    let mut cache = partition::PartitionCache::<T>::new(sink);

                    for sequence in sequences {
                        for token in kmer::Tokenizer::<T>::new(&sequence.data, options.k) {
                            let minimizer = model.minimizer(token.kmer, options.k);
                            if minimizer % nb_passes != pass as u32 {
                                continue;
                            }

                            cache.push(repart.get(minimizer) as usize, token.kmer);
                        }
                    }

                    cache.finish()
                })
        })?;
    }

    sink.finish()
}

fn drain_partitions<T: KmerInt>(
    storage: &GraphStorage,
    pool: &rayon::ThreadPool,
    sink: &partition::PartitionSink,
    options: &CountOptions,
    histogram: &Mutex<counter::Histogram>,
    nb_solid: &AtomicU64,
    total_abundance: &AtomicU64,
) -> Result<()> {
    let nb_partitions = sink.nb_partitions();
    let concurrency = nb_partitions.min(options.nb_cores.max(1)) as u64;
    let budget = (options.max_memory_mib.max(1) * MBYTE) / concurrency;

    pool.install(|| {
        (0..nb_partitions)
            .into_par_iter()
            .try_for_each(|partition| -> Result<()> {
                let reader = partition::PartitionReader::<T>::open(sink.path(partition))?;

                let path = storage.collection(&solid_collection(partition));
                let file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .with_context(|| Error::CantWriteFile {
                        filename: path.display().to_string(),
                    })?;
                let mut writer = partition::SolidWriter::new(std::io::BufWriter::new(file));

                let mut local_histogram = counter::Histogram::new();
                let mut local_solid = 0u64;
                let mut local_abundance = 0u64;

                {
                    let mut record = |kmer: T, abundance: u32| -> Result<()> {
                        local_histogram.record(abundance);
                        local_abundance += abundance as u64;

                        if abundance >= options.abundance_min as u32 {
                            local_solid += 1;
                            writer.push(kmer, abundance.min(u16::MAX as u32) as u16)?;
                        }

                        Ok(())
                    };

                    match options.mode {
                        PartitionMode::Hash => {
                            let mut hash = counter::OaHash::<T>::with_memory(budget);
                            for kmer in reader {
                                if !hash.increment(kmer) {
                                    return Err(Error::PartitionHashFull { partition }.into());
                                }
                            }
                            for (kmer, abundance) in hash.drain() {
                                record(kmer, abundance)?;
                            }
                        }
                        PartitionMode::Vector => {
                            let kmers: Vec<T> = reader.collect();
                            let mut failure = None;
                            counter::count_sorted(kmers, |kmer, abundance| {
                                if failure.is_none() {
                                    if let Err(error) = record(kmer, abundance) {
                                        failure = Some(error);
                                    }
                                }
                            });
                            if let Some(error) = failure {
                                return Err(error);
                            }
                        }
                    }
                }

                writer.finish()?;

                histogram.lock().unwrap().merge(&local_histogram);
                nb_solid.fetch_add(local_solid, Ordering::Relaxed);
                total_abundance.fetch_add(local_abundance, Ordering::Relaxed);

                Ok(())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fasta_bank(sequences: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (index, seq) in sequences.iter().enumerate() {
            writeln!(file, ">seq_{}\n{}", index, seq).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn options(k: usize, abundance_min: u16, mode: PartitionMode) -> CountOptions {
        CountOptions {
            k,
            m: 5,
            abundance_min,
            max_memory_mib: 64,
            max_disk_mib: 0,
            nb_cores: 2,
            mode,
            balance: repartitor::Balance::Heap,
        }
    }

    #[test]
    fn configure_tiny_volume() {
        let estimation = bank::BankEstimation {
            nb_sequences: 20,
            total_nt: 400,
            max_len: 20,
        };

        let config = configure::<u64>(&estimation, &options(11, 1, PartitionMode::Vector)).unwrap();
        assert_eq!(config.nb_passes, 1);
        assert!(config.nb_partitions >= 1);
    }

    #[test]
    fn configure_multi_pass() {
        let estimation = bank::BankEstimation {
            nb_sequences: 20,
            total_nt: 400,
            max_len: 20,
        };

        let mut opts = options(11, 1, PartitionMode::Vector);
        opts.max_disk_mib = 1;
        let config = configure::<u64>(&estimation, &opts).unwrap();
        assert_eq!(config.nb_passes, 2); // volume 1 MB against a 1 MB disk budget
    }

    #[test]
    fn validate_rejects_bad_options() {
        assert!(options(0, 1, PartitionMode::Vector).validate().is_err());
        assert!(options(11, 0, PartitionMode::Vector).validate().is_err());
        assert!(options(64, 1, PartitionMode::Vector).validate().is_err());

        let mut bad_minimizer = options(11, 1, PartitionMode::Vector);
        bad_minimizer.m = 11;
        assert!(bad_minimizer.validate().is_err());
    }

    fn count_roundtrip(mode: PartitionMode) {
        // 20 sequences of length 20, k=11: 20 * 10 = 200 canonical occurrences
        let sequences: Vec<String> = (0..20)
            .map(|index| {
                let mut seq = String::new();
                let nucs = [b'A', b'C', b'G', b'T'];
                let mut state = index as u64 * 31 + 7;
                for _ in 0..20 {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    seq.push(nucs[(state >> 33) as usize % 4] as char);
                }
                seq
            })
            .collect();
        let refs: Vec<&str> = sequences.iter().map(|seq| seq.as_str()).collect();

        let file = fasta_bank(&refs);
        let dir = tempfile::tempdir().unwrap();
        let storage = GraphStorage::create(dir.path().join("graph")).unwrap();
        let factory = bank::BankFactory::new();

        let report = sorting_count::<u64>(
            &factory,
            file.path().to_str().unwrap(),
            &storage,
            &options(11, 1, mode),
        )
        .unwrap();

        assert_eq!(report.total_abundance, 200);
        assert_eq!(report.nb_solid, report.nb_distinct);
        assert!(storage.state().contains(BuildState::SORTING_COUNT_DONE));

        // every emitted kmer is canonical and counts sum to 200
        let mut from_disk = 0u64;
        for partition in 0..report.config.nb_partitions as usize {
            let reader = storage.open_collection(&solid_collection(partition)).unwrap();
            for (kmer, count) in partition::SolidReader::<u64, _>::new(reader) {
                assert_eq!(kmer, kmer::canonical(kmer, 11));
                from_disk += count as u64;
            }
        }
        assert_eq!(from_disk, 200);
    }

    #[test]
    fn count_vector_mode() {
        count_roundtrip(PartitionMode::Vector);
    }

    #[test]
    fn count_hash_mode() {
        count_roundtrip(PartitionMode::Hash);
    }

    #[test]
    fn count_multi_pass() {
        let file = fasta_bank(&["ACGGTCAATGCCTAGCATAA", "ACGGTCAATGCCTAGCATAA"]);
        let dir = tempfile::tempdir().unwrap();
        let storage = GraphStorage::create(dir.path().join("graph")).unwrap();
        let factory = bank::BankFactory::new();

        let mut opts = options(11, 1, PartitionMode::Vector);
        opts.max_disk_mib = 1;

        let report = sorting_count::<u64>(
            &factory,
            file.path().to_str().unwrap(),
            &storage,
            &opts,
        )
        .unwrap();

        assert_eq!(report.config.nb_passes, 2);
        assert_eq!(report.total_abundance, 2 * 10);
    }

    #[test]
    fn abundance_threshold_filters() {
        let file = fasta_bank(&["ACGTACGTACGTACGT", "ACGTACGTACGTACGT", "ACGGTCAATGCCTAGCATAA"]);
        let dir = tempfile::tempdir().unwrap();
        let storage = GraphStorage::create(dir.path().join("graph")).unwrap();
        let factory = bank::BankFactory::new();

        let report = sorting_count::<u64>(
            &factory,
            file.path().to_str().unwrap(),
            &storage,
            &options(11, 2, PartitionMode::Vector),
        )
        .unwrap();

        // only the duplicated read's kmers pass the threshold
        assert!(report.nb_solid > 0);
        assert!(report.nb_solid < report.nb_distinct);
    }

    #[test]
    fn no_solid_kmer_is_fatal() {
        let file = fasta_bank(&["ACGTACGTACGTACGT"]);
        let dir = tempfile::tempdir().unwrap();
        let storage = GraphStorage::create(dir.path().join("graph")).unwrap();
        let factory = bank::BankFactory::new();

        let result = sorting_count::<u64>(
            &factory,
            file.path().to_str().unwrap(),
            &storage,
            &options(11, 5, PartitionMode::Vector),
        );

        assert!(result.is_err());
    }
}
