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

/* std use */
use std::io::Write;

/* crate use */
use anyhow::Result;
use log::info;
use structopt::StructOpt;

/* local use */
use brindille::bank::BankFactory;
use brindille::cli;
use brindille::count;
use brindille::debloom;
use brindille::error::{exit_code, Error, Stage};
use brindille::kmer::KmerInt;
use brindille::repartitor::Balance;
use brindille::simplify;
use brindille::storage::GraphStorage;
use brindille::traversal::{self, TraversalKind};
use brindille::unitig::UnitigGraph;
use brindille::{bcalm, bcalm::link};

/// Monomorphize a stage on the kmer integer width.
macro_rules! with_span {
    ($k:expr, $func:ident($($arg:expr),* $(,)?)) => {
        if $k == 0 {
            Err(Error::KmerSizeNull.into())
        } else if $k <= 31 {
            $func::<u64>($($arg),*)
        } else if $k <= 63 {
            $func::<u128>($($arg),*)
        } else {
            Err(Error::KmerSizeTooLarge { k: $k as u64 }.into())
        }
    };
}

fn main() {
    env_logger::init();

    let params = cli::Command::from_args();

    if let Err((stage, error)) = run(params) {
        report_failure(stage, &error);
        std::process::exit(exit_code(&error));
    }
}

/// One structured record on stderr, mirrored in the log.
fn report_failure(stage: Stage, error: &anyhow::Error) {
    let (kind, partition) = classify(error);

    let mut record = format!(
        "{{\"stage\": \"{}\", \"kind\": \"{}\", \"message\": \"{}\"",
        stage, kind, error
    );
    if let Some(partition) = partition {
        record.push_str(&format!(", \"partition\": {}", partition));
    }
    record.push('}');

    eprintln!("{}", record);
}

fn classify(error: &anyhow::Error) -> (&'static str, Option<usize>) {
    match error.downcast_ref::<Error>() {
        Some(Error::BadNucleotide { .. })
        | Some(Error::CantReadFile { .. })
        | Some(Error::ReadingError { .. }) => ("input", None),
        Some(Error::KmerSizeTooLarge { .. })
        | Some(Error::KmerSizeNull)
        | Some(Error::AbundanceNull)
        | Some(Error::BadMinimizerSize { .. })
        | Some(Error::KmerSizeTooSmallForLink)
        | Some(Error::PartitionBudgetExceeded)
        | Some(Error::MissingStage { .. }) => ("configuration", None),
        Some(Error::CantWriteFile { .. })
        | Some(Error::WritingError { .. })
        | Some(Error::AllocationFailed { .. }) => ("resource", None),
        Some(Error::PartitionWriteFailed { partition })
        | Some(Error::PartitionHashFull { partition }) => ("resource", Some(*partition)),
        Some(Error::RedirectionCycle) => ("invariant", None),
        Some(Error::NoSolidKmer) => ("pipeline", None),
        None => ("pipeline", None),
    }
}

type StageResult<T> = std::result::Result<T, (Stage, anyhow::Error)>;

fn at<T>(stage: Stage, result: Result<T>) -> StageResult<T> {
    result.map_err(|error| (stage, error))
}

fn run(params: cli::Command) -> StageResult<()> {
    match params.subcmd {
        cli::SubCommand::Dsk(sub) => {
            let storage = at(Stage::Configuration, GraphStorage::create(&sub.graph))?;
            let k = sub.kmer_size;
            let options = count_options(&sub);
            let factory = BankFactory::new();

            at(
                Stage::Count,
                with_span!(k, run_dsk(&factory, &sub.input, &storage, &options)),
            )?;
            Ok(())
        }
        cli::SubCommand::Debloom(sub) => {
            let storage = at(Stage::Configuration, GraphStorage::open(&sub.graph))?;
            let k = sub.kmer_size;
            let options = debloom::DebloomOptions {
                k,
                nb_cores: sub.nb_cores,
                max_memory_mib: sub.max_memory,
                cascading: sub.debloom == "cascading",
            };

            at(Stage::Debloom, with_span!(k, run_debloom(&storage, &options)))?;
            Ok(())
        }
        cli::SubCommand::Bcalm(sub) => {
            let storage = at(Stage::Configuration, GraphStorage::open(&sub.graph))?;
            let k = sub.kmer_size;
            let options = bcalm::BcalmOptions {
                k,
                nb_cores: sub.nb_cores,
            };

            at(Stage::Bcalm, with_span!(k, run_bcalm(&storage, &options)))?;
            Ok(())
        }
        cli::SubCommand::Linktigs(sub) => {
            let storage = at(Stage::Configuration, GraphStorage::open(&sub.graph))?;
            let k = sub.kmer_size;

            at(Stage::LinkTigs, with_span!(k, run_link(&storage, k)))?;
            Ok(())
        }
        cli::SubCommand::Simplify(sub) => {
            if sub.kmer_size == 0 {
                return Err((Stage::Configuration, Error::KmerSizeNull.into()));
            }
            if sub.kmer_size > 63 {
                return Err((
                    Stage::Configuration,
                    Error::KmerSizeTooLarge {
                        k: sub.kmer_size as u64,
                    }
                    .into(),
                ));
            }
            let storage = at(Stage::Configuration, GraphStorage::open(&sub.graph))?;

            let mut graph = at(Stage::Simplify, UnitigGraph::load(&storage, sub.kmer_size))?;
            let report = simplify::simplify(&mut graph, sub.simplify_passes);
            info!(
                "simplification removed {} tips, {} bubbles, {} erroneous connections in {} passes",
                report.nb_tips, report.nb_bubbles, report.nb_ec, report.nb_passes
            );

            at(Stage::Simplify, persist_graph(&storage, &graph))?;
            at(
                Stage::Simplify,
                write_outputs(&graph, &sub.out_fasta, &sub.out_gfa),
            )?;
            Ok(())
        }
        cli::SubCommand::Graph(sub) => {
            let storage = at(Stage::Configuration, GraphStorage::create(&sub.dsk.graph))?;
            let k = sub.dsk.kmer_size;
            let options = count_options(&sub.dsk);
            let factory = BankFactory::new();

            at(
                Stage::Count,
                with_span!(k, run_dsk(&factory, &sub.dsk.input, &storage, &options)),
            )?;

            let debloom_options = debloom::DebloomOptions {
                k,
                nb_cores: sub.dsk.nb_cores,
                max_memory_mib: sub.dsk.max_memory,
                cascading: sub.debloom == "cascading",
            };
            at(
                Stage::Debloom,
                with_span!(k, run_debloom(&storage, &debloom_options)),
            )?;

            let bcalm_options = bcalm::BcalmOptions {
                k,
                nb_cores: sub.dsk.nb_cores,
            };
            at(Stage::Bcalm, with_span!(k, run_bcalm(&storage, &bcalm_options)))?;
            at(Stage::LinkTigs, with_span!(k, run_link(&storage, k)))?;

            let mut graph = at(Stage::Simplify, UnitigGraph::load(&storage, k))?;
            let report = simplify::simplify(&mut graph, sub.simplify_passes);
            info!(
                "simplification removed {} tips, {} bubbles, {} erroneous connections in {} passes",
                report.nb_tips, report.nb_bubbles, report.nb_ec, report.nb_passes
            );
            at(Stage::Simplify, persist_graph(&storage, &graph))?;

            let kind: TraversalKind = sub
                .traversal
                .parse()
                .expect("validated by the argument parser");
            if kind != TraversalKind::None {
                let contigs = traversal::assemble(&mut graph, kind);
                info!("assembled {} contigs", contigs.len());

                if let Some(path) = &sub.out_contigs {
                    at(Stage::Simplify, write_contigs(path, &contigs))?;
                }
            }

            info!(
                "graph done: {} unitigs, {} deleted",
                graph.nb_unitigs(),
                graph.nb_deleted()
            );
            Ok(())
        }
    }
}

fn count_options(sub: &cli::Dsk) -> count::CountOptions {
    count::CountOptions {
        k: sub.kmer_size,
        m: sub.minimizer_size,
        abundance_min: sub.abundance_min,
        max_memory_mib: sub.max_memory,
        max_disk_mib: sub.max_disk,
        nb_cores: sub.nb_cores,
        mode: if sub.partition_type == "hash" {
            count::PartitionMode::Hash
        } else {
            count::PartitionMode::Vector
        },
        balance: if sub.minimizer_repartition == "heap" {
            Balance::Heap
        } else {
            Balance::Frequency
        },
    }
}

fn run_dsk<T: KmerInt>(
    factory: &BankFactory,
    input: &str,
    storage: &GraphStorage,
    options: &count::CountOptions,
) -> Result<()> {
    let report = count::sorting_count::<T>(factory, input, storage, options)?;
    info!(
        "counting done: {} solid kmers, {} distinct, {} total occurrences",
        report.nb_solid, report.nb_distinct, report.total_abundance
    );
    Ok(())
}

fn run_debloom<T: KmerInt>(storage: &GraphStorage, options: &debloom::DebloomOptions) -> Result<()> {
    let report = debloom::debloom::<T>(storage, options)?;
    info!(
        "debloom done: {} solid kmers, {} critical false positives, {} bloom bits",
        report.nb_solid, report.nb_cfp, report.bloom_bits
    );
    Ok(())
}

fn run_bcalm<T: KmerInt>(storage: &GraphStorage, options: &bcalm::BcalmOptions) -> Result<()> {
    let nb_unitigs = bcalm::build_unitigs::<T>(storage, options)?;
    info!("bcalm done: {} unitigs", nb_unitigs);
    Ok(())
}

fn run_link<T: KmerInt>(storage: &GraphStorage, k: usize) -> Result<()> {
    let nb_unitigs = link::link_tigs::<T>(storage, k)?;
    info!("linktigs done: {} unitigs", nb_unitigs);
    Ok(())
}

/// Rewrite `unitigs.fa` with the cleaned graph, ids kept stable.
fn persist_graph(storage: &GraphStorage, graph: &UnitigGraph) -> Result<()> {
    let mut writer = storage.create_collection("unitigs.fa")?;
    graph.write_fasta(&mut writer)?;
    writer.flush()?;
    Ok(())
}

fn write_outputs(
    graph: &UnitigGraph,
    out_fasta: &Option<String>,
    out_gfa: &Option<String>,
) -> Result<()> {
    if let Some(path) = out_fasta {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path).map_err(|_| {
            Error::CantWriteFile {
                filename: path.clone(),
            }
        })?);
        graph.write_fasta(&mut writer)?;
        writer.flush()?;
    }

    if let Some(path) = out_gfa {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path).map_err(|_| {
            Error::CantWriteFile {
                filename: path.clone(),
            }
        })?);
        graph.write_gfa(&mut writer)?;
        writer.flush()?;
    }

    Ok(())
}

fn write_contigs(path: &str, contigs: &[Vec<u8>]) -> Result<()> {
    let mut writer =
        std::io::BufWriter::new(
            std::fs::File::create(path).map_err(|_| Error::CantWriteFile {
                filename: path.to_string(),
            })?,
        );

    for (index, contig) in contigs.iter().enumerate() {
        writeln!(
            writer,
            ">{} LN:i:{}\n{}",
            index,
            contig.len(),
            String::from_utf8_lossy(contig)
        )?;
    }

    writer.flush()?;
    Ok(())
}
