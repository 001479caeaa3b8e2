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

/* crate use */
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "Reading of the file '{filename:}' impossible, does it exist and can be read by the user?"
    )]
    CantReadFile { filename: String },

    #[error("Creation/opening of the file '{filename:}' impossible, directory in path exist? can be write by the user?")]
    CantWriteFile { filename: String },

    #[error("Error durring reading of file {filename:}")]
    ReadingError { filename: String },

    #[error("Error durring writing of file {filename:}")]
    WritingError { filename: String },

    #[error("Nucleotide '{nucleotide:}' isn't a A, C, T or G")]
    BadNucleotide { nucleotide: char },

    #[error("Kmer size {k:} is too large for the available integer widths (maximal value 63)")]
    KmerSizeTooLarge { k: u64 },

    #[error("Kmer size must not be null")]
    KmerSizeNull,

    #[error("Abundance threshold must not be null")]
    AbundanceNull,

    #[error("Minimizer size {m:} must be smaller than kmer size {k:} and at most 15")]
    BadMinimizerSize { m: u64, k: u64 },

    #[error("Linking of unitigs doesn't support kmer size lower than 5")]
    KmerSizeTooSmallForLink,

    #[error("Number of partitions can't fit in the open file budget, even after increasing the number of passes")]
    PartitionBudgetExceeded,

    #[error("No solid kmer found, is the abundance threshold too high for this input?")]
    NoSolidKmer,

    #[error("Not enough memory to build the structure '{name:}'")]
    AllocationFailed { name: String },

    #[error("Write failure on partition {partition:}")]
    PartitionWriteFailed { partition: usize },

    #[error("Counting hash of partition {partition:} is full, increase memory or switch to vector mode")]
    PartitionHashFull { partition: usize },

    #[error("Unitig redirection doesn't converge, this is a bug, please contact the author with the command line you use")]
    RedirectionCycle,

    #[error("The graph directory '{path:}' is incomplete, stage '{stage:}' must run before")]
    MissingStage { path: String, stage: String },
}

/// Exit code of the command line tool: 1 configuration or usage, 2 io, 3 pipeline.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<Error>() {
        Some(Error::BadNucleotide { .. })
        | Some(Error::KmerSizeTooLarge { .. })
        | Some(Error::KmerSizeNull)
        | Some(Error::AbundanceNull)
        | Some(Error::BadMinimizerSize { .. })
        | Some(Error::KmerSizeTooSmallForLink)
        | Some(Error::PartitionBudgetExceeded)
        | Some(Error::MissingStage { .. }) => 1,
        Some(Error::CantReadFile { .. })
        | Some(Error::CantWriteFile { .. })
        | Some(Error::ReadingError { .. })
        | Some(Error::WritingError { .. })
        | Some(Error::PartitionWriteFailed { .. }) => 2,
        Some(Error::NoSolidKmer)
        | Some(Error::AllocationFailed { .. })
        | Some(Error::PartitionHashFull { .. })
        | Some(Error::RedirectionCycle) => 3,
        None => {
            if error.downcast_ref::<std::io::Error>().is_some() {
                2
            } else {
                3
            }
        }
    }
}

/// Stage tag carried by the structured record written on stderr for fatal errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stage {
    Configuration,
    Count,
    Debloom,
    Bcalm,
    LinkTigs,
    Simplify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Stage::Configuration => write!(f, "configuration"),
            Stage::Count => write!(f, "count"),
            Stage::Debloom => write!(f, "debloom"),
            Stage::Bcalm => write!(f, "bcalm"),
            Stage::LinkTigs => write!(f, "linktigs"),
            Stage::Simplify => write!(f, "simplify"),
        }
    }
}
