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

//! Sequence input: fasta and fastq, transparently decompressed, plus the
//! volume estimation used by the counting configuration.

/* std use */
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/* crate use */
use anyhow::{Context, Result};

/* local use */
use crate::error::Error;

/// One input sequence. Quality is only present for fastq input.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: u64,
    pub comment: String,
    pub data: Vec<u8>,
    pub quality: Option<Vec<u8>>,
}

/// Volume estimation of a bank, from a bounded sample scan.
#[derive(Debug, Clone, Copy)]
pub struct BankEstimation {
    pub nb_sequences: u64,
    pub total_nt: u64,
    pub max_len: u64,
}

struct CountingReader {
    inner: std::fs::File,
    consumed: Arc<AtomicU64>,
}

impl Read for CountingReader {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buffer)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

enum Records {
    Fasta(bio::io::fasta::Records<BufReader<Box<dyn Read>>>),
    Fastq(bio::io::fastq::Records<BufReader<Box<dyn Read>>>),
}

/// An open sequence bank, iterated once from the start.
pub struct Bank {
    filename: String,
    records: Records,
    counter: u64,
    consumed: Arc<AtomicU64>,
}

impl Bank {
    /// Compressed bytes consumed so far, used by the volume estimation.
    pub fn consumed_bytes(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
}

impl Iterator for Bank {
    type Item = Result<Sequence>;

    fn next(&mut self) -> Option<Result<Sequence>> {
        let filename = self.filename.clone();
        let id = self.counter;

        let item = match &mut self.records {
            Records::Fasta(records) => records.next().map(|record| {
                record
                    .map(|rec| Sequence {
                        id,
                        comment: format!("{} {}", rec.id(), rec.desc().unwrap_or("")),
                        data: rec.seq().to_vec(),
                        quality: None,
                    })
                    .with_context(|| Error::ReadingError { filename })
            }),
            Records::Fastq(records) => records.next().map(|record| {
                record
                    .map(|rec| Sequence {
                        id,
                        comment: format!("{} {}", rec.id(), rec.desc().unwrap_or("")),
                        data: rec.seq().to_vec(),
                        quality: Some(rec.qual().to_vec()),
                    })
                    .with_context(|| Error::ReadingError { filename })
            }),
        };

        if item.is_some() {
            self.counter += 1;
        }

        item
    }
}

/// Opens banks for every stage that needs one; passed around explicitly, no
/// process wide registry.
#[derive(Clone, Default)]
pub struct BankFactory {}

impl BankFactory {
    pub fn new() -> Self {
        BankFactory {}
    }

    fn open_raw(&self, filename: &str) -> Result<(Box<dyn Read>, Arc<AtomicU64>)> {
        let consumed = Arc::new(AtomicU64::new(0));
        let file = std::fs::File::open(filename).with_context(|| Error::CantReadFile {
            filename: filename.to_string(),
        })?;

        let counting = CountingReader {
            inner: file,
            consumed: Arc::clone(&consumed),
        };

        let (reader, _compression) =
            niffler::get_reader(Box::new(BufReader::new(counting))).with_context(|| {
                Error::CantReadFile {
                    filename: filename.to_string(),
                }
            })?;

        Ok((reader, consumed))
    }

    pub fn open(&self, filename: &str) -> Result<Bank> {
        let (reader, consumed) = self.open_raw(filename)?;

        let mut buffered = BufReader::new(reader);
        let first = {
            let buffer = buffered.fill_buf().with_context(|| Error::ReadingError {
                filename: filename.to_string(),
            })?;
            buffer.first().copied()
        };

        let records = match first {
            Some(b'>') => Records::Fasta(bio::io::fasta::Reader::from_bufread(buffered).records()),
            Some(b'@') => Records::Fastq(bio::io::fastq::Reader::from_bufread(buffered).records()),
            _ => {
                return Err(Error::ReadingError {
                    filename: filename.to_string(),
                }
                .into())
            }
        };

        Ok(Bank {
            filename: filename.to_string(),
            records,
            counter: 0,
            consumed,
        })
    }

    /// Scan at most `sample` sequences and extrapolate the totals from the
    /// share of compressed bytes consumed.
    pub fn estimate(&self, filename: &str, sample: u64) -> Result<BankEstimation> {
        let file_size = std::fs::metadata(filename)
            .with_context(|| Error::CantReadFile {
                filename: filename.to_string(),
            })?
            .len();

        let mut bank = self.open(filename)?;

        let mut nb_sequences = 0u64;
        let mut total_nt = 0u64;
        let mut max_len = 0u64;
        let mut exhausted = true;

        while let Some(sequence) = bank.next() {
            let sequence = sequence?;
            nb_sequences += 1;
            total_nt += sequence.data.len() as u64;
            max_len = max_len.max(sequence.data.len() as u64);

            if nb_sequences >= sample {
                exhausted = false;
                break;
            }
        }

        if !exhausted && nb_sequences > 0 {
            // extrapolate by the share of compressed bytes consumed
            let consumed = bank.consumed_bytes().max(1);
            let ratio = file_size as f64 / consumed as f64;
            let mean = total_nt / nb_sequences;

            nb_sequences = ((nb_sequences as f64 * ratio) as u64).max(nb_sequences);
            total_nt = nb_sequences * mean;
        }

        Ok(BankEstimation {
            nb_sequences,
            total_nt,
            max_len,
        })
    }
}

/// Cooperative cancellation wrapper: the shared flag is checked at each
/// `next`, nothing is interrupted mid item.
pub struct CancellableIterator<I> {
    inner: I,
    cancel: Arc<AtomicBool>,
}

impl<I> CancellableIterator<I> {
    pub fn new(inner: I) -> (Self, Arc<AtomicBool>) {
        let cancel = Arc::new(AtomicBool::new(false));
        (
            CancellableIterator {
                inner,
                cancel: Arc::clone(&cancel),
            },
            cancel,
        )
    }
}

impl<I: Iterator> Iterator for CancellableIterator<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        if self.cancel.load(Ordering::Relaxed) {
            return None;
        }

        self.inner.next()
    }
}
