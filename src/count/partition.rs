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

//! Partition files: framed blocks `[u32 size][payload]` of fixed width big
//! endian kmers, written through per worker caches over one mutex per
//! partition file.

/* std use */
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/* crate use */
use anyhow::{Context, Result};

/* local use */
use crate::error::Error;
use crate::kmer::KmerInt;

/// Flush threshold of the per worker caches, in records per partition.
const CACHE_RECORDS: usize = 1 << 12;

/// Per partition counters, merged with atomic adds.
pub struct PartiInfo {
    nb_kmers: Vec<AtomicU64>,
}

impl PartiInfo {
    pub fn new(nb_partitions: usize) -> Self {
        let mut nb_kmers = Vec::with_capacity(nb_partitions);
        nb_kmers.resize_with(nb_partitions, || AtomicU64::new(0));
        PartiInfo { nb_kmers }
    }

    pub fn add(&self, partition: usize, count: u64) {
        self.nb_kmers[partition].fetch_add(count, Ordering::Relaxed);
    }

    pub fn nb_kmers(&self, partition: usize) -> u64 {
        self.nb_kmers[partition].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.nb_kmers
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum()
    }
}

/// The shared, thread safe side of a set of partition files.
pub struct PartitionSink {
    files: Vec<Mutex<BufWriter<std::fs::File>>>,
    paths: Vec<PathBuf>,
    info: PartiInfo,
}

impl PartitionSink {
    pub fn new(directory: &Path, nb_partitions: usize) -> Result<Self> {
        let mut files = Vec::with_capacity(nb_partitions);
        let mut paths = Vec::with_capacity(nb_partitions);

        for partition in 0..nb_partitions {
            let path = directory.join(format!("part-{}.tmp", partition));
            let file = std::fs::File::create(&path).with_context(|| Error::CantWriteFile {
                filename: path.display().to_string(),
            })?;
            files.push(Mutex::new(BufWriter::new(file)));
            paths.push(path);
        }

        Ok(PartitionSink {
            files,
            paths,
            info: PartiInfo::new(nb_partitions),
        })
    }

    pub fn nb_partitions(&self) -> usize {
        self.files.len()
    }

    pub fn info(&self) -> &PartiInfo {
        &self.info
    }

    pub fn path(&self, partition: usize) -> &Path {
        &self.paths[partition]
    }

    /// Write one framed block of kmers under the partition mutex.
    pub fn write_block<T: KmerInt>(&self, partition: usize, kmers: &[T]) -> Result<()> {
        if kmers.is_empty() {
            return Ok(());
        }

        let mut payload = vec![0u8; kmers.len() * T::BYTES];
        for (index, kmer) in kmers.iter().enumerate() {
            kmer.write_be(&mut payload[index * T::BYTES..]);
        }

        {
            let mut guard = self
                .files
                .get(partition)
                .ok_or(Error::PartitionWriteFailed { partition })?
                .lock()
                .map_err(|_| Error::PartitionWriteFailed { partition })?;

            guard
                .write_all(&(payload.len() as u32).to_le_bytes())
                .and_then(|_| guard.write_all(&payload))
                .map_err(|_| Error::PartitionWriteFailed { partition })?;
        }

        self.info.add(partition, kmers.len() as u64);

        Ok(())
    }

    /// Flush every partition file, to call once after all caches are done.
    pub fn finish(&self) -> Result<()> {
        for (partition, file) in self.files.iter().enumerate() {
            let mut guard = file
                .lock()
                .map_err(|_| Error::PartitionWriteFailed { partition })?;
            guard
                .flush()
                .map_err(|_| Error::PartitionWriteFailed { partition })?;
        }
        Ok(())
    }

    /// Remove the partition files of this pass.
    pub fn remove(self) -> Result<()> {
        for path in &self.paths {
            if path.exists() {
                std::fs::remove_file(path).with_context(|| Error::CantWriteFile {
                    filename: path.display().to_string(),
                })?;
            }
        }
        Ok(())
    }
}

/// Small per worker buffer in front of the sink; one vector per partition,
/// flushed as a block when full and on drop.
pub struct PartitionCache<'a, T: KmerInt> {
    sink: &'a PartitionSink,
    buffers: Vec<Vec<T>>,
    error: Option<anyhow::Error>,
}

impl<'a, T: KmerInt> PartitionCache<'a, T> {
    pub fn new(sink: &'a PartitionSink) -> Self {
        PartitionCache {
            buffers: vec![Vec::new(); sink.nb_partitions()],
            sink,
            error: None,
        }
    }

    pub fn push(&mut self, partition: usize, kmer: T) {
        self.buffers[partition].push(kmer);

        if self.buffers[partition].len() >= CACHE_RECORDS {
            self.flush_one(partition);
        }
    }

    fn flush_one(&mut self, partition: usize) {
        if self.error.is_some() {
            return;
        }

        if let Err(error) = self.sink.write_block(partition, &self.buffers[partition]) {
            self.error = Some(error);
        }
        self.buffers[partition].clear();
    }

    pub fn finish(mut self) -> Result<()> {
        for partition in 0..self.buffers.len() {
            if !self.buffers[partition].is_empty() {
                self.flush_one(partition);
            }
        }

        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Streaming reader over one partition file.
pub struct PartitionReader<T> {
    reader: BufReader<std::fs::File>,
    block: Vec<u8>,
    offset: usize,
    phantom: std::marker::PhantomData<T>,
}

impl<T: KmerInt> PartitionReader<T> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).with_context(|| Error::CantReadFile {
            filename: path.display().to_string(),
        })?;

        Ok(PartitionReader {
            reader: BufReader::new(file),
            block: Vec::new(),
            offset: 0,
            phantom: std::marker::PhantomData,
        })
    }

    fn refill(&mut self) -> bool {
        let mut size_buffer = [0u8; 4];
        if self.reader.read_exact(&mut size_buffer).is_err() {
            return false;
        }

        let size = u32::from_le_bytes(size_buffer) as usize;
        self.block.resize(size, 0);
        self.offset = 0;

        self.reader.read_exact(&mut self.block).is_ok()
    }
}

impl<T: KmerInt> Iterator for PartitionReader<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.offset + T::BYTES > self.block.len() && !self.refill() {
            return None;
        }

        let kmer = T::read_be(&self.block[self.offset..]);
        self.offset += T::BYTES;
        Some(kmer)
    }
}

/// Writer for the solid collection of one partition: `(kmer, u16 count)`
/// records in the same framed block format.
pub struct SolidWriter<W: Write> {
    writer: W,
    buffer: Vec<u8>,
}

impl<W: Write> SolidWriter<W> {
    pub fn new(writer: W) -> Self {
        SolidWriter {
            writer,
            buffer: Vec::new(),
        }
    }

    pub fn push<T: KmerInt>(&mut self, kmer: T, count: u16) -> Result<()> {
        let start = self.buffer.len();
        self.buffer.resize(start + T::BYTES + 2, 0);
        kmer.write_be(&mut self.buffer[start..]);
        self.buffer[start + T::BYTES..start + T::BYTES + 2].copy_from_slice(&count.to_le_bytes());

        if self.buffer.len() >= CACHE_RECORDS * (T::BYTES + 2) {
            self.flush_block()?;
        }

        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.writer
            .write_all(&(self.buffer.len() as u32).to_le_bytes())?;
        self.writer.write_all(&self.buffer)?;
        self.buffer.clear();

        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.flush_block()?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Streaming reader over one solid collection.
pub struct SolidReader<T, R: Read> {
    reader: R,
    block: Vec<u8>,
    offset: usize,
    phantom: std::marker::PhantomData<T>,
}

impl<T: KmerInt, R: Read> SolidReader<T, R> {
    pub fn new(reader: R) -> Self {
        SolidReader {
            reader,
            block: Vec::new(),
            offset: 0,
            phantom: std::marker::PhantomData,
        }
    }

    fn refill(&mut self) -> bool {
        let mut size_buffer = [0u8; 4];
        if self.reader.read_exact(&mut size_buffer).is_err() {
            return false;
        }

        let size = u32::from_le_bytes(size_buffer) as usize;
        self.block.resize(size, 0);
        self.offset = 0;

        self.reader.read_exact(&mut self.block).is_ok()
    }
}

impl<T: KmerInt, R: Read> Iterator for SolidReader<T, R> {
    type Item = (T, u16);

    fn next(&mut self) -> Option<(T, u16)> {
        let record = T::BYTES + 2;
        if self.offset + record > self.block.len() && !self.refill() {
            return None;
        }

        let kmer = T::read_be(&self.block[self.offset..]);
        let count = u16::from_le_bytes([
            self.block[self.offset + T::BYTES],
            self.block[self.offset + T::BYTES + 1],
        ]);
        self.offset += record;

        Some((kmer, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PartitionSink::new(dir.path(), 3).unwrap();

        let mut cache = PartitionCache::<u64>::new(&sink);
        for value in 0..100u64 {
            cache.push((value % 3) as usize, value);
        }
        cache.finish().unwrap();
        sink.finish().unwrap();

        assert_eq!(sink.info().total(), 100);
        assert_eq!(sink.info().nb_kmers(0), 34);

        let kmers: Vec<u64> = PartitionReader::open(sink.path(1)).unwrap().collect();
        assert_eq!(kmers.len(), 33);
        assert!(kmers.iter().all(|value| value % 3 == 1));
    }

    #[test]
    fn solid_records_roundtrip() {
        let mut buffer = Vec::new();
        {
            let mut writer = SolidWriter::new(&mut buffer);
            writer.push(42u64, 3).unwrap();
            writer.push(1337u64, 65535).unwrap();
            writer.finish().unwrap();
        }

        let records: Vec<(u64, u16)> = SolidReader::new(&buffer[..]).collect();
        assert_eq!(records, vec![(42, 3), (1337, 65535)]);
    }

    #[test]
    fn remove_cleans_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PartitionSink::new(dir.path(), 2).unwrap();
        let path = sink.path(0).to_path_buf();
        assert!(path.exists());

        sink.remove().unwrap();
        assert!(!path.exists());
    }
}
