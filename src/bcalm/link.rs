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

//! Unitig to unitig (k-1)-overlap links. Boundary kmers are hashed over a
//! fixed number of passes so peak memory is a fraction of the extremity
//! count; each pass writes `L:±:id:±` lines to its own file and a final
//! n-way merge appends them to the unitig records in ascending id order.

/* std use */
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/* crate use */
use anyhow::{Context, Result};
use log::info;
use rustc_hash::FxHashMap;

/* local use */
use crate::error::Error;
use crate::kmer;
use crate::kmer::KmerInt;
use crate::storage::{BuildState, GraphStorage};
use crate::unitig::{ExtremityInfo, UnitigPos};

pub const NB_PASSES: u64 = 8;

/// Canonical 4-mer of the first and last two nucleotides of the boundary
/// (k-1)-mer starting at `offset`, used to spread boundaries over passes.
fn smallmer4(seq: &[u8], offset: usize, k: usize) -> u32 {
    let nucs = [
        seq[offset],
        seq[offset + 1],
        seq[offset + k - 3],
        seq[offset + k - 2],
    ];

    let mut value = 0u64;
    for &nuc in &nucs {
        value = (value << 2) | kmer::nuc2bit(nuc).unwrap_or(0) as u64;
    }

    std::cmp::min(value, kmer::revcomp(value, 4)) as u32
}

fn is_in_pass(seq: &[u8], pass: u64, pos: UnitigPos, k: usize) -> bool {
    let offset = match pos {
        UnitigPos::End => seq.len() - (k - 1),
        _ => 0,
    };

    smallmer4(seq, offset, k) as u64 % NB_PASSES == pass
}

fn links_path(unitigs: &Path, pass: u64) -> PathBuf {
    PathBuf::from(format!("{}.links.{}", unitigs.display(), pass))
}

fn open_unitigs(path: &Path) -> Result<bio::io::fasta::Records<BufReader<std::fs::File>>> {
    let file = std::fs::File::open(path).with_context(|| Error::CantReadFile {
        filename: path.display().to_string(),
    })?;
    Ok(bio::io::fasta::Reader::from_bufread(BufReader::new(file)).records())
}

/// One hashed pass: populate the boundary map, then validate every
/// extremity against it and write its link lines.
fn link_unitigs_pass<T: KmerInt>(unitigs_path: &Path, pass: u64, k: usize) -> Result<()> {
    let overlap = k - 1;
    let palindromic_possible = overlap % 2 == 0;

    let mut boundary_map: FxHashMap<T, Vec<u64>> = FxHashMap::default();

    // step 1: record extremities of this pass
    let mut counter = 0u64;
    for record in open_unitigs(unitigs_path)? {
        let record = record.with_context(|| Error::ReadingError {
            filename: unitigs_path.display().to_string(),
        })?;
        let seq = record.seq();

        if is_in_pass(seq, pass, UnitigPos::Begin, k) {
            let direct: T = kmer::seq2bit(&seq[..overlap])?;
            let cano = kmer::canonical(direct, overlap);
            let begin_same = cano == direct;

            boundary_map.entry(cano).or_insert_with(Vec::new).push(
                ExtremityInfo {
                    unitig: counter,
                    rc: !begin_same,
                    pos: UnitigPos::Begin,
                }
                .pack(),
            );
        }
        if is_in_pass(seq, pass, UnitigPos::End, k) {
            let direct: T = kmer::seq2bit(&seq[seq.len() - overlap..])?;
            let cano = kmer::canonical(direct, overlap);
            let end_same = cano == direct;

            boundary_map.entry(cano).or_insert_with(Vec::new).push(
                ExtremityInfo {
                    unitig: counter,
                    rc: !end_same,
                    pos: UnitigPos::End,
                }
                .pack(),
            );
        }

        counter += 1;
    }

    // step 2: validate the orientation quartet and write link lines
    let path = links_path(unitigs_path, pass);
    let file = std::fs::File::create(&path).with_context(|| Error::CantWriteFile {
        filename: path.display().to_string(),
    })?;
    let mut links_file = BufWriter::new(file);

    let empty: Vec<u64> = Vec::new();
    let mut counter = 0u64;
    for record in open_unitigs(unitigs_path)? {
        let record = record.with_context(|| Error::ReadingError {
            filename: unitigs_path.display().to_string(),
        })?;
        let seq = record.seq();

        if is_in_pass(seq, pass, UnitigPos::Begin, k) {
            let direct: T = kmer::seq2bit(&seq[..overlap])?;
            let cano = kmer::canonical(direct, overlap);
            let begin_same = cano == direct;
            let nevermind = palindromic_possible && kmer::is_palindrome(direct, overlap);

            let mut in_links = String::from(" ");
            for &packed in boundary_map.get(&cano).unwrap_or(&empty) {
                let extremity = ExtremityInfo::unpack(packed);

                let valid = (begin_same && extremity.pos == UnitigPos::End && !extremity.rc)
                    || (begin_same && extremity.pos == UnitigPos::Begin && extremity.rc)
                    || (!begin_same && extremity.pos == UnitigPos::End && extremity.rc)
                    || (!begin_same && extremity.pos == UnitigPos::Begin && !extremity.rc);

                if valid || nevermind {
                    // which end of the neighbor sits at the junction decides
                    // its traversal orientation
                    let rc = extremity.pos == UnitigPos::End;
                    in_links.push_str(&format!(
                        "L:-:{}:{} ",
                        extremity.unitig,
                        if rc { '-' } else { '+' }
                    ));
                }
            }

            writeln!(links_file, "{}\n{}", counter, in_links)?;
        }

        if is_in_pass(seq, pass, UnitigPos::End, k) {
            let direct: T = kmer::seq2bit(&seq[seq.len() - overlap..])?;
            let cano = kmer::canonical(direct, overlap);
            let end_same = cano == direct;
            let nevermind = palindromic_possible && kmer::is_palindrome(direct, overlap);

            let mut out_links = String::from(" ");
            for &packed in boundary_map.get(&cano).unwrap_or(&empty) {
                let extremity = ExtremityInfo::unpack(packed);

                let valid = (end_same && extremity.pos == UnitigPos::Begin && !extremity.rc)
                    || (end_same && extremity.pos == UnitigPos::End && extremity.rc)
                    || (!end_same && extremity.pos == UnitigPos::Begin && extremity.rc)
                    || (!end_same && extremity.pos == UnitigPos::End && !extremity.rc);

                if valid || nevermind {
                    let rc = extremity.pos == UnitigPos::End;
                    out_links.push_str(&format!(
                        "L:+:{}:{} ",
                        extremity.unitig,
                        if rc { '-' } else { '+' }
                    ));
                }
            }

            writeln!(links_file, "{}\n{}", counter, out_links)?;
        }

        counter += 1;
    }

    links_file.flush()?;
    Ok(())
}

fn next_link<R: BufRead>(reader: &mut R) -> Option<(u64, String)> {
    let mut id_line = String::new();
    if reader.read_line(&mut id_line).ok()? == 0 {
        return None;
    }
    let unitig = id_line.trim().parse::<u64>().ok()?;

    let mut link_line = String::new();
    if reader.read_line(&mut link_line).ok()? == 0 {
        return None;
    }

    Some((unitig, link_line.trim_end_matches('\n').to_string()))
}

/// n-way merge of the per pass link files, in ascending unitig id order,
/// appending the gathered links to each record's comment.
fn write_final_output(unitigs_path: &Path) -> Result<u64> {
    let mut inputs = Vec::new();
    let mut heap: BinaryHeap<Reverse<(u64, usize, String)>> = BinaryHeap::new();

    for pass in 0..NB_PASSES {
        let path = links_path(unitigs_path, pass);
        let file = std::fs::File::open(&path).with_context(|| Error::CantReadFile {
            filename: path.display().to_string(),
        })?;
        let mut reader = BufReader::new(file);

        if let Some((unitig, link)) = next_link(&mut reader) {
            heap.push(Reverse((unitig, pass as usize, link)));
        }
        inputs.push(reader);
    }

    let indexed_path = PathBuf::from(format!("{}.indexed", unitigs_path.display()));
    let out_file = std::fs::File::create(&indexed_path).with_context(|| Error::CantWriteFile {
        filename: indexed_path.display().to_string(),
    })?;
    let mut out = BufWriter::new(out_file);

    let mut records = open_unitigs(unitigs_path)?;
    let mut current = match records.next() {
        Some(record) => record.with_context(|| Error::ReadingError {
            filename: unitigs_path.display().to_string(),
        })?,
        None => return Err(Error::NoSolidKmer.into()),
    };

    let mut write_record =
        |record: &bio::io::fasta::Record, links: &str, out: &mut BufWriter<std::fs::File>| -> Result<()> {
            writeln!(
                out,
                ">{} {} {}\n{}",
                record.id(),
                record.desc().unwrap_or(""),
                links.split_whitespace().collect::<Vec<_>>().join(" "),
                String::from_utf8_lossy(record.seq())
            )?;
            Ok(())
        };

    let mut last_unitig = 0u64;
    let mut current_links = String::new();
    let mut nb_unitigs = 0u64;

    while let Some(Reverse((unitig, pass, link))) = heap.pop() {
        if unitig != last_unitig {
            write_record(&current, &current_links, &mut out)?;
            nb_unitigs += 1;
            current_links.clear();
            last_unitig = unitig;

            current = match records.next() {
                Some(record) => record.with_context(|| Error::ReadingError {
                    filename: unitigs_path.display().to_string(),
                })?,
                None => return Err(Error::RedirectionCycle.into()),
            };
        }

        current_links.push_str(&link);

        if let Some((next_unitig, next_line)) = next_link(&mut inputs[pass]) {
            heap.push(Reverse((next_unitig, pass, next_line)));
        }
    }

    write_record(&current, &current_links, &mut out)?;
    nb_unitigs += 1;
    out.flush()?;

    for pass in 0..NB_PASSES {
        std::fs::remove_file(links_path(unitigs_path, pass)).ok();
    }

    std::fs::remove_file(unitigs_path).with_context(|| Error::CantWriteFile {
        filename: unitigs_path.display().to_string(),
    })?;
    std::fs::rename(&indexed_path, unitigs_path).with_context(|| Error::CantWriteFile {
        filename: unitigs_path.display().to_string(),
    })?;

    Ok(nb_unitigs)
}

/// Full link stage over `unitigs.fa` inside the graph storage.
pub fn link_tigs<T: KmerInt>(storage: &GraphStorage, k: usize) -> Result<u64> {
    if k < 5 {
        return Err(Error::KmerSizeTooSmallForLink.into());
    }

    let unitigs_path = storage.collection("unitigs.fa");

    info!("Begin of unitig linking");
    for pass in 0..NB_PASSES {
        link_unitigs_pass::<T>(&unitigs_path, pass, k)?;
    }

    let nb_unitigs = write_final_output(&unitigs_path)?;
    info!("End of unitig linking, {} unitigs", nb_unitigs);

    storage.set_state(storage.state().with(BuildState::BCALM2_DONE))?;

    Ok(nb_unitigs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_unitigs(storage: &GraphStorage, unitigs: &[&str]) {
        let mut writer = storage.create_collection("unitigs.fa").unwrap();
        for (index, seq) in unitigs.iter().enumerate() {
            writeln!(writer, ">{} LN:i:{} ka:f:1.0\n{}", index, seq.len(), seq).unwrap();
        }
        writer.flush().unwrap();
    }

    fn read_comments(storage: &GraphStorage) -> Vec<String> {
        let reader = storage.open_collection("unitigs.fa").unwrap();
        bio::io::fasta::Reader::from_bufread(reader)
            .records()
            .map(|record| record.unwrap().desc().unwrap_or("").to_string())
            .collect()
    }

    fn storage() -> (tempfile::TempDir, GraphStorage) {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphStorage::create(dir.path().join("graph")).unwrap();
        (dir, graph)
    }

    #[test]
    fn refuse_small_k() {
        let (_dir, graph) = storage();
        write_unitigs(&graph, &["ACGTA"]);
        assert!(link_tigs::<u64>(&graph, 4).is_err());
    }

    #[test]
    fn forward_overlap_links_both_ways() {
        let k = 5;
        // TAACCG ends with ACCG, ACCGATT begins with ACCG
        let (_dir, graph) = storage();
        write_unitigs(&graph, &["TAACCG", "ACCGATT"]);

        let nb = link_tigs::<u64>(&graph, k).unwrap();
        assert_eq!(nb, 2);

        let comments = read_comments(&graph);
        assert!(comments[0].contains("L:+:1:+"), "got '{}'", comments[0]);
        assert!(comments[1].contains("L:-:0:-"), "got '{}'", comments[1]);
    }

    #[test]
    fn link_symmetry_with_reverse_complement() {
        let k = 5;
        // the second unitig is stored reverse complemented:
        // revcomp(ACCGATT) = AATCGGT, its END holds revcomp(ACCG) = CGGT
        let (_dir, graph) = storage();
        write_unitigs(&graph, &["TAACCG", "AATCGGT"]);

        let nb = link_tigs::<u64>(&graph, k).unwrap();
        assert_eq!(nb, 2);

        let comments = read_comments(&graph);
        // leaving 0 forward reaches 1 reversed; P7: 1 mirrors with an
        // outgoing link (its end) toward 0
        assert!(comments[0].contains("L:+:1:-"), "got '{}'", comments[0]);
        assert!(comments[1].contains("L:+:0:-"), "got '{}'", comments[1]);
    }

    #[test]
    fn palindromic_boundary_relaxed() {
        let k = 5;
        // boundary 4-mer GTAC is its own reverse complement
        let (_dir, graph) = storage();
        write_unitigs(&graph, &["CGTAC", "GTACC"]);

        link_tigs::<u64>(&graph, k).unwrap();

        let comments = read_comments(&graph);
        // the palindromic junction accepts the link in every orientation
        assert!(comments[0].contains("L:+:1:"), "got '{}'", comments[0]);
        assert!(comments[1].contains("L:-:0:"), "got '{}'", comments[1]);
    }
}
