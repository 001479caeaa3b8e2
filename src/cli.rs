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
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    version = "0.1",
    author = "Pierre Marijon <pierre@marijon.fr>",
    name = "brindille",
    about = "Build, debloom and simplify a compacted de Bruijn graph from sequencing reads."
)]
pub struct Command {
    #[structopt(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(StructOpt, Debug)]
pub enum SubCommand {
    #[structopt(about = "Count canonical kmers and keep the solid ones")]
    Dsk(Dsk),
    #[structopt(about = "Build the bloom filter and its critical false positive sidelist")]
    Debloom(Debloom),
    #[structopt(about = "Compact solid kmers into maximal unitigs")]
    Bcalm(Bcalm),
    #[structopt(about = "Compute the (k-1)-overlap links between unitigs")]
    Linktigs(Linktigs),
    #[structopt(about = "Remove tips, bubbles and erroneous connections")]
    Simplify(Simplify),
    #[structopt(about = "Run the whole pipeline, reads to cleaned unitig graph")]
    Graph(Graph),
}

#[derive(StructOpt, Debug)]
pub struct Dsk {
    #[structopt(
        short = "i",
        long = "input",
        required = true,
        help = "path to the reads, fasta or fastq, gzip accepted"
    )]
    pub input: String,

    #[structopt(
        short = "g",
        long = "graph",
        required = true,
        help = "path of the graph output directory"
    )]
    pub graph: String,

    #[structopt(
        short = "k",
        long = "kmer-size",
        default_value = "31",
        help = "kmer size, max value 63"
    )]
    pub kmer_size: usize,

    #[structopt(
        short = "m",
        long = "minimizer-size",
        default_value = "8",
        help = "minimizer size, max value 15"
    )]
    pub minimizer_size: usize,

    #[structopt(
        short = "a",
        long = "abundance-min",
        default_value = "2",
        help = "keep only kmer with abundance higher or equal to this value"
    )]
    pub abundance_min: u16,

    #[structopt(
        long = "max-memory",
        default_value = "2000",
        help = "memory budget in MiB"
    )]
    pub max_memory: u64,

    #[structopt(
        long = "max-disk",
        default_value = "0",
        help = "disk budget in MiB, 0 let the tool choose"
    )]
    pub max_disk: u64,

    #[structopt(short = "t", long = "nb-cores", default_value = "1", help = "worker thread number")]
    pub nb_cores: usize,

    #[structopt(
        long = "partition-type",
        default_value = "vector",
        possible_values = &["hash", "vector"],
        help = "partition counting mode, hash use less disk, vector less cpu"
    )]
    pub partition_type: String,

    #[structopt(
        long = "minimizer-repartition",
        default_value = "frequency",
        possible_values = &["frequency", "heap"],
        help = "minimizer to partition balancing algorithm"
    )]
    pub minimizer_repartition: String,
}

#[derive(StructOpt, Debug)]
pub struct Debloom {
    #[structopt(
        short = "g",
        long = "graph",
        required = true,
        help = "path of the graph directory produced by dsk"
    )]
    pub graph: String,

    #[structopt(short = "k", long = "kmer-size", default_value = "31", help = "kmer size")]
    pub kmer_size: usize,

    #[structopt(long = "max-memory", default_value = "2000", help = "memory budget in MiB")]
    pub max_memory: u64,

    #[structopt(short = "t", long = "nb-cores", default_value = "1", help = "worker thread number")]
    pub nb_cores: usize,

    #[structopt(
        long = "bloom",
        default_value = "basic",
        possible_values = &["basic", "cache"],
        help = "bloom filter flavour"
    )]
    pub bloom: String,

    #[structopt(
        long = "debloom",
        default_value = "cascading",
        possible_values = &["none", "cascading"],
        help = "critical false positive construction, none keep the raw bloom"
    )]
    pub debloom: String,
}

#[derive(StructOpt, Debug)]
pub struct Bcalm {
    #[structopt(
        short = "g",
        long = "graph",
        required = true,
        help = "path of the graph directory produced by dsk"
    )]
    pub graph: String,

    #[structopt(short = "k", long = "kmer-size", default_value = "31", help = "kmer size")]
    pub kmer_size: usize,

    #[structopt(short = "t", long = "nb-cores", default_value = "1", help = "worker thread number")]
    pub nb_cores: usize,
}

#[derive(StructOpt, Debug)]
pub struct Linktigs {
    #[structopt(
        short = "g",
        long = "graph",
        required = true,
        help = "path of the graph directory produced by bcalm"
    )]
    pub graph: String,

    #[structopt(short = "k", long = "kmer-size", default_value = "31", help = "kmer size")]
    pub kmer_size: usize,
}

#[derive(StructOpt, Debug)]
pub struct Simplify {
    #[structopt(
        short = "g",
        long = "graph",
        required = true,
        help = "path of the graph directory produced by linktigs"
    )]
    pub graph: String,

    #[structopt(short = "k", long = "kmer-size", default_value = "31", help = "kmer size")]
    pub kmer_size: usize,

    #[structopt(
        short = "p",
        long = "simplify-passes",
        default_value = "10",
        help = "maximal number of simplification rounds"
    )]
    pub simplify_passes: u16,

    #[structopt(long = "out-fasta", help = "write the cleaned unitigs in fasta")]
    pub out_fasta: Option<String>,

    #[structopt(long = "out-gfa", help = "write the cleaned graph in gfa")]
    pub out_gfa: Option<String>,
}

#[derive(StructOpt, Debug)]
pub struct Graph {
    #[structopt(flatten)]
    pub dsk: Dsk,

    #[structopt(
        long = "bloom",
        default_value = "basic",
        possible_values = &["basic", "cache"],
        help = "bloom filter flavour"
    )]
    pub bloom: String,

    #[structopt(
        long = "debloom",
        default_value = "cascading",
        possible_values = &["none", "cascading"],
        help = "critical false positive construction, none keep the raw bloom"
    )]
    pub debloom: String,

    #[structopt(
        short = "p",
        long = "simplify-passes",
        default_value = "10",
        help = "maximal number of simplification rounds"
    )]
    pub simplify_passes: u16,

    #[structopt(
        long = "traversal",
        default_value = "none",
        possible_values = &["none", "unitig", "contig"],
        help = "also assemble contigs with this traversal"
    )]
    pub traversal: String,

    #[structopt(long = "out-contigs", help = "path of the contig fasta output")]
    pub out_contigs: Option<String>,
}
