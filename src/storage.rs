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

//! Filesystem backed graph storage: a directory per graph, groups are
//! subdirectories, collections are files. A small state bitset records
//! which build stages ran.

/* std use */
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/* crate use */
use anyhow::{Context, Result};

/* local use */
use crate::error::Error;

/// Build stage bits, persisted as one integer in the `state` collection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BuildState(pub u64);

impl BuildState {
    pub const CONFIGURATION_DONE: u64 = 1;
    pub const SORTING_COUNT_DONE: u64 = 2;
    pub const MPHF_DONE: u64 = 4;
    pub const BCALM2_DONE: u64 = 8;

    pub fn contains(self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    pub fn with(self, bit: u64) -> Self {
        BuildState(self.0 | bit)
    }
}

/// One graph directory.
#[derive(Clone)]
pub struct GraphStorage {
    root: PathBuf,
}

impl GraphStorage {
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref()).with_context(|| Error::CantWriteFile {
            filename: root.as_ref().display().to_string(),
        })?;

        Ok(GraphStorage {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        if !root.as_ref().is_dir() {
            return Err(Error::CantReadFile {
                filename: root.as_ref().display().to_string(),
            }
            .into());
        }

        Ok(GraphStorage {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A group is a subdirectory, created on demand.
    pub fn group(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path).with_context(|| Error::CantWriteFile {
            filename: path.display().to_string(),
        })?;
        Ok(path)
    }

    /// A collection is a file inside the root or a group.
    pub fn collection(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn create_collection(&self, name: &str) -> Result<std::io::BufWriter<std::fs::File>> {
        let path = self.collection(name);
        let file = std::fs::File::create(&path).with_context(|| Error::CantWriteFile {
            filename: path.display().to_string(),
        })?;
        Ok(std::io::BufWriter::new(file))
    }

    pub fn open_collection(&self, name: &str) -> Result<std::io::BufReader<std::fs::File>> {
        let path = self.collection(name);
        let file = std::fs::File::open(&path).with_context(|| Error::CantReadFile {
            filename: path.display().to_string(),
        })?;
        Ok(std::io::BufReader::new(file))
    }

    pub fn state(&self) -> BuildState {
        let path = self.collection("state");

        match std::fs::File::open(path) {
            Ok(mut file) => {
                let mut buffer = [0u8; 8];
                match file.read_exact(&mut buffer) {
                    Ok(()) => BuildState(u64::from_le_bytes(buffer)),
                    Err(_) => BuildState::default(),
                }
            }
            Err(_) => BuildState::default(),
        }
    }

    pub fn set_state(&self, state: BuildState) -> Result<()> {
        let path = self.collection("state");
        let mut file = std::fs::File::create(&path).with_context(|| Error::CantWriteFile {
            filename: path.display().to_string(),
        })?;
        file.write_all(&state.0.to_le_bytes())?;
        Ok(())
    }

    /// Error out unless the given stage bit is already set.
    pub fn require(&self, bit: u64, stage: &str) -> Result<()> {
        if !self.state().contains(bit) {
            return Err(Error::MissingStage {
                path: self.root.display().to_string(),
                stage: stage.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
