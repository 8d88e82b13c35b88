//! Per-cycle output files
//!
//! One `EventWriter` owns one newline-delimited JSON file for the lifetime of
//! a collection cycle. Records are encoded in memory before any byte reaches
//! the file, so every line on disk is a complete JSON object.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use serde::Serialize;

use crate::error::{WriterError, WriterResult};

/// Suffixes tried when a file for the same second already exists
const MAX_NAME_COLLISIONS: u32 = 1000;

/// Output file name for a cycle started at `started_at`
pub fn cycle_file_name<Tz>(started_at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("events_{}.json", started_at.format("%Y%m%d_%H%M%S"))
}

/// Final state of a closed writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSummary {
    pub path: PathBuf,
    pub records: u64,
}

/// Append-only NDJSON writer for one collection cycle
#[derive(Debug)]
pub struct EventWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: u64,
    line: Vec<u8>,
}

impl EventWriter {
    /// Create a fresh file in `dir` named after `started_at`
    ///
    /// Never opens an existing file: if two cycles start within the same
    /// second the second one gets a `_<n>` suffix.
    pub fn create<Tz>(dir: &Path, started_at: &DateTime<Tz>) -> WriterResult<Self>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let base = cycle_file_name(started_at);
        let stem = base.trim_end_matches(".json");

        let mut path = dir.join(&base);
        for attempt in 1..=MAX_NAME_COLLISIONS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok(Self::from_file(path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    path = dir.join(format!("{stem}_{attempt}.json"));
                }
                Err(source) => return Err(WriterError::Create { path, source }),
            }
        }

        Err(WriterError::Create {
            path,
            source: io::Error::new(io::ErrorKind::AlreadyExists, "too many cycles in one second"),
        })
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            out: BufWriter::new(file),
            records: 0,
            line: Vec::with_capacity(512),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode and append one record
    ///
    /// An encode error leaves the file untouched and the writer usable.
    pub fn append<T: Serialize>(&mut self, record: &T) -> WriterResult<()> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, record).map_err(WriterError::Encode)?;
        self.line.push(b'\n');

        self.out
            .write_all(&self.line)
            .map_err(|source| WriterError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.records += 1;
        Ok(())
    }

    /// Flush, sync to disk and release the file
    pub fn close(mut self) -> WriterResult<WriterSummary> {
        let path = self.path.clone();
        let write_error = |source| WriterError::Write {
            path: path.clone(),
            source,
        };

        self.out.flush().map_err(write_error)?;
        self.out.get_ref().sync_all().map_err(write_error)?;

        Ok(WriterSummary {
            path: self.path,
            records: self.records,
        })
    }
}
