//! Per-backend result spool.
//!
//! Every result of a query is appended, as one JSON line, to the spool file of
//! the backend that produced it (`unsorted_<backend>.json`). Alongside, the
//! spool keeps a [`ResultPointer`] per record: backend, byte range, ranking and
//! path hash. Final pages are later assembled by copying byte ranges out of the
//! spool files, so no record is ever decoded or encoded a second time.
//!
//! Spool files are created once per query and kept open until the query is
//! persisted; they are never reopened.

use crate::error::{Result, SiftError};
use crate::types::{path_hash, BackendId, PackagePool, ResultPointer, ResultRecord};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the spool file for a backend.
pub fn spool_file_name(backend: BackendId) -> String {
    format!("unsorted_{}.json", backend)
}

struct SpoolFile {
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
}

/// Append-only record store plus the pointer index into it.
pub struct ResultSpool {
    files: Vec<SpoolFile>,
    pointers: Vec<ResultPointer>,
    packages: PackagePool,
    num_results: usize,
    drained: bool,
}

/// Everything the disk writer needs, taken out of the spool in one step.
pub struct SpoolSnapshot {
    /// All pointers, in arrival order
    pub pointers: Vec<ResultPointer>,

    /// All package names, sorted
    pub packages: Vec<String>,

    /// Read access to the spooled records
    pub reader: SpoolReader,
}

impl ResultSpool {
    /// Create one spool file per backend inside `dir`.
    pub fn create(dir: &Path, backends: usize) -> Result<Self> {
        let mut files = Vec::with_capacity(backends);
        for idx in 0..backends {
            let path = dir.join(spool_file_name(BackendId::new(idx)));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            files.push(SpoolFile {
                path,
                writer: BufWriter::new(file),
                len: 0,
            });
        }

        Ok(ResultSpool {
            files,
            pointers: Vec::new(),
            packages: PackagePool::new(),
            num_results: 0,
            drained: false,
        })
    }

    /// Append a ranked record and index it.
    pub fn record(&mut self, backend: BackendId, record: &ResultRecord) -> Result<()> {
        if self.drained {
            return Err(SiftError::Internal(
                "spool already drained for persistence".to_string(),
            ));
        }
        let file = self.files.get_mut(backend.index()).ok_or_else(|| {
            SiftError::Internal(format!("no spool file for backend {}", backend))
        })?;

        let line = record.to_json_line()?;
        let offset = file.len;
        file.writer.write_all(&line)?;
        file.len += line.len() as u64;

        self.pointers.push(ResultPointer {
            backend,
            ranking: record.ranking(),
            offset,
            length: line.len() as u64,
            path_hash: path_hash(&record.hit.path),
            package: self.packages.intern(&record.package),
        });
        self.num_results += 1;
        Ok(())
    }

    /// Number of results spooled so far. Survives [`ResultSpool::drain`].
    pub fn num_results(&self) -> usize {
        self.num_results
    }

    /// Number of distinct packages seen
    pub fn num_packages(&self) -> usize {
        self.packages.len()
    }

    /// Take the pointers, the frozen package list and the files out of the
    /// spool. Can succeed only once.
    pub fn drain(&mut self) -> Result<SpoolSnapshot> {
        if self.drained {
            return Err(SiftError::Internal("spool drained twice".to_string()));
        }
        self.drained = true;

        let mut files = Vec::with_capacity(self.files.len());
        for spool_file in self.files.drain(..) {
            debug!(path = %spool_file.path.display(), bytes = spool_file.len, "Sealing spool file");
            let file = spool_file
                .writer
                .into_inner()
                .map_err(|e| SiftError::Io(e.into_error()))?;
            files.push(file);
        }

        Ok(SpoolSnapshot {
            pointers: std::mem::take(&mut self.pointers),
            packages: self.packages.sorted(),
            reader: SpoolReader { files },
        })
    }

    /// Drop all file handles without persisting.
    pub fn close(&mut self) {
        self.files.clear();
    }
}

/// Random access to sealed spool files.
pub struct SpoolReader {
    files: Vec<File>,
}

impl SpoolReader {
    /// Copy the exact byte range of one record into `out`.
    pub fn copy_record(&mut self, pointer: &ResultPointer, out: &mut impl Write) -> Result<()> {
        let file = self.files.get_mut(pointer.backend.index()).ok_or_else(|| {
            SiftError::Internal(format!("no spool file for backend {}", pointer.backend))
        })?;

        file.seek(SeekFrom::Start(pointer.offset))?;
        let copied = io::copy(&mut Read::by_ref(file).take(pointer.length), out)?;
        if copied != pointer.length {
            return Err(SiftError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "spool record of backend {} truncated: {} of {} bytes at offset {}",
                    pointer.backend, copied, pointer.length, pointer.offset
                ),
            )));
        }
        Ok(())
    }
}
