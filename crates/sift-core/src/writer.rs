//! Final result persistence.
//!
//! Once a query is complete, its spooled results are written out as:
//!
//! - `packages.json`: `{"Packages": [...]}`, every package with a result, sorted
//! - `page_<n>.json`: results `10n..10n+9` in ranking order, as a JSON array
//! - `pkg_<name>.json`: the two best results of one package, as a JSON array
//!
//! Records are never decoded again: each page is assembled by copying byte
//! ranges out of the spool files, in the order given by sorting the pointers.
//! Every file is written to a temporary name and renamed into place, so
//! readers never see a partial file.

use crate::error::Result;
use crate::ranking::pointer_order;
use crate::reclaim::SpaceReclaimer;
use crate::spool::{SpoolReader, SpoolSnapshot};
use crate::types::{package_file_name, ResultPointer, RESULTS_PER_PACKAGE, RESULTS_PER_PAGE};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Above this many results the pointers are sorted on all cores.
const PARALLEL_SORT_THRESHOLD: usize = 10_000;

/// Name of the package list file
pub const PACKAGES_FILE: &str = "packages.json";

/// Name of the `page`-th result page file.
pub fn page_file_name(page: usize) -> String {
    format!("page_{}.json", page)
}

/// What a successful persist produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Persisted {
    /// Number of `page_<n>.json` files written
    pub result_pages: usize,

    /// Packages with at least one result, sorted
    pub packages: Vec<String>,
}

#[derive(Serialize)]
struct PackageList<'a> {
    #[serde(rename = "Packages")]
    packages: &'a [String],
}

/// Writes the result files of one query directory.
pub struct DiskWriter {
    dir: PathBuf,
    reclaimer: Arc<SpaceReclaimer>,
}

impl DiskWriter {
    pub fn new(dir: impl AsRef<Path>, reclaimer: Arc<SpaceReclaimer>) -> Self {
        DiskWriter {
            dir: dir.as_ref().to_path_buf(),
            reclaimer,
        }
    }

    /// Persist everything the spool holds.
    ///
    /// A query without results writes nothing and reports zero pages.
    pub fn persist(&self, snapshot: SpoolSnapshot) -> Result<Persisted> {
        let SpoolSnapshot {
            mut pointers,
            packages,
            mut reader,
        } = snapshot;

        if pointers.is_empty() {
            debug!(dir = %self.dir.display(), "No results, nothing to persist");
            return Ok(Persisted::default());
        }

        self.reclaimer.ensure_headroom()?;
        fs::create_dir_all(&self.dir)?;

        info!(
            dir = %self.dir.display(),
            results = pointers.len(),
            packages = packages.len(),
            "Persisting query results"
        );

        write_atomically(&self.dir.join(PACKAGES_FILE), |out| {
            serde_json::to_writer(&mut *out, &PackageList { packages: &packages })?;
            Ok(())
        })?;

        if pointers.len() > PARALLEL_SORT_THRESHOLD {
            pointers.par_sort_by(pointer_order);
        } else {
            pointers.sort_by(pointer_order);
        }

        let mut result_pages = 0;
        for (page, chunk) in pointers.chunks(RESULTS_PER_PAGE).enumerate() {
            let path = self.dir.join(page_file_name(page));
            write_atomically(&path, |out| write_records(&mut reader, chunk.iter(), out))?;
            result_pages += 1;
        }
        debug!(dir = %self.dir.display(), pages = result_pages, "Wrote result pages");

        let mut by_package: BTreeMap<&str, Vec<&ResultPointer>> = BTreeMap::new();
        for pointer in &pointers {
            let best = by_package.entry(pointer.package.as_ref()).or_default();
            if best.len() < RESULTS_PER_PACKAGE {
                best.push(pointer);
            }
        }
        for (package, best) in &by_package {
            let path = self.dir.join(package_file_name(package));
            write_atomically(&path, |out| {
                write_records(&mut reader, best.iter().copied(), out)
            })?;
        }
        debug!(dir = %self.dir.display(), files = by_package.len(), "Wrote package files");

        Ok(Persisted {
            result_pages,
            packages,
        })
    }
}

/// Write `[`, the records separated by `,`, and `]\n`.
fn write_records<'a>(
    reader: &mut SpoolReader,
    pointers: impl Iterator<Item = &'a ResultPointer>,
    out: &mut BufWriter<File>,
) -> Result<()> {
    out.write_all(b"[")?;
    for (idx, pointer) in pointers.enumerate() {
        if idx > 0 {
            out.write_all(b",")?;
        }
        reader.copy_record(pointer, out)?;
    }
    out.write_all(b"]\n")?;
    Ok(())
}

/// Write to a temporary file next to `path`, then rename it into place.
fn write_atomically(
    path: &Path,
    fill: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
) -> Result<()> {
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    {
        let mut out = BufWriter::new(File::create(&temp_path)?);
        fill(&mut out)?;
        out.flush()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Build a per-package response from persisted package files.
///
/// The package files are pasted in verbatim:
/// `[{"Package": "<name>", "Results": <pkg file>}, ...]`.
pub fn read_package_page(dir: &Path, packages: &[String]) -> Result<String> {
    let mut response = String::from("[");
    for (idx, package) in packages.iter().enumerate() {
        if idx > 0 {
            response.push(',');
        }
        let results = fs::read_to_string(dir.join(package_file_name(package)))?;
        response.push_str("{\"Package\": ");
        response.push_str(&serde_json::to_string(package)?);
        response.push_str(", \"Results\": ");
        response.push_str(results.trim_end());
        response.push('}');
    }
    response.push(']');
    Ok(response)
}
