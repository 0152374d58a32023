//! Single-pass tarball rewrite: keep one module's entries, strip the
//! `<owner>-<container>-<ref>/<module>/` prefix from their paths.

use std::io::{self, Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tar::{Archive, Builder};

use crate::domain::modules::ModuleCoordinate;

/// Selects and renames the entries that belong to one module.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    root_prefix: String,
    module_dir: String,
}

impl EntryFilter {
    pub fn new(coordinate: &ModuleCoordinate) -> Self {
        Self {
            root_prefix: format!("{}-{}-", coordinate.owner(), coordinate.container()),
            module_dir: format!("{}/", coordinate.module()),
        }
    }

    /// Returns the path relative to the module directory, or `None` when the
    /// entry is outside it.
    pub fn rewrite<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(&self.root_prefix)?;
        let (short_ref, rest) = rest.split_once('/')?;
        if short_ref.is_empty() {
            return None;
        }
        let payload = rest.strip_prefix(&self.module_dir)?;
        (!payload.is_empty()).then_some(payload)
    }
}

/// Stream `source` (gzip'd tar) into `dest` as a new gzip'd tar holding only
/// the entries accepted by `filter`, with their original header metadata.
///
/// Returns the destination once the gzip trailer has been written.
pub fn rewrite_archive<R, W>(source: R, dest: W, filter: &EntryFilter) -> io::Result<W>
where
    R: Read,
    W: Write,
{
    let mut archive = Archive::new(GzDecoder::new(source));
    let mut builder = Builder::new(GzEncoder::new(dest, Compression::default()));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let Some(renamed) = filter.rewrite(&path) else {
            continue;
        };

        let mut header = entry.header().clone();
        builder.append_data(&mut header, renamed, &mut entry)?;
    }

    builder.into_inner()?.finish()
}
