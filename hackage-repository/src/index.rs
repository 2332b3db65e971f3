// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Offset index over the package index tar archive.

The package index is an append-only tar archive. To serve single-entry
lookups without scanning, an offset table keyed by entry path is kept in
a sidecar file next to the archive. Building the table is resumable: the
recorded end offset is where the previous build stopped reading, which is
exactly where freshly appended entries begin.
*/

use {
    crate::error::{HackageRepositoryError, Result},
    log::warn,
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        io::{Read, Seek, SeekFrom},
        path::Path,
    },
};

const INDEX_FORMAT_VERSION: u32 = 1;
const TAR_BLOCK_SIZE: u64 = 512;

/// Location of one entry inside the tar archive.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IndexEntry {
    /// Byte offset of the entry data from the start of the archive.
    pub offset: u64,
    /// Length of the entry data in bytes.
    pub length: u64,
}

/// The serialized offset table.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TarIndex {
    version: u32,
    end_offset: u64,
    entries: BTreeMap<String, IndexEntry>,
}

impl TarIndex {
    pub fn empty() -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            end_offset: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Look up the location of an entry path.
    ///
    /// Only normal file entries are recorded, so directories, symlinks
    /// and other special entries always miss.
    pub fn lookup(&self, path: &str) -> Option<IndexEntry> {
        self.entries.get(path).copied()
    }

    /// Offset just past the last indexed entry; where appended entries
    /// will appear.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read the offset table from its sidecar file.
///
/// A missing file is `Ok(None)`; an unparseable or wrong-version file is
/// a [HackageRepositoryError::CacheCorrupt] error so callers can decide
/// to rebuild.
pub fn try_read_index(path: &Path) -> Result<Option<TarIndex>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(HackageRepositoryError::IoPath(
                format!("{}", path.display()),
                e,
            ))
        }
    };

    let index: TarIndex = serde_json::from_slice(&data).map_err(|e| {
        HackageRepositoryError::CacheCorrupt(format!(
            "tar index {} is unreadable: {}",
            path.display(),
            e
        ))
    })?;

    if index.version != INDEX_FORMAT_VERSION {
        return Err(HackageRepositoryError::CacheCorrupt(format!(
            "tar index {} has unsupported format version {}",
            path.display(),
            index.version
        )));
    }

    Ok(Some(index))
}

/// Build or update the offset table for `tar_path`, atomically writing
/// the result to `index_path`.
///
/// If an existing table is readable it seeds the build and the archive
/// is read from the recorded end offset onward; otherwise the archive is
/// scanned from the start. An archive shorter than the recorded end
/// offset has been replaced rather than appended to, which also forces a
/// scan from the start.
pub fn build_index(tar_path: &Path, index_path: &Path) -> Result<TarIndex> {
    let mut index = match try_read_index(index_path) {
        Ok(Some(index)) => index,
        Ok(None) => TarIndex::empty(),
        Err(e) => {
            warn!("{}; rebuilding from scratch", e);
            TarIndex::empty()
        }
    };

    let mut file = std::fs::File::open(tar_path)
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?;
    let tar_length = file
        .metadata()
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?
        .len();

    if index.end_offset > tar_length {
        index = TarIndex::empty();
    }

    let base = index.end_offset;
    file.seek(SeekFrom::Start(base))
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?;

    let mut archive = tar::Archive::new(file);
    let mut end = base;

    for entry in archive
        .entries()
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?
    {
        let entry = entry
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?;

        let offset = base + entry.raw_file_position();
        let length = entry.size();

        if entry.header().entry_type() == tar::EntryType::Regular {
            let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            index.entries.insert(path, IndexEntry { offset, length });
        }

        let padded = (length + TAR_BLOCK_SIZE - 1) / TAR_BLOCK_SIZE * TAR_BLOCK_SIZE;
        end = offset + padded;
    }

    index.end_offset = end;

    write_index(&index, index_path)?;

    Ok(index)
}

/// Read the data of a single entry out of the archive.
pub fn read_entry(tar_path: &Path, entry: IndexEntry) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(tar_path)
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?;

    file.seek(SeekFrom::Start(entry.offset))
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?;

    let mut data = vec![0u8; entry.length as usize];
    file.read_exact(&mut data)
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", tar_path.display()), e))?;

    Ok(data)
}

fn write_index(index: &TarIndex, index_path: &Path) -> Result<()> {
    let dir = index_path.parent().ok_or_else(|| {
        HackageRepositoryError::CacheCorrupt(format!(
            "tar index path {} has no parent directory",
            index_path.display()
        ))
    })?;

    let temp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&temp, index)?;
    temp.persist(index_path)
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", index_path.display()), e.error))?;

    Ok(())
}
