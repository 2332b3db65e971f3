// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository backends.

A [Repository] answers one question — "stream this logical file into a
verified temp file" — plus access to the cache it owns. [RemoteFile]
describes each fetchable file as data: which formats are acceptable, how
large the stream may grow, which digests it must match, and what happens
to it on success. The HTTP and filesystem backends share this contract,
which is what makes them interchangeable to the update engine.
*/

pub mod http;
pub mod local;

pub use self::{http::RemoteRepository, local::LocalRepository};

use {
    crate::{
        cache::{Cache, INDEX_TAR, INDEX_TAR_GZ},
        error::{HackageRepositoryError, Result},
        io::{ContentDigest, Format},
        metadata::{CachedFile, FileInfo},
    },
    std::{
        io::Read,
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
    url::Url,
};

/// Ceiling on the size of a fetched root document. The root has no
/// parent document pinning its length, so a conservative default bounds
/// the stream instead.
pub const MAX_ROOT_SIZE: u64 = 2 * 1024 * 1024;

/// Ceiling on the size of a fetched timestamp document.
pub const MAX_TIMESTAMP_SIZE: u64 = 64 * 1024;

/// What the cache does with a completed download.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CachePolicy {
    /// Install as one of the persistently cached metadata files.
    CacheMetadata(CachedFile),
    /// Install as the package index and refresh the offset table.
    CacheIndex,
    /// Hand the file to the caller only; cache nothing.
    DontCache,
}

/// A logical file to fetch from the repository.
#[derive(Clone, Debug)]
pub enum RemoteFile {
    /// The trust root. `version` selects `N.root.json` during rotation;
    /// `None` fetches the unversioned `root.json` used at bootstrap.
    Root { version: Option<u64> },
    /// The timestamp document. Never pinned by a parent, so bounded by
    /// [MAX_TIMESTAMP_SIZE] and fetched without an expected digest.
    Timestamp,
    /// The snapshot document, pinned by the timestamp.
    Snapshot { info: FileInfo },
    /// The mirrors document, pinned by the snapshot.
    Mirrors { info: FileInfo },
    /// The package index, pinned by the snapshot. The compressed
    /// variant is acceptable when the snapshot describes it.
    Index {
        tar: FileInfo,
        tar_gz: Option<FileInfo>,
    },
    /// A package tarball, pinned by a targets document.
    Package { path: String, info: FileInfo },
}

impl RemoteFile {
    /// Acceptable formats, most preferred first. Uncompressed is always
    /// preferred; gzip is only acceptable for the package index.
    pub fn formats(&self) -> Vec<Format> {
        match self {
            Self::Index {
                tar_gz: Some(_), ..
            } => vec![Format::Raw, Format::Gzip],
            _ => vec![Format::Raw],
        }
    }

    /// Path of this file relative to a mirror root, in the given format.
    pub fn remote_path(&self, format: Format) -> String {
        match self {
            Self::Root { version: None } => "root.json".to_string(),
            Self::Root {
                version: Some(version),
            } => format!("{}.root.json", version),
            Self::Timestamp => "timestamp.json".to_string(),
            Self::Snapshot { .. } => "snapshot.json".to_string(),
            Self::Mirrors { .. } => "mirrors.json".to_string(),
            Self::Index { .. } => format!("{}{}", INDEX_TAR, format.path_suffix()),
            Self::Package { path, .. } => path.clone(),
        }
    }

    /// Hard ceiling on the stream length for the given format.
    pub fn length_bound(&self, format: Format) -> u64 {
        match self {
            Self::Root { .. } => MAX_ROOT_SIZE,
            Self::Timestamp => MAX_TIMESTAMP_SIZE,
            Self::Snapshot { info } | Self::Mirrors { info } | Self::Package { info, .. } => {
                info.length
            }
            Self::Index { tar, tar_gz } => match format {
                Format::Raw => tar.length,
                // A gzip stream longer than the archive it decompresses
                // to is not one we want.
                Format::Gzip => tar_gz.as_ref().map(|info| info.length).unwrap_or(tar.length),
            },
        }
    }

    /// Digests the stream must match, when the parent document recorded
    /// any. Root and timestamp are fetched before anything pins them.
    pub fn expected_digests(&self, format: Format) -> Result<Vec<ContentDigest>> {
        match self {
            Self::Root { .. } | Self::Timestamp => Ok(vec![]),
            Self::Snapshot { info } | Self::Mirrors { info } | Self::Package { info, .. } => {
                info.known_digests()
            }
            Self::Index { tar, tar_gz } => match format {
                Format::Raw => tar.known_digests(),
                Format::Gzip => match tar_gz {
                    Some(info) => info.known_digests(),
                    None => Ok(vec![]),
                },
            },
        }
    }

    /// What the cache does with this file once verified.
    pub fn cache_policy(&self) -> CachePolicy {
        match self {
            Self::Root { .. } => CachePolicy::CacheMetadata(CachedFile::Root),
            Self::Timestamp => CachePolicy::CacheMetadata(CachedFile::Timestamp),
            Self::Snapshot { .. } => CachePolicy::CacheMetadata(CachedFile::Snapshot),
            Self::Mirrors { .. } => CachePolicy::CacheMetadata(CachedFile::Mirrors),
            Self::Index { .. } => CachePolicy::CacheIndex,
            Self::Package { .. } => CachePolicy::DontCache,
        }
    }
}

/// A completed, stream-verified download.
///
/// Owns its temp file: dropping an instance removes the file, so every
/// failure path cleans up without further ceremony. Installing into the
/// cache consumes the instance.
#[derive(Debug)]
pub struct Download {
    temp: NamedTempFile,
    format: Format,
}

impl Download {
    pub(crate) fn new(temp: NamedTempFile, format: Format) -> Self {
        Self { temp, format }
    }

    /// Path of the temp file holding the downloaded bytes.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// The format the bytes are stored in.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Read the downloaded content, transparently decompressing.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let fh = std::fs::File::open(self.temp.path()).map_err(|e| {
            HackageRepositoryError::IoPath(format!("{}", self.temp.path().display()), e)
        })?;

        let mut reader = crate::io::read_decompressed(std::io::BufReader::new(fh), self.format);
        let mut data = vec![];
        reader.read_to_end(&mut data).map_err(|e| {
            HackageRepositoryError::IoPath(format!("{}", self.temp.path().display()), e)
        })?;

        Ok(data)
    }

    pub(crate) fn into_parts(self) -> (NamedTempFile, Format) {
        (self.temp, self.format)
    }
}

/// A read interface over a package repository bound to a local cache.
pub trait Repository {
    /// Stream a logical file into a verified temp file.
    ///
    /// The returned [Download] has already passed the length and digest
    /// checks the [RemoteFile] declares. It is the caller's to verify
    /// further, then either install via [Repository::cache_remote_file]
    /// or drop.
    fn fetch(&self, file: &RemoteFile) -> Result<Download>;

    /// The cache this repository owns.
    fn cache(&self) -> &Cache;

    /// Adopt a freshly verified mirror list. Backends without a notion
    /// of mirrors ignore it.
    fn update_mirrors(&self, _mirrors: &[Url]) {}

    /// Obtain the path of a cached metadata file, if present.
    fn get_cached(&self, file: CachedFile) -> Option<PathBuf> {
        self.cache().get_cached(file)
    }

    /// Obtain the path of the cached root document, panicking if absent.
    fn get_cached_root(&self) -> PathBuf {
        self.cache().get_cached_root()
    }

    /// Obtain the path of the cached package index, if present.
    fn get_cached_index(&self) -> Option<PathBuf> {
        self.cache().get_cached_index()
    }

    /// Read one entry out of the package index.
    fn get_from_index(&self, entry_path: &str) -> Result<Option<Vec<u8>>> {
        self.cache().get_from_index(entry_path)
    }

    /// Install a verified download into the cache.
    fn cache_remote_file(&self, download: Download, policy: CachePolicy) -> Result<()> {
        self.cache().cache_remote_file(download, policy)
    }

    /// Remove the timestamp and snapshot from the cache.
    fn clear_cache(&self) -> Result<()> {
        self.cache().clear_cache()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn file_info(length: u64) -> FileInfo {
        FileInfo {
            length,
            hashes: [("sha256".to_string(), "ab".repeat(32))].into_iter().collect(),
        }
    }

    #[test]
    fn format_preference_is_raw_first() {
        let index = RemoteFile::Index {
            tar: file_info(1000),
            tar_gz: Some(file_info(300)),
        };
        assert_eq!(index.formats(), vec![Format::Raw, Format::Gzip]);

        let index = RemoteFile::Index {
            tar: file_info(1000),
            tar_gz: None,
        };
        assert_eq!(index.formats(), vec![Format::Raw]);

        assert_eq!(RemoteFile::Timestamp.formats(), vec![Format::Raw]);
    }

    #[test]
    fn remote_paths() {
        assert_eq!(
            RemoteFile::Root { version: None }.remote_path(Format::Raw),
            "root.json"
        );
        assert_eq!(
            RemoteFile::Root { version: Some(3) }.remote_path(Format::Raw),
            "3.root.json"
        );
        assert_eq!(
            RemoteFile::Index {
                tar: file_info(10),
                tar_gz: Some(file_info(4)),
            }
            .remote_path(Format::Gzip),
            "00-index.tar.gz"
        );
    }

    #[test]
    fn unpinned_files_use_default_bounds() {
        assert_eq!(
            RemoteFile::Root { version: None }.length_bound(Format::Raw),
            MAX_ROOT_SIZE
        );
        assert_eq!(
            RemoteFile::Timestamp.length_bound(Format::Raw),
            MAX_TIMESTAMP_SIZE
        );
        assert!(RemoteFile::Timestamp
            .expected_digests(Format::Raw)
            .unwrap()
            .is_empty());
    }
}
