// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! On-disk cache of verified repository state.

The cache directory is owned exclusively by one repository instance. All
writes go through a temp file in the same directory followed by a rename,
so at any instant each cached file is either the previous verified
version or the new one, never a partial write. Reads treat a missing file
as "not present"; a corrupt offset table heals itself by one rebuild.
*/

use {
    crate::{
        error::{HackageRepositoryError, Result},
        index,
        io::Format,
        metadata::CachedFile,
        repository::{CachePolicy, Download},
    },
    log::warn,
    std::{
        io::Read,
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
};

/// File name of the package index archive.
pub const INDEX_TAR: &str = "00-index.tar";
/// File name of the offset table kept next to the archive.
pub const INDEX_TAR_IDX: &str = "00-index.tar.idx";
/// File name of the compressed variant of the package index.
pub const INDEX_TAR_GZ: &str = "00-index.tar.gz";

/// The cache directory and operations over it.
#[derive(Clone, Debug)]
pub struct Cache {
    root_dir: PathBuf,
}

impl Cache {
    /// Open (creating if needed) a cache rooted at the given directory.
    pub fn new(root_dir: impl AsRef<Path>) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&root_dir)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", root_dir.display()), e))?;

        Ok(Self { root_dir })
    }

    /// The directory this cache lives in. Temp files destined for the
    /// cache must be created here so the final rename stays on one
    /// filesystem.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Path a cached metadata file would live at, whether or not it
    /// currently exists.
    pub fn cached_file_path(&self, file: CachedFile) -> PathBuf {
        self.root_dir.join(file.file_name())
    }

    /// Path of the package index archive.
    pub fn index_tar_path(&self) -> PathBuf {
        self.root_dir.join(INDEX_TAR)
    }

    fn index_idx_path(&self) -> PathBuf {
        self.root_dir.join(INDEX_TAR_IDX)
    }

    fn index_gz_path(&self) -> PathBuf {
        self.root_dir.join(INDEX_TAR_GZ)
    }

    /// Obtain the path of a cached metadata file, if it is present.
    pub fn get_cached(&self, file: CachedFile) -> Option<PathBuf> {
        let path = self.cached_file_path(file);

        path.is_file().then_some(path)
    }

    /// Obtain the path of the cached root document.
    ///
    /// Panics when absent: every update entry point requires a completed
    /// bootstrap, so a missing root is a caller bug, not a runtime
    /// condition.
    pub fn get_cached_root(&self) -> PathBuf {
        self.get_cached(CachedFile::Root).unwrap_or_else(|| {
            panic!(
                "root.json missing from cache directory {}; bootstrap must complete before updates",
                self.root_dir.display()
            )
        })
    }

    /// Obtain the path of the cached package index archive, if present.
    pub fn get_cached_index(&self) -> Option<PathBuf> {
        let path = self.index_tar_path();

        path.is_file().then_some(path)
    }

    /// Read one entry out of the package index through the offset table.
    ///
    /// A missing or corrupt offset table, or a lookup miss against a
    /// stale table, triggers one rebuild before the lookup is retried;
    /// a second failure reports the entry as absent (or surfaces the
    /// underlying error).
    pub fn get_from_index(&self, entry_path: &str) -> Result<Option<Vec<u8>>> {
        let tar_path = self.index_tar_path();
        if !tar_path.is_file() {
            return Ok(None);
        }
        let idx_path = self.index_idx_path();

        let mut rebuilt = false;
        let mut index = match index::try_read_index(&idx_path) {
            Ok(Some(index)) => index,
            Ok(None) => {
                rebuilt = true;
                index::build_index(&tar_path, &idx_path)?
            }
            Err(e) => {
                warn!("{}; rebuilding tar index", e);
                rebuilt = true;
                index::build_index(&tar_path, &idx_path)?
            }
        };

        loop {
            match index.lookup(entry_path) {
                Some(entry) => match index::read_entry(&tar_path, entry) {
                    Ok(data) => return Ok(Some(data)),
                    Err(e) if !rebuilt => {
                        warn!("reading {} via tar index failed: {}; rebuilding", entry_path, e);
                        rebuilt = true;
                        index = index::build_index(&tar_path, &idx_path)?;
                    }
                    Err(e) => return Err(e),
                },
                None if !rebuilt => {
                    rebuilt = true;
                    index = index::build_index(&tar_path, &idx_path)?;
                }
                None => return Ok(None),
            }
        }
    }

    /// Install a verified download into the cache according to its
    /// policy, atomically. Gzip-delivered content is decompressed first;
    /// for the package index the raw compressed bytes are kept alongside
    /// the archive. Installing the index also refreshes the offset
    /// table.
    pub fn cache_remote_file(&self, download: Download, policy: CachePolicy) -> Result<()> {
        let (temp, format) = download.into_parts();

        match policy {
            CachePolicy::DontCache => {}
            CachePolicy::CacheMetadata(file) => {
                let dest = self.cached_file_path(file);
                let temp = match format {
                    Format::Raw => temp,
                    Format::Gzip => self.decompress_to_temp(temp.path())?,
                };

                self.install_temp(temp, &dest)?;
            }
            CachePolicy::CacheIndex => {
                match format {
                    Format::Raw => {
                        self.install_temp(temp, &self.index_tar_path())?;
                    }
                    Format::Gzip => {
                        let decompressed = self.decompress_to_temp(temp.path())?;
                        self.install_temp(temp, &self.index_gz_path())?;
                        self.install_temp(decompressed, &self.index_tar_path())?;
                    }
                }

                index::build_index(&self.index_tar_path(), &self.index_idx_path())?;
            }
        }

        Ok(())
    }

    /// Remove the timestamp and snapshot files.
    ///
    /// The root and the package index survive: the root is the trust
    /// anchor and the index is re-validated against the next snapshot.
    /// Missing files are not an error.
    pub fn clear_cache(&self) -> Result<()> {
        for file in [CachedFile::Timestamp, CachedFile::Snapshot] {
            let path = self.cached_file_path(file);

            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(HackageRepositoryError::IoPath(
                        format!("{}", path.display()),
                        e,
                    ))
                }
            }
        }

        Ok(())
    }

    fn install_temp(&self, temp: NamedTempFile, dest: &Path) -> Result<()> {
        temp.persist(dest)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", dest.display()), e.error))?;

        Ok(())
    }

    fn decompress_to_temp(&self, src: &Path) -> Result<NamedTempFile> {
        let fh = std::fs::File::open(src)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", src.display()), e))?;

        let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(fh));
        let mut temp = NamedTempFile::new_in(&self.root_dir)?;

        let mut buffer = [0u8; 32768];
        loop {
            let count = decoder
                .read(&mut buffer)
                .map_err(|e| HackageRepositoryError::IoPath(format!("{}", src.display()), e))?;
            if count == 0 {
                break;
            }

            std::io::Write::write_all(temp.as_file_mut(), &buffer[0..count])
                .map_err(|e| HackageRepositoryError::IoPath(format!("{}", src.display()), e))?;
        }

        Ok(temp)
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::io::Write, tempfile::TempDir};

    fn cache() -> (TempDir, Cache) {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path().join("cache")).unwrap();

        (dir, cache)
    }

    fn download_of(cache: &Cache, data: &[u8], format: Format) -> Download {
        let mut temp = NamedTempFile::new_in(cache.root_dir()).unwrap();
        temp.as_file_mut().write_all(data).unwrap();

        Download::new(temp, format)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn index_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, *name, *data).unwrap();
        }

        builder.into_inner().unwrap()
    }

    #[test]
    fn install_and_read_metadata() -> Result<()> {
        let (_dir, cache) = cache();

        assert!(cache.get_cached(CachedFile::Timestamp).is_none());

        let download = download_of(&cache, b"{\"a\":1}", Format::Raw);
        cache.cache_remote_file(download, CachePolicy::CacheMetadata(CachedFile::Timestamp))?;

        let path = cache.get_cached(CachedFile::Timestamp).unwrap();
        assert_eq!(std::fs::read(&path)?, b"{\"a\":1}");

        // Reinstalling identical content replaces the file in place.
        let download = download_of(&cache, b"{\"a\":1}", Format::Raw);
        cache.cache_remote_file(download, CachePolicy::CacheMetadata(CachedFile::Timestamp))?;
        assert_eq!(std::fs::read(&path)?, b"{\"a\":1}");

        Ok(())
    }

    #[test]
    fn install_decompresses_gzip_metadata() -> Result<()> {
        let (_dir, cache) = cache();

        let download = download_of(&cache, &gzip(b"{\"b\":2}"), Format::Gzip);
        cache.cache_remote_file(download, CachePolicy::CacheMetadata(CachedFile::Mirrors))?;

        let path = cache.get_cached(CachedFile::Mirrors).unwrap();
        assert_eq!(std::fs::read(&path)?, b"{\"b\":2}");

        Ok(())
    }

    #[test]
    fn install_index_builds_offset_table() -> Result<()> {
        let (_dir, cache) = cache();

        let tar = index_tar(&[("foo/1.0/foo.cabal", b"name: foo")]);
        let download = download_of(&cache, &tar, Format::Raw);
        cache.cache_remote_file(download, CachePolicy::CacheIndex)?;

        assert!(cache.get_cached_index().is_some());
        assert_eq!(
            cache.get_from_index("foo/1.0/foo.cabal")?,
            Some(b"name: foo".to_vec())
        );
        assert_eq!(cache.get_from_index("missing/file")?, None);

        Ok(())
    }

    #[test]
    fn install_gzip_index_keeps_compressed_variant() -> Result<()> {
        let (_dir, cache) = cache();

        let tar = index_tar(&[("foo/1.0/foo.cabal", b"name: foo")]);
        let download = download_of(&cache, &gzip(&tar), Format::Gzip);
        cache.cache_remote_file(download, CachePolicy::CacheIndex)?;

        assert_eq!(std::fs::read(cache.index_tar_path())?, tar);
        assert!(cache.root_dir().join(INDEX_TAR_GZ).is_file());
        assert_eq!(
            cache.get_from_index("foo/1.0/foo.cabal")?,
            Some(b"name: foo".to_vec())
        );

        Ok(())
    }

    #[test]
    fn corrupt_offset_table_heals_on_lookup() -> Result<()> {
        let (_dir, cache) = cache();

        let tar = index_tar(&[("foo/1.0/foo.cabal", b"name: foo")]);
        let download = download_of(&cache, &tar, Format::Raw);
        cache.cache_remote_file(download, CachePolicy::CacheIndex)?;

        // Truncate the sidecar mid-document.
        std::fs::write(cache.root_dir().join(INDEX_TAR_IDX), b"{\"version\"")?;

        assert_eq!(
            cache.get_from_index("foo/1.0/foo.cabal")?,
            Some(b"name: foo".to_vec())
        );

        // The sidecar was rewritten and is valid again.
        assert!(index::try_read_index(&cache.root_dir().join(INDEX_TAR_IDX))?.is_some());

        Ok(())
    }

    #[test]
    fn clear_cache_keeps_root_and_index() -> Result<()> {
        let (_dir, cache) = cache();

        for file in [
            CachedFile::Root,
            CachedFile::Timestamp,
            CachedFile::Snapshot,
            CachedFile::Mirrors,
        ] {
            let download = download_of(&cache, b"{}", Format::Raw);
            cache.cache_remote_file(download, CachePolicy::CacheMetadata(file))?;
        }
        let tar = index_tar(&[("foo/1.0/foo.cabal", b"name: foo")]);
        cache.cache_remote_file(download_of(&cache, &tar, Format::Raw), CachePolicy::CacheIndex)?;

        cache.clear_cache()?;

        assert!(cache.get_cached(CachedFile::Root).is_some());
        assert!(cache.get_cached(CachedFile::Mirrors).is_some());
        assert!(cache.get_cached_index().is_some());
        assert!(cache.get_cached(CachedFile::Timestamp).is_none());
        assert!(cache.get_cached(CachedFile::Snapshot).is_none());

        // Clearing an already clear cache is fine.
        cache.clear_cache()?;

        Ok(())
    }

    #[test]
    #[should_panic(expected = "bootstrap must complete")]
    fn missing_root_is_a_caller_bug() {
        let (_dir, cache) = cache();

        cache.get_cached_root();
    }
}
