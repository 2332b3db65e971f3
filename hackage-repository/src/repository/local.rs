// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem based repositories.

A local repository is a directory laid out exactly like a mirror would
serve it. Fetches run the same verified-copy path as the HTTP backend,
so a tampered local repository is rejected just like a tampered remote
one.
*/

use {
    crate::{
        cache::Cache,
        error::{HackageRepositoryError, Result},
        io::{self, Format},
        repository::{Download, RemoteFile, Repository},
    },
    std::path::{Path, PathBuf},
    tempfile::NamedTempFile,
};

/// A repository backed by a local directory.
#[derive(Clone, Debug)]
pub struct LocalRepository {
    root_dir: PathBuf,
    cache: Cache,
}

impl LocalRepository {
    /// Construct an instance serving from `root_dir`, owning the cache
    /// at `cache_dir`.
    pub fn new(root_dir: impl AsRef<Path>, cache_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            cache: Cache::new(cache_dir)?,
        })
    }
}

impl Repository for LocalRepository {
    fn fetch(&self, file: &RemoteFile) -> Result<Download> {
        let mut selected = None;
        for format in file.formats() {
            let path = self.root_dir.join(file.remote_path(format));
            if path.is_file() {
                selected = Some((format, path));
                break;
            }
        }

        let Some((format, path)) = selected else {
            return Err(HackageRepositoryError::NotFound(
                file.remote_path(Format::Raw),
            ));
        };

        let fh = std::fs::File::open(&path)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", path.display()), e))?;
        let mut reader = std::io::BufReader::new(fh);

        let mut temp = NamedTempFile::new_in(self.cache.root_dir())?;
        io::copy_verified(
            &mut reader,
            temp.as_file_mut(),
            &file.remote_path(format),
            file.length_bound(format),
            &file.expected_digests(format)?,
        )?;

        Ok(Download::new(temp, format))
    }

    fn cache(&self) -> &Cache {
        &self.cache
    }
}
