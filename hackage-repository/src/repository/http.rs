// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repositories served via HTTP.

Instances are bound to an ordered list of mirror base URLs. A fetch
walks the mirrors, and within one mirror the acceptable formats, until a
stream passes its declared length and digest checks; only then does the
temp file leave this module. Failures are retried on the next mirror
before the last error surfaces.
*/

use {
    crate::{
        cache::{Cache, INDEX_TAR},
        error::{HackageRepositoryError, Result},
        io::{self, Format},
        metadata::FileInfo,
        repository::{Download, RemoteFile, Repository},
    },
    log::{info, warn},
    reqwest::{blocking::Client, header, redirect, StatusCode},
    std::{path::Path, sync::RwLock, time::Duration},
    tempfile::NamedTempFile,
    url::Url,
};

/// Default HTTP user agent string.
pub const USER_AGENT: &str =
    "hackage-repository Rust crate (https://crates.io/crates/hackage-repository)";

const MAX_REDIRECTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for repositories accessed via HTTP.
#[derive(Debug)]
pub struct RemoteRepository {
    client: Client,
    mirrors: RwLock<Vec<Url>>,
    cache: Cache,
}

impl RemoteRepository {
    /// Construct an instance bound to a single mirror.
    pub fn new(url: Url, cache_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_mirrors(vec![url], cache_dir)
    }

    /// Construct an instance bound to an ordered mirror list.
    pub fn with_mirrors(mirrors: Vec<Url>, cache_dir: impl AsRef<Path>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()?;

        Ok(Self {
            client,
            mirrors: RwLock::new(mirrors.into_iter().map(normalize_mirror).collect()),
            cache: Cache::new(cache_dir)?,
        })
    }

    fn fetch_from(&self, mirror: &Url, file: &RemoteFile, format: Format) -> Result<Download> {
        if format == Format::Raw {
            if let RemoteFile::Index { tar, .. } = file {
                match self.try_fetch_index_range(mirror, tar) {
                    Ok(Some(download)) => return Ok(download),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            "incremental index fetch from {} failed: {}; falling back to full download",
                            mirror, e
                        );
                    }
                }
            }
        }

        let path = file.remote_path(format);
        let url = mirror.join(&path)?;

        info!("fetching {}", url);
        let mut response = self.client.get(url.clone()).send()?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(HackageRepositoryError::NotFound(path));
        }
        if !status.is_success() {
            return Err(HackageRepositoryError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut temp = NamedTempFile::new_in(self.cache.root_dir())?;
        io::copy_verified(
            &mut response,
            temp.as_file_mut(),
            &path,
            file.length_bound(format),
            &file.expected_digests(format)?,
        )?;

        Ok(Download::new(temp, format))
    }

    /// Attempt to fetch only the bytes appended to the package index
    /// since the cached copy was written.
    ///
    /// Returns `Ok(None)` whenever a full download should happen
    /// instead: no usable cached archive, a server that does not honor
    /// the range request, or a stitched archive that fails the recorded
    /// digest.
    fn try_fetch_index_range(&self, mirror: &Url, tar: &FileInfo) -> Result<Option<Download>> {
        let Some(cached) = self.cache.get_cached_index() else {
            return Ok(None);
        };

        let cached_length = std::fs::metadata(&cached)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", cached.display()), e))?
            .len();
        if cached_length == 0 || cached_length >= tar.length {
            return Ok(None);
        }

        let url = mirror.join(INDEX_TAR)?;
        info!("fetching {} (resuming from byte {})", url, cached_length);

        let mut response = self
            .client
            .get(url)
            .header(header::RANGE, format!("bytes={}-", cached_length))
            .send()?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Ok(None);
        }

        let mut temp = NamedTempFile::new_in(self.cache.root_dir())?;

        let mut prefix = std::fs::File::open(&cached)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", cached.display()), e))?;
        std::io::copy(&mut prefix, temp.as_file_mut())
            .map_err(|e| HackageRepositoryError::IoPath(INDEX_TAR.to_string(), e))?;

        io::copy_verified(
            &mut response,
            temp.as_file_mut(),
            INDEX_TAR,
            tar.length - cached_length,
            &[],
        )?;

        // The recorded digest covers the whole archive, so the stitched
        // result is checked as one file.
        let (length, digest) = io::digest_file(temp.path())?;
        if length != tar.length || digest != tar.sha256()? {
            warn!("incremental index download produced a mismatched archive");
            return Ok(None);
        }

        Ok(Some(Download::new(temp, Format::Raw)))
    }
}

impl Repository for RemoteRepository {
    fn fetch(&self, file: &RemoteFile) -> Result<Download> {
        let mirrors = self
            .mirrors
            .read()
            .expect("mirror list lock poisoned")
            .clone();

        let mut last_error = None;

        for mirror in &mirrors {
            for format in file.formats() {
                match self.fetch_from(mirror, file, format) {
                    Ok(download) => return Ok(download),
                    Err(e @ HackageRepositoryError::NotFound(_)) => {
                        // This mirror may still serve another format.
                        last_error = Some(e);
                    }
                    Err(e) => {
                        warn!(
                            "fetching {} from {} failed: {}",
                            file.remote_path(format),
                            mirror,
                            e
                        );
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| HackageRepositoryError::NotFound(file.remote_path(Format::Raw))))
    }

    fn cache(&self) -> &Cache {
        &self.cache
    }

    fn update_mirrors(&self, mirrors: &[Url]) {
        if mirrors.is_empty() {
            return;
        }

        *self.mirrors.write().expect("mirror list lock poisoned") = mirrors
            .iter()
            .cloned()
            .map(normalize_mirror)
            .collect();
    }
}

/// Trailing slashes are significant to [Url::join], so mirror roots are
/// normalized to end with one.
fn normalize_mirror(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }

    url
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mirror_roots_get_trailing_slashes() {
        let url = normalize_mirror(Url::parse("https://example.com/packages").unwrap());
        assert_eq!(url.as_str(), "https://example.com/packages/");

        let url = normalize_mirror(Url::parse("https://example.com/packages/").unwrap());
        assert_eq!(url.as_str(), "https://example.com/packages/");

        assert_eq!(
            url.join("00-index.tar").unwrap().as_str(),
            "https://example.com/packages/00-index.tar"
        );
    }
}
