// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The update engine.

Three entry points: [Client::bootstrap] establishes the trust root,
[Client::check_for_updates] runs the ordered update transaction
(root chain, then timestamp, then snapshot, then the files the snapshot
pins), and [Client::with_package] / [Client::download_package] retrieve
a verified package tarball.

Each update is transactional: nothing is installed into the cache until
it has passed signature, length and digest checks, and a failure at any
point leaves the previously trusted files in place. Rollback protection
compares every fetched role version against the cached one; freeze
protection comes from expiry checks plus refetching the timestamp on
every invocation; mix-and-match protection comes from only trusting
files through the hashes the verified snapshot records for them.
*/

use {
    crate::{
        cache::{INDEX_TAR, INDEX_TAR_GZ},
        crypto::KeyId,
        error::{HackageRepositoryError, Result},
        io::{self, Format},
        metadata::{
            self, CachedFile, FileInfo, Mirrors, Role, RoleKind, RoleSpec, Root, Snapshot,
            Targets, Timestamp, VerifyOptions,
        },
        repository::{CachePolicy, Download, RemoteFile, Repository},
    },
    chrono::{DateTime, Utc},
    log::{debug, info, warn},
    std::{path::Path, str::FromStr},
    tempfile::NamedTempFile,
};

/// Hard cap on consecutive root rotations within one update, so a
/// misbehaving repository cannot keep the client walking a root chain
/// forever. Real repositories rotate a handful of times a year.
const MAX_ROOT_ROTATIONS: u32 = 1024;

/// Outcome of a [Client::check_for_updates] run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The cached state already matches the repository.
    NoUpdates,
    /// New files were verified and installed.
    HasUpdates,
}

impl std::fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoUpdates => "NoUpdates",
            Self::HasUpdates => "HasUpdates",
        })
    }
}

/// A package name plus version, e.g. `lens-5.2.1`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    /// Path of this package's targets document inside the index.
    pub fn index_entry_path(&self) -> String {
        format!("{}/{}/package.json", self.name, self.version)
    }

    /// Repository path of this package's tarball.
    pub fn tarball_path(&self) -> String {
        format!("package/{}-{}.tar.gz", self.name, self.version)
    }
}

impl FromStr for PackageId {
    type Err = HackageRepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HackageRepositoryError::Encoding {
            what: "package identifier",
            detail: format!("{} is not of the form <name>-<version>", s),
        };

        let (name, version) = s.rsplit_once('-').ok_or_else(invalid)?;

        if name.is_empty()
            || version.is_empty()
            || !version.starts_with(|c: char| c.is_ascii_digit())
            || !version.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// The secure update client.
pub struct Client {
    repository: Box<dyn Repository>,
}

impl Client {
    /// Construct a client over any repository backend.
    pub fn new(repository: Box<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Establish the trust root from out-of-band key fingerprints.
    ///
    /// Fetches `root.json`, requires at least `threshold` of the root
    /// role's declared keys to match the supplied fingerprints, and
    /// requires that many of those matching keys to have validly signed
    /// the document. The document's own root threshold must be met as
    /// well. Nothing is written unless every check passes.
    pub fn bootstrap(&self, fingerprints: &[KeyId], threshold: u32) -> Result<()> {
        if threshold < 1 {
            return Err(HackageRepositoryError::Encoding {
                what: "bootstrap threshold",
                detail: "threshold must be at least 1".to_string(),
            });
        }

        let now = Utc::now();

        let download = self.repository.fetch(&RemoteFile::Root { version: None })?;
        let raw = download.bytes()?;

        let envelope = metadata::parse_envelope(&raw)?;
        let candidate: Root = serde_json::from_value(envelope.signed)?;
        candidate.validate()?;

        let matching: Vec<KeyId> = candidate
            .roles
            .root
            .keyids
            .iter()
            .filter(|&keyid| fingerprints.contains(keyid))
            .cloned()
            .collect();
        if (matching.len() as u32) < threshold {
            return Err(HackageRepositoryError::BootstrapKeys {
                wanted: threshold,
                matching: matching.len() as u32,
            });
        }

        // The caller's threshold over the matching keys, and the
        // document's own threshold over its declared keys, must both
        // hold.
        let caller_spec = RoleSpec {
            keyids: matching,
            threshold,
        };
        let _: Root = metadata::verify_signed(
            &raw,
            &VerifyOptions {
                keys: &candidate.keys,
                spec: &caller_spec,
                check_expiry: true,
                now,
            },
        )?;
        let root: Root = metadata::verify_signed(
            &raw,
            &VerifyOptions {
                keys: &candidate.keys,
                spec: &candidate.roles.root,
                check_expiry: true,
                now,
            },
        )?;

        self.repository
            .cache_remote_file(download, CachePolicy::CacheMetadata(CachedFile::Root))?;
        info!("established trust root version {}", root.version);

        Ok(())
    }

    /// Synchronize the cache with the repository.
    ///
    /// `check_expiry` should be `true` outside of offline inspection of
    /// stale repositories.
    pub fn check_for_updates(&self, check_expiry: bool) -> Result<UpdateOutcome> {
        let now = Utc::now();

        let mut root = self.load_trusted_root(check_expiry, now)?;

        // Walk the root chain until the repository has nothing newer.
        let mut rotations = 0u32;
        loop {
            let next_version = root.version + 1;
            let download = match self.repository.fetch(&RemoteFile::Root {
                version: Some(next_version),
            }) {
                Ok(download) => download,
                Err(HackageRepositoryError::NotFound(_)) => break,
                Err(e) => return Err(e),
            };

            if rotations >= MAX_ROOT_ROTATIONS {
                return Err(HackageRepositoryError::RotationLimitExceeded(
                    MAX_ROOT_ROTATIONS,
                ));
            }

            let raw = download.bytes()?;
            let new_root = verify_root_transition(&raw, &root, check_expiry, now)?;

            if new_root.version < next_version {
                return Err(HackageRepositoryError::Rollback {
                    role: "Root",
                    trusted: root.version,
                    offered: new_root.version,
                });
            }
            if new_root.version != next_version {
                return Err(HackageRepositoryError::Encoding {
                    what: "root document",
                    detail: format!(
                        "{}.root.json carries version {}",
                        next_version, new_root.version
                    ),
                });
            }

            self.repository
                .cache_remote_file(download, CachePolicy::CacheMetadata(CachedFile::Root))?;
            root = new_root;
            rotations += 1;
            warn!("trust root rotated to version {}", root.version);
        }

        if rotations > 0 {
            // The cached timestamp and snapshot may have been signed by
            // keys the new root revoked. Discard and refetch.
            self.repository.clear_cache()?;
        }

        // The timestamp is refetched on every invocation; a repository
        // that keeps serving the same one eventually trips its expiry.
        let timestamp_download = self.repository.fetch(&RemoteFile::Timestamp)?;
        let timestamp_raw = timestamp_download.bytes()?;
        let timestamp: Timestamp = metadata::verify_signed(
            &timestamp_raw,
            &self.options(&root, RoleKind::Timestamp, check_expiry, now),
        )?;

        let cached_timestamp = self.load_cached_role::<Timestamp>(CachedFile::Timestamp, &root, now);
        if let Some(cached) = &cached_timestamp {
            if timestamp.version < cached.version {
                return Err(HackageRepositoryError::Rollback {
                    role: "Timestamp",
                    trusted: cached.version,
                    offered: timestamp.version,
                });
            }
        }
        let timestamp_unchanged = cached_timestamp
            .map(|cached| cached.version == timestamp.version)
            .unwrap_or(false);

        // The timestamp pins the snapshot by hash; a match means the
        // repository state we hold is current.
        let snapshot_info = timestamp.snapshot_info()?;
        if let Some(snapshot_path) = self.repository.get_cached(CachedFile::Snapshot) {
            if snapshot_info.matches_file(&snapshot_path)? {
                if !timestamp_unchanged {
                    self.repository.cache_remote_file(
                        timestamp_download,
                        CachePolicy::CacheMetadata(CachedFile::Timestamp),
                    )?;
                }
                info!("snapshot is current");
                return Ok(UpdateOutcome::NoUpdates);
            }
        }

        let snapshot_download = self.repository.fetch(&RemoteFile::Snapshot {
            info: snapshot_info.clone(),
        })?;
        let snapshot_raw = snapshot_download.bytes()?;
        let snapshot: Snapshot = metadata::verify_signed(
            &snapshot_raw,
            &self.options(&root, RoleKind::Snapshot, check_expiry, now),
        )?;

        if let Some(cached) = self.load_cached_role::<Snapshot>(CachedFile::Snapshot, &root, now) {
            if snapshot.version < cached.version {
                return Err(HackageRepositoryError::Rollback {
                    role: "Snapshot",
                    trusted: cached.version,
                    offered: snapshot.version,
                });
            }
        }

        // The snapshot must describe the root that authorized it; the
        // rotation walk has already converged, so disagreement here is
        // evidence of mixed repository states.
        if let Some(info) = snapshot.info(CachedFile::Root.file_name()) {
            let root_path = self.repository.get_cached_root();
            if !info.matches_file(&root_path)? {
                let (_, got) = io::digest_file(&root_path)?;
                return Err(HackageRepositoryError::DigestMismatch {
                    path: CachedFile::Root.file_name().to_string(),
                    wanted: info.sha256()?.digest_hex(),
                    got: got.digest_hex(),
                });
            }
        }

        // Refresh each snapshot-pinned file whose cached copy no longer
        // matches.
        if let Some(info) = snapshot.info(CachedFile::Mirrors.file_name()) {
            self.update_mirrors_file(&root, info, check_expiry, now)?;
        }

        let tar_info = snapshot.required_info(INDEX_TAR)?;
        let index_current = match self.repository.get_cached_index() {
            Some(path) => tar_info.matches_file(&path)?,
            None => false,
        };
        if !index_current {
            let download = self.repository.fetch(&RemoteFile::Index {
                tar: tar_info.clone(),
                tar_gz: snapshot.info(INDEX_TAR_GZ).cloned(),
            })?;

            // A gzip delivery was stream-verified against the compressed
            // variant's digests; the archive itself must match too
            // before it can be installed.
            if download.format() == Format::Gzip {
                verify_decompressed(&download, tar_info, INDEX_TAR)?;
            }

            self.repository
                .cache_remote_file(download, CachePolicy::CacheIndex)?;
        }

        for name in snapshot.meta.keys() {
            if !matches!(
                name.as_str(),
                "root.json" | "mirrors.json" | INDEX_TAR | INDEX_TAR_GZ
            ) {
                debug!("snapshot lists {} which this client does not fetch", name);
            }
        }

        // Commit: children first, then the snapshot that pins them, then
        // the timestamp that pins the snapshot. An interruption leaves
        // parents pointing at files the next run simply refetches.
        self.repository.cache_remote_file(
            snapshot_download,
            CachePolicy::CacheMetadata(CachedFile::Snapshot),
        )?;
        self.repository.cache_remote_file(
            timestamp_download,
            CachePolicy::CacheMetadata(CachedFile::Timestamp),
        )?;

        info!("repository state updated");
        Ok(UpdateOutcome::HasUpdates)
    }

    /// Fetch a verified package tarball and hand its temp path to
    /// `handler`. The temp file is removed when the handler returns.
    pub fn with_package<T>(
        &self,
        package: &PackageId,
        handler: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let now = Utc::now();
        let root = self.load_trusted_root(true, now)?;

        // A verified snapshot is the precondition for trusting the
        // index the targets document comes out of.
        let snapshot_path = self
            .repository
            .get_cached(CachedFile::Snapshot)
            .ok_or(HackageRepositoryError::UpdateRequired)?;
        let snapshot_raw = std::fs::read(&snapshot_path).map_err(|e| {
            HackageRepositoryError::IoPath(format!("{}", snapshot_path.display()), e)
        })?;
        let snapshot: Snapshot = metadata::verify_signed(
            &snapshot_raw,
            &self.options(&root, RoleKind::Snapshot, true, now),
        )?;

        let index_path = self
            .repository
            .get_cached_index()
            .ok_or(HackageRepositoryError::UpdateRequired)?;
        let tar_info = snapshot.required_info(INDEX_TAR)?;
        if !tar_info.matches_file(&index_path)? {
            return Err(HackageRepositoryError::CacheCorrupt(
                "package index does not match the verified snapshot; run check_for_updates"
                    .to_string(),
            ));
        }

        let entry_path = package.index_entry_path();
        let raw = self
            .repository
            .get_from_index(&entry_path)?
            .ok_or_else(|| HackageRepositoryError::UnknownTarget(package.to_string()))?;
        let targets: Targets =
            metadata::verify_signed(&raw, &self.options(&root, RoleKind::Targets, true, now))?;

        let target_path = package.tarball_path();
        let info = targets
            .lookup(&target_path)
            .ok_or_else(|| HackageRepositoryError::UnknownTarget(target_path.clone()))?;

        let download = self.repository.fetch(&RemoteFile::Package {
            path: target_path,
            info: info.clone(),
        })?;

        handler(download.path())
    }

    /// Fetch a verified package tarball and atomically place it at
    /// `dest`.
    pub fn download_package(&self, package: &PackageId, dest: &Path) -> Result<()> {
        self.with_package(package, |verified| {
            let dir = match dest.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };

            let temp = NamedTempFile::new_in(dir)?;
            std::fs::copy(verified, temp.path())
                .map_err(|e| HackageRepositoryError::IoPath(format!("{}", dest.display()), e))?;
            temp.persist(dest).map_err(|e| {
                HackageRepositoryError::IoPath(format!("{}", dest.display()), e.error)
            })?;

            Ok(())
        })
    }

    fn options<'a>(
        &self,
        root: &'a Root,
        kind: RoleKind,
        check_expiry: bool,
        now: DateTime<Utc>,
    ) -> VerifyOptions<'a> {
        VerifyOptions {
            keys: &root.keys,
            spec: root.role_spec(kind),
            check_expiry,
            now,
        }
    }

    /// Load and re-verify the trusted root from the cache.
    fn load_trusted_root(&self, check_expiry: bool, now: DateTime<Utc>) -> Result<Root> {
        let path = self.repository.get_cached_root();
        let raw = std::fs::read(&path)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", path.display()), e))?;

        let envelope = metadata::parse_envelope(&raw)?;
        let unverified: Root = serde_json::from_value(envelope.signed)?;
        unverified.validate()?;

        metadata::verify_signed(
            &raw,
            &VerifyOptions {
                keys: &unverified.keys,
                spec: &unverified.roles.root,
                check_expiry,
                now,
            },
        )
    }

    /// Load a cached role document, verifying it against the current
    /// root. Unreadable or no-longer-verifying cached files report as
    /// absent so the update path refetches them.
    fn load_cached_role<T: Role>(
        &self,
        file: CachedFile,
        root: &Root,
        now: DateTime<Utc>,
    ) -> Option<T> {
        let path = self.repository.get_cached(file)?;

        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "cached {} is unreadable: {}; it will be refetched",
                    file.file_name(),
                    e
                );
                return None;
            }
        };

        match metadata::verify_signed::<T>(
            &raw,
            &VerifyOptions {
                keys: &root.keys,
                spec: root.role_spec(T::KIND),
                check_expiry: false,
                now,
            },
        ) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!(
                    "cached {} failed verification: {}; it will be refetched",
                    file.file_name(),
                    e
                );
                None
            }
        }
    }

    fn update_mirrors_file(
        &self,
        root: &Root,
        info: &FileInfo,
        check_expiry: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = match self.repository.get_cached(CachedFile::Mirrors) {
            Some(path) => info.matches_file(&path)?,
            None => false,
        };
        if current {
            return Ok(());
        }

        let download = self
            .repository
            .fetch(&RemoteFile::Mirrors { info: info.clone() })?;
        let raw = download.bytes()?;
        let mirrors: Mirrors =
            metadata::verify_signed(&raw, &self.options(root, RoleKind::Mirrors, check_expiry, now))?;

        if let Some(cached) = self.load_cached_role::<Mirrors>(CachedFile::Mirrors, root, now) {
            if mirrors.version < cached.version {
                return Err(HackageRepositoryError::Rollback {
                    role: "Mirrors",
                    trusted: cached.version,
                    offered: mirrors.version,
                });
            }
        }

        self.repository
            .cache_remote_file(download, CachePolicy::CacheMetadata(CachedFile::Mirrors))?;

        match mirrors.urls() {
            Ok(urls) if !urls.is_empty() => self.repository.update_mirrors(&urls),
            Ok(_) => {}
            Err(e) => warn!("mirror list contains an unusable URI: {}", e),
        }

        Ok(())
    }
}

/// Verify a candidate next root against the current one.
///
/// The transition is valid when the current root's root role authorizes
/// the new document *and* the new document satisfies its own root role,
/// so a rotation both is approved by the keys being rotated out and
/// stands on the keys being rotated in.
fn verify_root_transition(
    raw: &[u8],
    current: &Root,
    check_expiry: bool,
    now: DateTime<Utc>,
) -> Result<Root> {
    let envelope = metadata::parse_envelope(raw)?;
    let candidate: Root = serde_json::from_value(envelope.signed)?;
    candidate.validate()?;

    let _: Root = metadata::verify_signed(
        raw,
        &VerifyOptions {
            keys: &current.keys,
            spec: &current.roles.root,
            check_expiry,
            now,
        },
    )?;

    metadata::verify_signed(
        raw,
        &VerifyOptions {
            keys: &candidate.keys,
            spec: &candidate.roles.root,
            check_expiry,
            now,
        },
    )
}

/// Check a download's decompressed content against the file info its
/// parent recorded for the uncompressed file.
fn verify_decompressed(download: &Download, info: &FileInfo, path: &str) -> Result<()> {
    let fh = std::fs::File::open(download.path()).map_err(|e| {
        HackageRepositoryError::IoPath(format!("{}", download.path().display()), e)
    })?;

    let mut reader = io::read_decompressed(std::io::BufReader::new(fh), download.format());
    io::copy_verified(
        &mut reader,
        &mut std::io::sink(),
        path,
        info.length,
        &info.known_digests()?,
    )?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn package_id_parsing() {
        let id: PackageId = "lens-5.2.1".parse().unwrap();
        assert_eq!(id.name, "lens");
        assert_eq!(id.version, "5.2.1");

        // Hyphenated names split at the last hyphen.
        let id: PackageId = "unordered-containers-0.2.19".parse().unwrap();
        assert_eq!(id.name, "unordered-containers");
        assert_eq!(id.version, "0.2.19");

        assert!("lens".parse::<PackageId>().is_err());
        assert!("lens-".parse::<PackageId>().is_err());
        assert!("-5.2".parse::<PackageId>().is_err());
        assert!("lens-beta".parse::<PackageId>().is_err());
    }

    #[test]
    fn package_id_paths() {
        let id: PackageId = "lens-5.2.1".parse().unwrap();

        assert_eq!(id.index_entry_path(), "lens/5.2.1/package.json");
        assert_eq!(id.tarball_path(), "package/lens-5.2.1.tar.gz");
        assert_eq!(id.to_string(), "lens-5.2.1");
    }

    #[test]
    fn outcome_display() {
        assert_eq!(UpdateOutcome::NoUpdates.to_string(), "NoUpdates");
        assert_eq!(UpdateOutcome::HasUpdates.to_string(), "HasUpdates");
    }
}
