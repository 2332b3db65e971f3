// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signed repository metadata.

Every role document travels in the envelope `{"signed": ..., "signatures":
[...]}`. The modules under this tree provide typed views over the five
role documents. All signature checking funnels through [verify_signed],
the single site that enforces the role tag, the signature threshold and
the expiry header.
*/

pub mod mirrors;
pub mod root;
pub mod snapshot;
pub mod targets;
pub mod timestamp;

pub use self::{
    mirrors::Mirrors,
    root::{RoleSpec, Root},
    snapshot::Snapshot,
    targets::Targets,
    timestamp::Timestamp,
};

use {
    crate::{
        cjson,
        crypto::{KeyId, PublicKey},
        error::{HackageRepositoryError, Result},
        io::{self, ContentDigest},
    },
    base64::{prelude::BASE64_STANDARD, Engine as _},
    chrono::{DateTime, Utc},
    log::debug,
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::collections::{BTreeMap, BTreeSet},
    std::path::Path,
};

/// Signature method accepted on role documents.
const SIGNATURE_METHOD: &str = "ed25519";

/// The kind of a role document.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RoleKind {
    Root,
    Timestamp,
    Snapshot,
    Targets,
    Mirrors,
}

impl RoleKind {
    /// The value of the `_type` field identifying this kind on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Root => "Root",
            Self::Timestamp => "Timestamp",
            Self::Snapshot => "Snapshot",
            Self::Targets => "Targets",
            Self::Mirrors => "Mirrors",
        }
    }
}

/// Names the metadata files held in the persistent cache.
///
/// The targets role is not listed: targets documents are read out of the
/// package index rather than cached as standalone files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CachedFile {
    Root,
    Timestamp,
    Snapshot,
    Mirrors,
}

impl CachedFile {
    /// File name of this entry inside the cache directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Root => "root.json",
            Self::Timestamp => "timestamp.json",
            Self::Snapshot => "snapshot.json",
            Self::Mirrors => "mirrors.json",
        }
    }
}

/// A signature and the key id that made it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Signature {
    pub keyid: KeyId,
    pub method: String,
    pub sig: String,
}

/// A signed metadata envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Signed<T> {
    pub signed: T,
    pub signatures: Vec<Signature>,
}

/// Size and digests of a file, as recorded by a parent document.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileInfo {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

impl FileInfo {
    /// Obtain the required SHA-256 digest.
    pub fn sha256(&self) -> Result<ContentDigest> {
        let digest = self
            .hashes
            .get("sha256")
            .ok_or(HackageRepositoryError::Encoding {
                what: "file info",
                detail: "missing required sha256 hash".to_string(),
            })?;

        ContentDigest::sha256_hex(digest)
    }

    /// Obtain every digest this crate recognizes.
    ///
    /// SHA-256 must be present; additional recognized algorithms are
    /// returned as well so they are all enforced during download.
    pub fn known_digests(&self) -> Result<Vec<ContentDigest>> {
        let mut digests = vec![self.sha256()?];

        for (algorithm, digest) in &self.hashes {
            if algorithm == "sha256" {
                continue;
            }

            if let Some(digest) = ContentDigest::from_algorithm_name(algorithm, digest)? {
                digests.push(digest);
            }
        }

        Ok(digests)
    }

    /// Whether the file at `path` has the recorded length and SHA-256
    /// digest.
    pub fn matches_file(&self, path: &Path) -> Result<bool> {
        let (length, digest) = io::digest_file(path)?;

        Ok(length == self.length && digest == self.sha256()?)
    }
}

/// Common header of every role document.
pub trait Role: DeserializeOwned {
    const KIND: RoleKind;

    fn version(&self) -> u64;
    fn expires(&self) -> DateTime<Utc>;
}

/// Inputs to [verify_signed]: the key table and role spec to verify
/// against, and the expiry policy in effect.
pub struct VerifyOptions<'a> {
    pub keys: &'a BTreeMap<KeyId, PublicKey>,
    pub spec: &'a RoleSpec,
    pub check_expiry: bool,
    pub now: DateTime<Utc>,
}

/// Parse the raw bytes of a metadata file into an untyped envelope.
pub fn parse_envelope(raw: &[u8]) -> Result<Signed<serde_json::Value>> {
    Ok(serde_json::from_slice(raw)?)
}

/// Parse and verify a role document.
///
/// Checks, in order: well-formed envelope, `_type` agreement with `T`,
/// at least `threshold` valid signatures by distinct keys listed for the
/// role, and (unless disabled) expiry. The signed payload is recovered by
/// canonically re-encoding the parsed `signed` value. Version rollback is
/// not checked here: it needs the currently trusted document and is the
/// caller's responsibility.
pub fn verify_signed<T: Role>(raw: &[u8], options: &VerifyOptions<'_>) -> Result<T> {
    let envelope = parse_envelope(raw)?;
    let payload = cjson::to_canonical_json(&envelope.signed)?;

    let tag = envelope
        .signed
        .get("_type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("<missing>");
    if tag != T::KIND.tag() {
        return Err(HackageRepositoryError::RoleMismatch {
            wanted: T::KIND.tag(),
            got: tag.to_string(),
        });
    }

    let mut signers = BTreeSet::new();

    for signature in &envelope.signatures {
        if signature.method != SIGNATURE_METHOD {
            debug!(
                "ignoring signature with unsupported method {} on {} document",
                signature.method,
                T::KIND.tag()
            );
            continue;
        }

        if !options.spec.keyids.contains(&signature.keyid) || signers.contains(&signature.keyid) {
            continue;
        }

        let Some(key) = options.keys.get(&signature.keyid) else {
            continue;
        };

        let Ok(sig_bytes) = BASE64_STANDARD.decode(&signature.sig) else {
            debug!(
                "ignoring signature with malformed base64 on {} document",
                T::KIND.tag()
            );
            continue;
        };

        if key.verify(&payload, &sig_bytes) {
            signers.insert(signature.keyid.clone());
        }
    }

    if (signers.len() as u32) < options.spec.threshold {
        return Err(HackageRepositoryError::SignatureThreshold {
            role: T::KIND.tag(),
            wanted: options.spec.threshold,
            got: signers.len() as u32,
        });
    }

    let document: T = serde_json::from_value(envelope.signed)?;

    if document.version() < 1 {
        return Err(HackageRepositoryError::Encoding {
            what: "role document",
            detail: format!("{} version must be at least 1", T::KIND.tag()),
        });
    }

    if options.check_expiry && document.expires() <= options.now {
        return Err(HackageRepositoryError::Expired {
            role: T::KIND.tag(),
            expires: document.expires().to_rfc3339(),
        });
    }

    Ok(document)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        chrono::TimeZone,
        ed25519_dalek::{Signer, SigningKey},
        serde_json::json,
    };

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn public_key(seed: u8) -> PublicKey {
        PublicKey::from_bytes(&signing_key(seed).verifying_key().to_bytes()).unwrap()
    }

    fn key_table(seeds: &[u8]) -> BTreeMap<KeyId, PublicKey> {
        seeds
            .iter()
            .map(|seed| {
                let key = public_key(*seed);
                (key.key_id(), key)
            })
            .collect()
    }

    fn sign_envelope(signed: serde_json::Value, seeds: &[u8]) -> Vec<u8> {
        let payload = cjson::to_canonical_json(&signed).unwrap();

        let signatures = seeds
            .iter()
            .map(|seed| {
                let signer = signing_key(*seed);
                json!({
                    "keyid": public_key(*seed).key_id().as_str(),
                    "method": "ed25519",
                    "sig": BASE64_STANDARD.encode(signer.sign(&payload).to_bytes()),
                })
            })
            .collect::<Vec<_>>();

        serde_json::to_vec(&json!({"signed": signed, "signatures": signatures})).unwrap()
    }

    fn timestamp_value() -> serde_json::Value {
        json!({
            "_type": "Timestamp",
            "expires": "2030-01-01T00:00:00Z",
            "version": 3,
            "meta": {
                "snapshot.json": {"length": 100, "hashes": {"sha256": "aa".repeat(32)}},
            },
        })
    }

    fn options<'a>(
        keys: &'a BTreeMap<KeyId, PublicKey>,
        spec: &'a RoleSpec,
    ) -> VerifyOptions<'a> {
        VerifyOptions {
            keys,
            spec,
            check_expiry: true,
            now: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn spec_for(seeds: &[u8], threshold: u32) -> RoleSpec {
        RoleSpec {
            keyids: seeds.iter().map(|seed| public_key(*seed).key_id()).collect(),
            threshold,
        }
    }

    #[test]
    fn accepts_threshold_signatures() -> Result<()> {
        let keys = key_table(&[1, 2]);
        let spec = spec_for(&[1, 2], 2);

        let raw = sign_envelope(timestamp_value(), &[1, 2]);
        let timestamp: Timestamp = verify_signed(&raw, &options(&keys, &spec))?;

        assert_eq!(timestamp.version, 3);

        Ok(())
    }

    #[test]
    fn rejects_below_threshold() {
        let keys = key_table(&[1, 2]);
        let spec = spec_for(&[1, 2], 2);

        let raw = sign_envelope(timestamp_value(), &[1]);
        let res: Result<Timestamp> = verify_signed(&raw, &options(&keys, &spec));

        assert!(matches!(
            res,
            Err(HackageRepositoryError::SignatureThreshold {
                wanted: 2,
                got: 1,
                ..
            })
        ));
    }

    #[test]
    fn duplicate_signatures_count_once() {
        let keys = key_table(&[1, 2]);
        let spec = spec_for(&[1, 2], 2);

        let raw = sign_envelope(timestamp_value(), &[1, 1]);
        let res: Result<Timestamp> = verify_signed(&raw, &options(&keys, &spec));

        assert!(matches!(
            res,
            Err(HackageRepositoryError::SignatureThreshold { got: 1, .. })
        ));
    }

    #[test]
    fn signatures_by_unlisted_keys_are_ignored() {
        let keys = key_table(&[1, 2, 3]);
        let spec = spec_for(&[1, 2], 2);

        let raw = sign_envelope(timestamp_value(), &[1, 3]);
        let res: Result<Timestamp> = verify_signed(&raw, &options(&keys, &spec));

        assert!(matches!(
            res,
            Err(HackageRepositoryError::SignatureThreshold { got: 1, .. })
        ));
    }

    #[test]
    fn rejects_wrong_role_tag() {
        let keys = key_table(&[1]);
        let spec = spec_for(&[1], 1);

        let raw = sign_envelope(timestamp_value(), &[1]);
        let res: Result<Snapshot> = verify_signed(&raw, &options(&keys, &spec));

        assert!(matches!(
            res,
            Err(HackageRepositoryError::RoleMismatch {
                wanted: "Snapshot",
                ..
            })
        ));
    }

    #[test]
    fn expiry_is_enforced_unless_disabled() {
        let keys = key_table(&[1]);
        let spec = spec_for(&[1], 1);

        let mut value = timestamp_value();
        value["expires"] = json!("2000-01-01T00:00:00Z");
        let raw = sign_envelope(value, &[1]);

        let res: Result<Timestamp> = verify_signed(&raw, &options(&keys, &spec));
        assert!(matches!(res, Err(HackageRepositoryError::Expired { .. })));

        let mut opts = options(&keys, &spec);
        opts.check_expiry = false;
        let timestamp: Timestamp = verify_signed(&raw, &opts).unwrap();
        assert_eq!(timestamp.version, 3);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let keys = key_table(&[1]);
        let spec = spec_for(&[1], 1);

        let raw = sign_envelope(timestamp_value(), &[1]);
        let mut envelope: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        envelope["signed"]["version"] = json!(4);
        let raw = serde_json::to_vec(&envelope).unwrap();

        let res: Result<Timestamp> = verify_signed(&raw, &options(&keys, &spec));

        assert!(matches!(
            res,
            Err(HackageRepositoryError::SignatureThreshold { got: 0, .. })
        ));
    }

    #[test]
    fn file_info_digests() {
        let info = FileInfo {
            length: 10,
            hashes: [
                ("md5".to_string(), "aa".repeat(16)),
                ("sha256".to_string(), "bb".repeat(32)),
            ]
            .into_iter()
            .collect(),
        };

        // Unrecognized algorithms are ignored rather than rejected.
        assert_eq!(info.known_digests().unwrap().len(), 1);

        let missing = FileInfo {
            length: 10,
            hashes: BTreeMap::new(),
        };
        assert!(missing.sha256().is_err());
    }
}
