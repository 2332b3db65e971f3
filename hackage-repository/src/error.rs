// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Error type for this crate.
#[derive(Debug, Error)]
pub enum HackageRepositoryError {
    #[error("URL parse error: {0:?}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP error: {0:?}")]
    Http(#[from] reqwest::Error),

    #[error("bad HTTP status code {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("repository I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("invalid hex in content digest: {0}; {1:?}")]
    ContentDigestBadHex(String, hex::FromHexError),

    #[error("digest mismatch on {path}: expected {wanted}, got {got}")]
    DigestMismatch {
        path: String,
        wanted: String,
        got: String,
    },

    #[error("length bound of {limit} bytes exceeded while reading {path}")]
    LengthExceeded { path: String, limit: u64 },

    #[error("{role} document carries {got} valid signature(s), {wanted} required")]
    SignatureThreshold {
        role: &'static str,
        wanted: u32,
        got: u32,
    },

    #[error("only {matching} supplied root key fingerprint(s) match the root document, {wanted} required")]
    BootstrapKeys { wanted: u32, matching: u32 },

    #[error("declared key id {declared} does not match computed key id {computed}")]
    KeyIdMismatch { declared: String, computed: String },

    #[error("{role} role references unknown key id {keyid}")]
    UnknownKeyId { role: &'static str, keyid: String },

    #[error("expected a {wanted} document, found {got}")]
    RoleMismatch { wanted: &'static str, got: String },

    #[error("{role} document expired at {expires}")]
    Expired { role: &'static str, expires: String },

    #[error("version rollback on {role}: trusted version {trusted}, server offered {offered}")]
    Rollback {
        role: &'static str,
        trusted: u64,
        offered: u64,
    },

    #[error("malformed {what}: {detail}")]
    Encoding { what: &'static str, detail: String },

    #[error("local cache is corrupt: {0}")]
    CacheCorrupt(String),

    #[error("no verified snapshot in cache; run check_for_updates first")]
    UpdateRequired,

    #[error("target not found: {0}")]
    UnknownTarget(String),

    #[error("trust root rotation did not converge after {0} steps")]
    RotationLimitExceeded(u32),

    #[error("metadata entry not found: {0}")]
    MetadataFileNotFound(&'static str),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, HackageRepositoryError>;
