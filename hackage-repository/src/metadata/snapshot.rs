// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The snapshot role: pins every other repository file by hash, which is
what makes mixing files from different publication states detectable. */

use {
    crate::{
        error::{HackageRepositoryError, Result},
        metadata::{FileInfo, Role, RoleKind},
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "_type")]
pub struct Snapshot {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, FileInfo>,
}

impl Snapshot {
    /// Look up the file info for a listed file, if present.
    pub fn info(&self, name: &str) -> Option<&FileInfo> {
        self.meta.get(name)
    }

    /// Look up the file info for a file that must be listed.
    pub fn required_info(&self, name: &'static str) -> Result<&FileInfo> {
        self.meta
            .get(name)
            .ok_or(HackageRepositoryError::MetadataFileNotFound(name))
    }
}

impl Role for Snapshot {
    const KIND: RoleKind = RoleKind::Snapshot;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}
