// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The timestamp role: the small, frequently refreshed file pinning the
current snapshot. */

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
pub struct Timestamp {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, FileInfo>,
}

impl Timestamp {
    /// Obtain the pinned snapshot file info.
    pub fn snapshot_info(&self) -> Result<&FileInfo> {
        self.meta
            .get("snapshot.json")
            .ok_or(HackageRepositoryError::MetadataFileNotFound("snapshot.json"))
    }
}

impl Role for Timestamp {
    const KIND: RoleKind = RoleKind::Timestamp;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}
