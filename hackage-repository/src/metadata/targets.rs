// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The targets role: per-package documents describing the tarballs a
package release consists of. These documents are stored inside the
package index and read out of it on demand. */

use {
    crate::metadata::{FileInfo, Role, RoleKind},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "_type")]
pub struct Targets {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub targets: BTreeMap<String, FileInfo>,
}

impl Targets {
    /// Look up the file info recorded for a target path.
    pub fn lookup(&self, path: &str) -> Option<&FileInfo> {
        self.targets.get(path)
    }
}

impl Role for Targets {
    const KIND: RoleKind = RoleKind::Targets;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}
