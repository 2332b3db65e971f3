// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The mirrors role: the signed list of mirror base URIs. */

use {
    crate::{
        error::Result,
        metadata::{Role, RoleKind},
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    url::Url,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "_type")]
pub struct Mirrors {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub mirrors: Vec<String>,
}

impl Mirrors {
    /// Parse the mirror list into URLs.
    pub fn urls(&self) -> Result<Vec<Url>> {
        self.mirrors
            .iter()
            .map(|mirror| Ok(Url::parse(mirror)?))
            .collect()
    }
}

impl Role for Mirrors {
    const KIND: RoleKind = RoleKind::Mirrors;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}
