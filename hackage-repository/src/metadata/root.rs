// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The root role: the trust anchor delegating keys to every other role. */

use {
    crate::{
        crypto::{KeyId, PublicKey},
        error::{HackageRepositoryError, Result},
        metadata::{Role, RoleKind},
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

/// The keys authorized for a role and the signature threshold to meet.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoleSpec {
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
}

/// Key delegations for all five roles.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoleMap {
    pub root: RoleSpec,
    pub timestamp: RoleSpec,
    pub snapshot: RoleSpec,
    pub targets: RoleSpec,
    pub mirrors: RoleSpec,
}

impl RoleMap {
    fn iter(&self) -> impl Iterator<Item = (&'static str, &RoleSpec)> {
        [
            ("root", &self.root),
            ("timestamp", &self.timestamp),
            ("snapshot", &self.snapshot),
            ("targets", &self.targets),
            ("mirrors", &self.mirrors),
        ]
        .into_iter()
    }
}

/// The root role document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "_type")]
pub struct Root {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<KeyId, PublicKey>,
    pub roles: RoleMap,
}

impl Root {
    /// Check internal consistency of the document.
    ///
    /// Every key id in the key table must equal the canonical hash of its
    /// key, every key id referenced by a role must resolve in the key
    /// table, and no role may declare a threshold below 1.
    pub fn validate(&self) -> Result<()> {
        for (declared, key) in &self.keys {
            let computed = key.key_id();
            if *declared != computed {
                return Err(HackageRepositoryError::KeyIdMismatch {
                    declared: declared.to_string(),
                    computed: computed.to_string(),
                });
            }
        }

        for (role, spec) in self.roles.iter() {
            if spec.threshold < 1 {
                return Err(HackageRepositoryError::Encoding {
                    what: "root document",
                    detail: format!("{} role declares a zero signature threshold", role),
                });
            }

            for keyid in &spec.keyids {
                if !self.keys.contains_key(keyid) {
                    return Err(HackageRepositoryError::UnknownKeyId {
                        role,
                        keyid: keyid.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Obtain the role spec for a given role kind.
    pub fn role_spec(&self, kind: RoleKind) -> &RoleSpec {
        match kind {
            RoleKind::Root => &self.roles.root,
            RoleKind::Timestamp => &self.roles.timestamp,
            RoleKind::Snapshot => &self.roles.snapshot,
            RoleKind::Targets => &self.roles.targets,
            RoleKind::Mirrors => &self.roles.mirrors,
        }
    }
}

impl Role for Root {
    const KIND: RoleKind = RoleKind::Root;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}
