// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing keys and signature verification.

Only ed25519 is supported. A key is identified by the SHA-256 digest of
the canonical JSON form of its wire representation, so a key id pins both
the key material and its declared type.
*/

use {
    crate::{
        cjson,
        error::{HackageRepositoryError, Result},
    },
    base64::{prelude::BASE64_STANDARD, Engine as _},
    ed25519_dalek::VerifyingKey,
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    std::{fmt::Formatter, str::FromStr},
};

/// Identifier of a public key.
///
/// The id is the lowercase hex SHA-256 digest of the canonical JSON form
/// of the public key, so it is 64 characters long.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeyId(String);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for KeyId {
    type Err = HackageRepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(HackageRepositoryError::Encoding {
                what: "key id",
                detail: format!("{} is not a 64 character lowercase hex string", s),
            });
        }

        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Wire form of a public key.
#[derive(Deserialize, Serialize)]
struct WireKey {
    keytype: String,
    keyval: WireKeyVal,
}

#[derive(Deserialize, Serialize)]
struct WireKeyVal {
    public: String,
}

/// An ed25519 public key.
#[derive(Clone)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.key.as_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.as_bytes() == other.key.as_bytes()
    }
}

impl Eq for PublicKey {}

impl PublicKey {
    /// Construct an instance from raw key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|e| {
            HackageRepositoryError::Encoding {
                what: "public key",
                detail: format!("invalid ed25519 key material: {}", e),
            }
        })?;

        Ok(Self { key })
    }

    /// Obtain the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    /// Obtain the wire representation of this key as a JSON value.
    pub fn to_wire_value(&self) -> serde_json::Value {
        serde_json::json!({
            "keytype": "ed25519",
            "keyval": {
                "public": BASE64_STANDARD.encode(self.key.as_bytes()),
            },
        })
    }

    /// Compute the identifier of this key.
    pub fn key_id(&self) -> KeyId {
        let canonical = cjson::to_canonical_json(&self.to_wire_value())
            .expect("canonical encoding of a key cannot fail");

        KeyId(hex::encode(<sha2::Sha256 as digest::Digest>::digest(
            canonical,
        )))
    }

    /// Verify an ed25519 signature over `message`.
    ///
    /// Comparison of the signature is constant time. Returns `false` for
    /// malformed signature bytes as well as for honest mismatches.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };

        self.key.verify_strict(message, &signature).is_ok()
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        WireKey {
            keytype: "ed25519".to_string(),
            keyval: WireKeyVal {
                public: BASE64_STANDARD.encode(self.key.as_bytes()),
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;

        let wire = WireKey::deserialize(deserializer)?;

        if wire.keytype != "ed25519" {
            return Err(D::Error::custom(format!(
                "unsupported key type: {}",
                wire.keytype
            )));
        }

        let bytes = BASE64_STANDARD
            .decode(&wire.keyval.public)
            .map_err(D::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("ed25519 public keys must be 32 bytes long"))?;

        Self::from_bytes(&bytes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use {super::*, ed25519_dalek::Signer, ed25519_dalek::SigningKey};

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn public_key(seed: u8) -> PublicKey {
        PublicKey::from_bytes(&signing_key(seed).verifying_key().to_bytes()).unwrap()
    }

    #[test]
    fn verify_round_trip() {
        let signer = signing_key(1);
        let key = public_key(1);

        let message = b"signed payload";
        let signature = signer.sign(message).to_bytes();

        assert!(key.verify(message, &signature));
        assert!(!key.verify(b"tampered payload", &signature));
        assert!(!key.verify(message, &signature[..32]));
    }

    #[test]
    fn key_ids_are_stable_and_distinct() {
        let a = public_key(1);
        let b = public_key(2);

        assert_eq!(a.key_id(), a.key_id());
        assert_ne!(a.key_id(), b.key_id());
        assert_eq!(a.key_id().as_str().len(), 64);
    }

    #[test]
    fn wire_round_trip() {
        let key = public_key(3);

        let encoded = serde_json::to_vec(&key).unwrap();
        let decoded: PublicKey = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, key);
        assert_eq!(decoded.key_id(), key.key_id());
    }

    #[test]
    fn rejects_unsupported_key_type() {
        let res: std::result::Result<PublicKey, _> = serde_json::from_value(serde_json::json!({
            "keytype": "rsa",
            "keyval": {"public": "AAAA"},
        }));

        assert!(res.is_err());
    }

    #[test]
    fn key_id_parsing() {
        assert!(KeyId::from_str(&"a".repeat(64)).is_ok());
        assert!(KeyId::from_str("deadbeef").is_err());
        assert!(KeyId::from_str(&"A".repeat(64)).is_err());
    }
}
