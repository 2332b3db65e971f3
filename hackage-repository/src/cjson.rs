// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Canonical JSON encoding.

Signed documents are exchanged as ordinary JSON, but signatures cover the
*canonical form* of the `signed` value: UTF-8, object keys sorted
lexicographically, no insignificant whitespace, integers in minimal form,
only mandatory string escapes. Verification therefore parses the envelope
into a [serde_json::Value] and re-encodes that value canonically, which
recovers exactly the bytes the publisher signed.
*/

use {crate::error::Result, olpc_cjson::CanonicalFormatter, serde::Serialize};

/// Encode a value in canonical JSON form.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
    value.serialize(&mut ser)?;

    Ok(data)
}

#[cfg(test)]
mod test {
    use {super::*, serde_json::json};

    #[test]
    fn object_keys_are_sorted() -> Result<()> {
        let value = json!({"b": 1, "a": {"d": 2, "c": 3}});

        assert_eq!(
            to_canonical_json(&value)?,
            br#"{"a":{"c":3,"d":2},"b":1}"#.to_vec()
        );

        Ok(())
    }

    #[test]
    fn no_insignificant_whitespace() -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "version" : 1 ,
                "expires" : "2030-01-01T00:00:00Z"
            }"#,
        )?;

        assert_eq!(
            to_canonical_json(&value)?,
            br#"{"expires":"2030-01-01T00:00:00Z","version":1}"#.to_vec()
        );

        Ok(())
    }

    #[test]
    fn encoding_is_deterministic() -> Result<()> {
        let a = json!({"meta": {"snapshot.json": {"length": 42}}, "version": 7});
        let b: serde_json::Value = serde_json::from_slice(&to_canonical_json(&a)?)?;

        assert_eq!(to_canonical_json(&a)?, to_canonical_json(&b)?);

        Ok(())
    }
}
