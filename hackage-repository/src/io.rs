// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers.

Verified copying is the primitive every download funnels through: bytes
are hashed and counted while they are written, so a stream that exceeds
its declared length or fails to match its declared digest never becomes
a complete file.
*/

use {
    crate::error::{HackageRepositoryError, Result},
    std::{
        fmt::Formatter,
        io::{Read, Write},
        path::Path,
    },
};

/// Hash algorithm used by a [ContentDigest].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestFlavor {
    Sha256,
    Sha512,
}

/// Represents a content digest.
#[derive(Clone, Eq, PartialEq)]
pub enum ContentDigest {
    /// A SHA-256 digest.
    Sha256(Vec<u8>),
    /// A SHA-512 digest.
    Sha512(Vec<u8>),
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha256(data) => write!(f, "Sha256({})", hex::encode(data)),
            Self::Sha512(data) => write!(f, "Sha512({})", hex::encode(data)),
        }
    }
}

impl ContentDigest {
    /// Create a new SHA-256 instance by parsing a hex digest.
    pub fn sha256_hex(digest: &str) -> Result<Self> {
        Self::from_hex_digest(DigestFlavor::Sha256, digest)
    }

    /// Create a new SHA-512 instance by parsing a hex digest.
    pub fn sha512_hex(digest: &str) -> Result<Self> {
        Self::from_hex_digest(DigestFlavor::Sha512, digest)
    }

    /// Obtain an instance by parsing a hex string as a [DigestFlavor].
    pub fn from_hex_digest(flavor: DigestFlavor, digest: &str) -> Result<Self> {
        let digest = hex::decode(digest)
            .map_err(|e| HackageRepositoryError::ContentDigestBadHex(digest.to_string(), e))?;

        Ok(match flavor {
            DigestFlavor::Sha256 => Self::Sha256(digest),
            DigestFlavor::Sha512 => Self::Sha512(digest),
        })
    }

    /// Obtain an instance from an algorithm name as it appears in metadata.
    ///
    /// Returns `None` for algorithms this crate does not recognize; those
    /// entries are ignored rather than rejected.
    pub fn from_algorithm_name(name: &str, digest: &str) -> Result<Option<Self>> {
        Ok(match name {
            "sha256" => Some(Self::sha256_hex(digest)?),
            "sha512" => Some(Self::sha512_hex(digest)?),
            _ => None,
        })
    }

    /// Create a new hasher matching the type of this digest.
    pub fn new_hasher(&self) -> Box<dyn digest::DynDigest + Send> {
        match self {
            Self::Sha256(_) => Box::new(sha2::Sha256::default()),
            Self::Sha512(_) => Box::new(sha2::Sha512::default()),
        }
    }

    /// Obtain the digest bytes for this content digest.
    pub fn digest_bytes(&self) -> &[u8] {
        match self {
            Self::Sha256(x) => x,
            Self::Sha512(x) => x,
        }
    }

    /// Obtain the hex encoded content digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Obtain the [DigestFlavor] for this digest.
    pub fn flavor(&self) -> DigestFlavor {
        match self {
            Self::Sha256(_) => DigestFlavor::Sha256,
            Self::Sha512(_) => DigestFlavor::Sha512,
        }
    }
}

/// Compression format of a fetched file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    /// No compression.
    Raw,
    /// Gzip compression.
    Gzip,
}

impl Format {
    /// Suffix appended to a remote path serving this format.
    pub fn path_suffix(&self) -> &'static str {
        match self {
            Self::Raw => "",
            Self::Gzip => ".gz",
        }
    }
}

/// Obtain a reader that transparently applies decompression.
pub fn read_decompressed<'a>(reader: impl Read + 'a, format: Format) -> Box<dyn Read + 'a> {
    match format {
        Format::Raw => Box::new(reader),
        Format::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
    }
}

/// Copy `reader` into `writer` while enforcing a length ceiling and a set
/// of expected content digests.
///
/// The length ceiling is enforced as data streams: the copy aborts as soon
/// as the byte count passes `length_bound`, without draining the rest of
/// the source. Digests are compared once the source is exhausted. Returns
/// the number of bytes copied.
pub fn copy_verified(
    reader: &mut impl Read,
    writer: &mut impl Write,
    path: &str,
    length_bound: u64,
    expected: &[ContentDigest],
) -> Result<u64> {
    let mut hashers = expected
        .iter()
        .map(|digest| (digest, digest.new_hasher()))
        .collect::<Vec<_>>();

    let mut buffer = [0u8; 32768];
    let mut written = 0u64;

    loop {
        let count = reader
            .read(&mut buffer)
            .map_err(|e| HackageRepositoryError::IoPath(path.to_string(), e))?;
        if count == 0 {
            break;
        }

        written += count as u64;
        if written > length_bound {
            return Err(HackageRepositoryError::LengthExceeded {
                path: path.to_string(),
                limit: length_bound,
            });
        }

        for (_, hasher) in hashers.iter_mut() {
            hasher.update(&buffer[0..count]);
        }

        writer
            .write_all(&buffer[0..count])
            .map_err(|e| HackageRepositoryError::IoPath(path.to_string(), e))?;
    }

    for (digest, hasher) in hashers {
        let got = hasher.finalize();

        if got.as_ref() != digest.digest_bytes() {
            return Err(HackageRepositoryError::DigestMismatch {
                path: path.to_string(),
                wanted: digest.digest_hex(),
                got: hex::encode(got),
            });
        }
    }

    Ok(written)
}

/// Compute the length and SHA-256 digest of a file on disk.
pub fn digest_file(path: &Path) -> Result<(u64, ContentDigest)> {
    let fh = std::fs::File::open(path)
        .map_err(|e| HackageRepositoryError::IoPath(format!("{}", path.display()), e))?;
    let mut reader = std::io::BufReader::new(fh);

    let mut hasher = sha2::Sha256::default();
    let mut buffer = [0u8; 32768];
    let mut length = 0u64;

    loop {
        let count = std::io::Read::read(&mut reader, &mut buffer)
            .map_err(|e| HackageRepositoryError::IoPath(format!("{}", path.display()), e))?;
        if count == 0 {
            break;
        }

        length += count as u64;
        digest::Digest::update(&mut hasher, &buffer[0..count]);
    }

    Ok((
        length,
        ContentDigest::Sha256(digest::Digest::finalize(hasher).to_vec()),
    ))
}

#[cfg(test)]
mod test {
    use {super::*, digest::Digest};

    fn sha256(data: &[u8]) -> ContentDigest {
        ContentDigest::Sha256(sha2::Sha256::digest(data).to_vec())
    }

    #[test]
    fn copy_within_bound() -> Result<()> {
        let data = b"hello, repository";
        let mut out = vec![];

        let written = copy_verified(
            &mut &data[..],
            &mut out,
            "test",
            data.len() as u64,
            &[sha256(data)],
        )?;

        assert_eq!(written, data.len() as u64);
        assert_eq!(out, data);

        Ok(())
    }

    #[test]
    fn copy_rejects_oversized_stream() {
        let data = [0u8; 4096];
        let mut out = vec![];

        let res = copy_verified(&mut &data[..], &mut out, "test", 100, &[]);

        assert!(matches!(
            res,
            Err(HackageRepositoryError::LengthExceeded { limit: 100, .. })
        ));
    }

    #[test]
    fn copy_rejects_digest_mismatch() {
        let data = b"expected content";
        let mut out = vec![];

        let res = copy_verified(
            &mut &data[..],
            &mut out,
            "test",
            1024,
            &[sha256(b"other content")],
        );

        assert!(matches!(
            res,
            Err(HackageRepositoryError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn digest_file_matches_buffer_digest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blob");
        std::fs::write(&path, b"some bytes")?;

        let (length, digest) = digest_file(&path)?;

        assert_eq!(length, 10);
        assert_eq!(digest, sha256(b"some bytes"));

        Ok(())
    }

    #[test]
    fn gzip_round_trip() -> Result<()> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, b"compressed payload")?;
        let compressed = encoder.finish()?;

        let mut decoded = vec![];
        read_decompressed(&compressed[..], Format::Gzip).read_to_end(&mut decoded)?;

        assert_eq!(decoded, b"compressed payload");

        Ok(())
    }
}
