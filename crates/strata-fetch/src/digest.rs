//! Content digests and blob verification.
//!
//! Blobs are streamed into a temporary file while being hashed. A blob whose
//! digest does not match is discarded with its file; a verified blob's file
//! disappears when the [`VerifiedBlob`] is dropped.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use futures::StreamExt;
use sha2::{Digest as _, Sha256, Sha512};
use strata_common::{StrataError, StrataResult};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::registry::BlobStream;

/// Hash algorithms accepted in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// A content digest such as `sha256:e3b0...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Digest of `data` with `algorithm`.
    #[must_use]
    pub fn of(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finish()
    }

    /// The algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Lowercase hex encoding of the hash.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for Digest {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| StrataError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        let (algorithm, hex) = s.split_once(':').ok_or_else(|| invalid("digest has no algorithm"))?;
        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            _ => return Err(invalid("unsupported digest algorithm")),
        };
        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid("malformed digest"));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Self::Sha256(Sha256::new()),
            Algorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> Digest {
        match self {
            Self::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Self::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

/// A blob whose contents matched its digest.
#[derive(Debug)]
pub struct VerifiedBlob {
    file: NamedTempFile,
    size: u64,
}

impl VerifiedBlob {
    /// A fresh reader over the blob contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be reopened.
    pub fn reader(&self) -> StrataResult<File> {
        Ok(self.file.reopen()?)
    }

    /// Number of bytes in the blob.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Write `stream` to a temporary file in `scratch` while hashing it.
///
/// # Errors
///
/// Returns [`StrataError::DigestMismatch`] if the content does not hash to
/// `expected`, or any error raised by the stream or the file.
pub async fn verify_blob(
    mut stream: BlobStream,
    expected: &Digest,
    scratch: &Path,
) -> StrataResult<VerifiedBlob> {
    tokio::fs::create_dir_all(scratch).await?;
    let tmp = NamedTempFile::new_in(scratch)?;
    let mut file = tokio::fs::File::from_std(tmp.reopen()?);

    let mut hasher = Hasher::new(expected.algorithm);
    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    let actual = hasher.finish();
    if &actual != expected {
        tracing::warn!(expected = %expected, actual = %actual, "Blob digest mismatch");
        return Err(StrataError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(VerifiedBlob { file: tmp, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Read;

    fn stream_of(chunks: &[&'static [u8]]) -> BlobStream {
        let items: Vec<StrataResult<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        futures::stream::iter(items).boxed()
    }

    #[test]
    fn parse_and_display() {
        let digest = Digest::of(Algorithm::Sha256, b"");
        assert_eq!(
            digest.to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.to_string().parse::<Digest>().unwrap(), digest);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("e3b0c442".parse::<Digest>().is_err());
        assert!("md5:d41d8cd98f00b204e9800998ecf8427e".parse::<Digest>().is_err());
        assert!("sha256:xyz".parse::<Digest>().is_err());
    }

    #[tokio::test]
    async fn verified_blob_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let expected = Digest::of(Algorithm::Sha256, b"hello world");

        let blob = verify_blob(stream_of(&[b"hello ", b"world"]), &expected, dir.path())
            .await
            .unwrap();

        let mut contents = String::new();
        blob.reader().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello world");
        assert_eq!(blob.size(), 11);

        drop(blob);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn mismatch_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let expected = Digest::of(Algorithm::Sha512, b"something else");

        let err = verify_blob(stream_of(&[b"tampered"]), &expected, dir.path())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("digest verification failed"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
