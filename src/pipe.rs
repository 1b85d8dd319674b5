//! Content-pipe utilities: digest-verifying and length-limited readers.
//!
//! `ocidist::Client::get_blob` hashes a response chunk-by-chunk inline as
//! it writes each chunk to its destination, failing at the end if the
//! digest doesn't match. That loop is pulled out here into a reusable
//! writer so the `reg` and `ocidir` scheme backends (and `ImageCopy`'s
//! stream-copy fallback) don't each reimplement it.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::descriptor;
use crate::error::{Error, Result};

/// Copies every chunk of `stream` into `writer`, hashing as it goes, and
/// fails with `DigestMismatch`/size error if the total doesn't match
/// `expected`. Returns the number of bytes written.
pub async fn copy_verified<S, W>(mut stream: S, expected: &Digest, writer: &mut W) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
    W: AsyncWrite + Unpin,
{
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            let mut len: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                len += chunk.len() as u64;
                hasher.update(&chunk);
                writer.write_all(&chunk).await?;
            }
            writer.flush().await?;
            let got = format!("sha256:{}", hex::encode(hasher.finalize()));
            if got != expected.to_string() {
                return Err(Error::DigestMismatch {
                    expected: expected.to_string(),
                    got,
                });
            }
            Ok(len)
        }
        algo => Err(Error::UnsupportedMediaType(format!(
            "digest algorithm {algo} not supported"
        ))),
    }
}

/// Reads `response` fully into memory and verifies it against `expected`,
/// for callers (manifest/config fetches) that need the whole body anyway
/// rather than a streaming destination.
pub async fn read_verified(response: reqwest::Response, expected: &Digest) -> Result<Bytes> {
    let data = response.bytes().await?;
    descriptor::verify_digest(expected, &data)?;
    Ok(data)
}

/// Wraps an `AsyncWrite` so that writes past `limit` bytes fail instead of
/// silently truncating or growing without bound -- used to cap a blob
/// download at its descriptor's declared size even if the server sends
/// more than it advertised.
pub struct LengthLimited<W> {
    inner: W,
    remaining: u64,
}

impl<W: AsyncWrite + Unpin> LengthLimited<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        LengthLimited {
            inner,
            remaining: limit,
        }
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() as u64 > self.remaining {
            return Err(Error::DigestMismatch {
                expected: format!("<= {} bytes", self.remaining + chunk.len() as u64),
                got: format!("{} bytes", chunk.len()),
            });
        }
        self.inner.write_all(chunk).await?;
        self.remaining -= chunk.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn copy_verified_matches_digest() {
        let data = b"hello world".to_vec();
        let digest =
            Digest::from_str(&format!("sha256:{}", hex::encode(Sha256::digest(&data)))).unwrap();
        let stream = futures::stream::iter(vec![Ok(Bytes::from(data.clone()))]);
        let mut out = Vec::new();
        let len = copy_verified(stream, &digest, &mut out).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn copy_verified_rejects_mismatch() {
        let digest = Digest::from_str(&format!("sha256:{}", hex::encode([0u8; 32]))).unwrap();
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(b"nope"))]);
        let mut out = Vec::new();
        assert!(copy_verified(stream, &digest, &mut out).await.is_err());
    }

    #[tokio::test]
    async fn length_limited_rejects_overflow() {
        let mut limited = LengthLimited::new(Vec::new(), 4);
        assert!(limited.write_chunk(b"1234").await.is_ok());
        assert!(limited.write_chunk(b"5").await.is_err());
    }
}
