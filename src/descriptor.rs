//! Digest verification helpers shared by both scheme backends.
//!
//! `oci_spec::image::Descriptor` already carries `digest`/`size`/`data`; what
//! it doesn't give us is a cheap way to check a byte slice against it. The
//! nibble-table comparison below is lifted from `peoci::ocidist::digest_eq`:
//! it checks a digest match without allocating a decoded byte buffer.

use base64::Engine;
use oci_spec::image::{Descriptor, Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// Checks `data` against `descriptor`'s size and digest.
pub fn verify_data(descriptor: &Descriptor, data: &[u8]) -> Result<()> {
    if descriptor.size() != data.len() as u64 {
        return Err(Error::DigestMismatch {
            expected: descriptor.digest().to_string(),
            got: format!("<{} bytes>", data.len()),
        });
    }
    verify_digest(descriptor.digest(), data)
}

/// Checks `data` against an expected digest directly (used for blobs
/// addressed without a full descriptor, e.g. a `Docker-Content-Digest`
/// response header).
pub fn verify_digest(expected: &Digest, data: &[u8]) -> Result<()> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            if digest_eq(expected.digest(), hasher) {
                Ok(())
            } else {
                Err(Error::DigestMismatch {
                    expected: expected.to_string(),
                    got: format!("sha256:{}", hex::encode(Sha256::digest(data))),
                })
            }
        }
        algo => Err(Error::UnsupportedMediaType(format!(
            "digest algorithm {algo} not supported"
        ))),
    }
}

/// The OCI "data" extension: a descriptor may carry its referent inline as
/// base64 in the `data` field, letting a consumer skip the round trip for
/// small objects (tiny configs, empty layers). Returns the decoded bytes
/// after verifying them against the descriptor's digest and size.
pub fn inline_data(descriptor: &Descriptor) -> Result<Option<Vec<u8>>> {
    let Some(encoded) = descriptor.data() else {
        return Ok(None);
    };
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::ParsingFailed {
            what: "descriptor data field",
            detail: e.to_string(),
        })?;
    verify_data(descriptor, &data)?;
    Ok(Some(data))
}

/// Compares a lower-hex digest string against a not-yet-finalized hasher
/// without allocating a decoded byte buffer: the hash is encoded one nibble
/// at a time and compared ASCII byte by ASCII byte. Requires
/// `digest_lower_hex_str` to actually be lower hex, which `Digest`
/// guarantees by construction.
fn digest_eq(digest_lower_hex_str: &str, digest: impl sha2::Digest) -> bool {
    let digest_bytes = digest.finalize();
    if digest_lower_hex_str.len() != 2 * digest_bytes.len() {
        return false;
    }

    #[rustfmt::skip]
    const LUT: [u8; 16] = [
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        97, 98, 99, 100, 101, 102,
    ];
    let as_byte_pairs = digest_lower_hex_str.as_bytes().chunks_exact(2);

    as_byte_pairs.zip(digest_bytes).all(|(pair, byte)| {
        LUT[(byte >> 4) as usize] == pair[0] && LUT[(byte & 0xf) as usize] == pair[1]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::DescriptorBuilder;
    use std::str::FromStr;

    fn descriptor_for(data: &[u8]) -> Descriptor {
        let digest = Digest::from_str(&format!("sha256:{}", hex::encode(Sha256::digest(data))))
            .unwrap();
        DescriptorBuilder::default()
            .media_type(oci_spec::image::MediaType::ImageConfig)
            .digest(digest)
            .size(data.len() as u64)
            .build()
            .unwrap()
    }

    #[test]
    fn verify_data_matches() {
        let data = b"hello world";
        let d = descriptor_for(data);
        assert!(verify_data(&d, data).is_ok());
    }

    #[test]
    fn verify_data_size_mismatch() {
        let d = descriptor_for(b"hello world");
        assert!(verify_data(&d, b"nope").is_err());
    }

    #[test]
    fn verify_data_digest_mismatch() {
        let mut d = descriptor_for(b"hello world");
        // same length, different content, so it fails on the digest check
        d.set_size(4);
        assert!(verify_data(&d, b"nope").is_err());
    }

    #[test]
    fn digest_eq_matches_known_vector() {
        let mut hasher = Sha256::new();
        hasher.update(b"");
        assert!(digest_eq(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85",
            hasher,
        ));
    }

    #[test]
    fn digest_eq_rejects_wrong_length() {
        let mut hasher = Sha256::new();
        hasher.update(b"");
        assert!(!digest_eq("deadbeef", hasher));
    }
}
