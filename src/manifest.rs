//! Polymorphic manifest handling.
//!
//! The registry protocol deals in at least five distinct JSON shapes
//! (Docker schema1 signed, Docker v2 image, Docker v2 manifest list, OCI
//! image manifest, OCI image index) all requested through the same
//! `Accept`-negotiated endpoint. Rather than branching on the response
//! `Content-Type` at each call site, that branching happens once, at parse
//! time, producing a single enum so the rest of the crate (scheme backends,
//! `ImageCopy`) doesn't repeat it.

use bytes::Bytes;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};

use crate::error::{Error, Result};

pub const MT_OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MT_OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MT_DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MT_DOCKER_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MT_DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// All content types a `manifest_get` should negotiate via `Accept`.
pub const ACCEPT_ALL: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.v1+prettyjws";

/// A manifest or index, tagged by the wire content type it was fetched or
/// constructed with, alongside the raw bytes that were hashed to produce its
/// digest (every push and every referrer lookup needs the exact bytes, not a
/// re-serialization of the parsed form, since re-serializing is not
/// guaranteed to round-trip byte for byte).
#[derive(Debug, Clone)]
pub enum Manifest {
    DockerV2(ImageManifest, Bytes),
    DockerList(ImageIndex, Bytes),
    /// Docker's legacy signed format. Exposed read-only, as historical
    /// compatibility only: there is no push path for it.
    DockerV1Signed(Bytes),
    OciImage(ImageManifest, Bytes),
    OciIndex(ImageIndex, Bytes),
    /// An OCI artifact manifest: same shape as `OciImage` but identified by
    /// `artifactType` rather than a recognized config media type.
    OciArtifact(ImageManifest, Bytes),
}

impl Manifest {
    /// Parses `data` according to the content type the registry (or the
    /// local OCI layout) reported for it.
    pub fn parse(content_type: &str, data: Bytes) -> Result<Self> {
        match content_type {
            MT_OCI_IMAGE_INDEX => Ok(Manifest::OciIndex(parse_index(&data)?, data)),
            MT_DOCKER_MANIFEST_LIST_V2 => Ok(Manifest::DockerList(parse_index(&data)?, data)),
            MT_DOCKER_MANIFEST_V1_SIGNED => Ok(Manifest::DockerV1Signed(data)),
            MT_OCI_IMAGE_MANIFEST => {
                let m = parse_manifest(&data)?;
                if m.artifact_type().is_some() {
                    Ok(Manifest::OciArtifact(m, data))
                } else {
                    Ok(Manifest::OciImage(m, data))
                }
            }
            MT_DOCKER_MANIFEST_V2 => Ok(Manifest::DockerV2(parse_manifest(&data)?, data)),
            other => Err(Error::UnsupportedMediaType(other.to_string())),
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Manifest::DockerV2(..) => MT_DOCKER_MANIFEST_V2,
            Manifest::DockerList(..) => MT_DOCKER_MANIFEST_LIST_V2,
            Manifest::DockerV1Signed(..) => MT_DOCKER_MANIFEST_V1_SIGNED,
            Manifest::OciImage(..) => MT_OCI_IMAGE_MANIFEST,
            Manifest::OciIndex(..) => MT_OCI_IMAGE_INDEX,
            Manifest::OciArtifact(..) => MT_OCI_IMAGE_MANIFEST,
        }
    }

    /// The exact bytes this manifest was parsed from (or will be pushed
    /// as). Digests are always computed over this, never a re-serialization.
    pub fn raw(&self) -> &Bytes {
        match self {
            Manifest::DockerV2(_, b)
            | Manifest::DockerList(_, b)
            | Manifest::DockerV1Signed(b)
            | Manifest::OciImage(_, b)
            | Manifest::OciIndex(_, b)
            | Manifest::OciArtifact(_, b) => b,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Manifest::DockerList(..) | Manifest::OciIndex(..))
    }

    /// The manifest form, for kinds that carry a single image (not an
    /// index and not the read-only signed form).
    pub fn as_image(&self) -> Option<&ImageManifest> {
        match self {
            Manifest::DockerV2(m, _) | Manifest::OciImage(m, _) | Manifest::OciArtifact(m, _) => {
                Some(m)
            }
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&ImageIndex> {
        match self {
            Manifest::DockerList(i, _) | Manifest::OciIndex(i, _) => Some(i),
            _ => None,
        }
    }

    /// The `subject` descriptor (OCI referrers API): only image manifests
    /// and artifact manifests can point at a subject.
    pub fn subject(&self) -> Option<&Descriptor> {
        self.as_image().and_then(|m| m.subject().as_ref())
    }

    /// True if this manifest may be pushed. Docker's legacy signed format
    /// is read-only history: the registry protocol has no push endpoint for
    /// it that a modern client should use, and `scheme::reg` refuses to try.
    pub fn is_pushable(&self) -> bool {
        !matches!(self, Manifest::DockerV1Signed(_))
    }

    /// Picks the entry in an index matching the requested platform. When a
    /// manifest entry in the index has no `platform` at all, it only
    /// matches a request for `default_arch`/`default_os` (historically
    /// amd64/linux, since older images omitted platform on a single-arch
    /// entry).
    pub fn find_platform<'a>(
        &'a self,
        arch: &oci_spec::image::Arch,
        os: &oci_spec::image::Os,
    ) -> Result<&'a Descriptor> {
        let index = self.as_index().ok_or(Error::ManifestNotSet)?;
        index
            .manifests()
            .iter()
            .find(|d| match d.platform() {
                Some(p) => p.architecture() == arch && p.os() == os,
                None => {
                    *arch == oci_spec::image::Arch::Amd64 && *os == oci_spec::image::Os::Linux
                }
            })
            .ok_or(Error::NotFound)
    }
}

fn parse_manifest(data: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(data).map_err(|e| Error::ParsingFailed {
        what: "image manifest",
        detail: e.to_string(),
    })
}

fn parse_index(data: &[u8]) -> Result<ImageIndex> {
    serde_json::from_slice(data).map_err(|e| Error::ParsingFailed {
        what: "image index",
        detail: e.to_string(),
    })
}

/// Maps a parsed config's declared media type to the `MediaType` enum,
/// rejecting config versions this crate doesn't understand.
pub fn require_known_config_media_type(media_type: &MediaType) -> Result<()> {
    match media_type {
        MediaType::ImageConfig | MediaType::Other(_) => Ok(()),
        _ => Err(Error::UnsupportedConfigVersion),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{
        Arch, DescriptorBuilder, Digest, ImageIndexBuilder, ImageManifestBuilder,
        ImageManifestBuilderError, Os, Platform, PlatformBuilder,
    };
    use std::str::FromStr;

    fn digest(n: u8) -> Digest {
        Digest::from_str(&format!("sha256:{}", hex::encode([n; 32]))).unwrap()
    }

    fn descriptor(n: u8) -> Descriptor {
        DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .digest(digest(n))
            .size(42u64)
            .build()
            .unwrap()
    }

    fn build_manifest() -> Result<ImageManifest, ImageManifestBuilderError> {
        ImageManifestBuilder::default()
            .schema_version(2u32)
            .config(descriptor(1))
            .layers(vec![descriptor(2)])
            .build()
    }

    #[test]
    fn parse_oci_image_manifest() {
        let m = build_manifest().unwrap();
        let data = Bytes::from(serde_json::to_vec(&m).unwrap());
        let parsed = Manifest::parse(MT_OCI_IMAGE_MANIFEST, data).unwrap();
        assert!(parsed.as_image().is_some());
        assert!(!parsed.is_index());
        assert!(parsed.is_pushable());
    }

    #[test]
    fn parse_oci_index_and_find_platform() {
        let platform: Platform = PlatformBuilder::default()
            .architecture(Arch::Amd64)
            .os(Os::Linux)
            .build()
            .unwrap();
        let mut d = descriptor(3);
        d.set_platform(Some(platform));
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(vec![d])
            .build()
            .unwrap();
        let data = Bytes::from(serde_json::to_vec(&index).unwrap());
        let parsed = Manifest::parse(MT_OCI_IMAGE_INDEX, data).unwrap();
        assert!(parsed.is_index());
        let found = parsed.find_platform(&Arch::Amd64, &Os::Linux).unwrap();
        assert_eq!(found.digest(), &digest(3));
        assert!(parsed.find_platform(&Arch::Arm64, &Os::Linux).is_err());
    }

    #[test]
    fn unplatformed_entry_matches_only_amd64_linux() {
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(vec![descriptor(4)])
            .build()
            .unwrap();
        let data = Bytes::from(serde_json::to_vec(&index).unwrap());
        let parsed = Manifest::parse(MT_OCI_IMAGE_INDEX, data).unwrap();
        assert!(parsed.find_platform(&Arch::Amd64, &Os::Linux).is_ok());
        assert!(parsed.find_platform(&Arch::Arm64, &Os::Linux).is_err());
    }

    #[test]
    fn docker_v1_signed_is_not_pushable() {
        let parsed = Manifest::parse(MT_DOCKER_MANIFEST_V1_SIGNED, Bytes::from_static(b"{}"))
            .unwrap();
        assert!(!parsed.is_pushable());
    }

    #[test]
    fn unsupported_content_type_rejected() {
        assert!(Manifest::parse("text/plain", Bytes::from_static(b"{}")).is_err());
    }
}
