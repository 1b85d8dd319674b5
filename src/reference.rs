//! Parsed image coordinates.
//!
//! Deliberately hand-rolled rather than built on `oci_spec::distribution::Reference`:
//! that type has no notion of scheme (`reg` vs `ocidir`), and the tag/digest
//! precedence rules below follow `peoci::ocidist::TagOrDigest` closely enough
//! that reimplementing on top of it would buy nothing.

use std::fmt;

use crate::error::{Error, Result};

pub const DEFAULT_REGISTRY_ALIAS: &str = "docker.io";
pub const DEFAULT_REGISTRY_HOSTNAME: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Reg,
    OciDir,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Reg => "reg",
            Scheme::OciDir => "ocidir",
        })
    }
}

impl std::str::FromStr for Scheme {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reg" => Ok(Scheme::Reg),
            "ocidir" => Ok(Scheme::OciDir),
            other => Err(Error::InvalidReference(format!("unknown scheme {other:?}"))),
        }
    }
}

/// A parsed image coordinate: `[scheme://]registry/repository[:tag][@digest]`.
///
/// For `ocidir` references, `repository` holds the local filesystem path and
/// `registry` is unused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    scheme: Scheme,
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme.parse()?, rest),
            None => (Scheme::Reg, s),
        };

        match scheme {
            Scheme::Reg => Self::parse_reg(rest),
            Scheme::OciDir => Ok(Reference {
                scheme,
                registry: None,
                repository: rest.to_string(),
                tag: None,
                digest: None,
            }),
        }
    }

    fn parse_reg(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidReference(s.to_string()));
        }

        // split off the digest first: it is introduced by '@' and everything
        // after it is `algorithm:hex`, which itself contains a ':' that must
        // not be mistaken for the tag separator.
        let (before_digest, digest) = match s.split_once('@') {
            Some((before, digest)) => (before, Some(validate_digest(digest)?)),
            None => (s, None),
        };

        // the registry component is the part before the first '/', but only
        // if it looks host-like (contains '.', ':', or is "localhost");
        // otherwise the whole thing (minus tag) is the repository and the
        // registry defaults to the canonical Docker Hub alias.
        let (registry, repo_and_tag) = match before_digest.split_once('/') {
            Some((maybe_host, rest)) if looks_like_host(maybe_host) => {
                (Some(maybe_host.to_string()), rest)
            }
            _ => (None, before_digest),
        };

        let (repository, tag) = match repo_and_tag.rsplit_once(':') {
            // a ':' after the last '/' is a tag; a ':' that is part of a port
            // number in the registry host was already consumed above.
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(validate_tag(tag)?)),
            _ => (repo_and_tag, None),
        };

        let repository = validate_repository(repository)?;

        Ok(Reference {
            scheme: Scheme::Reg,
            registry,
            repository,
            tag: if digest.is_none() && tag.is_none() {
                Some(DEFAULT_TAG.to_string())
            } else {
                tag
            },
            digest,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Registry hostname, with the default alias resolved to its canonical
    /// hostname (`docker.io` -> `registry-1.docker.io`).
    pub fn resolve_registry(&self) -> &str {
        match self.registry.as_deref() {
            None | Some(DEFAULT_REGISTRY_ALIAS) => DEFAULT_REGISTRY_HOSTNAME,
            Some(other) => other,
        }
    }

    /// Registry hostname as written (or the default alias), for config
    /// lookups that key on the alias rather than the resolved hostname.
    pub fn registry_alias(&self) -> &str {
        self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY_ALIAS)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Reference {
            digest: Some(digest.into()),
            ..self.clone()
        }
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Reference {
            tag: Some(tag.into()),
            digest: None,
            ..self.clone()
        }
    }

    /// The tag-or-digest form the registry API expects in a manifest URL:
    /// digest takes precedence so that once resolved, requests are
    /// content-addressed even if a tag is still carried for display.
    pub fn manifest_selector(&self) -> Result<&str> {
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => Ok(digest),
            (Some(tag), None) => Ok(tag),
            (None, None) => Err(Error::MissingTagOrDigest),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::OciDir => write!(f, "ocidir://{}", self.repository),
            Scheme::Reg => {
                if let Some(registry) = &self.registry {
                    write!(f, "{registry}/")?;
                }
                write!(f, "{}", self.repository)?;
                // canonical printable form picks tag over digest when both
                // are present.
                if let Some(tag) = &self.tag {
                    write!(f, ":{tag}")?;
                } else if let Some(digest) = &self.digest {
                    write!(f, "@{digest}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for Reference {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

fn looks_like_host(s: &str) -> bool {
    s == "localhost" || s.contains('.') || s.contains(':')
}

fn validate_repository(s: &str) -> Result<String> {
    if s.is_empty()
        || !s
            .split('/')
            .all(|part| !part.is_empty() && part.bytes().all(is_repo_component_byte))
    {
        return Err(Error::InvalidReference(s.to_string()));
    }
    Ok(s.to_string())
}

fn is_repo_component_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-')
}

fn validate_tag(s: &str) -> Result<String> {
    let valid = s.len() <= 128
        && matches!(s.as_bytes().first(), Some(b) if b.is_ascii_alphanumeric() || *b == b'_')
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if !valid {
        return Err(Error::InvalidReference(format!("bad tag {s:?}")));
    }
    Ok(s.to_string())
}

fn validate_digest(s: &str) -> Result<String> {
    let (algo, hex) = s
        .split_once(':')
        .ok_or_else(|| Error::InvalidReference(format!("bad digest {s:?}")))?;
    if algo.is_empty() || hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidReference(format!("bad digest {s:?}")));
    }
    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_repo_defaults_registry_and_tag() {
        let r = Reference::parse("library/alpine").unwrap();
        assert_eq!(r.registry_alias(), "docker.io");
        assert_eq!(r.resolve_registry(), "registry-1.docker.io");
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn parse_host_repo_tag() {
        let r = Reference::parse("ghcr.io/foo/bar:v1.2.3").unwrap();
        assert_eq!(r.registry_alias(), "ghcr.io");
        assert_eq!(r.repository(), "foo/bar");
        assert_eq!(r.tag(), Some("v1.2.3"));
    }

    #[test]
    fn parse_host_with_port_and_digest() {
        let r = Reference::parse(
            "localhost:5000/foo@sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015a",
        )
        .unwrap();
        assert_eq!(r.registry_alias(), "localhost:5000");
        assert_eq!(r.repository(), "foo");
        assert_eq!(r.tag(), None);
        assert!(r.digest().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn tag_and_digest_both_present_display_prefers_tag() {
        let r = Reference::parse(
            "quay.io/fedora/fedora:latest@sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015a",
        )
        .unwrap();
        assert_eq!(r.tag(), Some("latest"));
        assert!(r.digest().is_some());
        assert_eq!(r.to_string(), "quay.io/fedora/fedora:latest");
        // but manifest lookups must prefer the digest
        assert!(r.manifest_selector().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn round_trip_print_parse() {
        for s in [
            "library/alpine:latest",
            "ghcr.io/foo/bar:v1",
            "localhost:5000/a/b/c:tag-name",
        ] {
            let r = Reference::parse(s).unwrap();
            let printed = r.to_string();
            let reparsed = Reference::parse(&printed).unwrap();
            assert_eq!(r, reparsed, "round trip of {s:?} via {printed:?}");
        }
    }

    #[test]
    fn ocidir_scheme_keeps_path_as_repository() {
        let r = Reference::parse("ocidir:///tmp/my-layout:mytag").unwrap();
        assert_eq!(r.scheme(), Scheme::OciDir);
        assert_eq!(r.repository(), "/tmp/my-layout:mytag");
    }

    #[test]
    fn rejects_bad_tag() {
        assert!(Reference::parse("foo/bar:-badtag").is_err());
    }

    #[test]
    fn rejects_empty_repository() {
        assert!(Reference::parse("ghcr.io/").is_err());
    }
}
