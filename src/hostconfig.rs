//! Per-registry configuration.
//!
//! `HostConfigTable` holds one record per host (TLS posture, mirrors,
//! upload chunking, rate/backoff knobs) behind a copy-on-write table:
//! readers never block on a writer, and a full record is swapped in on
//! update rather than mutated in place.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::reference::{DEFAULT_REGISTRY_ALIAS, DEFAULT_REGISTRY_HOSTNAME};

/// How a blob upload should be chunked. Mirrors the source image tool's
/// `BlobMax` sentinel (`-1` meaning "always monolithic", `0` meaning "use
/// the client default") as three explicit states rather than a raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobChunk {
    /// Use the transport's built-in default chunk size.
    Default,
    /// Use exactly this chunk size, in bytes.
    Fixed(u64),
    /// Never chunk: always PUT the whole blob monolithically.
    Disabled,
}

impl Default for BlobChunk {
    fn default() -> Self {
        BlobChunk::Default
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Verify,
    /// Accept any certificate. Only ever set explicitly by a caller that
    /// knows what it's doing (e.g. a local dev registry on a self-signed
    /// cert) -- never the default.
    Insecure,
    /// Plain HTTP, no TLS at all.
    Plain,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::Verify
    }
}

/// Static username/password, or an external helper invoked on demand.
/// `CredentialHelper` runs an external command and reads a JSON token or
/// credential pair from its stdout.
#[derive(Debug, Clone)]
pub enum Credentials {
    Anonymous,
    UserPass(String, String),
    CredentialHelper(String),
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials::Anonymous
    }
}

#[derive(Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

impl Credentials {
    /// Resolves to a concrete username/password pair, running the helper
    /// subprocess if configured. `registry` is passed as the sole argument,
    /// matching the `docker-credential-helper` protocol's `get` verb.
    pub async fn resolve(&self, registry: &str) -> Result<Option<(String, String)>> {
        match self {
            Credentials::Anonymous => Ok(None),
            Credentials::UserPass(u, p) => Ok(Some((u.clone(), p.clone()))),
            Credentials::CredentialHelper(program) => {
                let program = program.clone();
                let registry = registry.to_string();
                let output = tokio::task::spawn_blocking(move || {
                    std::process::Command::new(&program)
                        .arg("get")
                        .stdin(Stdio::piped())
                        .stdout(Stdio::piped())
                        .stderr(Stdio::piped())
                        .spawn()
                        .and_then(|mut child| {
                            use std::io::Write;
                            if let Some(mut stdin) = child.stdin.take() {
                                stdin.write_all(registry.as_bytes())?;
                            }
                            child.wait_with_output()
                        })
                })
                .await
                .map_err(|e| Error::ParsingFailed {
                    what: "credential helper",
                    detail: e.to_string(),
                })?
                .map_err(|e| Error::ParsingFailed {
                    what: "credential helper",
                    detail: e.to_string(),
                })?;

                if !output.status.success() {
                    return Err(Error::Unauthorized(format!(
                        "credential helper {program:?} exited with {}",
                        output.status
                    )));
                }
                let parsed: HelperOutput =
                    serde_json::from_slice(&output.stdout).map_err(|e| Error::ParsingFailed {
                        what: "credential helper output",
                        detail: e.to_string(),
                    })?;
                Ok(Some((parsed.username, parsed.secret)))
            }
        }
    }
}

/// Retry/backoff parameters for the transport engine.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Per-registry settings: TLS posture, credentials, any configured mirrors
/// to try before the registry itself, upload chunking, and retry/backoff.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub tls: TlsMode,
    pub credentials: Credentials,
    /// Hostnames tried, in order, before falling back to the registry
    /// itself -- e.g. a pull-through cache mirroring `docker.io`.
    pub mirrors: Vec<String>,
    pub blob_chunk: BlobChunk,
    pub retry: RetryPolicy,
    /// Caps concurrent in-flight requests to this host, independent of the
    /// global `ImageCopy` concurrency limit.
    pub max_concurrency: usize,
    /// Caps outgoing requests to this host to roughly this many per second.
    /// `None` means unlimited -- the transport still honors any
    /// `RateLimit-*` response headers regardless of this setting.
    pub requests_per_second: Option<u32>,
}

impl HostConfig {
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }

    pub fn with_requests_per_second(mut self, requests_per_second: u32) -> Self {
        self.requests_per_second = Some(requests_per_second);
        self
    }
}

/// Read-mostly table of per-registry configuration, keyed by the alias the
/// caller used in a `Reference` (e.g. `docker.io`, not the resolved
/// `registry-1.docker.io`). Copy-on-write like `ocidist::Client`'s
/// `auth_store`: lookups never take a lock, and updates swap in a whole new
/// map rather than mutating in place.
#[derive(Clone)]
pub struct HostConfigTable {
    inner: Arc<ArcSwap<HashMap<String, HostConfig>>>,
}

impl HostConfigTable {
    pub fn new() -> Self {
        HostConfigTable {
            inner: Arc::new(ArcSwap::from_pointee(HashMap::new())),
        }
    }

    pub fn get(&self, registry_alias: &str) -> HostConfig {
        self.inner
            .load()
            .get(registry_alias)
            .cloned()
            .unwrap_or_default()
    }

    /// Inserts or replaces the config for one host, leaving every other
    /// host's config untouched.
    pub fn set(&self, registry_alias: impl Into<String>, config: HostConfig) {
        let mut next = (**self.inner.load()).clone();
        next.insert(registry_alias.into(), config);
        self.inner.store(Arc::new(next));
    }
}

impl Default for HostConfigTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the alias a `Reference` was parsed with to the hostname actually
/// dialed: `docker.io` is a Docker-compatibility alias for
/// `registry-1.docker.io` and nothing else gets rewritten.
pub fn canonical_hostname(alias: &str) -> &str {
    if alias == DEFAULT_REGISTRY_ALIAS {
        DEFAULT_REGISTRY_HOSTNAME
    } else {
        alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_host_returns_default_config() {
        let table = HostConfigTable::new();
        let cfg = table.get("ghcr.io");
        assert_eq!(cfg.tls, TlsMode::Verify);
        assert!(matches!(cfg.credentials, Credentials::Anonymous));
    }

    #[test]
    fn set_then_get_roundtrips() {
        let table = HostConfigTable::new();
        table.set(
            "ghcr.io",
            HostConfig::default()
                .with_credentials(Credentials::UserPass("u".into(), "p".into())),
        );
        let cfg = table.get("ghcr.io");
        assert!(matches!(cfg.credentials, Credentials::UserPass(u, p) if u == "u" && p == "p"));
        // unrelated host remains untouched
        assert!(matches!(
            table.get("quay.io").credentials,
            Credentials::Anonymous
        ));
    }

    #[test]
    fn docker_io_alias_resolves_to_canonical_host() {
        assert_eq!(canonical_hostname("docker.io"), "registry-1.docker.io");
        assert_eq!(canonical_hostname("ghcr.io"), "ghcr.io");
    }

    #[tokio::test]
    async fn anonymous_credentials_resolve_to_none() {
        assert!(Credentials::Anonymous.resolve("ghcr.io").await.unwrap().is_none());
    }
}
