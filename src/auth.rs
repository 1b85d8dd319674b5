//! Authentication: challenge parsing, bearer token acquisition/caching, and
//! Basic auth short-circuiting.
//!
//! The `WWW-Authenticate` grammar parser already handles the handful of
//! real-world registries this crate talks to. Beyond bearer tokens there is
//! a `Basic` fast path, plus scope-subset reuse, so a token already covering
//! `pull,push` is reused for a `pull`-only request instead of forcing a
//! second round trip.

use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;
use reqwest::header::HeaderValue;
use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::hostconfig::Credentials;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    NoCredentialsForChallenge,
    BadWwwAuthenticate(String),
    TokenEndpointStatus(StatusCode),
    CredentialHelperFailed(String),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<crate::error::Error> for Error {
    fn from(e: crate::error::Error) -> Self {
        Error::CredentialHelperFailed(e.to_string())
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub(crate) struct TokenCacheKey {
    registry: String,
    repository: String,
    scope: String,
}

#[derive(Clone)]
pub(crate) struct Token {
    pub bearer: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenCacheKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenCacheKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.expires_in)
    }
}

/// What to send on the next request for a given host: nothing, a cached or
/// freshly fetched bearer token, or Basic credentials sent up front.
pub enum Credential {
    None,
    Bearer(String),
    Basic(String, String),
}

pub struct AuthClient {
    http: reqwest::Client,
    token_cache: Cache<TokenCacheKey, Token>,
}

impl AuthClient {
    pub fn new(http: reqwest::Client) -> Self {
        let token_cache = Cache::builder()
            .max_capacity(10_000)
            .expire_after(ExpireToken)
            .build();
        AuthClient { http, token_cache }
    }

    /// Resolves the credential to present for a request to `registry`,
    /// given the host's configured credentials.
    pub async fn credential_for(
        &self,
        registry: &str,
        credentials: &Credentials,
    ) -> Result<Credential, Error> {
        match credentials {
            Credentials::Anonymous => Ok(Credential::None),
            Credentials::UserPass(user, pass) => Ok(Credential::Basic(user.clone(), pass.clone())),
            Credentials::CredentialHelper(_) => {
                match credentials.resolve(registry).await? {
                    Some((user, pass)) => Ok(Credential::Basic(user, pass)),
                    None => Ok(Credential::None),
                }
            }
        }
    }

    /// Exchanges (or reuses a cached) bearer token after a 401 challenge.
    /// `scope` is the scope string the registry asked for in its
    /// `WWW-Authenticate` header, already widened by the caller if this is
    /// a push.
    ///
    /// Before fetching, checks for any cached token on the same
    /// registry/repository whose actions are a superset of what's needed
    /// here -- a token already covering `pull,push` satisfies a `pull`-only
    /// request, so a prior push on a repo means later pulls reuse it
    /// instead of forcing a second round trip.
    pub async fn bearer_token(
        &self,
        registry: &str,
        repository: &str,
        challenge: &Challenge<'_>,
        user: &str,
        pass: &str,
        scope: &str,
    ) -> Result<String, Error> {
        if let Some(bearer) = self.reusable_token(registry, repository, scope) {
            return Ok(bearer);
        }

        let key = TokenCacheKey {
            registry: registry.to_string(),
            repository: repository.to_string(),
            scope: scope.to_string(),
        };
        let http = self.http.clone();
        let realm = challenge.realm.to_string();
        let service = challenge.service.to_string();
        let scope_owned = scope.to_string();
        let user = user.to_string();
        let pass = pass.to_string();

        let entry = self
            .token_cache
            .entry(key)
            .or_try_insert_with(async move {
                fetch_token(http, &realm, &service, &scope_owned, &user, &pass).await
            })
            .await
            .map_err(|e| match std::sync::Arc::try_unwrap(e) {
                Ok(e) => e,
                Err(e) => {
                    log::error!("token fetch failed: {e}");
                    Error::NoCredentialsForChallenge
                }
            })?;
        Ok(entry.into_value().bearer)
    }

    /// Scans the cache for a live entry on the same registry/repository
    /// whose scope actions are a superset of `scope`'s, returning its
    /// bearer token if one exists.
    fn reusable_token(&self, registry: &str, repository: &str, scope: &str) -> Option<String> {
        let needed = scope_actions(scope);
        self.token_cache.iter().find_map(|(key, token)| {
            if key.registry == registry
                && key.repository == repository
                && needed
                    .iter()
                    .all(|action| scope_actions(&key.scope).contains(action))
            {
                Some(token.bearer.clone())
            } else {
                None
            }
        })
    }
}

/// Splits a `repository:{repo}:pull,push`-shaped scope string into its
/// comma-separated actions.
fn scope_actions(scope: &str) -> Vec<&str> {
    scope
        .rsplit_once(':')
        .map(|(_, actions)| actions)
        .unwrap_or(scope)
        .split(',')
        .collect()
}

async fn fetch_token(
    http: reqwest::Client,
    realm: &str,
    service: &str,
    scope: &str,
    user: &str,
    pass: &str,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct JsonToken {
        token: Option<String>,
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    let mut request = http
        .request(Method::GET, realm)
        .query(&[("scope", scope), ("service", service)]);
    if !user.is_empty() {
        request = request.basic_auth(user, Some(pass));
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(Error::TokenEndpointStatus(response.status()));
    }
    let parsed: JsonToken = response.json().await?;
    let bearer = parsed
        .token
        .or(parsed.access_token)
        .ok_or(Error::NoCredentialsForChallenge)?;
    // https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
    let expires_in = Duration::from_secs(parsed.expires_in.unwrap_or(60));
    Ok(Token {
        bearer,
        expires_in,
    })
}

/// A parsed `Bearer` `WWW-Authenticate` challenge.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct Challenge<'a> {
    pub realm: &'a str,
    pub service: &'a str,
    pub scope: Option<&'a str>,
}

pub fn parse_www_authenticate(value: &HeaderValue) -> Option<Challenge<'_>> {
    parse_www_authenticate_str(value.to_str().ok()?)
}

/// Parses a `Bearer realm="...", service="...", scope="..."` header value.
/// Carried over from `ocidist.rs`'s `parse_www_authenticate_bearer_str`.
pub fn parse_www_authenticate_str(input: &str) -> Option<Challenge<'_>> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        let (input, matches) = preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)?;
        Ok((input, matches))
    }
    let (_, matches) = parser(input).ok()?;
    let mut ret = Challenge::default();
    for (k, v) in matches {
        match k {
            "realm" => ret.realm = v,
            "service" => ret.service = v,
            "scope" => ret.scope = Some(v),
            _ => {}
        }
    }
    if ret.realm.is_empty() || ret.service.is_empty() {
        None
    } else {
        Some(ret)
    }
}

/// Widens a pull scope to pull+push, used when a write operation needs a
/// broader token than a prior read already cached.
pub fn scope_for(repository: &str, push: bool) -> String {
    if push {
        format!("repository:{repository}:pull,push")
    } else {
        format!("repository:{repository}:pull")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_realm_service_scope() {
        let header = r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io", scope="repository:library/alpine:pull""#;
        let parsed = parse_www_authenticate_str(header).unwrap();
        assert_eq!(parsed.realm, "https://auth.docker.io/token");
        assert_eq!(parsed.service, "registry.docker.io");
        assert_eq!(parsed.scope, Some("repository:library/alpine:pull"));
    }

    #[test]
    fn parse_missing_service_rejected() {
        let header = r#"Bearer realm="https://auth.docker.io/token""#;
        assert!(parse_www_authenticate_str(header).is_none());
    }

    #[test]
    fn parse_garbage_returns_none() {
        assert!(parse_www_authenticate_str("Basic realm=\"foo\"").is_none());
    }

    #[test]
    fn scope_widens_for_push() {
        assert_eq!(scope_for("foo/bar", false), "repository:foo/bar:pull");
        assert_eq!(scope_for("foo/bar", true), "repository:foo/bar:pull,push");
    }

    #[test]
    fn scope_actions_splits_comma_list() {
        assert_eq!(
            scope_actions("repository:foo/bar:pull,push"),
            vec!["pull", "push"]
        );
        assert_eq!(scope_actions("repository:foo/bar:pull"), vec!["pull"]);
    }

    #[tokio::test]
    async fn reuses_wider_cached_token_for_narrower_scope() {
        let client = AuthClient::new(reqwest::Client::new());
        client
            .token_cache
            .insert(
                TokenCacheKey {
                    registry: "registry.example".to_string(),
                    repository: "foo/bar".to_string(),
                    scope: "repository:foo/bar:pull,push".to_string(),
                },
                Token {
                    bearer: "widetoken".to_string(),
                    expires_in: Duration::from_secs(60),
                },
            )
            .await;

        let reused = client.reusable_token(
            "registry.example",
            "foo/bar",
            "repository:foo/bar:pull",
        );
        assert_eq!(reused.as_deref(), Some("widetoken"));
    }

    #[tokio::test]
    async fn does_not_reuse_across_repositories_or_narrower_scopes() {
        let client = AuthClient::new(reqwest::Client::new());
        client
            .token_cache
            .insert(
                TokenCacheKey {
                    registry: "registry.example".to_string(),
                    repository: "foo/bar".to_string(),
                    scope: "repository:foo/bar:pull".to_string(),
                },
                Token {
                    bearer: "pulltoken".to_string(),
                    expires_in: Duration::from_secs(60),
                },
            )
            .await;

        assert!(
            client
                .reusable_token("registry.example", "foo/bar", "repository:foo/bar:pull,push")
                .is_none()
        );
        assert!(
            client
                .reusable_token("registry.example", "other/repo", "repository:other/repo:pull")
                .is_none()
        );
    }
}
