//! The common interface both scheme backends (`reg`, `ocidir`) implement.
//!
//! A `#[async_trait]` so `client.rs` can dispatch by `Reference::scheme`:
//! a dyn-dispatchable async interface over the manifest/blob/tag
//! primitives, since native `async fn` in traits isn't object-safe
//! without it.

pub mod ocidir;
pub mod reg;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use oci_spec::image::Descriptor;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::reference::Reference;
use crate::reghttp::CancelToken;

/// A blob body as a stream of chunks rather than one materialized `Bytes`,
/// so a caller copying a large blob between backends isn't forced to hold
/// the whole thing in memory at once.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct TagList {
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RepoList {
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReferrerList {
    pub manifests: Vec<Descriptor>,
}

/// Options threaded through list operations without coupling callers to a
/// particular backend's pagination mechanics.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<u32>,
    pub last: Option<String>,
}

/// A scheme backend: everything the facade (`client.rs`) and the copy
/// orchestrator (`copy.rs`) need, independent of whether content lives on a
/// registry or a local directory.
#[async_trait]
pub trait Scheme: Send + Sync {
    async fn manifest_head(&self, reference: &Reference, cancel: &CancelToken)
    -> Result<Descriptor>;

    async fn manifest_get(&self, reference: &Reference, cancel: &CancelToken) -> Result<Manifest>;

    async fn manifest_put(
        &self,
        reference: &Reference,
        manifest: &Manifest,
        cancel: &CancelToken,
    ) -> Result<Descriptor>;

    async fn manifest_delete(&self, reference: &Reference, cancel: &CancelToken) -> Result<()>;

    async fn blob_head(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<bool>;

    async fn blob_get(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        range: Option<(u64, Option<u64>)>,
        cancel: &CancelToken,
    ) -> Result<Bytes>;

    async fn blob_put(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        data: Bytes,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Streaming counterpart to `blob_get`, unverified and unranged: the
    /// caller is responsible for checking the result against `descriptor`
    /// (e.g. via `pipe::copy_verified`) since verification here would force
    /// buffering the whole stream before yielding a single chunk.
    async fn blob_get_stream(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<ByteStream>;

    /// Attempts a cross-repository mount without transferring bytes;
    /// `Ok(true)` on success, `Ok(false)` if the backend doesn't support
    /// mount or the server required a full upload instead.
    async fn blob_mount(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        from_repository: &str,
        cancel: &CancelToken,
    ) -> Result<bool>;

    async fn blob_delete(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<()>;

    async fn tag_list(
        &self,
        reference: &Reference,
        options: ListOptions,
        cancel: &CancelToken,
    ) -> Result<TagList>;

    async fn tag_delete(&self, reference: &Reference, cancel: &CancelToken) -> Result<()>;

    async fn repo_list(&self, options: ListOptions, cancel: &CancelToken) -> Result<RepoList>;

    async fn referrer_list(
        &self,
        reference: &Reference,
        artifact_type: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<ReferrerList>;

    async fn ping(&self, cancel: &CancelToken) -> Result<bool>;
}
