//! An OCI Distribution Specification client: a scheme-dispatch facade over
//! a remote registry backend and a local OCI-layout directory backend,
//! sharing one authenticated, retrying transport and a cross-repository
//! image copy orchestrator.
//!
//! Start at [`client::Client`].

pub mod auth;
pub mod client;
pub mod copy;
pub mod descriptor;
pub mod error;
pub mod hostconfig;
pub mod manifest;
pub mod ocilayout;
pub mod pipe;
pub mod queue;
pub mod reference;
pub mod reghttp;
pub mod scheme;

pub use client::{Client, ClientBuilder};
pub use copy::{CopyOptions, ProgressEvent, ProgressKind, ProgressState};
pub use error::{Error, Result};
pub use manifest::Manifest;
pub use reference::Reference;
