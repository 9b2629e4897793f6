//! Contract for the external image tooling that does the actual registry
//! work. The production implementation drives the `skopeo` binary; tests
//! substitute mocks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::reference::ImageRef;

pub mod cli;

pub use cli::SkopeoCli;

/// Per-image options forwarded into every call.
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Skip TLS verification and allow plain HTTP registries.
    pub insecure: bool,
    pub certificate_directory: Option<PathBuf>,
    pub registry_auth_file: Option<PathBuf>,
}

impl ImageOptions {
    pub fn for_endpoint(endpoint: &Endpoint, insecure: bool) -> Self {
        Self {
            insecure,
            certificate_directory: endpoint.certificate_directory.clone(),
            registry_auth_file: endpoint.registry_auth_file.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub source: ImageOptions,
    pub destination: ImageOptions,
    /// Extra tags applied to the destination on top of its own.
    pub additional_tags: Vec<String>,
    /// Fail instead of re-encoding when the source digests cannot be kept.
    pub preserve_digests: bool,
    /// Copy all images of a multi-arch list, not just the current platform.
    pub all_images: bool,
}

#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub username: String,
    pub password: String,
    pub insecure: bool,
    pub certificate_directory: Option<PathBuf>,
    pub registry_auth_file: Option<PathBuf>,
}

/// Transient-failure retry applied inside a single call, orthogonal to the
/// credential-refresh retry that wraps calls from the outside.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyResult {
    /// Manifest digest of the copied destination image.
    pub digest: String,
}

/// One layer entry of an inspect report, as skopeo serializes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LayerData {
    #[serde(rename = "MIMEType")]
    pub mime_type: String,
    pub digest: String,
    pub size: i64,
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Image metadata as reported by `skopeo inspect`. Collection fields are
/// optional because skopeo emits `null` for empty ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Inspection {
    pub name: String,
    pub tag: Option<String>,
    pub digest: String,
    pub repo_tags: Option<Vec<String>>,
    pub created: Option<DateTime<Utc>>,
    pub docker_version: String,
    pub labels: Option<BTreeMap<String, String>>,
    pub architecture: String,
    pub os: String,
    pub layers: Option<Vec<String>>,
    pub layers_data: Option<Vec<LayerData>>,
    pub env: Option<Vec<String>>,
}

/// The image operations this provider orchestrates. Every method is a
/// single attempt from the caller's point of view; `retry` only smooths
/// transient network errors inside the call.
#[async_trait]
pub trait ImageOps: Send + Sync {
    async fn inspect(
        &self,
        image: &ImageRef,
        options: &ImageOptions,
        retry: &RetryPolicy,
    ) -> Result<Inspection>;

    async fn copy(
        &self,
        src: &ImageRef,
        dst: &ImageRef,
        options: &CopyOptions,
        retry: &RetryPolicy,
    ) -> Result<CopyResult>;

    async fn delete(
        &self,
        image: &ImageRef,
        options: &ImageOptions,
        retry: &RetryPolicy,
    ) -> Result<()>;

    /// Authenticate against the registry hosting `image`. Out-of-band
    /// script logins never reach this; it backs username/password auth.
    async fn login(
        &self,
        image: &ImageRef,
        options: &LoginOptions,
        retry: &RetryPolicy,
    ) -> Result<()>;
}
