//! The inspect data source: full metadata of a single image.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::endpoint::EndpointConfig;
use crate::error::{is_not_found, Result};
use crate::provider::Provider;
use crate::skopeo::{ImageOptions, Inspection, LayerData, RetryPolicy};

/// Configuration of one inspect lookup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InspectSource {
    pub source: EndpointConfig,
    pub insecure: bool,
    /// In-call retries for transient failures; access failures go through
    /// `login_retries` on the endpoint instead.
    pub retries: u32,
    /// Delay between in-call retries, in seconds.
    pub retry_delay: u64,
}

/// One stored layer record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerEntry {
    pub mime_type: String,
    pub digest: String,
    pub size: i64,
    pub annotations: BTreeMap<String, String>,
}

impl From<LayerData> for LayerEntry {
    fn from(layer: LayerData) -> Self {
        Self {
            mime_type: layer.mime_type,
            digest: layer.digest,
            size: layer.size,
            annotations: layer.annotations.unwrap_or_default(),
        }
    }
}

/// Everything an inspect reports, flattened for storage. Collections that
/// skopeo leaves null come out empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectState {
    pub id: String,
    pub name: String,
    pub source_digest: String,
    pub repo_tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub docker_version: String,
    pub labels: BTreeMap<String, String>,
    pub architecture: String,
    pub os: String,
    pub layers: Vec<String>,
    pub layers_data: Vec<LayerEntry>,
    pub env: Vec<String>,
}

impl InspectState {
    fn from_inspection(id: String, inspection: Inspection) -> Self {
        Self {
            id,
            name: inspection.name,
            source_digest: inspection.digest,
            repo_tags: inspection.repo_tags.unwrap_or_default(),
            created: inspection.created,
            docker_version: inspection.docker_version,
            labels: inspection.labels.unwrap_or_default(),
            architecture: inspection.architecture,
            os: inspection.os,
            layers: inspection.layers.unwrap_or_default(),
            layers_data: inspection
                .layers_data
                .unwrap_or_default()
                .into_iter()
                .map(LayerEntry::from)
                .collect(),
            env: inspection.env.unwrap_or_default(),
        }
    }
}

impl Provider {
    /// Look up an image and return its full inspect report.
    ///
    /// Unlike a resource refresh, a missing image is an error here; there
    /// is no state to clear and no apply that could recreate it.
    pub async fn read_inspect(&self, source: &InspectSource) -> Result<InspectState> {
        let src = self.source_endpoint(&source.source)?;
        let retry = RetryPolicy {
            retries: source.retries,
            delay: Duration::from_secs(source.retry_delay),
        };
        let src_options = ImageOptions::for_endpoint(&src, source.insecure);
        let session = self.session(&src, retry, source.insecure);
        let ops = self.ops();

        loop {
            let attempt = session
                .with_login(false, |_locked| {
                    let src_options = &src_options;
                    let src_image = &src.image;
                    async move { ops.inspect(src_image, src_options, &retry).await }
                })
                .await;

            match attempt {
                Ok(inspection) => {
                    info!("inspected {} ({})", src.image, inspection.digest);
                    return Ok(InspectState::from_inspection(
                        src.image.to_string(),
                        inspection,
                    ));
                }
                Err(err) if is_not_found(&err) => return Err(err),
                Err(err) => {
                    if session.exhausted() {
                        return Err(session.exhausted_error(err));
                    }
                }
            }
        }
    }
}
