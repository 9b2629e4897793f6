//! Provider context shared by every resource operation: endpoint defaults,
//! the process-wide login lock and the image-operations backend.

pub mod copy;
pub mod inspect;

use std::sync::Arc;

use serde::Deserialize;

use crate::endpoint::{Endpoint, EndpointConfig};
use crate::error::Result;
use crate::login::{EndpointSession, LoginLock};
use crate::skopeo::{ImageOps, RetryPolicy, SkopeoCli};

/// Provider-level configuration. Both blocks hold defaults that resource
/// `source`/`destination` blocks inherit field by field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub source: Option<EndpointConfig>,
    pub destination: Option<EndpointConfig>,
}

/// Shared state behind all resource operations. Clones share the login
/// lock and the backend, so concurrent operations across resources still
/// serialize their logins.
#[derive(Clone)]
pub struct Provider {
    config: ProviderConfig,
    lock: LoginLock,
    ops: Arc<dyn ImageOps>,
}

impl Provider {
    pub fn new(config: ProviderConfig, ops: Arc<dyn ImageOps>) -> Self {
        Self {
            config,
            lock: LoginLock::default(),
            ops,
        }
    }

    /// Provider backed by the `skopeo` binary found on PATH.
    pub fn with_skopeo(config: ProviderConfig) -> Self {
        Self::new(config, Arc::new(SkopeoCli::new()))
    }

    pub(crate) fn source_endpoint(&self, local: &EndpointConfig) -> Result<Endpoint> {
        resolve_with(local, self.config.source.as_ref())
    }

    pub(crate) fn destination_endpoint(&self, local: &EndpointConfig) -> Result<Endpoint> {
        resolve_with(local, self.config.destination.as_ref())
    }

    pub(crate) fn session<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        retry: RetryPolicy,
        insecure: bool,
    ) -> EndpointSession<'a> {
        EndpointSession::new(endpoint, self.ops.as_ref(), self.lock.clone(), retry, insecure)
    }

    pub(crate) fn ops(&self) -> &dyn ImageOps {
        self.ops.as_ref()
    }
}

fn resolve_with(local: &EndpointConfig, defaults: Option<&EndpointConfig>) -> Result<Endpoint> {
    match defaults {
        Some(defaults) => local.clone().overriding(defaults).resolve(),
        None => local.resolve(),
    }
}
