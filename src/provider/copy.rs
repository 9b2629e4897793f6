//! The copy resource: mirrors a source image to a destination registry and
//! tracks the mirrored digests in state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::endpoint::EndpointConfig;
use crate::error::{is_not_found, Error, Result};
use crate::provider::Provider;
use crate::reference::is_ghcr;
use crate::skopeo::{CopyOptions, ImageOptions, RetryPolicy};

/// Configuration of one copy resource.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CopyResource {
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    /// In-call retries for transient failures. Access failures are retried
    /// through `login_retries` on the endpoints instead.
    pub retries: u32,
    /// Delay between in-call retries, in seconds.
    pub retry_delay: u64,
    /// Extra tags applied to the destination on top of its own.
    pub additional_tags: Vec<String>,
    /// Leave the destination image in place on destroy.
    pub keep_image: bool,
    /// Keep destination digests identical to the source and track the
    /// source digest in state so upstream pushes show up as drift.
    pub preserve_digests: bool,
    /// Allow plain-HTTP and untrusted-TLS registries on both sides.
    pub insecure: bool,
    /// Copy every image of a multi-arch list instead of one platform.
    pub copy_all_images: bool,
}

impl CopyResource {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            delay: Duration::from_secs(self.retry_delay),
        }
    }
}

/// State persisted for a copy resource. `id` doubles as the existence
/// marker: `None` means the destination image is gone and the next apply
/// must recreate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyState {
    pub id: Option<String>,
    /// Manifest digest of the destination image.
    pub docker_digest: Option<String>,
    /// Digest of the source at the time of the copy; only tracked when
    /// `preserve_digests` is set.
    pub source_digest: Option<String>,
}

impl CopyState {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn is_absent(&self) -> bool {
        self.id.is_none()
    }
}

/// What an apply would have to do for a copy resource, given its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPlan {
    UpToDate,
    /// No destination image exists yet.
    Create,
    /// The destination must be replaced, either because its reference
    /// changed or because the source moved ahead of the mirrored digest.
    Recreate,
}

impl Provider {
    /// Create (or replace) the destination image by copying the source.
    ///
    /// The source is inspected first and the copy runs nested inside the
    /// source's login session, so a credential refresh on either side
    /// restarts the whole sequence. Each endpoint spends its own budget;
    /// the loop ends when the copy succeeds or either side is exhausted.
    /// A missing source image fails immediately, since retrying cannot
    /// make it appear.
    pub async fn create_copy(&self, resource: &CopyResource) -> Result<CopyState> {
        let src = self.source_endpoint(&resource.source)?;
        let dst = self.destination_endpoint(&resource.destination)?;
        let retry = resource.retry_policy();
        let src_options = ImageOptions::for_endpoint(&src, resource.insecure);
        let copy_options = CopyOptions {
            source: ImageOptions::for_endpoint(&src, resource.insecure),
            destination: ImageOptions::for_endpoint(&dst, resource.insecure),
            additional_tags: resource.additional_tags.clone(),
            preserve_digests: resource.preserve_digests,
            all_images: resource.copy_all_images,
        };

        let src_session = self.session(&src, retry, resource.insecure);
        let dst_session = self.session(&dst, retry, resource.insecure);
        let ops = self.ops();

        info!("copying {} to {}", src.image, dst.image);
        loop {
            let attempt = src_session
                .with_login(false, |locked| {
                    let src_options = &src_options;
                    let copy_options = &copy_options;
                    let dst_session = &dst_session;
                    let src_image = &src.image;
                    let dst_image = &dst.image;
                    async move {
                        let inspection = ops.inspect(src_image, src_options, &retry).await?;
                        let copied = dst_session
                            .with_login(locked, |_locked| async move {
                                ops.copy(src_image, dst_image, copy_options, &retry).await
                            })
                            .await?;
                        Ok((inspection, copied))
                    }
                })
                .await;

            match attempt {
                Ok((inspection, copied)) => {
                    info!("copied {} to {} ({})", src.image, dst.image, copied.digest);
                    return Ok(CopyState {
                        id: Some(dst.image.to_string()),
                        docker_digest: Some(copied.digest),
                        source_digest: resource.preserve_digests.then(|| inspection.digest),
                    });
                }
                Err(err) if is_not_found(&err) => return Err(err),
                Err(err) => {
                    debug!("copy attempt for {} failed: {}", dst.image, err);
                    if src_session.exhausted() {
                        return Err(src_session.exhausted_error(err));
                    }
                    if dst_session.exhausted() {
                        return Err(dst_session.exhausted_error(err));
                    }
                }
            }
        }
    }

    /// Refresh state from the destination registry.
    ///
    /// A missing image clears the state so the next apply recreates the
    /// copy. So does an endpoint that stays unreachable after the whole
    /// login budget: the login script itself may have changed, and a
    /// failed refresh must not wedge the resource.
    pub async fn read_copy(&self, resource: &CopyResource, state: &CopyState) -> Result<CopyState> {
        let dst = self.destination_endpoint(&resource.destination)?;
        let retry = resource.retry_policy();
        let dst_options = ImageOptions::for_endpoint(&dst, resource.insecure);
        let dst_session = self.session(&dst, retry, resource.insecure);
        let ops = self.ops();

        let inspection = loop {
            let attempt = dst_session
                .with_login(false, |_locked| {
                    let dst_options = &dst_options;
                    let dst_image = &dst.image;
                    async move {
                        match ops.inspect(dst_image, dst_options, &retry).await {
                            Ok(found) => Ok(Some(found)),
                            // A missing image is an answer, not a failure;
                            // it must not trigger a login cycle.
                            Err(err) if is_not_found(&err) => Ok(None),
                            Err(err) => Err(err),
                        }
                    }
                })
                .await;

            match attempt {
                Ok(Some(found)) => break found,
                Ok(None) => {
                    info!("image {} is gone, clearing state", dst.image);
                    return Ok(CopyState::absent());
                }
                Err(err) => {
                    if dst_session.exhausted() {
                        warn!(
                            "giving up on refreshing {} after {} login retries: {}",
                            dst.image, dst.login_retries, err
                        );
                        return Ok(CopyState::absent());
                    }
                }
            }
        };

        let mut next = CopyState {
            id: Some(dst.image.to_string()),
            docker_digest: Some(inspection.digest),
            source_digest: None,
        };
        if resource.preserve_digests {
            next.source_digest = self.read_source_digest(resource, state).await?;
        }
        Ok(next)
    }

    /// Digest the source currently resolves to, for drift tracking.
    ///
    /// Keeps the previously stored value when the source stays unreachable;
    /// fabricating a change out of a transient failure would force a
    /// needless replacement.
    async fn read_source_digest(
        &self,
        resource: &CopyResource,
        state: &CopyState,
    ) -> Result<Option<String>> {
        let src = self.source_endpoint(&resource.source)?;
        let retry = resource.retry_policy();
        let src_options = ImageOptions::for_endpoint(&src, resource.insecure);
        let src_session = self.session(&src, retry, resource.insecure);
        let ops = self.ops();

        loop {
            let attempt = src_session
                .with_login(false, |_locked| {
                    let src_options = &src_options;
                    let src_image = &src.image;
                    async move {
                        match ops.inspect(src_image, src_options, &retry).await {
                            Ok(found) => Ok(Some(found.digest)),
                            Err(err) if is_not_found(&err) => Ok(None),
                            Err(err) => Err(err),
                        }
                    }
                })
                .await;

            match attempt {
                Ok(Some(digest)) => return Ok(Some(digest)),
                Ok(None) => {
                    info!("source {} is gone", src.image);
                    return Ok(None);
                }
                Err(err) => {
                    if src_session.exhausted() {
                        warn!("could not inspect source {} for drift: {}", src.image, err);
                        return Ok(state.source_digest.clone());
                    }
                }
            }
        }
    }

    /// An update re-runs the copy. Every attribute change either forces a
    /// replacement or only alters how the copy itself is performed.
    pub async fn update_copy(&self, resource: &CopyResource) -> Result<CopyState> {
        self.create_copy(resource).await
    }

    /// Remove the destination image, honoring `keep_image`.
    ///
    /// GitHub's container registry has no per-image delete, so a ghcr
    /// destination fails before any network traffic.
    pub async fn delete_copy(&self, resource: &CopyResource) -> Result<()> {
        if resource.keep_image {
            debug!("keep_image is set, leaving the destination in place");
            return Ok(());
        }

        let dst = self.destination_endpoint(&resource.destination)?;
        let rendered = dst.image.to_string();
        if is_ghcr(&rendered) {
            return Err(Error::DeleteUnsupported("GitHub".to_string()));
        }

        let retry = resource.retry_policy();
        let dst_options = ImageOptions::for_endpoint(&dst, resource.insecure);
        let dst_session = self.session(&dst, retry, resource.insecure);
        let ops = self.ops();

        loop {
            let attempt = dst_session
                .with_login(false, |_locked| {
                    let dst_options = &dst_options;
                    let dst_image = &dst.image;
                    async move { ops.delete(dst_image, dst_options, &retry).await }
                })
                .await;

            match attempt {
                Ok(()) => {
                    info!("deleted {}", dst.image);
                    return Ok(());
                }
                Err(err) => {
                    if dst_session.exhausted() {
                        return Err(dst_session.exhausted_error(err));
                    }
                }
            }
        }
    }

    /// Decide whether the stored state still matches the configuration.
    /// Purely local; no registry is contacted.
    pub fn plan_copy(&self, resource: &CopyResource, state: &CopyState) -> Result<CopyPlan> {
        if state.is_absent() {
            return Ok(CopyPlan::Create);
        }
        let dst = self.destination_endpoint(&resource.destination)?;
        let rendered = dst.image.to_string();
        if state.id.as_deref() != Some(rendered.as_str()) {
            return Ok(CopyPlan::Recreate);
        }
        if resource.preserve_digests && state.source_digest != state.docker_digest {
            return Ok(CopyPlan::Recreate);
        }
        Ok(CopyPlan::UpToDate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderConfig;
    use crate::reference::ImageRef;
    use crate::skopeo::{CopyResult, ImageOps, Inspection, LoginOptions};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullOps;

    #[async_trait]
    impl ImageOps for NullOps {
        async fn inspect(
            &self,
            _image: &ImageRef,
            _options: &ImageOptions,
            _retry: &RetryPolicy,
        ) -> Result<Inspection> {
            unimplemented!("plan never touches the backend")
        }

        async fn copy(
            &self,
            _src: &ImageRef,
            _dst: &ImageRef,
            _options: &CopyOptions,
            _retry: &RetryPolicy,
        ) -> Result<CopyResult> {
            unimplemented!("plan never touches the backend")
        }

        async fn delete(
            &self,
            _image: &ImageRef,
            _options: &ImageOptions,
            _retry: &RetryPolicy,
        ) -> Result<()> {
            unimplemented!("plan never touches the backend")
        }

        async fn login(
            &self,
            _image: &ImageRef,
            _options: &LoginOptions,
            _retry: &RetryPolicy,
        ) -> Result<()> {
            unimplemented!("plan never touches the backend")
        }
    }

    fn provider() -> Provider {
        Provider::new(ProviderConfig::default(), Arc::new(NullOps))
    }

    fn resource(destination: &str) -> CopyResource {
        CopyResource {
            source: EndpointConfig {
                image: Some("docker://src.example.com/app:v1".into()),
                ..EndpointConfig::default()
            },
            destination: EndpointConfig {
                image: Some(destination.into()),
                ..EndpointConfig::default()
            },
            ..CopyResource::default()
        }
    }

    #[test]
    fn absent_state_plans_a_create() {
        let plan = provider()
            .plan_copy(&resource("docker://dst.example.com/app:v1"), &CopyState::absent())
            .unwrap();
        assert_eq!(plan, CopyPlan::Create);
    }

    #[test]
    fn changed_destination_plans_a_recreate() {
        let state = CopyState {
            id: Some("docker://dst.example.com/app:v1".into()),
            docker_digest: Some("sha256:aaa".into()),
            source_digest: None,
        };
        let plan = provider()
            .plan_copy(&resource("docker://dst.example.com/app:v2"), &state)
            .unwrap();
        assert_eq!(plan, CopyPlan::Recreate);
    }

    #[test]
    fn source_drift_forces_a_recreate_only_with_preserve_digests() {
        let state = CopyState {
            id: Some("docker://dst.example.com/app:v1".into()),
            docker_digest: Some("sha256:aaa".into()),
            source_digest: Some("sha256:bbb".into()),
        };

        let mut drifting = resource("docker://dst.example.com/app:v1");
        drifting.preserve_digests = true;
        let plan = provider().plan_copy(&drifting, &state).unwrap();
        assert_eq!(plan, CopyPlan::Recreate);

        let relaxed = resource("docker://dst.example.com/app:v1");
        let plan = provider().plan_copy(&relaxed, &state).unwrap();
        assert_eq!(plan, CopyPlan::UpToDate);
    }

    #[test]
    fn matching_digests_are_up_to_date() {
        let state = CopyState {
            id: Some("docker://dst.example.com/app:v1".into()),
            docker_digest: Some("sha256:aaa".into()),
            source_digest: Some("sha256:aaa".into()),
        };
        let mut preserved = resource("docker://dst.example.com/app:v1");
        preserved.preserve_digests = true;
        let plan = provider().plan_copy(&preserved, &state).unwrap();
        assert_eq!(plan, CopyPlan::UpToDate);
    }
}
