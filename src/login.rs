//! Login coordination: the process-wide login lock, the per-sequence retry
//! budget and the optimistic-then-authenticate wrapper around registry
//! operations.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::endpoint::{AuthMode, Endpoint, PasswordSource};
use crate::error::{Error, Result};
use crate::script;
use crate::skopeo::{ImageOps, LoginOptions, RetryPolicy};

/// Serializes login side effects across every endpoint sharing it. Login
/// scripts may write shared credential files, so no two logins may
/// interleave even when they target unrelated registries.
#[derive(Clone, Default)]
pub struct LoginLock {
    inner: Arc<Mutex<()>>,
}

/// Attempts left for one operation sequence. Initialized to the configured
/// retries plus the one implicit initial attempt, decremented on every
/// failed cycle, never reset mid-sequence.
#[derive(Debug)]
pub struct RetryBudget {
    remaining: AtomicI64,
    retries: u32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self {
            remaining: AtomicI64::new(i64::from(retries) + 1),
            retries,
        }
    }

    pub fn decrement(&self) {
        self.remaining.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn exhausted(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) <= 0
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// One endpoint's login/retry state for the duration of a single operation
/// sequence. Not shared across sequences, even for the same image.
pub struct EndpointSession<'a> {
    endpoint: &'a Endpoint,
    ops: &'a dyn ImageOps,
    lock: LoginLock,
    retry: RetryPolicy,
    insecure: bool,
    budget: RetryBudget,
}

impl<'a> EndpointSession<'a> {
    pub fn new(
        endpoint: &'a Endpoint,
        ops: &'a dyn ImageOps,
        lock: LoginLock,
        retry: RetryPolicy,
        insecure: bool,
    ) -> Self {
        Self {
            endpoint,
            ops,
            lock,
            retry,
            insecure,
            budget: RetryBudget::new(endpoint.login_retries),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.budget.exhausted()
    }

    pub fn exhausted_error(&self, cause: Error) -> Error {
        Error::RetriesExhausted {
            image: self.endpoint.image.to_string(),
            retries: self.budget.retries(),
            source: Box::new(cause),
        }
    }

    /// Run `op` with login-on-failure semantics.
    ///
    /// The operation is first attempted as-is, since credentials may
    /// already be in place. On failure the retry budget is spent and, if
    /// the endpoint has a way to authenticate, a login runs under the
    /// process-wide lock followed by exactly one more attempt. When the
    /// lock is contended the other login's completion may already have
    /// fixed things, so the operation is retried once before logging in.
    ///
    /// `locked` must be true iff the caller already holds the lock; the
    /// wrapper then skips all lock handling. `op` receives the same flag
    /// so nested wrappers can keep threading it.
    pub async fn with_login<T, F, Fut>(&self, locked: bool, op: F) -> Result<T>
    where
        F: Fn(bool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let err = match op(locked).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        self.budget.decrement();

        if !self.endpoint.requires_login() {
            return Err(err);
        }

        if locked {
            self.do_login().await?;
            return op(true).await;
        }

        match self.lock.inner.try_lock() {
            Ok(_guard) => {
                self.do_login().await?;
                op(true).await
            }
            Err(_) => {
                // Another login is in flight somewhere in the process.
                // Wait for it, then see whether it fixed our credentials
                // before paying for a login of our own.
                let _guard = self.lock.inner.lock().await;
                tracing::debug!(
                    "retrying {} after a concurrent login completed",
                    self.endpoint.image
                );
                match op(true).await {
                    Ok(result) => Ok(result),
                    Err(_) => {
                        self.do_login().await?;
                        op(true).await
                    }
                }
            }
        }
    }

    async fn do_login(&self) -> Result<()> {
        match &self.endpoint.auth {
            AuthMode::None => Ok(()),
            AuthMode::UsernamePassword { username, password } => {
                let password = match password {
                    PasswordSource::Static(value) => value.clone(),
                    PasswordSource::Script(script_text) => {
                        tracing::info!(
                            "running password script for image {} (user {})",
                            self.endpoint.image,
                            username
                        );
                        script::run_login_script(self.endpoint, script_text).await?
                    }
                };
                tracing::info!("logging in to {} as {}", self.endpoint.image, username);
                let options = LoginOptions {
                    username: username.clone(),
                    password,
                    insecure: self.insecure,
                    certificate_directory: self.endpoint.certificate_directory.clone(),
                    registry_auth_file: self.endpoint.registry_auth_file.clone(),
                };
                match self.ops.login(&self.endpoint.image, &options, &self.retry).await {
                    Ok(()) => {
                        tracing::info!("logged in to {}", self.endpoint.image);
                        Ok(())
                    }
                    Err(err) => {
                        tracing::info!("login failed for {}: {}", self.endpoint.image, err);
                        Err(err)
                    }
                }
            }
            AuthMode::Script(script_text) => {
                tracing::info!("running login script for image {}", self.endpoint.image);
                let stdout = script::run_login_script(self.endpoint, script_text).await?;
                if !stdout.is_empty() {
                    tracing::debug!("login script output: {}", stdout);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointConfig;
    use crate::reference::ImageRef;
    use crate::skopeo::{CopyOptions, CopyResult, ImageOptions, Inspection};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct StubOps {
        logins: StdMutex<Vec<LoginOptions>>,
    }

    #[async_trait]
    impl ImageOps for StubOps {
        async fn inspect(
            &self,
            _image: &ImageRef,
            _options: &ImageOptions,
            _retry: &RetryPolicy,
        ) -> Result<Inspection> {
            unimplemented!("not used by these tests")
        }

        async fn copy(
            &self,
            _src: &ImageRef,
            _dst: &ImageRef,
            _options: &CopyOptions,
            _retry: &RetryPolicy,
        ) -> Result<CopyResult> {
            unimplemented!("not used by these tests")
        }

        async fn delete(
            &self,
            _image: &ImageRef,
            _options: &ImageOptions,
            _retry: &RetryPolicy,
        ) -> Result<()> {
            unimplemented!("not used by these tests")
        }

        async fn login(
            &self,
            _image: &ImageRef,
            options: &LoginOptions,
            _retry: &RetryPolicy,
        ) -> Result<()> {
            self.logins.lock().unwrap().push(options.clone());
            Ok(())
        }
    }

    fn endpoint_with(adjust: impl FnOnce(&mut EndpointConfig)) -> Endpoint {
        let mut cfg = EndpointConfig {
            image: Some("docker://example.com/app:v1".to_string()),
            ..EndpointConfig::default()
        };
        adjust(&mut cfg);
        cfg.resolve().unwrap()
    }

    fn failing_op(attempts: &AtomicUsize, succeed_from: usize) -> impl Fn(bool) -> std::future::Ready<Result<u32>> + '_ {
        move |_locked| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if attempt >= succeed_from {
                Ok(attempt as u32)
            } else {
                Err(Error::NotFound("transient".into()))
            })
        }
    }

    #[tokio::test]
    async fn no_auth_surfaces_the_first_failure() {
        let endpoint = endpoint_with(|cfg| cfg.login_retries = Some(5));
        let ops = StubOps::default();
        let session = EndpointSession::new(
            &endpoint,
            &ops,
            LoginLock::default(),
            RetryPolicy::default(),
            false,
        );

        let attempts = AtomicUsize::new(0);
        let err = session
            .with_login(false, failing_op(&attempts, usize::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(ops.logins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_script_runs_exactly_once_then_retries() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("logged-in");
        let endpoint = endpoint_with(|cfg| {
            cfg.login_script = Some(format!("echo ran >> {}", marker.display()));
        });
        let ops = StubOps::default();
        let session = EndpointSession::new(
            &endpoint,
            &ops,
            LoginLock::default(),
            RetryPolicy::default(),
            false,
        );

        let attempts = AtomicUsize::new(0);
        let result = session
            .with_login(false, failing_op(&attempts, 2))
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "ran\n");
    }

    #[tokio::test]
    async fn password_script_stdout_becomes_the_password() {
        let endpoint = endpoint_with(|cfg| {
            cfg.login_username = Some("bob".into());
            cfg.login_password_script = Some("printf 'from-script\\n'".into());
        });
        let ops = StubOps::default();
        let session = EndpointSession::new(
            &endpoint,
            &ops,
            LoginLock::default(),
            RetryPolicy::default(),
            false,
        );

        let attempts = AtomicUsize::new(0);
        session
            .with_login(false, failing_op(&attempts, 2))
            .await
            .unwrap();

        let logins = ops.logins.lock().unwrap();
        assert_eq!(logins.len(), 1);
        assert_eq!(logins[0].username, "bob");
        assert_eq!(logins[0].password, "from-script");
    }

    #[tokio::test]
    async fn locked_caller_skips_lock_handling() {
        let endpoint = endpoint_with(|cfg| {
            cfg.login_script = Some("true && echo done".into());
        });
        let ops = StubOps::default();
        let lock = LoginLock::default();
        let session = EndpointSession::new(
            &endpoint,
            &ops,
            lock.clone(),
            RetryPolicy::default(),
            false,
        );

        // Simulates a caller that already holds the process-wide lock; a
        // nested wrapper taking it again would deadlock.
        let _guard = lock.inner.lock().await;
        let attempts = AtomicUsize::new(0);
        let result = session.with_login(true, failing_op(&attempts, 2)).await.unwrap();
        assert_eq!(result, 2);
    }
}
