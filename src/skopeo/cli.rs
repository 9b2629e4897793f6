//! Drives the `skopeo` binary. Signature policy is not this provider's
//! concern, so every invocation passes `--insecure-policy`; TLS and auth
//! are still controlled per image through [`ImageOptions`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::providerlog::LogWriter;
use crate::reference::ImageRef;

use super::{
    CopyOptions, CopyResult, ImageOps, ImageOptions, Inspection, LoginOptions, RetryPolicy,
};

#[derive(Debug, Clone)]
pub struct SkopeoCli {
    binary: PathBuf,
}

impl SkopeoCli {
    /// Use `skopeo` from `PATH`.
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("skopeo"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(
        &self,
        operation: &'static str,
        image: &ImageRef,
        args: Vec<OsString>,
        stdin_data: Option<&str>,
    ) -> Result<std::process::Output> {
        tracing::debug!("running skopeo {} for {}", operation, image);
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", self.binary.display()))?;
        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().context("skopeo stdin unavailable")?;
            stdin
                .write_all(data.as_bytes())
                .await
                .context("writing to skopeo stdin")?;
            // Dropping closes the pipe so skopeo sees EOF.
            drop(stdin);
        }
        let output = child.wait_with_output().await.context("waiting for skopeo")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            tracing::debug!("skopeo {} for {} failed: {}", operation, image, stderr);
            return Err(Error::Operation {
                operation: operation.to_string(),
                image: image.to_string(),
                stderr,
            });
        }
        Ok(output)
    }
}

impl Default for SkopeoCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageOps for SkopeoCli {
    async fn inspect(
        &self,
        image: &ImageRef,
        options: &ImageOptions,
        retry: &RetryPolicy,
    ) -> Result<Inspection> {
        let output = self
            .run("inspect", image, inspect_args(image, options, retry), None)
            .await?;
        LogWriter::new("inspect").write(&output.stderr);
        serde_json::from_slice(&output.stdout)
            .context("parsing skopeo inspect output")
            .map_err(Error::from)
    }

    async fn copy(
        &self,
        src: &ImageRef,
        dst: &ImageRef,
        options: &CopyOptions,
        retry: &RetryPolicy,
    ) -> Result<CopyResult> {
        let digestfile = tempfile::NamedTempFile::new().context("creating digest file")?;
        let args = copy_args(src, dst, options, retry, digestfile.path());
        let output = self.run("copy", src, args, None).await?;

        let mut log = LogWriter::new("copy");
        log.write(&output.stdout);
        log.write(&output.stderr);

        let digest = std::fs::read_to_string(digestfile.path())
            .context("reading copy digest file")?
            .trim()
            .to_string();
        Ok(CopyResult { digest })
    }

    async fn delete(
        &self,
        image: &ImageRef,
        options: &ImageOptions,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let output = self
            .run("delete", image, delete_args(image, options, retry), None)
            .await?;
        let mut log = LogWriter::new("delete");
        log.write(&output.stdout);
        log.write(&output.stderr);
        Ok(())
    }

    async fn login(
        &self,
        image: &ImageRef,
        options: &LoginOptions,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let registry = image.registry().ok_or_else(|| Error::InvalidReference {
            reference: image.to_string(),
            reason: "login requires a docker:// registry reference".into(),
        })?;
        let args = login_args(registry, options);

        // skopeo login has no retry flags, so the transient-retry policy
        // is applied here instead.
        let mut attempt = 0;
        loop {
            match self
                .run("login", image, args.clone(), Some(&options.password))
                .await
            {
                Ok(output) => {
                    let mut log = LogWriter::new("login");
                    log.write(&output.stdout);
                    log.write(&output.stderr);
                    return Ok(());
                }
                Err(err) if attempt < retry.retries => {
                    attempt += 1;
                    tracing::debug!("skopeo login attempt {} for {} failed: {}", attempt, image, err);
                    tokio::time::sleep(retry.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn flag(prefix: Option<&str>, name: &str) -> OsString {
    match prefix {
        Some(prefix) => format!("--{prefix}-{name}").into(),
        None => format!("--{name}").into(),
    }
}

/// TLS/auth flags for one image. `prefix` distinguishes the two sides of a
/// copy (`--src-tls-verify` vs `--dest-tls-verify`); single-image
/// subcommands use the unprefixed spelling.
fn image_flags(prefix: Option<&str>, options: &ImageOptions) -> Vec<OsString> {
    let mut args = Vec::new();
    if options.insecure {
        let mut tls = flag(prefix, "tls-verify");
        tls.push("=false");
        args.push(tls);
    }
    if let Some(dir) = &options.certificate_directory {
        args.push(flag(prefix, "cert-dir"));
        args.push(dir.clone().into_os_string());
    }
    if let Some(file) = &options.registry_auth_file {
        args.push(flag(prefix, "authfile"));
        args.push(file.clone().into_os_string());
    }
    args
}

fn retry_flags(retry: &RetryPolicy) -> Vec<OsString> {
    let mut args = Vec::new();
    if retry.retries > 0 {
        args.push("--retry-times".into());
        args.push(retry.retries.to_string().into());
        if !retry.delay.is_zero() {
            args.push("--retry-delay".into());
            args.push(format!("{}s", retry.delay.as_secs()).into());
        }
    }
    args
}

fn inspect_args(image: &ImageRef, options: &ImageOptions, retry: &RetryPolicy) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--insecure-policy".into(), "inspect".into()];
    args.extend(retry_flags(retry));
    args.extend(image_flags(None, options));
    args.push(image.to_string().into());
    args
}

fn delete_args(image: &ImageRef, options: &ImageOptions, retry: &RetryPolicy) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--insecure-policy".into(), "delete".into()];
    args.extend(retry_flags(retry));
    args.extend(image_flags(None, options));
    args.push(image.to_string().into());
    args
}

fn copy_args(
    src: &ImageRef,
    dst: &ImageRef,
    options: &CopyOptions,
    retry: &RetryPolicy,
    digestfile: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--insecure-policy".into(), "copy".into()];
    args.extend(retry_flags(retry));
    args.extend(image_flags(Some("src"), &options.source));
    args.extend(image_flags(Some("dest"), &options.destination));
    if options.all_images {
        args.push("--all".into());
    }
    if options.preserve_digests {
        args.push("--preserve-digests".into());
    }
    for tag in &options.additional_tags {
        args.push("--additional-tag".into());
        args.push(tag.clone().into());
    }
    args.push("--digestfile".into());
    args.push(digestfile.as_os_str().to_owned());
    args.push(src.to_string().into());
    args.push(dst.to_string().into());
    args
}

fn login_args(registry: &str, options: &LoginOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--insecure-policy".into(), "login".into()];
    args.extend(image_flags(
        None,
        &ImageOptions {
            insecure: options.insecure,
            certificate_directory: options.certificate_directory.clone(),
            registry_auth_file: options.registry_auth_file.clone(),
        },
    ));
    args.push("--username".into());
    args.push(options.username.clone().into());
    args.push("--password-stdin".into());
    args.push(registry.into());
    args
}
