//! Runs login and password scripts with a bounded wall-clock time.

use std::process::Stdio;

use anyhow::Context as _;
use tokio::process::Command;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// What happened when a script ran to completion or was cut off.
#[derive(Debug)]
pub(crate) struct ScriptOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the script was killed at the timeout.
    pub status: Option<std::process::ExitStatus>,
}

/// Spawn the endpoint's interpreter with `script` appended to its argv,
/// racing completion against the endpoint's timeout. The script runs in its
/// own process group so a timeout can take the whole pipeline down, not
/// just the interpreter.
pub(crate) async fn run(endpoint: &Endpoint, script: &str) -> Result<ScriptOutcome> {
    let mut command = Command::new(&endpoint.interpreter[0]);
    command
        .args(&endpoint.interpreter[1..])
        .arg(script)
        .envs(&endpoint.login_environment)
        .current_dir(&endpoint.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let child = command.spawn().map_err(|source| Error::ScriptStart {
        image: endpoint.image.to_string(),
        source,
    })?;
    let pid = child.id();

    match tokio::time::timeout(endpoint.script_timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.context("waiting for login script")?;
            Ok(ScriptOutcome {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                status: Some(output.status),
            })
        }
        Err(_) => {
            kill_group(pid);
            Ok(ScriptOutcome {
                stdout: String::new(),
                stderr: String::new(),
                status: None,
            })
        }
    }
}

/// Run a script and classify the outcome: timeout, non-zero exit and
/// could-not-start are three distinct errors. On success returns stdout
/// with one trailing newline removed.
pub(crate) async fn run_login_script(endpoint: &Endpoint, script: &str) -> Result<String> {
    let outcome = run(endpoint, script).await?;
    let Some(status) = outcome.status else {
        tracing::warn!(
            "login script timed out for image {} after {:?}",
            endpoint.image,
            endpoint.script_timeout
        );
        return Err(Error::ScriptTimeout {
            image: endpoint.image.to_string(),
            timeout_secs: endpoint.script_timeout.as_secs(),
        });
    };
    if !status.success() {
        tracing::info!(
            "login script for image {} returned {}",
            endpoint.image,
            status
        );
        return Err(Error::ScriptFailed {
            image: endpoint.image.to_string(),
            status,
            stderr: outcome.stderr,
        });
    }
    Ok(trim_trailing_newline(outcome.stdout))
}

fn kill_group(pid: Option<u32>) {
    let Some(raw) = pid else { return };
    if let Some(pid) = rustix::process::Pid::from_raw(raw as i32) {
        let _ = rustix::process::kill_process_group(pid, rustix::process::Signal::KILL);
    }
}

fn trim_trailing_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointConfig;

    fn endpoint_with(adjust: impl FnOnce(&mut EndpointConfig)) -> Endpoint {
        let mut cfg = EndpointConfig {
            image: Some("docker://example.com/app:v1".to_string()),
            ..EndpointConfig::default()
        };
        adjust(&mut cfg);
        cfg.resolve().unwrap()
    }

    #[tokio::test]
    async fn captures_stdout_and_trims_one_trailing_newline() {
        let endpoint = endpoint_with(|_| {});
        let stdout = run_login_script(&endpoint, "printf 'secret\\n'").await.unwrap();
        assert_eq!(stdout, "secret");

        let stdout = run_login_script(&endpoint, "printf 'a\\nb\\n'").await.unwrap();
        assert_eq!(stdout, "a\nb");
    }

    #[tokio::test]
    async fn environment_and_working_directory_apply() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint_with(|cfg| {
            cfg.login_environment = Some(
                [("PROVIDER_TOKEN".to_string(), "tok-1".to_string())]
                    .into_iter()
                    .collect(),
            );
            cfg.working_directory = Some(dir.path().display().to_string());
        });
        let stdout = run_login_script(&endpoint, "printf '%s %s' \"$PROVIDER_TOKEN\" \"$PWD\"")
            .await
            .unwrap();
        assert_eq!(stdout, format!("tok-1 {}", dir.path().display()));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failure_with_stderr() {
        let endpoint = endpoint_with(|_| {});
        let err = run_login_script(&endpoint, "echo oops >&2; exit 3")
            .await
            .unwrap_err();
        match &err {
            Error::ScriptFailed { stderr, .. } => assert!(stderr.contains("oops")),
            other => panic!("expected ScriptFailed, got {other:?}"),
        }
        assert!(err.to_string().contains("failed"));
        assert!(!err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn timeout_kills_the_script_and_is_distinguishable() {
        let endpoint = endpoint_with(|cfg| cfg.timeout = Some(1));
        let err = run_login_script(&endpoint, "sleep 30").await.unwrap_err();
        assert!(matches!(err, Error::ScriptTimeout { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_start_failure() {
        let endpoint = endpoint_with(|cfg| {
            cfg.login_script_interpreter = Some(vec!["/nonexistent/shell".to_string(), "-c".to_string()]);
        });
        let err = run_login_script(&endpoint, "true").await.unwrap_err();
        assert!(matches!(err, Error::ScriptStart { .. }));
    }
}
