//! Endpoint configuration and resolution.
//!
//! An endpoint is one side of a transfer (source or destination). Its
//! configuration can be given on the resource itself or inherited from the
//! provider block; [`EndpointConfig::overriding`] merges the two and
//! [`EndpointConfig::resolve`] validates the result into an immutable
//! [`Endpoint`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::reference::ImageRef;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LOGIN_SCRIPT: &str = "true";
pub const DEFAULT_WORKING_DIRECTORY: &str = ".";
pub const DEFAULT_LOGIN_RETRIES: u32 = 0;

fn default_interpreter() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

/// Raw endpoint configuration. Every field is optional so that a merge can
/// tell "explicitly set" apart from "defaulted".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub image: Option<String>,
    pub login_username: Option<String>,
    pub login_password: Option<String>,
    pub login_password_script: Option<String>,
    pub login_script: Option<String>,
    pub login_script_interpreter: Option<Vec<String>>,
    pub login_retries: Option<u32>,
    pub login_environment: Option<BTreeMap<String, String>>,
    pub working_directory: Option<String>,
    /// Script timeout in seconds.
    pub timeout: Option<u64>,
    pub certificate_directory: Option<PathBuf>,
    pub registry_auth_file: Option<PathBuf>,
}

fn inherit<T: Clone>(field: &mut Option<T>, fallback: &Option<T>) {
    if field.is_none() {
        *field = fallback.clone();
    }
}

impl EndpointConfig {
    /// Merge provider-level defaults into this configuration. Fields set
    /// here win; unset fields inherit. The username/password/password-script
    /// group moves as a unit keyed on `login_username`, so a local username
    /// is never combined with an inherited password.
    pub fn overriding(mut self, defaults: &EndpointConfig) -> EndpointConfig {
        inherit(&mut self.image, &defaults.image);
        inherit(&mut self.login_script, &defaults.login_script);
        inherit(&mut self.login_script_interpreter, &defaults.login_script_interpreter);
        inherit(&mut self.login_retries, &defaults.login_retries);
        inherit(&mut self.login_environment, &defaults.login_environment);
        inherit(&mut self.working_directory, &defaults.working_directory);
        inherit(&mut self.timeout, &defaults.timeout);
        inherit(&mut self.certificate_directory, &defaults.certificate_directory);
        inherit(&mut self.registry_auth_file, &defaults.registry_auth_file);
        if self.login_username.is_none() {
            self.login_username = defaults.login_username.clone();
            self.login_password = defaults.login_password.clone();
            self.login_password_script = defaults.login_password_script.clone();
        }
        self
    }

    /// Validate and fill in defaults. Credential validation happens here,
    /// before any network activity: a username requires exactly one of
    /// `login_password` and `login_password_script`.
    pub fn resolve(&self) -> Result<Endpoint> {
        let raw = self.image.as_deref().ok_or(Error::MissingImage)?;
        let image: ImageRef = raw.parse()?;

        let auth = if let Some(username) = &self.login_username {
            let password = match (&self.login_password, &self.login_password_script) {
                (Some(password), None) => PasswordSource::Static(password.clone()),
                (None, Some(script)) => PasswordSource::Script(script.clone()),
                (Some(_), Some(_)) => return Err(Error::AmbiguousPassword(image.to_string())),
                (None, None) => return Err(Error::MissingPassword(image.to_string())),
            };
            AuthMode::UsernamePassword {
                username: username.clone(),
                password,
            }
        } else {
            match self.login_script.as_deref() {
                // "true" is the no-op sentinel: nothing to authenticate with.
                Some(script) if script != DEFAULT_LOGIN_SCRIPT => AuthMode::Script(script.to_string()),
                _ => AuthMode::None,
            }
        };

        Ok(Endpoint {
            image,
            auth,
            login_retries: self.login_retries.unwrap_or(DEFAULT_LOGIN_RETRIES),
            login_environment: self.login_environment.clone().unwrap_or_default(),
            interpreter: self
                .login_script_interpreter
                .clone()
                .filter(|argv| !argv.is_empty())
                .unwrap_or_else(default_interpreter),
            working_directory: PathBuf::from(
                self.working_directory
                    .as_deref()
                    .unwrap_or(DEFAULT_WORKING_DIRECTORY),
            ),
            script_timeout: Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            certificate_directory: self.certificate_directory.clone(),
            registry_auth_file: std::env::var_os("REGISTRY_AUTH_FILE")
                .map(PathBuf::from)
                .or_else(|| self.registry_auth_file.clone()),
        })
    }
}

/// How an endpoint authenticates before retrying a failed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthMode {
    /// No credentials configured; failures are final.
    None,
    /// `skopeo login` with a username and a password (or its producer).
    UsernamePassword {
        username: String,
        password: PasswordSource,
    },
    /// An external script whose side effect establishes credentials.
    Script(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PasswordSource {
    Static(String),
    /// Script whose stdout is the password.
    Script(String),
}

/// A fully resolved endpoint, immutable after construction.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub image: ImageRef,
    pub auth: AuthMode,
    pub login_retries: u32,
    pub login_environment: BTreeMap<String, String>,
    pub interpreter: Vec<String>,
    pub working_directory: PathBuf,
    pub script_timeout: Duration,
    pub certificate_directory: Option<PathBuf>,
    pub registry_auth_file: Option<PathBuf>,
}

impl Endpoint {
    pub fn requires_login(&self) -> bool {
        self.auth != AuthMode::None
    }
}
