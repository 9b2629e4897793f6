use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("An image reference is required")]
    MissingImage,

    #[error("Either login_password or login_password_script needs to be specified for {0}")]
    MissingPassword(String),

    #[error("Only one of login_password and login_password_script may be specified for {0}")]
    AmbiguousPassword(String),

    #[error("Login script could not be started for image {image}: {source}")]
    ScriptStart {
        image: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Login script failed for image {image} ({status}): {stderr}")]
    ScriptFailed {
        image: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Login script timed out for image {image} after {timeout_secs}s")]
    ScriptTimeout { image: String, timeout_secs: u64 },

    #[error("skopeo {operation} failed for {image}: {stderr}")]
    Operation {
        operation: String,
        image: String,
        stderr: String,
    },

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("{0} does not support deleting specific container images. Set keep_image to true.")]
    DeleteUnsupported(String),

    #[error("Exhausted {retries} login retries for {image}: {source}")]
    RetriesExhausted {
        image: String,
        retries: u32,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error texts that registries use for a missing image. Registry wording
/// varies per vendor, so the list is expected to grow.
const NOT_FOUND_MARKERS: &[&str] = &["manifest unknown", "name unknown", "No such image"];

/// Whether an operation failure means the image does not exist, as opposed
/// to an auth or transport problem. The underlying tooling does not expose
/// a structured status for this, so we match on the error text.
pub fn is_not_found(err: &Error) -> bool {
    if matches!(err, Error::NotFound(_)) {
        return true;
    }
    let text = err.to_string();
    NOT_FOUND_MARKERS.iter().any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation_error(stderr: &str) -> Error {
        Error::Operation {
            operation: "inspect".into(),
            image: "docker://example.com/app:latest".into(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn not_found_matches_registry_wording() {
        assert!(is_not_found(&operation_error(
            "reading manifest latest in example.com/app: manifest unknown"
        )));
        assert!(is_not_found(&operation_error(
            "requested access to the resource is denied: name unknown"
        )));
        assert!(is_not_found(&Error::NotFound("docker://example.com/app".into())));
    }

    #[test]
    fn auth_failures_are_not_not_found() {
        assert!(!is_not_found(&operation_error(
            "unauthorized: authentication required"
        )));
        assert!(!is_not_found(&operation_error("connection refused")));
    }

    #[test]
    fn timeout_and_failure_wordings_are_distinct() {
        let timeout = Error::ScriptTimeout {
            image: "docker://example.com/app".into(),
            timeout_secs: 2,
        };
        assert!(timeout.to_string().contains("timed out"));

        let failed = operation_error("boom");
        assert!(!failed.to_string().contains("timed out"));
    }
}
