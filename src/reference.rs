//! Transport-qualified image references as understood by skopeo.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

/// A storage/transport backend for container images.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum Transport {
    /// A remote registry (`docker://`)
    Registry,
    /// A local OCI layout directory (`oci:`)
    OciDir,
    /// A local OCI archive tarball (`oci-archive:`)
    OciArchive,
    /// A local Docker archive tarball (`docker-archive:`)
    DockerArchive,
    /// Local container storage (`containers-storage:`)
    ContainerStorage,
    /// Local directory (`dir:`)
    Dir,
    /// Local Docker daemon (`docker-daemon:`)
    DockerDaemon,
}

impl Transport {
    const DOCKER_STR: &'static str = "docker";
    const OCI_STR: &'static str = "oci";
    const OCI_ARCHIVE_STR: &'static str = "oci-archive";
    const DOCKER_ARCHIVE_STR: &'static str = "docker-archive";
    const CONTAINERS_STORAGE_STR: &'static str = "containers-storage";
    const DIR_STR: &'static str = "dir";
    const DOCKER_DAEMON_STR: &'static str = "docker-daemon";
}

impl TryFrom<&str> for Transport {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        Ok(match value {
            Self::DOCKER_STR => Self::Registry,
            Self::OCI_STR => Self::OciDir,
            Self::OCI_ARCHIVE_STR => Self::OciArchive,
            Self::DOCKER_ARCHIVE_STR => Self::DockerArchive,
            Self::CONTAINERS_STORAGE_STR => Self::ContainerStorage,
            Self::DIR_STR => Self::Dir,
            Self::DOCKER_DAEMON_STR => Self::DockerDaemon,
            o => return Err(format!("unknown transport '{o}'")),
        })
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registry => "docker://",
            Self::OciDir => "oci:",
            Self::OciArchive => "oci-archive:",
            Self::DockerArchive => "docker-archive:",
            Self::ContainerStorage => "containers-storage:",
            Self::Dir => "dir:",
            Self::DockerDaemon => "docker-daemon:",
        };
        f.write_str(s)
    }
}

/// A parsed image reference, e.g. `docker://ghcr.io/org/app:latest`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ImageRef {
    pub transport: Transport,
    /// Transport-specific remainder (repository path, directory, archive).
    pub name: String,
}

impl ImageRef {
    /// The registry host to authenticate against, e.g. `ghcr.io` or
    /// `127.0.0.1:5000`. Only registry-backed references have one; short
    /// names without a host normalize to `docker.io`.
    pub fn registry(&self) -> Option<&str> {
        if self.transport != Transport::Registry {
            return None;
        }
        let host = match self.name.split_once('/') {
            Some((host, _)) => host,
            None => return Some("docker.io"),
        };
        if host == "localhost" || host.contains('.') || host.contains(':') {
            Some(host)
        } else {
            Some("docker.io")
        }
    }
}

impl TryFrom<&str> for ImageRef {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidReference {
            reference: value.to_string(),
            reason,
        };
        let (transport_name, mut name) = value
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' transport separator".into()))?;
        let transport = Transport::try_from(transport_name).map_err(|reason| invalid(reason))?;
        if transport == Transport::Registry {
            name = name
                .strip_prefix("//")
                .ok_or_else(|| invalid("missing '//' after 'docker:'".into()))?;
        }
        if name.is_empty() {
            return Err(invalid("empty image name".into()));
        }
        Ok(Self {
            transport,
            name: name.to_string(),
        })
    }
}

impl FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.transport, self.name)
    }
}

lazy_static! {
    /// GitHub Container Registry, with or without a transport prefix.
    /// Anchored so mirrored paths like `docker://mirror/ghcr.io/...` do
    /// not match.
    static ref GHCR: Regex = Regex::new(r"^(?:[a-zA-Z0-9+.-]+://)?ghcr\.io/").unwrap();
}

/// GitHub's registry does not allow deleting individual images via the
/// registry API, so deletion has to be refused up front.
pub fn is_ghcr(reference: &str) -> bool {
    GHCR.is_match(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_supported_transports() {
        let cases = [
            ("docker://ghcr.io/org/app:v1", Transport::Registry, "ghcr.io/org/app:v1"),
            ("oci:/tmp/layout:tag", Transport::OciDir, "/tmp/layout:tag"),
            ("oci-archive:/tmp/app.tar", Transport::OciArchive, "/tmp/app.tar"),
            ("docker-archive:/tmp/app.tar", Transport::DockerArchive, "/tmp/app.tar"),
            ("containers-storage:app:v1", Transport::ContainerStorage, "app:v1"),
            ("dir:/tmp/app", Transport::Dir, "/tmp/app"),
            ("docker-daemon:app:v1", Transport::DockerDaemon, "app:v1"),
        ];
        for (input, transport, name) in cases {
            let parsed = ImageRef::try_from(input).unwrap();
            assert_eq!(parsed.transport, transport, "{input}");
            assert_eq!(parsed.name, name, "{input}");
            assert_eq!(parsed.to_string(), input, "{input}");
        }
    }

    #[test]
    fn rejects_malformed_references() {
        for input in ["", "no-transport", "bogus://x", "docker:missing-slashes", "docker://", "dir:"] {
            assert!(ImageRef::try_from(input).is_err(), "{input}");
        }
    }

    #[test]
    fn registry_host_normalization() {
        let host = |s: &str| ImageRef::try_from(s).unwrap().registry().map(str::to_string);
        assert_eq!(host("docker://ghcr.io/org/app:v1"), Some("ghcr.io".into()));
        assert_eq!(host("docker://127.0.0.1:5000/app"), Some("127.0.0.1:5000".into()));
        assert_eq!(host("docker://localhost/app"), Some("localhost".into()));
        assert_eq!(host("docker://library/ubuntu"), Some("docker.io".into()));
        assert_eq!(host("docker://ubuntu:latest"), Some("docker.io".into()));
        assert_eq!(host("dir:/tmp/app"), None);
    }

    #[test]
    fn ghcr_matching_is_anchored() {
        assert!(is_ghcr("docker://ghcr.io/external-secrets/external-secrets"));
        assert!(is_ghcr("ghcr.io/external-secrets/external-secrets"));
        assert!(!is_ghcr("docker://mirror/ghcr.io/external-secrets"));
        assert!(!is_ghcr("docker://quay.io/org/app"));
        assert!(!is_ghcr("oci:ghcr.io/layout"));
    }
}
