//! Stable per-process identity used for coordination membership and log labels.

use anyhow::Context;

/// Unique identity of one participating process: `host:pid` plus an optional
/// caller-supplied suffix. Computed once at startup and never changes for the
/// lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    host: String,
    pid: u32,
    suffix: Option<String>,
}

impl Identity {
    /// Build the identity of the local process.
    ///
    /// `domain` replaces everything after the first label of the hostname,
    /// for sites where the resolver returns a short name but peers must dial
    /// a fully qualified one.
    pub fn local(suffix: Option<&str>, domain: Option<&str>) -> anyhow::Result<Self> {
        let hostname = nix::unistd::gethostname().context("failed to read hostname")?;
        let mut host = hostname.to_string_lossy().into_owned();
        if let Some(domain) = domain {
            let short = host.split('.').next().unwrap_or(&host).to_string();
            host = format!("{short}.{domain}");
        }
        Ok(Identity {
            host,
            pid: std::process::id(),
            suffix: suffix.map(str::to_string),
        })
    }

    /// Hostname component, used as the dial target for transfer endpoints.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Extract the host part out of an encoded identity string.
    pub fn host_of(encoded: &str) -> &str {
        encoded.split(':').next().unwrap_or(encoded)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.pid)?;
        if let Some(suffix) = &self.suffix {
            write!(f, ":{suffix}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_host_pid() {
        let id = Identity::local(None, None).unwrap();
        let text = id.to_string();
        let mut parts = text.split(':');
        assert_eq!(parts.next().unwrap(), id.host());
        assert_eq!(
            parts.next().unwrap(),
            std::process::id().to_string().as_str()
        );
        assert!(parts.next().is_none());
    }

    #[test]
    fn suffix_is_appended() {
        let id = Identity::local(Some("worker-2"), None).unwrap();
        assert!(id.to_string().ends_with(":worker-2"));
    }

    #[test]
    fn domain_replaces_tail() {
        let id = Identity::local(None, Some("example.net")).unwrap();
        assert!(id.host().ends_with(".example.net"));
        assert_eq!(id.host().matches('.').count(), 2);
    }

    #[test]
    fn host_of_encoded() {
        assert_eq!(Identity::host_of("node1.example.net:4242:x"), "node1.example.net");
        assert_eq!(Identity::host_of("bare"), "bare");
    }
}
