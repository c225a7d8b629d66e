//! Connection URLs
//!
//! Parses `zk://[user:pass@]host[,host...]/path` into its parts.

use std::fmt;

use crate::error::{FlockError, Result};
use crate::zk::Authentication;

/// A parsed coordination-service URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkUrl {
    /// Comma-separated `host:port` list.
    pub servers: String,
    /// Absolute path of the group node (the chroot).
    pub path: String,
    /// Credentials, when the URL carried a `user:pass@` authority prefix.
    pub auth: Option<Authentication>,
}

pub const SCHEME: &str = "zk://";

impl ZkUrl {
    /// Parses a `zk://` URL.
    ///
    /// The path defaults to `/` when absent; whether `/` is acceptable is
    /// the caller's decision.
    pub fn parse(url: &str) -> Result<ZkUrl> {
        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid(url, "expected 'zk://' scheme"))?;

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };

        let (auth, servers) = match authority.rfind('@') {
            Some(index) => {
                let credentials = &authority[..index];
                if !credentials.contains(':') {
                    return Err(invalid(url, "expected 'user:pass' credentials"));
                }
                (
                    Some(Authentication::digest(credentials)),
                    &authority[index + 1..],
                )
            }
            None => (None, authority),
        };

        if servers.is_empty() {
            return Err(invalid(url, "expected at least one host"));
        }

        // A trailing slash is insignificant; normalize it away.
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };

        Ok(ZkUrl {
            servers: servers.to_string(),
            path: path.to_string(),
            auth,
        })
    }
}

impl fmt::Display for ZkUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.auth.is_some() {
            write!(f, "{}<credentials>@{}{}", SCHEME, self.servers, self.path)
        } else {
            write!(f, "{}{}{}", SCHEME, self.servers, self.path)
        }
    }
}

fn invalid(url: &str, reason: &str) -> FlockError {
    FlockError::InvalidSpec {
        reason: format!("{reason} in '{url}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hosts_and_path() {
        let url = ZkUrl::parse("zk://host1:2181,host2:2181/flock/leader").unwrap();
        assert_eq!(url.servers, "host1:2181,host2:2181");
        assert_eq!(url.path, "/flock/leader");
        assert!(url.auth.is_none());
    }

    #[test]
    fn parses_credentials() {
        let url = ZkUrl::parse("zk://user:pass@host:2181/flock").unwrap();
        let auth = url.auth.unwrap();
        assert_eq!(auth.scheme, "digest");
        assert_eq!(auth.credentials, "user:pass");
        assert_eq!(url.servers, "host:2181");
    }

    #[test]
    fn defaults_to_root_path() {
        let url = ZkUrl::parse("zk://host:2181").unwrap();
        assert_eq!(url.path, "/");
    }

    #[test]
    fn strips_trailing_slash() {
        let url = ZkUrl::parse("zk://host:2181/flock/").unwrap();
        assert_eq!(url.path, "/flock");
    }

    #[test]
    fn rejects_missing_scheme_and_hosts() {
        assert!(ZkUrl::parse("http://host/flock").is_err());
        assert!(ZkUrl::parse("zk:///flock").is_err());
        assert!(ZkUrl::parse("zk://user@host/flock").is_err());
    }

    #[test]
    fn display_redacts_credentials() {
        let url = ZkUrl::parse("zk://user:secret@host:2181/flock").unwrap();
        assert!(!url.to_string().contains("secret"));
    }
}
