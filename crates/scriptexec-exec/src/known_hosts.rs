//! Host key trust for SSH connections

use std::path::{Path, PathBuf};

use russh::keys::ssh_key::PublicKey;
use russh::keys::{known_hosts, parse_public_key_base64};
use tracing::{debug, warn};

use crate::connection::SshConnection;
use crate::error::RunnerError;

/// How a server's host key is accepted
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Accept any key
    Insecure,
    /// Accept only keys recorded for this host in a known-hosts file
    KnownHosts {
        /// File the keys were read from
        path: PathBuf,
        /// Keys trusted for the host
        trusted: Vec<PublicKey>,
    },
}

impl HostKeyPolicy {
    /// Resolve the policy for a connection, loading the trust store if needed
    ///
    /// # Errors
    /// Returns `RunnerError::HostKey` if the home directory cannot be found or
    /// the known-hosts file cannot be read or parsed
    pub fn resolve(connection: &SshConnection) -> Result<Self, RunnerError> {
        if connection.insecure {
            warn!(host = %connection.host, "host key verification disabled");
            return Ok(HostKeyPolicy::Insecure);
        }

        let path = match &connection.known_hosts {
            Some(path) => path.clone(),
            None => default_known_hosts_path()?,
        };
        Self::load(&path, &connection.host, connection.port)
    }

    /// Load the keys recorded for `host:port` from a known-hosts file
    ///
    /// # Errors
    /// Returns `RunnerError::HostKey` if the file cannot be read or contains a
    /// malformed entry
    pub fn load(path: &Path, host: &str, port: u16) -> Result<Self, RunnerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::HostKey(format!("cannot read {}: {e}", path.display()))
        })?;
        validate(&content).map_err(|e| RunnerError::HostKey(format!("{}: {e}", path.display())))?;

        let trusted = known_hosts::known_host_keys_path(host, port, path)
            .map_err(|e| RunnerError::HostKey(format!("{}: {e}", path.display())))?
            .into_iter()
            .map(|(_, key)| key)
            .collect::<Vec<_>>();

        debug!(path = %path.display(), host, port, keys = trusted.len(), "loaded known hosts");

        Ok(HostKeyPolicy::KnownHosts {
            path: path.to_path_buf(),
            trusted,
        })
    }

    /// Check a server key against the policy
    #[must_use]
    pub fn accepts(&self, key: &PublicKey) -> bool {
        match self {
            HostKeyPolicy::Insecure => true,
            HostKeyPolicy::KnownHosts { trusted, .. } => trusted
                .iter()
                .any(|known| known.key_data() == key.key_data()),
        }
    }
}

/// `~/.ssh/known_hosts` of the current user
///
/// # Errors
/// Returns `RunnerError::HostKey` if the home directory is unknown
pub fn default_known_hosts_path() -> Result<PathBuf, RunnerError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .ok_or_else(|| {
            RunnerError::HostKey("cannot find home directory of current user".to_string())
        })
}

/// Every entry must be `[marker] hosts keytype base64-key [comment]`
fn validate(content: &str) -> Result<(), String> {
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        if line.starts_with('@') {
            fields.next();
        }
        let (Some(_hosts), Some(_key_type), Some(key)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(format!("line {}: incomplete entry", index + 1));
        };
        parse_public_key_base64(key).map_err(|e| format!("line {}: bad key: {e}", index + 1))?;
    }
    Ok(())
}
