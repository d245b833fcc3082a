//! Connection descriptors selecting a runner backend

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::RunnerError;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Which backend runs the script, and how to reach it
///
/// Parsed from any map whose `type` entry is `local` or `ssh`. Keys and the
/// `type` value are matched case-insensitively, and scalar fields may be
/// given as strings, so both typed config and string maps are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Connection {
    /// Run as a local child process
    Local(LocalConnection),
    /// Run over an SSH session
    Ssh(SshConnection),
}

/// Local execution carries no settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalConnection;

/// SSH endpoint and credentials
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SshConnection {
    /// Host address
    pub host: String,
    /// Port (default 22)
    pub port: u16,
    /// Username
    pub user: String,
    /// Password for password authentication
    pub password: String,
    /// Skip host key verification entirely
    pub insecure: bool,
    /// Known-hosts file, defaults to `~/.ssh/known_hosts`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,
    /// Seconds to wait for the TCP connection and handshake
    pub connect_timeout_secs: u64,
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("known_hosts", &self.known_hosts)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl SshConnection {
    /// Create connection settings with password authentication
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            password: password.into(),
            insecure: false,
            known_hosts: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Accept any host key
    #[must_use]
    pub fn insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    /// Verify host keys against a specific known-hosts file
    #[must_use]
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Set connect timeout, rounded up to whole seconds
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self.connect_timeout_secs = secs.max(1);
        self
    }

    /// Connect timeout as a duration, never zero
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// `host:port` string for logging
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn from_fields(fields: &HashMap<String, Value>) -> Result<Self, RunnerError> {
        let host = string_field(fields, "host")?
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RunnerError::InvalidConnection("ssh connection needs a host".to_string()))?;
        let user = string_field(fields, "user")?
            .ok_or_else(|| RunnerError::InvalidConnection("ssh connection needs a user".to_string()))?;

        Ok(Self {
            host,
            port: number_field(fields, "port")?.unwrap_or(DEFAULT_SSH_PORT),
            user,
            password: string_field(fields, "password")?.unwrap_or_default(),
            insecure: bool_field(fields, "insecure")?.unwrap_or(false),
            known_hosts: string_field(fields, "known_hosts")?.map(PathBuf::from),
            connect_timeout_secs: match number_field::<u64>(fields, "connect_timeout_secs")? {
                Some(0) => {
                    return Err(RunnerError::InvalidConnection(
                        "connect_timeout_secs must be at least 1".to_string(),
                    ));
                }
                Some(secs) => secs,
                None => DEFAULT_CONNECT_TIMEOUT_SECS,
            },
        })
    }
}

impl Connection {
    /// Local process connection
    #[must_use]
    pub fn local() -> Self {
        Connection::Local(LocalConnection)
    }

    /// Backend name, matching the `type` discriminator
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Connection::Local(_) => "local",
            Connection::Ssh(_) => "ssh",
        }
    }

    /// Parse a descriptor from a generic value
    ///
    /// # Errors
    /// Returns `RunnerError::UnknownConnectionType` if `type` is missing or not
    /// a known backend, and `RunnerError::InvalidConnection` if the value is
    /// not a map or a backend field is malformed
    pub fn from_value(value: Value) -> Result<Self, RunnerError> {
        let Value::Object(map) = value else {
            return Err(RunnerError::InvalidConnection(format!(
                "expected a map, found {value}"
            )));
        };
        let fields: HashMap<String, Value> = map
            .into_iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();

        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.to_ascii_lowercase(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

        match kind.as_str() {
            "local" => Ok(Connection::Local(LocalConnection)),
            "ssh" => SshConnection::from_fields(&fields).map(Connection::Ssh),
            _ => Err(RunnerError::UnknownConnectionType(kind)),
        }
    }

    /// Parse a descriptor from a string-keyed map of strings
    ///
    /// # Errors
    /// Same as [`Connection::from_value`]
    pub fn from_map<K, V, S>(map: &HashMap<K, V, S>) -> Result<Self, RunnerError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let object = map
            .iter()
            .map(|(k, v)| (k.as_ref().to_string(), Value::String(v.as_ref().to_string())))
            .collect();
        Self::from_value(Value::Object(object))
    }
}

impl From<SshConnection> for Connection {
    fn from(connection: SshConnection) -> Self {
        Connection::Ssh(connection)
    }
}

impl<'de> Deserialize<'de> for Connection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Connection::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn string_field(fields: &HashMap<String, Value>, key: &str) -> Result<Option<String>, RunnerError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(RunnerError::InvalidConnection(format!(
            "{key} must be a string, found {other}"
        ))),
    }
}

fn number_field<T>(fields: &HashMap<String, Value>, key: &str) -> Result<Option<T>, RunnerError>
where
    T: TryFrom<u64> + std::str::FromStr,
{
    let invalid = |found: &dyn fmt::Display| {
        RunnerError::InvalidConnection(format!("{key} must be a port-sized number, found {found}"))
    };

    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| T::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(n)),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid(s)),
        Some(other) => Err(invalid(other)),
    }
}

fn bool_field(fields: &HashMap<String, Value>, key: &str) -> Result<Option<bool>, RunnerError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" | "" => Ok(Some(false)),
            _ => Err(RunnerError::InvalidConnection(format!(
                "{key} must be a boolean, found {s:?}"
            ))),
        },
        Some(other) => Err(RunnerError::InvalidConnection(format!(
            "{key} must be a boolean, found {other}"
        ))),
    }
}
