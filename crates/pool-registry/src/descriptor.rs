//! Connection descriptors: target parameters and SSL negotiation.
//!
//! A [`BackendTarget`] is what the caller supplies for one acquisition. The
//! DSN builder turns it into a [`ConnectionDescriptor`], mapping the boolean
//! encryption flag to an [`SslMode`] through an [`SslModeMapping`]. The
//! password travels inside a [`Secret`] and never appears in `Debug` or
//! `Display` output.

use std::fmt;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Placeholder printed wherever a password would appear.
const REDACTED: &str = "***";

/// Transport security posture negotiated with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Plaintext only.
    Disable,
    /// Use TLS when the server offers it, fall back to plaintext otherwise.
    Prefer,
    /// Refuse to connect without TLS.
    Require,
}

impl SslMode {
    /// libpq `sslmode` keyword value.
    pub fn as_postgres(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
        }
    }

    /// MySQL `ssl-mode` option value.
    pub fn as_mysql(&self) -> &'static str {
        match self {
            SslMode::Disable => "DISABLED",
            SslMode::Prefer => "PREFERRED",
            SslMode::Require => "REQUIRED",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_postgres())
    }
}

/// Maps the caller's "use encryption" flag to an [`SslMode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslModeMapping {
    /// Mode used when encryption is requested (default: `require`).
    pub encrypted: SslMode,
    /// Mode used when encryption is not requested (default: `prefer`).
    pub unencrypted: SslMode,
}

impl Default for SslModeMapping {
    fn default() -> Self {
        Self {
            encrypted: SslMode::Require,
            unencrypted: SslMode::Prefer,
        }
    }
}

impl SslModeMapping {
    pub fn resolve(&self, use_encryption: bool) -> SslMode {
        if use_encryption {
            self.encrypted
        } else {
            self.unencrypted
        }
    }
}

/// A credential that must not end up in logs.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw value, for handing to a driver.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Caller-supplied parameters for one acquisition.
///
/// Not retained by the registry past the call that receives it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Secret,
    pub use_encryption: bool,
}

impl BackendTarget {
    pub fn new(host: &str, port: u16, database: &str, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: Secret::new(password),
            use_encryption: false,
        }
    }

    /// Builder method: request mandatory encryption.
    pub fn with_encryption(self, use_encryption: bool) -> Self {
        Self {
            use_encryption,
            ..self
        }
    }
}

/// Everything a backend needs to open a pool.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub kind: BackendKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Secret,
    pub ssl_mode: SslMode,
}

impl ConnectionDescriptor {
    /// Build a descriptor for `kind` from a caller target.
    ///
    /// Pure: the same inputs always yield the same descriptor.
    pub fn build(kind: BackendKind, target: &BackendTarget, mapping: &SslModeMapping) -> Self {
        Self {
            kind,
            host: target.host.clone(),
            port: target.port,
            database: target.database.clone(),
            user: target.user.clone(),
            password: target.password.clone(),
            ssl_mode: mapping.resolve(target.use_encryption),
        }
    }

    /// Render the DSN including the password. `Display` gives the redacted
    /// form that the engine logs.
    #[cfg(test)]
    pub(crate) fn expose_dsn(&self) -> String {
        self.render(self.password.expose())
    }

    /// Postgres gets a libpq keyword/value string, MySQL a URL.
    fn render(&self, password: &str) -> String {
        match self.kind {
            BackendKind::Postgres => format!(
                "host={} port={} dbname={} user={} password={} sslmode={}",
                quote_keyword_value(&self.host),
                self.port,
                quote_keyword_value(&self.database),
                quote_keyword_value(&self.user),
                quote_keyword_value(password),
                self.ssl_mode.as_postgres(),
            ),
            BackendKind::MySql => format!(
                "mysql://{}:{}@{}:{}/{}?ssl-mode={}",
                utf8_percent_encode(&self.user, NON_ALPHANUMERIC),
                utf8_percent_encode(password, NON_ALPHANUMERIC),
                url_host(&self.host),
                self.port,
                utf8_percent_encode(&self.database, NON_ALPHANUMERIC),
                self.ssl_mode.as_mysql(),
            ),
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(REDACTED))
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// IPv6 literals need brackets inside a URL authority.
fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Quote a libpq keyword value when it is empty or contains spaces, quotes
/// or backslashes.
fn quote_keyword_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}
