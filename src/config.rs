//! Driver configuration.
//!
//! Connection strings use a URI-like form with every option carried as a
//! query parameter:
//!
//! ```text
//! postgres:///?host=db.internal&port=5432&dbname=app&user=app&target_session_attrs=read-write
//! ```

use std::time::Duration;

use crate::error::{Error, Result};

/// Session affinity requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionAttrs {
    /// Any server is acceptable.
    #[default]
    Any,
    /// Only a server that accepts writes.
    ReadWrite,
    /// Only a read-only server.
    ReadOnly,
}

impl SessionAttrs {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "any" => Ok(SessionAttrs::Any),
            "read-write" => Ok(SessionAttrs::ReadWrite),
            "read-only" => Ok(SessionAttrs::ReadOnly),
            other => Err(Error::Config(format!(
                "invalid target_session_attrs: {}",
                other
            ))),
        }
    }
}

/// Parsed connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
    /// Read/write session affinity.
    pub target_session_attrs: SessionAttrs,
    /// TCP connect deadline, enforced by the host pump.
    pub connect_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: None,
            application_name: None,
            target_session_attrs: SessionAttrs::Any,
            connect_timeout: None,
        }
    }
}

impl Config {
    /// Parse a connection string.
    ///
    /// Accepted schemes are `postgres` and `postgresql`. Unknown keys are
    /// rejected so that typos fail loudly instead of silently connecting to
    /// the wrong place.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("postgresql://")
            .or_else(|| uri.strip_prefix("postgres://"))
            .ok_or_else(|| Error::Config(format!("unsupported scheme in {:?}", uri)))?;

        // Authority and path are intentionally empty in this form; everything
        // lives in the query string.
        let query = match rest.find('?') {
            Some(pos) => &rest[pos + 1..],
            None => "",
        };

        let mut config = Config::default();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.find('=') {
                Some(pos) => (&pair[..pos], &pair[pos + 1..]),
                None => (pair, ""),
            };
            let value = percent_decode(value);

            match key {
                "host" => config.host = value,
                "port" => {
                    config.port = value
                        .parse::<u16>()
                        .map_err(|_| Error::Config(format!("invalid port: {}", value)))?;
                }
                "dbname" => config.dbname = value,
                "user" => config.user = value,
                "password" => config.password = Some(value),
                "application_name" => config.application_name = Some(value),
                "target_session_attrs" => {
                    config.target_session_attrs = SessionAttrs::parse(&value)?;
                }
                "connect_timeout" => {
                    let secs = value
                        .parse::<u64>()
                        .map_err(|_| Error::Config(format!("invalid connect_timeout: {}", value)))?;
                    config.connect_timeout = Some(Duration::from_secs(secs));
                }
                other => {
                    return Err(Error::Config(format!("unknown option: {}", other)));
                }
            }
        }

        Ok(config)
    }

    /// `host:port` pair for the TCP layer.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Startup parameters sent during the handshake, in wire order.
    pub(crate) fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_string(), self.user.clone()),
            ("database".to_string(), self.dbname.clone()),
        ];
        if let Some(ref name) = self.application_name {
            params.push(("application_name".to_string(), name.clone()));
        }
        match self.target_session_attrs {
            SessionAttrs::ReadOnly => {
                params.push((
                    "default_transaction_read_only".to_string(),
                    "on".to_string(),
                ));
            }
            SessionAttrs::Any | SessionAttrs::ReadWrite => {}
        }
        params
    }
}

/// Minimal percent-decoding for values embedded in the query string.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("postgres:///").unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "postgres");
        assert_eq!(config.target_session_attrs, SessionAttrs::Any);
    }

    #[test]
    fn test_full_uri() {
        let config = Config::parse(
            "postgres:///?host=db1&port=5433&dbname=app&user=svc&password=s3cret&target_session_attrs=read-write",
        )
        .unwrap();
        assert_eq!(config.host, "db1");
        assert_eq!(config.port, 5433);
        assert_eq!(config.dbname, "app");
        assert_eq!(config.user, "svc");
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.target_session_attrs, SessionAttrs::ReadWrite);
        assert_eq!(config.address(), "db1:5433");
    }

    #[test]
    fn test_postgresql_scheme_and_decoding() {
        let config = Config::parse("postgresql:///?password=p%40ss&application_name=my%20app").unwrap();
        assert_eq!(config.password.as_deref(), Some("p@ss"));
        assert_eq!(config.application_name.as_deref(), Some("my app"));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Config::parse("mysql:///?host=x").is_err());
        assert!(Config::parse("postgres:///?port=banana").is_err());
        assert!(Config::parse("postgres:///?target_session_attrs=writeish").is_err());
        assert!(Config::parse("postgres:///?hots=typo").is_err());
    }

    #[test]
    fn test_read_only_session_sets_startup_param() {
        let config = Config::parse("postgres:///?target_session_attrs=read-only").unwrap();
        let params = config.startup_params();
        assert!(params
            .iter()
            .any(|(k, v)| k == "default_transaction_read_only" && v == "on"));
    }
}
