//! Server configuration and the parsers for its flag values

use crate::error::{Error, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Everything the server needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub rules_file: PathBuf,
    pub poll_interval: Duration,
    /// Enables HTTPS when set
    pub cert_cache: Option<PathBuf>,
    pub metrics_addr: Option<SocketAddr>,
}

impl ServerConfig {
    pub fn new(rules_file: impl Into<PathBuf>) -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            https_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            rules_file: rules_file.into(),
            poll_interval: Duration::from_secs(10),
            cert_cache: None,
            metrics_addr: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive".to_string()));
        }
        if self.rules_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("rule file is required".to_string()));
        }
        if self.cert_cache.is_some() && self.http_addr == self.https_addr {
            return Err(Error::InvalidConfig(format!(
                "HTTP and HTTPS cannot share {}",
                self.http_addr
            )));
        }
        Ok(())
    }
}

/// Parse a listen address; a leading `:` means all interfaces (`:8080`)
pub fn parse_listen_addr(text: &str) -> Result<SocketAddr> {
    let text = text.trim();
    let full = if text.starts_with(':') {
        format!("0.0.0.0{}", text)
    } else {
        text.to_string()
    };

    full.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::InvalidConfig(format!("bad listen address {:?}", text)))
}

/// Parse a poll interval such as `10s`, `500ms`, `2m`, `1h`, or bare seconds
pub fn parse_interval(text: &str) -> Result<Duration> {
    let text = text.trim();
    let bad = || Error::InvalidConfig(format!("bad interval {:?}", text));

    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().map_err(|_| bad())?;

    let interval = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(bad)?),
        "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(bad)?),
        _ => return Err(bad()),
    };

    if interval.is_zero() {
        return Err(Error::InvalidConfig("poll interval must be positive".to_string()));
    }
    Ok(interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(parse_listen_addr(":8080").unwrap(), SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert_eq!(
            parse_listen_addr("127.0.0.1:80").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 80))
        );
        assert!(parse_listen_addr("not an address").is_err());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_interval("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_interval("7").unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn test_parse_interval_rejects_zero_and_junk() {
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("-5s").is_err());
        assert!(parse_interval("10 parsecs").is_err());
        assert!(parse_interval("").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = ServerConfig::new("rules.json");
        assert!(config.validate().is_ok());

        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::new("rules.json");
        config.cert_cache = Some(PathBuf::from("certs"));
        config.https_addr = config.http_addr;
        assert!(config.validate().is_err());
    }
}
