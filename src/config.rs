use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::engine::{self, EngineSettings};
use crate::model::SchedulePolicy;

const PREFIX: &str = "SALONSLOT_";

/// Server settings, read once at startup from `SALONSLOT_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: SchedulePolicy,
    pub lock_timeout: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub var: String,
    pub reason: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.var, self.reason)
    }
}

impl std::error::Error for ConfigError {}

fn config_error(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        var: format!("{PREFIX}{name}"),
        reason: reason.into(),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; `lookup` receives the full variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        let number = |name: &str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| config_error(name, format!("expected a non-negative integer, got {v:?}"))),
                None => Ok(default),
            }
        };
        let port = |name: &str, default: Option<u16>| -> Result<Option<u16>, ConfigError> {
            match get(name) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| config_error(name, format!("expected a port number, got {v:?}"))),
                None => Ok(default),
            }
        };
        let clock = |name: &str, default: &str| -> Result<i32, ConfigError> {
            let v = get(name).unwrap_or_else(|| default.to_string());
            engine::parse_clock(v.trim()).map_err(|e| config_error(name, e.to_string()))
        };

        let opens_at = clock("OPENS_AT", "10:00")?;
        let closes_at = clock("CLOSES_AT", "17:00")?;
        if opens_at >= closes_at {
            return Err(config_error("CLOSES_AT", "must be later than SALONSLOT_OPENS_AT"));
        }
        let slot_minutes = number("SLOT_MINUTES", 30)?;
        if slot_minutes == 0 || slot_minutes > (closes_at - opens_at) as u64 {
            return Err(config_error(
                "SLOT_MINUTES",
                format!("must be between 1 and {}", closes_at - opens_at),
            ));
        }
        let utc_offset = parse_offset(&get("UTC_OFFSET").unwrap_or_else(|| "+08:00".into()))
            .ok_or_else(|| config_error("UTC_OFFSET", "expected an offset like +08:00"))?;

        let max_connections = number("MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(config_error("MAX_CONNECTIONS", "must be at least 1"));
        }

        let tls_cert = get("TLS_CERT");
        let tls_key = get("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(config_error(
                if tls_cert.is_some() { "TLS_KEY" } else { "TLS_CERT" },
                "both SALONSLOT_TLS_CERT and SALONSLOT_TLS_KEY must be set, or neither",
            ));
        }

        Ok(Self {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: port("PORT", Some(5433))?.unwrap_or(5433),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "salonslot".into()),
            max_connections: max_connections as usize,
            compact_threshold: number("COMPACT_THRESHOLD", 1000)?,
            metrics_port: port("METRICS_PORT", None)?,
            tls_cert,
            tls_key,
            policy: SchedulePolicy {
                opens_at,
                closes_at,
                slot_minutes: slot_minutes as i32,
                utc_offset,
            },
            lock_timeout: Duration::from_millis(number("LOCK_TIMEOUT_MS", 5000)?),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            policy: self.policy,
            lock_timeout: self.lock_timeout,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn load_tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

/// `+HH:MM`, `-HH:MM` or `Z`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    if s == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
