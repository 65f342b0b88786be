use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;


pub const ENV_NETWORK_TIMEOUT_MS: &str = "MASTERLINK_NETWORK_TIMEOUT_MS";
pub const ENV_CLOSE_IDLE_CONNECTIONS: &str = "MASTERLINK_CLOSE_IDLE_CONNECTIONS";
pub const ENV_MAX_FRAME_SIZE: &str = "MASTERLINK_MAX_FRAME_SIZE";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "MASTERLINK_CONNECT_TIMEOUT_MS";
pub const ENV_REGISTRATION_RETRIES: &str = "MASTERLINK_REGISTRATION_RETRIES";
pub const ENV_REGISTRATION_RETRY_INTERVAL_MS: &str = "MASTERLINK_REGISTRATION_RETRY_INTERVAL_MS";


#[derive(Debug, Clone)]
pub struct TransportConf {
    /// A connection that had no I/O for this long gets an idle signal. If requests are outstanding
    ///  and the most recent request is older than this, the connection is considered dead.
    ///
    /// This is configured in milliseconds.
    pub request_timeout: Duration,
    /// close connections that are idle for `request_timeout` even if there are no outstanding
    ///  requests on them
    pub close_idle_connections: bool,
    /// upper bound for a single frame's body - a peer announcing a bigger frame is treated as
    ///  compromised, and the connection is closed
    pub max_frame_size: usize,
    pub connect_timeout: Duration,
}

impl TransportConf {
    pub fn new() -> TransportConf {
        TransportConf {
            request_timeout: Duration::from_millis(120_000),
            close_idle_connections: false,
            max_frame_size: 16*1024*1024,
            connect_timeout: Duration::from_millis(120_000),
        }
    }

    pub fn from_env() -> anyhow::Result<TransportConf> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, falling back to defaults for keys that are not present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<TransportConf> {
        let defaults = Self::new();
        let result = TransportConf {
            request_timeout: millis_or(&lookup, ENV_NETWORK_TIMEOUT_MS, defaults.request_timeout)?,
            close_idle_connections: parse_or(&lookup, ENV_CLOSE_IDLE_CONNECTIONS, defaults.close_idle_connections)?,
            max_frame_size: parse_or(&lookup, ENV_MAX_FRAME_SIZE, defaults.max_frame_size)?,
            connect_timeout: millis_or(&lookup, ENV_CONNECT_TIMEOUT_MS, defaults.connect_timeout)?,
        };
        // the length prefix on the wire is a u32
        if u32::try_from(result.max_frame_size).is_err() {
            anyhow::bail!("{} must not exceed {}", ENV_MAX_FRAME_SIZE, u32::MAX);
        }
        Ok(result)
    }
}

impl Default for TransportConf {
    fn default() -> Self {
        Self::new()
    }
}


#[derive(Debug, Clone)]
pub struct AppClientConf {
    /// The registration client gives up and declares its session dead after this many attempts
    ///  without an answer from the master.
    pub max_registration_retries: u32,
    /// time to wait for the master's answer before the next registration attempt
    pub registration_retry_interval: Duration,
}

impl AppClientConf {
    pub fn new() -> AppClientConf {
        AppClientConf {
            max_registration_retries: 3,
            registration_retry_interval: Duration::from_secs(20),
        }
    }

    pub fn from_env() -> anyhow::Result<AppClientConf> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<AppClientConf> {
        let defaults = Self::new();
        let result = AppClientConf {
            max_registration_retries: parse_or(&lookup, ENV_REGISTRATION_RETRIES, defaults.max_registration_retries)?,
            registration_retry_interval: millis_or(&lookup, ENV_REGISTRATION_RETRY_INTERVAL_MS, defaults.registration_retry_interval)?,
        };
        if result.max_registration_retries == 0 {
            anyhow::bail!("{} must be at least 1", ENV_REGISTRATION_RETRIES);
        }
        Ok(result)
    }
}

impl Default for AppClientConf {
    fn default() -> Self {
        Self::new()
    }
}


fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse()
            .with_context(|| format!("invalid value {:?} for {}", raw, key)),
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> anyhow::Result<Duration> {
    let millis = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
