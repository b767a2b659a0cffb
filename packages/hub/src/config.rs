//! Hub CLI arguments and runtime configuration.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "hub", version, about = "LAN peer-to-peer file transfer signaling and relay hub")]
pub struct Args {
    /// Address to bind the HTTP/WebSocket listener on.
    #[arg(long, default_value = "0.0.0.0", env = "HUB_BIND_ADDR")]
    pub bind_addr: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8787, env = "HUB_PORT")]
    pub port: u16,

    /// Device liveness window in seconds.
    #[arg(long, default_value_t = 300, env = "HUB_LIVENESS_SECS")]
    pub liveness_secs: i64,

    /// Background sweep interval in seconds (expires offline devices and
    /// stale relay entries).
    #[arg(long, default_value_t = 15, env = "HUB_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: u64,

    /// Maximum payload size accepted by the relay upload endpoint, in bytes.
    #[arg(long, default_value_t = 2 * 1024 * 1024 * 1024, env = "HUB_MAX_RELAY_BYTES")]
    pub max_relay_bytes: u64,

    /// Seconds of upload inactivity before the connection is treated as
    /// stalled.
    #[arg(long, default_value_t = 30, env = "HUB_UPLOAD_IDLE_TIMEOUT_SECS")]
    pub upload_idle_timeout_secs: u64,

    /// History entries returned per device by `GET /api/transfers/{id}`.
    #[arg(long, default_value_t = 10, env = "HUB_HISTORY_LIMIT")]
    pub history_limit: usize,
}

/// Runtime configuration threaded through the hub's shared state. A subset
/// of `Args`, stripped of bind address/port, which only `main` needs.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub liveness_secs: i64,
    pub sweep_interval_secs: u64,
    pub max_relay_bytes: u64,
    pub upload_idle_timeout_secs: u64,
    pub history_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            liveness_secs: 300,
            sweep_interval_secs: 15,
            max_relay_bytes: 2 * 1024 * 1024 * 1024,
            upload_idle_timeout_secs: 30,
            history_limit: 10,
        }
    }
}

impl From<&Args> for HubConfig {
    fn from(args: &Args) -> Self {
        Self {
            liveness_secs: args.liveness_secs,
            sweep_interval_secs: args.sweep_interval_secs,
            max_relay_bytes: args.max_relay_bytes,
            upload_idle_timeout_secs: args.upload_idle_timeout_secs,
            history_limit: args.history_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_windows() {
        let config = HubConfig::default();
        assert_eq!(config.liveness_secs, 300);
        assert_eq!(config.upload_idle_timeout_secs, 30);
        assert_eq!(config.max_relay_bytes, 2 * 1024 * 1024 * 1024);
    }
}
