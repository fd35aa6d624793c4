//! Runtime defaults for the link.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `DMALINK_`) or command-line flags in the binaries.

use std::time::Duration;

/// Default TCP port for the out-of-band rendezvous.
pub const DEFAULT_PORT: u16 = 20000;

/// Default transfer buffer size (4 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on completion queue poll attempts for one work request.
pub const POLL_ATTEMPTS: u32 = 1_000_000;

/// Yield interval between empty completion queue polls.
pub const POLL_INTERVAL: Duration = Duration::from_micros(1);

/// Link setup parameters shared by the client and server binaries.
#[derive(Debug, Clone)]
pub struct Config {
    /// Rendezvous port (connect target for the client, listen port for the server).
    pub port: u16,

    /// RDMA device name; `None` selects the first available device.
    pub device: Option<String>,

    /// Size of the single registered transfer buffer, in bytes.
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            device: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `DMALINK_PORT`
    /// - `DMALINK_DEVICE`
    /// - `DMALINK_BUFFER_SIZE`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("DMALINK_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                cfg.port = p;
            }
        }
        if let Ok(v) = std::env::var("DMALINK_DEVICE") {
            if !v.is_empty() {
                cfg.device = Some(v);
            }
        }
        if let Ok(v) = std::env::var("DMALINK_BUFFER_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.buffer_size = n;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 20000);
        assert_eq!(cfg.buffer_size, 4 * 1024 * 1024);
        assert!(cfg.device.is_none());
    }

    #[test]
    fn test_from_env_overrides_port() {
        std::env::set_var("DMALINK_PORT", "21500");
        let cfg = Config::from_env();
        assert_eq!(cfg.port, 21500);
        std::env::remove_var("DMALINK_PORT");
    }
}
