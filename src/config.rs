//! Server configuration.

use std::path::PathBuf;

use crate::error::{Result, RfbError};

/// Default RFB listen port.
pub const DEFAULT_PORT: u16 = 5900;

/// Configuration record for an RFB server instance.
///
/// Every option has a default; construct with `ServerConfig::default()` and
/// override fields as needed. `validate()` is called by the server before
/// binding, so invalid values surface as a `Config` error rather than
/// misbehavior at runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// TCP listen port.
    pub port: u16,
    /// Whether clients must pass VNC authentication.
    pub auth_required: bool,
    /// Maximum number of simultaneously connected clients.
    pub max_connections: usize,
    /// Screen sampling rate in Hz (1..=60).
    pub frame_rate: u32,
    /// Framebuffer width used when no real display adapter is attached.
    pub screen_width: u16,
    /// Framebuffer height used when no real display adapter is attached.
    pub screen_height: u16,
    /// Path of the persisted user table.
    pub user_file: PathBuf,
    /// Desktop name sent in ServerInit.
    pub desktop_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            auth_required: true,
            max_connections: 5,
            frame_rate: 10,
            screen_width: 1024,
            screen_height: 768,
            user_file: default_user_file(),
            desktop_name: "RFB Server".to_string(),
        }
    }
}

impl ServerConfig {
    /// Checks that every option is within its documented range.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(RfbError::Config("port must be in 1..=65535".into()));
        }
        if self.max_connections == 0 {
            return Err(RfbError::Config("max_connections must be at least 1".into()));
        }
        if !(1..=60).contains(&self.frame_rate) {
            return Err(RfbError::Config(format!(
                "frame_rate {} out of range 1..=60",
                self.frame_rate
            )));
        }
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(RfbError::Config("screen dimensions must be non-zero".into()));
        }
        if self.desktop_name.len() > u16::MAX as usize {
            return Err(RfbError::Config("desktop_name too long".into()));
        }
        Ok(())
    }
}

/// Platform-appropriate default location for the user table.
fn default_user_file() -> PathBuf {
    match dirs::data_dir() {
        Some(dir) => dir.join("rfbserver").join("users.txt"),
        None => PathBuf::from("rfbserver_users.txt"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 5900);
        assert!(config.auth_required);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.frame_rate, 10);
        assert_eq!((config.screen_width, config.screen_height), (1024, 768));
    }

    #[test]
    fn rejects_out_of_range_options() {
        let mut config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        config.port = 5900;
        config.max_connections = 0;
        assert!(config.validate().is_err());

        config.max_connections = 1;
        config.frame_rate = 61;
        assert!(config.validate().is_err());

        config.frame_rate = 60;
        config.screen_width = 0;
        assert!(config.validate().is_err());
    }
}
