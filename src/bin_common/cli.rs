//! CLI utilities for binaries
//!
//! Handles configuration paths and environment variables
//! for all binary executables.

use std::path::PathBuf;

/// Type of configuration to load
#[derive(Debug, Clone)]
pub enum ConfigType {
    /// Client configuration (config/client.yaml)
    Client,
    /// Server configuration (config/server.yaml)
    Server,
    /// Custom path
    Custom(String),
}

impl ConfigType {
    /// Get the default path for this config type
    pub fn default_path(&self) -> &str {
        match self {
            ConfigType::Client => "config/client.yaml",
            ConfigType::Server => "config/server.yaml",
            ConfigType::Custom(path) => path,
        }
    }

    /// Get the environment variable name for this config type
    pub fn env_var_name(&self) -> &str {
        match self {
            ConfigType::Client => "WSMUX_CLIENT_CONFIG",
            ConfigType::Server => "WSMUX_SERVER_CONFIG",
            ConfigType::Custom(_) => "WSMUX_CONFIG",
        }
    }
}

/// Load configuration path from environment or use default
///
/// A custom path always wins over the environment.
pub fn load_config_from_env(config_type: ConfigType) -> PathBuf {
    if let ConfigType::Custom(path) = &config_type {
        return PathBuf::from(path);
    }
    std::env::var(config_type.env_var_name())
        .unwrap_or_else(|_| config_type.default_path().to_string())
        .into()
}

/// Read a `.env` file from the working directory, if there is one
pub fn load_dotenv() {
    dotenv::dotenv().ok();
}

/// Parse command line arguments for a binary
///
/// Returns a vector of arguments (excluding the program name)
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_type_paths() {
        assert_eq!(ConfigType::Client.default_path(), "config/client.yaml");
        assert_eq!(ConfigType::Server.default_path(), "config/server.yaml");

        let custom = ConfigType::Custom("custom/path.yaml".to_string());
        assert_eq!(custom.default_path(), "custom/path.yaml");
    }

    #[test]
    fn test_config_type_env_vars() {
        assert_eq!(ConfigType::Client.env_var_name(), "WSMUX_CLIENT_CONFIG");
        assert_eq!(ConfigType::Server.env_var_name(), "WSMUX_SERVER_CONFIG");
    }
}
