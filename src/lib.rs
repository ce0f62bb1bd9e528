//! wsmux tools - command-line front ends for the wsmux library
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (config paths, logging, shutdown)
//! - **wsmux**: WebSocket connection management (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use wsmux_tools::bin_common::{load_config_from_env, ConfigType};
//! use wsmux_tools::wsmux::{Server, ServerOptions};
//! ```

// Re-export workspace libraries for convenience
pub use wsmux;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod runner;

    pub use cli::{load_config_from_env, load_dotenv, parse_args, ConfigType};
    pub use runner::{init_tracing, print_banner, print_shutdown, RunConfig, ShutdownManager};
}
