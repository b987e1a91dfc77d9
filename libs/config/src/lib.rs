//! # Switchboard Queue Configuration
//!
//! Options and routes for queue clients and servers.
//!
//! ## Features
//!
//! - **Routes**: broker endpoint plus queue name, grouped into per-environment sets
//! - **Options**: sender/receiver tuning with millisecond durations
//! - **Selection**: first-match route-set selection by environment and machine name
//! - **Loading**: TOML files with environment-specific files and `SWITCHBOARD__` overrides
//!
//! ## Usage
//!
//! ```no_run
//! use queue_config::{select, SelectionContext, SwitchboardConfig};
//!
//! let config = SwitchboardConfig::load(None, Some("prod")).unwrap();
//! let client = config.client("orders").unwrap();
//! let routes = select(&client.routes, &SelectionContext::from_env());
//! ```

pub mod options;
pub mod routes;
pub mod selection;
pub mod switchboard_config;

// Re-export commonly used types
pub use options::{ClientOptions, ReceiverOptions, SenderOptions, ServerOptions, ServerRole};
pub use routes::{ClientRouteSet, RouteDescriptor, ServerRouteSet};
pub use selection::{select, Selectable, SelectionContext};
pub use switchboard_config::{load_config, SwitchboardConfig};
