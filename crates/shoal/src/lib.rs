//! # shoal
//!
//! Procfile supervisor core.
//!
//! Fans services out into workers, gives every worker its own port from a
//! per-service block, merges all worker output into one tagged stream and
//! relays termination signals to the whole pool.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use shoal::{registry, Formation, Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let entries = vec![
//! 	("web".to_string(), "python -m http.server $PORT".to_string()),
//! 	("worker".to_string(), "./bin/worker".to_string()),
//! ];
//! let formation: Formation = "web=2".parse().unwrap();
//! let services = registry::build(&entries, &formation, None, 100).unwrap();
//!
//! let mut sup = Supervisor::new(SupervisorConfig::default(), Box::new(std::io::stdout()));
//! sup.start(&services).unwrap();
//! let outcome = sup.run().await;
//! std::process::exit(outcome.exit_code());
//! # }
//! ```

pub mod command;
pub mod error;
pub mod output;
pub mod port;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use nix::sys::signal::Signal;

pub use error::ConfigError;
pub use output::{Multiplexer, Style};
pub use registry::Formation;
pub use supervisor::{plan, PlannedWorker, RelayHandle, Supervisor, SupervisorConfig};
pub use types::*;
