//! teleconsole client: broadcast a terminal session through a disposable SSH
//! proxy, or join somebody else's.

pub mod api;
pub mod broadcast;
pub mod cli;
pub mod conf;
pub mod join;
pub mod site;
pub mod ssh;

pub use api::ApiClient;
pub use cli::Cli;
pub use conf::Config;

/// Version reported to the broker in every request.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
