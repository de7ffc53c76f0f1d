pub mod config;
pub mod core;
pub mod events;
pub mod handlers;
pub mod hpc;
pub mod logging;
pub mod module_resolver;
pub mod realm;
pub mod realms;
pub mod session;
pub mod watchers;
