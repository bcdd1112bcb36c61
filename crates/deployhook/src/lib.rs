pub mod config;
pub mod deploy;
pub mod excerpt;
pub mod logging;
mod request_logging;
pub mod system;
pub mod webhook;
