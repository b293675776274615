pub mod config;
pub mod logging;
pub mod server_impl;
