pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod transport;
