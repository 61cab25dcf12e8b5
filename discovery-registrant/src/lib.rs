//! Discovery registrant - keeps a node registered with the discovery listener
//!
//! - REGISTER on connect, node_id kept across reconnects
//! - periodic HEARTBEAT while registered
//! - fixed-interval reconnect policy

pub mod config;
pub mod error;
pub mod link;
pub mod registrant;

pub use config::RegistrantConfig;
pub use error::{RegistrantError, Result};
pub use link::Link;
pub use registrant::{Registrant, RegistrantHandle, RegistrantSettings, RegistrantState};
