/*!
# Discovery Listener

Serveur central : accepte les registrants en TCP, suit leur liveness par
heartbeat et expose un statut cluster GREEN/RED.
*/

pub mod config;
pub mod connection;
pub mod health;
pub mod listener;
pub mod registry;
pub mod state;

pub use connection::{CloseReason, Connection, ConnectionSettings, EvictionTimer};
pub use health::{ClusterHealth, HealthTracker};
pub use listener::Listener;
pub use registry::{ClusterRegistry, ConnectionId, ConnectionView};
