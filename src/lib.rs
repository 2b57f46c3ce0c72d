pub mod backoff;
pub mod bridge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod protocol;
pub mod provider;
pub mod router;
pub mod session;
pub mod signing;
pub mod supervisor;
pub mod telemetry;
pub mod tracker;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::AgentError;
