pub mod reconnection;

pub use reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
