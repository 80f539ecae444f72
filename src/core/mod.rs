pub mod config;
pub mod frame;
pub mod heartbeat;
pub mod metrics;
pub mod protocol;
pub mod reconnect;
pub mod router;
pub mod subscriptions;
pub mod types;

pub use config::*;
pub use frame::*;
pub use heartbeat::*;
pub use metrics::*;
pub use protocol::{Inbound, Outbound, ShutdownNotice};
pub use reconnect::*;
pub use router::*;
pub use subscriptions::*;
pub use types::*;
