pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod link;
pub mod meter;
pub mod node;
pub mod output;
pub mod record;
pub mod safety;
pub mod store;
pub mod supervisor;
pub mod types;

pub use api::ServerCommand;
pub use clock::Now;
pub use config::{HardwareConfig, NetworkConfig, RuntimeConfig};
pub use error::{LinkError, MeterError, NodeError, SafetyError, StoreError};
pub use link::{HttpLink, JsonTransport, ServerLink};
pub use meter::{MeterAction, MeterEngine};
pub use node::{Inputs, LocalRequest, Node, StepOutcome};
pub use output::Relay;
pub use record::{DeviceRecord, SessionPhase, StopReason};
pub use store::RecordBackend;
pub use supervisor::{DeviceIdentity, RestartCause};
pub use types::{MeterState, NodeStatus};
