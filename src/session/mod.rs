//! Receiver sessions and the admission-controlled pool that bounds them

pub mod pool;
pub mod state;

pub use pool::{PoolSnapshot, QueuedSummary, SessionPool, SessionSummary, WriteLease};
pub use state::{DeviceSession, SessionId, SessionState};
