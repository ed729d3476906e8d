pub mod config;
pub mod logging;
pub mod mptcp;

pub use config::{ConfigError, ControlConfig};
pub use mptcp::{
    AsyncSubflowController, MemoryPathControl, MultipathConnection, Priority, Shutdown,
    SubflowController, SubflowError, SubflowId,
};
