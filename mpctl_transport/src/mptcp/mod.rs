//! Multi-path TCP Subflow Control
//!
//! Open, close, enumerate and tune the subflows of an established multipath
//! connection through a path-control facility.

pub mod controller;
pub mod endpoint;
pub mod error;
pub mod facility;
pub mod handle;
pub mod kernel;
pub mod memory;
pub mod offload;
pub mod options;
pub mod subflow;

pub use controller::SubflowController;
pub use endpoint::{
    AddressFamily, Endpoint, EndpointResolver, HostLookup, StaticLookup, SystemLookup,
};
pub use error::{Errno, ErrorKind, FacilityStatus, Operation, Result, SubflowError};
pub use facility::{PathControl, PathStatus, PathTuple};
pub use handle::{with_exclusive_handle, ControlDescriptor, MultipathConnection, RestoreMode};
pub use kernel::KernelPathControl;
pub use memory::MemoryPathControl;
pub use offload::AsyncSubflowController;
pub use options::SubflowOption;
pub use subflow::{Priority, Shutdown, Subflow, SubflowId, SubflowState, SubflowStatus};
