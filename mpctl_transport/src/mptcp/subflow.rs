//! MPTCP Subflow
//!
//! Views of the paths of a connection. Nothing here is cached: every value is
//! produced from a fresh facility query.

use super::endpoint::Endpoint;
use super::error::{Operation, Result, SubflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU8;

/// Facility-assigned subflow identifier, unique within a connection while open
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubflowId(NonZeroU8);

impl SubflowId {
    /// Validate a caller-supplied id. Zero, negative and out-of-range values
    /// never name a path.
    pub fn new(raw: i64) -> Result<Self> {
        u8::try_from(raw)
            .ok()
            .and_then(NonZeroU8::new)
            .map(SubflowId)
            .ok_or_else(|| {
                let reason = format!("{} is not a valid subflow id", raw);
                SubflowError::invalid(Operation::Validate, reason)
            })
    }

    /// Wrap an id reported by the facility
    pub fn from_raw(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(SubflowId)
    }

    pub fn get(&self) -> u8 {
        self.0.get()
    }
}

impl TryFrom<i32> for SubflowId {
    type Error = SubflowError;

    fn try_from(raw: i32) -> Result<Self> {
        SubflowId::new(raw as i64)
    }
}

impl fmt::Display for SubflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advisory scheduling hint, fixed when the subflow is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Kernel encoding: the `low_prio` bit
    pub fn from_low_prio(low_prio: bool) -> Self {
        if low_prio {
            Priority::Low
        } else {
            Priority::Normal
        }
    }

    pub fn is_low(&self) -> bool {
        matches!(self, Priority::Low)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => f.write_str("normal"),
            Priority::Low => f.write_str("low"),
        }
    }
}

/// Shutdown style for closing a subflow, with `shutdown(2)` numbering.
/// Advisory: the facility may treat all values alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    #[default]
    Both,
}

impl Shutdown {
    pub fn as_raw(&self) -> i32 {
        match self {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        }
    }
}

/// Lifecycle of a subflow. `Requested` is never observable outside an open
/// call and `Closed` is only observed as the id missing from a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubflowState {
    Requested,
    Open,
    Closing,
    Closed,
}

/// One entry of a subflow listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubflowStatus {
    pub id: SubflowId,
    pub priority: Priority,
}

/// Full view of a subflow: listing entry plus its resolved endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subflow {
    pub id: SubflowId,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub priority: Priority,
}

impl fmt::Display for Subflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} -> {} ({})", self.id, self.local, self.remote, self.priority)
    }
}
