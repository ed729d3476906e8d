//! Per-subflow socket options
//!
//! Values are integers; the meaning of `(level, name)` pairs is the
//! facility's business, the controller only transports them.

use super::controller::{facility_error, SubflowController};
use super::error::{Operation, Result};
use super::handle::{ControlDescriptor, MultipathConnection};
use super::subflow::SubflowId;
use std::fmt;

/// Option levels, `setsockopt(2)` numbering
pub const LEVEL_SOCKET: i32 = libc::SOL_SOCKET;
pub const LEVEL_IP: i32 = libc::IPPROTO_IP;
pub const LEVEL_IPV6: i32 = libc::IPPROTO_IPV6;
pub const LEVEL_TCP: i32 = libc::IPPROTO_TCP;

/// Well-known subflow options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubflowOption {
    /// `IP_TOS`
    Tos,
    /// `IP_TTL`
    Ttl,
    /// `IPV6_TCLASS`
    TrafficClass,
    /// `TCP_NODELAY`
    NoDelay,
    /// `TCP_MAXSEG`
    MaxSegment,
    /// `SO_PRIORITY`
    SocketPriority,
    Custom { level: i32, name: i32 },
}

impl SubflowOption {
    pub fn level(&self) -> i32 {
        match self {
            SubflowOption::Tos | SubflowOption::Ttl => LEVEL_IP,
            SubflowOption::TrafficClass => LEVEL_IPV6,
            SubflowOption::NoDelay | SubflowOption::MaxSegment => LEVEL_TCP,
            SubflowOption::SocketPriority => LEVEL_SOCKET,
            SubflowOption::Custom { level, .. } => *level,
        }
    }

    pub fn name(&self) -> i32 {
        match self {
            SubflowOption::Tos => libc::IP_TOS,
            SubflowOption::Ttl => libc::IP_TTL,
            SubflowOption::TrafficClass => libc::IPV6_TCLASS,
            SubflowOption::NoDelay => libc::TCP_NODELAY,
            SubflowOption::MaxSegment => libc::TCP_MAXSEG,
            SubflowOption::SocketPriority => libc::SO_PRIORITY,
            SubflowOption::Custom { name, .. } => *name,
        }
    }
}

impl fmt::Display for SubflowOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubflowOption::Tos => f.write_str("ip_tos"),
            SubflowOption::Ttl => f.write_str("ip_ttl"),
            SubflowOption::TrafficClass => f.write_str("ipv6_tclass"),
            SubflowOption::NoDelay => f.write_str("tcp_nodelay"),
            SubflowOption::MaxSegment => f.write_str("tcp_maxseg"),
            SubflowOption::SocketPriority => f.write_str("so_priority"),
            SubflowOption::Custom { level, name } => write!(f, "{}/{}", level, name),
        }
    }
}

impl SubflowController {
    /// Read an integer option of one subflow
    pub fn get_option<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        id: SubflowId,
        level: i32,
        name: i32,
    ) -> Result<i32> {
        let op = Operation::GetOption;
        self.run(connection, op, |facility, fd| {
            let value = facility
                .get_option(fd, id.get(), level, name)
                .map_err(|errno| facility_error(op, fd, errno))?;
            tracing::debug!(fd, subflow = %id, level, name, value, "subflow option read");
            Ok(value)
        })
    }

    /// Write an integer option of one subflow
    pub fn set_option<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        id: SubflowId,
        level: i32,
        name: i32,
        value: i32,
    ) -> Result<()> {
        let op = Operation::SetOption;
        self.run(connection, op, |facility, fd| {
            facility
                .set_option(fd, id.get(), level, name, value)
                .map_err(|errno| facility_error(op, fd, errno))?;
            tracing::debug!(fd, subflow = %id, level, name, value, "subflow option written");
            Ok(())
        })
    }

    pub fn get<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        id: SubflowId,
        option: SubflowOption,
    ) -> Result<i32> {
        self.get_option(connection, id, option.level(), option.name())
    }

    pub fn set<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        id: SubflowId,
        option: SubflowOption,
        value: i32,
    ) -> Result<()> {
        self.set_option(connection, id, option.level(), option.name(), value)
    }
}
