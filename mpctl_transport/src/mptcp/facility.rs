//! Path-control facility seam
//!
//! The facility owns all subflow state. Calls are synchronous and keyed by the
//! raw descriptor of the connection; failures come back as raw errno codes and
//! are translated by the controller.

use super::endpoint::Endpoint;
use super::error::Errno;
use super::subflow::Priority;
use std::os::unix::io::RawFd;

pub type FacilityResult<T> = std::result::Result<T, Errno>;

/// A path as reported by the facility's listing call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStatus {
    pub id: u8,
    pub low_prio: bool,
}

/// Endpoints of a single path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathTuple {
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// Synchronous path-control call surface
pub trait PathControl: Send + Sync {
    /// Create a path; returns the facility-assigned id
    fn create_path(
        &self,
        fd: RawFd,
        local: &Endpoint,
        remote: &Endpoint,
        priority: Priority,
    ) -> FacilityResult<u8>;

    fn close_path(&self, fd: RawFd, id: u8, how: i32) -> FacilityResult<()>;

    fn list_paths(&self, fd: RawFd) -> FacilityResult<Vec<PathStatus>>;

    fn get_path(&self, fd: RawFd, id: u8) -> FacilityResult<PathTuple>;

    fn get_option(&self, fd: RawFd, id: u8, level: i32, name: i32) -> FacilityResult<i32>;

    fn set_option(
        &self,
        fd: RawFd,
        id: u8,
        level: i32,
        name: i32,
        value: i32,
    ) -> FacilityResult<()>;
}
