//! Subflow Controller
//!
//! Open, close, list and inspect the subflows of a connection. The controller
//! keeps no subflow state of its own: every answer comes from the facility,
//! and every facility call runs inside the handle accessor.

use super::endpoint::{parse_host_port, Endpoint, EndpointResolver};
use super::error::{Errno, Operation, Result, SubflowError};
use super::facility::PathControl;
use super::handle::{with_exclusive_handle, ControlDescriptor, MultipathConnection};
use super::kernel::KernelPathControl;
use super::subflow::{Priority, Shutdown, Subflow, SubflowId, SubflowState, SubflowStatus};
use crate::config::{ConfigError, ControlConfig};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Log and translate a facility failure
pub(crate) fn facility_error(op: Operation, fd: RawFd, errno: Errno) -> SubflowError {
    tracing::warn!(op = %op, fd, code = errno.0, "facility call failed: {}", errno.message());
    SubflowError::from_errno(op, errno)
}

/// Façade over a path-control facility
#[derive(Clone)]
pub struct SubflowController {
    facility: Arc<dyn PathControl>,
    resolver: EndpointResolver,
    config: ControlConfig,
}

impl fmt::Debug for SubflowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubflowController")
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SubflowController {
    pub fn new(facility: Arc<dyn PathControl>) -> Self {
        Self::with_config(facility, ControlConfig::default())
    }

    pub fn with_config(facility: Arc<dyn PathControl>, config: ControlConfig) -> Self {
        Self {
            facility,
            resolver: EndpointResolver::default(),
            config,
        }
    }

    /// Controller backed by the multipath kernel
    pub fn kernel(config: ControlConfig) -> std::result::Result<Self, ConfigError> {
        let facility = Arc::new(KernelPathControl::new(config.clone())?);
        Ok(Self::with_config(facility, config))
    }

    /// Replace the endpoint resolver
    pub fn with_resolver(mut self, resolver: EndpointResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Run a facility call under the handle accessor
    pub(crate) fn run<C, T, F>(
        &self,
        connection: &MultipathConnection<C>,
        op: Operation,
        call: F,
    ) -> Result<T>
    where
        C: ControlDescriptor,
        F: FnOnce(&dyn PathControl, RawFd) -> Result<T>,
    {
        let facility = self.facility.as_ref();
        with_exclusive_handle(connection, op, self.config.restore_mode, |fd| call(facility, fd))
    }

    fn ensure_present<C: ControlDescriptor>(
        connection: &MultipathConnection<C>,
        op: Operation,
    ) -> Result<()> {
        match connection.get_ref().control_fd() {
            Some(fd) if fd >= 0 => Ok(()),
            _ => Err(SubflowError::invalid(op, "connection is absent")),
        }
    }

    /// Resolve both endpoints of a new subflow. The remote side is resolved in
    /// the local side's family; with an empty local host the remote side
    /// picks the family and the local side becomes that family's wildcard.
    fn resolve_pair(&self, local: &str, remote: &str) -> Result<(Endpoint, Endpoint)> {
        let (local_host, local_port) = parse_host_port(local)?;
        let (remote_host, remote_port) = parse_host_port(remote)?;

        if local_host.is_empty() {
            let remote = self.resolver.resolve_host(&remote_host, remote_port, None)?;
            let local = self.resolver.resolve_host("", local_port, Some(remote.family()))?;
            Ok((local, remote))
        } else {
            let local = self.resolver.resolve_host(&local_host, local_port, None)?;
            let remote = self
                .resolver
                .resolve_host(&remote_host, remote_port, Some(local.family()))?;
            Ok((local, remote))
        }
    }

    /// Open a subflow between `local` and `remote` (`host:port` each).
    ///
    /// A local port of 0 or an empty local host lets the facility choose the
    /// source port or address.
    pub fn open<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        local: &str,
        remote: &str,
        priority: Priority,
    ) -> Result<SubflowId> {
        let op = Operation::Open;
        Self::ensure_present(connection, op)?;
        let (local_ep, remote_ep) = self
            .resolve_pair(local, remote)
            .map_err(|e| e.with_operation(op))?;

        let (fd, raw) = self.run(connection, op, |facility, fd| {
            facility
                .create_path(fd, &local_ep, &remote_ep, priority)
                .map(|raw| (fd, raw))
                .map_err(|errno| facility_error(op, fd, errno))
        })?;

        let id = SubflowId::from_raw(raw).ok_or_else(|| SubflowError::Unknown {
            op,
            code: 0,
            message: "facility assigned subflow id 0".to_string(),
        })?;

        tracing::debug!(
            fd,
            subflow = %id,
            local = %local_ep,
            remote = %remote_ep,
            %priority,
            "subflow opened"
        );
        Ok(id)
    }

    /// Open with the configured default priority
    pub fn open_default<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        local: &str,
        remote: &str,
    ) -> Result<SubflowId> {
        self.open(connection, local, remote, self.config.default_priority)
    }

    /// Close a subflow. `how` is passed through; the facility may ignore it.
    pub fn close<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        id: SubflowId,
        how: Shutdown,
    ) -> Result<()> {
        let op = Operation::Close;
        self.run(connection, op, |facility, fd| {
            facility
                .close_path(fd, id.get(), how.as_raw())
                .map_err(|errno| facility_error(op, fd, errno))?;
            tracing::debug!(fd, subflow = %id, ?how, "subflow closed");
            Ok(())
        })
    }

    /// Every open subflow, in facility order. An empty list is not an error.
    pub fn list<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
    ) -> Result<Vec<SubflowStatus>> {
        let op = Operation::List;
        self.run(connection, op, |facility, fd| {
            let paths = facility.list_paths(fd).map_err(|errno| facility_error(op, fd, errno))?;
            let subflows: Vec<_> = paths
                .into_iter()
                .filter_map(|path| {
                    SubflowId::from_raw(path.id).map(|id| SubflowStatus {
                        id,
                        priority: Priority::from_low_prio(path.low_prio),
                    })
                })
                .collect();
            tracing::debug!(fd, count = subflows.len(), "subflows listed");
            Ok(subflows)
        })
    }

    /// Local and remote endpoint of one subflow
    pub fn inspect<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        id: SubflowId,
    ) -> Result<(Endpoint, Endpoint)> {
        let op = Operation::Inspect;
        self.run(connection, op, |facility, fd| {
            let tuple = facility
                .get_path(fd, id.get())
                .map_err(|errno| facility_error(op, fd, errno))?;
            tracing::debug!(
                fd,
                subflow = %id,
                local = %tuple.local,
                remote = %tuple.remote,
                "subflow inspected"
            );
            Ok((tuple.local, tuple.remote))
        })
    }

    /// List and inspect every subflow under a single hold of the control
    /// lock. Subflows that vanish between the two queries are left out.
    pub fn snapshot<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
    ) -> Result<Vec<Subflow>> {
        let op = Operation::List;
        self.run(connection, op, |facility, fd| {
            let paths = facility.list_paths(fd).map_err(|errno| facility_error(op, fd, errno))?;

            let mut subflows = Vec::with_capacity(paths.len());
            for path in paths {
                let Some(id) = SubflowId::from_raw(path.id) else {
                    continue;
                };
                match facility.get_path(fd, path.id) {
                    Ok(tuple) => subflows.push(Subflow {
                        id,
                        local: tuple.local,
                        remote: tuple.remote,
                        priority: Priority::from_low_prio(path.low_prio),
                    }),
                    Err(Errno(libc::EINVAL)) => {
                        tracing::debug!(fd, subflow = %id, "subflow closed during snapshot");
                    }
                    Err(errno) => return Err(facility_error(Operation::Inspect, fd, errno)),
                }
            }
            Ok(subflows)
        })
    }

    /// Current state of a subflow as seen in a fresh listing
    pub fn state<C: ControlDescriptor>(
        &self,
        connection: &MultipathConnection<C>,
        id: SubflowId,
    ) -> Result<SubflowState> {
        let open = self.list(connection)?.iter().any(|status| status.id == id);
        Ok(if open { SubflowState::Open } else { SubflowState::Closed })
    }
}
