//! In-process path-control backend
//!
//! Keeps per-connection subflow tables in memory, keyed by descriptor, and
//! answers with the same errno conventions as the kernel API. Used for tests
//! and for dry runs on hosts without a multipath kernel.
//!
//! Each table remembers the socket cookie of the connection it was created
//! for. A descriptor number that has been closed and handed to a new socket
//! starts over with a fresh table.

use super::endpoint::Endpoint;
use super::error::Errno;
use super::facility::{FacilityResult, PathControl, PathStatus, PathTuple};
use super::subflow::Priority;
use socket2::SockRef;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::{Mutex, PoisonError};

/// Ports below this need privileges to bind
const PRIVILEGED_PORT_LIMIT: u16 = 1024;
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

#[derive(Debug)]
struct PathRecord {
    local: Endpoint,
    remote: Endpoint,
    low_prio: bool,
    options: HashMap<(i32, i32), i32>,
}

#[derive(Debug)]
struct ConnectionPaths {
    cookie: Option<u64>,
    next_id: u8,
    paths: BTreeMap<u8, PathRecord>,
}

impl ConnectionPaths {
    fn empty() -> Self {
        Self {
            cookie: None,
            next_id: 1,
            paths: BTreeMap::new(),
        }
    }

    /// Next free id at or after `next_id`, wrapping within 1..=255
    fn allocate_id(&mut self) -> Option<u8> {
        let start = self.next_id;
        let mut candidate = start;
        loop {
            if !self.paths.contains_key(&candidate) {
                self.next_id = candidate.checked_add(1).unwrap_or(1);
                return Some(candidate);
            }
            candidate = candidate.checked_add(1).unwrap_or(1);
            if candidate == start {
                return None;
            }
        }
    }

    fn record(&self, id: u8) -> FacilityResult<&PathRecord> {
        self.paths.get(&id).ok_or(Errno(libc::EINVAL))
    }

    fn record_mut(&mut self, id: u8) -> FacilityResult<&mut PathRecord> {
        self.paths.get_mut(&id).ok_or(Errno(libc::EINVAL))
    }
}

#[derive(Debug)]
struct MemoryState {
    connections: HashMap<RawFd, ConnectionPaths>,
    next_ephemeral: u16,
}

impl MemoryState {
    fn local_in_use(&self, local: &Endpoint) -> bool {
        self.connections
            .values()
            .flat_map(|conn| conn.paths.values())
            .any(|path| path.local == *local)
    }

    fn ephemeral_port(&mut self, ip: IpAddr) -> FacilityResult<u16> {
        let span = (EPHEMERAL_PORTS.end() - EPHEMERAL_PORTS.start()) as usize + 1;
        for _ in 0..span {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                port + 1
            };
            let candidate = Endpoint::new(SocketAddr::new(ip, port));
            if !self.local_in_use(&candidate) {
                return Ok(port);
            }
        }
        Err(Errno(libc::EADDRNOTAVAIL))
    }
}

fn io_errno(e: io::Error) -> Errno {
    Errno(e.raw_os_error().unwrap_or(libc::EIO))
}

/// Kernel-assigned identity of the socket behind `fd`, unique for the life of
/// the system. `None` when `fd` is not an open socket.
fn socket_cookie(fd: RawFd) -> Option<u64> {
    let mut cookie: u64 = 0;
    let mut len = mem::size_of::<u64>() as libc::socklen_t;
    // SAFETY: `cookie` and `len` are valid for writes and `len` holds the
    // size of `cookie`.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_COOKIE,
            &mut cookie as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    (rc == 0).then_some(cookie)
}

/// Local and peer address of the socket behind `fd`
fn socket_addrs(fd: RawFd) -> FacilityResult<(SocketAddr, SocketAddr)> {
    // SAFETY: the controller only hands out descriptors it holds open for the
    // whole facility call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let socket = SockRef::from(&borrowed);
    let local = socket.local_addr().map_err(io_errno)?;
    let peer = socket.peer_addr().map_err(io_errno)?;
    match (local.as_socket(), peer.as_socket()) {
        (Some(local), Some(peer)) => Ok((local, peer)),
        _ => Err(Errno(libc::EAFNOSUPPORT)),
    }
}

fn option_is_known(level: i32, name: i32) -> Option<bool> {
    let names: &[i32] = match level {
        libc::IPPROTO_IP => &[libc::IP_TOS, libc::IP_TTL],
        libc::IPPROTO_IPV6 => &[libc::IPV6_TCLASS],
        libc::IPPROTO_TCP => &[libc::TCP_NODELAY, libc::TCP_MAXSEG],
        libc::SOL_SOCKET => &[libc::SO_PRIORITY],
        _ => return None,
    };
    Some(names.contains(&name))
}

fn option_default(level: i32, name: i32) -> i32 {
    match (level, name) {
        (libc::IPPROTO_IP, libc::IP_TTL) => 64,
        (libc::IPPROTO_TCP, libc::TCP_MAXSEG) => 1460,
        _ => 0,
    }
}

/// Checks the option key: unknown level is EOPNOTSUPP, unknown name ENOPROTOOPT
fn check_option(level: i32, name: i32) -> FacilityResult<()> {
    match option_is_known(level, name) {
        None => Err(Errno(libc::EOPNOTSUPP)),
        Some(false) => Err(Errno(libc::ENOPROTOOPT)),
        Some(true) => Ok(()),
    }
}

fn check_option_value(level: i32, name: i32, value: i32) -> FacilityResult<()> {
    let valid = match (level, name) {
        (libc::IPPROTO_IP, libc::IP_TOS) | (libc::IPPROTO_IPV6, libc::IPV6_TCLASS) => {
            (0..=255).contains(&value)
        }
        (libc::IPPROTO_IP, libc::IP_TTL) => (1..=255).contains(&value),
        _ => true,
    };
    if valid {
        Ok(())
    } else {
        Err(Errno(libc::EINVAL))
    }
}

/// In-memory path-control facility
#[derive(Debug)]
pub struct MemoryPathControl {
    state: Mutex<MemoryState>,
    privileged: bool,
    initial_subflow: bool,
}

impl Default for MemoryPathControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPathControl {
    /// Unprivileged facility whose connections start without subflows
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                connections: HashMap::new(),
                next_ephemeral: *EPHEMERAL_PORTS.start(),
            }),
            privileged: false,
            initial_subflow: false,
        }
    }

    /// Allow binding local ports below 1024
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Register the connection's own path as subflow 1 on first use, the way
    /// the kernel reports the initial subflow.
    pub fn with_initial_subflow(mut self, enabled: bool) -> Self {
        self.initial_subflow = enabled;
        self
    }

    /// Drop a path as if the peer had torn it down. Returns false if the path
    /// did not exist.
    pub fn teardown(&self, fd: RawFd, id: u8) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .connections
            .get_mut(&fd)
            .map_or(false, |conn| conn.paths.remove(&id).is_some())
    }

    /// Forget everything recorded for `fd`. Returns false if nothing was.
    pub fn forget(&self, fd: RawFd) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.connections.remove(&fd).is_some()
    }

    fn with_connection<T>(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut MemoryState, RawFd) -> FacilityResult<T>,
    ) -> FacilityResult<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let cookie = socket_cookie(fd);
        let current = state
            .connections
            .get(&fd)
            .map_or(false, |conn| conn.cookie == cookie);
        if !current {
            if state.connections.remove(&fd).is_some() {
                tracing::debug!(fd, "descriptor reused by a new socket, dropping its subflows");
            }
            let mut conn = ConnectionPaths::empty();
            conn.cookie = cookie;
            if self.initial_subflow {
                let (local, peer) = socket_addrs(fd)?;
                conn.paths.insert(
                    1,
                    PathRecord {
                        local: Endpoint::new(local),
                        remote: Endpoint::new(peer),
                        low_prio: false,
                        options: HashMap::new(),
                    },
                );
                conn.next_id = 2;
            }
            state.connections.insert(fd, conn);
        }

        f(&mut state, fd)
    }
}

impl PathControl for MemoryPathControl {
    fn create_path(
        &self,
        fd: RawFd,
        local: &Endpoint,
        remote: &Endpoint,
        priority: Priority,
    ) -> FacilityResult<u8> {
        if local.family() != remote.family() {
            return Err(Errno(libc::EINVAL));
        }
        if local.port() != 0 && local.port() < PRIVILEGED_PORT_LIMIT && !self.privileged {
            return Err(Errno(libc::EACCES));
        }

        let mut local = *local;
        if local.ip().is_unspecified() {
            let ip = match socket_addrs(fd) {
                Ok((bound, _)) if bound.is_ipv4() == local.ip().is_ipv4() => bound.ip(),
                _ if local.ip().is_ipv4() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                _ => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            local = Endpoint::new(SocketAddr::new(ip, local.port()));
        }
        let remote = *remote;

        self.with_connection(fd, |state, fd| {
            if local.port() == 0 {
                let port = state.ephemeral_port(local.ip())?;
                local = local.with_port(port);
            } else if state.local_in_use(&local) {
                return Err(Errno(libc::EADDRINUSE));
            }

            let conn = state
                .connections
                .get_mut(&fd)
                .ok_or(Errno(libc::EBADF))?;
            let id = conn.allocate_id().ok_or(Errno(libc::ENOSPC))?;
            conn.paths.insert(
                id,
                PathRecord {
                    local,
                    remote,
                    low_prio: priority.is_low(),
                    options: HashMap::new(),
                },
            );
            Ok(id)
        })
    }

    fn close_path(&self, fd: RawFd, id: u8, _how: i32) -> FacilityResult<()> {
        self.with_connection(fd, |state, fd| {
            let conn = state.connections.get_mut(&fd).ok_or(Errno(libc::EBADF))?;
            conn.paths.remove(&id).map(|_| ()).ok_or(Errno(libc::EINVAL))
        })
    }

    fn list_paths(&self, fd: RawFd) -> FacilityResult<Vec<PathStatus>> {
        self.with_connection(fd, |state, fd| {
            let conn = state.connections.get(&fd).ok_or(Errno(libc::EBADF))?;
            Ok(conn
                .paths
                .iter()
                .map(|(id, path)| PathStatus {
                    id: *id,
                    low_prio: path.low_prio,
                })
                .collect())
        })
    }

    fn get_path(&self, fd: RawFd, id: u8) -> FacilityResult<PathTuple> {
        self.with_connection(fd, |state, fd| {
            let conn = state.connections.get(&fd).ok_or(Errno(libc::EBADF))?;
            let path = conn.record(id)?;
            Ok(PathTuple {
                local: path.local,
                remote: path.remote,
            })
        })
    }

    fn get_option(&self, fd: RawFd, id: u8, level: i32, name: i32) -> FacilityResult<i32> {
        self.with_connection(fd, |state, fd| {
            let conn = state.connections.get(&fd).ok_or(Errno(libc::EBADF))?;
            let path = conn.record(id)?;
            check_option(level, name)?;
            Ok(path
                .options
                .get(&(level, name))
                .copied()
                .unwrap_or_else(|| option_default(level, name)))
        })
    }

    fn set_option(
        &self,
        fd: RawFd,
        id: u8,
        level: i32,
        name: i32,
        value: i32,
    ) -> FacilityResult<()> {
        self.with_connection(fd, |state, fd| {
            let conn = state.connections.get_mut(&fd).ok_or(Errno(libc::EBADF))?;
            let path = conn.record_mut(id)?;
            check_option(level, name)?;
            check_option_value(level, name, value)?;
            path.options.insert((level, name), value);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mptcp::endpoint::EndpointResolver;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    /// Above any descriptor the process can hold, so it never names a socket
    const FD: RawFd = 1 << 20;

    fn endpoint(s: &str) -> Endpoint {
        EndpointResolver::default().resolve(s, None).unwrap()
    }

    fn connected() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_ids_are_sequential_and_not_reused_while_open() {
        let facility = MemoryPathControl::new();
        let remote = endpoint("10.0.0.1:80");

        let open = |local: &str, priority| {
            facility
                .create_path(FD, &endpoint(local), &remote, priority)
                .unwrap()
        };

        let a = open("10.0.0.2:40001", Priority::Normal);
        let b = open("10.0.0.2:40002", Priority::Low);
        assert_eq!((a, b), (1, 2));

        facility.close_path(FD, a, 2).unwrap();
        assert_eq!(open("10.0.0.2:40003", Priority::Normal), 3);

        let listed = facility.list_paths(FD).unwrap();
        assert_eq!(
            listed,
            vec![
                PathStatus { id: 2, low_prio: true },
                PathStatus { id: 3, low_prio: false },
            ]
        );
    }

    #[test]
    fn test_id_allocation_wraps_around() {
        let mut conn = ConnectionPaths::empty();
        conn.next_id = 255;
        assert_eq!(conn.allocate_id(), Some(255));
        assert_eq!(conn.allocate_id(), Some(1));
    }

    #[test]
    fn test_errno_conventions() {
        let facility = MemoryPathControl::new();
        let remote = endpoint("10.0.0.1:80");

        let open =
            |local: &str| facility.create_path(FD, &endpoint(local), &remote, Priority::Normal);

        assert_eq!(open("10.0.0.2:10"), Err(Errno(libc::EACCES)));
        assert_eq!(open("[fd00::1]:4000"), Err(Errno(libc::EINVAL)));

        open("10.0.0.2:4000").unwrap();
        assert_eq!(open("10.0.0.2:4000"), Err(Errno(libc::EADDRINUSE)));

        assert_eq!(facility.close_path(FD, 42, 0), Err(Errno(libc::EINVAL)));
        assert_eq!(facility.get_path(FD, 42).unwrap_err(), Errno(libc::EINVAL));
    }

    #[test]
    fn test_privileged_ports_allowed_when_privileged() {
        let facility = MemoryPathControl::new().with_privileged(true);
        let id = facility
            .create_path(FD, &endpoint("10.0.0.2:10"), &endpoint("10.0.0.1:80"), Priority::Normal)
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_option_errors() {
        let facility = MemoryPathControl::new();
        let id = facility
            .create_path(FD, &endpoint("10.0.0.2:4000"), &endpoint("10.0.0.1:80"), Priority::Normal)
            .unwrap();

        let ip = libc::IPPROTO_IP;
        assert_eq!(facility.get_option(FD, id, ip, libc::IP_TTL), Ok(64));
        assert_eq!(facility.get_option(FD, id, 9999, 1), Err(Errno(libc::EOPNOTSUPP)));
        assert_eq!(facility.get_option(FD, id, ip, 9999), Err(Errno(libc::ENOPROTOOPT)));
        assert_eq!(facility.set_option(FD, id, ip, libc::IP_TOS, 300), Err(Errno(libc::EINVAL)));
        assert_eq!(facility.set_option(FD, 77, ip, libc::IP_TOS, 4), Err(Errno(libc::EINVAL)));
    }

    #[test]
    fn test_initial_subflow_comes_from_socket() {
        let (client, _server) = connected();
        let fd = client.as_raw_fd();
        let facility = MemoryPathControl::new().with_initial_subflow(true);

        let listed = facility.list_paths(fd).unwrap();
        assert_eq!(listed, vec![PathStatus { id: 1, low_prio: false }]);

        let tuple = facility.get_path(fd, 1).unwrap();
        assert_eq!(tuple.local.socket_addr(), client.local_addr().unwrap());
        assert_eq!(tuple.remote.socket_addr(), client.peer_addr().unwrap());

        let next = facility
            .create_path(fd, &endpoint("127.0.0.1:0"), &endpoint("127.0.0.1:80"), Priority::Normal)
            .unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_any_source_address_uses_bound_address() {
        let (client, _server) = connected();
        let fd = client.as_raw_fd();
        let facility = MemoryPathControl::new();

        let id = facility
            .create_path(fd, &endpoint(":0"), &endpoint("127.0.0.1:80"), Priority::Normal)
            .unwrap();
        let tuple = facility.get_path(fd, id).unwrap();
        assert_eq!(tuple.local.ip(), client.local_addr().unwrap().ip());
        assert!(tuple.local.port() >= 49152);
    }

    #[test]
    fn test_teardown() {
        let facility = MemoryPathControl::new();
        let id = facility
            .create_path(FD, &endpoint("10.0.0.2:4000"), &endpoint("10.0.0.1:80"), Priority::Normal)
            .unwrap();

        assert!(facility.teardown(FD, id));
        assert!(!facility.teardown(FD, id));
        assert!(facility.list_paths(FD).unwrap().is_empty());
    }

    #[test]
    fn test_reused_descriptor_starts_with_no_subflows() {
        let (first, _first_peer) = connected();
        let (second, _second_peer) = connected();
        let fd = first.as_raw_fd();
        let facility = MemoryPathControl::new();
        let remote = endpoint("127.0.0.1:80");

        facility.create_path(fd, &endpoint("127.0.0.1:0"), &remote, Priority::Normal).unwrap();
        facility.create_path(fd, &endpoint("127.0.0.1:0"), &remote, Priority::Low).unwrap();
        assert_eq!(facility.list_paths(fd).unwrap().len(), 2);

        // Put a different socket behind the same descriptor number.
        // SAFETY: both descriptors are open; dup2 closes `fd` and reopens it
        // on the second socket, which `first` keeps owning from here on.
        assert_eq!(unsafe { libc::dup2(second.as_raw_fd(), fd) }, fd);

        assert!(facility.list_paths(fd).unwrap().is_empty());
        assert_eq!(facility.get_path(fd, 1).unwrap_err(), Errno(libc::EINVAL));
        let id = facility
            .create_path(fd, &endpoint("127.0.0.1:0"), &remote, Priority::Normal)
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_same_socket_keeps_its_subflows() {
        let (client, _server) = connected();
        let fd = client.as_raw_fd();
        let facility = MemoryPathControl::new();

        let id = facility
            .create_path(fd, &endpoint("127.0.0.1:0"), &endpoint("127.0.0.1:80"), Priority::Normal)
            .unwrap();
        for _ in 0..3 {
            assert_eq!(facility.list_paths(fd).unwrap(), vec![PathStatus { id, low_prio: false }]);
        }
    }

    #[test]
    fn test_forget_drops_the_table() {
        let facility = MemoryPathControl::new();
        facility
            .create_path(FD, &endpoint("10.0.0.2:4000"), &endpoint("10.0.0.1:80"), Priority::Normal)
            .unwrap();

        assert!(facility.forget(FD));
        assert!(!facility.forget(FD));
        assert!(facility.list_paths(FD).unwrap().is_empty());
    }
}
