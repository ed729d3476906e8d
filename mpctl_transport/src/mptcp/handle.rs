//! Handle Accessor
//!
//! Scoped, exclusive access to the raw descriptor behind a connection. The
//! path-control facility needs blocking semantics, so the descriptor is put in
//! blocking mode for the duration of a control call and its disposition is
//! restored when the guard drops, on every exit path.
//!
//! Toggling the mode is a mutation of the socket's open file description, which
//! every descriptor of that socket shares. Control calls are therefore
//! serialized per socket, through a process-wide table keyed by the socket's
//! inode, whichever wrapper or duplicate descriptor they arrive through.
//! Ordinary reads and writes issued concurrently still observe blocking
//! semantics while a control call is in flight.

use super::error::{Operation, Result, SubflowError};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::sync::{Condvar, Mutex, PoisonError};

/// Exposes the raw descriptor of a connection
pub trait ControlDescriptor {
    /// `None` when there is no live connection behind this value
    fn control_fd(&self) -> Option<RawFd>;
}

impl ControlDescriptor for std::net::TcpStream {
    fn control_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl ControlDescriptor for tokio::net::TcpStream {
    fn control_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl ControlDescriptor for socket2::Socket {
    fn control_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl<T: ControlDescriptor> ControlDescriptor for Option<T> {
    fn control_fd(&self) -> Option<RawFd> {
        self.as_ref().and_then(|conn| conn.control_fd())
    }
}

/// Disposition applied to the descriptor when a control call finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Put back whatever mode the descriptor had before the call
    #[default]
    Original,
    /// Always leave the descriptor non-blocking
    NonBlocking,
}

/// A caller-owned connection prepared for subflow control.
///
/// The layer never closes the connection; [`MultipathConnection::into_inner`]
/// hands it back.
pub struct MultipathConnection<C> {
    conn: C,
}

impl<C> MultipathConnection<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    /// Borrow the connection for ordinary I/O
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C: fmt::Debug> fmt::Debug for MultipathConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipathConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

/// Whether `O_NONBLOCK` is set on a descriptor
pub fn descriptor_is_nonblocking(fd: RawFd) -> io::Result<bool> {
    // SAFETY: F_GETFL only reads the file status flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Identity of the socket behind a descriptor, shared by all its duplicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SocketKey {
    dev: u64,
    ino: u64,
}

impl SocketKey {
    fn of(fd: RawFd) -> io::Result<Self> {
        // SAFETY: an all-zero `stat` is a valid value for fstat to overwrite.
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        // SAFETY: `stat` is a valid, writable `struct stat`.
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        })
    }
}

static HELD_SOCKETS: Mutex<BTreeSet<SocketKey>> = Mutex::new(BTreeSet::new());
static SOCKET_RELEASED: Condvar = Condvar::new();

/// Exclusive claim on one socket for the length of a control call
struct ControlLock {
    key: SocketKey,
}

impl ControlLock {
    fn acquire(key: SocketKey) -> Self {
        // The set is only modified under the lock, a panicking holder cannot
        // leave it half-updated.
        let mut held = HELD_SOCKETS.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(&key) {
            held = SOCKET_RELEASED
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key);
        Self { key }
    }
}

impl Drop for ControlLock {
    fn drop(&mut self) {
        let mut held = HELD_SOCKETS.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        drop(held);
        SOCKET_RELEASED.notify_all();
    }
}

/// Holds a descriptor in blocking mode until dropped
struct BlockingGuard<'a> {
    socket: SockRef<'a>,
    fd: RawFd,
    restore_nonblocking: bool,
}

impl<'a> BlockingGuard<'a> {
    fn enter(fd: &'a BorrowedFd<'a>, op: Operation, restore: RestoreMode) -> Result<Self> {
        let raw = fd.as_raw_fd();
        let was_nonblocking =
            descriptor_is_nonblocking(raw).map_err(|source| SubflowError::Handle { op, source })?;

        let socket = SockRef::from(fd);
        socket
            .set_nonblocking(false)
            .map_err(|source| SubflowError::Handle { op, source })?;
        tracing::trace!(fd = raw, was_nonblocking, "descriptor switched to blocking mode");

        Ok(Self {
            socket,
            fd: raw,
            restore_nonblocking: match restore {
                RestoreMode::Original => was_nonblocking,
                RestoreMode::NonBlocking => true,
            },
        })
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        match self.socket.set_nonblocking(self.restore_nonblocking) {
            Ok(()) => tracing::trace!(
                fd = self.fd,
                nonblocking = self.restore_nonblocking,
                "descriptor mode restored"
            ),
            Err(e) => tracing::warn!(fd = self.fd, error = %e, "failed to restore descriptor mode"),
        }
    }
}

/// Run `operation` with exclusive, blocking-mode access to the connection's
/// descriptor.
///
/// The socket's control lock is taken before the mode switch and released
/// after the mode is restored. An absent connection is rejected before
/// anything is touched.
pub fn with_exclusive_handle<C, T, F>(
    connection: &MultipathConnection<C>,
    op: Operation,
    restore: RestoreMode,
    operation: F,
) -> Result<T>
where
    C: ControlDescriptor,
    F: FnOnce(RawFd) -> Result<T>,
{
    let fd = connection
        .conn
        .control_fd()
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| SubflowError::invalid(op, "connection is absent"))?;

    let key = SocketKey::of(fd).map_err(|source| SubflowError::Handle { op, source })?;
    let lock = ControlLock::acquire(key);

    // SAFETY: the descriptor belongs to `connection`, which stays borrowed
    // (and therefore open) until this function returns.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let guard = BlockingGuard::enter(&borrowed, op, restore)?;
    let result = operation(fd);
    drop(guard);
    drop(lock);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mptcp::error::ErrorKind;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_descriptor_is_blocking_inside_operation() {
        let (client, _server) = connected_pair();
        client.set_nonblocking(true).unwrap();
        let conn = MultipathConnection::new(client);

        let seen = with_exclusive_handle(&conn, Operation::List, RestoreMode::Original, |fd| {
            Ok(descriptor_is_nonblocking(fd).unwrap())
        })
        .unwrap();

        assert!(!seen);
        assert!(descriptor_is_nonblocking(conn.get_ref().as_raw_fd()).unwrap());
    }

    #[test]
    fn test_original_blocking_mode_is_kept() {
        let (client, _server) = connected_pair();
        let conn = MultipathConnection::new(client);

        with_exclusive_handle(&conn, Operation::List, RestoreMode::Original, |_| Ok(())).unwrap();
        assert!(!descriptor_is_nonblocking(conn.get_ref().as_raw_fd()).unwrap());
    }

    #[test]
    fn test_non_blocking_restore_mode() {
        let (client, _server) = connected_pair();
        let conn = MultipathConnection::new(client);

        with_exclusive_handle(&conn, Operation::List, RestoreMode::NonBlocking, |_| Ok(()))
            .unwrap();
        assert!(descriptor_is_nonblocking(conn.get_ref().as_raw_fd()).unwrap());
    }

    #[test]
    fn test_mode_restored_when_operation_fails() {
        let (client, _server) = connected_pair();
        client.set_nonblocking(true).unwrap();
        let conn = MultipathConnection::new(client);

        let result: Result<()> =
            with_exclusive_handle(&conn, Operation::Close, RestoreMode::Original, |_| {
                Err(SubflowError::invalid(Operation::Close, "boom"))
            });

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(descriptor_is_nonblocking(conn.get_ref().as_raw_fd()).unwrap());
    }

    #[test]
    fn test_absent_connection_is_invalid_argument() {
        let conn: MultipathConnection<Option<TcpStream>> = MultipathConnection::new(None);
        let mut called = false;

        let err = with_exclusive_handle(&conn, Operation::Open, RestoreMode::Original, |_| {
            called = true;
            Ok(())
        })
        .unwrap_err();

        assert!(!called);
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.operation(), Operation::Open);
    }

    #[test]
    fn test_connection_is_handed_back_open() {
        let (client, _server) = connected_pair();
        let local = client.local_addr().unwrap();
        let conn = MultipathConnection::new(client);

        with_exclusive_handle(&conn, Operation::List, RestoreMode::Original, |_| Ok(())).unwrap();

        let client = conn.into_inner();
        assert_eq!(client.local_addr().unwrap(), local);
    }

    #[test]
    fn test_wrappers_of_one_socket_do_not_overlap() {
        let (client, _server) = connected_pair();
        client.set_nonblocking(true).unwrap();
        let first = Arc::new(MultipathConnection::new(client.try_clone().unwrap()));
        let second = Arc::new(MultipathConnection::new(client.try_clone().unwrap()));
        let inside = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = [first, second]
            .into_iter()
            .map(|conn| {
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        with_exclusive_handle(&conn, Operation::List, RestoreMode::Original, |fd| {
                            let overlapped = inside.swap(true, Ordering::SeqCst);
                            assert!(!overlapped, "control calls overlapped");
                            assert!(!descriptor_is_nonblocking(fd).unwrap());
                            thread::sleep(Duration::from_millis(2));
                            inside.store(false, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(descriptor_is_nonblocking(client.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_distinct_sockets_are_not_serialized_together() {
        let (a, _a_peer) = connected_pair();
        let (b, _b_peer) = connected_pair();
        let a = MultipathConnection::new(a);
        let b = MultipathConnection::new(b);

        let nested = with_exclusive_handle(&a, Operation::List, RestoreMode::Original, |_| {
            with_exclusive_handle(&b, Operation::List, RestoreMode::Original, |_| Ok(7))
        })
        .unwrap();
        assert_eq!(nested, 7);
    }
}
