//! Kernel path-control backend
//!
//! Drives the multipath-tcp.org socket API: every control call is a
//! `getsockopt`/`setsockopt` at level `IPPROTO_TCP` on the connection's
//! descriptor, with variable-length structures for addresses and id lists.

use super::endpoint::Endpoint;
use super::error::Errno;
use super::facility::{FacilityResult, PathControl, PathStatus, PathTuple};
use super::subflow::Priority;
use crate::config::{ConfigError, ControlConfig};
use libc::{c_char, c_int, c_uint, c_void, socklen_t};
use std::mem;
use std::os::unix::io::RawFd;

/// Option names of the multipath-tcp.org subflow API (`linux/tcp.h`).
pub mod sockopt {
    use libc::c_int;

    /// List subflow ids and their status.
    pub const MPTCP_GET_SUB_IDS: c_int = 66;
    /// Close a subflow by id.
    pub const MPTCP_CLOSE_SUB_ID: c_int = 67;
    /// Read the endpoints of a subflow.
    pub const MPTCP_GET_SUB_TUPLE: c_int = 68;
    /// Open a subflow between two endpoints.
    pub const MPTCP_OPEN_SUB_TUPLE: c_int = 69;
    /// Read a socket option of one subflow.
    pub const MPTCP_SUB_GETSOCKOPT: c_int = 71;
    /// Write a socket option of one subflow.
    pub const MPTCP_SUB_SETSOCKOPT: c_int = 72;
}

/// `struct mptcp_sub_tuple` header: id, prio, then the two sockaddrs
const TUPLE_HEADER_LEN: usize = 2;
/// `struct mptcp_sub_ids`: u8 count, padding, then 4-byte `mptcp_sub_status`
const SUB_IDS_HEADER_LEN: usize = 2;
const SUB_STATUS_LEN: usize = 4;

// `mptcp_sub_status` bitfields in declaration order: slave_sk,
// fully_established, attached, low_prio. Bitfields fill from the low bit on
// little-endian targets and from the high bit on big-endian ones.
#[cfg(target_endian = "little")]
const LOW_PRIO_BIT: u16 = 1 << 3;
#[cfg(target_endian = "big")]
const LOW_PRIO_BIT: u16 = 1 << 12;

#[repr(C)]
struct CloseSubId {
    id: u8,
    how: c_int,
}

#[repr(C)]
struct SubSetsockopt {
    id: u8,
    level: c_int,
    optname: c_int,
    optval: *mut c_char,
    optlen: c_uint,
}

#[repr(C)]
struct SubGetsockopt {
    id: u8,
    level: c_int,
    optname: c_int,
    optval: *mut c_char,
    optlen: *mut c_uint,
}

fn tcp_getsockopt(
    fd: RawFd,
    name: c_int,
    value: *mut c_void,
    len: &mut socklen_t,
) -> FacilityResult<()> {
    // SAFETY: callers pass a pointer to at least `*len` writable bytes.
    let rc = unsafe { libc::getsockopt(fd, libc::IPPROTO_TCP, name, value, len) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Run `query` with a buffer that starts at `list_buffer_min` bytes and grows
/// by `list_buffer_increment` while the answer is EINVAL, never past
/// `list_buffer_max`. `query` returns the number of bytes it filled.
fn query_growing<F>(config: &ControlConfig, mut query: F) -> FacilityResult<Vec<u8>>
where
    F: FnMut(&mut [u8]) -> FacilityResult<usize>,
{
    let mut size = config.list_buffer_min;

    loop {
        let mut buf = vec![0u8; size];
        match query(&mut buf) {
            Ok(used) => {
                buf.truncate(used);
                return Ok(buf);
            }
            // EINVAL here means the buffer is too small for every id.
            Err(Errno(libc::EINVAL))
                if size + config.list_buffer_increment <= config.list_buffer_max =>
            {
                size += config.list_buffer_increment;
                tracing::trace!(size, "growing subflow list buffer");
            }
            Err(errno) => return Err(errno),
        }
    }
}

/// Decode a `struct mptcp_sub_ids` answer
fn parse_sub_ids(buf: &[u8]) -> Vec<PathStatus> {
    let Some(&count) = buf.first() else {
        return Vec::new();
    };

    buf.get(SUB_IDS_HEADER_LEN..)
        .unwrap_or_default()
        .chunks_exact(SUB_STATUS_LEN)
        .take(count as usize)
        .map(|status| PathStatus {
            id: status[0],
            low_prio: u16::from_ne_bytes([status[2], status[3]]) & LOW_PRIO_BIT != 0,
        })
        .collect()
}

/// Decode the two sockaddrs following a `struct mptcp_sub_tuple` header
fn parse_sub_tuple(buf: &[u8]) -> Option<PathTuple> {
    let addrs = buf.get(TUPLE_HEADER_LEN..)?;
    let (local, used) = Endpoint::from_sockaddr_bytes(addrs)?;
    let (remote, _) = Endpoint::from_sockaddr_bytes(&addrs[used..])?;
    Some(PathTuple { local, remote })
}

/// Path control through the multipath-tcp.org kernel
#[derive(Debug, Clone, Default)]
pub struct KernelPathControl {
    config: ControlConfig,
}

impl KernelPathControl {
    /// Rejects buffer sizes the query calls cannot work with
    pub fn new(config: ControlConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl PathControl for KernelPathControl {
    fn create_path(
        &self,
        fd: RawFd,
        local: &Endpoint,
        remote: &Endpoint,
        priority: Priority,
    ) -> FacilityResult<u8> {
        let local = local.to_sockaddr_bytes();
        let remote = remote.to_sockaddr_bytes();

        let mut buf = Vec::with_capacity(TUPLE_HEADER_LEN + local.len() + remote.len());
        buf.push(0);
        buf.push(priority.is_low() as u8);
        buf.extend_from_slice(&local);
        buf.extend_from_slice(&remote);

        let mut len = buf.len() as socklen_t;
        tcp_getsockopt(fd, sockopt::MPTCP_OPEN_SUB_TUPLE, buf.as_mut_ptr().cast(), &mut len)?;
        Ok(buf[0])
    }

    fn close_path(&self, fd: RawFd, id: u8, how: i32) -> FacilityResult<()> {
        let mut request = CloseSubId { id, how };
        let mut len = mem::size_of::<CloseSubId>() as socklen_t;
        tcp_getsockopt(
            fd,
            sockopt::MPTCP_CLOSE_SUB_ID,
            (&mut request as *mut CloseSubId).cast(),
            &mut len,
        )
    }

    fn list_paths(&self, fd: RawFd) -> FacilityResult<Vec<PathStatus>> {
        let answer = query_growing(&self.config, |buf| {
            let mut len = buf.len() as socklen_t;
            tcp_getsockopt(fd, sockopt::MPTCP_GET_SUB_IDS, buf.as_mut_ptr().cast(), &mut len)?;
            Ok(len as usize)
        })?;
        Ok(parse_sub_ids(&answer))
    }

    fn get_path(&self, fd: RawFd, id: u8) -> FacilityResult<PathTuple> {
        let mut buf = vec![0u8; self.config.tuple_buffer_len];
        *buf.first_mut().ok_or(Errno(libc::EINVAL))? = id;

        let mut len = buf.len() as socklen_t;
        tcp_getsockopt(fd, sockopt::MPTCP_GET_SUB_TUPLE, buf.as_mut_ptr().cast(), &mut len)?;
        buf.truncate(len as usize);

        parse_sub_tuple(&buf).ok_or(Errno(libc::EPROTO))
    }

    fn get_option(&self, fd: RawFd, id: u8, level: i32, name: i32) -> FacilityResult<i32> {
        let mut value: c_int = 0;
        let mut value_len = mem::size_of::<c_int>() as c_uint;
        let mut request = SubGetsockopt {
            id,
            level,
            optname: name,
            optval: (&mut value as *mut c_int).cast(),
            optlen: &mut value_len,
        };

        let mut len = mem::size_of::<SubGetsockopt>() as socklen_t;
        tcp_getsockopt(
            fd,
            sockopt::MPTCP_SUB_GETSOCKOPT,
            (&mut request as *mut SubGetsockopt).cast(),
            &mut len,
        )?;
        Ok(value)
    }

    fn set_option(
        &self,
        fd: RawFd,
        id: u8,
        level: i32,
        name: i32,
        value: i32,
    ) -> FacilityResult<()> {
        let mut value: c_int = value;
        let request = SubSetsockopt {
            id,
            level,
            optname: name,
            optval: (&mut value as *mut c_int).cast(),
            optlen: mem::size_of::<c_int>() as c_uint,
        };

        // SAFETY: `request` and the value it points to live until the call returns.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                sockopt::MPTCP_SUB_SETSOCKOPT,
                (&request as *const SubSetsockopt).cast(),
                mem::size_of::<SubSetsockopt>() as socklen_t,
            )
        };
        if rc != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mptcp::endpoint::EndpointResolver;

    fn status_bytes(id: u8, bits: u16) -> [u8; 4] {
        let bits = bits.to_ne_bytes();
        [id, 0, bits[0], bits[1]]
    }

    // slave_sk | fully_established | attached, as on a live subflow
    #[cfg(target_endian = "little")]
    const LIVE: u16 = 0b0111;
    #[cfg(target_endian = "little")]
    const FULLY_ESTABLISHED: u16 = 0b0010;
    #[cfg(target_endian = "little")]
    const LOW_PRIO: u16 = 0b1000;
    #[cfg(target_endian = "big")]
    const LIVE: u16 = 0b111 << 13;
    #[cfg(target_endian = "big")]
    const FULLY_ESTABLISHED: u16 = 1 << 14;
    #[cfg(target_endian = "big")]
    const LOW_PRIO: u16 = 1 << 12;

    #[test]
    fn test_close_request_layout() {
        assert_eq!(mem::size_of::<CloseSubId>(), 8);
    }

    #[test]
    fn test_parse_sub_ids() {
        let mut buf = vec![3u8, 0];
        buf.extend_from_slice(&status_bytes(1, 0));
        buf.extend_from_slice(&status_bytes(4, LOW_PRIO));
        buf.extend_from_slice(&status_bytes(9, 0));

        let ids = parse_sub_ids(&buf);
        assert_eq!(
            ids,
            vec![
                PathStatus { id: 1, low_prio: false },
                PathStatus { id: 4, low_prio: true },
                PathStatus { id: 9, low_prio: false },
            ]
        );
    }

    #[test]
    fn test_only_low_prio_bit_marks_backup() {
        let mut buf = vec![3u8, 0];
        buf.extend_from_slice(&status_bytes(1, LIVE));
        buf.extend_from_slice(&status_bytes(2, FULLY_ESTABLISHED));
        buf.extend_from_slice(&status_bytes(3, FULLY_ESTABLISHED | LOW_PRIO));

        let low: Vec<bool> = parse_sub_ids(&buf).iter().map(|s| s.low_prio).collect();
        assert_eq!(low, vec![false, false, true]);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_low_prio_is_fourth_bitfield() {
        let buf = [1u8, 0, 7, 0, 0b0000_1000, 0];
        assert_eq!(parse_sub_ids(&buf), vec![PathStatus { id: 7, low_prio: true }]);

        let buf = [1u8, 0, 7, 0, 0b0000_0111, 0];
        assert_eq!(parse_sub_ids(&buf), vec![PathStatus { id: 7, low_prio: false }]);
    }

    #[test]
    fn test_parse_sub_ids_ignores_truncated_entries() {
        let mut buf = vec![2u8, 0];
        buf.extend_from_slice(&status_bytes(2, 0));
        buf.extend_from_slice(&[5, 0]);

        assert_eq!(parse_sub_ids(&buf).len(), 1);
        assert!(parse_sub_ids(&[]).is_empty());
        assert!(parse_sub_ids(&[0, 0]).is_empty());
    }

    #[test]
    fn test_parse_sub_tuple() {
        let resolver = EndpointResolver::default();
        let local = resolver.resolve("192.168.33.10:64002", None).unwrap();
        let remote = resolver.resolve("130.104.230.45:80", None).unwrap();

        let mut buf = vec![2u8, 0];
        buf.extend_from_slice(&local.to_sockaddr_bytes());
        buf.extend_from_slice(&remote.to_sockaddr_bytes());
        buf.resize(96, 0);

        assert_eq!(parse_sub_tuple(&buf), Some(PathTuple { local, remote }));
        assert_eq!(parse_sub_tuple(&buf[..20]), None);
    }

    #[test]
    fn test_parse_mixed_width_tuple() {
        let resolver = EndpointResolver::default();
        let local = resolver.resolve("[fd00::1]:5000", None).unwrap();
        let remote = resolver.resolve("[fd00::2]:80", None).unwrap();

        let mut buf = vec![1u8, 0];
        buf.extend_from_slice(&local.to_sockaddr_bytes());
        buf.extend_from_slice(&remote.to_sockaddr_bytes());

        let tuple = parse_sub_tuple(&buf).unwrap();
        assert_eq!(tuple.local, local);
        assert_eq!(tuple.remote, remote);
    }

    #[test]
    fn test_list_buffer_grows_until_answer_fits() {
        let config = ControlConfig::default();
        let mut tried = Vec::new();

        let answer = query_growing(&config, |buf| {
            tried.push(buf.len());
            if buf.len() < 100 {
                return Err(Errno(libc::EINVAL));
            }
            buf[0] = 1;
            Ok(6)
        })
        .unwrap();

        assert_eq!(tried, vec![40, 60, 80, 100]);
        assert_eq!(answer.len(), 6);
        assert_eq!(answer[0], 1);
    }

    #[test]
    fn test_list_buffer_growth_stops_at_cap() {
        let config = ControlConfig::builder().list_buffer_max(70).build();
        let mut tried = Vec::new();

        let err = query_growing(&config, |buf| {
            tried.push(buf.len());
            Err(Errno(libc::EINVAL))
        })
        .unwrap_err();

        assert_eq!(err, Errno(libc::EINVAL));
        assert_eq!(tried, vec![40, 60]);
    }

    #[test]
    fn test_list_query_other_errors_are_not_retried() {
        let config = ControlConfig::default();
        let mut calls = 0;

        let err = query_growing(&config, |_| {
            calls += 1;
            Err(Errno(libc::EOPNOTSUPP))
        })
        .unwrap_err();

        assert_eq!(err, Errno(libc::EOPNOTSUPP));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_unusable_buffer_sizes_are_rejected() {
        let config = ControlConfig::builder().tuple_buffer_len(0).build();
        assert!(matches!(KernelPathControl::new(config), Err(ConfigError::Invalid(_))));

        let config = ControlConfig::builder().list_buffer_increment(0).build();
        assert!(KernelPathControl::new(config).is_err());

        assert!(KernelPathControl::new(ControlConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_tuple_buffer_is_an_error_not_a_panic() {
        let facility = KernelPathControl {
            config: ControlConfig::builder().tuple_buffer_len(0).build(),
        };
        assert_eq!(facility.get_path(-1, 1), Err(Errno(libc::EINVAL)));
    }
}
