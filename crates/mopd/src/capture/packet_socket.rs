//! Linux `AF_PACKET` raw socket bound to a single interface.
//!
//! The socket receives every frame seen by the interface (`ETH_P_ALL`),
//! including frames this host transmits; the classifier filters those out.
//! A receive timeout keeps the blocking read loop responsive to shutdown.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use super::{CaptureError, FrameSource};

/// Receive timeout; bounds how long shutdown waits on an idle interface.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// A bound raw packet socket.
#[derive(Debug)]
pub struct PacketSocket {
    fd: OwnedFd,
    interface: String,
}

impl PacketSocket {
    /// Opens a raw socket on `interface`.
    ///
    /// Requires `CAP_NET_RAW`.
    ///
    /// # Errors
    ///
    /// `CaptureError::Open` if the interface does not exist or the socket
    /// cannot be created, bound, or configured.
    pub fn open(interface: &str) -> Result<Self, CaptureError> {
        let open_error = |error: io::Error| CaptureError::Open {
            interface: interface.to_string(),
            error: error.to_string(),
        };

        let c_name = CString::new(interface)
            .map_err(|_| open_error(io::Error::from(io::ErrorKind::InvalidInput)))?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(open_error(io::Error::last_os_error()));
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();

        // SAFETY: plain socket(2) call; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::c_int::from(protocol),
            )
        };
        if raw < 0 {
            return Err(open_error(io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as libc::c_int;

        // SAFETY: addr is a valid sockaddr_ll and the length matches it.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(open_error(io::Error::last_os_error()));
        }

        let timeout = libc::timeval {
            tv_sec: RECV_TIMEOUT.as_secs() as libc::time_t,
            tv_usec: RECV_TIMEOUT.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: timeout outlives the call and the length matches it.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(open_error(io::Error::last_os_error()));
        }

        Ok(Self {
            fd,
            interface: interface.to_string(),
        })
    }
}

impl FrameSource for PacketSocket {
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, CaptureError> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };

        if n >= 0 {
            return Ok(Some(n as usize));
        }

        let error = io::Error::last_os_error();
        match error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Ok(None)
            }
            _ => Err(CaptureError::Read {
                interface: self.interface.clone(),
                error: error.to_string(),
            }),
        }
    }
}
