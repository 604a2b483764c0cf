//! Frame sources.
//!
//! The engine's receive workers pull raw Ethernet frames from a
//! [`FrameSource`]. The production source binds an AF_PACKET socket to a
//! named interface (with `PACKET_FANOUT` hashing for multi-queue
//! operation); tests and benchmarks inject frames through an in-memory
//! channel source with identical semantics.

use std::io;
use std::time::Duration;

use crossbeam::channel;

#[cfg(target_os = "linux")]
use crate::engine::EngineError;

/// Receive timeout per attempt, so workers notice the stop flag promptly.
#[cfg(target_os = "linux")]
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// A source of raw Ethernet frames for one receive queue.
pub trait FrameSource: Send {
    /// Receive one frame into `buf`.
    ///
    /// Returns `Ok(Some(len))` for a frame, `Ok(None)` on timeout so the
    /// caller can re-check its stop flag, and `Err` for genuine I/O
    /// failures.
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Receive queue index this source serves.
    fn queue_id(&self) -> u32;
}

/// AF_PACKET socket bound to one interface, serving one engine queue.
///
/// Attaching does not disturb existing connections, and dropping the
/// source removes promiscuous mode and closes the socket, leaving no
/// residual state on the interface.
#[cfg(target_os = "linux")]
pub struct AfPacketSource {
    fd: std::os::unix::io::RawFd,
    ifindex: i32,
    queue_id: u32,
}

#[cfg(target_os = "linux")]
impl AfPacketSource {
    /// Open and bind a socket on `interface`.
    ///
    /// When `fanout_group` is set, the socket joins a `PACKET_FANOUT_HASH`
    /// group so the kernel spreads flows across the engine's queues the
    /// way NIC RSS would.
    pub fn open(
        interface: &str,
        queue_id: u32,
        fanout_group: Option<u16>,
    ) -> Result<Self, EngineError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EACCES) => EngineError::PermissionDenied,
                _ => EngineError::AttachFailed(err.to_string()),
            });
        }

        let ifindex = match if_index(interface) {
            Some(index) => index,
            None => {
                unsafe { libc::close(fd) };
                return Err(EngineError::InterfaceNotFound(interface.to_string()));
            }
        };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(EngineError::AttachFailed(format!(
                "bind to {interface}: {err}"
            )));
        }

        let source = Self {
            fd,
            ifindex,
            queue_id,
        };

        source.set_recv_timeout(RECV_TIMEOUT)?;
        source.set_promisc(true)?;

        if let Some(group) = fanout_group {
            let arg: libc::c_int =
                (group as libc::c_int) | ((libc::PACKET_FANOUT_HASH as libc::c_int) << 16);
            let ret = unsafe {
                libc::setsockopt(
                    source.fd,
                    libc::SOL_PACKET,
                    libc::PACKET_FANOUT,
                    &arg as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(EngineError::AttachFailed(format!(
                    "PACKET_FANOUT: {}",
                    io::Error::last_os_error()
                )));
            }
        }

        tracing::info!(interface, queue = queue_id, "AF_PACKET source bound");
        Ok(source)
    }

    fn set_recv_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(EngineError::AttachFailed(format!(
                "SO_RCVTIMEO: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn set_promisc(&self, enable: bool) -> Result<(), EngineError> {
        let mreq = libc::packet_mreq {
            mr_ifindex: self.ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let optname = if enable {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                optname,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(EngineError::AttachFailed(format!(
                "promiscuous mode: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl FrameSource for AfPacketSource {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            };
        }
        Ok(Some(n as usize))
    }

    fn queue_id(&self) -> u32 {
        self.queue_id
    }
}

#[cfg(target_os = "linux")]
impl Drop for AfPacketSource {
    fn drop(&mut self) {
        let _ = self.set_promisc(false);
        unsafe { libc::close(self.fd) };
    }
}

/// Interface name to index, None when the interface does not exist.
#[cfg(unix)]
pub fn if_index(interface: &str) -> Option<i32> {
    let name = std::ffi::CString::new(interface).ok()?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        None
    } else {
        Some(index as i32)
    }
}

#[cfg(not(unix))]
pub fn if_index(_interface: &str) -> Option<i32> {
    None
}

/// Names of the host's network interfaces.
#[cfg(unix)]
pub fn list_interfaces() -> Vec<String> {
    let mut names = Vec::new();
    let head = unsafe { libc::if_nameindex() };
    if head.is_null() {
        return names;
    }
    let mut cursor = head;
    unsafe {
        while (*cursor).if_index != 0 && !(*cursor).if_name.is_null() {
            if let Ok(name) = std::ffi::CStr::from_ptr((*cursor).if_name).to_str() {
                names.push(name.to_string());
            }
            cursor = cursor.add(1);
        }
        libc::if_freenameindex(head);
    }
    names
}

#[cfg(not(unix))]
pub fn list_interfaces() -> Vec<String> {
    Vec::new()
}

/// Whether the process can open raw packet sockets.
///
/// A conservative probe: root always can; otherwise the answer comes
/// from actually attempting the socket call (covers CAP_NET_RAW).
#[cfg(target_os = "linux")]
pub fn check_permissions() -> bool {
    if unsafe { libc::geteuid() } == 0 {
        return true;
    }
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            (libc::ETH_P_ALL as u16).to_be() as i32,
        )
    };
    if fd < 0 {
        return false;
    }
    unsafe { libc::close(fd) };
    true
}

#[cfg(not(target_os = "linux"))]
pub fn check_permissions() -> bool {
    false
}

/// In-memory frame source fed by a [`FrameInjector`].
///
/// Used by tests, benchmarks and embedders that obtain frames from
/// somewhere other than a NIC. Frames longer than the receive buffer are
/// truncated, matching raw-socket semantics.
pub struct ChannelSource {
    rx: channel::Receiver<Vec<u8>>,
    queue_id: u32,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct FrameInjector {
    tx: channel::Sender<Vec<u8>>,
}

impl FrameInjector {
    /// Queue one frame. Returns false once the source is gone.
    pub fn inject(&self, frame: &[u8]) -> bool {
        self.tx.send(frame.to_vec()).is_ok()
    }
}

/// Create a connected injector/source pair for `queue_id`.
pub fn channel_source(queue_id: u32) -> (FrameInjector, ChannelSource) {
    let (tx, rx) = channel::unbounded();
    (FrameInjector { tx }, ChannelSource { rx, queue_id })
}

impl FrameSource for ChannelSource {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.rx.recv_timeout(Duration::from_millis(10)) {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(channel::RecvTimeoutError::Disconnected) => {
                // Keep the worker parked on its stop flag instead of
                // spinning on a dead channel.
                std::thread::sleep(Duration::from_millis(10));
                Ok(None)
            }
        }
    }

    fn queue_id(&self) -> u32 {
        self.queue_id
    }
}
