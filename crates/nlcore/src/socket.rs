//! Netlink socket endpoint: descriptor lifecycle, addressing, behavioural
//! flags and sequence bookkeeping.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{Error, Result};
use crate::handlers::Callbacks;

/// Netlink protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Routing/device hook (ip, tc, etc.)
    Route,
    /// Generic netlink
    Generic,
    /// Netfilter
    Netfilter,
    /// Kernel connector
    Connector,
    /// Kobject uevent
    KobjectUevent,
    /// Socket diagnostics
    SockDiag,
    /// Auditing
    Audit,
}

impl Protocol {
    /// The raw protocol number handed to `socket(2)`.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Protocol::Route => libc::NETLINK_ROUTE,
            Protocol::Generic => libc::NETLINK_GENERIC,
            Protocol::Netfilter => libc::NETLINK_NETFILTER,
            Protocol::Connector => libc::NETLINK_CONNECTOR,
            Protocol::KobjectUevent => libc::NETLINK_KOBJECT_UEVENT,
            Protocol::SockDiag => libc::NETLINK_SOCK_DIAG,
            Protocol::Audit => libc::NETLINK_AUDIT,
        }
    }
}

/// A netlink address: kernel-assigned port plus multicast group mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketAddr {
    pid: u32,
    groups: u32,
}

impl SocketAddr {
    /// Create an address from a port number and group mask.
    pub fn new(pid: u32, groups: u32) -> Self {
        Self { pid, groups }
    }

    /// The port number.
    pub fn port(&self) -> u32 {
        self.pid
    }

    /// The multicast group mask.
    pub fn groups(&self) -> u32 {
        self.groups
    }

    pub(crate) fn to_raw(self) -> libc::sockaddr_nl {
        // SAFETY: sockaddr_nl is plain old data, an all-zero value is valid.
        let mut raw: libc::sockaddr_nl = unsafe { mem::zeroed() };
        raw.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        raw.nl_pid = self.pid;
        raw.nl_groups = self.groups;
        raw
    }

    pub(crate) fn from_raw(raw: &libc::sockaddr_nl) -> Self {
        Self {
            pid: raw.nl_pid,
            groups: raw.nl_groups,
        }
    }
}

/// Process credentials as carried by SCM_CREDENTIALS ancillary data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub(crate) fn from_ucred(ucred: &libc::ucred) -> Self {
        Self {
            pid: ucred.pid,
            uid: ucred.uid,
            gid: ucred.gid,
        }
    }

    pub(crate) fn to_ucred(self) -> libc::ucred {
        libc::ucred {
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// Blocking netlink socket.
///
/// A freshly allocated socket is closed (`connect` opens it) and carries a
/// default [`Callbacks`] set which the transport routines consult. The
/// send-side and expected-receive sequence counters start out equal and wrap
/// independently.
pub struct NetlinkSocket {
    pub(crate) fd: RawFd,
    pub(crate) local: SocketAddr,
    pub(crate) peer: SocketAddr,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) seq_next: u32,
    pub(crate) seq_expect: u32,
    pub(crate) bufsize: usize,
    pub(crate) bufsize_set: bool,
    pub(crate) passcred: bool,
    pub(crate) peek: bool,
    pub(crate) no_auto_ack: bool,
    pub(crate) cb: Arc<Callbacks>,
}

impl NetlinkSocket {
    /// Allocate a closed socket with an empty default callback set.
    pub fn new() -> Self {
        Self::with_callbacks(Arc::new(Callbacks::default()))
    }

    /// Allocate a closed socket using the given callback set as its default.
    pub fn with_callbacks(cb: Arc<Callbacks>) -> Self {
        let seq = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        Self {
            fd: -1,
            local: SocketAddr::default(),
            peer: SocketAddr::default(),
            protocol: None,
            seq_next: seq,
            seq_expect: seq,
            bufsize: 0,
            bufsize_set: false,
            passcred: false,
            peek: false,
            no_auto_ack: false,
            cb,
        }
    }

    /// Create and bind the kernel endpoint for the given protocol.
    ///
    /// Applies the default buffer sizing when none was configured, binds the
    /// local address and reads back the kernel-assigned port. Fails with
    /// [`Error::BadSocket`] when already connected; any later failure closes
    /// the half-open descriptor before returning.
    pub fn connect(&mut self, protocol: Protocol) -> Result<()> {
        if self.fd != -1 {
            return Err(Error::BadSocket);
        }

        // SAFETY: plain socket(2) call with constant arguments.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol.as_raw(),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.fd = fd;

        match self.bind_local(protocol) {
            Ok(()) => {
                debug!(?protocol, port = self.local.port(), "netlink socket connected");
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn bind_local(&mut self, protocol: Protocol) -> Result<()> {
        if !self.bufsize_set {
            self.set_buffer_size(0, 0)?;
        }

        let mut raw = self.local.to_raw();
        let mut addrlen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;

        // SAFETY: raw is a valid sockaddr_nl owned by this frame, addrlen
        // matches its size.
        let ret = unsafe {
            libc::bind(
                self.fd,
                &raw as *const libc::sockaddr_nl as *const libc::sockaddr,
                addrlen,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // SAFETY: getsockname writes at most addrlen bytes into raw.
        let ret = unsafe {
            libc::getsockname(
                self.fd,
                &mut raw as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if addrlen as usize != mem::size_of::<libc::sockaddr_nl>() {
            return Err(Error::NoAddress);
        }
        if raw.nl_family != libc::AF_NETLINK as libc::sa_family_t {
            return Err(Error::AfNotSupported);
        }

        self.local = SocketAddr::from_raw(&raw);
        self.protocol = Some(protocol);
        Ok(())
    }

    /// Close the kernel endpoint. Idempotent.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            // SAFETY: fd is a descriptor owned by this socket.
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        self.protocol = None;
    }

    /// Check whether the socket currently owns a kernel endpoint.
    pub fn is_connected(&self) -> bool {
        self.fd >= 0
    }

    /// The protocol this socket is bound to.
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// The local address, including the kernel-assigned port after connect.
    pub fn local_addr(&self) -> &SocketAddr {
        &self.local
    }

    /// The kernel-assigned port, 0 before connect.
    pub fn port(&self) -> u32 {
        self.local.port()
    }

    /// The peer address datagrams are sent to. Defaults to the kernel.
    pub fn peer_addr(&self) -> &SocketAddr {
        &self.peer
    }

    /// Direct datagrams at a specific peer port instead of the kernel.
    pub fn set_peer_port(&mut self, port: u32) {
        self.peer = SocketAddr::new(port, self.peer.groups());
    }

    /// Set the peer multicast group mask.
    pub fn set_peer_groups(&mut self, groups: u32) {
        self.peer = SocketAddr::new(self.peer.port(), groups);
    }

    /// Draw the next send-side sequence number.
    pub fn use_seq(&mut self) -> u32 {
        let seq = self.seq_next;
        self.seq_next = self.seq_next.wrapping_add(1);
        seq
    }

    /// The sequence number the next inbound record is expected to carry.
    pub fn seq_expect(&self) -> u32 {
        self.seq_expect
    }

    /// The configured receive buffer size, 0 when unset.
    pub fn buffer_size(&self) -> usize {
        self.bufsize
    }

    /// Configure the socket buffer sizes; 0 selects the 32768-octet default.
    pub fn set_buffer_size(&mut self, rxbuf: usize, txbuf: usize) -> Result<()> {
        if self.fd < 0 {
            return Err(Error::BadSocket);
        }

        let rxbuf = if rxbuf == 0 { 32768 } else { rxbuf };
        let txbuf = if txbuf == 0 { 32768 } else { txbuf };

        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_SNDBUF, txbuf as libc::c_int)?;
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_RCVBUF, rxbuf as libc::c_int)?;

        self.bufsize = rxbuf;
        self.bufsize_set = true;
        Ok(())
    }

    /// Whether peer credentials are requested on receive.
    pub fn passcred(&self) -> bool {
        self.passcred
    }

    /// Toggle SCM_CREDENTIALS reception.
    pub fn set_passcred(&mut self, on: bool) -> Result<()> {
        if self.fd < 0 {
            return Err(Error::BadSocket);
        }
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_PASSCRED, on as libc::c_int)?;
        self.passcred = on;
        Ok(())
    }

    /// Whether receive probes datagram sizes with MSG_PEEK|MSG_TRUNC.
    pub fn msg_peek(&self) -> bool {
        self.peek
    }

    /// Size receive buffers by peeking before the actual read.
    pub fn enable_msg_peek(&mut self) {
        self.peek = true;
    }

    /// Disable the peek probe, trusting the configured buffer size.
    pub fn disable_msg_peek(&mut self) {
        self.peek = false;
    }

    /// Whether requests automatically ask for an acknowledgement.
    pub fn auto_ack(&self) -> bool {
        !self.no_auto_ack
    }

    /// Stop requesting acknowledgements on completion; also disables the
    /// built-in sequence checking on receive.
    pub fn disable_auto_ack(&mut self) {
        self.no_auto_ack = true;
    }

    /// Request an acknowledgement for every completed message (default).
    pub fn enable_auto_ack(&mut self) {
        self.no_auto_ack = false;
    }

    /// Put the descriptor into non-blocking mode.
    pub fn set_nonblocking(&mut self, on: bool) -> Result<()> {
        if self.fd < 0 {
            return Err(Error::BadSocket);
        }

        // SAFETY: F_GETFL/F_SETFL on an owned descriptor.
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        // SAFETY: as above.
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Subscribe to a multicast group.
    pub fn add_membership(&mut self, group: u32) -> Result<()> {
        if self.fd < 0 {
            return Err(Error::BadSocket);
        }
        self.setsockopt_int(
            libc::SOL_NETLINK,
            libc::NETLINK_ADD_MEMBERSHIP,
            group as libc::c_int,
        )
    }

    /// Unsubscribe from a multicast group.
    pub fn drop_membership(&mut self, group: u32) -> Result<()> {
        if self.fd < 0 {
            return Err(Error::BadSocket);
        }
        self.setsockopt_int(
            libc::SOL_NETLINK,
            libc::NETLINK_DROP_MEMBERSHIP,
            group as libc::c_int,
        )
    }

    /// The socket's default callback set.
    pub fn callbacks(&self) -> &Arc<Callbacks> {
        &self.cb
    }

    /// Replace the socket's default callback set.
    pub fn set_callbacks(&mut self, cb: Arc<Callbacks>) {
        self.cb = cb;
    }

    fn setsockopt_int(&self, level: libc::c_int, option: libc::c_int, value: libc::c_int) -> Result<()> {
        // SAFETY: value is a live c_int, optlen matches.
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                option,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Default for NetlinkSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        self.close();
    }
}
