// src/net/socket.rs - Non-blocking TCP/UDP endpoint
//
// One type serves both STREAM and DATAGRAM sockets. All higher layers send
// through write(), which preserves packet order via the send queue: once a
// byte is queued, no later packet may overtake it. flush() drains the queue
// front-to-back as the reactor reports writable.
//
// Construction never fails; an allocation/option failure is recorded as the
// sticky sockError and every subsequent operation short-circuits to it.

use crate::error::{NetError, Result};
use crate::net::address::SocketAddress;
use bytes::{Buf, Bytes};
use log::debug;
use socket2::{Domain, SockAddr, Socket as OsSocket, Type};
use std::collections::VecDeque;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Default kernel buffer sizes applied at construction (tunable per socket).
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 0x10000;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 0x10000;

/// Milliseconds since the first clock query; cheap monotonic stamps for
/// recvTime/sendTime without carrying Instants through atomics.
pub(crate) fn uptime_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Recv,
    Send,
    Both,
}

/// A pending segment: whatever could not be pushed to the OS yet.
struct Sending {
    data: Bytes,
    address: Option<SocketAddress>,
    flags: i32,
}

pub struct Socket {
    pub ty: SocketType,
    handle: Option<OsSocket>,
    /// Sticky initialization error; set once, checked by every operation.
    sock_error: Option<NetError>,
    /// Local address; a zero port means "computable via getsockname".
    address: Mutex<Option<SocketAddress>>,
    peer_address: Mutex<Option<SocketAddress>>,
    recv_buffer_size: AtomicUsize,
    send_buffer_size: AtomicUsize,
    listening: AtomicBool,
    /// Bytes currently known readable (maintained via available()).
    readable: AtomicUsize,
    /// Outstanding read-in-progress count (reactor bookkeeping).
    reading: AtomicUsize,
    recv_time: AtomicU64,
    send_time: AtomicU64,
    sendings: Mutex<VecDeque<Sending>>,
    queueing: AtomicUsize,
    sent_shutdown: AtomicBool,
}

impl Socket {
    pub fn new(ty: SocketType) -> Socket {
        let os_type = match ty {
            SocketType::Stream => Type::STREAM,
            SocketType::Datagram => Type::DGRAM,
        };
        let mut sock_error = None;
        let handle = match OsSocket::new(Domain::IPV6, os_type, None) {
            Ok(handle) => Some(handle),
            Err(error) => {
                sock_error = Some(NetError::from_io(&error, " (socket allocation)".into()));
                None
            }
        };
        let socket = Socket {
            ty,
            handle,
            sock_error,
            address: Mutex::new(None),
            peer_address: Mutex::new(None),
            recv_buffer_size: AtomicUsize::new(DEFAULT_RECV_BUFFER_SIZE),
            send_buffer_size: AtomicUsize::new(DEFAULT_SEND_BUFFER_SIZE),
            listening: AtomicBool::new(false),
            readable: AtomicUsize::new(0),
            reading: AtomicUsize::new(0),
            recv_time: AtomicU64::new(0),
            send_time: AtomicU64::new(0),
            sendings: Mutex::new(VecDeque::new()),
            queueing: AtomicUsize::new(0),
            sent_shutdown: AtomicBool::new(false),
        };
        socket.init();
        socket
    }

    /// TCP socket produced by accept(): already connected, options re-applied.
    fn accepted(handle: OsSocket, peer: SocketAddress) -> Socket {
        let socket = Socket {
            ty: SocketType::Stream,
            handle: Some(handle),
            sock_error: None,
            // computable: queried lazily on first address() call
            address: Mutex::new(Some(SocketAddress::loopback(0))),
            peer_address: Mutex::new(Some(peer)),
            recv_buffer_size: AtomicUsize::new(DEFAULT_RECV_BUFFER_SIZE),
            send_buffer_size: AtomicUsize::new(DEFAULT_SEND_BUFFER_SIZE),
            listening: AtomicBool::new(false),
            readable: AtomicUsize::new(0),
            reading: AtomicUsize::new(0),
            recv_time: AtomicU64::new(uptime_ms()),
            send_time: AtomicU64::new(0),
            sendings: Mutex::new(VecDeque::new()),
            queueing: AtomicUsize::new(0),
            sent_shutdown: AtomicBool::new(false),
        };
        socket.init();
        socket
    }

    /// Best-effort option setup; failures here are not sticky (the original
    /// allocation is, and these degrade gracefully).
    fn init(&self) {
        let Some(handle) = &self.handle else { return };
        // one AF_INET6 socket must accept v4-mapped and v6 peers
        let _ = handle.set_only_v6(false);
        let _ = handle.set_recv_buffer_size(self.recv_buffer_size.load(Ordering::Relaxed));
        let _ = handle.set_send_buffer_size(self.send_buffer_size.load(Ordering::Relaxed));
        #[cfg(target_vendor = "apple")]
        let _ = handle.set_nosigpipe(true);
        if self.ty == SocketType::Stream {
            let _ = handle.set_nodelay(true);
        }
    }

    fn handle(&self) -> Result<&OsSocket> {
        if let Some(error) = &self.sock_error {
            return Err(error.clone());
        }
        // sock_error is always set when handle is absent
        Ok(self.handle.as_ref().expect("socket handle"))
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.handle.as_ref().map(|h| h.as_raw_fd())
    }

    pub fn error(&self) -> Option<&NetError> {
        self.sock_error.as_ref()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let handle = self.handle()?;
        handle
            .set_nonblocking(nonblocking)
            .map_err(|e| NetError::from_io(&e, String::new()))
    }

    // ---- address bookkeeping -------------------------------------------------

    /// Local address; a zero-port sentinel triggers a getsockname query.
    pub fn address(&self) -> Option<SocketAddress> {
        let mut guard = self.address.lock().unwrap();
        if let Some(address) = *guard {
            if address.port() == 0 {
                if let Ok(handle) = self.handle() {
                    if let Ok(local) = handle.local_addr() {
                        if let Some(std_addr) = local.as_socket() {
                            *guard = Some(std_addr.into());
                        }
                    }
                }
            }
        }
        *guard
    }

    pub fn peer_address(&self) -> Option<SocketAddress> {
        *self.peer_address.lock().unwrap()
    }

    /// Mark the local address computable after the first successful IO, as a
    /// send/receive proves the socket got bound implicitly.
    fn mark_address_computable(&self) {
        let mut guard = self.address.lock().unwrap();
        if guard.is_none() {
            *guard = Some(SocketAddress::loopback(0));
        }
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size.load(Ordering::Relaxed)
    }

    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        let handle = self.handle()?;
        handle
            .set_recv_buffer_size(size)
            .map_err(|e| NetError::from_io(&e, format!(" (size={size})")))?;
        self.recv_buffer_size.store(size, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        let handle = self.handle()?;
        handle
            .set_send_buffer_size(size)
            .map_err(|e| NetError::from_io(&e, format!(" (size={size})")))?;
        self.send_buffer_size.store(size, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_linger(&self, linger: Option<Duration>) -> Result<()> {
        let handle = self.handle()?;
        handle
            .set_linger(linger)
            .map_err(|e| NetError::from_io(&e, String::new()))
    }

    pub fn set_reuse_port(&self, reuse: bool) {
        // not every platform honors it; best effort like the rest of init()
        #[cfg(not(target_os = "windows"))]
        if let Ok(handle) = self.handle() {
            let _ = handle.set_reuse_port(reuse);
        }
        #[cfg(target_os = "windows")]
        let _ = reuse;
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    /// Total bytes awaiting flush; the backpressure probe for upper layers.
    pub fn queueing(&self) -> usize {
        self.queueing.load(Ordering::Relaxed)
    }

    pub fn recv_time_ms(&self) -> u64 {
        self.recv_time.load(Ordering::Relaxed)
    }

    pub fn send_time_ms(&self) -> u64 {
        self.send_time.load(Ordering::Relaxed)
    }

    pub fn readable(&self) -> usize {
        self.readable.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_reading(&self) {
        self.reading.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_reading(&self) {
        self.reading.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn reading(&self) -> usize {
        self.reading.load(Ordering::Acquire)
    }

    /// Bytes available on the receive side (FIONREAD), cached in `readable`.
    pub fn available(&self) -> usize {
        let Some(fd) = self.raw_fd() else { return 0 };
        let mut value: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut value) };
        let available = if rc == 0 { value.max(0) as usize } else { 0 };
        self.readable.store(available, Ordering::Relaxed);
        available
    }

    // ---- lifecycle -----------------------------------------------------------

    pub fn bind(&self, address: SocketAddress) -> Result<()> {
        let handle = self.handle()?;
        handle
            .bind(&SockAddr::from(address.to_v6()))
            .map_err(|e| NetError::from_io(&e, format!(" (address={address})")))?;
        let mut guard = self.address.lock().unwrap();
        *guard = Some(if address.is_set() {
            address // port 0 stays computable
        } else {
            SocketAddress::loopback(0)
        });
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        let handle = self.handle()?;
        handle
            .listen(backlog)
            .map_err(|e| NetError::from_io(&e, format!(" (backlog={backlog})")))?;
        self.listening.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn accept(&self) -> Result<Socket> {
        let handle = self.handle()?;
        loop {
            match handle.accept() {
                Ok((accepted, peer)) => {
                    let peer = peer
                        .as_socket()
                        .map(SocketAddress::from)
                        .unwrap_or(SocketAddress::wildcard());
                    return Ok(Socket::accepted(accepted, peer));
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(NetError::from_io(&error, " (accept)".into())),
            }
        }
    }

    /// Connect, with an optional bounded readiness wait.
    ///
    /// - `timeout` > 0: temporarily non-blocking, single poll() bounded by
    ///   `timeout` seconds; elapsing reports CONNECTION_REFUSED.
    /// - `timeout` == 0: in-progress/would-block counts as success, the
    ///   caller waits on reactor readiness.
    /// - repeated connect to the same address is idempotent; a different
    ///   address on a connected socket fails with ALREADY_CONNECTED.
    /// - DATAGRAM with `None` disconnects by connecting to the wildcard.
    pub fn connect(&self, address: Option<SocketAddress>, timeout: u16) -> Result<()> {
        let handle = self.handle()?;

        let target = match (self.ty, address) {
            // null address on a datagram socket re-targets the wildcard,
            // dissolving the association (AF_UNSPEC is the portable spelling)
            (SocketType::Datagram, None) => {
                let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                storage.ss_family = libc::AF_UNSPEC as libc::sa_family_t;
                let rc = unsafe {
                    libc::connect(
                        handle.as_raw_fd(),
                        &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                };
                if rc != 0 {
                    let error = io::Error::last_os_error();
                    // some BSDs answer a successful dissolve with EAFNOSUPPORT
                    if error.raw_os_error() != Some(libc::EAFNOSUPPORT) {
                        return Err(NetError::from_io(&error, " (disconnect)".into()));
                    }
                }
                *self.peer_address.lock().unwrap() = None;
                return Ok(());
            }
            (_, Some(address)) => address,
            (SocketType::Stream, None) => {
                return Err(NetError::Other {
                    code: 0,
                    context: " (stream connect without address)".into(),
                })
            }
        };
        let context = format!(" (address={target})");

        if timeout > 0 {
            let _ = handle.set_nonblocking(true);
        }
        let rc = handle.connect(&SockAddr::from(target.to_v6()));
        if timeout > 0 {
            // no effect once the reactor owns the socket (it re-forces
            // non-blocking on registration)
            let _ = handle.set_nonblocking(false);
        }

        let connected = |socket: &Socket| {
            socket.mark_address_computable();
            *socket.peer_address.lock().unwrap() = address;
        };

        let error = match rc {
            Ok(()) => {
                connected(self);
                return Ok(());
            }
            Err(error) => error,
        };

        let code = error.raw_os_error().unwrap_or(0);
        let peer = self.peer_address();
        if peer.is_some() || code == libc::EISCONN {
            if peer == Some(target) {
                return Ok(()); // already connected to this address, no error
            }
            return Err(NetError::AlreadyConnected(context));
        }

        // EINPROGRESS/EWOULDBLOCK: first connect; EALREADY: repeated connect
        let in_progress = code == libc::EINPROGRESS
            || code == libc::EALREADY
            || code == libc::EWOULDBLOCK
            || error.kind() == io::ErrorKind::WouldBlock;
        if !in_progress {
            return Err(NetError::from_io(&error, context));
        }

        if timeout > 0 {
            let mut pollfd = libc::pollfd {
                fd: handle.as_raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pollfd, 1, i32::from(timeout) * 1000) };
            if rc <= 0 {
                // timeout (=> connection refused) or poll error
                return Err(NetError::ConnectionRefused(context));
            }
        }
        // timeout == 0: caller waits on readiness; record the peer either way
        connected(self);
        Ok(())
    }

    // ---- data path -----------------------------------------------------------

    fn io_context(&self, address: Option<&SocketAddress>, size: usize, flags: i32) -> String {
        match address.copied().or_else(|| self.peer_address()) {
            Some(addr) => format!(" (address={addr}, size={size}, flags={flags})"),
            None => format!(" (size={size}, flags={flags})"),
        }
    }

    /// Direct send to the OS; retries EINTR, refuses fragmented datagrams.
    pub fn send_to(
        &self,
        data: &[u8],
        address: Option<&SocketAddress>,
        flags: i32,
    ) -> Result<usize> {
        let handle = self.handle()?;
        #[cfg(target_os = "linux")]
        let flags = flags | libc::MSG_NOSIGNAL;

        let target = match (self.ty, address) {
            // for a STREAM socket, the destination must stay implicit
            (SocketType::Datagram, Some(addr)) if addr.is_set() => Some(SockAddr::from(addr.to_v6())),
            _ => None,
        };
        loop {
            let rc = match &target {
                Some(sockaddr) => handle.send_to_with_flags(data, sockaddr, flags),
                None => handle.send_with_flags(data, flags),
            };
            match rc {
                Ok(sent) => {
                    self.mark_address_computable();
                    self.send_time.store(uptime_ms(), Ordering::Relaxed);
                    if sent < data.len() && self.ty == SocketType::Datagram {
                        // a UDP payload may not be fragmented at this boundary
                        return Err(NetError::Other {
                            code: 0,
                            context: format!(
                                "; UDP packet sent in pieces{}",
                                self.io_context(address, data.len(), flags)
                            ),
                        });
                    }
                    return Ok(sent);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(NetError::from_io(
                        &error,
                        self.io_context(address, data.len(), flags),
                    ))
                }
            }
        }
    }

    pub fn send(&self, data: &[u8], flags: i32) -> Result<usize> {
        self.send_to(data, None, flags)
    }

    /// The queued producer entry point: all higher layers send through here.
    ///
    /// Returns the bytes handed to the OS now (0 when fully queued). Bytes
    /// not accepted by the OS are queued and shipped by flush() in order.
    pub fn write(&self, packet: Bytes, address: Option<SocketAddress>, flags: i32) -> Result<usize> {
        if let Some(error) = &self.sock_error {
            return Err(error.clone());
        }
        if self.sent_shutdown.load(Ordering::Acquire) {
            return Err(NetError::Shutdown(" (write after shutdown)".into()));
        }
        if packet.is_empty() {
            return Ok(0);
        }

        let mut sendings = self.sendings.lock().unwrap();
        if !sendings.is_empty() {
            // earlier bytes must leave first; the reactor will flush
            self.queueing.fetch_add(packet.len(), Ordering::Relaxed);
            sendings.push_back(Sending {
                data: packet,
                address: address.or_else(|| self.peer_address()),
                flags,
            });
            return Ok(0);
        }

        match self.send_to(&packet, address.as_ref(), flags) {
            Ok(sent) if sent >= packet.len() => Ok(packet.len()),
            Ok(sent) => {
                let rest = packet.slice(sent..);
                self.queueing.fetch_add(rest.len(), Ordering::Relaxed);
                sendings.push_back(Sending {
                    data: rest,
                    address: address.or_else(|| self.peer_address()),
                    flags,
                });
                Ok(sent)
            }
            Err(error) => {
                let connecting = matches!(error, NetError::NotConnected(_))
                    && self.peer_address().is_some();
                if error == NetError::WouldBlock || connecting {
                    // queue and wait for onFlush, no error
                    self.queueing.fetch_add(packet.len(), Ordering::Relaxed);
                    sendings.push_back(Sending {
                        data: packet,
                        address: address.or_else(|| self.peer_address()),
                        flags,
                    });
                    return Ok(0);
                }
                if self.ty == SocketType::Stream {
                    // reliability is forfeit: stop the OS side before anything
                    // else tries to send
                    self.shutdown_now(&mut sendings);
                }
                Err(error)
            }
        }
    }

    /// Drain the send queue front-to-back until empty, short write or
    /// would-block. On an unrecoverable STREAM error the socket is shut down
    /// and the queue cleared; a failed datagram is dropped alone.
    pub fn flush(&self) -> Result<()> {
        if let Some(error) = &self.sock_error {
            return Err(error.clone());
        }
        let mut sendings = self.sendings.lock().unwrap();
        loop {
            let Some(front) = sendings.front_mut() else {
                return Ok(());
            };
            let data = front.data.clone(); // O(1), keeps the borrow short
            let address = front.address;
            let flags = front.flags;
            match self.send_to(&data, address.as_ref(), flags) {
                Ok(sent) => {
                    self.queueing.fetch_sub(sent, Ordering::Relaxed);
                    if sent < front.data.len() {
                        front.data.advance(sent);
                        return Ok(()); // can't send more now
                    }
                    sendings.pop_front();
                }
                Err(error) => {
                    let connecting = matches!(error, NetError::NotConnected(_))
                        && self.peer_address().is_some();
                    if error == NetError::WouldBlock || connecting {
                        return Ok(()); // wait for the next writable event
                    }
                    if self.ty == SocketType::Stream {
                        // failed to ship reliable bytes: the stream is dead
                        self.shutdown_now(&mut sendings);
                        return Err(error);
                    }
                    // the failed datagram has been attempted; keep the rest
                    let dropped = sendings.pop_front().map(|s| s.data.len()).unwrap_or(0);
                    self.queueing.fetch_sub(dropped, Ordering::Relaxed);
                    return Err(error);
                }
            }
        }
    }

    /// Receive; retries EINTR. `from` requests the datagram source (for a
    /// STREAM socket the known peer is substituted). Returns Ok(0) on orderly
    /// FIN, WOULD_BLOCK when non-blocking and empty.
    pub fn receive(
        &self,
        buffer: &mut [u8],
        flags: i32,
        mut from: Option<&mut SocketAddress>,
    ) -> Result<usize> {
        let handle = self.handle()?;
        // sound: u8 -> MaybeUninit<u8> view, recv only writes
        let uninit =
            unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) };
        loop {
            let rc = if from.is_some() {
                handle
                    .recv_from_with_flags(uninit, flags)
                    .map(|(read, source)| (read, source.as_socket()))
            } else {
                handle.recv_with_flags(uninit, flags).map(|read| (read, None))
            };
            match rc {
                Ok((read, source)) => {
                    if let Some(out) = from.as_deref_mut() {
                        // recvfrom on a TCP socket does not report the peer
                        // reliably everywhere; substitute the known one
                        *out = if self.ty == SocketType::Stream {
                            self.peer_address().unwrap_or(SocketAddress::wildcard())
                        } else {
                            source.map(SocketAddress::from).unwrap_or(SocketAddress::wildcard())
                        };
                    }
                    self.mark_address_computable();
                    self.recv_time.store(uptime_ms(), Ordering::Relaxed);
                    let known = self.readable.load(Ordering::Relaxed);
                    self.readable.store(known.saturating_sub(read), Ordering::Relaxed);
                    return Ok(read);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(NetError::from_io(
                        &error,
                        self.io_context(None, buffer.len(), flags),
                    ))
                }
            }
        }
    }

    /// Graceful half/full close. Shutting down the send side flushes first,
    /// then clears the queue; the handle stays open until drop.
    pub fn shutdown(&self, kind: ShutdownKind) -> Result<()> {
        let handle = self.handle()?;
        let how = match kind {
            ShutdownKind::Recv => std::net::Shutdown::Read,
            ShutdownKind::Send => std::net::Shutdown::Write,
            ShutdownKind::Both => std::net::Shutdown::Both,
        };
        if kind != ShutdownKind::Recv {
            let _ = self.flush(); // try to ship what we can before closing
            self.sent_shutdown.store(true, Ordering::Release);
            let mut sendings = self.sendings.lock().unwrap();
            sendings.clear();
            self.queueing.store(0, Ordering::Relaxed);
        }
        handle
            .shutdown(how)
            .map_err(|e| NetError::from_io(&e, String::new()))
    }

    /// Immediate OS-level shutdown used on unrecoverable STREAM send errors;
    /// caller already holds the send mutex.
    fn shutdown_now(&self, sendings: &mut VecDeque<Sending>) {
        if let Some(fd) = self.raw_fd() {
            if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } != 0 {
                debug!(
                    "shutdown after send failure: {}",
                    io::Error::last_os_error()
                );
            }
        }
        self.sent_shutdown.store(true, Ordering::Release);
        sendings.clear();
        self.queueing.store(0, Ordering::Relaxed);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.handle.is_some() && self.sock_error.is_none() {
            // graceful disconnection: flush + shutdown, close happens with
            // the handle drop
            let _ = self.shutdown(ShutdownKind::Both);
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("ty", &self.ty)
            .field("address", &self.address.lock().unwrap())
            .field("peer", &self.peer_address.lock().unwrap())
            .field("queueing", &self.queueing())
            .finish()
    }
}
