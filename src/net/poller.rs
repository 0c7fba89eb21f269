// src/net/poller.rs - Readiness multiplexer
//
// Thin platform abstraction over epoll (Linux) and kqueue (macOS/BSD), both
// driven edge-triggered: the engine must drain a ready socket until
// WouldBlock or the edge is lost. EINTR is retried here, never surfaced.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness interest for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    /// Both directions; the usual registration for a connected socket, since
    /// edge-triggered writable only fires on buffer-space transitions.
    pub const DUPLEX: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// One readiness event, keyed by the registration token.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

const MAX_EVENTS: usize = 256;

#[cfg(target_os = "linux")]
mod sys {
    use super::*;

    pub struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Poller> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { epfd })
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            let mut events = libc::EPOLLET as u32;
            if interest.readable {
                events |= libc::EPOLLIN as u32;
            }
            if interest.writable {
                events |= libc::EPOLLOUT as u32;
            }
            let mut event = libc::epoll_event {
                events,
                u64: token as u64,
            };
            let event_ptr = if op == libc::EPOLL_CTL_DEL {
                std::ptr::null_mut()
            } else {
                &mut event
            };
            if unsafe { libc::epoll_ctl(self.epfd, op, fd, event_ptr) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
        }

        pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Interest::READABLE)
        }

        pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timeout_ms = timeout.map(|d| d.as_millis() as libc::c_int).unwrap_or(-1);
            let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
            loop {
                let count = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
                };
                if count < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                let mut result = Vec::with_capacity(count as usize);
                for event in events.iter().take(count as usize) {
                    result.push(Event {
                        token: event.u64 as usize,
                        readable: event.events & libc::EPOLLIN as u32 != 0,
                        writable: event.events & libc::EPOLLOUT as u32 != 0,
                        error: event.events & libc::EPOLLERR as u32 != 0,
                        hangup: event.events & libc::EPOLLHUP as u32 != 0,
                    });
                }
                return Ok(result);
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.epfd) };
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod sys {
    use super::*;

    pub struct Poller {
        kq: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Poller> {
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { kq })
        }

        fn changes(fd: RawFd, token: usize, interest: Interest, flags: u16) -> Vec<libc::kevent> {
            let mut changes = Vec::with_capacity(2);
            if interest.readable {
                changes.push(libc::kevent {
                    ident: fd as usize,
                    filter: libc::EVFILT_READ,
                    flags,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut libc::c_void,
                });
            }
            if interest.writable {
                changes.push(libc::kevent {
                    ident: fd as usize,
                    filter: libc::EVFILT_WRITE,
                    flags,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut libc::c_void,
                });
            }
            changes
        }

        fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
            let rc = unsafe {
                libc::kevent(
                    self.kq,
                    changes.as_ptr(),
                    changes.len() as i32,
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            // EV_CLEAR gives edge-triggered semantics matching epoll's EPOLLET
            self.submit(&Self::changes(
                fd,
                token,
                interest,
                libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
            ))
        }

        pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
            // filters may not both exist; EV_DELETE errors are expected noise
            let _ = self.submit(&Self::changes(fd, 0, Interest::DUPLEX, libc::EV_DELETE));
            Ok(())
        }

        pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timespec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let timeout_ptr = timespec
                .as_ref()
                .map(|t| t as *const libc::timespec)
                .unwrap_or(std::ptr::null());
            let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
            loop {
                let count = unsafe {
                    libc::kevent(
                        self.kq,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout_ptr,
                    )
                };
                if count < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                // one kevent per filter; merge read/write pairs by token
                let mut result: Vec<Event> = Vec::with_capacity(count as usize);
                for ev in events.iter().take(count as usize) {
                    let token = ev.udata as usize;
                    let entry = match result.iter_mut().find(|e| e.token == token) {
                        Some(entry) => entry,
                        None => {
                            result.push(Event {
                                token,
                                readable: false,
                                writable: false,
                                error: false,
                                hangup: false,
                            });
                            result.last_mut().unwrap()
                        }
                    };
                    match ev.filter {
                        libc::EVFILT_READ => entry.readable = true,
                        libc::EVFILT_WRITE => entry.writable = true,
                        _ => {}
                    }
                    if ev.flags & libc::EV_ERROR != 0 {
                        entry.error = true;
                    }
                    if ev.flags & libc::EV_EOF != 0 {
                        entry.hangup = true;
                    }
                }
                return Ok(result);
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.kq) };
        }
    }
}

pub use sys::Poller;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_readable_and_writable_events() {
        let poller = Poller::new().expect("poller");

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        client.set_nonblocking(true).expect("nonblocking");
        let (mut server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");

        poller
            .register(client.as_raw_fd(), 1, Interest::READABLE)
            .expect("register client");
        poller
            .register(server.as_raw_fd(), 2, Interest::DUPLEX)
            .expect("register server");

        // fresh connected socket has buffer space: writable edge
        let events = poller.poll(Some(Duration::from_millis(200))).expect("poll");
        assert!(events.iter().any(|e| e.token == 2 && e.writable));

        server.write_all(b"ping").expect("write");
        let events = poller.poll(Some(Duration::from_millis(200))).expect("poll");
        assert!(events.iter().any(|e| e.token == 1 && e.readable));

        poller.deregister(client.as_raw_fd()).expect("deregister");
        poller.deregister(server.as_raw_fd()).expect("deregister");
    }

    #[test]
    fn test_deregistered_fd_is_silent() {
        let poller = Poller::new().expect("poller");

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (mut server, _) = listener.accept().expect("accept");

        poller
            .register(client.as_raw_fd(), 7, Interest::READABLE)
            .expect("register");
        poller.deregister(client.as_raw_fd()).expect("deregister");

        server.write_all(b"data after deregister").expect("write");
        let events = poller.poll(Some(Duration::from_millis(50))).expect("poll");
        assert!(!events.iter().any(|e| e.token == 7));
    }

    #[test]
    fn test_poll_timeout_returns_empty() {
        let poller = Poller::new().expect("poller");
        let events = poller.poll(Some(Duration::from_millis(10))).expect("poll");
        assert!(events.is_empty());
    }
}
