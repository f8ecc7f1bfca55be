//! Thin wrappers over the epoll and pipe syscalls
//!
//! Errors carry the failing call and errno; callers decide what to log.

use std::os::unix::io::RawFd;

use weft_core::{WeftError, WeftResult};

/// Edge-trigger bit as a u32, matching `epoll_event.events`.
pub(crate) const ET: u32 = 1 << 31;

pub(crate) const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub(crate) const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

/// An owned epoll instance.
pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> WeftResult<Epoll> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(WeftError::last_os_error("epoll_create1"));
        }
        Ok(Epoll { fd })
    }

    /// Register, modify, or delete interest in `fd`. `token` comes back
    /// in `epoll_event.u64` on readiness.
    pub fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> WeftResult<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let rt = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if rt != 0 {
            return Err(WeftError::last_os_error("epoll_ctl"));
        }
        Ok(())
    }

    /// Wait for readiness, retrying EINTR with the same timeout.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> WeftResult<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = WeftError::last_os_error("epoll_wait");
            if matches!(err, WeftError::Syscall { errno, .. } if errno == libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Non-blocking self-pipe used to break workers out of `epoll_wait`.
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> WeftResult<WakePipe> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rt != 0 {
            return Err(WeftError::last_os_error("pipe"));
        }
        let pipe = WakePipe {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        // Both ends non-blocking: the reactor drains without stalling and
        // a burst of tickles into a full pipe is simply dropped.
        set_nonblocking(pipe.read_fd)?;
        set_nonblocking(pipe.write_fd)?;
        Ok(pipe)
    }

    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Write the one-byte wake token.
    pub fn notify(&self) {
        let rt = unsafe { libc::write(self.write_fd, b"T".as_ptr() as *const libc::c_void, 1) };
        if rt < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN {
                tracing::error!("wake pipe write failed: errno {}", errno);
            }
        }
    }

    /// Consume queued wake tokens until the pipe runs dry.
    pub fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> WeftResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(WeftError::last_os_error("fcntl"));
    }
    let rt = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rt < 0 {
        return Err(WeftError::last_os_error("fcntl"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_pipe_roundtrip() {
        let pipe = WakePipe::new().unwrap();
        pipe.notify();
        pipe.notify();

        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(pipe.read_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"TT");
    }

    #[test]
    fn test_drain_empties_pipe() {
        let pipe = WakePipe::new().unwrap();
        for _ in 0..10 {
            pipe.notify();
        }
        pipe.drain();

        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(pipe.read_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert!(n < 0, "pipe should be empty (EAGAIN)");
    }

    #[test]
    fn test_epoll_sees_pipe_readability() {
        let epoll = Epoll::new().unwrap();
        let pipe = WakePipe::new().unwrap();
        epoll
            .ctl(libc::EPOLL_CTL_ADD, pipe.read_fd(), EPOLLIN | ET, 7)
            .unwrap();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        pipe.notify();
        let n = epoll.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let ev = events[0];
        let ev_u64 = ev.u64;
        let ev_events = ev.events;
        assert_eq!(ev_u64, 7);
        assert_ne!(ev_events & EPOLLIN, 0);
    }
}
