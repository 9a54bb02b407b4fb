// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The fd watcher: an epoll adapter reporting batched readiness events.
//!
//! Unlike a `Future`/`Waker`-based reactor, this adapter stores a raw
//! `(RawFd, Interest)` to readiness-slot mapping and hands back `Event`s
//! for the scheduler to translate into ivar fills itself (see the
//! scheduler's step 4); there is no waker machinery here by design.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::{debug, trace, warn};

/// Which direction of readiness a registration is watching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dir {
    Read,
    Write,
}

/// The outcome `poll` reports for a single watched `(fd, dir)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyKind {
    Ready,
    BadFd,
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub dir: Dir,
    pub kind: ReadyKind,
}

fn dir_to_epoll_bit(dir: Dir) -> u32 {
    match dir {
        Dir::Read => libc::EPOLLIN as u32,
        Dir::Write => libc::EPOLLOUT as u32,
    }
}

/// Level-triggered epoll adapter. One instance per scheduler.
pub(crate) struct FdWatcher {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    /// Directions currently registered per raw fd, so `register`/
    /// `unregister` can recompute the combined epoll event mask.
    interests: HashMap<RawFd, Vec<Dir>>,
    batch: usize,
}

impl FdWatcher {
    pub(crate) fn new(batch: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            unsafe { libc::close(epoll_fd) };
            return Err(io::Error::last_os_error());
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            interests: HashMap::new(),
            batch,
        })
    }

    fn sync_epoll(&self, fd: RawFd, dirs: &[Dir]) -> io::Result<()> {
        let mut events = 0u32;
        for d in dirs {
            events |= dir_to_epoll_bit(*d);
        }
        // Only called for an fd that is already registered with epoll (a
        // second direction being added, a direction being dropped, or the
        // last direction being dropped) -- never the first ADD, which
        // `register` routes through `sync_epoll_add` instead.
        let op = if dirs.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev as *mut _
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, ptr) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL
                && matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF))
            {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Register interest in `dir` for `fd`. Idempotent: registering a
    /// direction already registered is a no-op.
    pub(crate) fn register(&mut self, fd: RawFd, dir: Dir) -> io::Result<()> {
        let dirs = self.interests.entry(fd).or_default();
        if dirs.contains(&dir) {
            return Ok(());
        }
        let was_empty = dirs.is_empty();
        dirs.push(dir);
        let dirs_snapshot = dirs.clone();
        if was_empty {
            self.sync_epoll_add(fd, &dirs_snapshot)?;
        } else {
            self.sync_epoll(fd, &dirs_snapshot)?;
        }
        trace!(fd, ?dir, "fd_watcher: registered");
        Ok(())
    }

    fn sync_epoll_add(&self, fd: RawFd, dirs: &[Dir]) -> io::Result<()> {
        let mut events = 0u32;
        for d in dirs {
            events |= dir_to_epoll_bit(*d);
        }
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Unregister interest in `dir` for `fd`.
    pub(crate) fn unregister(&mut self, fd: RawFd, dir: Dir) -> io::Result<()> {
        if let Some(dirs) = self.interests.get_mut(&fd) {
            dirs.retain(|d| *d != dir);
            let dirs_snapshot = dirs.clone();
            self.sync_epoll(fd, &dirs_snapshot)?;
            if dirs_snapshot.is_empty() {
                self.interests.remove(&fd);
            }
        }
        trace!(fd, ?dir, "fd_watcher: unregistered");
        Ok(())
    }

    /// Drop every registration for `fd`, regardless of direction.
    pub(crate) fn unregister_all(&mut self, fd: RawFd) -> io::Result<()> {
        if self.interests.remove(&fd).is_some() {
            self.sync_epoll(fd, &[])?;
        }
        Ok(())
    }

    /// Block up to `timeout` (or forever if `None`) for readiness,
    /// returning the batch of events observed. A fatal watcher error (not
    /// `EINTR`) is surfaced to the caller, who tears down the scheduler.
    pub(crate) fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };

        let mut raw_events = vec![libc::epoll_event { events: 0, u64: 0 }; self.batch];
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, raw_events.as_mut_ptr(), self.batch as i32, timeout_ms)
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            warn!(error = %err, "fd_watcher: epoll_wait failed fatally");
            return Err(err);
        }

        let mut out = Vec::new();
        for raw in raw_events.into_iter().take(n as usize) {
            let fd = raw.u64 as RawFd;
            if fd == self.wake_fd {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                continue;
            }

            let bad = raw.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
            if let Some(dirs) = self.interests.get(&fd) {
                for dir in dirs {
                    let bit = dir_to_epoll_bit(*dir);
                    if raw.events & bit != 0 || bad {
                        let kind = if bad { ReadyKind::BadFd } else { ReadyKind::Ready };
                        debug!(fd, ?dir, ?kind, "fd_watcher: event");
                        out.push(Event { fd, dir: *dir, kind });
                    }
                }
            }
        }
        Ok(out)
    }

    /// Interrupt a blocked `poll` call from outside it (e.g. after a new
    /// registration lands from a signal handler, or at shutdown).
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for FdWatcher {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
