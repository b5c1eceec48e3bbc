//! One-way report pipe between a worker and its parent.
//!
//! The parent keeps the read end; the write end is installed in the child as
//! descriptor [`REPORT_FD`] and the child learns it from [`REPORT_FD_VAR`].
//! The worker marks its end close-on-exec as soon as it takes ownership, but
//! anything the child forks can still hold a copy, so end-of-file says
//! nothing about whether the child has exited. The parent only reads reports
//! here; exits are detected with `waitpid(2)`.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Descriptor number of the write end inside the child.
pub const REPORT_FD: RawFd = 3;

/// Environment variable naming the report descriptor inside the child.
pub const REPORT_FD_VAR: &str = "TESSERA_REPORT_FD";

/// Create a pipe with close-on-exec set on both ends.
///
/// Returns `(read_end, write_end)`.
pub fn report_pipe() -> io::Result<(File, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        // SAFETY: fds has room for two descriptors.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        // SAFETY: fds has room for two descriptors.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            set_cloexec(fd, true)?;
        }
    }

    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((read, write))
}

/// Set or clear `FD_CLOEXEC` on a descriptor.
pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number; invalid descriptors yield EBADF.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number; invalid descriptors yield EBADF.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Make `fd` available as [`REPORT_FD`] across `exec`.
///
/// Runs in the forked child before exec, so it only makes raw system calls.
pub fn install_report_fd(fd: RawFd) -> io::Result<()> {
    if fd == REPORT_FD {
        // dup2 onto itself would leave close-on-exec set.
        return set_cloexec(fd, false);
    }
    // SAFETY: dup2 on descriptor numbers; the new descriptor has no
    // close-on-exec flag.
    if unsafe { libc::dup2(fd, REPORT_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open the report channel inside a worker, if the parent provided one.
pub fn open_report_channel() -> Option<File> {
    let fd: RawFd = std::env::var(REPORT_FD_VAR).ok()?.parse().ok()?;
    report_channel_from(fd)
}

/// Take ownership of an inherited report descriptor.
///
/// Sets close-on-exec so processes the worker spawns do not inherit it.
/// Fails (returns None) if the descriptor is not open.
fn report_channel_from(fd: RawFd) -> Option<File> {
    set_cloexec(fd, true).ok()?;
    // SAFETY: the parent installed this descriptor for us alone.
    Some(unsafe { File::from_raw_fd(fd) })
}

/// Wait until at least one descriptor is readable or hung up.
///
/// Returns the indices of ready descriptors; empty if the timeout elapsed.
/// `None` waits indefinitely.
pub fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<usize>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let timeout_ms: libc::c_int = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Round up so a sub-millisecond remainder still waits.
                remaining
                    .as_micros()
                    .div_ceil(1000)
                    .min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        // SAFETY: pollfds is a valid, initialized array of pollfd.
        let n = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        return Ok(pollfds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.revents != 0)
            .map(|(i, _)| i)
            .collect());
    }
}
