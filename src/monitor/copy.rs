//! Copy-through mode: forward bytes from a readable source to a sink on
//! every readiness notification instead of invoking a callback.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use tracing::debug;

use super::MonitorError;

/// Chunk size for a single readiness notification.
pub(crate) const READ_CHUNK: usize = 1024;

/// Switch `fd` to non-blocking mode so a partial read never stalls the loop.
pub(crate) fn make_nonblock(fd: RawFd) -> Result<(), MonitorError> {
    debug!(fd, "making fd non-blocking for copy_to");
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(MonitorError::NonBlocking {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(MonitorError::NonBlocking {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Copy at most one chunk from `source` into `sink`.
pub(crate) fn copy_data<R: Read, W: Write>(fd: RawFd, source: &mut R, sink: &mut W) -> io::Result<usize> {
    let mut buf = [0u8; READ_CHUNK];
    let count = match source.read(&mut buf) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
        Err(e) => return Err(e),
    };
    sink.write_all(&buf[..count])?;
    sink.flush()?;
    debug!(fd, bytes = count, "copied data");
    Ok(count)
}

/// Read and discard one chunk from a source registered without a data callback.
pub(crate) fn drain(fd: RawFd) -> io::Result<usize> {
    let mut buf = [0u8; READ_CHUNK];
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rc as usize)
}
