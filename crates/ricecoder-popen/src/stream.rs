//! Parent-side ends of child stdio pipes

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;

/// Readable end of a pipe connected to a child's stdout or stderr
///
/// Dropping the reader closes the descriptor.
#[derive(Debug)]
pub struct PipeReader {
    file: File,
}

/// Writable end of a pipe connected to a child's stdin
///
/// Dropping the writer closes the descriptor, which the child sees as EOF.
#[derive(Debug)]
pub struct PipeWriter {
    file: File,
}

impl PipeReader {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { file: File::from(fd) }
    }

    /// Switch the descriptor to non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        set_nonblocking(self.file.as_raw_fd(), nonblocking)
    }

    /// Read everything until EOF
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl PipeWriter {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { file: File::from(fd) }
    }

    /// Switch the descriptor to non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        set_nonblocking(self.file.as_raw_fd(), nonblocking)
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl AsFd for PipeReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsFd for PipeWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl From<PipeReader> for OwnedFd {
    fn from(reader: PipeReader) -> Self {
        reader.file.into()
    }
}

impl From<PipeWriter> for OwnedFd {
    fn from(writer: PipeWriter) -> Self {
        writer.file.into()
    }
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: fd is borrowed from a live File for the duration of the call
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    // SAFETY: as above
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a pipe whose ends are not inherited across exec
///
/// Returns `(read_end, write_end)`.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
    target_os = "solaris"
))]
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

/// Create a pipe whose ends are not inherited across exec
///
/// Returns `(read_end, write_end)`.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
    target_os = "solaris"
)))]
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        // SAFETY: fd is owned by this function
        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
        if ret < 0 {
            return Err(Errno::last());
        }
    }
    Ok((read, write))
}

/// Create a connected reader/writer pair
pub(crate) fn pipe_pair() -> io::Result<(PipeReader, PipeWriter)> {
    let (read, write) = cloexec_pipe()?;
    Ok((PipeReader::new(read), PipeWriter::new(write)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip_and_eof() {
        let (mut reader, mut writer) = pipe_pair().unwrap();
        writer.write_all(b"hello").unwrap();
        drop(writer);
        assert_eq!(reader.read_all().unwrap(), b"hello");
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (mut reader, _writer) = pipe_pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_write_after_reader_closed_is_broken_pipe() {
        let (reader, mut writer) = pipe_pair().unwrap();
        drop(reader);
        let err = writer.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
