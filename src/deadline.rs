//! Per-phase wall-clock limits
//!
//! Every blocking read or write on the connection or on a CGI pipe goes
//! through a `DeadlineReader` or `DeadlineWriter`. Before touching the
//! descriptor they wait for readiness with `poll(2)`, bounded by whatever
//! time the current phase has left. Running out surfaces as
//! `io::ErrorKind::TimedOut`, which ends the whole connection; nothing ever
//! resumes after a timeout.

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::ChildStdout;
use std::time::{Duration, Instant};

/// Status recorded in the access log when a deadline expires: 900 plus the
/// number of the alarm signal classic servers die from.
pub const TIMEOUT_STATUS: &'static str = "914";

/// The stages of a request, each with its own allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Request line and headers
    Header,
    /// Waiting for the next request on a kept-alive connection
    Idle,
    /// Reading a POST body of the given length
    Body(u64),
    /// Resolution, authorization, and starting the CGI program
    Process,
    /// Waiting for the CGI program's header block
    CgiHeaders,
    /// Relaying the CGI program's body
    CgiBody,
    /// Transmitting a static file of the given size
    StaticBody(u64)
}

impl Phase {
    pub fn limit(self) -> Duration {
        match self {
            Phase::Header => Duration::from_secs(15),
            Phase::Idle => Duration::from_secs(30),
            Phase::Body(len) => Duration::from_secs(15 + len / 2000),
            Phase::Process => Duration::from_secs(10),
            Phase::CgiHeaders => Duration::from_secs(15),
            Phase::CgiBody => Duration::from_secs(300),
            Phase::StaticBody(size) => Duration::from_secs(30 + size / 1000)
        }
    }
}

/// A point in time after which I/O fails, or no limit at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Deadline {
        Deadline(None)
    }

    pub fn after(limit: Duration) -> Deadline {
        Deadline(Some(Instant::now() + limit))
    }

    /// Time left, `None` when unlimited
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining() == Some(Duration::from_secs(0))
    }
}

/// Hands out deadlines for phases, or none at all in debug mode
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    enabled: bool
}

impl Clock {
    pub fn new(enabled: bool) -> Clock {
        Clock { enabled: enabled }
    }

    pub fn deadline(&self, phase: Phase) -> Deadline {
        if self.enabled {
            Deadline::after(phase.limit())
        }
        else {
            Deadline::none()
        }
    }
}

/// Things that may be waited on with `poll(2)`
///
/// In-memory buffers never block, so they have no descriptor to offer.
pub trait Pollable {
    fn poll_fd(&self) -> Option<RawFd>;
}

impl Pollable for File {
    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl Pollable for ChildStdout {
    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl<'a> Pollable for &'a [u8] {
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

impl Pollable for Vec<u8> {
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

impl<T> Pollable for Cursor<T> {
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline expired")
}

/// Safe wrapper for `libc::poll` on a single descriptor. `None` waits
/// indefinitely.
///
/// Returns `Ok(false)` when the timeout elapsed first.
fn poll_one(fd: RawFd, events: libc::c_short, timeout: Option<Duration>)
            -> io::Result<bool>
{
    let millis = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1
    };
    let mut pfd = libc::pollfd { fd: fd, events: events, revents: 0 };

    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret >= 0 {
            return Ok(ret > 0);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Blocks until `fd` is ready for `events` or the deadline passes.
fn wait_ready(fd: Option<RawFd>, events: libc::c_short, deadline: &Deadline)
              -> io::Result<()>
{
    if deadline.expired() {
        return Err(timed_out());
    }

    match fd {
        Some(fd) => if poll_one(fd, events, deadline.remaining())? {
            Ok(())
        }
        else {
            Err(timed_out())
        },
        None => Ok(())
    }
}

/// Turns `O_NONBLOCK` on or off for `fd`.
///
/// Deadlines only bind on a non-blocking descriptor: once `poll` reports a
/// little room, a blocking `write` still waits for the whole buffer.
pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let flags = if on { flags | OFlag::O_NONBLOCK } else { flags & !OFlag::O_NONBLOCK };
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// A reader that refuses to block past its deadline
#[derive(Debug)]
pub struct DeadlineReader<R> {
    inner: R,
    deadline: Deadline
}

impl<R: Read + Pollable> DeadlineReader<R> {
    pub fn new(inner: R) -> DeadlineReader<R> {
        DeadlineReader { inner: inner, deadline: Deadline::none() }
    }

    pub fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = deadline;
    }

    #[inline]
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read + Pollable> Read for DeadlineReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            wait_ready(self.inner.poll_fd(), libc::POLLIN, &self.deadline)?;
            match self.inner.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result
            }
        }
    }
}

/// A writer that refuses to block past its deadline
#[derive(Debug)]
pub struct DeadlineWriter<W> {
    inner: W,
    deadline: Deadline
}

impl<W: Write + Pollable> DeadlineWriter<W> {
    pub fn new(inner: W) -> DeadlineWriter<W> {
        DeadlineWriter { inner: inner, deadline: Deadline::none() }
    }

    #[inline]
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Pollable> Write for DeadlineWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            wait_ready(self.inner.poll_fd(), libc::POLLOUT, &self.deadline)?;
            match self.inner.write(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Chunk size for each `sendfile` call, so the deadline is rechecked
/// regularly on large files.
#[cfg(target_os = "linux")]
const SENDFILE_CHUNK: usize = 1 << 20;

/// The client-facing side of a connection
///
/// Besides plain writes it can take a whole file, possibly without copying
/// it through user space, and be given a new deadline as the request moves
/// between phases.
pub trait Output: Write {
    fn set_deadline(&mut self, deadline: Deadline);

    /// Copies `len` bytes of `file` out, returning the count sent.
    fn send_file(&mut self, file: &mut File, len: u64) -> io::Result<u64>;
}

impl<W: Write + Pollable> Output for DeadlineWriter<W> {
    fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = deadline;
    }

    fn send_file(&mut self, file: &mut File, len: u64) -> io::Result<u64> {
        #[cfg(target_os = "linux")]
        {
            if let Some(out_fd) = self.inner.poll_fd() {
                return sendfile_all(out_fd, file, len, &self.deadline);
            }
        }

        io::copy(&mut file.take(len), self)
    }
}

impl<'a, O: Output + ?Sized> Output for &'a mut O {
    fn set_deadline(&mut self, deadline: Deadline) {
        (**self).set_deadline(deadline)
    }

    fn send_file(&mut self, file: &mut File, len: u64) -> io::Result<u64> {
        (**self).send_file(file, len)
    }
}

/// Safe-ish wrapper for `libc::sendfile`, looping until `len` bytes are out.
#[cfg(target_os = "linux")]
fn sendfile_all(out_fd: RawFd, file: &mut File, len: u64, deadline: &Deadline)
                -> io::Result<u64>
{
    let mut offset: libc::off_t = 0;
    let mut sent = 0;

    while sent < len {
        wait_ready(Some(out_fd), libc::POLLOUT, deadline)?;
        let count = ((len - sent) as usize).min(SENDFILE_CHUNK);
        let ret = unsafe {
            libc::sendfile(out_fd, file.as_raw_fd(), &mut offset, count)
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted ||
                err.kind() == io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            // File shrank underneath us
            break;
        }
        sent += ret as u64;
    }

    Ok(sent)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_clock_never_expires() {
        let clock = Clock::new(false);
        assert_eq!(clock.deadline(Phase::Header), Deadline::none());
        assert_eq!(Deadline::none().remaining(), None);
        assert!(!Deadline::none().expired());
    }

    #[test]
    fn body_allowance_scales_with_length() {
        assert_eq!(Phase::Body(0).limit(), Duration::from_secs(15));
        assert_eq!(Phase::Body(200_000).limit(), Duration::from_secs(115));
        assert_eq!(Phase::StaticBody(1_000_000).limit(),
                   Duration::from_secs(1030));
    }

    #[test]
    fn expired_deadline_fails_reads() {
        let mut reader = DeadlineReader::new(&b"GET / HTTP/1.1\r\n"[..]);
        reader.set_deadline(Deadline::after(Duration::from_secs(0)));

        let mut buf = [0; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn live_deadline_lets_reads_through() {
        let mut reader = DeadlineReader::new(&b"abc"[..]);
        reader.set_deadline(Deadline::after(Duration::from_secs(60)));

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn pipe_without_data_times_out() {
        use std::os::unix::io::FromRawFd;

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let read_end = unsafe { File::from_raw_fd(fds[0]) };
        let _write_end = unsafe { File::from_raw_fd(fds[1]) };

        let mut reader = DeadlineReader::new(read_end);
        reader.set_deadline(Deadline::after(Duration::from_millis(50)));

        let mut buf = [0; 1];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn in_memory_output_copies_files() {
        use std::io::{Seek, SeekFrom};

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"static bytes").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut out = DeadlineWriter::new(Vec::new());
        assert_eq!(out.send_file(&mut file, 12).unwrap(), 12);
        assert_eq!(out.get_ref(), b"static bytes");
    }

    /// One end of a socket pair whose peer never reads, in the state the
    /// server puts its connection in.
    fn stalled_socket() -> (File, std::os::unix::net::UnixStream) {
        use std::os::fd::OwnedFd;
        use std::os::unix::net::UnixStream;

        let (ours, peer) = UnixStream::pair().unwrap();
        let file = File::from(OwnedFd::from(ours));
        set_nonblocking(file.as_raw_fd(), true).unwrap();
        (file, peer)
    }

    #[test]
    fn stalled_peer_times_out_large_writes() {
        let (socket, _peer) = stalled_socket();
        let mut out = DeadlineWriter::new(socket);
        out.set_deadline(Deadline::after(Duration::from_millis(200)));

        let started = Instant::now();
        let err = out.write_all(&vec![b'x'; 8 << 20]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stalled_peer_times_out_sendfile() {
        let (socket, _peer) = stalled_socket();
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(8 << 20).unwrap();

        let mut out = DeadlineWriter::new(socket);
        out.set_deadline(Deadline::after(Duration::from_millis(200)));

        let started = Instant::now();
        let err = out.send_file(&mut file, 8 << 20).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn nonblocking_reads_wait_for_data() {
        let (socket, mut peer) = stalled_socket();
        let mut reader = DeadlineReader::new(socket);
        reader.set_deadline(Deadline::after(Duration::from_secs(60)));

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            peer.write_all(b"late").unwrap();
            peer
        });

        let mut buf = [0; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"late");
        writer.join().unwrap();
    }

    #[test]
    fn nonblocking_flag_toggles() {
        let (socket, _peer) = stalled_socket();
        let fd = socket.as_raw_fd();
        let flags = || OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());

        assert!(flags().contains(OFlag::O_NONBLOCK));
        set_nonblocking(fd, false).unwrap();
        assert!(!flags().contains(OFlag::O_NONBLOCK));
    }
}
