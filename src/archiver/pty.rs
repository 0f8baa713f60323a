//! Pseudo terminals for archiver processes.
//!
//! borg only interleaves prompts and progress sensibly when it believes it is
//! talking to a terminal, so every process gets its own pty. The supervisor
//! keeps the master side: echo is turned off (so typed secrets are not sent
//! back as output) and the descriptor is made non-blocking for the poll loop.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;

use anyhow::{Context, anyhow};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};

pub struct PtyProcess {
    pub child: Box<dyn Child + Send + Sync>,
    pub output: PtyOutput,
    pub input: Box<dyn Write + Send>,
}

/// Spawn `command` with its stdin, stdout and stderr on a new pty.
pub fn spawn(command: CommandBuilder) -> anyhow::Result<PtyProcess> {
    let pair = native_pty_system()
        .openpty(PtySize::default())
        .map_err(|e| anyhow!("failed to open pty: {e}"))?;
    let fd = pair.master.as_raw_fd().context("pty master has no descriptor")?;
    disable_echo(fd).context("failed to disable pty echo")?;
    set_nonblocking(fd).context("failed to make pty non-blocking")?;

    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|e| anyhow!("failed to spawn archiver: {e}"))?;
    // Only the child should hold the slave; otherwise reads never see EOF.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow!("failed to clone pty reader: {e}"))?;
    let input = pair
        .master
        .take_writer()
        .map_err(|e| anyhow!("failed to take pty writer: {e}"))?;

    Ok(PtyProcess {
        child,
        output: PtyOutput {
            fd,
            reader,
            closed: false,
            _master: pair.master,
        },
        input,
    })
}

fn disable_echo(fd: RawFd) -> io::Result<()> {
    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut termios = unsafe { termios.assume_init() };
    termios.c_lflag &= !libc::ECHO;
    if unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &termios) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Read side of a pty master. Dropping it closes the master.
pub struct PtyOutput {
    fd: RawFd,
    reader: Box<dyn Read + Send>,
    closed: bool,
    _master: Box<dyn MasterPty + Send>,
}

impl PtyOutput {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// True once the slave side has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read everything available right now.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while !self.closed {
            match self.reader.read(&mut buf) {
                Ok(0) => self.closed = true,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the child side closes.
                Err(_) => self.closed = true,
            }
        }
        out
    }
}

/// Wait until one of `fds` is readable, or `timeout` elapses. Returns the
/// readable (or hung up) descriptors.
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<RawFd>> {
    let mut polled: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let ready = unsafe { libc::poll(polled.as_mut_ptr(), polled.len() as libc::nfds_t, timeout_ms) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }
    Ok(polled
        .iter()
        .filter(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|p| p.fd)
        .collect())
}
