//! Process Supervisor.
//!
//! Runs one archiver per destination, concurrently, from a single thread:
//!
//! ```text
//! spawn N processes on ptys
//! loop while any is running:
//!     poll(all live pty masters, timeout)
//!     drain ready masters -> LineSplitter -> ArchiveStream
//!     reap exited processes (progress = 1.0, non-zero exit = failure)
//!     redraw "backup progress: N%" (mean over processes)
//! ```
//!
//! Processes live in a [`ProcessGroup`], whose `Drop` kills and reaps
//! anything still running, so an error returned from the middle of the loop
//! cannot leave archivers behind. A raised [`Interrupt`] is such an error.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use portable_pty::CommandBuilder;
use tracing::{debug, info, warn};

use super::passphrase::SecretMap;
use super::protocol::{ArchiveStream, LineSplitter, PromptBook, mean_progress};
use super::pty::{self, PtyOutput};
use super::version::{self, Protocol};
use crate::config::ArchiverSettings;
use crate::error::BackupError;
use crate::interrupt::Interrupt;
use crate::location::Location;
use crate::operator::Operator;
use crate::progress::{ProgressLine, percent};

// ---------------------------------------------------------------------------
// Children
// ---------------------------------------------------------------------------

/// A running archiver, as far as the supervisor needs to know.
pub trait ArchiveChild {
    /// Exit code, if the process has exited.
    fn try_wait(&mut self) -> io::Result<Option<u32>>;
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<u32>;
}

impl ArchiveChild for Box<dyn portable_pty::Child + Send + Sync> {
    fn try_wait(&mut self) -> io::Result<Option<u32>> {
        Ok(portable_pty::Child::try_wait(self.as_mut())?.map(|s| s.exit_code()))
    }

    fn kill(&mut self) -> io::Result<()> {
        portable_pty::ChildKiller::kill(self.as_mut())
    }

    fn wait(&mut self) -> io::Result<u32> {
        Ok(portable_pty::Child::wait(self.as_mut())?.exit_code())
    }
}

fn exit_code(status: std::process::ExitStatus) -> u32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u32,
        (None, Some(signal)) => 128 + signal as u32,
        (None, None) => 1,
    }
}

impl ArchiveChild for std::process::Child {
    fn try_wait(&mut self) -> io::Result<Option<u32>> {
        Ok(std::process::Child::try_wait(self)?.map(exit_code))
    }

    fn kill(&mut self) -> io::Result<()> {
        std::process::Child::kill(self)
    }

    fn wait(&mut self) -> io::Result<u32> {
        Ok(exit_code(std::process::Child::wait(self)?))
    }
}

// ---------------------------------------------------------------------------
// Process group
// ---------------------------------------------------------------------------

pub struct Slot {
    child: Box<dyn ArchiveChild>,
    /// `None` when the process writes straight to the terminal.
    output: Option<PtyOutput>,
    splitter: LineSplitter,
    stream: ArchiveStream,
    exit: Option<u32>,
}

impl Slot {
    pub fn new(child: Box<dyn ArchiveChild>, output: Option<PtyOutput>, stream: ArchiveStream) -> Self {
        Self {
            child,
            output,
            splitter: LineSplitter::new(),
            stream,
            exit: None,
        }
    }

    pub fn stream(&self) -> &ArchiveStream {
        &self.stream
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit
    }

    pub fn is_running(&self) -> bool {
        self.exit.is_none()
    }

    fn live_fd(&self) -> Option<std::os::fd::RawFd> {
        self.output.as_ref().filter(|o| !o.is_closed()).map(PtyOutput::fd)
    }

    /// Kill the process if it is still running, reap it, and close its pty.
    fn terminate(&mut self) {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(code)) => self.exit = Some(code),
                _ => {
                    // Losing the race with a natural exit is fine.
                    if let Err(e) = self.child.kill() {
                        debug!(tag = %self.stream.tag(), "kill: {e}");
                    }
                    match self.child.wait() {
                        Ok(code) => self.exit = Some(code),
                        Err(e) => warn!(tag = %self.stream.tag(), "failed to reap archiver: {e}"),
                    }
                }
            }
        }
        if let Some(mut output) = self.output.take() {
            let _ = output.drain();
        }
        self.stream.close_input();
    }
}

/// Every process spawned for one run.
#[derive(Default)]
pub struct ProcessGroup {
    slots: Vec<Slot>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, slot: Slot) {
        self.slots.push(slot);
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn any_running(&self) -> bool {
        self.slots.iter().any(Slot::is_running)
    }

    pub fn mean_progress(&self) -> f64 {
        mean_progress(self.slots.iter().map(Slot::stream))
    }

    /// Kill, reap and close everything.
    pub fn terminate_all(&mut self) {
        for slot in &mut self.slots {
            slot.terminate();
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct ArchiveRequest<'a> {
    pub destinations: &'a [Location],
    /// Denominator for progress; `None` disables percentages.
    pub total_size: Option<u64>,
    /// Working directory of every process; its contents (`.`) are archived.
    pub dir: &'a Path,
    pub secrets: &'a SecretMap,
    /// Archiver subcommand.
    pub verb: &'a str,
}

pub struct Supervisor<'a> {
    settings: &'a ArchiverSettings,
    operator: &'a mut dyn Operator,
    prompts: PromptBook,
    progress: &'a ProgressLine,
    interrupt: Interrupt,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        settings: &'a ArchiverSettings,
        operator: &'a mut dyn Operator,
        prompts: PromptBook,
        progress: &'a ProgressLine,
    ) -> Self {
        Self {
            settings,
            operator,
            prompts,
            progress,
            interrupt: Interrupt::new(),
        }
    }

    /// Stop every process and fail the run once `interrupt` is raised.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Answers collected so far, for reuse by a later run.
    pub fn into_prompts(self) -> PromptBook {
        self.prompts
    }

    /// Run the request. Returns `true` if any process failed.
    pub fn run(&mut self, request: &ArchiveRequest<'_>) -> anyhow::Result<bool> {
        let version = version::query(&self.settings.program)?;
        let protocol = version.protocol();
        if protocol == Protocol::Legacy {
            warn!("You are using an old version of borg ({version}), progress indication is disabled");
        }
        self.run_with(protocol, request)
    }

    /// Run the request with a known protocol.
    pub fn run_with(&mut self, protocol: Protocol, request: &ArchiveRequest<'_>) -> anyhow::Result<bool> {
        let show_progress =
            protocol == Protocol::Structured && request.total_size.is_some() && self.progress.is_enabled();

        let mut group = ProcessGroup::new();
        for dest in request.destinations {
            let args = command_args(request.verb, dest, protocol, show_progress);
            let passphrase = request.secrets.get(dest).map(String::as_str);
            let slot = match protocol {
                Protocol::Structured => self.spawn_pty(dest, &args, request.dir, passphrase)?,
                Protocol::Legacy => self.spawn_inherited(dest, &args, request.dir, passphrase)?,
            };
            group.push(slot);
        }

        if show_progress {
            self.progress.update("backup progress: 0%");
        } else {
            self.progress.notice("starting backup");
        }

        let mut failed = false;
        while group.any_running() {
            if self.interrupt.is_raised() {
                self.progress.finish();
                warn!("interrupted, stopping {} archiver(s)", request.destinations.len());
                return Err(BackupError::Interrupted.into());
            }
            let fds: Vec<_> = group.slots.iter().filter_map(Slot::live_fd).collect();
            let ready = if fds.is_empty() {
                std::thread::sleep(self.settings.poll_timeout());
                Vec::new()
            } else {
                pty::wait_readable(&fds, self.settings.poll_timeout()).context("waiting for archiver output")?
            };

            for slot in group.slots.iter_mut() {
                if slot.live_fd().is_some_and(|fd| ready.contains(&fd)) {
                    self.pump(slot, request.total_size);
                }
            }

            for slot in group.slots.iter_mut().filter(|s| s.is_running()) {
                let Some(code) = slot.child.try_wait().context("checking archiver status")? else {
                    continue;
                };
                self.pump(slot, request.total_size);
                slot.stream.finish(&mut *self.operator);
                slot.stream.mark_complete();
                slot.stream.close_input();
                slot.exit = Some(code);
                info!(tag = %slot.stream.tag(), code, "archiver exited");
                if code != 0 {
                    failed = true;
                }
            }

            if show_progress {
                self.progress
                    .update(&format!("backup progress: {}%", percent(group.mean_progress())));
            }
        }
        self.progress.finish();
        Ok(failed)
    }

    /// Feed everything a process has written so far through its stream.
    fn pump(&mut self, slot: &mut Slot, total_size: Option<u64>) {
        let Some(output) = slot.output.as_mut() else {
            return;
        };
        let bytes = output.drain();
        let mut lines = slot.splitter.push(&bytes);
        if let Some(prompt) = slot.splitter.take_prompt() {
            lines.push(prompt);
        }
        if output.is_closed() {
            lines.extend(slot.splitter.finish());
        }
        for line in lines {
            slot.stream
                .handle_line(&line, total_size, &mut self.prompts, &mut *self.operator);
        }
    }

    fn spawn_pty(&self, dest: &Location, args: &[String], dir: &Path, passphrase: Option<&str>) -> anyhow::Result<Slot> {
        let mut cmd = CommandBuilder::new(&self.settings.program);
        cmd.args(args);
        cmd.cwd(dir);
        if let Some(passphrase) = passphrase {
            cmd.env(&self.settings.passphrase_env, passphrase);
        }
        debug!(program = %self.settings.program, ?args, "spawning archiver on pty");
        let process = pty::spawn(cmd).with_context(|| format!("starting archiver for {dest}"))?;
        let stream = ArchiveStream::new(dest.original(), Some(process.input));
        Ok(Slot::new(Box::new(process.child), Some(process.output), stream))
    }

    fn spawn_inherited(
        &self,
        dest: &Location,
        args: &[String],
        dir: &Path,
        passphrase: Option<&str>,
    ) -> anyhow::Result<Slot> {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(passphrase) = passphrase {
            cmd.env(&self.settings.passphrase_env, passphrase);
        }
        debug!(program = %self.settings.program, ?args, "spawning archiver");
        let child = cmd
            .spawn()
            .with_context(|| format!("starting archiver for {dest}"))?;
        Ok(Slot::new(Box::new(child), None, ArchiveStream::new(dest.original(), None)))
    }
}

/// `<verb> <destination> . <extra args...> [--progress] [--log-json]`
pub fn command_args(verb: &str, dest: &Location, protocol: Protocol, show_progress: bool) -> Vec<String> {
    let mut args = vec![verb.to_string(), dest.to_string(), ".".to_string()];
    args.extend(dest.extra_args.iter().cloned());
    if show_progress {
        args.push("--progress".to_string());
    }
    if protocol == Protocol::Structured {
        args.push("--log-json".to_string());
    }
    args
}
