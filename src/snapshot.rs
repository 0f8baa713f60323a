//! Snapshot Controller.
//!
//! A [`SnapshotSession`] puts an external overlay on top of every disk being
//! backed up, so the base images stop changing while the archiver reads them,
//! and folds the overlays back in when the session closes.
//!
//! ```text
//! open():   [freeze guest] -> create snapshot (atomic, no metadata) -> [thaw]
//! close():  domain running?  yes -> per disk: block commit, poll, pivot
//!                            no  -> per disk: qemu-img commit, restore <disk>
//! ```
//!
//! Snapshot creation failing is fatal. Everything after that is per disk: a
//! disk that cannot be committed is marked failed and the others carry on.
//! `close()` runs at most once and is also run on drop.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::disk::Disk;
use crate::error::{BackupError, Result};
use crate::hypervisor::{Domain, ErrorCode, HypervisorError, SnapshotFlags};
use crate::image::{ImageCommit, ImageCommitError};
use crate::interrupt::Interrupt;
use crate::progress::{ProgressLine, percent};
use crate::retry::{Attempt, Failure, RetryPolicy, with_retries};

/// Codes that just mean "no usable guest agent" while freezing.
const FREEZE_EXPECTED: [ErrorCode; 3] = [
    ErrorCode::OperationInvalid,
    ErrorCode::ArgumentUnsupported,
    ErrorCode::AgentUnresponsive,
];

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Save memory state here and take a live snapshot.
    pub memory: Option<PathBuf>,
    pub retry: RetryPolicy,
    /// Block job polling interval.
    pub poll_interval: Duration,
    /// A request arriving while block jobs run stops the wait for them.
    pub interrupt: Interrupt,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            memory: None,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            interrupt: Interrupt::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Snapshotted,
    BlockCommitting,
    OfflineCommitting,
    Closed,
}

// ---------------------------------------------------------------------------
// Freeze guard
// ---------------------------------------------------------------------------

/// Thaws the guest on drop, if the freeze worked.
struct FreezeGuard<'a> {
    domain: &'a dyn Domain,
    frozen: bool,
}

impl<'a> FreezeGuard<'a> {
    fn acquire(domain: &'a dyn Domain) -> Self {
        let _quiet = domain.errors().suppress(&FREEZE_EXPECTED);
        let frozen = match domain.fs_freeze() {
            Ok(()) => true,
            Err(e) => {
                debug!(domain = domain.name(), "not freezing guest filesystems: {e}");
                false
            }
        };
        Self { domain, frozen }
    }
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        if self.frozen {
            if let Err(e) = self.domain.fs_thaw() {
                warn!(domain = self.domain.name(), "failed to thaw guest filesystems: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// `<domainsnapshot>` for `disks`: an external qcow2 overlay for each disk
/// with a snapshot path, `snapshot='no'` for the rest.
pub fn snapshot_descriptor(domain: &str, disks: &[Disk], memory: Option<&Path>) -> String {
    let domain = escape(domain);
    let memory = match memory {
        Some(path) => format!("<memory snapshot='external' file='{}'/>", escape(&path.to_string_lossy())),
        None => "<memory snapshot='no'/>".to_string(),
    };
    let disks: String = disks.iter().map(disk_element).collect();
    format!(
        "<domainsnapshot>
  <name>{domain}-tempsnap</name>
  <description>Temporary snapshot used while backing up {domain}</description>
  {memory}
  <disks>
{disks}  </disks>
</domainsnapshot>
"
    )
}

fn disk_element(disk: &Disk) -> String {
    let name = escape(&disk.target);
    match &disk.snapshot_path {
        Some(overlay) => format!(
            "    <disk name='{name}' snapshot='external'>
      <driver type='qcow2'/>
      <source file='{}'/>
    </disk>
",
            escape(&overlay.to_string_lossy())
        ),
        None => format!("    <disk name='{name}' snapshot='no'/>\n"),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct SnapshotSession<'a> {
    domain: &'a dyn Domain,
    disks: Vec<Disk>,
    options: SnapshotOptions,
    image_tool: &'a dyn ImageCommit,
    progress: &'a ProgressLine,
    phase: Phase,
    /// Interrupt count when closing started.
    interrupt_mark: usize,
}

impl<'a> SnapshotSession<'a> {
    /// Snapshot `disks`. Disks with a `snapshot_path` get an overlay there;
    /// the others are left alone.
    pub fn open(
        domain: &'a dyn Domain,
        disks: Vec<Disk>,
        options: SnapshotOptions,
        image_tool: &'a dyn ImageCommit,
        progress: &'a ProgressLine,
    ) -> Result<Self> {
        let flags = SnapshotFlags::for_backup(options.memory.is_some());
        let descriptor = snapshot_descriptor(domain.name(), &disks, options.memory.as_deref());
        {
            let _freeze = FreezeGuard::acquire(domain);
            domain
                .create_snapshot(&descriptor, flags)
                .map_err(BackupError::SnapshotFailed)?;
        }
        info!(domain = domain.name(), "snapshot created");
        Ok(Self {
            domain,
            disks,
            options,
            image_tool,
            progress,
            phase: Phase::Snapshotted,
            interrupt_mark: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    /// Commit every overlay back. Only the first call does anything.
    pub fn close(&mut self) {
        if self.phase != Phase::Snapshotted {
            return;
        }
        // Closing is what an interrupted run still has to do; only a later
        // request cuts it short.
        self.interrupt_mark = self.options.interrupt.count();
        let pending: Vec<usize> = (0..self.disks.len())
            .filter(|&i| self.disks[i].snapshot_path.is_some())
            .collect();
        match self.domain.is_active() {
            Ok(true) => {
                self.phase = Phase::BlockCommitting;
                self.block_commit(&pending);
            }
            Ok(false) => {
                self.phase = Phase::OfflineCommitting;
                self.offline_commit(&pending);
            }
            Err(e) => {
                error!(domain = self.domain.name(), "cannot tell whether the domain is running, overlays left in place: {e}");
                for &i in &pending {
                    self.disks[i].mark_failed();
                }
            }
        }
        self.progress.finish();
        self.phase = Phase::Closed;
    }

    /// Close and hand back the disks with their final state.
    pub fn finish(mut self) -> Vec<Disk> {
        self.close();
        std::mem::take(&mut self.disks)
    }

    // -- online ------------------------------------------------------------

    fn block_commit(&mut self, pending: &[usize]) {
        let total = pending.len();
        for (n, &i) in pending.iter().enumerate() {
            let target = self.disks[i].target.clone();
            let label = format!("pivot failed for disk '{target}'");
            let result = with_retries(&self.options.retry, &label, |attempt| {
                self.commit_and_pivot(&target, attempt, n, total)
            });
            match result {
                Ok(()) => self.overlay_merged(i),
                Err(failure) => {
                    error!(
                        "pivot failed for disk '{target}', it may be in an inconsistent state: {}",
                        failure.into_inner()
                    );
                    self.disks[i].mark_failed();
                }
            }
        }
    }

    /// One attempt: start an active commit, wait for it to catch up, pivot.
    ///
    /// A failed pivot leaves the commit job running and the hypervisor
    /// refuses a second commit on the same disk, so later attempts pick up
    /// the job that is already there.
    fn commit_and_pivot(
        &self,
        target: &str,
        attempt: u32,
        n: usize,
        total: usize,
    ) -> std::result::Result<(), Attempt<HypervisorError>> {
        let mut polled = if attempt > 1 {
            self.domain.block_job_info(target).map_err(Attempt::Retry)?
        } else {
            None
        };
        match polled {
            Some(_) => debug!(disk = target, attempt, "block commit still running, pivoting again"),
            None => self.domain.block_commit(target).map_err(Attempt::Retry)?,
        }
        loop {
            let info = match polled.take() {
                Some(info) => info,
                None => self.domain.block_job_info(target).map_err(Attempt::Retry)?.ok_or_else(|| {
                    Attempt::Retry(HypervisorError::new(
                        ErrorCode::OperationFailed,
                        format!("no block job running for disk '{target}'"),
                    ))
                })?,
            };
            let fraction = (n as f64 + info.fraction()) / total as f64;
            self.progress
                .update(&format!("block commit progress ({target}): {}%", percent(fraction)));
            if info.is_ready() {
                break;
            }
            if self.options.interrupt.raised_since(self.interrupt_mark) {
                return Err(Attempt::Abort(HypervisorError::new(
                    ErrorCode::OperationFailed,
                    format!("interrupted while block job on disk '{target}' was at {}%", percent(info.fraction())),
                )));
            }
            std::thread::sleep(self.options.poll_interval);
        }
        self.progress.update("...pivoting...");
        self.domain.block_job_pivot(target).map_err(Attempt::Retry)
    }

    // -- offline -----------------------------------------------------------

    fn offline_commit(&mut self, pending: &[usize]) {
        let total = pending.len();
        if self.progress.is_enabled() {
            self.progress.update("image commit progress: 0%");
        } else {
            self.progress.notice("committing disk images");
        }
        for (n, &i) in pending.iter().enumerate() {
            let target = self.disks[i].target.clone();
            let Some(overlay) = self.disks[i].snapshot_path.clone() else {
                continue;
            };
            let label = format!("commit failed for disk '{target}'");
            let result = with_retries(&self.options.retry, &label, |_| match self.image_tool.commit(&overlay) {
                Ok(()) => Ok(()),
                Err(e @ ImageCommitError::Missing { .. }) => Err(Attempt::Abort(e)),
                Err(e) => Err(Attempt::Retry(e)),
            });
            match result {
                Ok(()) => {}
                Err(Failure::Aborted(e)) => {
                    // Nothing else can be committed either.
                    error!("{e}");
                    for &rest in &pending[n..] {
                        self.disks[rest].mark_failed();
                    }
                    return;
                }
                Err(Failure::Exhausted(e)) => {
                    error!("commit failed for disk '{target}': {e}");
                    self.disks[i].mark_failed();
                    continue;
                }
            }

            // Offline commits do not switch the domain back to the base image.
            if let Err(e) = self.domain.update_device(&self.disks[i].xml) {
                error!("device update failed for disk '{target}': {e}; try replacing the path manually with 'virsh edit'");
                self.disks[i].mark_failed();
                continue;
            }
            self.overlay_merged(i);
            let fraction = (n + 1) as f64 / total as f64;
            self.progress
                .update(&format!("image commit progress ({target}): {}%", percent(fraction)));
        }
    }

    /// The overlay is no longer referenced: delete it.
    fn overlay_merged(&mut self, i: usize) {
        let disk = &mut self.disks[i];
        let Some(overlay) = disk.snapshot_path.take() else {
            return;
        };
        match fs::remove_file(&overlay) {
            Ok(()) => debug!(disk = %disk.target, "removed {}", overlay.display()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!("couldn't delete snapshot image '{}', please run as root", overlay.display());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("couldn't delete snapshot image '{}': {e}", overlay.display()),
        }
    }
}

impl Drop for SnapshotSession<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
