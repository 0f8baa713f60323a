//! Hypervisor Domain capability.
//!
//! The snapshot controller only ever talks to a domain through the [`Domain`]
//! trait. The production implementation drives libvirt through the `virsh`
//! client ([`virsh::VirshDomain`]); tests supply in-memory domains.
//!
//! ## Error channel
//!
//! libvirt reports errors out of band: every failed call is printed by a
//! global handler, whether or not the caller expected it. [`ErrorChannel`]
//! reproduces that, with one twist: while a [`Suppressed`] guard is alive,
//! the listed codes are swallowed. The freeze probe uses it so a missing
//! guest agent does not print a scary error.

use std::cell::RefCell;

use tracing::error;

pub use crate::error::{ErrorCode, HypervisorError};

pub mod virsh;

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Disks only; the guest keeps running untouched.
    DiskOnly,
    /// Disks plus memory state, taken while the guest runs.
    Live,
}

/// Flags for [`Domain::create_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotFlags {
    /// Do not keep snapshot metadata in libvirt; the overlay is temporary.
    pub no_metadata: bool,
    /// All disks are snapshotted or none are.
    pub atomic: bool,
    pub mode: SnapshotMode,
}

impl SnapshotFlags {
    pub fn for_backup(with_memory: bool) -> Self {
        Self {
            no_metadata: true,
            atomic: true,
            mode: if with_memory { SnapshotMode::Live } else { SnapshotMode::DiskOnly },
        }
    }
}

/// Progress counters of a running block job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockJobInfo {
    pub cur: u64,
    pub end: u64,
}

impl BlockJobInfo {
    /// An active commit is ready to pivot once it has caught up.
    pub fn is_ready(&self) -> bool {
        self.cur == self.end
    }

    pub fn fraction(&self) -> f64 {
        if self.end == 0 {
            1.0
        } else {
            self.cur as f64 / self.end as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

pub trait Domain {
    fn name(&self) -> &str;

    /// Out-of-band error reporting for this domain's connection.
    fn errors(&self) -> &ErrorChannel;

    /// Full XML description of the domain, including its devices.
    fn xml_desc(&self) -> Result<String, HypervisorError>;

    fn is_active(&self) -> Result<bool, HypervisorError>;

    /// Flush and freeze guest filesystems through the guest agent.
    fn fs_freeze(&self) -> Result<(), HypervisorError>;

    fn fs_thaw(&self) -> Result<(), HypervisorError>;

    /// Create a snapshot from a `<domainsnapshot>` descriptor.
    fn create_snapshot(&self, descriptor: &str, flags: SnapshotFlags) -> Result<(), HypervisorError>;

    /// Start an active, shallow block commit of `target`'s top overlay.
    fn block_commit(&self, target: &str) -> Result<(), HypervisorError>;

    /// `None` when no block job is running on `target`.
    fn block_job_info(&self, target: &str) -> Result<Option<BlockJobInfo>, HypervisorError>;

    /// Finish the block job on `target` and switch the disk back to its base image.
    fn block_job_pivot(&self, target: &str) -> Result<(), HypervisorError>;

    /// Replace a device definition (a `<disk>` element).
    fn update_device(&self, device_xml: &str) -> Result<(), HypervisorError>;
}

// ---------------------------------------------------------------------------
// Error channel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ErrorChannel {
    ignored: RefCell<Vec<ErrorCode>>,
}

impl ErrorChannel {
    /// Report an error. Returns `false` when it was swallowed.
    pub fn report(&self, err: &HypervisorError) -> bool {
        if self.ignored.borrow().contains(&err.code) {
            return false;
        }
        error!("{err}");
        true
    }

    pub fn is_suppressed(&self, code: ErrorCode) -> bool {
        self.ignored.borrow().contains(&code)
    }

    /// Swallow `codes` until the returned guard is dropped.
    pub fn suppress(&self, codes: &[ErrorCode]) -> Suppressed<'_> {
        let previous = self.ignored.replace(codes.to_vec());
        Suppressed {
            channel: self,
            previous,
        }
    }
}

pub struct Suppressed<'a> {
    channel: &'a ErrorChannel,
    previous: Vec<ErrorCode>,
}

impl Drop for Suppressed<'_> {
    fn drop(&mut self) {
        self.channel.ignored.replace(std::mem::take(&mut self.previous));
    }
}
