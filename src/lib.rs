//! backup-vm: crash-consistent backups of libvirt domains through borg.
//!
//! A run snapshots the domain's disks with external overlays, stages the now
//! stable base images in a temporary directory, archives that directory to
//! every destination at once, then commits the overlays back.

pub mod archiver;
pub mod backup;
pub mod config;
pub mod disk;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod interrupt;
pub mod location;
pub mod logging;
pub mod operator;
pub mod progress;
pub mod retry;
pub mod snapshot;
pub mod staging;
