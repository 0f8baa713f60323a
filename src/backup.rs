//! End-to-end backup of one domain.
//!
//! ```text
//! list disks -> validate selection -> place overlays -> dump domain XML
//!   -> measure total size -> open snapshot -> archive -> close snapshot
//! ```
//!
//! The archive step is a closure so the binary can plug in staging and the
//! process supervisor, and tests can plug in anything.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use crate::config::Settings;
use crate::disk::{self, Disk};
use crate::hypervisor::Domain;
use crate::image::ImageCommit;
use crate::interrupt::Interrupt;
use crate::location::Location;
use crate::progress::ProgressLine;
use crate::snapshot::{SnapshotOptions, SnapshotSession};
use crate::staging;

/// Appended to every destination's arguments: disks are staged as bind
/// mounts, which the archiver must read as content.
pub const READ_SPECIAL: &str = "--read-special";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("--borg-args must come after an archive path")]
    BorgArgsWithoutArchive,
    #[error("at least one archive path is required")]
    NoArchive,
}

#[derive(Debug, Clone, Default)]
pub struct BackupPlan {
    pub domain: String,
    /// Disk targets to back up; empty means all.
    pub disks: BTreeSet<String>,
    pub destinations: Vec<Location>,
    pub memory: Option<PathBuf>,
    /// `-p` seen among the positional arguments.
    pub force_progress: bool,
}

impl BackupPlan {
    /// Sort the arguments after the domain into disks and destinations.
    ///
    /// A token that parses as an archive location is a destination. After
    /// `--borg-args`, tokens belong to the latest destination until the next
    /// one. Anything else names a disk. Relative local repositories are
    /// resolved against `cwd`.
    pub fn from_args(domain: impl Into<String>, tokens: &[String], cwd: &Path) -> Result<Self, PlanError> {
        let mut plan = BackupPlan {
            domain: domain.into(),
            ..Default::default()
        };
        let mut borg_args = false;
        for token in tokens {
            match Location::parse(token) {
                Ok(mut loc) if loc.is_archive() => {
                    borg_args = false;
                    loc.canonicalize_path(cwd);
                    plan.destinations.push(loc);
                    continue;
                }
                _ => {}
            }
            if token == "--borg-args" {
                if plan.destinations.is_empty() {
                    return Err(PlanError::BorgArgsWithoutArchive);
                }
                borg_args = true;
            } else if borg_args {
                if let Some(dest) = plan.destinations.last_mut() {
                    dest.extra_args.push(token.clone());
                }
            } else if token == "-p" || token == "--progress" {
                plan.force_progress = true;
            } else {
                plan.disks.insert(token.clone());
            }
        }
        if plan.destinations.is_empty() {
            return Err(PlanError::NoArchive);
        }
        for dest in &mut plan.destinations {
            dest.extra_args.push(READ_SPECIAL.to_string());
        }
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// What the archive step gets to work with, while the snapshot is open.
pub struct ArchiveInput<'a> {
    pub domain: &'a str,
    /// Disks being backed up, with their overlays in place.
    pub disks: &'a [Disk],
    /// Domain description from before the snapshot.
    pub domain_xml: &'a str,
    /// Fixed denominator for progress, measured before the snapshot.
    pub total_size: Option<u64>,
}

#[derive(Debug)]
pub struct BackupReport {
    pub archiver_failed: bool,
    /// The disks that were backed up, in their final state.
    pub disks: Vec<Disk>,
}

impl BackupReport {
    pub fn failed_disks(&self) -> impl Iterator<Item = &Disk> {
        self.disks.iter().filter(|d| d.failed())
    }

    pub fn succeeded(&self) -> bool {
        !self.archiver_failed && self.failed_disks().next().is_none()
    }

    pub fn exit_code(&self) -> u8 {
        if self.succeeded() { 0 } else { 1 }
    }
}

/// Give each selected disk its overlay path.
pub fn assign_overlays(domain: &str, disks: &mut [Disk], block_dir: &Path) {
    for disk in disks {
        disk.snapshot_path = Some(disk.overlay_path(domain, block_dir));
    }
}

/// Back up `domain` according to `plan`. The snapshot is always closed
/// before an error from `archive` is returned. No snapshot is taken once
/// `interrupt` has been raised.
pub fn run<F>(
    domain: &dyn Domain,
    plan: &BackupPlan,
    settings: &Settings,
    image_tool: &dyn ImageCommit,
    progress: &ProgressLine,
    interrupt: &Interrupt,
    archive: F,
) -> anyhow::Result<BackupReport>
where
    F: FnOnce(&ArchiveInput<'_>) -> anyhow::Result<bool>,
{
    let all = disk::list_disks(domain)?;
    let (mut chosen, untouched) = disk::select(all, &plan.disks)?;
    assign_overlays(domain.name(), &mut chosen, &settings.hypervisor.block_device_snapshot_dir);
    let targets: BTreeSet<String> = chosen.iter().map(|d| d.target.clone()).collect();

    let domain_xml = domain.xml_desc()?;
    let total_size = staging::content_size(&chosen);

    let mut disks = chosen;
    disks.extend(untouched);
    disks.sort_by(|a, b| a.target.cmp(&b.target));

    let options = SnapshotOptions {
        memory: plan.memory.clone(),
        retry: settings.commit.retry_policy(),
        poll_interval: settings.commit.poll_interval(),
        interrupt: interrupt.clone(),
    };
    interrupt.check()?;
    let session = SnapshotSession::open(domain, disks, options, image_tool, progress)?;

    let exposed: Vec<Disk> = session
        .disks()
        .iter()
        .filter(|d| targets.contains(&d.target))
        .cloned()
        .collect();
    let outcome = archive(&ArchiveInput {
        domain: domain.name(),
        disks: &exposed,
        domain_xml: &domain_xml,
        total_size,
    });

    let disks: Vec<Disk> = session
        .finish()
        .into_iter()
        .filter(|d| targets.contains(&d.target))
        .collect();
    let archiver_failed = outcome?;

    let report = BackupReport { archiver_failed, disks };
    for disk in report.failed_disks() {
        error!("disk '{}' ({}) was not committed cleanly", disk.target, disk.path.display());
    }
    if report.archiver_failed {
        error!("at least one archiver run failed");
    }
    info!(success = report.succeeded(), "backup finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sorts_disks_and_destinations() {
        let plan = BackupPlan::from_args(
            "web",
            &tokens(&["vda", "/srv/repo::web-1", "--borg-args", "--compression", "lz4", "backup:repo::web-1"]),
            Path::new("/root"),
        )
        .unwrap();
        assert_eq!(plan.disks, BTreeSet::from(["vda".to_string()]));
        assert_eq!(plan.destinations.len(), 2);
        assert_eq!(
            plan.destinations[0].extra_args,
            vec!["--compression", "lz4", READ_SPECIAL]
        );
        assert_eq!(plan.destinations[1].extra_args, vec![READ_SPECIAL]);
    }

    #[test]
    fn relative_repositories_become_absolute() {
        let plan = BackupPlan::from_args("web", &tokens(&["repo::a"]), Path::new("/srv/backups")).unwrap();
        assert_eq!(plan.destinations[0].to_string(), "/srv/backups/repo::a");
    }

    #[test]
    fn borg_args_need_an_archive() {
        assert_eq!(
            BackupPlan::from_args("web", &tokens(&["--borg-args", "x", "/srv/repo::a"]), Path::new("/")).unwrap_err(),
            PlanError::BorgArgsWithoutArchive
        );
        assert_eq!(
            BackupPlan::from_args("web", &tokens(&["vda"]), Path::new("/")).unwrap_err(),
            PlanError::NoArchive
        );
    }

    #[test]
    fn progress_flag_among_positionals() {
        let plan = BackupPlan::from_args("web", &tokens(&["/srv/repo::a", "-p"]), Path::new("/")).unwrap();
        assert!(plan.force_progress);
        assert!(plan.disks.is_empty());
    }

    #[test]
    fn report_exit_code() {
        use crate::disk::StorageKind;
        let mut disk = Disk::new("vda", StorageKind::File, "/a", "raw");
        let ok = BackupReport {
            archiver_failed: false,
            disks: vec![disk.clone()],
        };
        assert_eq!(ok.exit_code(), 0);
        disk.mark_failed();
        let degraded = BackupReport {
            archiver_failed: false,
            disks: vec![disk],
        };
        assert_eq!(degraded.exit_code(), 1);
        let archiver = BackupReport {
            archiver_failed: true,
            disks: vec![],
        };
        assert_eq!(archiver.exit_code(), 1);
    }
}
