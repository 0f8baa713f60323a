//! backup-vm: back up a libvirt domain to one or more borg archives.
//!
//! ```text
//! backup-vm [-p] [--memory PATH] [--config PATH] domain [disk ...] archive
//!     [--borg-args ...] [archive [--borg-args ...] ...]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use console::Term;
use tracing::error;

use backup_vm::archiver::{self, ArchiveRequest, PromptBook, Supervisor};
use backup_vm::backup::{self, BackupPlan};
use backup_vm::config::Settings;
use backup_vm::disk::StorageKind;
use backup_vm::error::{BackupError, ErrorCode};
use backup_vm::hypervisor::virsh::VirshDomain;
use backup_vm::image::QemuImg;
use backup_vm::interrupt::{self, Interrupt};
use backup_vm::logging;
use backup_vm::operator::ConsoleOperator;
use backup_vm::progress::ProgressLine;
use backup_vm::staging::{self, StagingArea, SystemMounter};

/// Back up a libvirt-based VM using borg.
#[derive(Parser, Debug)]
#[command(name = "backup-vm", version, about = "Back up a libvirt-based VM using borg")]
struct Args {
    /// Force progress display even if stdout isn't a tty
    #[arg(short, long)]
    progress: bool,

    /// Take a live snapshot, saving guest memory to this file
    #[arg(long, value_name = "PATH")]
    memory: Option<PathBuf>,

    /// Settings file (default: ~/.config/backup-vm/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// libvirt domain to back up
    domain: String,

    /// Disks to back up (default: all), then archives, each optionally
    /// followed by `--borg-args ...`
    #[arg(
        value_name = "DISK|ARCHIVE",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    targets: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = logging::init();

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            error!("cannot determine working directory: {e}");
            return ExitCode::from(1);
        }
    };
    let mut plan = match BackupPlan::from_args(&args.domain, &args.targets, &cwd) {
        Ok(plan) => plan,
        Err(e) => Args::command().error(ErrorKind::MissingRequiredArgument, e).exit(),
    };
    plan.memory = args.memory.clone();
    plan.force_progress |= args.progress;

    match run(&args, &plan) {
        Ok(code) => ExitCode::from(code),
        Err(e) if matches!(e.downcast_ref::<BackupError>(), Some(BackupError::Interrupted)) => {
            error!("backup interrupted");
            ExitCode::from(interrupt::EXIT_CODE)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args, plan: &BackupPlan) -> anyhow::Result<u8> {
    let settings = Settings::load(args.config.as_deref())?;
    let progress = ProgressLine::stdout(plan.force_progress || Term::stdout().is_term());
    let mut operator = ConsoleOperator::new();

    let domain = VirshDomain::lookup(&settings.hypervisor, &plan.domain).map_err(|e| match e.code {
        ErrorCode::NoDomain => BackupError::DomainNotFound(plan.domain.clone()),
        _ => BackupError::Hypervisor(e),
    })?;
    let image_tool = QemuImg::new(settings.commit.image_tool.clone());

    // Passphrases are collected before the snapshot so the guest does not
    // run on overlays while the operator types.
    let secrets = archiver::prequalify(&settings.archiver, &plan.destinations, &mut operator);

    // Until here a signal may simply end the process; from the snapshot on,
    // overlays, mounts and archivers have to be released first.
    let interrupt = Interrupt::install().context("failed to install signal handlers")?;

    let report = backup::run(&domain, plan, &settings, &image_tool, &progress, &interrupt, |input| {
        let area = StagingArea::prepare(input.disks, Box::new(SystemMounter))?;
        area.write_file("origin.txt", &staging::hostname())
            .context("failed to write origin.txt")?;
        area.write_file(&format!("{}.xml", input.domain), input.domain_xml)
            .context("failed to write domain description")?;
        for disk in input.disks.iter().filter(|d| d.kind == StorageKind::Block) {
            area.write_volume_info(disk);
        }

        let mut supervisor = Supervisor::new(&settings.archiver, &mut operator, PromptBook::new(), &progress)
            .with_interrupt(interrupt.clone());
        supervisor.run(&ArchiveRequest {
            destinations: &plan.destinations,
            total_size: input.total_size,
            dir: area.path(),
            secrets: &secrets,
            verb: "create",
        })
    })?;
    Ok(report.exit_code())
}
