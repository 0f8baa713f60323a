//! In-memory stand-ins shared by the integration tests.
//!
//! - `FakeDomain`: a libvirt domain that records every call and can be told
//!   to fail freezing, snapshotting, pivoting or device updates. Block jobs
//!   behave like libvirt's: a failed pivot leaves the job running and a
//!   second commit on a busy disk is refused.
//! - `FakeImageTool`: an offline commit tool with scripted outcomes
//! - `ScriptedOperator`: answers prompts from a queue and keeps a transcript

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use backup_vm::config::Settings;
use backup_vm::hypervisor::{BlockJobInfo, Domain, ErrorChannel, ErrorCode, HypervisorError, SnapshotFlags};
use backup_vm::image::{ImageCommit, ImageCommitError};
use backup_vm::interrupt::Interrupt;
use backup_vm::operator::Operator;

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

pub struct FakeDomain {
    pub name: String,
    pub xml: String,
    pub active: Cell<bool>,
    /// `None` freezes fine; `Some(code)` fails with that code.
    pub freeze_error: Option<ErrorCode>,
    pub snapshot_error: bool,
    /// Remaining pivot failures per target.
    pub pivot_failures: RefCell<HashMap<String, u32>>,
    /// Targets whose `update_device` fails.
    pub update_failures: HashSet<String>,
    /// Raised on every block job poll, like a signal arriving mid-commit.
    pub raise_on_poll: Option<Interrupt>,
    pub calls: RefCell<Vec<String>>,
    pub descriptors: RefCell<Vec<String>>,
    errors: ErrorChannel,
    job_polls: RefCell<HashMap<String, u64>>,
}

impl FakeDomain {
    pub fn new(name: &str, xml: String) -> Self {
        Self {
            name: name.to_string(),
            xml,
            active: Cell::new(true),
            freeze_error: None,
            snapshot_error: false,
            pivot_failures: RefCell::new(HashMap::new()),
            update_failures: HashSet::new(),
            raise_on_poll: None,
            calls: RefCell::new(Vec::new()),
            descriptors: RefCell::new(Vec::new()),
            errors: ErrorChannel::default(),
            job_polls: RefCell::new(HashMap::new()),
        }
    }

    pub fn fail_pivots(&self, target: &str, times: u32) {
        self.pivot_failures.borrow_mut().insert(target.to_string(), times);
    }

    /// Leave a commit job running on `target`, as an earlier run might.
    pub fn start_job(&self, target: &str) {
        self.job_polls.borrow_mut().insert(target.to_string(), 0);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.borrow().iter().filter(|c| *c == call).count()
    }

    /// Calls that name `target`.
    pub fn calls_for(&self, target: &str) -> Vec<String> {
        let suffix = format!(" {target}");
        self.calls.borrow().iter().filter(|c| c.ends_with(&suffix)).cloned().collect()
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.borrow_mut().push(call.into());
    }

    fn fail(&self, code: ErrorCode, message: &str) -> HypervisorError {
        let err = HypervisorError::new(code, message);
        self.errors.report(&err);
        err
    }
}

impl Domain for FakeDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    fn xml_desc(&self) -> Result<String, HypervisorError> {
        Ok(self.xml.clone())
    }

    fn is_active(&self) -> Result<bool, HypervisorError> {
        Ok(self.active.get())
    }

    fn fs_freeze(&self) -> Result<(), HypervisorError> {
        self.log("freeze");
        match self.freeze_error {
            Some(code) => Err(self.fail(code, "guest agent is not responding")),
            None => Ok(()),
        }
    }

    fn fs_thaw(&self) -> Result<(), HypervisorError> {
        self.log("thaw");
        Ok(())
    }

    /// Creates every overlay file named in the descriptor, like qemu would.
    fn create_snapshot(&self, descriptor: &str, _flags: SnapshotFlags) -> Result<(), HypervisorError> {
        self.log("snapshot");
        self.descriptors.borrow_mut().push(descriptor.to_string());
        if self.snapshot_error {
            return Err(self.fail(ErrorCode::OperationFailed, "snapshot refused"));
        }
        let doc = roxmltree::Document::parse(descriptor)
            .map_err(|e| HypervisorError::new(ErrorCode::Internal, e.to_string()))?;
        for source in doc.descendants().filter(|n| n.has_tag_name("source")) {
            if let Some(file) = source.attribute("file") {
                fs::write(file, b"overlay").map_err(|e| HypervisorError::new(ErrorCode::Internal, e.to_string()))?;
            }
        }
        Ok(())
    }

    fn block_commit(&self, target: &str) -> Result<(), HypervisorError> {
        self.log(format!("commit {target}"));
        let mut polls = self.job_polls.borrow_mut();
        if polls.contains_key(target) {
            drop(polls);
            return Err(self.fail(
                ErrorCode::OperationInvalid,
                &format!("block copy still active: disk '{target}' already in active block job"),
            ));
        }
        polls.insert(target.to_string(), 0);
        Ok(())
    }

    /// Half done on the first poll, ready on the second.
    fn block_job_info(&self, target: &str) -> Result<Option<BlockJobInfo>, HypervisorError> {
        self.log(format!("info {target}"));
        if let Some(interrupt) = &self.raise_on_poll {
            interrupt.raise();
        }
        let mut polls = self.job_polls.borrow_mut();
        let Some(n) = polls.get_mut(target) else {
            return Ok(None);
        };
        *n += 1;
        let cur = if *n == 1 { 50 } else { 100 };
        Ok(Some(BlockJobInfo { cur, end: 100 }))
    }

    fn block_job_pivot(&self, target: &str) -> Result<(), HypervisorError> {
        self.log(format!("pivot {target}"));
        let mut failures = self.pivot_failures.borrow_mut();
        if let Some(left) = failures.get_mut(target) {
            if *left > 0 {
                // The job keeps running.
                *left -= 1;
                drop(failures);
                return Err(self.fail(ErrorCode::OperationFailed, "block job not ready for pivot"));
            }
        }
        self.job_polls.borrow_mut().remove(target);
        Ok(())
    }

    fn update_device(&self, device_xml: &str) -> Result<(), HypervisorError> {
        let doc = roxmltree::Document::parse(device_xml)
            .map_err(|e| HypervisorError::new(ErrorCode::Internal, e.to_string()))?;
        let target = doc
            .descendants()
            .find(|n| n.has_tag_name("target"))
            .and_then(|n| n.attribute("dev"))
            .unwrap_or_default()
            .to_string();
        self.log(format!("update {target}"));
        if self.update_failures.contains(&target) {
            return Err(self.fail(ErrorCode::OperationInvalid, "device busy"));
        }
        Ok(())
    }
}

/// A domain description with one `<disk>` per `(target, kind, path)`;
/// `kind` is `"file"` or `"block"`.
pub fn domain_xml(name: &str, disks: &[(&str, &str, &Path)]) -> String {
    let mut xml = format!("<domain type='kvm'>\n  <name>{name}</name>\n  <devices>\n");
    for (target, kind, path) in disks {
        let attr = if *kind == "block" { "dev" } else { "file" };
        xml.push_str(&format!(
            "    <disk type='{kind}' device='disk'>\n      <driver name='qemu' type='raw'/>\n      <source {attr}='{}'/>\n      <target dev='{target}' bus='scsi'/>\n    </disk>\n",
            path.display()
        ));
    }
    xml.push_str("  </devices>\n</domain>\n");
    xml
}

/// Write a disk image of `len` bytes.
pub fn image(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, vec![0u8; len]).expect("write disk image");
    path
}

/// Settings with no waiting anywhere, block overlays under `block_dir`.
pub fn instant_settings(block_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.hypervisor.block_device_snapshot_dir = block_dir.to_path_buf();
    settings.commit.backoff_secs = 0;
    settings.commit.poll_interval_ms = 0;
    settings
}

// ---------------------------------------------------------------------------
// Image tool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    Ok,
    Fail,
    Missing,
}

pub struct FakeImageTool {
    pub outcome: ToolOutcome,
    pub commits: RefCell<Vec<PathBuf>>,
}

impl FakeImageTool {
    pub fn new(outcome: ToolOutcome) -> Self {
        Self {
            outcome,
            commits: RefCell::new(Vec::new()),
        }
    }
}

impl ImageCommit for FakeImageTool {
    fn commit(&self, overlay: &Path) -> Result<(), ImageCommitError> {
        self.commits.borrow_mut().push(overlay.to_path_buf());
        match self.outcome {
            ToolOutcome::Ok => Ok(()),
            ToolOutcome::Fail => Err(ImageCommitError::Failed {
                tool: "qemu-img".into(),
                overlay: overlay.to_path_buf(),
                status: "exit status: 1".into(),
            }),
            ToolOutcome::Missing => Err(ImageCommitError::Missing { tool: "qemu-img".into() }),
        }
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedOperator {
    pub interactive: bool,
    pub answers: VecDeque<String>,
    pub secrets: VecDeque<String>,
    /// `[tag] line` for everything relayed.
    pub relayed: Vec<String>,
    /// `(tag, prompt)` for every question asked.
    pub asked: Vec<(String, String)>,
}

impl ScriptedOperator {
    pub fn answering(answers: &[&str]) -> Self {
        Self {
            interactive: true,
            answers: answers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

impl Operator for ScriptedOperator {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn relay(&mut self, tag: &str, lines: &[&str]) {
        self.relayed.extend(lines.iter().map(|l| format!("[{tag}] {l}")));
    }

    fn ask(&mut self, tag: &str, prompt: &str) -> io::Result<Option<String>> {
        self.asked.push((tag.to_string(), prompt.to_string()));
        Ok(self.answers.pop_front())
    }

    fn ask_secret(&mut self, tag: Option<&str>, prompt: &str) -> io::Result<Option<String>> {
        self.asked.push((tag.unwrap_or_default().to_string(), prompt.to_string()));
        Ok(self.secrets.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Process input
// ---------------------------------------------------------------------------

/// A writer whose bytes stay readable after it has been boxed away.
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("buffer lock")).into_owned()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
