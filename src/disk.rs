//! Disk Inventory: the block devices attached to a domain.
//!
//! Disks are read from the `<devices><disk>` elements of the domain XML. A
//! disk without a usable `<source>` (an empty CD-ROM tray, a network volume)
//! cannot be backed up and is left out.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BackupError, Result};
use crate::hypervisor::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKind {
    /// `<source file=...>`: an image file on the host.
    File,
    /// `<source dev=...>`: a host block device (LVM volume, partition, ...).
    Block,
}

impl StorageKind {
    pub fn describe(self) -> &'static str {
        match self {
            StorageKind::File => "file",
            StorageKind::Block => "block device",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Disk {
    /// Device name inside the guest (`vda`, `sdb`, ...). Unique per domain.
    pub target: String,
    pub kind: StorageKind,
    pub path: PathBuf,
    /// Driver type (`qcow2`, `raw`, ...), `unknown` when the XML has none.
    pub format: String,
    /// The original `<disk>` element, used to restore the device after an
    /// offline commit.
    pub xml: String,
    /// Overlay file; set while a snapshot is being prepared or is open.
    pub snapshot_path: Option<PathBuf>,
    failed: bool,
}

impl Disk {
    pub fn new(target: impl Into<String>, kind: StorageKind, path: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind,
            path: path.into(),
            format: format.into(),
            xml: String::new(),
            snapshot_path: None,
            failed: false,
        }
    }

    pub fn with_xml(mut self, xml: impl Into<String>) -> Self {
        self.xml = xml.into();
        self
    }

    /// Record an unrecoverable failure. Never cleared.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// File name of this disk inside the archive, e.g. `vda.qcow2`.
    pub fn archive_name(&self) -> String {
        format!("{}.{}", self.target, self.format)
    }

    /// Overlay file name used for this disk on `domain`.
    pub fn overlay_name(&self, domain: &str) -> String {
        format!("{domain}-{}-tempsnap.qcow2", self.target)
    }

    /// Choose where this disk's overlay goes: beside an image file, or in
    /// `block_dir` for block devices whose directory is not writable.
    pub fn overlay_path(&self, domain: &str, block_dir: &Path) -> PathBuf {
        let name = self.overlay_name(domain);
        match self.kind {
            StorageKind::Block => block_dir.join(name),
            StorageKind::File => self
                .path
                .parent()
                .map(|dir| dir.join(&name))
                .unwrap_or_else(|| PathBuf::from(name)),
        }
    }
}

// Identity is the structural description; the overlay and failure flag are
// run state.
impl PartialEq for Disk {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.kind == other.kind && self.path == other.path && self.format == other.format
    }
}

impl Eq for Disk {}

impl Hash for Disk {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target.hash(state);
        self.kind.hash(state);
        self.path.hash(state);
        self.format.hash(state);
    }
}

impl std::fmt::Display for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<{} ({}) ({} format)>",
            self.path.display(),
            self.kind.describe(),
            self.format
        )
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse the disks out of a domain XML description.
///
/// The result is ordered by target and holds at most one disk per target.
pub fn parse_disks(xml: &str) -> Result<Vec<Disk>> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| BackupError::DomainXml(e.to_string()))?;
    let mut disks: Vec<Disk> = Vec::new();
    let devices = doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("devices"));
    for node in devices.flat_map(|d| d.children()).filter(|n| n.has_tag_name("disk")) {
        let Some(disk) = disk_from_node(xml, node) else {
            continue;
        };
        if disks.iter().any(|d| d.target == disk.target) {
            debug!(target = %disk.target, "duplicate disk target ignored");
            continue;
        }
        disks.push(disk);
    }
    disks.sort_by(|a, b| a.target.cmp(&b.target));
    Ok(disks)
}

fn disk_from_node(xml: &str, node: roxmltree::Node<'_, '_>) -> Option<Disk> {
    let target = node
        .children()
        .find(|n| n.has_tag_name("target"))
        .and_then(|n| n.attribute("dev"))?;
    let source = node.children().find(|n| n.has_tag_name("source"));
    let (kind, path) = match source {
        Some(s) if s.attribute("file").is_some() => (StorageKind::File, s.attribute("file")?),
        Some(s) if s.attribute("dev").is_some() => (StorageKind::Block, s.attribute("dev")?),
        _ => {
            debug!(target, "disk has no file or device backing, skipping");
            return None;
        }
    };
    let format = node
        .children()
        .find(|n| n.has_tag_name("driver"))
        .and_then(|n| n.attribute("type"))
        .unwrap_or("unknown");
    Some(Disk::new(target, kind, path, format).with_xml(&xml[node.range()]))
}

/// List the backable disks of `domain`.
pub fn list_disks(domain: &dyn Domain) -> Result<Vec<Disk>> {
    let disks = parse_disks(&domain.xml_desc()?)?;
    if disks.is_empty() {
        return Err(BackupError::DomainHasNoDisks);
    }
    Ok(disks)
}

/// Split `all` into (requested, not requested). An empty request selects
/// every disk. Names that match no disk are an error.
pub fn select(all: Vec<Disk>, requested: &BTreeSet<String>) -> Result<(Vec<Disk>, Vec<Disk>)> {
    let unknown: Vec<String> = requested
        .iter()
        .filter(|name| !all.iter().any(|d| &d.target == *name))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(BackupError::UnknownDisks(unknown));
    }
    if requested.is_empty() {
        return Ok((all, Vec::new()));
    }
    Ok(all.into_iter().partition(|d| requested.contains(&d.target)))
}
