//! Archive staging directory.
//!
//! The archiver is pointed at a temporary directory laid out like the archive
//! should be: one `<target>.<format>` entry per disk, with the disk's storage
//! bind-mounted over it so `--read-special` reads the device content, plus a
//! few metadata files. Symlinks would be simpler, but borg does not follow
//! them for `--read-special`.
//!
//! Everything acquired is released in reverse order when the area is dropped.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::disk::Disk;

pub trait Mounter {
    fn bind(&self, source: &Path, target: &Path) -> io::Result<()>;
    fn unbind(&self, target: &Path) -> io::Result<()>;
}

/// `mount --bind` / `umount`.
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn bind(&self, source: &Path, target: &Path) -> io::Result<()> {
        run_checked(Command::new("mount").arg("--bind").arg(source).arg(target))
    }

    fn unbind(&self, target: &Path) -> io::Result<()> {
        run_checked(Command::new("umount").arg(target))
    }
}

fn run_checked(cmd: &mut Command) -> io::Result<()> {
    let status = cmd.stdin(Stdio::null()).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{cmd:?} exited with {status}")))
    }
}

pub struct StagingArea {
    root: PathBuf,
    dir: Option<TempDir>,
    mounter: Box<dyn Mounter>,
    mounts: Vec<PathBuf>,
}

impl StagingArea {
    /// Create the directory and bind every disk into it.
    pub fn prepare(disks: &[Disk], mounter: Box<dyn Mounter>) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("backup-vm-")
            .tempdir()
            .context("failed to create staging directory")?;
        let mut area = Self {
            root: dir.path().to_path_buf(),
            dir: Some(dir),
            mounter,
            mounts: Vec::new(),
        };
        for disk in disks {
            let source = fs::canonicalize(&disk.path)
                .with_context(|| format!("failed to resolve {}", disk.path.display()))?;
            let entry = area.root.join(disk.archive_name());
            File::create(&entry).with_context(|| format!("failed to create {}", entry.display()))?;
            area.mounter
                .bind(&source, &entry)
                .with_context(|| format!("failed to bind {} to {}", source.display(), entry.display()))?;
            debug!(source = %source.display(), entry = %entry.display(), "disk staged");
            area.mounts.push(entry);
        }
        Ok(area)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn write_file(&self, name: &str, contents: &str) -> io::Result<()> {
        fs::write(self.root.join(name), contents)
    }

    /// Save `lvdisplay` output for a block-device disk, if it is a logical
    /// volume. Failure is only logged.
    pub fn write_volume_info(&self, disk: &Disk) {
        let output = Command::new("lvdisplay")
            .arg(&disk.path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(out) if out.status.success() => {
                let name = volume_info_name(&disk.path);
                if let Err(e) = self.write_file(&name, &String::from_utf8_lossy(&out.stdout)) {
                    warn!("failed to write {name}: {e}");
                }
            }
            Ok(out) => debug!(disk = %disk.target, "lvdisplay exited with {}", out.status),
            Err(e) => warn!(disk = %disk.target, "failed to run lvdisplay: {e}"),
        }
    }

    /// Unmount everything and remove the directory. Safe to call twice.
    pub fn release(&mut self) {
        let mut clean = true;
        while let Some(entry) = self.mounts.pop() {
            if let Err(e) = self.mounter.unbind(&entry) {
                warn!("failed to unmount {}: {e}", entry.display());
                clean = false;
            }
        }
        if let Some(dir) = self.dir.take() {
            if clean {
                if let Err(e) = dir.close() {
                    warn!("failed to remove {}: {e}", self.root.display());
                }
            } else {
                // Still mounted; leave it for the operator rather than unlink through it.
                let kept = dir.keep();
                warn!("leaving staging directory {} in place", kept.display());
            }
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        self.release();
    }
}

/// `/dev/vg0/web` -> `dev--vg0--web.lv`
pub fn volume_info_name(path: &Path) -> String {
    let text = format!("{}.lv", path.display());
    text.trim_start_matches('/').replace('/', "--")
}

/// Sum of the sizes of every disk's storage, or `None` if any cannot be
/// measured. Seeking to the end works for block devices as well as files.
pub fn content_size(disks: &[Disk]) -> Option<u64> {
    let mut total = 0u64;
    for disk in disks {
        let size = fs::canonicalize(&disk.path)
            .and_then(File::open)
            .and_then(|mut f| f.seek(SeekFrom::End(0)));
        match size {
            Ok(size) => total += size,
            Err(e) => {
                debug!(disk = %disk.target, "size unavailable, disabling percentages: {e}");
                return None;
            }
        }
    }
    Some(total)
}

/// Name of this machine, for `origin.txt`.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return String::from("unknown");
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::disk::StorageKind;

    #[derive(Clone, Default)]
    struct RecordingMounter {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Mounter for RecordingMounter {
        fn bind(&self, _source: &Path, target: &Path) -> io::Result<()> {
            let name = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            self.log.borrow_mut().push(format!("bind {name}"));
            Ok(())
        }

        fn unbind(&self, target: &Path) -> io::Result<()> {
            let name = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            self.log.borrow_mut().push(format!("unbind {name}"));
            Ok(())
        }
    }

    fn image(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; len]).unwrap();
        path
    }

    #[test]
    fn stages_and_releases_in_reverse() {
        let images = tempfile::tempdir().unwrap();
        let disks = vec![
            Disk::new("vda", StorageKind::File, image(images.path(), "a.qcow2", 10), "qcow2"),
            Disk::new("vdb", StorageKind::File, image(images.path(), "b.img", 20), "raw"),
        ];
        let mounter = RecordingMounter::default();
        let log = Rc::clone(&mounter.log);

        let root = {
            let area = StagingArea::prepare(&disks, Box::new(mounter)).unwrap();
            assert!(area.path().join("vda.qcow2").exists());
            assert!(area.path().join("vdb.raw").exists());
            area.write_file("origin.txt", "host").unwrap();
            area.path().to_path_buf()
        };

        assert!(!root.exists());
        assert_eq!(
            *log.borrow(),
            vec!["bind vda.qcow2", "bind vdb.raw", "unbind vdb.raw", "unbind vda.qcow2"]
        );
    }

    #[test]
    fn failed_prepare_unwinds() {
        let images = tempfile::tempdir().unwrap();
        let disks = vec![
            Disk::new("vda", StorageKind::File, image(images.path(), "a.img", 1), "raw"),
            Disk::new("vdb", StorageKind::File, images.path().join("missing.img"), "raw"),
        ];
        let mounter = RecordingMounter::default();
        let log = Rc::clone(&mounter.log);
        assert!(StagingArea::prepare(&disks, Box::new(mounter)).is_err());
        assert_eq!(*log.borrow(), vec!["bind vda.raw", "unbind vda.raw"]);
    }

    #[test]
    fn content_size_sums_or_gives_up() {
        let images = tempfile::tempdir().unwrap();
        let a = Disk::new("vda", StorageKind::File, image(images.path(), "a.img", 1000), "raw");
        let b = Disk::new("vdb", StorageKind::File, image(images.path(), "b.img", 24), "raw");
        assert_eq!(content_size(&[a.clone(), b]), Some(1024));
        let missing = Disk::new("vdc", StorageKind::File, images.path().join("nope"), "raw");
        assert_eq!(content_size(&[a, missing]), None);
    }

    #[test]
    fn volume_info_file_name() {
        assert_eq!(volume_info_name(Path::new("/dev/vg0/web-data")), "dev--vg0--web-data.lv");
    }
}
