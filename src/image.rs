//! Offline image commit.
//!
//! A shut-off domain has no block jobs, so overlays are folded back into
//! their base image by running `<tool> commit <overlay>` directly.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageCommitError {
    /// The tool is not installed. No commit can succeed.
    #[error("{tool} not found, install it to commit changes offline")]
    Missing { tool: String },

    #[error("{tool} commit {} exited with {status}", .overlay.display())]
    Failed {
        tool: String,
        overlay: PathBuf,
        status: String,
    },

    #[error("failed to run {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait ImageCommit {
    /// Merge `overlay` into its backing image.
    fn commit(&self, overlay: &Path) -> Result<(), ImageCommitError>;
}

/// `qemu-img commit`, or any tool with the same calling convention.
#[derive(Debug, Clone)]
pub struct QemuImg {
    program: String,
}

impl QemuImg {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl ImageCommit for QemuImg {
    fn commit(&self, overlay: &Path) -> Result<(), ImageCommitError> {
        debug!(tool = %self.program, overlay = %overlay.display(), "offline commit");
        let status = Command::new(&self.program)
            .arg("commit")
            .arg(overlay)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .status()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ImageCommitError::Missing {
                        tool: self.program.clone(),
                    }
                } else {
                    ImageCommitError::Io {
                        tool: self.program.clone(),
                        source,
                    }
                }
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ImageCommitError::Failed {
                tool: self.program.clone(),
                overlay: overlay.to_path_buf(),
                status: status.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_distinct() {
        let tool = QemuImg::new("/nonexistent/backup-vm-qemu-img");
        let err = tool.commit(Path::new("/tmp/overlay.qcow2")).unwrap_err();
        assert!(matches!(err, ImageCommitError::Missing { .. }), "{err}");
    }

    #[test]
    fn non_zero_exit_is_failure() {
        let tool = QemuImg::new("false");
        let err = tool.commit(Path::new("/tmp/overlay.qcow2")).unwrap_err();
        assert!(matches!(err, ImageCommitError::Failed { .. }), "{err}");
    }

    #[test]
    fn zero_exit_is_success() {
        assert!(QemuImg::new("true").commit(Path::new("/tmp/overlay.qcow2")).is_ok());
    }
}
