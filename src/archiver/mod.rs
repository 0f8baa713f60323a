//! Everything that talks to the archiver (borg).
//!
//! - `version`: pick the output protocol from `borg --version`
//! - `passphrase`: probe repositories and collect passphrases up front
//! - `protocol`: decode `--log-json` output, relay prompts
//! - `pty`: per-process pseudo terminals
//! - `supervisor`: run one process per destination and aggregate the result

pub mod passphrase;
pub mod protocol;
pub mod pty;
pub mod supervisor;
pub mod version;

pub use passphrase::{SecretMap, prequalify};
pub use protocol::{ArchiveStream, PromptBook};
pub use supervisor::{ArchiveRequest, Supervisor};
pub use version::Protocol;
