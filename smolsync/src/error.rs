//! The error taxonomy shared by every component. Configuration and format
//! errors are meant to abort a command immediately; per-file errors during
//! apply are the caller's to downgrade to "record and continue" under `blind`.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmolsyncError {
	#[error("not {what}: found signature {found:?}")]
	NotASmolsyncFile { what: String, found: [u8; 8] },

	#[error("truncated while reading {context}: wanted {wanted} bytes, got {got}")]
	Truncated {
		context: String,
		wanted: usize,
		got: usize,
	},

	#[error("no settings file at {path}")]
	SettingsMissing { path: Utf8PathBuf },

	#[error("unknown target: {name}")]
	UnknownTarget { name: String },

	#[error("targets not found: {}", .0.join(", "))]
	TargetsNotFound(Vec<String>),

	#[error("path not accessible: {path}")]
	PathNotAccessible {
		path: Utf8PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to hash {path}")]
	HashIoError {
		path: Utf8PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("apply precondition failed for {path}: {reason}")]
	ApplyPreconditionFailed { path: Utf8PathBuf, reason: String },

	#[error("archive format error: {0}")]
	ArchiveFormatError(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SmolsyncError>;
