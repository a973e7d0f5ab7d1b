use std::fs::{self, File};
use std::path::Path;

use camino::Utf8Path;

use crate::error::{Result, SmolsyncError};

/// creates a file and all necessary parent directories
pub fn create_file(p: &Path) -> std::io::Result<File> {
	if let Some(p) = p.parent() {
		std::fs::create_dir_all(p)?;
	}
	File::create(p)
}

/// Copies `src` to `dest`, creating `dest`'s parent directories, and carries
/// over `src`'s modification time on a best-effort basis (no error if the
/// destination filesystem doesn't support it).
pub fn copy_with_mtime(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
	if let Some(parent) = dest.parent() {
		fs::create_dir_all(parent).map_err(SmolsyncError::from)?;
	}
	fs::copy(src, dest).map_err(|source| SmolsyncError::PathNotAccessible {
		path: src.to_path_buf(),
		source,
	})?;
	if let Ok(src_meta) = fs::metadata(src) {
		if let Ok(mtime) = src_meta.modified() {
			if let Ok(dest_file) = File::open(dest) {
				let _ = dest_file.set_modified(mtime);
			}
		}
	}
	Ok(())
}
