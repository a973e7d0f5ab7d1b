//! A `CopyDestination` backed by a `zip::ZipWriter`, so `save --zip` can pack
//! the modified-file payload into the archive alongside the `.diff` entries
//! instead of needing a directory to stage them in first.

use std::io::{Read, Seek, Write};

use camino::Utf8Path;
use smolsync::diff::CopyDestination;
use smolsync::error::{Result, SmolsyncError};

pub struct ZipDestination<'a, W: Write + Seek> {
	writer: &'a mut zip::ZipWriter<W>,
	target_name: &'a str,
}

impl<'a, W: Write + Seek> ZipDestination<'a, W> {
	pub fn new(writer: &'a mut zip::ZipWriter<W>, target_name: &'a str) -> Self {
		Self { writer, target_name }
	}
}

impl<'a, W: Write + Seek> CopyDestination for ZipDestination<'a, W> {
	fn prepare_dir(&mut self, _rel_dir: &Utf8Path) -> Result<()> {
		Ok(())
	}

	fn copy_file(&mut self, src_abs: &Utf8Path, rel_dest: &Utf8Path) -> Result<()> {
		let mut data = Vec::new();
		std::fs::File::open(src_abs)
			.and_then(|mut f| f.read_to_end(&mut data))
			.map_err(|source| SmolsyncError::PathNotAccessible { path: src_abs.to_path_buf(), source })?;

		let entry_name = format!("{}/{}", self.target_name, rel_dest);
		self.writer
			.start_file(entry_name, zip::write::FileOptions::default())
			.map_err(|e| SmolsyncError::ArchiveFormatError(e.to_string()))?;
		self.writer.write_all(&data).map_err(SmolsyncError::from)?;
		Ok(())
	}
}
