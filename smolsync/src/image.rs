//! Component C3: the tree-structured snapshot of a directory's metadata.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Result;
use crate::path::RootedPath;
use crate::stream::{
	check_signature, read_f64, read_raw, read_str, read_u32, read_u64, write_f64, write_raw,
	write_str, write_u32, write_u64,
};

pub const IMAGE_SIGNATURE: &[u8; 8] = b"smolimg ";

/// The cheap stat-fingerprint used for rename/copy detection when content
/// hashes aren't available. `created` is compared bit-for-bit, not
/// numerically, since it always comes straight off a `stat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EasyHash {
	created_bits: u64,
	mod_time: u32,
	size: u64,
}

/// A regular file at snapshot time.
///
/// `mod_time` is kept at 32 bits to match the on-disk format exactly; this
/// carries a Y2106 rollover limit inherited from the format this was distilled
/// from (see `created`, which already uses a 64-bit float and doesn't share
/// the limit).
#[derive(Debug, Clone, PartialEq)]
pub struct FileImage {
	pub name: String,
	pub path: RootedPath,
	pub mod_time: u32,
	pub size: u64,
	pub created: f64,
	pub hash: Option<[u8; 20]>,
	pub copied_to: Option<Vec<FileImage>>,
}

impl FileImage {
	pub fn from_metadata(path: RootedPath, meta: &fs::Metadata) -> Result<Self> {
		let name = path.name().to_string();
		let mod_time = mod_time_secs(meta);
		let created = created_secs(meta);
		Ok(Self {
			name,
			path,
			mod_time,
			size: meta.len(),
			created,
			hash: None,
			copied_to: None,
		})
	}

	pub fn easy_hash(&self) -> EasyHash {
		EasyHash {
			created_bits: self.created.to_bits(),
			mod_time: self.mod_time,
			size: self.size,
		}
	}

	pub fn add_copied_to(&mut self, dest: FileImage) {
		self.copied_to.get_or_insert_with(Vec::new).push(dest);
	}

	pub fn load(r: &mut impl std::io::Read, parent: &RootedPath) -> Result<Self> {
		let name = read_str(r)?;
		let path = parent.child(&name);
		let mod_time = read_u32(r)?;
		let size = read_u64(r)?;
		let created = read_f64(r)?;
		let hash = read_raw::<20>(r)?;
		Ok(Self {
			name,
			path,
			mod_time,
			size,
			created,
			hash: Some(hash),
			copied_to: None,
		})
	}

	pub fn save(&self, w: &mut impl std::io::Write) -> Result<()> {
		write_str(w, &self.name)?;
		write_u32(w, self.mod_time)?;
		write_u64(w, self.size)?;
		write_f64(w, self.created)?;
		write_raw(w, &self.hash.unwrap_or([0u8; 20]))?;
		Ok(())
	}
}

fn mod_time_secs(meta: &fs::Metadata) -> u32 {
	meta.modified()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

fn created_secs(meta: &fs::Metadata) -> f64 {
	meta.created()
		.or_else(|_| meta.modified())
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_secs_f64())
		.unwrap_or(0.0)
}

/// Either a file or a subfolder, as returned by a name lookup.
pub enum ImageNode<'a> {
	File(&'a FileImage),
	Folder(&'a FolderImage),
}

#[derive(Clone, Copy)]
enum ChildRef {
	File(usize),
	Folder(usize),
}

/// A directory snapshot. `folders`/`files` are ordered as scanned; the
/// name-to-child lookup table is built lazily on first use and never
/// invalidated afterwards (the tree is immutable once constructed).
#[derive(Debug)]
pub struct FolderImage {
	pub name: String,
	pub size: u64,
	pub folders: Vec<FolderImage>,
	pub files: Vec<FileImage>,
	dict: RefCell<Option<HashMap<String, ChildRef>>>,
}

impl Clone for FolderImage {
	fn clone(&self) -> Self {
		Self {
			name: self.name.clone(),
			size: self.size,
			folders: self.folders.clone(),
			files: self.files.clone(),
			dict: RefCell::new(None),
		}
	}
}

impl PartialEq for FolderImage {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name
			&& self.size == other.size
			&& self.folders == other.folders
			&& self.files == other.files
	}
}

impl FolderImage {
	pub fn new(name: impl Into<String>, folders: Vec<FolderImage>, files: Vec<FileImage>) -> Self {
		let size = files.iter().map(|f| f.size).sum::<u64>()
			+ folders.iter().map(|f| f.size).sum::<u64>();
		Self {
			name: name.into(),
			size,
			folders,
			files,
			dict: RefCell::new(None),
		}
	}

	/// Scans `root`, skipping entries for which `should_ignore` returns true.
	/// A subdirectory is kept only if it transitively contains at least one
	/// non-ignored regular file. Non-regular-file entries (symlinks, sockets,
	/// etc.) are skipped silently.
	pub fn scan(root: &RootedPath, should_ignore: &impl Fn(&Utf8Path) -> bool) -> Result<Self> {
		let mut folders = Vec::new();
		let mut files = Vec::new();
		let mut entries: Vec<_> = fs::read_dir(root.absolute())?.collect::<std::io::Result<_>>()?;
		entries.sort_by_key(|e| e.file_name());

		for entry in entries {
			let file_name = entry.file_name();
			let Some(name) = file_name.to_str() else {
				continue;
			};
			let child_path = root.child(name);
			let meta = entry.metadata()?;
			if meta.is_dir() {
				let child = Self::scan(&child_path, should_ignore)?;
				if !child.files.is_empty() || !child.folders.is_empty() {
					folders.push(child);
				}
			} else if meta.is_file() {
				if should_ignore(&child_path.from_root()) {
					continue;
				}
				files.push(FileImage::from_metadata(child_path, &meta)?);
			} else {
				tracing::debug!(path = %child_path.absolute(), "ignoring non-regular file");
			}
		}

		Ok(Self::new(root.name(), folders, files))
	}

	pub fn load(r: &mut impl std::io::Read, root: &RootedPath) -> Result<Self> {
		check_signature(r, IMAGE_SIGNATURE, "a smolsync image file")?;
		let mut image = Self::load_body(r, root)?;
		image.name = String::new();
		Ok(image)
	}

	fn load_body(r: &mut impl std::io::Read, parent: &RootedPath) -> Result<Self> {
		let name = read_str(r)?;
		let path = parent.child(&name);
		let size = read_u64(r)?;
		let file_count = read_u32(r)?;
		let mut files = Vec::with_capacity(file_count as usize);
		for _ in 0..file_count {
			files.push(FileImage::load(r, &path)?);
		}
		let dir_count = read_u32(r)?;
		let mut folders = Vec::with_capacity(dir_count as usize);
		for _ in 0..dir_count {
			folders.push(Self::load_body(r, &path)?);
		}
		Ok(Self {
			name,
			size,
			folders,
			files,
			dict: RefCell::new(None),
		})
	}

	pub fn save(&self, w: &mut impl std::io::Write) -> Result<()> {
		crate::stream::write_raw(w, IMAGE_SIGNATURE)?;
		self.save_body(w)
	}

	fn save_body(&self, w: &mut impl std::io::Write) -> Result<()> {
		write_str(w, &self.name)?;
		write_u64(w, self.size)?;
		write_u32(w, self.files.len() as u32)?;
		for file in &self.files {
			file.save(w)?;
		}
		write_u32(w, self.folders.len() as u32)?;
		for folder in &self.folders {
			folder.save_body(w)?;
		}
		Ok(())
	}

	fn ensure_dict(&self) {
		if self.dict.borrow().is_some() {
			return;
		}
		let mut map = HashMap::with_capacity(self.files.len() + self.folders.len());
		for (i, f) in self.files.iter().enumerate() {
			map.insert(f.name.clone(), ChildRef::File(i));
		}
		for (i, f) in self.folders.iter().enumerate() {
			map.insert(f.name.clone(), ChildRef::Folder(i));
		}
		*self.dict.borrow_mut() = Some(map);
	}

	pub fn get(&self, name: &str) -> Option<ImageNode<'_>> {
		self.ensure_dict();
		let guard = self.dict.borrow();
		let found = *guard.as_ref().unwrap().get(name)?;
		Some(match found {
			ChildRef::File(i) => ImageNode::File(&self.files[i]),
			ChildRef::Folder(i) => ImageNode::Folder(&self.folders[i]),
		})
	}

	/// Resolves a relative path (from the image root) by walking components.
	pub fn lookup(&self, relative: &Utf8Path) -> Option<ImageNode<'_>> {
		let mut components: Vec<&str> = relative.components().map(|c| c.as_str()).collect();
		if components.is_empty() {
			return None;
		}
		let last = components.pop().unwrap();
		let mut cur = self;
		for part in components {
			match cur.get(part) {
				Some(ImageNode::Folder(f)) => cur = f,
				_ => return None,
			}
		}
		cur.get(last)
	}

	pub fn lookup_file(&self, relative: &Utf8Path) -> Option<&FileImage> {
		match self.lookup(relative) {
			Some(ImageNode::File(f)) => Some(f),
			_ => None,
		}
	}

	pub fn visit_files_mut(&mut self, f: &mut impl FnMut(&mut FileImage)) {
		for file in &mut self.files {
			f(file);
		}
		for folder in &mut self.folders {
			folder.visit_files_mut(f);
		}
	}

	pub fn iter_files(&self) -> impl Iterator<Item = &FileImage> {
		let mut all = Vec::new();
		self.collect_files(&mut all);
		all.into_iter()
	}

	fn collect_files<'a>(&'a self, out: &mut Vec<&'a FileImage>) {
		out.extend(self.files.iter());
		for folder in &self.folders {
			folder.collect_files(out);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn file(name: &str, root: &RootedPath, mod_time: u32, size: u64, created: f64) -> FileImage {
		FileImage {
			name: name.to_string(),
			path: root.child(name),
			mod_time,
			size,
			created,
			hash: None,
			copied_to: None,
		}
	}

	#[test]
	fn round_trip_image() {
		let root = RootedPath::new_root("/root");
		let a = file("a.bin", &root, 1000, 10, 500.0);
		let sub = FolderImage::new("sub", vec![], vec![file("b.bin", &root, 2, 3, 4.0)]);
		let image = FolderImage::new("", vec![sub], vec![a]);

		let mut buf = Vec::new();
		image.save(&mut buf).unwrap();
		let mut cursor = std::io::Cursor::new(buf);
		let loaded = FolderImage::load(&mut cursor, &root).unwrap();

		assert_eq!(image.name, loaded.name);
		assert_eq!(image.size, loaded.size);
		assert_eq!(image.files.len(), loaded.files.len());
		assert_eq!(image.files[0].name, loaded.files[0].name);
		assert_eq!(image.files[0].mod_time, loaded.files[0].mod_time);
		assert_eq!(image.files[0].size, loaded.files[0].size);
		assert_eq!(image.files[0].created, loaded.files[0].created);
		assert_eq!(loaded.folders[0].files[0].name, "b.bin");
	}

	#[test]
	fn scan_skips_ignored_and_prunes_empty_dirs() {
		let dir = TempDir::new().unwrap();
		let root_path = Utf8Path::from_path(dir.path()).unwrap();
		fs::write(root_path.join("keep.bin"), b"hi").unwrap();
		fs::write(root_path.join("trash.tmp"), b"no").unwrap();
		fs::create_dir(root_path.join("empty_after_ignore")).unwrap();
		fs::write(root_path.join("empty_after_ignore/only.tmp"), b"no").unwrap();

		let root = RootedPath::new_root(root_path.to_path_buf());
		let image = FolderImage::scan(&root, &|p| p.extension() == Some("tmp")).unwrap();

		assert_eq!(image.files.len(), 1);
		assert_eq!(image.files[0].name, "keep.bin");
		assert!(image.folders.is_empty());
	}

	#[test]
	fn lookup_resolves_relative_path() {
		let root = RootedPath::new_root("/root");
		let sub = FolderImage::new("sub", vec![], vec![file("b.bin", &root, 2, 3, 4.0)]);
		let image = FolderImage::new("", vec![sub], vec![]);
		let found = image.lookup_file(Utf8Path::new("sub/b.bin"));
		assert!(found.is_some());
		assert_eq!(found.unwrap().name, "b.bin");
		assert!(image.lookup_file(Utf8Path::new("sub/missing.bin")).is_none());
	}
}
