//! Component C5: pairing two images into a diff, with rename/copy detection.

use std::collections::{HashMap, HashSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Result;
use crate::image::{EasyHash, FileImage, FolderImage};
use crate::path::RootedPath;
use crate::stream::{
	check_signature, read_i64, read_str, read_u32, read_u8, write_i64, write_raw, write_str,
	write_u32, write_u8,
};

pub const DIFF_SIGNATURE: &[u8; 8] = b"smoldiff";

/// A status-tagged pair. Exactly one of `new`/`old` is absent for `A`/`D`;
/// both are present otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
	pub status: char,
	pub new: Option<FileImage>,
	pub old: Option<FileImage>,
}

impl FileDiff {
	pub fn new(new: Option<FileImage>, old: Option<FileImage>) -> Self {
		let status = match (&new, &old) {
			(None, None) => unreachable!("a FileDiff must have at least one side"),
			(None, Some(_)) => 'D',
			(Some(_), None) => 'A',
			(Some(n), Some(o)) => {
				let stat_differs = n.mod_time != o.mod_time || n.size != o.size;
				let both_hashed = n.hash.is_some() && o.hash.is_some();
				let hashes_differ = both_hashed && n.hash != o.hash;
				if stat_differs || hashes_differ { 'M' } else { '-' }
			}
		};
		Self { status, new, old }
	}

	pub fn set_copied(&mut self, old: FileImage) {
		self.status = 'C';
		self.old = Some(old);
	}

	/// Net change in target size this entry contributes. `C`'s `old` side is
	/// not counted: a copy's source isn't removed from the target by virtue
	/// of being a copy source.
	pub fn size(&self) -> i64 {
		let new_size = self.new.as_ref().map(|f| f.size as i64).unwrap_or(0);
		let old_size = if self.status != 'C' {
			self.old.as_ref().map(|f| f.size as i64).unwrap_or(0)
		} else {
			0
		};
		new_size - old_size
	}

	pub fn name(&self) -> &str {
		self.new
			.as_ref()
			.map(|f| f.name.as_str())
			.or_else(|| self.old.as_ref().map(|f| f.name.as_str()))
			.unwrap_or("")
	}

	pub fn has_changes(&self) -> bool {
		self.status != '-'
	}

	pub fn is_modified(&self) -> bool {
		matches!(self.status, 'A' | 'M')
	}

	fn load(r: &mut impl std::io::Read, parent: &RootedPath) -> Result<Self> {
		let status = read_u8(r)? as char;
		let (new, old) = match status {
			'-' => {
				let f = FileImage::load(r, parent)?;
				(Some(f.clone()), Some(f))
			}
			'D' => (None, Some(FileImage::load(r, parent)?)),
			'A' => (Some(FileImage::load(r, parent)?), None),
			'M' => {
				let n = FileImage::load(r, parent)?;
				let o = FileImage::load(r, parent)?;
				(Some(n), Some(o))
			}
			'C' => {
				let n = FileImage::load(r, parent)?;
				let relpath = read_str(r)?;
				let mut o = n.clone();
				o.path = parent.with_relative(Utf8Path::new(&relpath));
				o.name = o.path.name().to_string();
				o.copied_to = None;
				(Some(n), Some(o))
			}
			other => {
				return Err(crate::error::SmolsyncError::Truncated {
					context: format!("unknown file diff status byte {other:?}"),
					wanted: 1,
					got: 1,
				});
			}
		};
		Ok(Self { status, new, old })
	}

	fn save(&self, w: &mut impl std::io::Write) -> Result<()> {
		write_u8(w, self.status as u8)?;
		match self.status {
			'-' => self.new.as_ref().unwrap().save(w)?,
			'D' => self.old.as_ref().unwrap().save(w)?,
			'A' => self.new.as_ref().unwrap().save(w)?,
			'M' => {
				self.new.as_ref().unwrap().save(w)?;
				self.old.as_ref().unwrap().save(w)?;
			}
			'C' => {
				self.new.as_ref().unwrap().save(w)?;
				write_str(w, self.old.as_ref().unwrap().path.from_root().as_str())?;
			}
			other => unreachable!("unknown status {other:?}"),
		}
		Ok(())
	}
}

pub enum DiffNode<'a> {
	File(&'a FileDiff),
	Folder(&'a FolderDiff),
}

#[derive(Clone, Copy)]
enum ChildRef {
	File(usize),
	Folder(usize),
}

/// A directory-level grouping of [`FileDiff`]s, with accumulated size deltas.
pub struct FolderDiff {
	pub name: String,
	pub folders: Vec<FolderDiff>,
	pub files: Vec<FileDiff>,
	pub copied_size: i64,
	pub change_in_size: i64,
	dict: std::cell::RefCell<Option<HashMap<String, ChildRef>>>,
}

impl FolderDiff {
	pub fn new(name: impl Into<String>, folders: Vec<FolderDiff>, files: Vec<FileDiff>) -> Self {
		let mut diff = Self {
			name: name.into(),
			folders,
			files,
			copied_size: 0,
			change_in_size: 0,
			dict: std::cell::RefCell::new(None),
		};
		diff.calc_size();
		diff
	}

	fn calc_size(&mut self) {
		self.copied_size = 0;
		self.change_in_size = 0;
		for file in &self.files {
			self.change_in_size += file.size();
			if matches!(file.status, 'M' | 'A') {
				self.copied_size += file.new.as_ref().unwrap().size as i64;
			}
		}
		for folder in &mut self.folders {
			folder.calc_size();
			self.copied_size += folder.copied_size;
			self.change_in_size += folder.change_in_size;
		}
	}

	pub fn has_changes(&self) -> bool {
		self.files.iter().any(|f| f.has_changes()) || self.folders.iter().any(|f| f.has_changes())
	}

	pub fn has_modified(&self) -> bool {
		self.files.iter().any(|f| f.is_modified()) || self.folders.iter().any(|f| f.has_modified())
	}

	pub fn statuses(&self) -> HashSet<char> {
		let mut set: HashSet<char> = self.files.iter().map(|f| f.status).collect();
		for folder in &self.folders {
			set.extend(folder.statuses());
		}
		set.remove(&'-');
		set
	}

	/// Prunes `-` entries and folders that transitively contain only `-`.
	pub fn remove_unchanged(mut self) -> Self {
		self.files.retain(|f| f.has_changes());
		self.folders = self
			.folders
			.into_iter()
			.filter(|f| f.has_changes())
			.map(|f| f.remove_unchanged())
			.collect();
		self
	}

	/// Two-pass comparison of `new` against `old`.
	pub fn compare(new: &FolderImage, old: &FolderImage) -> Self {
		let mut diff = Self::compare_pass1(Some(new), Some(old));

		let mut deleted: HashMap<EasyHash, FileImage> = HashMap::new();
		diff.collect_deleted(&mut deleted);

		let mut destinations: HashMap<EasyHash, Vec<FileImage>> = HashMap::new();
		diff.set_copied(&deleted, &mut destinations);
		diff.stamp_copied_to(&destinations);
		diff.calc_size();
		diff
	}

	fn compare_pass1(new: Option<&FolderImage>, old: Option<&FolderImage>) -> Self {
		let name = new
			.map(|n| n.name.clone())
			.or_else(|| old.map(|o| o.name.clone()))
			.unwrap_or_default();

		let new_files = new.map(|n| n.files.as_slice()).unwrap_or(&[]);
		let old_files = old.map(|o| o.files.as_slice()).unwrap_or(&[]);
		let files = pair_files(new_files, old_files);

		let new_folders = new.map(|n| n.folders.as_slice()).unwrap_or(&[]);
		let old_folders = old.map(|o| o.folders.as_slice()).unwrap_or(&[]);
		let folder_names = union_names(
			new_folders.iter().map(|f| f.name.as_str()),
			old_folders.iter().map(|f| f.name.as_str()),
		);
		let folders = folder_names
			.into_iter()
			.map(|n| {
				let nf = new_folders.iter().find(|f| f.name == n);
				let of = old_folders.iter().find(|f| f.name == n);
				Self::compare_pass1(nf, of)
			})
			.collect();

		Self::new(name, folders, files)
	}

	fn collect_deleted(&self, out: &mut HashMap<EasyHash, FileImage>) {
		for f in &self.files {
			if f.status == 'D' {
				let old = f.old.as_ref().unwrap();
				out.insert(old.easy_hash(), old.clone());
			}
		}
		for folder in &self.folders {
			folder.collect_deleted(out);
		}
	}

	fn set_copied(&mut self, deleted: &HashMap<EasyHash, FileImage>, destinations: &mut HashMap<EasyHash, Vec<FileImage>>) {
		for f in &mut self.files {
			if f.status == 'A' {
				let eh = f.new.as_ref().unwrap().easy_hash();
				if let Some(matched) = deleted.get(&eh) {
					let new_clone = f.new.clone().unwrap();
					f.set_copied(matched.clone());
					destinations.entry(eh).or_default().push(new_clone);
				}
			}
		}
		for folder in &mut self.folders {
			folder.set_copied(deleted, destinations);
		}
	}

	fn stamp_copied_to(&mut self, destinations: &HashMap<EasyHash, Vec<FileImage>>) {
		for f in &mut self.files {
			if let Some(old) = &mut f.old {
				if let Some(dest) = destinations.get(&old.easy_hash()) {
					old.copied_to = Some(dest.clone());
				}
			}
		}
		for folder in &mut self.folders {
			folder.stamp_copied_to(destinations);
		}
	}

	/// Re-wires `copied_to` after loading from disk, by relative path rather
	/// than easy-hash (the format doesn't round-trip a `C` entry's full `old`
	/// metadata, only its relative path).
	pub fn connect_copied_by_path(&mut self) {
		let mut deleted: HashMap<String, FileImage> = HashMap::new();
		self.collect_deleted_by_path(&mut deleted);

		let mut destinations: HashMap<String, Vec<FileImage>> = HashMap::new();
		self.reconnect_copies(&deleted, &mut destinations);
		self.stamp_copied_to_by_path(&destinations);
	}

	fn collect_deleted_by_path(&self, out: &mut HashMap<String, FileImage>) {
		for f in &self.files {
			if f.status == 'D' {
				let old = f.old.as_ref().unwrap();
				out.insert(old.path.from_root().to_string(), old.clone());
			}
		}
		for folder in &self.folders {
			folder.collect_deleted_by_path(out);
		}
	}

	fn reconnect_copies(&mut self, deleted: &HashMap<String, FileImage>, destinations: &mut HashMap<String, Vec<FileImage>>) {
		for f in &mut self.files {
			if f.status == 'C' {
				let key = f.old.as_ref().unwrap().path.from_root().to_string();
				if let Some(matched) = deleted.get(&key) {
					let new_clone = f.new.clone().unwrap();
					f.old = Some(matched.clone());
					destinations.entry(key).or_default().push(new_clone);
				}
			}
		}
		for folder in &mut self.folders {
			folder.reconnect_copies(deleted, destinations);
		}
	}

	fn stamp_copied_to_by_path(&mut self, destinations: &HashMap<String, Vec<FileImage>>) {
		for f in &mut self.files {
			if let Some(old) = &mut f.old {
				let key = old.path.from_root().to_string();
				if let Some(dest) = destinations.get(&key) {
					old.copied_to = Some(dest.clone());
				}
			}
		}
		for folder in &mut self.folders {
			folder.stamp_copied_to_by_path(destinations);
		}
	}

	pub fn load(r: &mut impl std::io::Read, root: &RootedPath) -> Result<Self> {
		check_signature(r, DIFF_SIGNATURE, "a smolsync diff file")?;
		let mut diff = Self::load_body(r, root)?;
		diff.name = String::new();
		Ok(diff)
	}

	fn load_body(r: &mut impl std::io::Read, parent: &RootedPath) -> Result<Self> {
		let name = read_str(r)?;
		let path = parent.child(&name);
		let copied_size = read_i64(r)?;
		let change_in_size = read_i64(r)?;
		let file_count = read_u32(r)?;
		let mut files = Vec::with_capacity(file_count as usize);
		for _ in 0..file_count {
			files.push(FileDiff::load(r, &path)?);
		}
		let dir_count = read_u32(r)?;
		let mut folders = Vec::with_capacity(dir_count as usize);
		for _ in 0..dir_count {
			folders.push(Self::load_body(r, &path)?);
		}
		Ok(Self {
			name,
			folders,
			files,
			copied_size,
			change_in_size,
			dict: std::cell::RefCell::new(None),
		})
	}

	pub fn save(&self, w: &mut impl std::io::Write) -> Result<()> {
		write_raw(w, DIFF_SIGNATURE)?;
		self.save_body(w)
	}

	fn save_body(&self, w: &mut impl std::io::Write) -> Result<()> {
		write_str(w, &self.name)?;
		write_i64(w, self.copied_size)?;
		write_i64(w, self.change_in_size)?;
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
			map.insert(f.name().to_string(), ChildRef::File(i));
		}
		for (i, f) in self.folders.iter().enumerate() {
			map.insert(f.name.clone(), ChildRef::Folder(i));
		}
		*self.dict.borrow_mut() = Some(map);
	}

	pub fn get(&self, name: &str) -> Option<DiffNode<'_>> {
		self.ensure_dict();
		let guard = self.dict.borrow();
		let found = *guard.as_ref().unwrap().get(name)?;
		Some(match found {
			ChildRef::File(i) => DiffNode::File(&self.files[i]),
			ChildRef::Folder(i) => DiffNode::Folder(&self.folders[i]),
		})
	}

	pub fn lookup(&self, relative: &Utf8Path) -> Option<DiffNode<'_>> {
		let mut components: Vec<&str> = relative.components().map(|c| c.as_str()).collect();
		if components.is_empty() {
			return None;
		}
		let last = components.pop().unwrap();
		let mut cur = self;
		for part in components {
			match cur.get(part) {
				Some(DiffNode::Folder(f)) => cur = f,
				_ => return None,
			}
		}
		cur.get(last)
	}

	/// Every file-level entry in the tree, in walk order (own files first,
	/// then each subfolder's in turn) -- the order the task engine consumes.
	pub fn iter(&self) -> impl Iterator<Item = &FileDiff> {
		let mut all = Vec::new();
		self.collect(&mut all);
		all.into_iter()
	}

	fn collect<'a>(&'a self, out: &mut Vec<&'a FileDiff>) {
		out.extend(self.files.iter());
		for folder in &self.folders {
			folder.collect(out);
		}
	}

	/// Copies the payload of every `A`/`M` entry under `dest`, preserving
	/// modification time where the destination supports it.
	pub fn copy_modified_to(&self, dest: &mut impl CopyDestination, rel_dir: &Utf8Path) -> Result<()> {
		if !self.has_modified() {
			return Ok(());
		}
		dest.prepare_dir(rel_dir)?;
		for file in &self.files {
			if file.is_modified() {
				let new = file.new.as_ref().unwrap();
				dest.copy_file(new.path.absolute(), &rel_dir.join(&new.name))?;
			}
		}
		for folder in &self.folders {
			folder.copy_modified_to(dest, &rel_dir.join(&folder.name))?;
		}
		Ok(())
	}
}

fn union_names<'a>(new_iter: impl Iterator<Item = &'a str>, old_iter: impl Iterator<Item = &'a str>) -> Vec<String> {
	let mut order = Vec::new();
	let mut seen = HashSet::new();
	for n in new_iter {
		order.push(n.to_string());
		seen.insert(n.to_string());
	}
	for o in old_iter {
		if !seen.contains(o) {
			order.push(o.to_string());
		}
	}
	order
}

fn pair_files(new_files: &[FileImage], old_files: &[FileImage]) -> Vec<FileDiff> {
	let names = union_names(
		new_files.iter().map(|f| f.name.as_str()),
		old_files.iter().map(|f| f.name.as_str()),
	);
	names
		.into_iter()
		.map(|name| {
			let n = new_files.iter().find(|f| f.name == name).cloned();
			let o = old_files.iter().find(|f| f.name == name).cloned();
			FileDiff::new(n, o)
		})
		.collect()
}

/// Where `copy_modified_to` writes file payloads -- a plain directory (with
/// directory pre-creation) or an archive-builder façade (which records
/// entries without needing directories to exist up front).
pub trait CopyDestination {
	fn prepare_dir(&mut self, rel_dir: &Utf8Path) -> Result<()>;
	fn copy_file(&mut self, src_abs: &Utf8Path, rel_dest: &Utf8Path) -> Result<()>;
}

/// A plain filesystem directory destination.
pub struct FsDestination {
	pub root: Utf8PathBuf,
}

impl CopyDestination for FsDestination {
	fn prepare_dir(&mut self, rel_dir: &Utf8Path) -> Result<()> {
		fs::create_dir_all(self.root.join(rel_dir)).map_err(crate::error::SmolsyncError::from)?;
		Ok(())
	}

	fn copy_file(&mut self, src_abs: &Utf8Path, rel_dest: &Utf8Path) -> Result<()> {
		crate::common::copy_with_mtime(src_abs, &self.root.join(rel_dest))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::image::FileImage as FI;

	fn file(root: &RootedPath, name: &str, mod_time: u32, size: u64, created: f64) -> FileImage {
		FI {
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
	fn empty_to_empty_has_no_changes() {
		let new = FolderImage::new("", vec![], vec![]);
		let old = FolderImage::new("", vec![], vec![]);
		let diff = FolderDiff::compare(&new, &old);
		assert_eq!(diff.iter().count(), 0);
		assert!(!diff.has_changes());
	}

	#[test]
	fn pure_rename_is_detected_as_copy() {
		let root = RootedPath::new_root("/data");
		let old_sub = FolderImage::new("a", vec![], vec![file(&root, "x.bin", 1000, 10, 500.0)]);
		let new_sub = FolderImage::new("a", vec![], vec![file(&root, "y.bin", 1000, 10, 500.0)]);
		let old = FolderImage::new("", vec![old_sub], vec![]);
		let new = FolderImage::new("", vec![new_sub], vec![]);

		let diff = FolderDiff::compare(&new, &old);
		let sub = &diff.folders[0];
		let c_entry = sub.files.iter().find(|f| f.status == 'C').expect("a C entry");
		assert_eq!(c_entry.new.as_ref().unwrap().name, "y.bin");
		assert_eq!(c_entry.old.as_ref().unwrap().name, "x.bin");

		let d_entry = sub.files.iter().find(|f| f.status == 'D').expect("a D entry");
		let copied_to = d_entry.old.as_ref().unwrap().copied_to.as_ref().unwrap();
		assert_eq!(copied_to.len(), 1);
		assert_eq!(copied_to[0].name, "y.bin");
	}

	#[test]
	fn broadcast_copy_points_multiple_destinations_at_one_source() {
		let root = RootedPath::new_root("/data");
		let old = FolderImage::new("", vec![], vec![file(&root, "src.bin", 1, 5, 0.0)]);
		let new = FolderImage::new(
			"",
			vec![],
			vec![
				file(&root, "src.bin", 1, 5, 0.0),
				file(&root, "dup1.bin", 1, 5, 0.0),
				file(&root, "dup2.bin", 1, 5, 0.0),
			],
		);

		let diff = FolderDiff::compare(&new, &old);
		let src_entry = diff.files.iter().find(|f| f.name() == "src.bin").unwrap();
		assert_eq!(src_entry.status, '-');

		let c_entries: Vec<_> = diff.files.iter().filter(|f| f.status == 'C').collect();
		assert_eq!(c_entries.len(), 2);
		for c in &c_entries {
			assert_eq!(c.old.as_ref().unwrap().name, "src.bin");
		}
	}

	#[test]
	fn modify_over_rename_ambiguity_trusts_stat_fingerprint() {
		let root = RootedPath::new_root("/data");
		let mut old_file = file(&root, "a.bin", 1, 10, 0.0);
		old_file.hash = Some([1u8; 20]);
		let mut new_file = file(&root, "b.bin", 1, 10, 0.0);
		new_file.hash = Some([2u8; 20]);

		let old = FolderImage::new("", vec![], vec![old_file]);
		let new = FolderImage::new("", vec![], vec![new_file]);

		let diff = FolderDiff::compare(&new, &old);
		let promoted = diff.files.iter().find(|f| f.status == 'C');
		assert!(promoted.is_some(), "stat-fingerprint match must win over differing hash");
	}

	#[test]
	fn size_accounting_matches_sum_rule() {
		let root = RootedPath::new_root("/data");
		let old = FolderImage::new(
			"",
			vec![],
			vec![file(&root, "deleted.bin", 1, 7, 0.0), file(&root, "same.bin", 1, 3, 0.0)],
		);
		let new = FolderImage::new(
			"",
			vec![],
			vec![file(&root, "same.bin", 1, 3, 0.0), file(&root, "added.bin", 1, 4, 0.0)],
		);
		let diff = FolderDiff::compare(&new, &old);
		assert_eq!(diff.change_in_size, 4 - 7);
		assert_eq!(diff.copied_size, 4);
	}

	#[test]
	fn round_trip_diff_after_reconciliation() {
		let root = RootedPath::new_root("/data");
		let old = FolderImage::new("", vec![], vec![file(&root, "x.bin", 1000, 10, 500.0)]);
		let new = FolderImage::new("", vec![], vec![file(&root, "y.bin", 1000, 10, 500.0)]);
		let diff = FolderDiff::compare(&new, &old);

		let mut buf = Vec::new();
		diff.save(&mut buf).unwrap();
		let mut loaded = FolderDiff::load(&mut std::io::Cursor::new(buf), &root).unwrap();
		loaded.connect_copied_by_path();

		let d = loaded.files.iter().find(|f| f.status == 'D').unwrap();
		let copied_to = d.old.as_ref().unwrap().copied_to.as_ref().unwrap();
		assert_eq!(copied_to[0].name, "y.bin");
	}
}
