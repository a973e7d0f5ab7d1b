//! Component C4: the persistent stat -> SHA-1 cache.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use rayon::prelude::*;
use sha1::{Digest, Sha1};

use crate::error::{Result, SmolsyncError};
use crate::image::{FileImage, FolderImage};
use crate::reporting::Reporter;
use crate::stream::{read_str, read_u32, read_u64, write_str, write_u32, write_u64};

pub const HASH_STORE_SIGNATURE: &[u8; 8] = b"smolhash";
const HASH_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
	path: String,
	mod_time: u32,
	size: u64,
}

/// Two mutually-indexed maps keyed off `(relative_path, mod, size)`: a
/// forward lookup to a SHA-1 digest, and a reverse lookup used for
/// cross-image content-equality queries.
#[derive(Default)]
pub struct HashStore {
	files: HashMap<Key, [u8; 20]>,
	hashes: HashMap<[u8; 20], Key>,
}

impl HashStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn key_for(file: &FileImage) -> Key {
		Key {
			path: file.path.from_root().as_str().to_string(),
			mod_time: file.mod_time,
			size: file.size,
		}
	}

	fn add(&mut self, key: Key, hash: [u8; 20]) {
		self.hashes.insert(hash, key.clone());
		self.files.insert(key, hash);
	}

	pub fn add_file(&mut self, file: &FileImage) {
		if let Some(hash) = file.hash {
			self.add(Self::key_for(file), hash);
		}
	}

	/// Rebuilds a store from scratch by walking an already-hashed image. Used
	/// after a full scan to discard stale keys for deleted/modified files.
	pub fn from_image(image: &FolderImage) -> Self {
		let mut store = Self::new();
		for file in image.iter_files() {
			store.add_file(file);
		}
		tracing::debug!(entries = store.files.len(), "hash store rebuilt from image");
		store
	}

	/// Loads a hash-store file. A missing or mis-signed file is non-fatal:
	/// callers are expected to fall back to an empty store rather than treat
	/// this as an error.
	pub fn load(r: &mut impl Read) -> Result<Self> {
		let mut sig = [0u8; 8];
		r.read_exact(&mut sig).map_err(SmolsyncError::from)?;
		if &sig != HASH_STORE_SIGNATURE {
			return Err(SmolsyncError::NotASmolsyncFile {
				what: "a smolsync hash store".to_string(),
				found: sig,
			});
		}
		let mut store = Self::new();
		let count = read_u32(r)?;
		for _ in 0..count {
			let path = read_str(r)?;
			let mod_time = read_u32(r)?;
			let size = read_u64(r)?;
			let mut hash = [0u8; 20];
			crate::stream::read_exact_framed(r, &mut hash)?;
			store.add(Key { path, mod_time, size }, hash);
		}
		Ok(store)
	}

	/// Loads from a file path, returning an empty store if the file is
	/// missing or doesn't start with the hash-store signature.
	pub fn load_or_empty(path: &camino::Utf8Path) -> Self {
		match File::open(path) {
			Ok(mut f) => Self::load(&mut f).unwrap_or_default(),
			Err(_) => Self::default(),
		}
	}

	pub fn save(&self, w: &mut impl std::io::Write) -> Result<()> {
		w.write_all(HASH_STORE_SIGNATURE).map_err(SmolsyncError::from)?;
		write_u32(w, self.files.len() as u32)?;
		for (key, hash) in &self.files {
			write_str(w, &key.path)?;
			write_u32(w, key.mod_time)?;
			write_u64(w, key.size)?;
			w.write_all(hash).map_err(SmolsyncError::from)?;
		}
		Ok(())
	}

	/// Stamps cached hashes onto `image` in place and returns the files for
	/// which no cached hash existed.
	pub fn apply_to_image<'a>(&self, image: &'a mut FolderImage) -> Vec<&'a mut FileImage> {
		let mut unhashed = Vec::new();
		self.apply_rec(image, &mut unhashed);
		unhashed
	}

	fn apply_rec<'a>(&self, image: &'a mut FolderImage, unhashed: &mut Vec<&'a mut FileImage>) {
		for file in &mut image.files {
			let key = Self::key_for(file);
			if let Some(hash) = self.files.get(&key) {
				file.hash = Some(*hash);
			} else {
				unhashed.push(file);
			}
		}
		for folder in &mut image.folders {
			self.apply_rec(folder, unhashed);
		}
	}

	/// Hashes every file in `unhashed` and records it in both indices.
	/// Distinct files are hashed in parallel (each is read independently);
	/// index writes are folded in behind a single mutex, and progress is
	/// reported through a single-writer counter, matching the concurrency
	/// model's carve-out for parallel hashing.
	pub fn hash_pending(&mut self, unhashed: Vec<&mut FileImage>, reporter: &impl Reporter) -> Result<()> {
		let total = unhashed.len();
		reporter.set_total(total);

		let collected: Mutex<Vec<(Key, [u8; 20])>> = Mutex::new(Vec::with_capacity(total));
		let first_error: Mutex<Option<SmolsyncError>> = Mutex::new(None);

		unhashed.into_par_iter().for_each(|file| {
			match hash_file(file.path.absolute()) {
				Ok(hash) => {
					file.hash = Some(hash);
					let key = Self::key_for(file);
					collected.lock().unwrap().push((key, hash));
				}
				Err(e) => {
					let mut slot = first_error.lock().unwrap();
					if slot.is_none() {
						*slot = Some(e);
					}
				}
			}
			reporter.incr(1);
		});

		if let Some(e) = first_error.into_inner().unwrap() {
			return Err(e);
		}
		for (key, hash) in collected.into_inner().unwrap() {
			self.add(key, hash);
		}
		reporter.done();
		Ok(())
	}
}

pub fn hash_file(path: &camino::Utf8Path) -> Result<[u8; 20]> {
	let mut f = File::open(path).map_err(|source| SmolsyncError::HashIoError {
		path: path.to_path_buf(),
		source,
	})?;
	let mut hasher = Sha1::new();
	let mut buf = [0u8; HASH_BUF_SIZE];
	loop {
		let n = f.read(&mut buf).map_err(|source| SmolsyncError::HashIoError {
			path: path.to_path_buf(),
			source,
		})?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::path::RootedPath;
	use crate::reporting::CountingReporter;
	use tempfile::TempDir;

	#[test]
	fn apply_to_image_splits_cached_and_uncached() {
		let dir = TempDir::new().unwrap();
		let root_path = camino::Utf8Path::from_path(dir.path()).unwrap();
		std::fs::write(root_path.join("a.bin"), b"hello").unwrap();
		let root = RootedPath::new_root(root_path.to_path_buf());

		let mut image = FolderImage::scan(&root, &|_| false).unwrap();
		let mut store = HashStore::new();
		let unhashed = store.apply_to_image(&mut image);
		assert_eq!(unhashed.len(), 1);
		store.hash_pending(unhashed, &CountingReporter::default()).unwrap();
		assert!(image.files[0].hash.is_some());

		// rebuild from the now-hashed image and re-apply: nothing left unhashed
		let store2 = HashStore::from_image(&image);
		let mut image2 = FolderImage::scan(&root, &|_| false).unwrap();
		let unhashed2 = store2.apply_to_image(&mut image2);
		assert!(unhashed2.is_empty());
		assert_eq!(image2.files[0].hash, image.files[0].hash);
	}

	#[test]
	fn round_trip_hash_store() {
		let mut store = HashStore::new();
		store.add(
			Key { path: "a/b.bin".into(), mod_time: 5, size: 10 },
			[7u8; 20],
		);
		let mut buf = Vec::new();
		store.save(&mut buf).unwrap();
		let loaded = HashStore::load(&mut std::io::Cursor::new(buf)).unwrap();
		assert_eq!(loaded.files, store.files);
		assert_eq!(loaded.hashes, store.hashes);
	}
}
