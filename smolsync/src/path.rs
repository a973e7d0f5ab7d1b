//! A path that remembers how many leading components are its "root prefix"
//! (component C2). Reimplemented as a plain value type rather than the
//! subclassed-platform-path approach the reference tool used: the absolute
//! path and the root-prefix length are just fields, and `get_root`/`from_root`
//! derive views instead of needing their own class hierarchy.

use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootedPath {
	absolute: Utf8PathBuf,
	root_len: usize,
}

impl RootedPath {
	/// A fresh root: `absolute` is both the full path and the root prefix.
	pub fn new_root(absolute: impl Into<Utf8PathBuf>) -> Self {
		let absolute = absolute.into();
		let root_len = absolute.components().count();
		Self { absolute, root_len }
	}

	/// Builds a child path inheriting this path's root-prefix length.
	pub fn child(&self, name: &str) -> Self {
		Self {
			absolute: self.absolute.join(name),
			root_len: self.root_len,
		}
	}

	pub fn absolute(&self) -> &Utf8Path {
		&self.absolute
	}

	/// The root prefix only.
	pub fn get_root(&self) -> Utf8PathBuf {
		self.absolute
			.components()
			.take(self.root_len)
			.collect()
	}

	/// The relative suffix beyond the root prefix, with POSIX separators.
	/// Built by joining component strings with `/` explicitly rather than
	/// collecting into a path, since a plain `collect()` would pick up the
	/// host's native separator on Windows and leak backslashes into the
	/// serialized wire format.
	pub fn from_root(&self) -> Utf8PathBuf {
		let joined = self
			.absolute
			.components()
			.skip(self.root_len)
			.map(|c| c.as_str())
			.collect::<Vec<_>>()
			.join("/");
		Utf8PathBuf::from(joined)
	}

	/// Builds a path with the same root prefix as `self` but whose relative
	/// suffix is `relative` (used when reconstructing paths during diff load).
	pub fn with_relative(&self, relative: &Utf8Path) -> Self {
		Self {
			absolute: self.get_root().join(relative),
			root_len: self.root_len,
		}
	}

	pub fn name(&self) -> &str {
		self.absolute.file_name().unwrap_or("")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn child_inherits_root_len() {
		let root = RootedPath::new_root("/a/b");
		let child = root.child("c").child("d.txt");
		assert_eq!(child.from_root(), Utf8PathBuf::from("c/d.txt"));
		assert_eq!(child.get_root(), Utf8PathBuf::from("/a/b"));
		assert_eq!(child.absolute(), Utf8Path::new("/a/b/c/d.txt"));
	}

	#[test]
	fn with_relative_rebuilds_under_same_root() {
		let root = RootedPath::new_root("/a/b");
		let child = root.child("c").child("d.txt");
		let other = child.with_relative(Utf8Path::new("x/y.bin"));
		assert_eq!(other.absolute(), Utf8Path::new("/a/b/x/y.bin"));
		assert_eq!(other.from_root(), Utf8PathBuf::from("x/y.bin"));
	}
}
