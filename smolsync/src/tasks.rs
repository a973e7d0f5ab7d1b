//! Component C6: the twelve-bucket classifier that turns a connected diff
//! plus the target's live state into a report (`status`/`check`) or a set of
//! filesystem actions (`apply`).
//!
//! Each bucket is a fixed tagged variant rather than a trait-object
//! hierarchy: the guard conditions are a closed set fixed by the format, not
//! something callers extend.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::common::copy_with_mtime;
use crate::diff::{FileDiff, FolderDiff};
use crate::error::{Result, SmolsyncError};
use crate::image::{FileImage, FolderImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
	/// `D`, no copy destinations, already gone from the target: nothing to do.
	Deleted,
	/// `D` with copy destinations, all already present in the target: nothing to do.
	AlreadyCopied,
	/// `A`, present in the source data but not yet in the target: copy it in.
	Add,
	/// `M`, present in the source data, target still has the pre-modification file: copy it in.
	Modify,
	/// `D`, no copy destinations, still present in the target: remove it.
	Delete,
	/// `D` with copy destinations, some already present, source file still present: rename + fan out.
	Copy,
	/// `D` with copy destinations all already present, source file still present: just remove the leftover.
	GroupSourceDelete,
	/// `M`, but the pre-modification file is already gone from the target: copy anyway.
	ModifyDeleted,
	/// `A`, but a file already exists at the destination in the target's current state.
	AlreadyAdded,
	/// `A`/`M` whose new content isn't present in the source data to copy from.
	Missing,
	/// `D` with copy destinations, none present yet, source file already gone: unrecoverable.
	CopyGroupIsDeleted,
	/// `D` with copy destinations, some present, source file already gone: best-effort, no single action applies.
	GroupCopy,
}

impl TaskKind {
	/// Classification order: this is also run order. Earlier entries are
	/// acknowledgment-only tasks, then the tasks with real filesystem effects,
	/// then informational reports.
	pub const ALL: [TaskKind; 12] = [
		TaskKind::Deleted,
		TaskKind::AlreadyCopied,
		TaskKind::Add,
		TaskKind::Modify,
		TaskKind::Delete,
		TaskKind::Copy,
		TaskKind::GroupSourceDelete,
		TaskKind::ModifyDeleted,
		TaskKind::AlreadyAdded,
		TaskKind::Missing,
		TaskKind::CopyGroupIsDeleted,
		TaskKind::GroupCopy,
	];

	pub fn header(self) -> &'static str {
		match self {
			TaskKind::Deleted => "Already deleted",
			TaskKind::AlreadyCopied => "Already copied/moved",
			TaskKind::Add => "Add",
			TaskKind::Modify => "Modify",
			TaskKind::Delete => "Delete",
			TaskKind::Copy => "Copy/move",
			TaskKind::GroupSourceDelete => "Source is missing but destinations can be copied from another",
			TaskKind::ModifyDeleted => "Deleted files to be modified",
			TaskKind::AlreadyAdded => "Existing files to be added",
			TaskKind::Missing => "Missing files",
			TaskKind::CopyGroupIsDeleted => "All files are missing",
			TaskKind::GroupCopy => "Copy",
		}
	}

	/// Lower verbosity prints/runs by default; higher verbosity needs `-v`.
	pub fn verbosity(self) -> u8 {
		match self {
			TaskKind::Deleted | TaskKind::AlreadyCopied => 2,
			TaskKind::Add | TaskKind::Modify | TaskKind::Delete | TaskKind::Copy | TaskKind::GroupSourceDelete | TaskKind::ModifyDeleted => 1,
			TaskKind::AlreadyAdded | TaskKind::Missing | TaskKind::CopyGroupIsDeleted | TaskKind::GroupCopy => 0,
		}
	}

	fn condition(self, f: &FileSummary) -> bool {
		let status = f.diff.status;
		let copied_to_present = f.diff.old.as_ref().is_some_and(|o| o.copied_to.is_some());
		let any_copy_done = f.copies_done.as_ref().is_some_and(|v| v.iter().any(|&d| d));
		let all_copies_done = f.copies_done.as_ref().is_some_and(|v| v.iter().all(|&d| d));
		match self {
			TaskKind::Missing => matches!(status, 'A' | 'M') && !f.exists_in_data_root,
			TaskKind::Deleted => status == 'D' && !copied_to_present && f.old_file_image.is_none(),
			TaskKind::AlreadyAdded => status == 'A' && f.exists_in_data_root && f.new_file_image.is_some(),
			TaskKind::CopyGroupIsDeleted => status == 'D' && copied_to_present && !any_copy_done && f.old_file_image.is_none(),
			TaskKind::AlreadyCopied => status == 'D' && copied_to_present && all_copies_done && f.old_file_image.is_none(),
			TaskKind::Delete => status == 'D' && !copied_to_present && f.old_file_image.is_some(),
			TaskKind::Add => status == 'A' && f.exists_in_data_root && f.new_file_image.is_none(),
			TaskKind::Modify => status == 'M' && f.exists_in_data_root && f.new_file_image.is_some(),
			TaskKind::ModifyDeleted => status == 'M' && f.exists_in_data_root && f.new_file_image.is_none(),
			TaskKind::Copy => status == 'D' && copied_to_present && any_copy_done && f.old_file_image.is_some(),
			TaskKind::GroupCopy => status == 'D' && copied_to_present && any_copy_done && f.old_file_image.is_none(),
			TaskKind::GroupSourceDelete => status == 'D' && copied_to_present && all_copies_done && f.old_file_image.is_some(),
		}
	}

	fn has_effect(self) -> bool {
		matches!(
			self,
			TaskKind::Add | TaskKind::Modify | TaskKind::Delete | TaskKind::Copy | TaskKind::GroupSourceDelete | TaskKind::ModifyDeleted
		)
	}
}

/// The per-entry context a task's guard reads: what the target currently
/// looks like on disk (`current_image`), and whether the incoming payload
/// for this entry is available (`exists_in_data_root`).
pub struct FileSummary<'a> {
	pub diff: &'a FileDiff,
	pub old_file_image: Option<&'a FileImage>,
	pub new_file_image: Option<&'a FileImage>,
	pub exists_in_data_root: bool,
	pub copies_done: Option<Vec<bool>>,
}

impl<'a> FileSummary<'a> {
	fn build(diff: &'a FileDiff, current_image: &'a FolderImage, data_root: &Utf8Path) -> Self {
		let old_file_image = diff.old.as_ref().and_then(|o| current_image.lookup_file(&o.path.from_root()));
		let new_file_image = diff.new.as_ref().and_then(|n| current_image.lookup_file(&n.path.from_root()));
		let exists_in_data_root = diff
			.new
			.as_ref()
			.map(|n| data_root.join(n.path.from_root()).exists())
			.unwrap_or(false);
		let copies_done = diff.old.as_ref().and_then(|o| o.copied_to.as_ref()).map(|list| {
			list.iter()
				.map(|c| current_image.lookup_file(&c.path.from_root()).is_some())
				.collect()
		});
		Self {
			diff,
			old_file_image,
			new_file_image,
			exists_in_data_root,
			copies_done,
		}
	}
}

/// One classification bucket with the entries that landed in it, in diff
/// walk order.
pub struct TaskReport<'a> {
	pub kind: TaskKind,
	pub entries: Vec<FileSummary<'a>>,
}

/// Runs every entry in `diff` through the twelve guards in order, keeping
/// only the first match (the format guarantees at most one task claims any
/// given entry; `C`-status entries and any other unclaimed entry are simply
/// dropped).
pub fn classify<'a>(diff: &'a FolderDiff, current_image: &'a FolderImage, data_root: &Utf8Path) -> Vec<TaskReport<'a>> {
	let mut reports: Vec<TaskReport<'a>> = TaskKind::ALL
		.iter()
		.map(|&kind| TaskReport { kind, entries: Vec::new() })
		.collect();

	for file in diff.iter() {
		let summary = FileSummary::build(file, current_image, data_root);
		for report in &mut reports {
			if report.kind.condition(&summary) {
				report.entries.push(summary);
				break;
			}
		}
	}

	reports
}

/// Human-readable shape of one entry's printed line, independent of how the
/// caller chooses to draw a tree around it.
pub enum TaskDescription {
	Path(Utf8PathBuf),
	CopyList { source: Utf8PathBuf, destinations: Vec<Utf8PathBuf> },
}

pub fn describe(kind: TaskKind, summary: &FileSummary) -> TaskDescription {
	match kind {
		TaskKind::AlreadyAdded | TaskKind::Add | TaskKind::Missing => {
			TaskDescription::Path(summary.diff.new.as_ref().unwrap().path.from_root())
		}
		TaskKind::Modify | TaskKind::ModifyDeleted => TaskDescription::Path(summary.diff.new.as_ref().unwrap().path.from_root()),
		TaskKind::Deleted | TaskKind::Delete => TaskDescription::Path(summary.diff.old.as_ref().unwrap().path.from_root()),
		TaskKind::AlreadyCopied | TaskKind::CopyGroupIsDeleted | TaskKind::Copy | TaskKind::GroupCopy | TaskKind::GroupSourceDelete => {
			let old = summary.diff.old.as_ref().unwrap();
			let destinations = old
				.copied_to
				.as_ref()
				.map(|v| v.iter().map(|c| c.path.from_root()).collect())
				.unwrap_or_default();
			TaskDescription::CopyList {
				source: old.path.from_root(),
				destinations,
			}
		}
	}
}

/// One file-level failure recorded while running under `blind`.
pub struct ApplyError {
	pub kind: TaskKind,
	pub path: Utf8PathBuf,
	pub source: SmolsyncError,
}

#[derive(Default)]
pub struct ApplyOutcome {
	pub errors: Vec<ApplyError>,
}

/// Executes every task with a filesystem effect, in classification order.
/// Informational buckets (`Deleted`, `AlreadyCopied`, `AlreadyAdded`,
/// `Missing`, `CopyGroupIsDeleted`, `GroupCopy`) are acknowledged but have no
/// action to run.
///
/// Under `blind`, a file-level failure is recorded and the run continues
/// with the next entry; otherwise the first failure aborts the run.
pub fn run(reports: &[TaskReport], data_root: &Utf8Path, blind: bool) -> Result<ApplyOutcome> {
	let mut outcome = ApplyOutcome::default();

	for report in reports {
		if !report.kind.has_effect() {
			continue;
		}
		for summary in &report.entries {
			if let Err(source) = run_one(report.kind, summary, data_root) {
				let path = summary
					.diff
					.new
					.as_ref()
					.or(summary.diff.old.as_ref())
					.map(|f| f.path.from_root())
					.unwrap_or_default();
				if blind {
					outcome.errors.push(ApplyError { kind: report.kind, path, source });
				} else {
					return Err(source);
				}
			}
		}
	}

	Ok(outcome)
}

fn run_one(kind: TaskKind, summary: &FileSummary, data_root: &Utf8Path) -> Result<()> {
	match kind {
		TaskKind::Delete | TaskKind::GroupSourceDelete => delete_old(summary.diff.old.as_ref().unwrap()),
		TaskKind::Add | TaskKind::ModifyDeleted => add_file(summary.diff.new.as_ref().unwrap(), data_root),
		TaskKind::Modify => {
			let new = summary.diff.new.as_ref().unwrap();
			let current = summary.new_file_image.expect("Modify's guard requires new_file_image");
			if new.mod_time <= current.mod_time {
				return Err(SmolsyncError::ApplyPreconditionFailed {
					path: new.path.from_root(),
					reason: format!(
						"incoming mod_time {} is not newer than the target's current mod_time {}",
						new.mod_time, current.mod_time
					),
				});
			}
			add_file(new, data_root)
		}
		TaskKind::Copy => do_copy(summary.diff),
		_ => Ok(()),
	}
}

fn delete_old(old: &FileImage) -> Result<()> {
	match fs::remove_file(old.path.absolute()) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(SmolsyncError::PathNotAccessible {
			path: old.path.absolute().to_path_buf(),
			source: e,
		}),
	}
}

fn add_file(new: &FileImage, data_root: &Utf8Path) -> Result<()> {
	let src = data_root.join(new.path.from_root());
	copy_with_mtime(&src, new.path.absolute())
}

fn do_copy(diff: &FileDiff) -> Result<()> {
	let old = diff.old.as_ref().unwrap();
	let mut copies = old.copied_to.clone().unwrap();
	let first = copies.remove(0);

	if let Some(parent) = first.path.absolute().parent() {
		fs::create_dir_all(parent).map_err(SmolsyncError::from)?;
	}
	fs::rename(old.path.absolute(), first.path.absolute()).map_err(|source| SmolsyncError::PathNotAccessible {
		path: old.path.absolute().to_path_buf(),
		source,
	})?;

	for copy in &copies {
		copy_with_mtime(first.path.absolute(), copy.path.absolute())?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::path::RootedPath;
	use tempfile::TempDir;

	fn file(root: &RootedPath, name: &str) -> FileImage {
		FileImage {
			name: name.to_string(),
			path: root.child(name),
			mod_time: 1000,
			size: 5,
			created: 0.0,
			hash: None,
			copied_to: None,
		}
	}

	#[test]
	fn add_task_copies_from_data_root_into_target() {
		let target_dir = TempDir::new().unwrap();
		let data_dir = TempDir::new().unwrap();
		let target_root = Utf8Path::from_path(target_dir.path()).unwrap().to_path_buf();
		let data_root = Utf8Path::from_path(data_dir.path()).unwrap().to_path_buf();
		fs::write(data_root.join("new.bin"), b"hello").unwrap();

		let root = RootedPath::new_root(target_root.clone());
		let new_file = file(&root, "new.bin");
		let added = FileDiff::new(Some(new_file), None);
		let diff = FolderDiff::new("", vec![], vec![added]);

		let current_image = FolderImage::new("", vec![], vec![]);
		let reports = classify(&diff, &current_image, &data_root);
		let add_report = reports.iter().find(|r| r.kind == TaskKind::Add).unwrap();
		assert_eq!(add_report.entries.len(), 1);

		run(&reports, &data_root, false).unwrap();
		assert!(target_root.join("new.bin").exists());
	}

	#[test]
	fn missing_source_payload_is_classified_missing_not_add() {
		let target_dir = TempDir::new().unwrap();
		let data_dir = TempDir::new().unwrap();
		let target_root = Utf8Path::from_path(target_dir.path()).unwrap().to_path_buf();
		let data_root = Utf8Path::from_path(data_dir.path()).unwrap().to_path_buf();

		let root = RootedPath::new_root(target_root);
		let added = FileDiff::new(Some(file(&root, "absent.bin")), None);
		let diff = FolderDiff::new("", vec![], vec![added]);
		let current_image = FolderImage::new("", vec![], vec![]);

		let reports = classify(&diff, &current_image, &data_root);
		assert_eq!(reports.iter().find(|r| r.kind == TaskKind::Missing).unwrap().entries.len(), 1);
		assert!(reports.iter().find(|r| r.kind == TaskKind::Add).unwrap().entries.is_empty());
	}

	#[test]
	fn modify_guard_rejects_stale_target_without_blind() {
		let target_dir = TempDir::new().unwrap();
		let data_dir = TempDir::new().unwrap();
		let target_root = Utf8Path::from_path(target_dir.path()).unwrap().to_path_buf();
		let data_root = Utf8Path::from_path(data_dir.path()).unwrap().to_path_buf();
		fs::write(target_root.join("foo.txt"), b"old").unwrap();
		fs::write(data_root.join("foo.txt"), b"newer").unwrap();

		let root = RootedPath::new_root(target_root.clone());
		let mut new_meta = file(&root, "foo.txt");
		new_meta.mod_time = 2000;
		let mut old_meta = file(&root, "foo.txt");
		old_meta.mod_time = 1000;
		let modified = FileDiff::new(Some(new_meta), Some(old_meta));
		let diff = FolderDiff::new("", vec![], vec![modified]);

		let mut current_target_file = file(&root, "foo.txt");
		current_target_file.mod_time = 3000;
		let current_image = FolderImage::new("", vec![], vec![current_target_file]);

		let reports = classify(&diff, &current_image, &data_root);
		let err = run(&reports, &data_root, false).unwrap_err();
		assert!(matches!(err, SmolsyncError::ApplyPreconditionFailed { .. }));

		let outcome = run(&reports, &data_root, true).unwrap();
		assert_eq!(outcome.errors.len(), 1);
	}

	#[test]
	fn copy_task_renames_then_fans_out_to_remaining_destinations() {
		// The guard for Copy/move requires at least one destination already
		// materialized in the target's current state (`any(copies_done)`),
		// alongside the source still being present -- it does not fire on a
		// pristine "nothing applied yet" diff.
		let target_dir = TempDir::new().unwrap();
		let target_root = Utf8Path::from_path(target_dir.path()).unwrap().to_path_buf();
		fs::write(target_root.join("src.bin"), b"payload").unwrap();
		fs::write(target_root.join("a.bin"), b"already-there").unwrap();

		let root = RootedPath::new_root(target_root.clone());
		let mut old_meta = file(&root, "src.bin");
		let dest_a = file(&root, "a.bin");
		let dest_b = file(&root, "b.bin");
		old_meta.copied_to = Some(vec![dest_a.clone(), dest_b.clone()]);
		let d_entry = FileDiff::new(None, Some(old_meta));
		let diff = FolderDiff::new("", vec![], vec![d_entry]);

		// target currently has src.bin (old_img present) and a.bin (one
		// destination already done) but not b.bin: any(copies_done) = true.
		let current_src = file(&root, "src.bin");
		let current_a = file(&root, "a.bin");
		let current_image = FolderImage::new("", vec![], vec![current_src, current_a]);
		let data_root = Utf8Path::from_path(target_dir.path()).unwrap().to_path_buf();

		let reports = classify(&diff, &current_image, &data_root);
		assert_eq!(reports.iter().find(|r| r.kind == TaskKind::Copy).unwrap().entries.len(), 1);

		run(&reports, &data_root, false).unwrap();
		assert!(!target_root.join("src.bin").exists());
		assert!(target_root.join("a.bin").exists());
		assert!(target_root.join("b.bin").exists());
	}
}
