//! Terminal-facing glue: progress bars, confirmation prompts, and the tree
//! printers for images/diffs/task reports. None of this lives in the core
//! crate -- it's presentation, not the data model.

use std::collections::HashSet;

use anyhow::Result;
use camino::Utf8PathBuf;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use smolsync::diff::FolderDiff;
use smolsync::image::FolderImage;
use smolsync::reporting::Reporter;
use smolsync::tasks::{describe, TaskDescription, TaskReport};

pub fn confirm(msg: &str) -> Result<bool> {
	Ok(Confirm::new().with_prompt(msg).interact()?)
}

static PROGRESS_TEMPLATE: &str = "{spinner} [{percent:>3}% {pos:>3}/{len:3}] {msg} {wide_bar}";
static PROGRESS_TEMPLATE_FINISHED: &str = "{spinner} [{percent:>3}% {pos:>3}/{len:3}] {msg}";

/// The hashing-progress `Reporter` backed by an `indicatif` bar.
pub struct Bar(ProgressBar);

impl Bar {
	pub fn new(msg: &str) -> Self {
		let style = ProgressStyle::with_template(PROGRESS_TEMPLATE).unwrap();
		Self(ProgressBar::new(0).with_message(msg.to_string()).with_style(style))
	}
}

impl Reporter for Bar {
	fn set_total(&self, total: usize) {
		self.0.set_length(total as u64);
	}
	fn incr(&self, n: usize) {
		self.0.inc(n as u64);
	}
	fn done(&self) {
		let style = ProgressStyle::with_template(
			&console::style(PROGRESS_TEMPLATE_FINISHED).green().to_string(),
		)
		.unwrap();
		self.0.set_style(style);
		self.0.abandon();
	}
}

pub fn human_readable_size(size: i64, plus: bool) -> String {
	let sign = if plus && size > 0 { "+" } else { "" };
	let mut value = size as f64;
	if value.abs() < 1024.0 {
		return format!("{sign}{size} b");
	}
	let mut unit = "b";
	for candidate in ["kb", "mb", "gb", "tb", "pb"] {
		value /= 1024.0;
		unit = candidate;
		if value.abs() < 1024.0 || candidate == "pb" {
			break;
		}
	}
	format!("{sign}{value:.1} {unit}")
}

/// Draws one tree branch connector and returns the prefix the children
/// should continue with.
pub fn print_tree_line(start: &str, last: bool) -> String {
	print!("{start}");
	if last {
		print!("└── ");
		format!("{start}    ")
	} else {
		print!("├── ");
		format!("{start}│   ")
	}
}

pub fn print_image_tree(image: &FolderImage, hide_files: bool) {
	print_image_node(image, "", hide_files);
}

fn print_image_node(image: &FolderImage, start: &str, hide_files: bool) {
	let files: Vec<&str> = if hide_files {
		Vec::new()
	} else {
		image.files.iter().map(|f| f.name.as_str()).collect()
	};
	let total = image.folders.len() + files.len();
	let mut i = 0;
	for folder in &image.folders {
		let child_start = print_tree_line(start, i == total - 1);
		println!("{}", folder.name);
		print_image_node(folder, &child_start, hide_files);
		i += 1;
	}
	for name in files {
		let _ = print_tree_line(start, i == total - 1);
		println!("{name}");
		i += 1;
	}
}

pub fn print_diff_tree(diff: &FolderDiff, verbose: bool, hide: &HashSet<char>, hide_files: bool) {
	println!(
		"{}  {}  {}",
		diff.name,
		human_readable_size(diff.copied_size, false),
		human_readable_size(diff.change_in_size, true)
	);
	print_diff_node(diff, "", verbose, hide, hide_files);
}

fn print_diff_node(diff: &FolderDiff, start: &str, verbose: bool, hide: &HashSet<char>, hide_files: bool) {
	let folders: Vec<&FolderDiff> = diff
		.folders
		.iter()
		.filter(|f| {
			if f.statuses().is_subset(hide) {
				return false;
			}
			verbose || f.has_changes()
		})
		.collect();
	let files: Vec<_> = if hide_files {
		Vec::new()
	} else {
		diff.files
			.iter()
			.filter(|f| !hide.contains(&f.status) && f.has_changes())
			.collect()
	};

	let total = folders.len() + files.len();
	let mut i = 0;
	for folder in folders {
		let child_start = print_tree_line(start, i == total - 1);
		print!("{}  {}  {}  ", folder.name, human_readable_size(folder.copied_size, false), human_readable_size(folder.change_in_size, true));
		println!();
		print_diff_node(folder, &child_start, verbose, hide, hide_files);
		i += 1;
	}
	for file in files {
		let _ = print_tree_line(start, i == total - 1);
		let size = file.size();
		print!("{}", file.name());
		if size != 0 && file.status != 'C' {
			print!("  {}", human_readable_size(size, true));
		}
		println!(" {}", file.status);
		i += 1;
	}
}

/// Renders the classification report the way `check`/`apply` print it:
/// one header per non-empty, sufficiently-verbose bucket, then its entries.
pub fn print_task_reports(reports: &[TaskReport], verbose: u8) {
	for report in reports {
		if report.entries.is_empty() || report.kind.verbosity() > verbose {
			continue;
		}
		println!("{}:", report.kind.header());
		let last = report.entries.len() - 1;
		for (i, summary) in report.entries.iter().enumerate() {
			let start = print_tree_line("", i == last);
			match describe(report.kind, summary) {
				TaskDescription::Path(p) => println!("{p}"),
				TaskDescription::CopyList { source, destinations } => {
					println!("{source}");
					let last_dest = destinations.len().saturating_sub(1);
					for (j, dest) in destinations.iter().enumerate() {
						print!("{start}");
						if j == last_dest {
							print!("└─► ");
						} else {
							print!("├─► ");
						}
						println!("{dest}");
					}
				}
			}
		}
	}
}

/// `%APPDATA%/smolsync` on Windows, `$HOME/.smolsync` everywhere else.
pub fn default_settings_dir() -> Result<Utf8PathBuf> {
	#[cfg(windows)]
	let base = dirs::data_dir();
	#[cfg(not(windows))]
	let base = dirs::home_dir();

	let base = base.ok_or_else(|| anyhow::anyhow!("could not determine the default settings directory"))?;
	let base = Utf8PathBuf::from_path_buf(base).map_err(|p| anyhow::anyhow!("non-utf8 home directory: {p:?}"))?;

	#[cfg(windows)]
	{
		Ok(base.join("smolsync"))
	}
	#[cfg(not(windows))]
	{
		Ok(base.join(".smolsync"))
	}
}
