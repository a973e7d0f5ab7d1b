use std::collections::HashSet;
use std::fs::File;
use std::io::Read;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use smolsync::diff::{FolderDiff, FsDestination};
use smolsync::error::SmolsyncError;
use smolsync::hash::HashStore;
use smolsync::image::{FolderImage, IMAGE_SIGNATURE};
use smolsync::path::RootedPath;
use smolsync::settings::{Settings, TargetConfig, SETTINGS_FILE_NAME};
use smolsync::tasks::{classify, run as run_tasks};

mod cliutils;
mod zipdest;

#[derive(Parser, Debug)]
#[command(version, about = "A small-delta directory sync tool.")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
	/// How many threads to use for hashing ("-T 0" = number of logical processors)
	#[arg(short = 'T', long, default_value_t = 0, global = true)]
	threads: usize,
	/// Overwrite existing output without prompting
	#[arg(short, long, global = true)]
	force: bool,
}

#[derive(Args, Debug, Clone)]
struct TargetSelector {
	/// Settings directory, defaults to the platform settings dir
	#[arg(short = 's', long)]
	settings: Option<Utf8PathBuf>,
	/// `;`-separated target name list
	#[arg(short = 't', long, default_value = "all")]
	targets: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Scan targets and print the diff against the last saved image
	Status {
		#[command(flatten)]
		sel: TargetSelector,
		/// Persist a fresh image after printing
		#[arg(long)]
		save: bool,
		/// Print the whole tree, even entries with no changes
		#[arg(short, long)]
		verbose: bool,
		/// Suppress individual file lines, folders only
		#[arg(short)]
		quiet: bool,
		/// Statuses to hide from the printed tree, e.g. "-H D,C"
		#[arg(short = 'H', long = "hide", value_delimiter = ',')]
		hide: Vec<char>,
	},
	/// Scan targets and diff against images stored in another directory
	Compare {
		#[command(flatten)]
		sel: TargetSelector,
		/// Directory holding the `<name>.image` files to compare against
		dir: Utf8PathBuf,
		/// Copy mod-times from the stored image onto live files with matching content
		#[arg(long)]
		copy_time: bool,
		#[arg(short, long)]
		verbose: bool,
	},
	/// Scan, diff against the saved image, and persist the delta plus its payload
	Save {
		#[command(flatten)]
		sel: TargetSelector,
		/// Directory (or, with `--zip`, a `.zip` file) to write the deliverable to
		dest: Utf8PathBuf,
		/// Compare against images in this directory instead of the settings dir
		#[arg(long)]
		base: Option<Utf8PathBuf>,
		/// Package the deliverable as a single zip archive
		#[arg(long)]
		zip: bool,
		#[arg(short, long)]
		verbose: bool,
	},
	/// Load a diff, scan the target, classify tasks, and print the report
	Check {
		#[command(flatten)]
		sel: TargetSelector,
		/// Directory of `<name>.diff` files (or payload root) to classify against
		path: Utf8PathBuf,
		#[arg(short, long, default_value_t = 0)]
		verbose: u8,
	},
	/// Load a diff, scan the target, classify tasks, and run them
	Apply {
		#[command(flatten)]
		sel: TargetSelector,
		path: Utf8PathBuf,
		#[arg(short, long, default_value_t = 0)]
		verbose: u8,
		/// Record per-file failures and keep going instead of aborting the run
		#[arg(long)]
		blind: bool,
	},
	/// Auto-detect an image/diff/zip file by signature and pretty-print it
	Read {
		file: Utf8PathBuf,
		#[arg(short, long)]
		verbose: bool,
	},
	/// Print the resolved settings file path and exit
	Config,
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.compact()
		.init();

	let cli = Cli::parse();
	let threads = if cli.threads == 0 { num_cpus::get() } else { cli.threads };
	smolsync::set_num_threads(threads).ok();

	let result = match &cli.command {
		Commands::Config => cmd_config(),
		Commands::Status { sel, save, verbose, quiet, hide } => {
			let hide_set: HashSet<char> = hide.iter().copied().collect();
			cmd_status(sel, *save, *verbose, *quiet, &hide_set)
		}
		Commands::Compare { sel, dir, copy_time, verbose } => cmd_compare(sel, dir, *copy_time, *verbose),
		Commands::Save { sel, dest, base, zip, verbose } => cmd_save(sel, dest, base.as_deref(), *zip, *verbose, cli.force),
		Commands::Check { sel, path, verbose } => cmd_check(sel, path, *verbose),
		Commands::Apply { sel, path, verbose, blind } => cmd_apply(sel, path, *verbose, *blind),
		Commands::Read { file, verbose } => cmd_read(file, *verbose),
	};

	if let Err(e) = &result {
		if let Some(smolsync_err) = e.downcast_ref::<SmolsyncError>() {
			eprintln!("error: {smolsync_err}");
			std::process::exit(1);
		}
	}
	result
}

fn cmd_config() -> Result<()> {
	let dir = cliutils::default_settings_dir()?;
	println!("{}", dir.join(SETTINGS_FILE_NAME));
	Ok(())
}

fn resolve_settings_dir(sel: &TargetSelector) -> Result<Utf8PathBuf> {
	match &sel.settings {
		Some(p) => Ok(p.clone()),
		None => cliutils::default_settings_dir(),
	}
}

fn load_settings(dir: &Utf8Path) -> Result<Settings> {
	let path = dir.join(SETTINGS_FILE_NAME);
	let f = File::open(&path).map_err(|_| SmolsyncError::SettingsMissing { path: path.clone() })?;
	Settings::parse(f).context("failed to parse settings file")
}

fn select_targets<'a>(settings: &'a Settings, sel: &TargetSelector) -> Result<Vec<(&'a str, &'a TargetConfig)>> {
	if sel.targets == "all" {
		return Ok(settings.all());
	}
	let (found, missing) = settings.select(sel.targets.split(';'));
	if !missing.is_empty() {
		return Err(SmolsyncError::TargetsNotFound(missing).into());
	}
	Ok(found)
}

fn build_ignore(patterns: &[String]) -> Result<impl Fn(&Utf8Path) -> bool> {
	let mut builder = ignore::gitignore::GitignoreBuilder::new(".");
	for pattern in patterns {
		builder.add_line(None, pattern)?;
	}
	let matcher = builder.build()?;
	Ok(move |p: &Utf8Path| matcher.matched(p.as_std_path(), false).is_ignore())
}

fn scan_target(cfg: &TargetConfig) -> Result<(RootedPath, FolderImage)> {
	let root = RootedPath::new_root(cfg.root.clone());
	let should_ignore = build_ignore(&cfg.ignore)?;
	let mut image = FolderImage::scan(&root, &should_ignore).with_context(|| format!("scanning {}", cfg.root))?;
	image.name = String::new();
	Ok((root, image))
}

/// Hashes whatever `image` doesn't already have a cached hash for, against
/// `<settings_dir>/<name>.hash`, and rewrites the cache afterwards.
fn hash_with_cache(settings_dir: &Utf8Path, name: &str, image: &mut FolderImage) -> Result<()> {
	let hash_path = settings_dir.join(format!("{name}.hash"));
	let store = HashStore::load_or_empty(&hash_path);
	let unhashed = store.apply_to_image(image);
	if !unhashed.is_empty() {
		let mut store = store;
		store.hash_pending(unhashed, &cliutils::Bar::new(&format!("{name}: hashing")))?;
	}
	let fresh = HashStore::from_image(image);
	let mut f = smolsync::common::create_file(hash_path.as_std_path())?;
	fresh.save(&mut f)?;
	Ok(())
}

fn image_path(settings_dir: &Utf8Path, name: &str) -> Utf8PathBuf {
	settings_dir.join(format!("{name}.image"))
}

fn diff_path(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
	dir.join(format!("{name}.diff"))
}

fn load_image_at(path: &Utf8Path, root: &RootedPath) -> Result<Option<FolderImage>> {
	if !path.exists() {
		return Ok(None);
	}
	let mut f = File::open(path).with_context(|| format!("opening {path}"))?;
	Ok(Some(FolderImage::load(&mut f, root)?))
}

fn cmd_status(sel: &TargetSelector, save: bool, verbose: bool, quiet: bool, hide: &HashSet<char>) -> Result<()> {
	let settings_dir = resolve_settings_dir(sel)?;
	let settings = load_settings(&settings_dir)?;

	for (name, cfg) in select_targets(&settings, sel)? {
		println!("== {name} ==");
		let (root, mut image) = scan_target(cfg)?;
		hash_with_cache(&settings_dir, name, &mut image)?;

		let ip = image_path(&settings_dir, name);
		let old_image = load_image_at(&ip, &root)?;

		match &old_image {
			None => {
				println!("no previously saved state");
				cliutils::print_image_tree(&image, quiet);
			}
			Some(old) => {
				let diff = FolderDiff::compare(&image, old);
				if !verbose && !diff.has_changes() {
					println!("no changes");
				} else {
					cliutils::print_diff_tree(&diff, verbose, hide, quiet);
				}
			}
		}

		if save {
			let mut f = smolsync::common::create_file(ip.as_std_path())?;
			image.save(&mut f)?;
		}
	}
	Ok(())
}

fn cmd_compare(sel: &TargetSelector, dir: &Utf8Path, copy_time: bool, verbose: bool) -> Result<()> {
	let settings_dir = resolve_settings_dir(sel)?;
	let settings = load_settings(&settings_dir)?;

	for (name, cfg) in select_targets(&settings, sel)? {
		println!("== {name} ==");
		let (root, mut image) = scan_target(cfg)?;

		let stored_path = image_path(dir, name);
		let stored = load_image_at(&stored_path, &root)?
			.with_context(|| format!("no stored image for target {name} at {stored_path}"))?;

		if copy_time {
			let mut store = HashStore::new();
			let unhashed = store.apply_to_image(&mut image);
			store.hash_pending(unhashed, &smolsync::reporting::NullReporter)?;
			apply_copy_time(&image, &stored)?;
			// re-scan so the diff reflects the mod-times just rewritten on disk
			(_, image) = scan_target(cfg)?;
		}

		let diff = FolderDiff::compare(&image, &stored);
		cliutils::print_diff_tree(&diff, verbose, &HashSet::new(), false);
	}
	Ok(())
}

/// For every live file whose content hash matches the file at the same
/// relative path in `stored`, rewrites the live file's mtime to match --
/// so the next scan sees it as unchanged rather than modified.
fn apply_copy_time(image: &FolderImage, stored: &FolderImage) -> Result<()> {
	use std::collections::HashMap;
	use std::time::{Duration, UNIX_EPOCH};

	let mut by_path: HashMap<Utf8PathBuf, &smolsync::image::FileImage> = HashMap::new();
	for f in stored.iter_files() {
		by_path.insert(f.path.from_root(), f);
	}

	for f in image.iter_files() {
		let Some(old) = by_path.get(&f.path.from_root()) else { continue };
		if f.mod_time == old.mod_time || f.hash.is_none() || f.hash != old.hash {
			continue;
		}
		let target_time = UNIX_EPOCH + Duration::from_secs(old.mod_time as u64);
		if let Ok(file) = File::open(f.path.absolute()) {
			let _ = file.set_modified(target_time);
		}
	}
	Ok(())
}

fn cmd_save(
	sel: &TargetSelector,
	dest: &Utf8Path,
	base: Option<&Utf8Path>,
	zip: bool,
	verbose: bool,
	force: bool,
) -> Result<()> {
	let settings_dir = resolve_settings_dir(sel)?;
	let settings = load_settings(&settings_dir)?;
	let compare_dir = base.unwrap_or(&settings_dir);

	let archive_path = if zip {
		if dest.is_dir() || !dest.as_str().ends_with(".zip") {
			dest.join(format!("smoldiff_{}.zip", today_ddmmyy()))
		} else {
			dest.to_path_buf()
		}
	} else {
		dest.to_path_buf()
	};

	// check for output existence and possibly delete it, same as the archive-overwrite
	// guard on every other destructive command
	if zip && archive_path.exists() {
		if !force {
			let cont = cliutils::confirm(&format!("{archive_path} already exists, overwrite it?"))?;
			if !cont {
				bail!("output archive already exists");
			}
		}
		std::fs::remove_file(&archive_path).context("failed to remove existing archive")?;
	}

	let mut zip_writer = if zip {
		let f = smolsync::common::create_file(archive_path.as_std_path())?;
		Some(zip::ZipWriter::new(f))
	} else {
		std::fs::create_dir_all(&archive_path)?;
		None
	};

	for (name, cfg) in select_targets(&settings, sel)? {
		println!("== {name} ==");
		let (root, mut image) = scan_target(cfg)?;
		hash_with_cache(&settings_dir, name, &mut image)?;

		let stored_path = image_path(compare_dir, name);
		let Some(old_image) = load_image_at(&stored_path, &root)? else {
			println!("no previously saved state, skipping");
			continue;
		};
		let diff = FolderDiff::compare(&image, &old_image);
		if !diff.has_changes() {
			println!("no changes");
			continue;
		}
		cliutils::print_diff_tree(&diff, verbose, &HashSet::new(), false);
		let diff = diff.remove_unchanged();

		if let Some(writer) = &mut zip_writer {
			let mut diff_bytes = Vec::new();
			diff.save(&mut diff_bytes)?;
			writer
				.start_file(format!("{name}.diff"), zip::write::FileOptions::default())
				.context("writing diff entry to zip")?;
			std::io::Write::write_all(writer, &diff_bytes)?;

			let mut dest = zipdest::ZipDestination::new(writer, name);
			diff.copy_modified_to(&mut dest, Utf8Path::new(""))?;
		} else {
			let dp = diff_path(&archive_path, name);
			if dp.exists() {
				if !force {
					let cont = cliutils::confirm(&format!("{dp} already exists, overwrite it?"))?;
					if !cont {
						bail!("{dp} already exists");
					}
				}
				std::fs::remove_file(&dp).context("failed to remove existing diff file")?;
			}
			let mut f = smolsync::common::create_file(dp.as_std_path())?;
			diff.save(&mut f)?;

			let mut dest = FsDestination { root: archive_path.join(name) };
			diff.copy_modified_to(&mut dest, Utf8Path::new(""))?;
		}
	}

	if let Some(writer) = zip_writer {
		writer.finish().context("finalizing zip archive")?;
	}
	Ok(())
}

/// Formats the current date as `DD.MM.YY` the way the default archive name
/// expects. Sourced from the filesystem clock rather than a library-level
/// `now()` so the core stays free of wall-clock dependencies.
fn today_ddmmyy() -> String {
	let secs = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0);
	let days = secs / 86_400;
	let (y, m, d) = civil_from_days(days as i64);
	format!("{:02}.{:02}.{:02}", d, m, y % 100)
}

/// Howard Hinnant's days-since-epoch -> civil date algorithm (public domain).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
	let z = z + 719_468;
	let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
	let doe = (z - era * 146_097) as u64;
	let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
	let y = yoe as i64 + era * 400;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
	let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
	(if m <= 2 { y + 1 } else { y }, m, d)
}

fn cmd_check(sel: &TargetSelector, path: &Utf8Path, verbose: u8) -> Result<()> {
	run_classification(sel, path, verbose, None)
}

fn cmd_apply(sel: &TargetSelector, path: &Utf8Path, verbose: u8, blind: bool) -> Result<()> {
	run_classification(sel, path, verbose, Some(blind))
}

/// Shared body of `check`/`apply`: load the diff, scan the target, classify,
/// print the report, and -- only if `apply` is `Some` -- run the tasks.
fn run_classification(sel: &TargetSelector, path: &Utf8Path, verbose: u8, apply: Option<bool>) -> Result<()> {
	let settings_dir = resolve_settings_dir(sel)?;
	let settings = load_settings(&settings_dir)?;

	for (name, cfg) in select_targets(&settings, sel)? {
		println!("== {name} ==");
		let (root, current_image) = scan_target(cfg)?;

		let dp = diff_path(path, name);
		let mut f = File::open(&dp).with_context(|| format!("opening {dp}"))?;
		let mut diff = FolderDiff::load(&mut f, &root)?;
		diff.connect_copied_by_path();

		let data_root = path.join(name);
		let reports = classify(&diff, &current_image, &data_root);
		cliutils::print_task_reports(&reports, verbose);

		if let Some(blind) = apply {
			let outcome = run_tasks(&reports, &data_root, blind)?;
			for err in &outcome.errors {
				eprintln!("error applying {} ({}): {}", err.path, err.kind.header(), err.source);
			}
			if !outcome.errors.is_empty() {
				bail!("{} task(s) failed under --blind", outcome.errors.len());
			}
		}
	}
	Ok(())
}

fn cmd_read(file: &Utf8Path, verbose: bool) -> Result<()> {
	if file.extension() == Some("zip") {
		let f = File::open(file).with_context(|| format!("opening {file}"))?;
		let mut archive = zip::ZipArchive::new(f).context("not a valid zip archive")?;
		for i in 0..archive.len() {
			let mut entry = archive.by_index(i)?;
			if !entry.name().ends_with(".diff") {
				continue;
			}
			println!("== {} ==", entry.name());
			let mut buf = Vec::new();
			entry.read_to_end(&mut buf)?;
			print_diff_bytes(&buf, verbose)?;
		}
		return Ok(());
	}

	let mut buf = Vec::new();
	File::open(file)
		.with_context(|| format!("opening {file}"))?
		.read_to_end(&mut buf)?;
	print_any_bytes(&buf, verbose)
}

fn print_any_bytes(buf: &[u8], verbose: bool) -> Result<()> {
	if buf.starts_with(IMAGE_SIGNATURE) {
		let root = RootedPath::new_root(".");
		let image = FolderImage::load(&mut std::io::Cursor::new(buf), &root)?;
		cliutils::print_image_tree(&image, false);
		return Ok(());
	}
	if buf.starts_with(smolsync::diff::DIFF_SIGNATURE) {
		return print_diff_bytes(buf, verbose);
	}

	let found: [u8; 8] = buf.get(..8).and_then(|s| s.try_into().ok()).unwrap_or([0u8; 8]);
	println!("not a smolsync file");
	if verbose {
		println!("signature bytes: {found:02x?}");
	}
	Ok(())
}

fn print_diff_bytes(buf: &[u8], verbose: bool) -> Result<()> {
	let root = RootedPath::new_root(".");
	let mut diff = FolderDiff::load(&mut std::io::Cursor::new(buf), &root)?;
	diff.connect_copied_by_path();
	cliutils::print_diff_tree(&diff, verbose, &HashSet::new(), false);
	Ok(())
}
