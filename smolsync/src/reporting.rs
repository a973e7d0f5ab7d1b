//! The hashing loop (C4) never touches a terminal or log sink directly; it
//! reports through this trait instead, so tests can observe progress and the
//! CLI can back it with an `indicatif` bar. Carried over from the progress
//! reporting design used elsewhere in this codebase's lineage, trimmed down
//! to the single counted-progress shape C4 actually needs.

pub trait Reporter: Sync {
	/// Called once up front with the total amount of work, if known.
	fn set_total(&self, total: usize);
	/// Called after each unit of work completes. May be called concurrently.
	fn incr(&self, n: usize);
	fn done(&self);
}

/// A `Reporter` that does nothing, for callers that don't care about progress.
#[derive(Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
	fn set_total(&self, _total: usize) {}
	fn incr(&self, _n: usize) {}
	fn done(&self) {}
}

/// A `Reporter` that just counts, for tests.
#[derive(Default)]
pub struct CountingReporter {
	total: std::sync::atomic::AtomicUsize,
	done: std::sync::atomic::AtomicUsize,
	finished: std::sync::atomic::AtomicBool,
}

impl Reporter for CountingReporter {
	fn set_total(&self, total: usize) {
		self.total.store(total, std::sync::atomic::Ordering::SeqCst);
	}
	fn incr(&self, n: usize) {
		self.done.fetch_add(n, std::sync::atomic::Ordering::SeqCst);
	}
	fn done(&self) {
		self.finished.store(true, std::sync::atomic::Ordering::SeqCst);
	}
}

impl CountingReporter {
	pub fn total(&self) -> usize {
		self.total.load(std::sync::atomic::Ordering::SeqCst)
	}
	pub fn count(&self) -> usize {
		self.done.load(std::sync::atomic::Ordering::SeqCst)
	}
	pub fn is_done(&self) -> bool {
		self.finished.load(std::sync::atomic::Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counting_reporter_tracks_progress() {
		let r = CountingReporter::default();
		r.set_total(3);
		r.incr(1);
		r.incr(2);
		r.done();
		assert_eq!(r.total(), 3);
		assert_eq!(r.count(), 3);
		assert!(r.is_done());
	}
}
