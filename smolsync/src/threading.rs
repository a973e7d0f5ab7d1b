//! Sets the size of the global rayon pool used by `HashStore::hash_pending`
//! (C4's parallel hashing carve-out). Everything else in this crate runs on
//! the calling thread.

/// Sets the number of threads in the global thread pool.
/// Must be called before any tasks are run in it.
pub fn set_num_threads(thr: usize) -> Result<(), impl std::error::Error> {
	rayon::ThreadPoolBuilder::new().num_threads(thr).build_global()
}
