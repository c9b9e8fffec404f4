use std::time::Duration;

use crate::consts;

/// Runtime knobs of the engine. Constructed once at startup (defaults come
/// from [`crate::consts`]) and shared immutably; the surrounding client maps
/// its settings store onto this before building the engine.
#[derive(Debug, Clone)]
pub struct Settings {
	pub max_parallel_downloads: usize,
	pub start_new_downloads_threshold: u64,
	pub min_size_for_checksums: u64,
	pub min_size_for_p2p: u64,
	/// Bytes that must stay free on the target disk after a download;
	/// 0 disables the check.
	pub min_local_free_space: u64,
	pub copy_buffer_size: usize,
	pub block_size: u64,
	pub sleep_on_disk_full: Duration,
	pub sleep_on_locked_file: Duration,
	pub sleep_on_failed_download: Duration,
	pub sock_timeout_on_exception: Duration,
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			max_parallel_downloads: consts::MAX_PARALLEL_DOWNLOADS,
			start_new_downloads_threshold: consts::START_NEW_DOWNLOADS_THRESHOLD,
			min_size_for_checksums: consts::MIN_SIZE_FOR_CHECKSUMS,
			min_size_for_p2p: consts::MIN_SIZE_FOR_P2P,
			min_local_free_space: 0,
			copy_buffer_size: consts::COPY_BUFFER_SIZE,
			block_size: consts::BLOCK_SIZE,
			sleep_on_disk_full: consts::SLEEP_ON_DISK_FULL,
			sleep_on_locked_file: consts::SLEEP_ON_LOCKED_FILE,
			sleep_on_failed_download: consts::SLEEP_ON_FAILED_DOWNLOAD,
			sock_timeout_on_exception: consts::SOCK_TIMEOUT_ON_EXCEPTION,
		}
	}
}
