//! Seams towards the subsystems the engine collaborates with but does not
//! own. Defaults are no-ops so the engine can run stand-alone (and in tests).

use std::path::Path;

use async_trait::async_trait;
use cirrus_types::{
	crypto::ContentHash,
	ids::{FileId, LocalFileId},
};

use crate::error::NetError;

/// Pause/resume handle of the local-scan subsystem. The worker brackets every
/// filesystem-visible mutation with `stop`/`resume` so out-of-band change
/// detection does not race the sync engine, and pokes `wake` after
/// best-effort cleanups the scanner should re-inspect.
pub trait LocalScanHook: Send + Sync {
	fn stop(&self) {}
	fn resume(&self) {}
	/// Invalidate the current scan pass without pausing.
	fn restart(&self) {}
	fn wake(&self) {}
}

pub struct NullLocalScan;

impl LocalScanHook for NullLocalScan {}

/// Hooks into the upload engine.
pub trait UploadHook: Send + Sync {
	/// A previously blocked fstask may have become eligible.
	fn wake(&self) {}
	/// A local file is going away; pending uploads of it are moot.
	fn delete_upload_tasks_for_file(&self, _id: LocalFileId) {}
}

pub struct NullUpload;

impl UploadHook for NullUpload {}

/// Optional LAN/peer transfer probe tried before falling back to the content
/// hosts.
#[async_trait]
pub trait PeerAccelerator: Send + Sync {
	/// On success writes the full, verified body to `dest` and returns true;
	/// returns false when no peer has the content.
	async fn try_fetch(
		&self,
		file_id: FileId,
		checksum: &ContentHash,
		size: u64,
		dest: &Path,
	) -> Result<bool, NetError>;
}

pub struct NoPeers;

#[async_trait]
impl PeerAccelerator for NoPeers {
	async fn try_fetch(
		&self,
		_file_id: FileId,
		_checksum: &ContentHash,
		_size: u64,
		_dest: &Path,
	) -> Result<bool, NetError> {
		Ok(false)
	}
}
