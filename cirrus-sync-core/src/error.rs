use std::io;

use cirrus_types::error::{ErrorClass, ResponseError};
use thiserror::Error;

/// Network failures as the worker sees them: either worth a backoff and a
/// retry, or final for the piece of work that triggered them. The worker
/// never propagates these above itself (§ error design); they only select a
/// retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
	#[error("transient network failure")]
	Temp,
	#[error("permanent network failure")]
	Perm,
}

impl From<ResponseError> for NetError {
	fn from(err: ResponseError) -> Self {
		match err.class() {
			ErrorClass::Transient => NetError::Temp,
			ErrorClass::Permanent => NetError::Perm,
		}
	}
}

impl From<reqwest::Error> for NetError {
	fn from(err: reqwest::Error) -> Self {
		// Connection-level trouble is always retryable; a well-formed error
		// status from a content host means the link is stale.
		if err.is_status() { NetError::Perm } else { NetError::Temp }
	}
}

#[derive(Debug, Error)]
pub enum TaskError {
	#[error("sql error: {0}")]
	Sql(#[from] rusqlite::Error),
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("{0}")]
	Net(#[from] NetError),
	#[error("entry already exists")]
	Exists,
	#[error("entry not found")]
	NotFound,
}

#[allow(unused)]
pub(crate) trait ErrorExt<T> {
	fn context(self, context: &'static str) -> Result<T, TaskError>;
}

impl<T, E> ErrorExt<T> for Result<T, E>
where
	TaskError: From<E>,
{
	fn context(self, context: &'static str) -> Result<T, TaskError> {
		self.map_err(|e| {
			let e = TaskError::from(e);
			log::debug!("{context}: {e}");
			e
		})
	}
}

/// Classification of filesystem errors into the buckets the retry discipline
/// cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsClass {
	/// Disk full or quota exhausted.
	Full,
	/// Busy or read-only; worth retrying later, not now.
	Busy,
	/// Target missing; usually user intent.
	Missing,
	/// Destination already exists (including not-empty / not-a-directory
	/// variants of rename).
	Exists,
	Other,
}

pub fn classify_fs_error(err: &io::Error) -> FsClass {
	use io::ErrorKind::*;
	match err.kind() {
		StorageFull | QuotaExceeded => FsClass::Full,
		ResourceBusy | ReadOnlyFilesystem => FsClass::Busy,
		NotFound => FsClass::Missing,
		AlreadyExists | DirectoryNotEmpty | NotADirectory => FsClass::Exists,
		_ => FsClass::Other,
	}
}
