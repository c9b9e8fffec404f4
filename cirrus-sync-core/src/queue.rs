//! Producer side of the persistent task queue. Thin parameter packaging over
//! [`crate::db::task`]: each producer appends one durable row and wakes the
//! download worker after the insert has committed.

use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};

use cirrus_types::ids::{FileId, FolderId, LocalFolderId, SyncId};
use tokio::sync::Notify;

use crate::{
	db::{Database, task, task::TaskType},
	error::TaskError,
};

/// Wake flag of the download main loop, the `download_wakes` counter of old:
/// wakes are level-triggered and collapse while the worker is busy.
pub struct WorkerWaker {
	pending: AtomicBool,
	notify: Notify,
}

impl WorkerWaker {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			pending: AtomicBool::new(false),
			notify: Notify::new(),
		})
	}

	pub fn wake(&self) {
		self.pending.store(true, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub async fn wait(&self) {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.pending.swap(false, Ordering::SeqCst) {
				return;
			}
			notified.await;
		}
	}
}

#[derive(Clone)]
pub struct TaskQueue {
	db: Arc<Database>,
	waker: Arc<WorkerWaker>,
}

impl TaskQueue {
	pub fn new(db: Arc<Database>, waker: Arc<WorkerWaker>) -> Self {
		Self { db, waker }
	}

	fn insert(
		&self,
		typ: TaskType,
		syncid: SyncId,
		itemid: u64,
		localitemid: u64,
		newitemid: u64,
		newsyncid: SyncId,
		name: Option<&str>,
	) -> Result<u64, TaskError> {
		let id = {
			let conn = self.db.conn();
			task::insert(&conn, typ, syncid, itemid, localitemid, newitemid, newsyncid, name)?
		};
		self.waker.wake();
		Ok(id)
	}

	pub fn create_local_folder(
		&self,
		syncid: SyncId,
		folderid: FolderId,
		localfolderid: LocalFolderId,
	) -> Result<u64, TaskError> {
		self.insert(
			TaskType::CreateLocalFolder,
			syncid,
			folderid.0,
			localfolderid.0,
			0,
			SyncId(0),
			None,
		)
	}

	pub fn delete_local_folder(
		&self,
		syncid: SyncId,
		folderid: FolderId,
		localfolderid: LocalFolderId,
		name: &str,
	) -> Result<u64, TaskError> {
		self.insert(
			TaskType::DeleteLocalFolder,
			syncid,
			folderid.0,
			localfolderid.0,
			0,
			SyncId(0),
			Some(name),
		)
	}

	pub fn delete_local_folder_recursive(
		&self,
		syncid: SyncId,
		folderid: FolderId,
		localfolderid: LocalFolderId,
	) -> Result<u64, TaskError> {
		self.insert(
			TaskType::DelrecLocalFolder,
			syncid,
			folderid.0,
			localfolderid.0,
			0,
			SyncId(0),
			None,
		)
	}

	pub fn rename_local_folder(
		&self,
		syncid: SyncId,
		folderid: FolderId,
		localfolderid: LocalFolderId,
		newlocalparentfolderid: LocalFolderId,
		newname: &str,
	) -> Result<u64, TaskError> {
		self.insert(
			TaskType::RenameLocalFolder,
			syncid,
			folderid.0,
			localfolderid.0,
			newlocalparentfolderid.0,
			SyncId(0),
			Some(newname),
		)
	}

	pub fn download_file(
		&self,
		syncid: SyncId,
		fileid: FileId,
		localfolderid: LocalFolderId,
		name: &str,
	) -> Result<u64, TaskError> {
		self.insert(
			TaskType::DownloadFile,
			syncid,
			fileid.0,
			localfolderid.0,
			0,
			SyncId(0),
			Some(name),
		)
	}

	pub fn delete_local_file(
		&self,
		fileid: FileId,
		remotepath: Option<&str>,
	) -> Result<u64, TaskError> {
		self.insert(
			TaskType::DeleteLocalFile,
			SyncId(0),
			fileid.0,
			0,
			0,
			SyncId(0),
			remotepath,
		)
	}

	pub fn rename_local_file(
		&self,
		oldsyncid: SyncId,
		newsyncid: SyncId,
		fileid: FileId,
		oldlocalfolderid: LocalFolderId,
		newlocalfolderid: LocalFolderId,
		newname: &str,
	) -> Result<u64, TaskError> {
		self.insert(
			TaskType::RenameLocalFile,
			oldsyncid,
			fileid.0,
			oldlocalfolderid.0,
			newlocalfolderid.0,
			newsyncid,
			Some(newname),
		)
	}
}
