//! Filesystem overlay store: per-folder, reference-counted trees of pending
//! mkdir/rmdir/creat/unlink intents layered over the server view, backed by
//! the durable `fstask` table. Mutations happen on caller threads; the
//! folder map lock is taken first, the database second, everywhere.

use std::{
	collections::{BTreeMap, btree_map::Entry},
	sync::{Arc, Mutex, MutexGuard},
	time::{SystemTime, UNIX_EPOCH},
};

use cirrus_types::ids::{FolderId, FsFileId, FsFolderId, FsItemId, FsTaskId};
use log::{debug, error, warn};
use rusqlite::OptionalExtension;

use crate::{
	db::{
		Database,
		fstask::{self, FsTaskType, STATUS_LOCAL_OPEN, STATUS_READY, STATUS_RENAME_BOUND},
	},
	error::TaskError,
	hooks::UploadHook,
	names::FileNameKey,
};

fn unix_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkdirTask {
	pub taskid: FsTaskId,
	pub ctime: i64,
	pub mtime: i64,
	/// Placeholder id of the folder being created, `Pending(taskid)` until
	/// the server assigns the real one.
	pub folderid: FsFolderId,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmdirTask {
	pub taskid: FsTaskId,
	pub folderid: FsFolderId,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatTask {
	pub taskid: FsTaskId,
	pub fileid: FsFileId,
	/// False when this entry is the destination leg of a rename.
	pub newfile: bool,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkTask {
	pub taskid: FsTaskId,
	pub fileid: FsFileId,
	pub name: String,
}

trait OverlayEntry {
	fn taskid(&self) -> FsTaskId;
	fn entry_name(&self) -> &str;
}

macro_rules! overlay_entry {
	($ty:ident) => {
		impl OverlayEntry for $ty {
			fn taskid(&self) -> FsTaskId {
				self.taskid
			}
			fn entry_name(&self) -> &str {
				&self.name
			}
		}
	};
}

overlay_entry!(MkdirTask);
overlay_entry!(RmdirTask);
overlay_entry!(CreatTask);
overlay_entry!(UnlinkTask);

/// Ordered set of overlay entries of one kind within a folder, keyed by
/// filename. Several entries may share a name (with distinct task ids);
/// a lookup without a task id returns any entry with the name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskMap<T> {
	map: BTreeMap<FileNameKey, Vec<T>>,
}

impl<T> Default for TaskMap<T> {
	fn default() -> Self {
		TaskMap {
			map: BTreeMap::new(),
		}
	}
}

impl<T: OverlayEntry + Clone> TaskMap<T> {
	fn find(&self, name: &str, taskid: Option<FsTaskId>) -> Option<&T> {
		let list = self.map.get(&FileNameKey::new(name))?;
		match taskid {
			None => list.first(),
			Some(taskid) => list.iter().find(|e| e.taskid() == taskid),
		}
	}

	fn insert(&mut self, entry: T) {
		let list = self.map.entry(FileNameKey::new(entry.entry_name())).or_default();
		if list.iter().any(|e| e.taskid() == entry.taskid()) {
			error!(
				"duplicate overlay entry {} task {}, should not happen",
				entry.entry_name(),
				entry.taskid()
			);
			return;
		}
		list.push(entry);
	}

	fn remove(&mut self, name: &str, taskid: Option<FsTaskId>) -> Option<T> {
		let key = FileNameKey::new(name);
		let list = self.map.get_mut(&key)?;
		let pos = match taskid {
			None => 0,
			Some(taskid) => list.iter().position(|e| e.taskid() == taskid)?,
		};
		let entry = list.remove(pos);
		if list.is_empty() {
			self.map.remove(&key);
		}
		Some(entry)
	}

	fn entries(&self) -> Vec<T> {
		self.map.values().flatten().cloned().collect()
	}
}

#[derive(Debug)]
struct FolderTasks {
	refcnt: u32,
	taskscnt: u32,
	mkdirs: TaskMap<MkdirTask>,
	rmdirs: TaskMap<RmdirTask>,
	creats: TaskMap<CreatTask>,
	unlinks: TaskMap<UnlinkTask>,
}

impl FolderTasks {
	fn new() -> Self {
		FolderTasks {
			refcnt: 0,
			taskscnt: 0,
			mkdirs: TaskMap::default(),
			rmdirs: TaskMap::default(),
			creats: TaskMap::default(),
			unlinks: TaskMap::default(),
		}
	}
}

type FolderMap = BTreeMap<FsItemId, FolderTasks>;

fn acquire(map: &mut FolderMap, folderid: FsFolderId) -> &mut FolderTasks {
	let folder = map.entry(folderid).or_insert_with(FolderTasks::new);
	folder.refcnt += 1;
	folder
}

fn acquire_existing(map: &mut FolderMap, folderid: FsFolderId) -> Option<&mut FolderTasks> {
	let folder = map.get_mut(&folderid)?;
	folder.refcnt += 1;
	Some(folder)
}

fn release(map: &mut FolderMap, folderid: FsFolderId) {
	if let Some(folder) = map.get_mut(&folderid) {
		folder.refcnt = folder.refcnt.saturating_sub(1);
		if folder.refcnt == 0 && folder.taskscnt == 0 {
			debug!("releasing folder tasks for {folderid}");
			map.remove(&folderid);
		}
	}
}

/// Flat copy of one folder's overlay, for callers that want to merge the
/// server listing with pending changes (and for tests).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSnapshot {
	pub taskscnt: u32,
	pub mkdirs: Vec<MkdirTask>,
	pub rmdirs: Vec<RmdirTask>,
	pub creats: Vec<CreatTask>,
	pub unlinks: Vec<UnlinkTask>,
}

pub struct OverlayStore {
	db: Arc<Database>,
	upload: Arc<dyn UploadHook>,
	folders: Mutex<FolderMap>,
}

/// Reference-counted handle on one folder's overlay. Keeps the entry alive
/// while the filesystem layer iterates it; dropping the handle releases the
/// count and frees the entry once it has no tasks either.
pub struct FolderHandle {
	store: Arc<OverlayStore>,
	pub folderid: FsFolderId,
}

impl FolderHandle {
	pub fn find_mkdir(&self, name: &str, taskid: Option<FsTaskId>) -> Option<MkdirTask> {
		self.store
			.with_folder(self.folderid, |f| f.mkdirs.find(name, taskid).cloned())
			.flatten()
	}

	pub fn find_rmdir(&self, name: &str, taskid: Option<FsTaskId>) -> Option<RmdirTask> {
		self.store
			.with_folder(self.folderid, |f| f.rmdirs.find(name, taskid).cloned())
			.flatten()
	}

	pub fn find_creat(&self, name: &str, taskid: Option<FsTaskId>) -> Option<CreatTask> {
		self.store
			.with_folder(self.folderid, |f| f.creats.find(name, taskid).cloned())
			.flatten()
	}

	pub fn find_unlink(&self, name: &str, taskid: Option<FsTaskId>) -> Option<UnlinkTask> {
		self.store
			.with_folder(self.folderid, |f| f.unlinks.find(name, taskid).cloned())
			.flatten()
	}

	pub fn add_creat(&self, name: &str) -> Result<CreatTask, TaskError> {
		self.store.add_creat(self.folderid, name)
	}
}

impl Drop for FolderHandle {
	fn drop(&mut self) {
		let mut folders = self.store.lock_folders();
		release(&mut folders, self.folderid);
	}
}

impl OverlayStore {
	pub fn new(db: Arc<Database>, upload: Arc<dyn UploadHook>) -> Arc<Self> {
		Arc::new(Self {
			db,
			upload,
			folders: Mutex::new(BTreeMap::new()),
		})
	}

	fn lock_folders(&self) -> MutexGuard<'_, FolderMap> {
		self.folders.lock().expect("overlay folder map poisoned")
	}

	fn with_folder<R>(&self, folderid: FsFolderId, f: impl FnOnce(&FolderTasks) -> R) -> Option<R> {
		let folders = self.lock_folders();
		folders.get(&folderid).map(f)
	}

	pub fn get_or_create(self: &Arc<Self>, folderid: FsFolderId) -> FolderHandle {
		let mut folders = self.lock_folders();
		acquire(&mut folders, folderid);
		drop(folders);
		FolderHandle {
			store: Arc::clone(self),
			folderid,
		}
	}

	pub fn get(self: &Arc<Self>, folderid: FsFolderId) -> Option<FolderHandle> {
		let mut folders = self.lock_folders();
		acquire_existing(&mut folders, folderid)?;
		drop(folders);
		Some(FolderHandle {
			store: Arc::clone(self),
			folderid,
		})
	}

	pub fn snapshot(&self, folderid: FsFolderId) -> Option<FolderSnapshot> {
		self.with_folder(folderid, |f| FolderSnapshot {
			taskscnt: f.taskscnt,
			mkdirs: f.mkdirs.entries(),
			rmdirs: f.rmdirs.entries(),
			creats: f.creats.entries(),
			unlinks: f.unlinks.entries(),
		})
	}

	pub fn tracked_folders(&self) -> Vec<FsFolderId> {
		self.lock_folders().keys().copied().collect()
	}

	fn delete_fstask_row(&self, id: FsTaskId) {
		let mut conn = self.db.conn();
		let result = (|| -> Result<bool, TaskError> {
			let tx = conn.transaction()?;
			let removed = fstask::delete(&tx, id)?;
			tx.commit()?;
			Ok(removed)
		})();
		match result {
			Ok(true) => {}
			Ok(false) => debug!("fstask {id} already gone at ack time"),
			Err(e) => error!("failed to delete fstask {id}: {e}"),
		}
	}

	/// Registers a pending directory creation under `folderid`.
	pub fn mkdir(&self, folderid: FsFolderId, name: &str) -> Result<(), TaskError> {
		let mut folders = self.lock_folders();
		let result = self.mkdir_locked(&mut folders, folderid, name);
		release(&mut folders, folderid);
		drop(folders);
		if result? {
			self.upload.wake();
		}
		Ok(())
	}

	fn mkdir_locked(
		&self,
		folders: &mut FolderMap,
		folderid: FsFolderId,
		name: &str,
	) -> Result<bool, TaskError> {
		let folder = acquire(folders, folderid);
		if let FsItemId::Server(parent) = folderid {
			let conn = self.db.conn();
			let existing: Option<u64> = conn
				.query_one(
					"SELECT id FROM folder WHERE parentfolderid = ? AND name = ?",
					rusqlite::params![parent as i64, name],
					|row| row.get::<_, i64>(0).map(|v| v as u64),
				)
				.optional()?;
			if existing.is_some() && folder.rmdirs.find(name, None).is_none() {
				return Err(TaskError::Exists);
			}
		}
		if folder.mkdirs.find(name, None).is_some() {
			return Err(TaskError::Exists);
		}
		let ctime = unix_now();
		let taskid = {
			let mut conn = self.db.conn();
			let tx = conn.transaction()?;
			let taskid = fstask::insert(
				&tx,
				FsTaskType::Mkdir,
				STATUS_READY,
				folderid,
				FsItemId::Server(0),
				name,
				ctime,
			)?;
			if let Some(parent_task) = folderid.pending_task() {
				fstask::depend(&tx, taskid, parent_task)?;
			}
			tx.commit()?;
			taskid
		};
		folder.mkdirs.insert(MkdirTask {
			taskid,
			ctime,
			mtime: ctime,
			folderid: FsItemId::Pending(taskid),
			name: name.to_string(),
		});
		folder.taskscnt += 1;
		Ok(!folderid.is_pending())
	}

	/// Registers a pending directory removal; shadows a still-pending mkdir
	/// of the same name, annihilating the pair entirely when the mkdir never
	/// left this client.
	pub fn rmdir(&self, folderid: FsFolderId, name: &str) -> Result<(), TaskError> {
		let mut folders = self.lock_folders();
		let result = self.rmdir_locked(&mut folders, folderid, name);
		release(&mut folders, folderid);
		drop(folders);
		if result? {
			self.upload.wake();
		}
		Ok(())
	}

	fn rmdir_locked(
		&self,
		folders: &mut FolderMap,
		folderid: FsFolderId,
		name: &str,
	) -> Result<bool, TaskError> {
		let folder = acquire(folders, folderid);
		let (cancelled, cfolderid) = match folder.mkdirs.find(name, None).cloned() {
			Some(mk) => {
				folder.mkdirs.remove(name, Some(mk.taskid));
				folder.taskscnt -= 1;
				let cfolderid = mk.folderid;
				(Some(mk), cfolderid)
			}
			None => {
				let existing: Option<i64> = {
					let conn = self.db.conn();
					conn.query_one(
						"SELECT id FROM folder WHERE parentfolderid = ? AND name = ?",
						rusqlite::params![folderid, name],
						|row| row.get(0),
					)
					.optional()?
				};
				match existing {
					None => return Err(TaskError::NotFound),
					Some(_) if folder.rmdirs.find(name, None).is_some() => {
						return Err(TaskError::NotFound);
					}
					Some(id) => (None, FsItemId::from_raw(id)),
				}
			}
		};
		if let Some(mk) = &cancelled {
			// a mkdir that never left this client cancels out with its rmdir
			let conn = self.db.conn();
			if fstask::tasks_targeting_item(&conn, mk.folderid)?.is_empty()
				&& fstask::delete_if_unstarted(&conn, mk.taskid, FsTaskType::Mkdir)?
			{
				debug!("mkdir of {name} cancelled before upload, rmdir suppressed");
				return Ok(false);
			}
		}
		let (taskid, deps) = {
			let mut conn = self.db.conn();
			let tx = conn.transaction()?;
			let taskid = fstask::insert(
				&tx,
				FsTaskType::Rmdir,
				STATUS_READY,
				folderid,
				FsItemId::Server(0),
				name,
				cfolderid.to_raw(),
			)?;
			let mut deps = 0usize;
			if let Some(mk) = &cancelled {
				fstask::depend(&tx, taskid, mk.taskid)?;
				deps += 1;
			}
			// everything still mutating inside the doomed folder goes first
			for dep in fstask::tasks_targeting_item(&tx, cfolderid)? {
				if dep != taskid {
					fstask::depend(&tx, taskid, dep)?;
					deps += 1;
				}
			}
			tx.commit()?;
			(taskid, deps)
		};
		folder.rmdirs.insert(RmdirTask {
			taskid,
			folderid: cfolderid,
			name: name.to_string(),
		});
		folder.taskscnt += 1;
		Ok(deps == 0)
	}

	/// Creates an fstask row for a file whose body is still being written
	/// locally (`status = 1`, not yet eligible for upload) and returns the
	/// in-memory entry with its placeholder file id.
	pub fn add_creat(&self, folderid: FsFolderId, name: &str) -> Result<CreatTask, TaskError> {
		let mut folders = self.lock_folders();
		let result = self.add_creat_locked(&mut folders, folderid, name);
		release(&mut folders, folderid);
		result
	}

	fn add_creat_locked(
		&self,
		folders: &mut FolderMap,
		folderid: FsFolderId,
		name: &str,
	) -> Result<CreatTask, TaskError> {
		let folder = acquire(folders, folderid);
		let taskid = {
			let mut conn = self.db.conn();
			let tx = conn.transaction()?;
			let taskid = fstask::insert(
				&tx,
				FsTaskType::Creat,
				STATUS_LOCAL_OPEN,
				folderid,
				FsItemId::Server(0),
				name,
				0,
			)?;
			if let Some(parent_task) = folderid.pending_task() {
				fstask::depend(&tx, taskid, parent_task)?;
			}
			tx.commit()?;
			taskid
		};
		let task = CreatTask {
			taskid,
			fileid: FsItemId::Pending(taskid),
			newfile: true,
			name: name.to_string(),
		};
		folder.creats.insert(task.clone());
		folder.taskscnt += 1;
		Ok(task)
	}

	/// The writer finished the local body: the creat becomes eligible for
	/// upload.
	pub fn creat_ready(&self, taskid: FsTaskId) -> Result<(), TaskError> {
		{
			let conn = self.db.conn();
			fstask::set_status(&conn, taskid, STATUS_READY)?;
		}
		self.upload.wake();
		Ok(())
	}

	/// Registers a pending file removal, shadowing a pending creat of the
	/// same name.
	pub fn unlink(&self, folderid: FsFolderId, name: &str) -> Result<(), TaskError> {
		let mut folders = self.lock_folders();
		let result = self.unlink_locked(&mut folders, folderid, name);
		release(&mut folders, folderid);
		drop(folders);
		if result? {
			self.upload.wake();
		}
		Ok(())
	}

	fn unlink_locked(
		&self,
		folders: &mut FolderMap,
		folderid: FsFolderId,
		name: &str,
	) -> Result<bool, TaskError> {
		let folder = acquire(folders, folderid);
		let (cancelled, fileid) = match folder.creats.find(name, None).cloned() {
			Some(cr) => {
				folder.creats.remove(name, Some(cr.taskid));
				folder.taskscnt -= 1;
				let fileid = cr.fileid;
				(Some(cr), fileid)
			}
			None => {
				let existing: Option<i64> = {
					let conn = self.db.conn();
					conn.query_one(
						"SELECT id FROM file WHERE parentfolderid = ? AND name = ?",
						rusqlite::params![folderid, name],
						|row| row.get(0),
					)
					.optional()?
				};
				match existing {
					None => return Err(TaskError::NotFound),
					Some(_) if folder.unlinks.find(name, None).is_some() => {
						return Err(TaskError::NotFound);
					}
					Some(id) => (None, FsItemId::from_raw(id)),
				}
			}
		};
		if let Some(cr) = &cancelled {
			// same annihilation rule as mkdir/rmdir, for plain new files only
			if cr.newfile {
				let conn = self.db.conn();
				if fstask::tasks_referencing_file(&conn, cr.fileid)?.is_empty()
					&& fstask::delete_if_unstarted(&conn, cr.taskid, FsTaskType::Creat)?
				{
					debug!("creat of {name} cancelled before upload, unlink suppressed");
					return Ok(false);
				}
			}
		}
		let (taskid, deps) = {
			let mut conn = self.db.conn();
			let tx = conn.transaction()?;
			let taskid = fstask::insert(
				&tx,
				FsTaskType::Unlink,
				STATUS_READY,
				folderid,
				fileid,
				name,
				0,
			)?;
			let mut deps = 0usize;
			if let Some(cr) = &cancelled {
				fstask::depend(&tx, taskid, cr.taskid)?;
				deps += 1;
			}
			tx.commit()?;
			(taskid, deps)
		};
		folder.unlinks.insert(UnlinkTask {
			taskid,
			fileid,
			name: name.to_string(),
		});
		folder.taskscnt += 1;
		Ok(deps == 0)
	}

	/// Registers a pending file rename as the classic two-row exchange: a
	/// bound "from" leg and a ready "to" leg carrying the dependencies.
	pub fn rename_file(
		&self,
		fileid: FsFileId,
		parentfolderid: FsFolderId,
		name: &str,
		to_folderid: FsFolderId,
		new_name: Option<&str>,
	) -> Result<(), TaskError> {
		let new_name = new_name.unwrap_or(name);
		let mut folders = self.lock_folders();
		let (ftaskid, ttaskid) = {
			let mut conn = self.db.conn();
			let tx = conn.transaction()?;
			let ftaskid = fstask::insert(
				&tx,
				FsTaskType::RenFileFrom,
				STATUS_RENAME_BOUND,
				parentfolderid,
				fileid,
				name,
				0,
			)?;
			let ttaskid = fstask::insert(
				&tx,
				FsTaskType::RenFileTo,
				STATUS_READY,
				to_folderid,
				fileid,
				new_name,
				ftaskid.0 as i64,
			)?;
			fstask::depend(&tx, ttaskid, ftaskid)?;
			if let Some(task) = fileid.pending_task() {
				fstask::depend(&tx, ttaskid, task)?;
			}
			if let Some(task) = parentfolderid.pending_task() {
				fstask::depend(&tx, ttaskid, task)?;
			}
			if to_folderid != parentfolderid {
				if let Some(task) = to_folderid.pending_task() {
					fstask::depend(&tx, ttaskid, task)?;
				}
			}
			for claim in fstask::tasks_claiming_name(&tx, to_folderid, new_name)? {
				if claim != ftaskid && claim != ttaskid {
					fstask::depend(&tx, ttaskid, claim)?;
				}
			}
			tx.commit()?;
			(ftaskid, ttaskid)
		};
		{
			let folder = acquire(&mut folders, parentfolderid);
			if folder.creats.remove(name, None).is_some() {
				folder.taskscnt -= 1;
			}
			folder.unlinks.insert(UnlinkTask {
				taskid: ftaskid,
				fileid,
				name: name.to_string(),
			});
			folder.taskscnt += 1;
		}
		release(&mut folders, parentfolderid);
		{
			let folder = acquire(&mut folders, to_folderid);
			folder.creats.insert(CreatTask {
				taskid: ttaskid,
				fileid,
				newfile: false,
				name: new_name.to_string(),
			});
			folder.taskscnt += 1;
		}
		release(&mut folders, to_folderid);
		drop(folders);
		self.upload.wake();
		Ok(())
	}

	/// Server confirmed a mkdir: drop the overlay entry and re-key the
	/// placeholder folder (children enqueued under it survive under the real
	/// id).
	pub fn folder_created(
		&self,
		parentfolderid: FsFolderId,
		taskid: FsTaskId,
		folderid: FolderId,
		name: &str,
	) {
		let mut folders = self.lock_folders();
		if let Some(folder) = acquire_existing(&mut folders, parentfolderid) {
			if folder.mkdirs.remove(name, Some(taskid)).is_some() {
				folder.taskscnt -= 1;
			}
			release(&mut folders, parentfolderid);
		}
		if let Some(placeholder) = folders.remove(&FsItemId::Pending(taskid)) {
			let real = FsItemId::Server(folderid.0);
			match folders.entry(real) {
				Entry::Vacant(slot) => {
					slot.insert(placeholder);
				}
				Entry::Occupied(mut slot) => {
					warn!("folder {real} already tracked while re-keying placeholder");
					let existing = slot.get_mut();
					existing.refcnt += placeholder.refcnt;
					existing.taskscnt += placeholder.taskscnt;
					for task in placeholder.mkdirs.entries() {
						existing.mkdirs.insert(task);
					}
					for task in placeholder.rmdirs.entries() {
						existing.rmdirs.insert(task);
					}
					for task in placeholder.creats.entries() {
						existing.creats.insert(task);
					}
					for task in placeholder.unlinks.entries() {
						existing.unlinks.insert(task);
					}
				}
			}
		}
		drop(folders);
		// children recorded under the placeholder id follow it to the real one
		let mut conn = self.db.conn();
		let result = (|| -> Result<(), TaskError> {
			let tx = conn.transaction()?;
			tx.execute(
				"UPDATE fstask SET folderid = ? WHERE folderid = ?",
				rusqlite::params![FsItemId::Server(folderid.0), FsItemId::Pending(taskid)],
			)?;
			fstask::delete(&tx, taskid)?;
			tx.commit()?;
			Ok(())
		})();
		if let Err(e) = result {
			error!("failed to settle acked mkdir {taskid}: {e}");
		}
	}

	pub fn folder_deleted(&self, parentfolderid: FsFolderId, taskid: FsTaskId, name: &str) {
		let mut folders = self.lock_folders();
		if let Some(folder) = acquire_existing(&mut folders, parentfolderid) {
			if folder.rmdirs.remove(name, Some(taskid)).is_some() {
				folder.taskscnt -= 1;
			}
			release(&mut folders, parentfolderid);
		}
		drop(folders);
		self.delete_fstask_row(taskid);
	}

	pub fn file_created(&self, parentfolderid: FsFolderId, taskid: FsTaskId, name: &str) {
		let mut folders = self.lock_folders();
		if let Some(folder) = acquire_existing(&mut folders, parentfolderid) {
			if folder.creats.remove(name, Some(taskid)).is_some() {
				folder.taskscnt -= 1;
			}
			release(&mut folders, parentfolderid);
		}
		drop(folders);
		self.delete_fstask_row(taskid);
	}

	pub fn file_deleted(&self, parentfolderid: FsFolderId, taskid: FsTaskId, name: &str) {
		let mut folders = self.lock_folders();
		if let Some(folder) = acquire_existing(&mut folders, parentfolderid) {
			if folder.unlinks.remove(name, Some(taskid)).is_some() {
				folder.taskscnt -= 1;
			}
			release(&mut folders, parentfolderid);
		}
		drop(folders);
		self.delete_fstask_row(taskid);
	}

	/// Server confirmed a rename: remove the destination creat, then follow
	/// the "from" row back to the source folder and remove the unlink there.
	/// Both rows and their edges go away together.
	pub fn file_renamed(
		&self,
		folderid: FsFolderId,
		to_taskid: FsTaskId,
		name: &str,
		from_taskid: FsTaskId,
	) {
		let mut folders = self.lock_folders();
		if let Some(folder) = acquire_existing(&mut folders, folderid) {
			if folder.creats.remove(name, Some(to_taskid)).is_some() {
				folder.taskscnt -= 1;
			}
			release(&mut folders, folderid);
		}
		let from_row = {
			let conn = self.db.conn();
			fstask::get(&conn, from_taskid)
		};
		match from_row {
			Ok(Some(row)) => {
				if let Some(folder) = acquire_existing(&mut folders, row.folderid) {
					let from_name = row.text1.unwrap_or_default();
					if folder.unlinks.remove(&from_name, Some(from_taskid)).is_some() {
						folder.taskscnt -= 1;
					}
					release(&mut folders, row.folderid);
				}
			}
			Ok(None) => debug!("rename-from fstask {from_taskid} already gone"),
			Err(e) => error!("cannot read rename-from fstask {from_taskid}: {e}"),
		}
		drop(folders);
		self.delete_fstask_row(from_taskid);
		self.delete_fstask_row(to_taskid);
	}

	/// Rebuilds the in-memory trees from the persistent table, in insertion
	/// order, at startup.
	pub fn replay(&self) -> Result<(), TaskError> {
		let rows = {
			let conn = self.db.conn();
			fstask::all_ordered(&conn)?
		};
		let mut folders = self.lock_folders();
		for row in rows {
			let Some(typ) = FsTaskType::from_raw(row.raw_type) else {
				error!("invalid fstask type {} in row {}", row.raw_type, row.id);
				continue;
			};
			let name = row.text1.clone().unwrap_or_default();
			let folder = acquire(&mut folders, row.folderid);
			match typ {
				FsTaskType::Mkdir => {
					folder.mkdirs.insert(MkdirTask {
						taskid: row.id,
						ctime: row.int1,
						mtime: row.int1,
						folderid: FsItemId::Pending(row.id),
						name,
					});
					folder.taskscnt += 1;
				}
				FsTaskType::Rmdir => {
					if folder.mkdirs.remove(&name, None).is_some() {
						folder.taskscnt -= 1;
					}
					folder.rmdirs.insert(RmdirTask {
						taskid: row.id,
						folderid: FsItemId::from_raw(row.int1),
						name,
					});
					folder.taskscnt += 1;
				}
				FsTaskType::Creat => {
					folder.creats.insert(CreatTask {
						taskid: row.id,
						fileid: FsItemId::Pending(row.id),
						newfile: true,
						name,
					});
					folder.taskscnt += 1;
				}
				FsTaskType::Unlink | FsTaskType::RenFileFrom => {
					if folder.creats.remove(&name, None).is_some() {
						folder.taskscnt -= 1;
					}
					folder.unlinks.insert(UnlinkTask {
						taskid: row.id,
						fileid: row.fileid,
						name,
					});
					folder.taskscnt += 1;
				}
				FsTaskType::RenFileTo => {
					folder.creats.insert(CreatTask {
						taskid: row.id,
						fileid: row.fileid,
						newfile: false,
						name,
					});
					folder.taskscnt += 1;
				}
			}
			release(&mut folders, row.folderid);
		}
		Ok(())
	}

	/// Whether `name` under `folderid` is claimed by a pending creat or
	/// mkdir.
	pub fn name_claimed(&self, folderid: FsFolderId, name: &str) -> bool {
		self.with_folder(folderid, |f| {
			f.creats.find(name, None).is_some() || f.mkdirs.find(name, None).is_some()
		})
		.unwrap_or(false)
	}
}
