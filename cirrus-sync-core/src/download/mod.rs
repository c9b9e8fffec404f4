//! The download main loop: single consumer of the persistent task queue.
//! Folder structure tasks run inline on this task; file bodies are spawned
//! (bounded through the admission controller) and own their queue row until
//! they finish.

mod file;

use std::{io, path::Path, sync::Arc};

use cirrus_types::ids::{FileId, FolderId, LocalFileId, LocalFolderId, SyncId};
use log::{debug, error, warn};
use tokio::sync::watch;

use crate::{
	admission::Admission,
	db::{
		Database, local,
		task::{self, TaskRow, TaskType},
	},
	error::{FsClass, TaskError, classify_fs_error},
	events::{EventBus, SyncEvent},
	fsutil::{self, FileLockSet},
	hooks::{LocalScanHook, PeerAccelerator, UploadHook},
	names::filename_eq,
	queue::WorkerWaker,
	remote::RemoteClient,
	settings::Settings,
	status::StatusGate,
};

pub(crate) struct WorkerCtx {
	pub db: Arc<Database>,
	pub settings: Arc<Settings>,
	pub gate: Arc<StatusGate>,
	pub events: EventBus,
	pub admission: Arc<Admission>,
	pub remote: Arc<dyn RemoteClient>,
	pub p2p: Arc<dyn PeerAccelerator>,
	pub scan: Arc<dyn LocalScanHook>,
	pub upload: Arc<dyn UploadHook>,
	pub locks: Arc<FileLockSet>,
	pub waker: Arc<WorkerWaker>,
	pub http: reqwest::Client,
	pub shutdown: watch::Sender<bool>,
}

impl WorkerCtx {
	fn shutting_down(&self) -> bool {
		*self.shutdown.borrow()
	}
}

pub(crate) struct DownloadWorker {
	ctx: Arc<WorkerCtx>,
}

impl DownloadWorker {
	pub(crate) fn new(ctx: Arc<WorkerCtx>) -> Self {
		Self { ctx }
	}

	pub(crate) async fn run(self) {
		let ctx = self.ctx;
		loop {
			if ctx.shutting_down() {
				break;
			}
			if !ctx.gate.required_ok() {
				let mut shutdown = ctx.shutdown.subscribe();
				tokio::select! {
					_ = ctx.gate.wait_required() => {}
					_ = shutdown.wait_for(|s| *s) => continue,
				}
			}
			let row = {
				let conn = ctx.db.conn();
				task::next_ready(&conn)
			};
			match row {
				Err(e) => {
					error!("cannot read task queue: {e}");
					tokio::time::sleep(ctx.settings.sleep_on_failed_download).await;
				}
				Ok(Some(row)) => dispatch(&ctx, row).await,
				Ok(None) => {
					let mut shutdown = ctx.shutdown.subscribe();
					tokio::select! {
						_ = ctx.waker.wait() => {}
						_ = shutdown.wait_for(|s| *s) => {}
					}
				}
			}
		}
		debug!("download worker stopped");
	}
}

async fn dispatch(ctx: &Arc<WorkerCtx>, row: TaskRow) {
	let Some(typ) = row.task_type() else {
		error!("invalid task type {}", row.raw_type);
		complete_row(ctx, row.id);
		return;
	};
	if typ == TaskType::DownloadFile {
		// owns its row from here on
		file::start(Arc::clone(ctx), row).await;
		return;
	}
	let outcome = match typ {
		TaskType::CreateLocalFolder => task_create_folder(ctx, &row).await,
		TaskType::DeleteLocalFolder => task_delete_folder(ctx, &row).await,
		TaskType::DelrecLocalFolder => task_delete_folder_recursive(ctx, &row).await,
		TaskType::RenameLocalFolder => task_rename_folder(ctx, &row).await,
		TaskType::DeleteLocalFile => task_delete_file(ctx, &row).await,
		TaskType::RenameLocalFile => task_rename_file(ctx, &row).await,
		TaskType::DownloadFile => unreachable!("handled above"),
	};
	match outcome {
		Ok(()) => complete_row(ctx, row.id),
		Err(()) => {
			warn!(
				"task of type {:?}, syncid {}, id {} localid {} failed",
				typ, row.syncid, row.itemid, row.localitemid
			);
			tokio::time::sleep(ctx.settings.sleep_on_failed_download).await;
		}
	}
}

fn complete_row(ctx: &WorkerCtx, id: u64) {
	let conn = ctx.db.conn();
	if let Err(e) = task::complete(&conn, id) {
		error!("cannot delete finished task {id}: {e}");
	}
}

fn folder_path(ctx: &WorkerCtx, localfolderid: LocalFolderId, syncid: SyncId) -> Option<std::path::PathBuf> {
	let conn = ctx.db.conn();
	match local::local_path_for_folder(&conn, localfolderid, syncid) {
		Ok(path) => path,
		Err(e) => {
			error!("cannot resolve path for local folder {localfolderid}: {e}");
			None
		}
	}
}

/// Create-directory with the full retry discipline: disk-full waits, a
/// vanished parent counts as user intent, an existing entry is resolved by
/// stat (directory wins, files are moved aside).
async fn mkdir_with_retries(ctx: &WorkerCtx, path: &Path) -> Result<(), ()> {
	loop {
		let err = match tokio::fs::create_dir(path).await {
			Ok(()) => {
				ctx.gate.set_local_full(false);
				return Ok(());
			}
			Err(err) => err,
		};
		warn!("mkdir of {} failed: {err}", path.display());
		match classify_fs_error(&err) {
			FsClass::Full => {
				ctx.gate.set_local_full(true);
				tokio::time::sleep(ctx.settings.sleep_on_disk_full).await;
			}
			FsClass::Missing => {
				// no choice left, the user deleted the parent
				ctx.gate.set_local_full(false);
				return Ok(());
			}
			FsClass::Exists => {
				ctx.gate.set_local_full(false);
				match tokio::fs::metadata(path).await {
					Ok(meta) if meta.is_dir() => return Ok(()),
					Ok(_) => {
						if fsutil::rename_conflicted_file(path).is_err() {
							return Err(());
						}
					}
					Err(_) => {
						error!("mkdir failed with exists, but stat returned error, race?");
						return Err(());
					}
				}
			}
			_ => {
				ctx.gate.set_local_full(false);
				return Err(());
			}
		}
		ctx.gate.wait_required().await;
	}
}

async fn task_create_folder(ctx: &WorkerCtx, row: &TaskRow) -> Result<(), ()> {
	let localfolderid = LocalFolderId(row.localitemid);
	let Some(path) = folder_path(ctx, localfolderid, row.syncid) else {
		return Ok(());
	};
	mkdir_with_retries(ctx, &path).await?;
	{
		let conn = ctx.db.conn();
		if let Err(e) = local::update_folder_mtime(&conn, localfolderid, &path) {
			error!("cannot update folder mtime: {e}");
		}
		let _ = local::dec_folder_taskcnt(&conn, localfolderid);
	}
	ctx.events.emit(SyncEvent::LocalFolderCreated {
		syncid: row.syncid,
		folderid: FolderId(row.itemid),
		localpath: path.clone(),
	});
	debug!("local folder created {}", path.display());
	Ok(())
}

async fn task_delete_folder(ctx: &WorkerCtx, row: &TaskRow) -> Result<(), ()> {
	let localfolderid = LocalFolderId(row.localitemid);
	ctx.admission.wait_idle().await;
	if let Some(path) = folder_path(ctx, localfolderid, row.syncid) {
		let removed = {
			let path = path.clone();
			tokio::task::spawn_blocking(move || fsutil::rmdir_with_trashes(&path)).await
		};
		match removed {
			Ok(Ok(())) => {}
			Ok(Err(err)) => {
				if matches!(classify_fs_error(&err), FsClass::Busy) {
					return Err(());
				}
				// best-effort cleanup, let the scanner see what is left
				warn!("rmdir of {} failed: {err}", path.display());
				ctx.scan.wake();
			}
			Err(_) => return Err(()),
		}
		{
			let conn = ctx.db.conn();
			let _ = local::dec_folder_taskcnt(&conn, localfolderid);
		}
		ctx.events.emit(SyncEvent::LocalFolderDeleted {
			syncid: row.syncid,
			folderid: FolderId(row.itemid),
			localpath: path.clone(),
		});
		debug!("local folder deleted {}", path.display());
	}
	let conn = ctx.db.conn();
	if let Err(e) = local::delete_folder_from_db(&conn, localfolderid, ctx.upload.as_ref()) {
		error!("cannot delete folder rows: {e}");
		return Err(());
	}
	Ok(())
}

async fn task_delete_folder_recursive(ctx: &WorkerCtx, row: &TaskRow) -> Result<(), ()> {
	let localfolderid = LocalFolderId(row.localitemid);
	ctx.admission.wait_idle().await;
	ctx.scan.stop();
	let result = delete_folder_recursive_inner(ctx, row, localfolderid);
	ctx.scan.resume();
	result
}

fn delete_folder_recursive_inner(
	ctx: &WorkerCtx,
	row: &TaskRow,
	localfolderid: LocalFolderId,
) -> Result<(), ()> {
	let Some(path) = folder_path(ctx, localfolderid, row.syncid) else {
		return Ok(());
	};
	debug!(
		"got recursive delete for localfolder {localfolderid} {}",
		path.display()
	);
	let mut conn = ctx.db.conn();
	let result = (|| -> Result<(), TaskError> {
		let tx = conn.transaction()?;
		local::delete_folder_tree(&tx, &path, localfolderid, row.syncid, ctx.upload.as_ref())?;
		tx.execute(
			"DELETE FROM localfolder WHERE id = ? AND syncid = ?",
			rusqlite::params![localfolderid, row.syncid],
		)?;
		tx.commit()?;
		Ok(())
	})();
	drop(conn);
	if let Err(e) = result {
		error!("recursive delete of folder {localfolderid} failed: {e}");
		return Err(());
	}
	let _ = fsutil::rmdir_with_trashes(&path);
	Ok(())
}

/// Directory rename with fallbacks: a vanished source counts as done, a
/// directory already at the destination receives the moved children, a file
/// there is pushed aside as conflicted.
fn rename_dir_resolving(old: &Path, new: &Path) -> io::Result<()> {
	loop {
		let err = match std::fs::rename(old, new) {
			Ok(()) => return Ok(()),
			Err(err) => err,
		};
		match classify_fs_error(&err) {
			FsClass::Missing => return Ok(()),
			FsClass::Exists => {
				let meta = std::fs::metadata(new).map_err(|_| {
					error!("rename failed with exists, but stat returned error, race?");
					err
				})?;
				if meta.is_dir() {
					return move_folder_contents(old, new);
				}
				fsutil::rename_conflicted_file(new)?;
			}
			_ => return Err(err),
		}
	}
}

fn move_folder_contents(old: &Path, new: &Path) -> io::Result<()> {
	for entry in std::fs::read_dir(old)? {
		let entry = entry?;
		let target = new.join(entry.file_name());
		if let Err(e) = std::fs::rename(entry.path(), &target) {
			warn!(
				"could not move {} into {}: {e}",
				entry.path().display(),
				new.display()
			);
		}
	}
	fsutil::rmdir_with_trashes(old)
}

async fn task_rename_folder(ctx: &WorkerCtx, row: &TaskRow) -> Result<(), ()> {
	let localfolderid = LocalFolderId(row.localitemid);
	let newsyncid = row.syncid;
	let newparent = LocalFolderId(row.newitemid);
	let Some(newname) = row.name.as_deref() else {
		error!("rename folder task {} without a name", row.id);
		return Ok(());
	};
	ctx.admission.wait_idle().await;
	let folder = {
		let conn = ctx.db.conn();
		local::folder_row(&conn, localfolderid)
	};
	let folder = match folder {
		Ok(Some(folder)) => folder,
		Ok(None) => {
			error!("could not find local folder {localfolderid}");
			return Ok(());
		}
		Err(e) => {
			error!("cannot read local folder {localfolderid}: {e}");
			return Err(());
		}
	};
	if folder.syncid == newsyncid
		&& folder.localparentfolderid == Some(newparent)
		&& filename_eq(&folder.name, newname)
	{
		debug!("folder {newname} already renamed locally, probably update initiated from this client");
		return Ok(());
	}
	let Some(oldpath) = folder_path(ctx, localfolderid, folder.syncid) else {
		return Ok(());
	};
	let mut conn = ctx.db.conn();
	let renamed = (|| -> Result<Option<std::path::PathBuf>, TaskError> {
		let tx = conn.transaction()?;
		local::update_folder_location(&tx, localfolderid, newsyncid, newparent, newname)?;
		let Some(newpath) = local::local_path_for_folder(&tx, localfolderid, newsyncid)? else {
			error!("could not get local path for folder {localfolderid}");
			return Ok(None);
		};
		ctx.scan.restart();
		match rename_dir_resolving(&oldpath, &newpath) {
			Ok(()) => {
				local::dec_folder_taskcnt(&tx, localfolderid)?;
				tx.commit()?;
				Ok(Some(newpath))
			}
			Err(err) => {
				if matches!(classify_fs_error(&err), FsClass::Full) {
					ctx.gate.set_local_full(true);
				}
				// dropping the transaction rolls the row back
				Err(err.into())
			}
		}
	})();
	drop(conn);
	match renamed {
		Ok(Some(newpath)) => {
			ctx.events.emit(SyncEvent::LocalFolderRenamed {
				syncid: newsyncid,
				folderid: FolderId(row.itemid),
				localpath: newpath.clone(),
			});
			debug!(
				"local folder renamed from {} to {}",
				oldpath.display(),
				newpath.display()
			);
			Ok(())
		}
		Ok(None) => Ok(()),
		Err(e) => {
			warn!("rename of folder {localfolderid} failed: {e}");
			Err(())
		}
	}
}

async fn task_delete_file(ctx: &WorkerCtx, row: &TaskRow) -> Result<(), ()> {
	let fileid = FileId(row.itemid);
	let syncid = if row.syncid == SyncId(0) {
		None
	} else {
		Some(row.syncid)
	};
	ctx.admission.wait_idle().await;
	let rows = {
		let conn = ctx.db.conn();
		local::find_files_by_fileid(&conn, fileid, syncid)
	};
	let rows = match rows {
		Ok(rows) => rows,
		Err(e) => {
			error!("cannot list local files for {fileid}: {e}");
			return Err(());
		}
	};
	ctx.scan.restart();
	let mut failed = false;
	for file in rows {
		let path = {
			let conn = ctx.db.conn();
			local::local_path_for_file(&conn, file.id)
		};
		let Ok(Some(path)) = path else { continue };
		match std::fs::remove_file(&path) {
			Ok(()) => debug!("local file {} deleted", path.display()),
			Err(err) => {
				warn!("error deleting local file {}: {err}", path.display());
				if matches!(classify_fs_error(&err), FsClass::Busy) {
					failed = true;
					continue;
				}
			}
		}
		ctx.events.emit(SyncEvent::LocalFileDeleted {
			syncid: file.syncid,
			fileid,
			localpath: path,
			remotepath: row.name.clone(),
		});
		let conn = ctx.db.conn();
		if let Err(e) = local::delete_file_row(&conn, file.id) {
			error!("cannot delete localfile row {}: {e}", file.id);
		}
	}
	if failed { Err(()) } else { Ok(()) }
}

fn enqueue_download(ctx: &WorkerCtx, syncid: SyncId, fileid: FileId, folder: LocalFolderId, name: &str) {
	let inserted = {
		let conn = ctx.db.conn();
		task::insert(
			&conn,
			TaskType::DownloadFile,
			syncid,
			fileid.0,
			folder.0,
			0,
			SyncId(0),
			Some(name),
		)
	};
	match inserted {
		Ok(_) => ctx.waker.wake(),
		Err(e) => error!("cannot enqueue download of {fileid}: {e}"),
	}
}

async fn task_rename_file(ctx: &WorkerCtx, row: &TaskRow) -> Result<(), ()> {
	let fileid = FileId(row.itemid);
	let oldsyncid = row.syncid;
	let newsyncid = row.newsyncid;
	let newfolderid = LocalFolderId(row.newitemid);
	let Some(newname) = row.name.as_deref() else {
		error!("rename file task {} without a name", row.id);
		return Ok(());
	};
	ctx.admission.wait_idle().await;
	let rows = {
		let conn = ctx.db.conn();
		local::find_files_by_fileid(&conn, fileid, None)
	};
	let rows = match rows {
		Ok(rows) => rows,
		Err(e) => {
			error!("cannot list local files for {fileid}: {e}");
			return Err(());
		}
	};
	let mut source: Option<LocalFileId> = None;
	for file in &rows {
		if file.localparentfolderid == newfolderid
			&& file.syncid == newsyncid
			&& filename_eq(&file.name, newname)
		{
			debug!("file {newname} already renamed locally, probably update initiated from this client");
			return Ok(());
		}
		if file.syncid == oldsyncid && source.is_none() {
			source = Some(file.id);
		}
	}
	let Some(lfileid) = source else {
		enqueue_download(ctx, newsyncid, fileid, newfolderid, newname);
		return Ok(());
	};
	let Some(newfolder) = folder_path(ctx, newfolderid, newsyncid) else {
		return Ok(());
	};
	let oldpath = {
		let conn = ctx.db.conn();
		local::local_path_for_file(&conn, lfileid)
	};
	let Ok(Some(oldpath)) = oldpath else {
		return Ok(());
	};
	let newpath = newfolder.join(newname);
	ctx.scan.stop();
	let result = match fsutil::rename_overwrite(&oldpath, &newpath) {
		Err(err) if matches!(classify_fs_error(&err), FsClass::Missing) => {
			warn!(
				"rename from {} to {} failed, downloading",
				oldpath.display(),
				newpath.display()
			);
			enqueue_download(ctx, newsyncid, fileid, newfolderid, newname);
			Ok(())
		}
		Err(err) => {
			warn!("rename of {} failed: {err}", oldpath.display());
			Err(())
		}
		Ok(()) => {
			if let Ok(meta) = std::fs::metadata(&newpath) {
				let conn = ctx.db.conn();
				if let Err(e) = local::update_file_after_rename(
					&conn, lfileid, newfolderid, newsyncid, newname, &meta,
				) {
					error!("cannot update renamed localfile row: {e}");
				}
				debug!("renamed {} to {}", oldpath.display(), newpath.display());
			}
			Ok(())
		}
	};
	ctx.scan.resume();
	result
}
