//! The file-download protocol: dedup short-circuits, admission, optional
//! peer fetch, range-planned body transfer with rolling verification, and
//! the atomic publish with conflict handling. The stop flag is observed at
//! every suspension point.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use cirrus_types::{crypto::ContentHash, ids::{FileId, LocalFolderId, SyncId}};
use log::{debug, error, warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{
	admission::DownloadMark,
	consts,
	db::{local, task, task::TaskRow},
	error::NetError,
	events::SyncEvent,
	fsutil,
	ranges::{self, RangeSource},
	remote::{self, FileMeta},
};

use super::WorkerCtx;

/// Marks the row in progress, waits until a new body could start, then hands
/// the row to a spawned task. If the download is flagged stopped while still
/// queued here, the row is released again and nothing is spawned.
pub(super) async fn start(ctx: Arc<WorkerCtx>, row: TaskRow) {
	let fileid = FileId(row.itemid);
	let syncid = row.syncid;
	let localfolderid = LocalFolderId(row.localitemid);
	let Some(filename) = row.name.clone().filter(|n| !n.is_empty()) else {
		error!("download task {} without a file name", row.id);
		let conn = ctx.db.conn();
		let _ = task::complete(&conn, row.id);
		return;
	};
	{
		let conn = ctx.db.conn();
		if let Err(e) = task::mark_in_progress(&conn, row.id) {
			error!("cannot mark task {} in progress: {e}", row.id);
			return;
		}
	}
	let mark = ctx.admission.register(fileid, syncid);
	if !ctx.admission.wait_clear(&mark).await {
		ctx.admission.unregister(&mark);
		let conn = ctx.db.conn();
		let _ = task::reset_in_progress(&conn, row.id);
		return;
	}
	tokio::spawn(run(ctx, row.id, syncid, fileid, localfolderid, filename, mark));
}

async fn run(
	ctx: Arc<WorkerCtx>,
	taskid: u64,
	syncid: SyncId,
	fileid: FileId,
	localfolderid: LocalFolderId,
	filename: String,
	mark: Arc<DownloadMark>,
) {
	match download_file(&ctx, syncid, fileid, localfolderid, &filename, &mark).await {
		Outcome::Done => {
			let conn = ctx.db.conn();
			if let Err(e) = task::complete(&conn, taskid) {
				error!("cannot delete finished download task {taskid}: {e}");
			}
		}
		Outcome::Retry => {
			tokio::time::sleep(ctx.settings.sleep_on_failed_download).await;
			{
				let conn = ctx.db.conn();
				let _ = task::reset_in_progress(&conn, taskid);
			}
			ctx.waker.wake();
		}
	}
	ctx.admission.unregister(&mark);
}

enum Outcome {
	/// The task row is finished (successfully or given up on).
	Done,
	/// Leave the row in the queue with `inprogress` cleared.
	Retry,
}

/// Transient network trouble: back off the way the timer-exception path
/// does before the task is retried.
async fn exception_backoff(ctx: &WorkerCtx) {
	tokio::time::sleep(ctx.settings.sock_timeout_on_exception).await;
}

/// Deletes the named file when dropped. Used for the rescued `-old.partial`
/// copy, which never survives an attempt.
struct TempFileGuard(Option<PathBuf>);

impl Drop for TempFileGuard {
	fn drop(&mut self) {
		if let Some(path) = self.0.take() {
			let _ = std::fs::remove_file(&path);
		}
	}
}

async fn download_file(
	ctx: &Arc<WorkerCtx>,
	syncid: SyncId,
	fileid: FileId,
	localfolderid: LocalFolderId,
	filename: &str,
	mark: &Arc<DownloadMark>,
) -> Outcome {
	let localpath = {
		let conn = ctx.db.conn();
		local::local_path_for_folder(&conn, localfolderid, syncid)
	};
	let localpath = match localpath {
		Ok(Some(path)) => path,
		Ok(None) => {
			error!("could not get path for local folder {localfolderid}, syncid {syncid}");
			return Outcome::Done;
		}
		Err(e) => {
			error!("cannot resolve folder {localfolderid}: {e}");
			return Outcome::Retry;
		}
	};
	let name = localpath.join(filename);
	let Some(_lock) = ctx.locks.try_lock(&name) else {
		debug!("file {} is currently locked, skipping for now", name.display());
		tokio::time::sleep(ctx.settings.sleep_on_locked_file).await;
		return Outcome::Retry;
	};

	let meta = match ctx.remote.file_meta(fileid).await {
		Ok(meta) => meta,
		Err(NetError::Temp) => {
			exception_backoff(ctx).await;
			return Outcome::Retry;
		}
		Err(NetError::Perm) => {
			warn!("server permanently refuses metadata of {fileid}, dropping download");
			return Outcome::Done;
		}
	};
	mark.set_hash(meta.checksum);

	let Some(mut ticket) = ctx.admission.admit(mark).await else {
		return Outcome::Done;
	};

	if ctx.settings.min_local_free_space > 0 {
		if let Some(free) = fsutil::free_disk_space(&localpath) {
			debug!(
				"free space is {free}, needed {}+{}",
				ctx.settings.min_local_free_space, meta.size
			);
			if free >= ctx.settings.min_local_free_space + meta.size {
				ctx.gate.set_local_full(false);
			} else {
				ctx.gate.set_local_full(true);
				drop(ticket);
				tokio::time::sleep(ctx.settings.sleep_on_disk_full).await;
				return Outcome::Retry;
			}
		}
	}

	// the row may already describe exactly this content
	let by_name = {
		let conn = ctx.db.conn();
		local::find_file_by_name(&conn, syncid, localfolderid, filename)
	};
	match by_name {
		Ok(Some(row)) if row.size == meta.size && row.checksum == Some(meta.checksum) => {
			if row.fileid != fileid || row.revision != meta.revision {
				let conn = ctx.db.conn();
				if let Err(e) = local::update_file_identity(&conn, row.id, fileid, meta.revision) {
					error!("cannot update identity of localfile {}: {e}", row.id);
				}
			}
			return Outcome::Done;
		}
		Ok(_) => {}
		Err(e) => {
			error!("cannot query localfile by name: {e}");
			return Outcome::Retry;
		}
	}

	// the content may already sit on disk unrecorded
	let on_disk = {
		let name = name.clone();
		tokio::task::spawn_blocking(move || fsutil::local_file_checksum(&name)).await
	};
	let on_disk = match on_disk {
		Ok(result) => result.ok(),
		Err(_) => None,
	};
	let localsize = match on_disk {
		Some((hash, size)) if size == meta.size && hash == meta.checksum => {
			if record_file(ctx, syncid, fileid, localfolderid, filename, &name, &meta) {
				debug!("file already exists {}, not downloading", name.display());
				return Outcome::Done;
			}
			exception_backoff(ctx).await;
			return Outcome::Retry;
		}
		Some((_, size)) => size,
		None => 0,
	};

	// content-addressed dedup against every local file with the same body
	let peers = {
		let conn = ctx.db.conn();
		local::find_files_by_content(&conn, meta.size, &meta.checksum)
	};
	if let Ok(peers) = peers {
		for peer in peers {
			let src = {
				let conn = ctx.db.conn();
				local::local_path_for_file(&conn, peer)
			};
			let Ok(Some(src)) = src else { continue };
			if src == name {
				continue;
			}
			let copied = {
				let src = src.clone();
				let dst = name.clone();
				let checksum = meta.checksum;
				let size = meta.size;
				tokio::task::spawn_blocking(move || {
					fsutil::copy_file_if_checksum_matches(&src, &dst, &checksum, size)
				})
				.await
			};
			if matches!(copied, Ok(Ok(true))) {
				if record_file(ctx, syncid, fileid, localfolderid, filename, &name, &meta) {
					debug!("file {} copied from {}", name.display(), src.display());
					return Outcome::Done;
				}
				exception_backoff(ctx).await;
				return Outcome::Retry;
			}
			warn!("failed to copy {} from {}", name.display(), src.display());
		}
	}

	if mark.stopped() {
		return Outcome::Done;
	}

	ctx.events.emit(SyncEvent::FileDownloadStarted {
		syncid,
		fileid,
		localpath: name.clone(),
	});
	ticket.promote(meta.size);

	let tmpname = localpath.join(format!("{filename}{}", consts::APPEND_PARTIAL_FILES));

	if meta.size >= ctx.settings.min_size_for_p2p {
		match ctx
			.p2p
			.try_fetch(fileid, &meta.checksum, meta.size, &tmpname)
			.await
		{
			Ok(true) => {
				return if publish(ctx, &tmpname, &name, fileid, localfolderid, syncid, filename, &meta)
					.await
				{
					ctx.events.emit(SyncEvent::FileDownloadFinished {
						syncid,
						fileid,
						localpath: name.clone(),
					});
					Outcome::Done
				} else {
					exception_backoff(ctx).await;
					Outcome::Retry
				};
			}
			Ok(false) => {}
			Err(NetError::Temp) => {
				exception_backoff(ctx).await;
				return Outcome::Retry;
			}
			Err(NetError::Perm) => {}
		}
	}

	let link = match ctx.remote.file_link(fileid).await {
		Ok(link) => link,
		Err(NetError::Temp) => {
			exception_backoff(ctx).await;
			return Outcome::Retry;
		}
		Err(NetError::Perm) => {
			warn!("no usable link for {fileid}, dropping download");
			return Outcome::Done;
		}
	};

	// delta candidates: a rescued previous partial, then the current content
	let mut candidates: Vec<PathBuf> = Vec::new();
	let mut tmpold = TempFileGuard(None);
	if meta.size >= ctx.settings.min_size_for_checksums {
		if let Ok(partial) = tokio::fs::metadata(&tmpname).await {
			if partial.len() >= ctx.settings.min_size_for_checksums {
				let old = localpath.join(format!(
					"{filename}{}{}",
					consts::OLD_PARTIAL_INFIX,
					consts::APPEND_PARTIAL_FILES
				));
				if fsutil::rename_overwrite(&tmpname, &old).is_ok() {
					candidates.push(old.clone());
					tmpold = TempFileGuard(Some(old));
				}
			}
		}
		if localsize >= ctx.settings.min_size_for_checksums {
			candidates.push(name.clone());
		}
	}

	let plan = match ranges::plan(
		ctx.remote.as_ref(),
		fileid,
		meta.revision,
		meta.size,
		ctx.settings.min_size_for_checksums,
		&candidates,
	)
	.await
	{
		Ok(plan) => plan,
		Err(_) => {
			ctx.events.emit(SyncEvent::FileDownloadFailed {
				syncid,
				fileid,
				localpath: name.clone(),
			});
			return Outcome::Retry;
		}
	};

	let transferred = execute_plan(ctx, &plan, &tmpname, &link, meta.size, mark, &mut ticket).await;
	drop(tmpold);
	match transferred {
		Transfer::Cancelled => {
			let _ = tokio::fs::remove_file(&tmpname).await;
			return Outcome::Retry;
		}
		Transfer::Failed => {
			// the partial stays for the next range plan
			ctx.events.emit(SyncEvent::FileDownloadFailed {
				syncid,
				fileid,
				localpath: name.clone(),
			});
			return Outcome::Retry;
		}
		Transfer::Complete(digest) => {
			if digest != meta.checksum {
				warn!("got wrong file checksum for file {filename}");
				ctx.events.emit(SyncEvent::FileDownloadFailed {
					syncid,
					fileid,
					localpath: name.clone(),
				});
				return Outcome::Retry;
			}
		}
	}

	if publish(ctx, &tmpname, &name, fileid, localfolderid, syncid, filename, &meta).await {
		ctx.events.emit(SyncEvent::FileDownloadFinished {
			syncid,
			fileid,
			localpath: name.clone(),
		});
		debug!("file downloaded {}", name.display());
		Outcome::Done
	} else {
		ctx.events.emit(SyncEvent::FileDownloadFailed {
			syncid,
			fileid,
			localpath: name.clone(),
		});
		Outcome::Retry
	}
}

enum Transfer {
	Complete(ContentHash),
	Failed,
	Cancelled,
}

async fn execute_plan(
	ctx: &WorkerCtx,
	plan: &[ranges::PlannedRange],
	tmpname: &Path,
	link: &remote::FileLink,
	serversize: u64,
	mark: &DownloadMark,
	ticket: &mut crate::admission::AdmissionTicket,
) -> Transfer {
	let mut out = match tokio::fs::File::create(tmpname).await {
		Ok(out) => out,
		Err(e) => {
			warn!("cannot create {}: {e}", tmpname.display());
			return Transfer::Failed;
		}
	};
	let mut hasher = blake3::Hasher::new();
	for range in plan {
		match &range.source {
			RangeSource::Transfer => {
				debug!(
					"downloading {} bytes from offset {}",
					range.len, range.offset
				);
				let mut resp = match remote::fetch_range(
					&ctx.http,
					link,
					range.offset,
					range.len,
					serversize,
				)
				.await
				{
					Ok(resp) => resp,
					Err(_) => return Transfer::Failed,
				};
				let mut received = 0u64;
				loop {
					if mark.stopped() {
						return Transfer::Cancelled;
					}
					let chunk = match resp.chunk().await {
						Ok(Some(chunk)) => chunk,
						Ok(None) => break,
						Err(e) => {
							warn!("read from content host failed: {e}");
							return Transfer::Failed;
						}
					};
					if chunk.is_empty() {
						continue;
					}
					if let Err(e) = out.write_all(&chunk).await {
						warn!("write to {} failed: {e}", tmpname.display());
						return Transfer::Failed;
					}
					hasher.update(&chunk);
					received += chunk.len() as u64;
					ticket.add_downloaded(chunk.len() as u64);
					if !ctx.gate.required_ok() {
						return Transfer::Failed;
					}
				}
				if received != range.len {
					warn!(
						"content host closed early: got {received} of {} bytes",
						range.len
					);
					return Transfer::Failed;
				}
			}
			RangeSource::CopyLocal(src) => {
				debug!(
					"copying {} bytes from {} offset {}",
					range.len,
					src.display(),
					range.offset
				);
				let mut input = match tokio::fs::File::open(src).await {
					Ok(input) => input,
					Err(e) => {
						warn!("cannot open copy source {}: {e}", src.display());
						return Transfer::Failed;
					}
				};
				if input
					.seek(std::io::SeekFrom::Start(range.offset))
					.await
					.is_err()
				{
					return Transfer::Failed;
				}
				let mut remaining = range.len;
				let mut buf = vec![0u8; ctx.settings.copy_buffer_size];
				while remaining > 0 {
					if mark.stopped() {
						return Transfer::Cancelled;
					}
					let want = remaining.min(buf.len() as u64) as usize;
					let read = match input.read(&mut buf[..want]).await {
						Ok(0) => {
							warn!("copy source {} shrank under us", src.display());
							return Transfer::Failed;
						}
						Ok(read) => read,
						Err(e) => {
							warn!("read from copy source failed: {e}");
							return Transfer::Failed;
						}
					};
					if let Err(e) = out.write_all(&buf[..read]).await {
						warn!("write to {} failed: {e}", tmpname.display());
						return Transfer::Failed;
					}
					hasher.update(&buf[..read]);
					remaining -= read as u64;
					ticket.add_downloaded(read as u64);
					if !ctx.gate.required_ok() {
						return Transfer::Failed;
					}
				}
			}
		}
	}
	if let Err(e) = out.sync_all().await {
		warn!("fsync of {} failed: {e}", tmpname.display());
		return Transfer::Failed;
	}
	Transfer::Complete(hasher.finalize().into())
}

fn record_file(
	ctx: &WorkerCtx,
	syncid: SyncId,
	fileid: FileId,
	localfolderid: LocalFolderId,
	filename: &str,
	name: &Path,
	meta: &FileMeta,
) -> bool {
	let mut conn = ctx.db.conn();
	match local::record_downloaded_file(
		&mut conn,
		syncid,
		fileid,
		localfolderid,
		filename,
		name,
		&meta.checksum,
		meta.size,
		meta.revision,
	) {
		Ok(recorded) => recorded,
		Err(e) => {
			error!("cannot record downloaded file {}: {e}", name.display());
			false
		}
	}
}

/// Moves the verified body into place. An existing file with different
/// content is first classified against the server history: unknown content
/// is a user edit and gets the conflicted rename; a stale revision is
/// overwritten silently. The local scanner stays paused throughout.
#[allow(clippy::too_many_arguments)]
async fn publish(
	ctx: &Arc<WorkerCtx>,
	tmpname: &Path,
	name: &Path,
	fileid: FileId,
	localfolderid: LocalFolderId,
	syncid: SyncId,
	filename: &str,
	meta: &FileMeta,
) -> bool {
	ctx.scan.stop();
	let published = publish_inner(ctx, tmpname, name, fileid, localfolderid, syncid, filename, meta).await;
	ctx.scan.resume();
	published
}

#[allow(clippy::too_many_arguments)]
async fn publish_inner(
	ctx: &Arc<WorkerCtx>,
	tmpname: &Path,
	name: &Path,
	fileid: FileId,
	localfolderid: LocalFolderId,
	syncid: SyncId,
	filename: &str,
	meta: &FileMeta,
) -> bool {
	debug!("renaming {} to {}", tmpname.display(), name.display());
	let existing = {
		let name = name.to_path_buf();
		tokio::task::spawn_blocking(move || fsutil::local_file_checksum(&name)).await
	};
	if let Ok(Ok((localhash, localsize))) = existing {
		debug!("file {} already exists", name.display());
		match ctx
			.remote
			.is_revision_of_file(&localhash, localsize, fileid)
			.await
		{
			Err(NetError::Temp) => return false,
			Ok(false) => create_conflicted(ctx, name, localfolderid, syncid, filename),
			Ok(true) => debug!(
				"file {} is an old revision of {fileid}, overwriting",
				name.display()
			),
			// cannot classify; the server content wins
			Err(NetError::Perm) => {}
		}
	}
	if let Err(e) = fsutil::rename_overwrite(tmpname, name) {
		warn!(
			"cannot move {} into place: {e}",
			tmpname.display()
		);
		return false;
	}
	record_file(ctx, syncid, fileid, localfolderid, filename, name, meta)
}

/// The displaced content was a real user edit: move it aside and forget its
/// row so the scanner re-discovers it as a new file.
fn create_conflicted(
	ctx: &WorkerCtx,
	name: &Path,
	localfolderid: LocalFolderId,
	syncid: SyncId,
	filename: &str,
) {
	ctx.scan.restart();
	if let Err(e) = fsutil::rename_conflicted_file(name) {
		warn!("cannot move conflicting file {} aside: {e}", name.display());
	}
	{
		let conn = ctx.db.conn();
		if let Err(e) = local::delete_file_row_by_name(&conn, syncid, localfolderid, filename) {
			error!("cannot drop displaced localfile row: {e}");
		}
	}
	ctx.scan.wake();
}
