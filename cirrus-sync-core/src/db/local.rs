//! Queries over the local view tables: `syncfolder`, `localfolder`,
//! `localfile`, `syncedfolder`. The download worker is the main caller; the
//! content index queries back the dedup steps of the file download.

use std::{
	fs::Metadata,
	path::{Path, PathBuf},
};

use cirrus_types::{
	crypto::ContentHash,
	ids::{FileId, FolderId, LocalFileId, LocalFolderId, SyncId},
};
use log::{debug, error};
use rusqlite::{Connection, OptionalExtension, params};

use crate::{error::TaskError, fsutil, hooks::UploadHook};

const LOCAL_PATH_FOR_FOLDER: &str = include_str!("../../sql/local_path_for_folder.sql");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileRow {
	pub id: LocalFileId,
	pub syncid: SyncId,
	pub localparentfolderid: LocalFolderId,
	pub name: String,
	pub fileid: FileId,
	pub revision: u64,
	pub size: u64,
	pub checksum: Option<ContentHash>,
}

impl LocalFileRow {
	fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
		Ok(LocalFileRow {
			id: row.get(0)?,
			syncid: row.get(1)?,
			localparentfolderid: row.get(2)?,
			name: row.get(3)?,
			fileid: row.get(4)?,
			revision: row.get::<_, i64>(5)? as u64,
			size: row.get::<_, i64>(6)? as u64,
			checksum: row.get(7)?,
		})
	}
}

const FILE_COLUMNS: &str =
	"id, syncid, localparentfolderid, name, fileid, revision, size, checksum";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFolderRow {
	pub id: LocalFolderId,
	pub syncid: SyncId,
	pub localparentfolderid: Option<LocalFolderId>,
	pub folderid: FolderId,
	pub name: String,
}

/// Registers a sync root: the `syncfolder` row, its root `localfolder` row
/// (empty name, no parent) and the remote↔local mapping.
pub fn add_sync(
	conn: &mut Connection,
	syncid: SyncId,
	folderid: FolderId,
	localpath: &Path,
) -> Result<LocalFolderId, TaskError> {
	let tx = conn.transaction()?;
	tx.execute(
		"INSERT INTO syncfolder (id, folderid, localpath) VALUES (?, ?, ?)",
		params![syncid, folderid, localpath.to_string_lossy()],
	)?;
	tx.execute(
		"INSERT INTO localfolder (syncid, localparentfolderid, folderid, name) VALUES (?, NULL, ?, '')",
		params![syncid, folderid],
	)?;
	let localfolderid = LocalFolderId(tx.last_insert_rowid() as u64);
	tx.execute(
		"INSERT INTO syncedfolder (syncid, folderid, localfolderid) VALUES (?, ?, ?)",
		params![syncid, folderid, localfolderid],
	)?;
	tx.commit()?;
	Ok(localfolderid)
}

/// Registers a known subfolder of a sync (the diff consumer does this when a
/// remote folder appears).
pub fn add_local_folder(
	conn: &mut Connection,
	syncid: SyncId,
	parent: LocalFolderId,
	folderid: FolderId,
	name: &str,
) -> Result<LocalFolderId, TaskError> {
	let tx = conn.transaction()?;
	tx.execute(
		"INSERT INTO localfolder (syncid, localparentfolderid, folderid, name) VALUES (?, ?, ?, ?)",
		params![syncid, parent, folderid, name],
	)?;
	let id = LocalFolderId(tx.last_insert_rowid() as u64);
	tx.execute(
		"INSERT OR REPLACE INTO syncedfolder (syncid, folderid, localfolderid) VALUES (?, ?, ?)",
		params![syncid, folderid, id],
	)?;
	tx.commit()?;
	Ok(id)
}

pub fn local_folder_for_remote(
	conn: &Connection,
	syncid: SyncId,
	folderid: FolderId,
) -> Result<Option<LocalFolderId>, TaskError> {
	Ok(conn
		.query_one(
			"SELECT localfolderid FROM syncedfolder WHERE syncid = ? AND folderid = ?",
			params![syncid, folderid],
			|row| row.get(0),
		)
		.optional()?)
}

/// Resolves the absolute path of a local folder: the sync root prefix plus
/// the relative path assembled by a recursive CTE over `localfolder`.
pub fn local_path_for_folder(
	conn: &Connection,
	localfolderid: LocalFolderId,
	syncid: SyncId,
) -> Result<Option<PathBuf>, TaskError> {
	let relpath: Option<String> = conn
		.query_one(LOCAL_PATH_FOR_FOLDER, [localfolderid], |row| row.get(0))
		.optional()?;
	let relpath = match relpath {
		Some(relpath) => relpath,
		None => return Ok(None),
	};
	let root: Option<String> = conn
		.query_one(
			"SELECT localpath FROM syncfolder WHERE id = ?",
			[syncid],
			|row| row.get(0),
		)
		.optional()?;
	let root = match root {
		Some(root) => root,
		None => return Ok(None),
	};
	let mut path = PathBuf::from(root);
	for part in relpath.split('/').filter(|p| !p.is_empty()) {
		path.push(part);
	}
	Ok(Some(path))
}

pub fn local_path_for_file(
	conn: &Connection,
	localfileid: LocalFileId,
) -> Result<Option<PathBuf>, TaskError> {
	let row: Option<(LocalFolderId, SyncId, String)> = conn
		.query_one(
			"SELECT localparentfolderid, syncid, name FROM localfile WHERE id = ?",
			[localfileid],
			|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
		)
		.optional()?;
	let (parent, syncid, name) = match row {
		Some(row) => row,
		None => return Ok(None),
	};
	Ok(local_path_for_folder(conn, parent, syncid)?.map(|p| p.join(name)))
}

pub fn find_file_by_name(
	conn: &Connection,
	syncid: SyncId,
	parent: LocalFolderId,
	name: &str,
) -> Result<Option<LocalFileRow>, TaskError> {
	let mut stmt = conn.prepare(&format!(
		"SELECT {FILE_COLUMNS} FROM localfile WHERE syncid = ? AND localparentfolderid = ? AND name = ?"
	))?;
	Ok(stmt
		.query_one(params![syncid, parent, name], LocalFileRow::from_row)
		.optional()?)
}

pub fn find_files_by_fileid(
	conn: &Connection,
	fileid: FileId,
	syncid: Option<SyncId>,
) -> Result<Vec<LocalFileRow>, TaskError> {
	let mut rows = Vec::new();
	match syncid {
		Some(syncid) => {
			let mut stmt = conn.prepare(&format!(
				"SELECT {FILE_COLUMNS} FROM localfile WHERE fileid = ? AND syncid = ?"
			))?;
			let found = stmt.query_map(params![fileid, syncid], LocalFileRow::from_row)?;
			for row in found {
				rows.push(row?);
			}
		}
		None => {
			let mut stmt =
				conn.prepare(&format!("SELECT {FILE_COLUMNS} FROM localfile WHERE fileid = ?"))?;
			let found = stmt.query_map([fileid], LocalFileRow::from_row)?;
			for row in found {
				rows.push(row?);
			}
		}
	}
	Ok(rows)
}

/// The deduplication key lookup: every local file with the given
/// `(size, checksum)`, across all syncs.
pub fn find_files_by_content(
	conn: &Connection,
	size: u64,
	checksum: &ContentHash,
) -> Result<Vec<LocalFileId>, TaskError> {
	let mut stmt = conn.prepare("SELECT id FROM localfile WHERE size = ? AND checksum = ?")?;
	let found = stmt.query_map(params![size as i64, checksum], |row| row.get(0))?;
	let mut ids = Vec::new();
	for id in found {
		ids.push(id?);
	}
	Ok(ids)
}

pub fn update_file_identity(
	conn: &Connection,
	id: LocalFileId,
	fileid: FileId,
	revision: u64,
) -> Result<(), TaskError> {
	conn.execute(
		"UPDATE localfile SET fileid = ?, revision = ? WHERE id = ?",
		params![fileid, revision as i64, id],
	)?;
	Ok(())
}

/// Records a file that now exists on disk at `path` with the given server
/// metadata. Verifies the on-disk size first; a mismatch means someone raced
/// us and the attempt must be retried. Upserts by `(syncid, parent, name)`.
pub fn record_downloaded_file(
	conn: &mut Connection,
	syncid: SyncId,
	fileid: FileId,
	localfolderid: LocalFolderId,
	filename: &str,
	path: &Path,
	checksum: &ContentHash,
	serversize: u64,
	revision: u64,
) -> Result<bool, TaskError> {
	let meta = match std::fs::metadata(path) {
		Ok(meta) => meta,
		Err(e) => {
			debug!("stat of {} failed after download: {e}", path.display());
			return Ok(false);
		}
	};
	if meta.len() != serversize {
		debug!(
			"size of {} changed under us ({} != {serversize})",
			path.display(),
			meta.len()
		);
		return Ok(false);
	}
	let tx = conn.transaction()?;
	let existing: Option<LocalFileId> = tx
		.query_one(
			"SELECT id FROM localfile WHERE syncid = ? AND localparentfolderid = ? AND name = ?",
			params![syncid, localfolderid, filename],
			|row| row.get(0),
		)
		.optional()?;
	match existing {
		Some(id) => {
			tx.execute(
				"UPDATE localfile SET localparentfolderid = ?, fileid = ?, revision = ?, syncid = ?, \
				 size = ?, inode = ?, mtime = ?, mtimenative = ?, name = ?, checksum = ? WHERE id = ?",
				params![
					localfolderid,
					fileid,
					revision as i64,
					syncid,
					meta.len() as i64,
					fsutil::stat_inode(&meta) as i64,
					fsutil::stat_mtime(&meta),
					fsutil::stat_mtime_native(&meta),
					filename,
					checksum,
					id
				],
			)?;
		}
		None => {
			tx.execute(
				"INSERT INTO localfile (localparentfolderid, fileid, revision, syncid, size, inode, \
				 mtime, mtimenative, name, checksum) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
				params![
					localfolderid,
					fileid,
					revision as i64,
					syncid,
					meta.len() as i64,
					fsutil::stat_inode(&meta) as i64,
					fsutil::stat_mtime(&meta),
					fsutil::stat_mtime_native(&meta),
					filename,
					checksum
				],
			)?;
		}
	}
	tx.commit()?;
	Ok(true)
}

pub fn delete_file_row(conn: &Connection, id: LocalFileId) -> Result<(), TaskError> {
	conn.execute("DELETE FROM localfile WHERE id = ?", [id])?;
	Ok(())
}

/// Drops the row that described a file we just moved aside as conflicted.
pub fn delete_file_row_by_name(
	conn: &Connection,
	syncid: SyncId,
	parent: LocalFolderId,
	name: &str,
) -> Result<(), TaskError> {
	conn.execute(
		"DELETE FROM localfile WHERE syncid = ? AND localparentfolderid = ? AND name = ?",
		params![syncid, parent, name],
	)?;
	Ok(())
}

pub fn update_file_after_rename(
	conn: &Connection,
	id: LocalFileId,
	newparent: LocalFolderId,
	newsyncid: SyncId,
	newname: &str,
	meta: &Metadata,
) -> Result<(), TaskError> {
	conn.execute(
		"UPDATE localfile SET localparentfolderid = ?, syncid = ?, name = ?, inode = ?, mtime = ?, \
		 mtimenative = ? WHERE id = ?",
		params![
			newparent,
			newsyncid,
			newname,
			fsutil::stat_inode(meta) as i64,
			fsutil::stat_mtime(meta),
			fsutil::stat_mtime_native(meta),
			id
		],
	)?;
	Ok(())
}

pub fn folder_row(
	conn: &Connection,
	localfolderid: LocalFolderId,
) -> Result<Option<LocalFolderRow>, TaskError> {
	Ok(conn
		.query_one(
			"SELECT id, syncid, localparentfolderid, folderid, name FROM localfolder WHERE id = ?",
			[localfolderid],
			|row| {
				Ok(LocalFolderRow {
					id: row.get(0)?,
					syncid: row.get(1)?,
					localparentfolderid: row.get(2)?,
					folderid: row.get(3)?,
					name: row.get(4)?,
				})
			},
		)
		.optional()?)
}

/// Refreshes the stat-derived columns of a folder after a successful
/// filesystem operation on it.
pub fn update_folder_mtime(
	conn: &Connection,
	localfolderid: LocalFolderId,
	path: &Path,
) -> Result<(), TaskError> {
	let meta = match std::fs::metadata(path) {
		Ok(meta) => meta,
		Err(e) => {
			error!("stat failed for {}: {e}", path.display());
			return Ok(());
		}
	};
	conn.execute(
		"UPDATE localfolder SET inode = ?, deviceid = ?, mtime = ?, mtimenative = ? WHERE id = ?",
		params![
			fsutil::stat_inode(&meta) as i64,
			fsutil::stat_device(&meta) as i64,
			fsutil::stat_mtime(&meta),
			fsutil::stat_mtime_native(&meta),
			localfolderid
		],
	)?;
	Ok(())
}

pub fn inc_folder_taskcnt(conn: &Connection, localfolderid: LocalFolderId) -> Result<(), TaskError> {
	conn.execute(
		"UPDATE localfolder SET taskcnt = taskcnt + 1 WHERE id = ?",
		[localfolderid],
	)?;
	Ok(())
}

pub fn dec_folder_taskcnt(conn: &Connection, localfolderid: LocalFolderId) -> Result<(), TaskError> {
	conn.execute(
		"UPDATE localfolder SET taskcnt = taskcnt - 1 WHERE id = ? AND taskcnt > 0",
		[localfolderid],
	)?;
	Ok(())
}

pub fn update_folder_location(
	conn: &Connection,
	id: LocalFolderId,
	newsyncid: SyncId,
	newparent: LocalFolderId,
	newname: &str,
) -> Result<(), TaskError> {
	conn.execute(
		"UPDATE localfolder SET syncid = ?, localparentfolderid = ?, name = ? WHERE id = ?",
		params![newsyncid, newparent, newname, id],
	)?;
	Ok(())
}

/// Removes a folder subtree from the database only (the filesystem entries
/// are handled by the caller). Child files first so upload intents can be
/// withdrawn through the hook.
pub fn delete_folder_from_db(
	conn: &Connection,
	localfolderid: LocalFolderId,
	upload: &dyn UploadHook,
) -> Result<(), TaskError> {
	let child_folders: Vec<LocalFolderId> = {
		let mut stmt = conn.prepare("SELECT id FROM localfolder WHERE localparentfolderid = ?")?;
		let rows = stmt.query_map([localfolderid], |row| row.get(0))?;
		rows.collect::<rusqlite::Result<_>>()?
	};
	for child in child_folders {
		delete_folder_from_db(conn, child, upload)?;
	}
	let child_files: Vec<LocalFileId> = {
		let mut stmt = conn.prepare("SELECT id FROM localfile WHERE localparentfolderid = ?")?;
		let rows = stmt.query_map([localfolderid], |row| row.get(0))?;
		rows.collect::<rusqlite::Result<_>>()?
	};
	for file in child_files {
		upload.delete_upload_tasks_for_file(file);
	}
	conn.execute(
		"DELETE FROM localfile WHERE localparentfolderid = ?",
		[localfolderid],
	)?;
	conn.execute("DELETE FROM localfolder WHERE id = ?", [localfolderid])?;
	conn.execute(
		"DELETE FROM syncedfolder WHERE localfolderid = ?",
		[localfolderid],
	)?;
	Ok(())
}

/// Recursive delete of a synced subtree: removes the files from disk and all
/// rows from the database, depth first.
pub fn delete_folder_tree(
	conn: &Connection,
	localpath: &Path,
	localfolderid: LocalFolderId,
	syncid: SyncId,
	upload: &dyn UploadHook,
) -> Result<(), TaskError> {
	let files: Vec<(LocalFileId, String)> = {
		let mut stmt = conn
			.prepare("SELECT id, name FROM localfile WHERE localparentfolderid = ? AND syncid = ?")?;
		let rows = stmt.query_map(params![localfolderid, syncid], |row| {
			Ok((row.get(0)?, row.get(1)?))
		})?;
		rows.collect::<rusqlite::Result<_>>()?
	};
	for (id, name) in files {
		upload.delete_upload_tasks_for_file(id);
		let path = localpath.join(&name);
		debug!("deleting {}", path.display());
		let _ = std::fs::remove_file(&path);
	}
	conn.execute(
		"DELETE FROM localfile WHERE localparentfolderid = ? AND syncid = ?",
		params![localfolderid, syncid],
	)?;
	let folders: Vec<(LocalFolderId, String)> = {
		let mut stmt = conn
			.prepare("SELECT id, name FROM localfolder WHERE localparentfolderid = ? AND syncid = ?")?;
		let rows = stmt.query_map(params![localfolderid, syncid], |row| {
			Ok((row.get(0)?, row.get(1)?))
		})?;
		rows.collect::<rusqlite::Result<_>>()?
	};
	for (id, name) in folders {
		let path = localpath.join(&name);
		delete_folder_tree(conn, &path, id, syncid, upload)?;
		let _ = fsutil::rmdir_with_trashes(&path);
	}
	conn.execute(
		"DELETE FROM localfolder WHERE localparentfolderid = ? AND syncid = ?",
		params![localfolderid, syncid],
	)?;
	conn.execute(
		"DELETE FROM syncedfolder WHERE localfolderid = ? AND syncid = ?",
		params![localfolderid, syncid],
	)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{db::Database, hooks::NullUpload};

	#[test]
	fn path_resolution_walks_the_folder_chain() {
		let db = Database::open_in_memory().unwrap();
		let mut conn = db.conn();
		let root = add_sync(&mut conn, SyncId(1), FolderId(100), Path::new("/data/sync")).unwrap();
		let docs = add_local_folder(&mut conn, SyncId(1), root, FolderId(101), "docs").unwrap();
		let work = add_local_folder(&mut conn, SyncId(1), docs, FolderId(102), "work").unwrap();

		assert_eq!(
			local_path_for_folder(&conn, root, SyncId(1)).unwrap(),
			Some(PathBuf::from("/data/sync"))
		);
		assert_eq!(
			local_path_for_folder(&conn, work, SyncId(1)).unwrap(),
			Some(PathBuf::from("/data/sync/docs/work"))
		);
		assert_eq!(
			local_path_for_folder(&conn, LocalFolderId(999), SyncId(1)).unwrap(),
			None
		);
	}

	#[test]
	fn content_index_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let db = Database::open_in_memory().unwrap();
		let mut conn = db.conn();
		let root = add_sync(&mut conn, SyncId(1), FolderId(100), dir.path()).unwrap();

		let path = dir.path().join("a.bin");
		std::fs::write(&path, vec![1u8; 4096]).unwrap();
		let checksum: ContentHash = blake3::hash(&vec![1u8; 4096]).into();
		assert!(
			record_downloaded_file(&mut conn, SyncId(1), FileId(7), root, "a.bin", &path, &checksum, 4096, 3)
				.unwrap()
		);

		let row = find_file_by_name(&conn, SyncId(1), root, "a.bin").unwrap().unwrap();
		assert_eq!(row.fileid, FileId(7));
		assert_eq!(row.size, 4096);
		assert_eq!(row.revision, 3);
		assert_eq!(row.checksum, Some(checksum));

		let ids = find_files_by_content(&conn, 4096, &checksum).unwrap();
		assert_eq!(ids, vec![row.id]);
		assert_eq!(
			local_path_for_file(&conn, row.id).unwrap(),
			Some(path.clone())
		);

		// upsert keeps the row id
		assert!(
			record_downloaded_file(&mut conn, SyncId(1), FileId(8), root, "a.bin", &path, &checksum, 4096, 4)
				.unwrap()
		);
		let again = find_file_by_name(&conn, SyncId(1), root, "a.bin").unwrap().unwrap();
		assert_eq!(again.id, row.id);
		assert_eq!(again.fileid, FileId(8));
	}

	#[test]
	fn size_mismatch_is_reported_not_recorded() {
		let dir = tempfile::tempdir().unwrap();
		let db = Database::open_in_memory().unwrap();
		let mut conn = db.conn();
		let root = add_sync(&mut conn, SyncId(1), FolderId(100), dir.path()).unwrap();
		let path = dir.path().join("b.bin");
		std::fs::write(&path, b"short").unwrap();
		let checksum: ContentHash = blake3::hash(b"short").into();
		assert!(
			!record_downloaded_file(&mut conn, SyncId(1), FileId(7), root, "b.bin", &path, &checksum, 10_000, 0)
				.unwrap()
		);
		assert!(find_file_by_name(&conn, SyncId(1), root, "b.bin").unwrap().is_none());
	}

	#[test]
	fn folder_tree_delete_clears_rows_and_files() {
		let dir = tempfile::tempdir().unwrap();
		let db = Database::open_in_memory().unwrap();
		let mut conn = db.conn();
		let root = add_sync(&mut conn, SyncId(1), FolderId(100), dir.path()).unwrap();
		let sub = add_local_folder(&mut conn, SyncId(1), root, FolderId(101), "sub").unwrap();
		std::fs::create_dir(dir.path().join("sub")).unwrap();
		let path = dir.path().join("sub/file.txt");
		std::fs::write(&path, b"data").unwrap();
		let checksum: ContentHash = blake3::hash(b"data").into();
		record_downloaded_file(&mut conn, SyncId(1), FileId(5), sub, "file.txt", &path, &checksum, 4, 0)
			.unwrap();

		delete_folder_tree(&conn, dir.path(), root, SyncId(1), &NullUpload).unwrap();
		assert!(!path.exists());
		assert!(find_file_by_name(&conn, SyncId(1), sub, "file.txt").unwrap().is_none());
		assert!(folder_row(&conn, sub).unwrap().is_none());
	}
}
