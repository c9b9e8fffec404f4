//! SQL of the persistent `task` FIFO. The producer API lives in
//! [`crate::queue`]; the download worker is the single consumer.

use cirrus_types::ids::{FileId, SyncId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::TaskError;

/// High bit selects the transfer direction; everything in this engine is
/// download-side (bit clear). The upload engine allocates its types with the
/// bit set in the same table.
pub const TASK_DIRECTION_MASK: u8 = 0x80;
pub const TASK_DOWNLOAD: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskType {
	CreateLocalFolder = 1,
	DeleteLocalFolder = 2,
	DelrecLocalFolder = 3,
	RenameLocalFolder = 4,
	DownloadFile = 5,
	DeleteLocalFile = 6,
	RenameLocalFile = 7,
}

impl TaskType {
	pub fn from_raw(raw: u8) -> Option<Self> {
		Some(match raw {
			1 => TaskType::CreateLocalFolder,
			2 => TaskType::DeleteLocalFolder,
			3 => TaskType::DelrecLocalFolder,
			4 => TaskType::RenameLocalFolder,
			5 => TaskType::DownloadFile,
			6 => TaskType::DeleteLocalFile,
			7 => TaskType::RenameLocalFile,
			_ => return None,
		})
	}
}

/// One row of the queue, with `type` kept raw so unknown values can be
/// logged and skipped instead of failing decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRow {
	pub id: u64,
	pub raw_type: u8,
	pub syncid: SyncId,
	pub itemid: u64,
	pub localitemid: u64,
	pub newitemid: u64,
	pub newsyncid: SyncId,
	pub name: Option<String>,
}

impl TaskRow {
	pub fn task_type(&self) -> Option<TaskType> {
		TaskType::from_raw(self.raw_type)
	}
}

pub fn insert(
	conn: &Connection,
	typ: TaskType,
	syncid: SyncId,
	itemid: u64,
	localitemid: u64,
	newitemid: u64,
	newsyncid: SyncId,
	name: Option<&str>,
) -> Result<u64, TaskError> {
	conn.execute(
		"INSERT INTO task (type, syncid, itemid, localitemid, newitemid, newsyncid, name) \
		 VALUES (?, ?, ?, ?, ?, ?, ?)",
		params![
			typ as u8,
			syncid,
			itemid as i64,
			localitemid as i64,
			newitemid as i64,
			newsyncid,
			name
		],
	)?;
	Ok(conn.last_insert_rowid() as u64)
}

/// Lowest-id pending download-direction row, if any.
pub fn next_ready(conn: &Connection) -> Result<Option<TaskRow>, TaskError> {
	let mut stmt = conn.prepare(
		"SELECT id, type, syncid, itemid, localitemid, newitemid, newsyncid, name FROM task \
		 WHERE inprogress = 0 AND (type & ?) = ? ORDER BY id LIMIT 1",
	)?;
	Ok(stmt
		.query_one(params![TASK_DIRECTION_MASK, TASK_DOWNLOAD], |row| {
			Ok(TaskRow {
				id: row.get::<_, i64>(0)? as u64,
				raw_type: row.get::<_, i64>(1)? as u8,
				syncid: row.get(2)?,
				itemid: row.get::<_, i64>(3)? as u64,
				localitemid: row.get::<_, i64>(4)? as u64,
				newitemid: row.get::<_, i64>(5)? as u64,
				newsyncid: row.get(6)?,
				name: row.get(7)?,
			})
		})
		.optional()?)
}

pub fn mark_in_progress(conn: &Connection, id: u64) -> Result<(), TaskError> {
	conn.execute("UPDATE task SET inprogress = 1 WHERE id = ?", [id as i64])?;
	Ok(())
}

pub fn reset_in_progress(conn: &Connection, id: u64) -> Result<(), TaskError> {
	conn.execute("UPDATE task SET inprogress = 0 WHERE id = ?", [id as i64])?;
	Ok(())
}

pub fn complete(conn: &Connection, id: u64) -> Result<(), TaskError> {
	conn.execute("DELETE FROM task WHERE id = ?", [id as i64])?;
	Ok(())
}

/// Bulk delete of the queued downloads of one file. Returns affected rows.
pub fn purge_downloads_for_file(conn: &Connection, fileid: FileId) -> Result<usize, TaskError> {
	Ok(conn.execute(
		"DELETE FROM task WHERE type = ? AND itemid = ?",
		params![TaskType::DownloadFile as u8, fileid],
	)?)
}

/// Bulk delete of all download-direction rows of one sync.
pub fn purge_sync(conn: &Connection, syncid: SyncId) -> Result<usize, TaskError> {
	Ok(conn.execute(
		"DELETE FROM task WHERE syncid = ? AND (type & ?) = ?",
		params![syncid, TASK_DIRECTION_MASK, TASK_DOWNLOAD],
	)?)
}

pub fn pending_count(conn: &Connection) -> Result<u64, TaskError> {
	Ok(conn.query_one("SELECT COUNT(*) FROM task", [], |row| row.get::<_, i64>(0))? as u64)
}
