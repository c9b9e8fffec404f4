//! SQL of the `fstask` overlay-intent table and its dependency graph. Used
//! only through [`crate::fstasks`], which holds the folder lock while these
//! run.

use cirrus_types::ids::{FsItemId, FsTaskId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FsTaskType {
	Mkdir = 1,
	Rmdir = 2,
	Creat = 3,
	Unlink = 4,
	RenFileFrom = 5,
	RenFileTo = 6,
}

impl FsTaskType {
	pub fn from_raw(raw: u8) -> Option<Self> {
		Some(match raw {
			1 => FsTaskType::Mkdir,
			2 => FsTaskType::Rmdir,
			3 => FsTaskType::Creat,
			4 => FsTaskType::Unlink,
			5 => FsTaskType::RenFileFrom,
			6 => FsTaskType::RenFileTo,
			_ => return None,
		})
	}
}

/// Lifecycle markers of `fstask.status`.
pub const STATUS_READY: i64 = 0;
/// Local handle still open, body being written; not eligible for upload.
pub const STATUS_LOCAL_OPEN: i64 = 1;
/// The bound "from" leg of a rename; only the paired "to" row is eligible.
pub const STATUS_RENAME_BOUND: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsTaskRow {
	pub id: FsTaskId,
	pub raw_type: u8,
	pub status: i64,
	pub folderid: FsItemId,
	pub fileid: FsItemId,
	pub text1: Option<String>,
	pub int1: i64,
}

impl FsTaskRow {
	fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
		Ok(FsTaskRow {
			id: row.get(0)?,
			raw_type: row.get::<_, i64>(1)? as u8,
			status: row.get(2)?,
			folderid: row.get(3)?,
			fileid: row.get(4)?,
			text1: row.get(5)?,
			int1: row.get(6)?,
		})
	}
}

const FSTASK_COLUMNS: &str = "id, type, status, folderid, fileid, text1, int1";

pub fn insert(
	conn: &Connection,
	typ: FsTaskType,
	status: i64,
	folderid: FsItemId,
	fileid: FsItemId,
	text1: &str,
	int1: i64,
) -> Result<FsTaskId, TaskError> {
	conn.execute(
		"INSERT INTO fstask (type, status, folderid, fileid, text1, int1) VALUES (?, ?, ?, ?, ?, ?)",
		params![typ as u8, status, folderid, fileid, text1, int1],
	)?;
	Ok(FsTaskId(conn.last_insert_rowid() as u64))
}

pub fn depend(conn: &Connection, taskid: FsTaskId, on: FsTaskId) -> Result<(), TaskError> {
	conn.execute(
		"INSERT OR IGNORE INTO fstaskdepend (fstaskid, dependfstaskid) VALUES (?, ?)",
		params![taskid, on],
	)?;
	Ok(())
}

pub fn get(conn: &Connection, id: FsTaskId) -> Result<Option<FsTaskRow>, TaskError> {
	let mut stmt = conn.prepare(&format!("SELECT {FSTASK_COLUMNS} FROM fstask WHERE id = ?"))?;
	Ok(stmt.query_one([id], FsTaskRow::from_row).optional()?)
}

pub fn all_ordered(conn: &Connection) -> Result<Vec<FsTaskRow>, TaskError> {
	let mut stmt =
		conn.prepare(&format!("SELECT {FSTASK_COLUMNS} FROM fstask ORDER BY id"))?;
	let rows = stmt.query_map([], FsTaskRow::from_row)?;
	Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Ids of the tasks whose target item is `itemid` (children of a pending
/// folder, claims on a name).
pub fn tasks_targeting_item(
	conn: &Connection,
	itemid: FsItemId,
) -> Result<Vec<FsTaskId>, TaskError> {
	let mut stmt = conn.prepare("SELECT id FROM fstask WHERE folderid = ?")?;
	let rows = stmt.query_map([itemid], |row| row.get(0))?;
	Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Ids of the tasks whose `fileid` column references `itemid` (rename legs
/// of a pending file, unlinks of it).
pub fn tasks_referencing_file(
	conn: &Connection,
	itemid: FsItemId,
) -> Result<Vec<FsTaskId>, TaskError> {
	let mut stmt = conn.prepare("SELECT id FROM fstask WHERE fileid = ?")?;
	let rows = stmt.query_map([itemid], |row| row.get(0))?;
	Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn tasks_claiming_name(
	conn: &Connection,
	folderid: FsItemId,
	name: &str,
) -> Result<Vec<FsTaskId>, TaskError> {
	let mut stmt = conn.prepare("SELECT id FROM fstask WHERE folderid = ? AND text1 = ?")?;
	let rows = stmt.query_map(params![folderid, name], |row| row.get(0))?;
	Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn has_dependents(conn: &Connection, id: FsTaskId) -> Result<bool, TaskError> {
	Ok(conn
		.query_one(
			"SELECT 1 FROM fstaskdepend WHERE dependfstaskid = ? LIMIT 1",
			[id],
			|_| Ok(()),
		)
		.optional()?
		.is_some())
}

/// Deletes a task row together with every edge touching it. Returns whether
/// a row was actually removed.
pub fn delete(conn: &Connection, id: FsTaskId) -> Result<bool, TaskError> {
	conn.execute(
		"DELETE FROM fstaskdepend WHERE fstaskid = ? OR dependfstaskid = ?",
		params![id, id],
	)?;
	Ok(conn.execute("DELETE FROM fstask WHERE id = ?", [id])? > 0)
}

/// Conditional delete used by the pair-annihilation paths: only removes the
/// row if it is still an untouched `typ` row with `status = 0` and nothing
/// depends on it.
pub fn delete_if_unstarted(
	conn: &Connection,
	id: FsTaskId,
	typ: FsTaskType,
) -> Result<bool, TaskError> {
	if has_dependents(conn, id)? {
		return Ok(false);
	}
	let removed = conn.execute(
		"DELETE FROM fstask WHERE id = ? AND type = ? AND status = 0",
		params![id, typ as u8],
	)? > 0;
	if removed {
		conn.execute("DELETE FROM fstaskdepend WHERE fstaskid = ?", [id])?;
	}
	Ok(removed)
}

pub fn set_status(conn: &Connection, id: FsTaskId, status: i64) -> Result<(), TaskError> {
	conn.execute("UPDATE fstask SET status = ? WHERE id = ?", params![status, id])?;
	Ok(())
}

/// What the upload worker would pick: `status = 0` rows with an empty
/// dependency set, in insertion order. Exposed for the upload engine and for
/// tests of the dependency gate.
pub fn ready_tasks(conn: &Connection) -> Result<Vec<FsTaskRow>, TaskError> {
	let mut stmt = conn.prepare(&format!(
		"SELECT {FSTASK_COLUMNS} FROM fstask WHERE status = 0 AND NOT EXISTS \
		 (SELECT 1 FROM fstaskdepend WHERE fstaskid = fstask.id) ORDER BY id"
	))?;
	let rows = stmt.query_map([], FsTaskRow::from_row)?;
	Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn count(conn: &Connection) -> Result<u64, TaskError> {
	Ok(conn.query_one("SELECT COUNT(*) FROM fstask", [], |row| row.get::<_, i64>(0))? as u64)
}
