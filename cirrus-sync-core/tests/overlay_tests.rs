use std::sync::Arc;

use cirrus_sync_core::{
	db::{Database, fstask},
	error::TaskError,
	fstasks::OverlayStore,
	hooks::NullUpload,
};
use cirrus_types::ids::{FolderId, FsItemId, FsTaskId};

fn store() -> (Arc<Database>, Arc<OverlayStore>) {
	let db = Database::open_in_memory().unwrap();
	let overlay = OverlayStore::new(db.clone(), Arc::new(NullUpload));
	(db, overlay)
}

fn add_server_folder(db: &Database, id: u64, parent: u64, name: &str) {
	db.conn()
		.execute(
			"INSERT INTO folder (id, parentfolderid, name) VALUES (?, ?, ?)",
			rusqlite::params![id as i64, parent as i64, name],
		)
		.unwrap();
}

fn add_server_file(db: &Database, id: u64, parent: u64, name: &str) {
	db.conn()
		.execute(
			"INSERT INTO file (id, parentfolderid, name) VALUES (?, ?, ?)",
			rusqlite::params![id as i64, parent as i64, name],
		)
		.unwrap();
}

fn fstask_count(db: &Database) -> u64 {
	let conn = db.conn();
	fstask::count(&conn).unwrap()
}

const ROOT: FsItemId = FsItemId::Server(0);

#[test]
fn mkdir_registers_placeholder() {
	let (db, overlay) = store();
	overlay.mkdir(ROOT, "projects").unwrap();

	let snap = overlay.snapshot(ROOT).unwrap();
	assert_eq!(snap.taskscnt, 1);
	assert_eq!(snap.mkdirs.len(), 1);
	let mk = &snap.mkdirs[0];
	assert_eq!(mk.name, "projects");
	assert_eq!(mk.folderid, FsItemId::Pending(mk.taskid));

	assert_eq!(fstask_count(&db), 1);
	let conn = db.conn();
	let ready = fstask::ready_tasks(&conn).unwrap();
	assert_eq!(ready.len(), 1);
	assert_eq!(ready[0].id, mk.taskid);
}

#[test]
fn mkdir_refuses_existing_names() {
	let (db, overlay) = store();
	add_server_folder(&db, 7, 0, "docs");

	assert!(matches!(overlay.mkdir(ROOT, "docs"), Err(TaskError::Exists)));

	overlay.mkdir(ROOT, "fresh").unwrap();
	assert!(matches!(overlay.mkdir(ROOT, "fresh"), Err(TaskError::Exists)));

	// a pending rmdir unshadows the server name
	overlay.rmdir(ROOT, "docs").unwrap();
	overlay.mkdir(ROOT, "docs").unwrap();
}

#[test]
fn mkdir_then_rmdir_annihilates() {
	let (db, overlay) = store();
	overlay.mkdir(ROOT, "a").unwrap();
	assert_eq!(fstask_count(&db), 1);

	overlay.rmdir(ROOT, "a").unwrap();

	// nothing pending in memory, nothing durable: the pair cancelled out
	assert!(overlay.snapshot(ROOT).is_none());
	assert_eq!(fstask_count(&db), 0);
}

#[test]
fn rmdir_of_server_folder_is_immediately_ready() {
	let (db, overlay) = store();
	add_server_folder(&db, 9, 0, "old");

	overlay.rmdir(ROOT, "old").unwrap();

	let snap = overlay.snapshot(ROOT).unwrap();
	assert_eq!(snap.rmdirs.len(), 1);
	assert_eq!(snap.rmdirs[0].folderid, FsItemId::Server(9));

	let conn = db.conn();
	let ready = fstask::ready_tasks(&conn).unwrap();
	assert_eq!(ready.len(), 1);
	assert_eq!(ready[0].id, snap.rmdirs[0].taskid);
}

#[test]
fn rmdir_unknown_or_shadowed_name_fails() {
	let (db, overlay) = store();
	assert!(matches!(overlay.rmdir(ROOT, "ghost"), Err(TaskError::NotFound)));

	add_server_folder(&db, 9, 0, "old");
	overlay.rmdir(ROOT, "old").unwrap();
	assert!(matches!(overlay.rmdir(ROOT, "old"), Err(TaskError::NotFound)));
}

#[test]
fn rmdir_with_pending_children_keeps_the_pair_and_orders_it() {
	let (db, overlay) = store();
	overlay.mkdir(ROOT, "a").unwrap();
	let t1 = overlay.snapshot(ROOT).unwrap().mkdirs[0].taskid;
	overlay.mkdir(FsItemId::Pending(t1), "b").unwrap();

	overlay.rmdir(ROOT, "a").unwrap();

	// mkdir of "a" must survive: its child still depends on it
	assert_eq!(fstask_count(&db), 3);
	let snap = overlay.snapshot(ROOT).unwrap();
	assert!(snap.mkdirs.is_empty());
	assert_eq!(snap.rmdirs.len(), 1);

	let conn = db.conn();
	let ready = fstask::ready_tasks(&conn).unwrap();
	// only the original mkdir is eligible; child and rmdir wait on it
	assert_eq!(ready.len(), 1);
	assert_eq!(ready[0].id, t1);
}

#[test]
fn creat_lifecycle_and_unlink_annihilation() {
	let (db, overlay) = store();
	let handle = overlay.get_or_create(ROOT);
	let creat = handle.add_creat("notes.txt").unwrap();
	assert_eq!(creat.fileid, FsItemId::Pending(creat.taskid));
	assert!(creat.newfile);

	// body still open: not eligible for upload
	{
		let conn = db.conn();
		assert!(fstask::ready_tasks(&conn).unwrap().is_empty());
	}
	overlay.creat_ready(creat.taskid).unwrap();
	{
		let conn = db.conn();
		assert_eq!(fstask::ready_tasks(&conn).unwrap().len(), 1);
	}

	// never uploaded: creat+unlink annihilate
	overlay.unlink(ROOT, "notes.txt").unwrap();
	assert_eq!(fstask_count(&db), 0);
	let snap = overlay.snapshot(ROOT).unwrap();
	assert_eq!(snap.taskscnt, 0);
	drop(handle);
	assert!(overlay.snapshot(ROOT).is_none());
}

#[test]
fn unlink_of_open_creat_waits_for_it() {
	let (db, overlay) = store();
	let handle = overlay.get_or_create(ROOT);
	let creat = handle.add_creat("open.bin").unwrap();

	// status is still "local open", so the pair must stay ordered
	overlay.unlink(ROOT, "open.bin").unwrap();
	assert_eq!(fstask_count(&db), 2);
	let snap = overlay.snapshot(ROOT).unwrap();
	assert!(snap.creats.is_empty());
	assert_eq!(snap.unlinks.len(), 1);
	assert_eq!(snap.unlinks[0].fileid, FsItemId::Pending(creat.taskid));

	let conn = db.conn();
	assert!(fstask::ready_tasks(&conn).unwrap().is_empty());
}

#[test]
fn unlink_of_server_file() {
	let (db, overlay) = store();
	add_server_file(&db, 42, 0, "report.pdf");

	overlay.unlink(ROOT, "report.pdf").unwrap();
	let snap = overlay.snapshot(ROOT).unwrap();
	assert_eq!(snap.unlinks[0].fileid, FsItemId::Server(42));

	assert!(matches!(
		overlay.unlink(ROOT, "report.pdf"),
		Err(TaskError::NotFound)
	));
}

#[test]
fn rename_file_creates_the_two_leg_exchange() {
	let (db, overlay) = store();
	add_server_file(&db, 99, 10, "old.txt");
	let src = FsItemId::Server(10);
	let dst = FsItemId::Server(11);

	overlay
		.rename_file(FsItemId::Server(99), src, "old.txt", dst, Some("new.txt"))
		.unwrap();

	let src_snap = overlay.snapshot(src).unwrap();
	assert_eq!(src_snap.unlinks.len(), 1);
	assert_eq!(src_snap.unlinks[0].name, "old.txt");
	let dst_snap = overlay.snapshot(dst).unwrap();
	assert_eq!(dst_snap.creats.len(), 1);
	assert_eq!(dst_snap.creats[0].name, "new.txt");
	assert!(!dst_snap.creats[0].newfile);

	assert_eq!(fstask_count(&db), 2);
	// the from leg is bound (status 10) and the to leg depends on it
	let conn = db.conn();
	assert!(fstask::ready_tasks(&conn).unwrap().is_empty());
}

#[test]
fn file_renamed_ack_removes_both_legs() {
	let (db, overlay) = store();
	add_server_file(&db, 99, 10, "old.txt");
	let src = FsItemId::Server(10);
	let dst = FsItemId::Server(11);
	overlay
		.rename_file(FsItemId::Server(99), src, "old.txt", dst, Some("new.txt"))
		.unwrap();

	let (from_taskid, to_taskid) = {
		let conn = db.conn();
		let rows = fstask::all_ordered(&conn).unwrap();
		(rows[0].id, rows[1].id)
	};

	overlay.file_renamed(dst, to_taskid, "new.txt", from_taskid);

	assert!(overlay.snapshot(src).is_none());
	assert!(overlay.snapshot(dst).is_none());
	assert_eq!(fstask_count(&db), 0);
}

#[test]
fn folder_created_ack_rekeys_the_placeholder() {
	let (db, overlay) = store();
	overlay.mkdir(ROOT, "a").unwrap();
	let t1 = overlay.snapshot(ROOT).unwrap().mkdirs[0].taskid;
	overlay.mkdir(FsItemId::Pending(t1), "b").unwrap();
	let t2 = overlay
		.snapshot(FsItemId::Pending(t1))
		.unwrap()
		.mkdirs[0]
		.taskid;

	overlay.folder_created(ROOT, t1, FolderId(77), "a");

	assert!(overlay.snapshot(ROOT).is_none());
	assert!(overlay.snapshot(FsItemId::Pending(t1)).is_none());
	// the child enqueued under the placeholder now lives under the real id
	let moved = overlay.snapshot(FsItemId::Server(77)).unwrap();
	assert_eq!(moved.mkdirs.len(), 1);
	assert_eq!(moved.mkdirs[0].name, "b");

	// the mkdir row is gone and the child no longer waits on anything
	assert_eq!(fstask_count(&db), 1);
	let conn = db.conn();
	let ready = fstask::ready_tasks(&conn).unwrap();
	assert_eq!(ready.len(), 1);
	assert_eq!(ready[0].id, t2);
}

#[test]
fn simple_acks_remove_entries_and_rows() {
	let (db, overlay) = store();
	add_server_folder(&db, 9, 0, "old");
	add_server_file(&db, 42, 0, "report.pdf");
	overlay.rmdir(ROOT, "old").unwrap();
	overlay.unlink(ROOT, "report.pdf").unwrap();
	let handle = overlay.get_or_create(ROOT);
	let creat = handle.add_creat("fresh.txt").unwrap();
	drop(handle);

	let (rmdir_id, unlink_id) = {
		let snap = overlay.snapshot(ROOT).unwrap();
		(snap.rmdirs[0].taskid, snap.unlinks[0].taskid)
	};

	overlay.folder_deleted(ROOT, rmdir_id, "old");
	overlay.file_deleted(ROOT, unlink_id, "report.pdf");
	overlay.file_created(ROOT, creat.taskid, "fresh.txt");

	assert!(overlay.snapshot(ROOT).is_none());
	assert_eq!(fstask_count(&db), 0);
}

#[test]
fn handle_keeps_folder_alive_until_dropped() {
	let (_db, overlay) = store();
	let handle = overlay.get_or_create(FsItemId::Server(5));
	assert!(overlay.snapshot(FsItemId::Server(5)).is_some());
	assert!(overlay.get(FsItemId::Server(5)).is_some());
	drop(handle);
	assert!(overlay.snapshot(FsItemId::Server(5)).is_none());
	assert!(overlay.get(FsItemId::Server(6)).is_none());
}

#[test]
fn lookups_by_name_and_taskid() {
	let (_db, overlay) = store();
	let handle = overlay.get_or_create(ROOT);
	let creat = handle.add_creat("a.txt").unwrap();

	assert_eq!(
		handle.find_creat("a.txt", None).unwrap().taskid,
		creat.taskid
	);
	assert!(handle.find_creat("a.txt", Some(FsTaskId(creat.taskid.0 + 1))).is_none());
	assert!(handle.find_creat("other.txt", None).is_none());
	assert!(handle.find_mkdir("a.txt", None).is_none());
}

#[test]
fn replay_reconstructs_the_trees() {
	let (db, overlay) = store();
	add_server_folder(&db, 9, 0, "doomed");
	add_server_file(&db, 42, 5, "victim.txt");
	add_server_file(&db, 99, 10, "old.txt");

	overlay.mkdir(ROOT, "a").unwrap();
	let t1 = overlay.snapshot(ROOT).unwrap().mkdirs[0].taskid;
	overlay.mkdir(FsItemId::Pending(t1), "b").unwrap();
	overlay.rmdir(ROOT, "doomed").unwrap();
	let handle = overlay.get_or_create(FsItemId::Server(5));
	handle.add_creat("writing.bin").unwrap();
	overlay.unlink(FsItemId::Server(5), "victim.txt").unwrap();
	drop(handle);
	overlay
		.rename_file(
			FsItemId::Server(99),
			FsItemId::Server(10),
			"old.txt",
			FsItemId::Server(11),
			Some("new.txt"),
		)
		.unwrap();

	// a fresh store over the same database must come back identical
	let rebuilt = OverlayStore::new(db.clone(), Arc::new(NullUpload));
	rebuilt.replay().unwrap();

	let mut folders = overlay.tracked_folders();
	folders.sort();
	let mut rebuilt_folders = rebuilt.tracked_folders();
	rebuilt_folders.sort();
	assert_eq!(folders, rebuilt_folders);
	assert!(!folders.is_empty());
	for folderid in folders {
		assert_eq!(
			overlay.snapshot(folderid),
			rebuilt.snapshot(folderid),
			"folder {folderid} diverged after replay"
		);
	}
}
