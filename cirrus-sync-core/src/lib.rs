//! Local-synchronization core of the cirrus client: executes a persistent
//! queue of download-side filesystem tasks against one or more synced
//! directories, and maintains the in-memory overlay of pending, not yet
//! acknowledged mutations on top of the server view.

pub mod admission;
pub mod consts;
pub mod db;
mod download;
pub mod error;
pub mod events;
pub mod fstasks;
pub mod fsutil;
pub mod hooks;
pub mod names;
pub mod queue;
pub mod ranges;
pub mod remote;
pub mod settings;
pub mod status;

use std::sync::{Arc, Mutex};

use cirrus_types::{
	crypto::ContentHash,
	ids::{FileId, SyncId},
};
use log::error;
use tokio::sync::watch;

use crate::{
	admission::Admission,
	db::{Database, task},
	download::{DownloadWorker, WorkerCtx},
	error::{NetError, TaskError},
	events::{EventBus, SyncEvent},
	fstasks::OverlayStore,
	fsutil::FileLockSet,
	hooks::{LocalScanHook, NoPeers, NullLocalScan, NullUpload, PeerAccelerator, UploadHook},
	queue::{TaskQueue, WorkerWaker},
	remote::RemoteClient,
	settings::Settings,
	status::{StatusGate, TransferProgress},
};

pub struct SyncEngineBuilder {
	db: Option<Arc<Database>>,
	remote: Option<Arc<dyn RemoteClient>>,
	settings: Settings,
	scan: Arc<dyn LocalScanHook>,
	upload: Arc<dyn UploadHook>,
	p2p: Arc<dyn PeerAccelerator>,
}

impl SyncEngineBuilder {
	pub fn db(mut self, db: Arc<Database>) -> Self {
		self.db = Some(db);
		self
	}

	pub fn remote(mut self, remote: Arc<dyn RemoteClient>) -> Self {
		self.remote = Some(remote);
		self
	}

	pub fn settings(mut self, settings: Settings) -> Self {
		self.settings = settings;
		self
	}

	pub fn local_scan(mut self, scan: Arc<dyn LocalScanHook>) -> Self {
		self.scan = scan;
		self
	}

	pub fn upload(mut self, upload: Arc<dyn UploadHook>) -> Self {
		self.upload = upload;
		self
	}

	pub fn peer_accelerator(mut self, p2p: Arc<dyn PeerAccelerator>) -> Self {
		self.p2p = p2p;
		self
	}

	pub fn build(self) -> Result<SyncEngine, TaskError> {
		let remote = self.remote.ok_or(TaskError::Net(NetError::Perm))?;
		let db = match self.db {
			Some(db) => db,
			None => Database::open_in_memory()?,
		};
		let settings = Arc::new(self.settings);
		let gate = Arc::new(StatusGate::new());
		let events = EventBus::default();
		let admission = Admission::new(Arc::clone(&settings));
		let waker = WorkerWaker::new();
		let overlay = OverlayStore::new(Arc::clone(&db), Arc::clone(&self.upload));
		overlay.replay()?;
		let http = reqwest::Client::builder()
			.build()
			.map_err(|e| TaskError::Net(NetError::from(e)))?;
		let ctx = Arc::new(WorkerCtx {
			db: Arc::clone(&db),
			settings: Arc::clone(&settings),
			gate: Arc::clone(&gate),
			events: events.clone(),
			admission: Arc::clone(&admission),
			remote,
			p2p: self.p2p,
			scan: self.scan,
			upload: self.upload,
			locks: FileLockSet::new(),
			waker: Arc::clone(&waker),
			http,
			shutdown: watch::Sender::new(false),
		});
		Ok(SyncEngine {
			queue: TaskQueue::new(Arc::clone(&db), Arc::clone(&waker)),
			db,
			gate,
			events,
			admission,
			overlay,
			waker,
			ctx,
			worker: Mutex::new(None),
		})
	}
}

pub struct SyncEngine {
	db: Arc<Database>,
	gate: Arc<StatusGate>,
	events: EventBus,
	admission: Arc<Admission>,
	overlay: Arc<OverlayStore>,
	queue: TaskQueue,
	waker: Arc<WorkerWaker>,
	ctx: Arc<WorkerCtx>,
	worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
	pub fn builder() -> SyncEngineBuilder {
		SyncEngineBuilder {
			db: None,
			remote: None,
			settings: Settings::default(),
			scan: Arc::new(NullLocalScan),
			upload: Arc::new(NullUpload),
			p2p: Arc::new(NoPeers),
		}
	}

	/// Spawns the download main loop. Must run inside a tokio runtime;
	/// calling it twice is a no-op.
	pub fn start(&self) {
		let mut worker = self.worker.lock().expect("worker handle poisoned");
		if worker.is_some() {
			return;
		}
		let task = DownloadWorker::new(Arc::clone(&self.ctx));
		*worker = Some(tokio::spawn(task.run()));
	}

	/// Asks the worker to stop after the current task and flags every
	/// in-flight body.
	pub fn shutdown(&self) {
		let _ = self.ctx.shutdown.send(true);
		self.admission.stop_all();
		self.waker.wake();
	}

	pub async fn wait_stopped(&self) {
		let handle = self.worker.lock().expect("worker handle poisoned").take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}

	pub fn db(&self) -> &Arc<Database> {
		&self.db
	}

	pub fn queue(&self) -> &TaskQueue {
		&self.queue
	}

	pub fn overlay(&self) -> &Arc<OverlayStore> {
		&self.overlay
	}

	pub fn gate(&self) -> &Arc<StatusGate> {
		&self.gate
	}

	pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
		self.events.subscribe()
	}

	pub fn progress(&self) -> watch::Receiver<TransferProgress> {
		self.admission.progress()
	}

	/// Cooperatively stops the in-flight download of one file in one sync.
	/// Its queue row stays and will be retried.
	pub fn stop_file_download(&self, fileid: FileId, syncid: SyncId) {
		self.admission.stop_file(fileid, syncid);
	}

	pub fn stop_all_downloads(&self) {
		self.admission.stop_all();
	}

	/// Drops the queued downloads of one sync and stops its in-flight
	/// bodies.
	pub fn stop_sync_download(&self, syncid: SyncId) {
		{
			let conn = self.db.conn();
			if let Err(e) = task::purge_sync(&conn, syncid) {
				error!("cannot purge download tasks of sync {syncid}: {e}");
			}
		}
		self.admission.stop_sync(syncid);
	}

	/// Removes every queued download of the file (all syncs) and stops the
	/// in-flight ones.
	pub fn delete_download_tasks_for_file(&self, fileid: FileId) {
		{
			let conn = self.db.conn();
			if let Err(e) = task::purge_downloads_for_file(&conn, fileid) {
				error!("cannot purge download tasks of file {fileid}: {e}");
			}
		}
		self.admission.stop_file_all_syncs(fileid);
	}

	/// Blocks until no body is starting or streaming.
	pub async fn wait_no_downloads(&self) {
		self.admission.wait_idle().await;
	}

	/// Server hashes of the currently downloading files.
	pub fn downloading_hashes(&self) -> Vec<ContentHash> {
		self.admission.downloading_hashes()
	}
}
