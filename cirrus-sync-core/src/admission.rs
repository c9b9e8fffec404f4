//! Admission control for parallel file bodies, plus the registry of
//! in-flight downloads that cancellation flags. One lock owns the counters
//! and the registry together; everything observable (progress numbers,
//! downloading hashes) is derived under it.

use std::{
	collections::HashMap,
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, Ordering},
	},
};

use cirrus_types::{
	crypto::ContentHash,
	ids::{FileId, SyncId},
};
use tokio::sync::{Notify, watch};

use crate::{settings::Settings, status::TransferProgress};

/// Cancellation handle of one in-flight (or about-to-start) download. The
/// worker checks [`DownloadMark::stopped`] at every suspension point; the
/// published hash lets other subsystems see what content is on its way.
pub struct DownloadMark {
	pub fileid: FileId,
	pub syncid: SyncId,
	stop: AtomicBool,
	hash: Mutex<Option<ContentHash>>,
}

impl DownloadMark {
	pub fn stopped(&self) -> bool {
		self.stop.load(Ordering::SeqCst)
	}

	pub fn request_stop(&self) {
		self.stop.store(true, Ordering::SeqCst);
	}

	pub fn set_hash(&self, hash: ContentHash) {
		*self.hash.lock().expect("mark hash poisoned") = Some(hash);
	}

	pub fn hash(&self) -> Option<ContentHash> {
		*self.hash.lock().expect("mark hash poisoned")
	}
}

#[derive(Default)]
struct State {
	starting: usize,
	started: usize,
	files_downloading: u32,
	bytes_total: u64,
	bytes_downloaded: u64,
	marks: HashMap<(FileId, SyncId), Vec<Arc<DownloadMark>>>,
}

impl State {
	fn backlog(&self) -> u64 {
		self.bytes_total.saturating_sub(self.bytes_downloaded)
	}

	fn progress(&self) -> TransferProgress {
		TransferProgress {
			files_downloading: self.files_downloading,
			bytes_total: self.bytes_total,
			bytes_downloaded: self.bytes_downloaded,
		}
	}
}

pub struct Admission {
	settings: Arc<Settings>,
	state: Mutex<State>,
	notify: Notify,
	progress: watch::Sender<TransferProgress>,
}

impl Admission {
	pub fn new(settings: Arc<Settings>) -> Arc<Self> {
		Arc::new(Self {
			settings,
			state: Mutex::new(State::default()),
			notify: Notify::new(),
			progress: watch::Sender::new(TransferProgress::default()),
		})
	}

	pub fn progress(&self) -> watch::Receiver<TransferProgress> {
		self.progress.subscribe()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, State> {
		self.state.lock().expect("admission state poisoned")
	}

	fn publish(&self, state: &State) {
		self.progress.send_replace(state.progress());
	}

	pub fn register(&self, fileid: FileId, syncid: SyncId) -> Arc<DownloadMark> {
		let mark = Arc::new(DownloadMark {
			fileid,
			syncid,
			stop: AtomicBool::new(false),
			hash: Mutex::new(None),
		});
		self.lock()
			.marks
			.entry((fileid, syncid))
			.or_default()
			.push(Arc::clone(&mark));
		mark
	}

	pub fn unregister(&self, mark: &Arc<DownloadMark>) {
		let mut state = self.lock();
		if let Some(list) = state.marks.get_mut(&(mark.fileid, mark.syncid)) {
			list.retain(|m| !Arc::ptr_eq(m, mark));
			if list.is_empty() {
				state.marks.remove(&(mark.fileid, mark.syncid));
			}
		}
	}

	fn can_start(&self, state: &State) -> bool {
		state.starting == 0
			&& state.started < self.settings.max_parallel_downloads
			&& state.backlog() <= self.settings.start_new_downloads_threshold
	}

	/// Waits until a new body could start, without claiming the slot. Used
	/// before spawning the per-file task. Returns false if the mark was
	/// stopped while waiting.
	pub async fn wait_clear(&self, mark: &DownloadMark) -> bool {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if mark.stopped() {
				return false;
			}
			if self.can_start(&self.lock()) {
				return true;
			}
			notified.await;
		}
	}

	/// Claims a start slot: increments `starting` and the downloading-files
	/// counter. Returns None if the mark was stopped while waiting.
	pub async fn admit(self: &Arc<Self>, mark: &DownloadMark) -> Option<AdmissionTicket> {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if mark.stopped() {
				return None;
			}
			{
				let mut state = self.lock();
				if self.can_start(&state) {
					state.starting += 1;
					state.files_downloading += 1;
					self.publish(&state);
					return Some(AdmissionTicket {
						admission: Arc::clone(self),
						phase: Phase::Starting,
						added: 0,
						downloaded: 0,
					});
				}
			}
			notified.await;
		}
	}

	/// Barrier used by folder/delete/rename tasks: no body may be starting
	/// or streaming while filesystem structure changes underneath it.
	pub async fn wait_idle(&self) {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let state = self.lock();
				if state.starting == 0 && state.started == 0 {
					return;
				}
			}
			notified.await;
		}
	}

	fn stop_matching(&self, mut predicate: impl FnMut(&DownloadMark) -> bool) {
		let state = self.lock();
		for mark in state.marks.values().flatten() {
			if predicate(mark) {
				mark.request_stop();
			}
		}
		drop(state);
		self.notify.notify_waiters();
	}

	pub fn stop_file(&self, fileid: FileId, syncid: SyncId) {
		self.stop_matching(|m| m.fileid == fileid && m.syncid == syncid);
	}

	pub fn stop_file_all_syncs(&self, fileid: FileId) {
		self.stop_matching(|m| m.fileid == fileid);
	}

	pub fn stop_sync(&self, syncid: SyncId) {
		self.stop_matching(|m| m.syncid == syncid);
	}

	pub fn stop_all(&self) {
		self.stop_matching(|_| true);
	}

	/// Server hashes of everything currently on its way down, for the upload
	/// side to cross-check against.
	pub fn downloading_hashes(&self) -> Vec<ContentHash> {
		let state = self.lock();
		state
			.marks
			.values()
			.flatten()
			.filter_map(|m| m.hash())
			.collect()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Starting,
	Started,
}

/// Claim on the admission counters held by one file body. Counter transitions
/// are `starting++` (admit) → `starting--; started++` (promote) →
/// `started--` (drop), with byte accounting rolled back on drop so a failed
/// body leaves no residue.
pub struct AdmissionTicket {
	admission: Arc<Admission>,
	phase: Phase,
	added: u64,
	downloaded: u64,
}

impl AdmissionTicket {
	/// The body is really going to stream `size` bytes: move from starting
	/// to started and extend the backlog.
	pub fn promote(&mut self, size: u64) {
		let mut state = self.admission.lock();
		state.starting -= 1;
		state.started += 1;
		state.bytes_total += size;
		self.phase = Phase::Started;
		self.added = size;
		self.admission.publish(&state);
		drop(state);
		self.admission.notify.notify_waiters();
	}

	pub fn add_downloaded(&mut self, n: u64) {
		self.downloaded += n;
		let mut state = self.admission.lock();
		state.bytes_downloaded += n;
		let below = state.backlog() <= self.admission.settings.start_new_downloads_threshold;
		self.admission.publish(&state);
		drop(state);
		if below {
			self.admission.notify.notify_waiters();
		}
	}
}

impl Drop for AdmissionTicket {
	fn drop(&mut self) {
		let mut state = self.admission.lock();
		match self.phase {
			Phase::Starting => state.starting -= 1,
			Phase::Started => state.started -= 1,
		}
		state.bytes_total = state.bytes_total.saturating_sub(self.added);
		state.bytes_downloaded = state.bytes_downloaded.saturating_sub(self.downloaded);
		state.files_downloading -= 1;
		if state.files_downloading == 0 {
			state.bytes_total = 0;
			state.bytes_downloaded = 0;
		}
		self.admission.publish(&state);
		drop(state);
		self.admission.notify.notify_waiters();
	}
}
