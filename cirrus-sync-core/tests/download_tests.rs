//! End-to-end download tests: a real engine against an in-process content
//! server speaking ranged HTTP, with the gateway mocked out.

use std::{
	collections::{HashMap, VecDeque},
	net::SocketAddr,
	sync::{
		Arc, Mutex,
		atomic::{AtomicU64, AtomicUsize, Ordering},
	},
	time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
	Router,
	body::Body,
	extract::{Path, State},
	http::{HeaderMap, StatusCode, header},
	response::{IntoResponse, Response},
	routing::get,
};
use bytes::Bytes;
use cirrus_sync_core::{
	SyncEngine,
	db::{Database, local, task},
	error::NetError,
	events::SyncEvent,
	fsutil,
	ranges::compute_block_checksums,
	remote::{BlockMap, FileLink, FileMeta, RemoteClient},
	settings::Settings,
};
use cirrus_types::{
	crypto::ContentHash,
	ids::{FileId, FolderId, LocalFolderId, SyncId},
};
const SYNC: SyncId = SyncId(1);
const MOCK_BLOCK_SIZE: u64 = 1024;

fn init_logs() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn content(len: usize, seed: u8) -> Vec<u8> {
	(0..len)
		.map(|i| ((i as u64 * 131 + seed as u64 * 7) % 251) as u8)
		.collect()
}

fn hash_of(data: &[u8]) -> ContentHash {
	blake3::hash(data).into()
}

// ---- content server ----------------------------------------------------

struct ServerInner {
	files: Mutex<HashMap<u64, Vec<u8>>>,
	hits: AtomicUsize,
	bytes_served: AtomicU64,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
	throttle: Option<Duration>,
}

#[derive(Clone)]
struct ServerState(Arc<ServerInner>);

struct InFlightGuard(Arc<ServerInner>);

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
	}
}

fn parse_range(spec: &str, len: u64) -> Option<(u64, u64)> {
	let spec = spec.strip_prefix("bytes=")?;
	let (start, end) = spec.split_once('-')?;
	let start: u64 = start.parse().ok()?;
	let end: u64 = if end.is_empty() {
		len.checked_sub(1)?
	} else {
		end.parse().ok()?
	};
	if start > end || end >= len {
		return None;
	}
	Some((start, end))
}

async fn serve_content(
	State(state): State<ServerState>,
	Path(fileid): Path<u64>,
	headers: HeaderMap,
) -> Response {
	let inner = &state.0;
	inner.hits.fetch_add(1, Ordering::SeqCst);
	let data = match inner.files.lock().unwrap().get(&fileid) {
		Some(data) => data.clone(),
		None => return StatusCode::NOT_FOUND.into_response(),
	};
	if data.is_empty() {
		return StatusCode::OK.into_response();
	}
	let (status, start, end) = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
		Some(spec) => match parse_range(spec, data.len() as u64) {
			Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end),
			None => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
		},
		None => (StatusCode::OK, 0, data.len() as u64 - 1),
	};
	let slice = &data[start as usize..=end as usize];
	inner.bytes_served.fetch_add(slice.len() as u64, Ordering::SeqCst);

	let current = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
	inner.max_in_flight.fetch_max(current, Ordering::SeqCst);

	let chunks: VecDeque<Bytes> = slice.chunks(64 * 1024).map(Bytes::copy_from_slice).collect();
	struct StreamCtx {
		chunks: VecDeque<Bytes>,
		throttle: Option<Duration>,
		_guard: InFlightGuard,
	}
	let ctx = StreamCtx {
		chunks,
		throttle: inner.throttle,
		_guard: InFlightGuard(Arc::clone(inner)),
	};
	let stream = futures::stream::unfold(ctx, |mut ctx| async move {
		let chunk = ctx.chunks.pop_front()?;
		if let Some(delay) = ctx.throttle {
			tokio::time::sleep(delay).await;
		}
		Some((Ok::<_, std::convert::Infallible>(chunk), ctx))
	});
	Response::builder()
		.status(status)
		.body(Body::from_stream(stream))
		.unwrap()
}

async fn spawn_server(
	files: HashMap<u64, Vec<u8>>,
	throttle: Option<Duration>,
) -> (SocketAddr, ServerState) {
	let state = ServerState(Arc::new(ServerInner {
		files: Mutex::new(files),
		hits: AtomicUsize::new(0),
		bytes_served: AtomicU64::new(0),
		in_flight: AtomicUsize::new(0),
		max_in_flight: AtomicUsize::new(0),
		throttle,
	}));
	let app = Router::new()
		.route("/content/{fileid}", get(serve_content))
		.with_state(state.clone());
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});
	(addr, state)
}

// ---- mocked gateway ----------------------------------------------------

struct MockRemote {
	files: HashMap<u64, Vec<u8>>,
	host: String,
	is_revision: bool,
}

#[async_trait]
impl RemoteClient for MockRemote {
	async fn file_meta(&self, fileid: FileId) -> Result<FileMeta, NetError> {
		let data = self.files.get(&fileid.0).ok_or(NetError::Perm)?;
		Ok(FileMeta {
			size: data.len() as u64,
			checksum: hash_of(data),
			revision: fileid.0 * 10,
		})
	}

	async fn file_link(&self, fileid: FileId) -> Result<FileLink, NetError> {
		Ok(FileLink {
			hosts: vec![self.host.clone()],
			path: format!("/content/{}", fileid.0),
		})
	}

	async fn block_checksums(&self, fileid: FileId, _revision: u64) -> Result<BlockMap, NetError> {
		let data = self.files.get(&fileid.0).ok_or(NetError::Perm)?;
		Ok(BlockMap {
			block_size: MOCK_BLOCK_SIZE,
			blocks: compute_block_checksums(data, MOCK_BLOCK_SIZE),
		})
	}

	async fn is_revision_of_file(
		&self,
		_checksum: &ContentHash,
		_size: u64,
		_fileid: FileId,
	) -> Result<bool, NetError> {
		Ok(self.is_revision)
	}
}

// ---- harness -----------------------------------------------------------

struct Harness {
	engine: SyncEngine,
	db: Arc<Database>,
	dir: tempfile::TempDir,
	root: LocalFolderId,
	state: ServerState,
}

fn test_settings() -> Settings {
	Settings {
		sleep_on_failed_download: Duration::from_millis(50),
		sleep_on_locked_file: Duration::from_millis(100),
		sock_timeout_on_exception: Duration::from_millis(100),
		..Settings::default()
	}
}

async fn harness(
	files: &[(u64, Vec<u8>)],
	throttle: Option<Duration>,
	settings: Settings,
	is_revision: bool,
) -> Harness {
	init_logs();
	let dir = tempfile::tempdir().unwrap();
	let db = Database::open_in_memory().unwrap();
	let root = {
		let mut conn = db.conn();
		local::add_sync(&mut conn, SYNC, FolderId(1000), dir.path()).unwrap()
	};
	let map: HashMap<u64, Vec<u8>> = files.iter().cloned().collect();
	let (addr, state) = spawn_server(map.clone(), throttle).await;
	let remote = Arc::new(MockRemote {
		files: map,
		host: addr.to_string(),
		is_revision,
	});
	let engine = SyncEngine::builder()
		.db(db.clone())
		.remote(remote)
		.settings(settings)
		.build()
		.unwrap();
	engine.start();
	Harness {
		engine,
		db,
		dir,
		root,
		state,
	}
}

impl Harness {
	fn enqueue(&self, fileid: u64, name: &str) {
		self.engine
			.queue()
			.download_file(SYNC, FileId(fileid), self.root, name)
			.unwrap();
	}

	fn pending_tasks(&self) -> u64 {
		let conn = self.db.conn();
		task::pending_count(&conn).unwrap()
	}

	async fn wait_tasks_done(&self) {
		wait_for(|| self.pending_tasks() == 0, "task queue to drain").await;
		self.engine.wait_no_downloads().await;
	}

	fn row(&self, name: &str) -> Option<local::LocalFileRow> {
		let conn = self.db.conn();
		local::find_file_by_name(&conn, SYNC, self.root, name).unwrap()
	}

	fn hits(&self) -> usize {
		self.state.0.hits.load(Ordering::SeqCst)
	}
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
	let deadline = Instant::now() + Duration::from_secs(15);
	while !cond() {
		if Instant::now() > deadline {
			panic!("timed out waiting for {what}");
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
	let mut events = Vec::new();
	while let Ok(event) = rx.try_recv() {
		events.push(event);
	}
	events
}

// ---- tests -------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downloads_verify_and_record() {
	let files = vec![
		(1u64, content(3000, 1)),
		(2u64, content(70 * 1024, 2)),
		(3u64, content(1024, 3)),
	];
	let h = harness(&files, None, test_settings(), true).await;
	let mut rx = h.engine.subscribe_events();

	h.enqueue(1, "a.bin");
	h.enqueue(2, "b.bin");
	h.enqueue(3, "c.bin");
	h.wait_tasks_done().await;

	for (fileid, data) in &files {
		let name = match fileid {
			1 => "a.bin",
			2 => "b.bin",
			_ => "c.bin",
		};
		let path = h.dir.path().join(name);
		assert_eq!(&std::fs::read(&path).unwrap(), data, "{name} content");
		let row = h.row(name).unwrap();
		assert_eq!(row.fileid, FileId(*fileid));
		assert_eq!(row.size, data.len() as u64);
		assert_eq!(row.checksum, Some(hash_of(data)));
		assert_eq!(row.revision, fileid * 10);
		// the verified on-disk digest matches what the row says
		let (disk_hash, disk_size) = fsutil::local_file_checksum(&path).unwrap();
		assert_eq!(disk_hash, hash_of(data));
		assert_eq!(disk_size, data.len() as u64);
	}

	let events = drain(&mut rx);
	for fileid in [1u64, 2, 3] {
		assert!(
			events.iter().any(|e| matches!(e,
				SyncEvent::FileDownloadFinished { fileid: f, .. } if *f == FileId(fileid))),
			"missing finished event for {fileid}"
		);
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_content_is_copied_not_transferred() {
	let body = content(4096, 9);
	let files = vec![(1u64, body.clone()), (2u64, body.clone())];
	let h = harness(&files, None, test_settings(), true).await;

	h.enqueue(1, "first.bin");
	h.wait_tasks_done().await;
	assert_eq!(h.hits(), 1);

	h.enqueue(2, "second.bin");
	h.wait_tasks_done().await;

	// no additional wire transfer: the second body came from the first file
	assert_eq!(h.hits(), 1);
	assert_eq!(std::fs::read(h.dir.path().join("second.bin")).unwrap(), body);
	let first = h.row("first.bin").unwrap();
	let second = h.row("second.bin").unwrap();
	assert_eq!(first.checksum, second.checksum);
	assert_eq!(second.fileid, FileId(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_content_already_on_disk_is_adopted() {
	let body = content(8192, 4);
	let files = vec![(1u64, body.clone())];
	let h = harness(&files, None, test_settings(), true).await;

	std::fs::write(h.dir.path().join("present.bin"), &body).unwrap();
	h.enqueue(1, "present.bin");
	h.wait_tasks_done().await;

	assert_eq!(h.hits(), 0);
	let row = h.row("present.bin").unwrap();
	assert_eq!(row.checksum, Some(hash_of(&body)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recorded_file_with_drifted_identity_is_fixed_in_place() {
	let body = content(2048, 5);
	let files = vec![(1u64, body.clone())];
	let h = harness(&files, None, test_settings(), true).await;

	let path = h.dir.path().join("stable.bin");
	std::fs::write(&path, &body).unwrap();
	{
		let mut conn = h.db.conn();
		assert!(
			local::record_downloaded_file(
				&mut conn,
				SYNC,
				FileId(9),
				h.root,
				"stable.bin",
				&path,
				&hash_of(&body),
				body.len() as u64,
				0,
			)
			.unwrap()
		);
	}

	h.enqueue(1, "stable.bin");
	h.wait_tasks_done().await;

	assert_eq!(h.hits(), 0);
	let row = h.row("stable.bin").unwrap();
	assert_eq!(row.fileid, FileId(1));
	assert_eq!(row.revision, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_edit_is_moved_aside_as_conflicted() {
	let server_body = content(4096, 6);
	let local_edit = content(1500, 7);
	let files = vec![(1u64, server_body.clone())];
	// the local content is not a known revision of the file
	let h = harness(&files, None, test_settings(), false).await;

	let path = h.dir.path().join("report.txt");
	std::fs::write(&path, &local_edit).unwrap();
	h.enqueue(1, "report.txt");
	h.wait_tasks_done().await;

	assert_eq!(std::fs::read(&path).unwrap(), server_body);
	let conflicted = h.dir.path().join("report (conflicted).txt");
	assert_eq!(std::fs::read(&conflicted).unwrap(), local_edit);
	let row = h.row("report.txt").unwrap();
	assert_eq!(row.checksum, Some(hash_of(&server_body)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overwriting_an_old_revision_keeps_quiet() {
	let server_body = content(4096, 6);
	let local_old = content(1500, 7);
	let files = vec![(1u64, server_body.clone())];
	let h = harness(&files, None, test_settings(), true).await;

	let path = h.dir.path().join("doc.txt");
	std::fs::write(&path, &local_old).unwrap();
	h.enqueue(1, "doc.txt");
	h.wait_tasks_done().await;

	assert_eq!(std::fs::read(&path).unwrap(), server_body);
	assert!(!h.dir.path().join("doc (conflicted).txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_leaves_no_target_file() {
	let body = content(3 * 1024 * 1024, 8);
	let files = vec![(1u64, body)];
	let h = harness(&files, Some(Duration::from_millis(30)), test_settings(), true).await;
	let mut rx = h.engine.subscribe_events();

	h.enqueue(1, "huge.bin");
	wait_for(
		|| {
			matches!(
				rx.try_recv(),
				Ok(SyncEvent::FileDownloadStarted { .. })
			)
		},
		"download to start",
	)
	.await;

	h.engine.delete_download_tasks_for_file(FileId(1));
	h.wait_tasks_done().await;
	// give the retry bookkeeping a moment to settle
	tokio::time::sleep(Duration::from_millis(200)).await;

	assert!(!h.dir.path().join("huge.bin").exists());
	assert!(h.row("huge.bin").is_none());
	let events = drain(&mut rx);
	assert!(
		!events
			.iter()
			.any(|e| matches!(e, SyncEvent::FileDownloadFinished { .. })),
		"cancelled download must not finish"
	);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_streams_stay_bounded() {
	let files: Vec<(u64, Vec<u8>)> = (1..=6)
		.map(|id| (id, content(256 * 1024, id as u8)))
		.collect();
	let settings = Settings {
		max_parallel_downloads: 2,
		start_new_downloads_threshold: 10 * 1024 * 1024,
		..test_settings()
	};
	let h = harness(&files, Some(Duration::from_millis(10)), settings, true).await;

	for (id, _) in &files {
		h.enqueue(*id, &format!("file-{id}.bin"));
	}
	h.wait_tasks_done().await;

	for (id, data) in &files {
		assert_eq!(
			std::fs::read(h.dir.path().join(format!("file-{id}.bin"))).unwrap(),
			*data
		);
	}
	let max = h.state.0.max_in_flight.load(Ordering::SeqCst);
	assert!(max <= 2, "saw {max} concurrent streams with a bound of 2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_is_resumed_with_a_range_plan() {
	let body = content(256 * 1024, 11);
	let files = vec![(1u64, body.clone())];
	let settings = Settings {
		min_size_for_checksums: 4096,
		..test_settings()
	};
	let h = harness(&files, None, settings, true).await;

	// half of a previous attempt survives next to the target
	std::fs::write(h.dir.path().join("big.bin.partial"), &body[..128 * 1024]).unwrap();

	h.enqueue(1, "big.bin");
	h.wait_tasks_done().await;

	assert_eq!(std::fs::read(h.dir.path().join("big.bin")).unwrap(), body);
	assert_eq!(h.hits(), 1);
	let served = h.state.0.bytes_served.load(Ordering::SeqCst);
	assert_eq!(served, 128 * 1024, "only the missing half goes over the wire");
	// the rescued partial is cleaned up
	assert!(!h.dir.path().join("big.bin-old.partial").exists());
	assert!(!h.dir.path().join("big.bin.partial").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn free_space_shortfall_sets_local_full_and_defers() {
	let body = content(2048, 13);
	let files = vec![(1u64, body)];
	let settings = Settings {
		// no disk satisfies this, so the admission-side check must trip
		min_local_free_space: u64::MAX / 2,
		sleep_on_disk_full: Duration::from_millis(50),
		..test_settings()
	};
	let h = harness(&files, None, settings, true).await;
	assert!(!h.engine.gate().local_full());

	h.enqueue(1, "nospace.bin");
	wait_for(|| h.engine.gate().local_full(), "local-full flag to be raised").await;

	// nothing was transferred or published while the disk counts as full
	assert!(!h.dir.path().join("nospace.bin").exists());
	assert!(h.row("nospace.bin").is_none());
	assert_eq!(h.hits(), 0);

	// withdraw the download so the disk-full retry loop winds down
	h.engine.delete_download_tasks_for_file(FileId(1));
	h.engine.wait_no_downloads().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn download_with_headroom_clears_local_full() {
	let body = content(2048, 14);
	let files = vec![(1u64, body.clone())];
	let settings = Settings {
		min_local_free_space: 1,
		..test_settings()
	};
	let h = harness(&files, None, settings, true).await;

	// a previous shortfall left the flag raised
	h.engine.gate().set_local_full(true);
	h.enqueue(1, "roomy.bin");
	h.wait_tasks_done().await;

	assert_eq!(std::fs::read(h.dir.path().join("roomy.bin")).unwrap(), body);
	assert!(!h.engine.gate().local_full());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_respects_the_status_gate() {
	let body = content(2048, 12);
	let files = vec![(1u64, body.clone())];
	let h = harness(&files, None, test_settings(), true).await;

	h.engine.gate().set_online(false);
	h.enqueue(1, "gated.bin");
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(h.pending_tasks(), 1, "offline worker must not consume tasks");

	h.engine.gate().set_online(true);
	h.wait_tasks_done().await;
	assert_eq!(std::fs::read(h.dir.path().join("gated.bin")).unwrap(), body);
}
