use std::path::PathBuf;

use cirrus_types::ids::{FileId, FolderId, SyncId};
use tokio::sync::broadcast;

/// Notifications for the status surface (tray UI, CLI, tests). Delivery is
/// best effort: emitting never blocks and events to a lagging subscriber are
/// dropped by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
	LocalFolderCreated {
		syncid: SyncId,
		folderid: FolderId,
		localpath: PathBuf,
	},
	LocalFolderDeleted {
		syncid: SyncId,
		folderid: FolderId,
		localpath: PathBuf,
	},
	LocalFolderRenamed {
		syncid: SyncId,
		folderid: FolderId,
		localpath: PathBuf,
	},
	FileDownloadStarted {
		syncid: SyncId,
		fileid: FileId,
		localpath: PathBuf,
	},
	FileDownloadFinished {
		syncid: SyncId,
		fileid: FileId,
		localpath: PathBuf,
	},
	FileDownloadFailed {
		syncid: SyncId,
		fileid: FileId,
		localpath: PathBuf,
	},
	LocalFileDeleted {
		syncid: SyncId,
		fileid: FileId,
		localpath: PathBuf,
		remotepath: Option<String>,
	},
}

#[derive(Clone)]
pub struct EventBus {
	tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.tx.subscribe()
	}

	pub fn emit(&self, event: SyncEvent) {
		log::debug!("event: {event:?}");
		// no subscribers is fine
		let _ = self.tx.send(event);
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(256)
	}
}
