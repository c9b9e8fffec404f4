use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// The conjunction the worker re-checks before and during every task: auth
/// material present, run state is "running", link is online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags {
	pub auth: bool,
	pub run: bool,
	pub online: bool,
}

impl StatusFlags {
	pub fn required_ok(self) -> bool {
		self.auth && self.run && self.online
	}
}

impl Default for StatusFlags {
	fn default() -> Self {
		StatusFlags {
			auth: true,
			run: true,
			online: true,
		}
	}
}

/// Required-status gate plus the sticky "local disk full" flag. Fed by the
/// surrounding client (auth layer, settings UI, connectivity probe); polled
/// and awaited by the download worker.
pub struct StatusGate {
	flags: watch::Sender<StatusFlags>,
	local_full: AtomicBool,
}

impl StatusGate {
	pub fn new() -> Self {
		Self {
			flags: watch::Sender::new(StatusFlags::default()),
			local_full: AtomicBool::new(false),
		}
	}

	pub fn set_auth(&self, auth: bool) {
		self.flags.send_modify(|f| f.auth = auth);
	}

	pub fn set_run(&self, run: bool) {
		self.flags.send_modify(|f| f.run = run);
	}

	pub fn set_online(&self, online: bool) {
		self.flags.send_modify(|f| f.online = online);
	}

	pub fn required_ok(&self) -> bool {
		self.flags.borrow().required_ok()
	}

	/// Blocks until auth+run+online all hold.
	pub async fn wait_required(&self) {
		let mut rx = self.flags.subscribe();
		// the sender lives in self, wait_for cannot fail
		let _ = rx.wait_for(|f| f.required_ok()).await;
	}

	pub fn set_local_full(&self, full: bool) {
		if self.local_full.swap(full, Ordering::Relaxed) != full {
			log::info!("local storage full: {full}");
		}
	}

	pub fn local_full(&self) -> bool {
		self.local_full.load(Ordering::Relaxed)
	}
}

impl Default for StatusGate {
	fn default() -> Self {
		Self::new()
	}
}

/// Aggregate transfer counters, published over a watch channel every time the
/// admission controller changes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
	pub files_downloading: u32,
	pub bytes_total: u64,
	pub bytes_downloaded: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn local_full_flag_flips_and_holds() {
		let gate = StatusGate::new();
		assert!(!gate.local_full());
		gate.set_local_full(true);
		assert!(gate.local_full());
		// setting the same value again must not clear it
		gate.set_local_full(true);
		assert!(gate.local_full());
		gate.set_local_full(false);
		assert!(!gate.local_full());
		gate.set_local_full(false);
		assert!(!gate.local_full());
	}

	#[tokio::test]
	async fn gate_blocks_until_required() {
		let gate = std::sync::Arc::new(StatusGate::new());
		gate.set_online(false);
		assert!(!gate.required_ok());

		let waiter = {
			let gate = gate.clone();
			tokio::spawn(async move { gate.wait_required().await })
		};
		tokio::task::yield_now().await;
		assert!(!waiter.is_finished());

		gate.set_online(true);
		waiter.await.unwrap();
		assert!(gate.required_ok());
	}
}
