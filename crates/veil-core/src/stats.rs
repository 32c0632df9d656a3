use std::sync::{
	Arc,
	atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// Process-wide traffic counters, updated by every copy loop.
#[derive(Debug, Default)]
pub struct TrafficStats {
	total_upload:   AtomicU64,
	total_download: AtomicU64,
	active_conns:   AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
	pub total_upload:   u64,
	pub total_download: u64,
	pub active_conns:   usize,
}

impl TrafficStats {
	pub fn add_upload(&self, n: u64) {
		self.total_upload.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_download(&self, n: u64) {
		self.total_download.fetch_add(n, Ordering::Relaxed);
	}

	/// Registers a connection and returns a guard that deregisters it on
	/// every exit path.
	pub fn conn_opened(self: &Arc<Self>) -> ConnGuard {
		self.active_conns.fetch_add(1, Ordering::Relaxed);
		ConnGuard {
			stats: self.clone(),
		}
	}

	pub fn snapshot(&self) -> TrafficSnapshot {
		TrafficSnapshot {
			total_upload:   self.total_upload.load(Ordering::Relaxed),
			total_download: self.total_download.load(Ordering::Relaxed),
			active_conns:   self.active_conns.load(Ordering::Relaxed),
		}
	}
}

pub struct ConnGuard {
	stats: Arc<TrafficStats>,
}

impl Drop for ConnGuard {
	fn drop(&mut self) {
		self.stats.active_conns.fetch_sub(1, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;

	use super::TrafficStats;

	#[test]
	fn guard_releases_on_drop() {
		let stats = Arc::new(TrafficStats::default());
		let a = stats.conn_opened();
		let b = stats.conn_opened();
		assert_eq!(stats.snapshot().active_conns, 2);
		drop(a);
		assert_eq!(stats.snapshot().active_conns, 1);
		drop(b);
		assert_eq!(stats.snapshot().active_conns, 0);

		stats.add_upload(10);
		stats.add_download(3);
		let snap = stats.snapshot();
		assert_eq!(snap.total_upload, 10);
		assert_eq!(snap.total_download, 3);
	}
}
