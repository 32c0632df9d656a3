//! Per-IP request throttling and failure bans. One coarse RW lock guards
//! the whole table, fine for the target request rates.

use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};

use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;
use veil_core::debug;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
	pub max_requests_per_sec: u32,
	/// Consecutive failures tripping a ban, at least 1.
	pub failure_threshold:    u32,
	pub ban_time:             Duration,
	/// Failures further apart than this do not accumulate.
	pub failure_window:       Duration,
}

impl Default for RateLimiterConfig {
	fn default() -> Self {
		Self {
			max_requests_per_sec: 300,
			failure_threshold:    5,
			ban_time:             Duration::from_secs(5),
			failure_window:       Duration::from_secs(60),
		}
	}
}

#[derive(Debug)]
struct IpRecord {
	request_count:        u32,
	reset_at:             Instant,
	banned_until:         Option<Instant>,
	consecutive_failures: u32,
	last_fail:            Option<Instant>,
}

impl IpRecord {
	fn fresh(now: Instant) -> Self {
		Self {
			request_count:        0,
			reset_at:             now + Duration::from_secs(1),
			banned_until:         None,
			consecutive_failures: 0,
			last_fail:            None,
		}
	}
}

pub struct RateLimiter {
	config:  RateLimiterConfig,
	records: RwLock<HashMap<IpAddr, IpRecord>>,
}

impl RateLimiter {
	pub fn new(mut config: RateLimiterConfig) -> Arc<Self> {
		config.failure_threshold = config.failure_threshold.max(1);
		Arc::new(Self {
			config,
			records: RwLock::new(HashMap::new()),
		})
	}

	/// Admission check for one incoming request. False means the caller
	/// must answer with the indistinguishable reject.
	pub async fn check_request(&self, ip: IpAddr) -> bool {
		let now = Instant::now();
		let mut records = self.records.write().await;
		let record = records.entry(ip).or_insert_with(|| IpRecord::fresh(now));

		if let Some(until) = record.banned_until {
			if now < until {
				return false;
			}
			record.banned_until = None;
			record.consecutive_failures = 0;
		}

		if now >= record.reset_at {
			record.request_count = 0;
			record.reset_at = now + Duration::from_secs(1);
		}
		record.request_count += 1;
		record.request_count <= self.config.max_requests_per_sec
	}

	pub async fn record_failure(&self, ip: IpAddr) {
		let now = Instant::now();
		let mut records = self.records.write().await;
		let record = records.entry(ip).or_insert_with(|| IpRecord::fresh(now));

		if let Some(last) = record.last_fail {
			if now.duration_since(last) > self.config.failure_window {
				record.consecutive_failures = 0;
			}
		}
		record.last_fail = Some(now);
		record.consecutive_failures += 1;

		if record.consecutive_failures >= self.config.failure_threshold {
			debug!(target: "[LIMIT]", "banning {ip} for {:?}", self.config.ban_time);
			record.banned_until = Some(now + self.config.ban_time);
		}
	}

	pub async fn record_success(&self, ip: IpAddr) {
		let mut records = self.records.write().await;
		if let Some(record) = records.get_mut(&ip) {
			record.consecutive_failures = 0;
			record.last_fail = None;
		}
	}

	/// Drops records idle long enough to be meaningless.
	pub async fn sweep(&self) {
		let now = Instant::now();
		let horizon = self.config.failure_window.max(self.config.ban_time) * 2;
		let mut records = self.records.write().await;
		records.retain(|_, record| {
			let banned = record.banned_until.is_some_and(|until| until > now);
			let recent_fail = record
				.last_fail
				.is_some_and(|last| now.duration_since(last) < horizon);
			banned || recent_fail || now < record.reset_at
		});
	}

	pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) {
		let this = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(60));
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = ticker.tick() => this.sweep().await,
				}
			}
		});
	}
}

#[cfg(test)]
mod test {
	use std::{net::IpAddr, time::Duration};

	use super::{RateLimiter, RateLimiterConfig};

	fn ip(last: u8) -> IpAddr {
		IpAddr::from([10, 0, 0, last])
	}

	#[tokio::test]
	async fn failures_trip_ban_then_expire() {
		tokio::time::pause();
		let limiter = RateLimiter::new(RateLimiterConfig {
			failure_threshold: 3,
			ban_time: Duration::from_secs(5),
			..Default::default()
		});

		for _ in 0..3 {
			assert!(limiter.check_request(ip(1)).await);
			limiter.record_failure(ip(1)).await;
		}
		assert!(!limiter.check_request(ip(1)).await);
		// Other clients are unaffected.
		assert!(limiter.check_request(ip(2)).await);

		tokio::time::advance(Duration::from_secs(6)).await;
		assert!(limiter.check_request(ip(1)).await);
	}

	#[tokio::test]
	async fn success_resets_failure_streak() {
		let limiter = RateLimiter::new(RateLimiterConfig {
			failure_threshold: 2,
			..Default::default()
		});
		limiter.record_failure(ip(3)).await;
		limiter.record_success(ip(3)).await;
		limiter.record_failure(ip(3)).await;
		assert!(limiter.check_request(ip(3)).await);
	}

	#[tokio::test]
	async fn request_rate_ceiling() {
		let limiter = RateLimiter::new(RateLimiterConfig {
			max_requests_per_sec: 10,
			..Default::default()
		});
		for _ in 0..10 {
			assert!(limiter.check_request(ip(4)).await);
		}
		assert!(!limiter.check_request(ip(4)).await);
	}

	#[tokio::test]
	async fn threshold_clamped_to_one() {
		tokio::time::pause();
		let limiter = RateLimiter::new(RateLimiterConfig {
			failure_threshold: 0,
			ban_time: Duration::from_secs(5),
			..Default::default()
		});
		limiter.record_failure(ip(5)).await;
		assert!(!limiter.check_request(ip(5)).await);
	}
}
