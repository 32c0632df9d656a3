//! Replay protection. There is deliberately no separate check/add pair:
//! the only primitive is an atomic check-and-insert, so two handshakes
//! racing on the same nonce cannot both win.

use std::{future::Future, pin::Pin, time::Duration};

use moka::future::Cache;

use crate::proto::NONCE_LEN;

/// Nonces outlive the timestamp window on both sides: `2 · TimeWindow`.
pub const NONCE_TTL: Duration = Duration::from_secs(240);

pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Process-wide replay cache, behind an interface so tests substitute
/// fakes. Initialization is explicit at server start.
pub trait NonceCache: Send + Sync {
	/// True when the nonce was unseen and is now recorded.
	fn check_and_insert<'a>(&'a self, nonce: &'a [u8; NONCE_LEN]) -> CheckFuture<'a>;
}

pub struct MokaNonceCache {
	cache: Cache<[u8; NONCE_LEN], ()>,
}

impl MokaNonceCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			cache: Cache::builder().time_to_live(ttl).build(),
		}
	}
}

impl Default for MokaNonceCache {
	fn default() -> Self {
		Self::new(NONCE_TTL)
	}
}

impl NonceCache for MokaNonceCache {
	fn check_and_insert<'a>(&'a self, nonce: &'a [u8; NONCE_LEN]) -> CheckFuture<'a> {
		Box::pin(async move {
			self.cache.entry(*nonce).or_insert(()).await.is_fresh()
		})
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use super::{MokaNonceCache, NonceCache};

	#[tokio::test]
	async fn second_insert_is_replay() {
		let cache = MokaNonceCache::default();
		let nonce = [7u8; 12];
		assert!(cache.check_and_insert(&nonce).await);
		assert!(!cache.check_and_insert(&nonce).await);

		let other = [8u8; 12];
		assert!(cache.check_and_insert(&other).await);
	}

	#[tokio::test]
	async fn nonce_expires_after_ttl() {
		let cache = MokaNonceCache::new(Duration::from_millis(50));
		let nonce = [1u8; 12];
		assert!(cache.check_and_insert(&nonce).await);
		tokio::time::sleep(Duration::from_millis(120)).await;
		assert!(cache.check_and_insert(&nonce).await);
	}

	#[tokio::test]
	async fn concurrent_inserts_yield_one_winner() {
		let cache = std::sync::Arc::new(MokaNonceCache::default());
		let nonce = [3u8; 12];
		let mut handles = Vec::new();
		for _ in 0..8 {
			let cache = cache.clone();
			handles.push(tokio::spawn(async move { cache.check_and_insert(&nonce).await }));
		}
		let mut winners = 0;
		for handle in handles {
			if handle.await.unwrap() {
				winners += 1;
			}
		}
		assert_eq!(winners, 1);
	}
}
