//! Encrypted Client Hello plumbing.
//!
//! The process-wide [`EchManager`] holds the current ECHConfigList,
//! refreshed on demand from an HTTPS DNS record over an independent DoH
//! path. On a server rejection the dialer asks the manager to refresh and
//! redials exactly once; the manager owns that coordination so connections
//! never hold back-references into the transport.

use std::{future::Future, pin::Pin, time::Duration};

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tokio::{sync::Mutex, time::Instant};
use veil_core::{debug, info};

use crate::error::{EchRejectedSnafu, Error, Result};

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>;

/// The one interface the ECH manager needs from a DNS bootstrap client.
/// The full resolver lives outside this crate; tests substitute fakes.
pub trait DohClient: Send + Sync {
	/// Returns the raw ECHConfigList bytes from the domain's HTTPS record.
	fn fetch_ech_config<'a>(&'a self, domain: &'a str) -> FetchFuture<'a>;
}

/// Refreshes are deduplicated inside this window.
const REFRESH_DEBOUNCE: Duration = Duration::from_secs(5);

pub struct EchManager {
	domain:  String,
	doh:     Box<dyn DohClient>,
	current: ArcSwapOption<Vec<u8>>,
	// Serializes refreshes and remembers the last one.
	refresh: Mutex<Option<Instant>>,
}

impl EchManager {
	pub fn new(domain: impl Into<String>, doh: Box<dyn DohClient>) -> Arc<Self> {
		Arc::new(Self {
			domain:  domain.into(),
			doh,
			current: ArcSwapOption::empty(),
			refresh: Mutex::new(None),
		})
	}

	/// Lock-free snapshot of the current config list.
	pub fn current(&self) -> Option<Arc<Vec<u8>>> {
		self.current.load_full()
	}

	/// Returns the current list, fetching it first if none is cached.
	pub async fn ensure(&self) -> Result<Arc<Vec<u8>>> {
		if let Some(list) = self.current() {
			return Ok(list);
		}
		self.refresh().await?;
		self.current().ok_or_else(|| {
			EchRejectedSnafu {
				retry_available: false,
			}
			.build()
		})
	}

	/// Re-fetches the config list over DoH. Serial; callers racing into a
	/// refresh share the result of the one in flight.
	pub async fn refresh(&self) -> Result<()> {
		let mut last = self.refresh.lock().await;
		if let Some(at) = *last {
			if at.elapsed() < REFRESH_DEBOUNCE && self.current().is_some() {
				return Ok(());
			}
		}
		let list = self.doh.fetch_ech_config(&self.domain).await?;
		info!(target: "[ECH]", "refreshed config list for {} ({} bytes)", self.domain, list.len());
		self.current.store(Some(Arc::new(list)));
		*last = Some(Instant::now());
		Ok(())
	}

	/// Installs a config list pushed by the server (retry configs).
	pub fn update(&self, list: Vec<u8>) {
		debug!(target: "[ECH]", "installed pushed config list ({} bytes)", list.len());
		self.current.store(Some(Arc::new(list)));
	}
}

/// Typed recognition of an ECH rejection inside a rustls handshake error.
pub(crate) fn is_ech_rejection(err: &rustls::Error) -> bool {
	matches!(
		err,
		rustls::Error::AlertReceived(rustls::AlertDescription::EncryptedClientHelloRequired)
	) || matches!(err, rustls::Error::PeerIncompatible(_))
}

/// Maps a TLS dial failure, surfacing ECH rejections as their own kind
/// when ECH was offered.
pub(crate) fn classify_tls_dial_error(err: std::io::Error, ech_offered: bool) -> Error {
	if ech_offered {
		let rejected = err
			.get_ref()
			.and_then(|inner| inner.downcast_ref::<rustls::Error>())
			.is_some_and(is_ech_rejection);
		if rejected {
			return EchRejectedSnafu {
				retry_available: true,
			}
			.build();
		}
	}
	err.into()
}

/// Same recognition for the QUIC path: the server answers a rejected ECH
/// with the `ech_required` (121) crypto alert.
pub(crate) fn is_quic_ech_rejection(err: &quinn::ConnectionError) -> bool {
	match err {
		quinn::ConnectionError::TransportError(transport) => {
			transport.code == quinn::TransportErrorCode::crypto(121)
		}
		_ => false,
	}
}

/// DoH-backed implementation over hickory's resolver.
pub struct HickoryDoh {
	resolver: hickory_resolver::TokioAsyncResolver,
}

impl HickoryDoh {
	pub fn cloudflare() -> Self {
		use hickory_resolver::config::{ResolverConfig, ResolverOpts};
		Self {
			resolver: hickory_resolver::TokioAsyncResolver::tokio(
				ResolverConfig::cloudflare_https(),
				ResolverOpts::default(),
			),
		}
	}

	pub fn google() -> Self {
		use hickory_resolver::config::{ResolverConfig, ResolverOpts};
		Self {
			resolver: hickory_resolver::TokioAsyncResolver::tokio(
				ResolverConfig::google_https(),
				ResolverOpts::default(),
			),
		}
	}
}

impl DohClient for HickoryDoh {
	fn fetch_ech_config<'a>(&'a self, domain: &'a str) -> FetchFuture<'a> {
		use hickory_resolver::proto::rr::{RData, RecordType, rdata::svcb::SvcParamValue};

		Box::pin(async move {
			let lookup = self
				.resolver
				.lookup(domain, RecordType::HTTPS)
				.await
				.map_err(|err| Error::from(std::io::Error::other(err)))?;
			for record in lookup.record_iter() {
				let Some(RData::HTTPS(https)) = record.data() else {
					continue;
				};
				for (_key, value) in https.svc_params() {
					if let SvcParamValue::EchConfig(ech) = value {
						return Ok(ech.clone().0);
					}
				}
			}
			Err(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("no ECH config in HTTPS record for {domain}"),
			)
			.into())
		})
	}
}

#[cfg(test)]
mod test {
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	};

	use super::{DohClient, EchManager, FetchFuture};

	struct FakeDoh {
		calls: Arc<AtomicUsize>,
	}

	impl DohClient for FakeDoh {
		fn fetch_ech_config<'a>(&'a self, _domain: &'a str) -> FetchFuture<'a> {
			let calls = self.calls.clone();
			Box::pin(async move {
				let n = calls.fetch_add(1, Ordering::SeqCst);
				Ok(vec![n as u8; 4])
			})
		}
	}

	#[tokio::test]
	async fn ensure_fetches_once_then_caches() {
		let calls = Arc::new(AtomicUsize::new(0));
		let manager = EchManager::new("front.example", Box::new(FakeDoh { calls: calls.clone() }));

		assert!(manager.current().is_none());
		let first = manager.ensure().await.unwrap();
		let second = manager.ensure().await.unwrap();
		assert_eq!(first, second);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn update_replaces_current() {
		let calls = Arc::new(AtomicUsize::new(0));
		let manager = EchManager::new("front.example", Box::new(FakeDoh { calls }));
		manager.update(vec![9, 9, 9]);
		assert_eq!(manager.current().unwrap().as_slice(), &[9, 9, 9]);
	}
}
