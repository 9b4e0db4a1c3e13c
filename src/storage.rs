//!
//! Durable key-value store with an all-or-nothing bulk-write scope.
//!
//! The store is a JSON-file-backed map. Plain `set` persists immediately;
//! `bulk_op` runs a closure against a working copy and only persists (and
//! swaps in) the copy when the closure succeeds, so a failed scope leaves
//! both memory and disk untouched. A single async mutex serializes every
//! write, making the bulk scope a critical section across all feeds.
//!
//! The file carries a version and currency stamp; a mismatch on open flushes
//! the content, preventing histories priced in mixed currencies.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const DB_VERSION: &str = "1";

const VERSION_KEY: &str = "db_version";
const CURRENCY_KEY: &str = "db_currency";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("store I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("store serialization error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Durable per-key map shared by all feeds.
pub struct RelayStore {
	path: Option<PathBuf>,
	state: Mutex<BTreeMap<String, Value>>,
}

impl RelayStore {
	/// Open (or create) the store at `path` for the given pricing currency.
	pub async fn open(path: PathBuf, currency: &str) -> Result<Self, StoreError> {
		let map: BTreeMap<String, Value> = match tokio::fs::read(&path).await {
			Ok(bytes) => serde_json::from_slice(&bytes)?,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				warn!("Could not load the database, file doesn't exist. Is it a new instance?");
				BTreeMap::new()
			}
			Err(err) => return Err(err.into()),
		};

		info!("Loaded database from {} ({} keys)", path.display(), map.len());

		let store = Self {
			path: Some(path),
			state: Mutex::new(map),
		};
		store.check_stamp(currency).await?;

		Ok(store)
	}

	/// In-memory store without a backing file. Used in tests.
	pub fn ephemeral(currency: &str) -> Self {
		let mut map = BTreeMap::new();
		map.insert(VERSION_KEY.to_string(), json!(DB_VERSION));
		map.insert(CURRENCY_KEY.to_string(), json!(currency));

		Self {
			path: None,
			state: Mutex::new(map),
		}
	}

	/// Flush the content when the persisted version or currency does not
	/// match what this instance expects.
	async fn check_stamp(&self, currency: &str) -> Result<(), StoreError> {
		let mut map = self.state.lock().await;

		let version = map
			.get(VERSION_KEY)
			.and_then(Value::as_str)
			.unwrap_or("unknown")
			.to_string();
		let db_currency = map
			.get(CURRENCY_KEY)
			.and_then(Value::as_str)
			.unwrap_or("unknown")
			.to_string();

		if version != DB_VERSION || db_currency != currency {
			warn!(
				"The database has version {} and currency {}, but this instance requires {} and {}. Flushing the content...",
				version, db_currency, DB_VERSION, currency
			);
			map.clear();
			map.insert(VERSION_KEY.to_string(), json!(DB_VERSION));
			map.insert(CURRENCY_KEY.to_string(), json!(currency));
			self.persist(&map).await?;
		}

		Ok(())
	}

	pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
		let map = self.state.lock().await;
		map.get(key)
			.and_then(|value| serde_json::from_value(value.clone()).ok())
	}

	pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
		let mut map = self.state.lock().await;
		map.insert(key.to_string(), serde_json::to_value(value)?);
		self.persist(&map).await
	}

	/// Run several mutations as one atomic scope.
	///
	/// The closure operates on a working copy; when it returns `Ok` the copy
	/// is persisted and swapped in, otherwise everything it did is discarded.
	/// Bulk scopes are serialized: while one is held no other write proceeds.
	pub async fn bulk_op<R>(
		&self,
		f: impl FnOnce(&mut StoreView<'_>) -> Result<R, StoreError>,
	) -> Result<R, StoreError> {
		let mut map = self.state.lock().await;
		let mut working = map.clone();

		let result = f(&mut StoreView { map: &mut working })?;

		self.persist(&working).await?;
		*map = working;

		Ok(result)
	}

	/// Atomic file replacement: write to a temp file, then rename over.
	async fn persist(&self, map: &BTreeMap<String, Value>) -> Result<(), StoreError> {
		let Some(path) = &self.path else {
			return Ok(());
		};

		let bytes = serde_json::to_vec(map)?;
		let tmp = path.with_extension("tmp");

		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&tmp, &bytes).await?;
		tokio::fs::rename(&tmp, path).await?;

		Ok(())
	}
}

/// Mutable view over the working copy inside a bulk scope.
pub struct StoreView<'a> {
	map: &'a mut BTreeMap<String, Value>,
}

impl StoreView<'_> {
	pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
		self.map
			.get(key)
			.and_then(|value| serde_json::from_value(value.clone()).ok())
	}

	pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
		self.get(key).unwrap_or_default()
	}

	pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
		self.map.insert(key.to_string(), serde_json::to_value(value)?);
		Ok(())
	}
}
