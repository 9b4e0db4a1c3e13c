//!
//! Reconciliation engine.
//!
//! Drains feed batches into the durable store once per round. Each commit is
//! a single bulk scope: history rows, cursor and watermark advance together
//! or not at all. Transactions are priced against the stored market series at
//! commit time; when no usable price exists yet the whole batch is rejected
//! and the feed's watermark is rolled back so the records are re-fetched in a
//! later round, after the price series has caught up.
//!
//! Notifications (staking changes, relay error alerts) are composed inside
//! the scope but only sent after it committed.

use crate::config::ErrorRule;
use crate::feed::types::{ErrorRecord, NodeTransaction, PricePoint, TransactionCursor};
use crate::feed::{ErrorBatchSource, PriceSeriesSource, TransactionBatchSource};
use crate::notify::NotificationSink;
use crate::scheduler::{RoundCallback, SourceOutcome, SyncError};
use crate::storage::RelayStore;
use crate::utils::format_date;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{info, warn};

/// Store key of the market price series.
pub const PRICES_KEY: &str = "prices";

const PRICE_CURSOR_EPSILON_MS: i64 = 1000;
const PRICE_BACKFILL_DAYS: i64 = 30;

pub fn transactions_key(wallet: &str) -> String {
	format!("transactions/{wallet}")
}

pub fn transaction_cursor_key(wallet: &str) -> String {
	format!("cursor/transactions/{wallet}")
}

pub fn errors_key(wallet: &str) -> String {
	format!("errors/{wallet}")
}

pub fn error_watermark_key(wallet: &str) -> String {
	format!("cursor/errors/{wallet}")
}

/// Persisted cursor of a wallet, or the genesis default.
pub async fn load_transaction_cursor(store: &RelayStore, wallet: &str) -> TransactionCursor {
	store
		.get(&transaction_cursor_key(wallet))
		.await
		.unwrap_or_default()
}

/// Persisted error watermark of a wallet, or `now - max_age`.
pub async fn load_error_watermark(
	store: &RelayStore,
	wallet: &str,
	max_age_hours: i64,
) -> DateTime<Utc> {
	match store.get(&error_watermark_key(wallet)).await {
		Some(watermark) => watermark,
		None => Utc::now() - Duration::hours(max_age_hours),
	}
}

/// Persisted price series together with the fetch cursor derived from it:
/// one epsilon past the newest point, or a backfill window on first start.
pub async fn load_price_series(store: &RelayStore) -> (i64, Vec<PricePoint>) {
	let series: Vec<PricePoint> = store.get(PRICES_KEY).await.unwrap_or_default();

	let start_ms = series
		.iter()
		.map(|point| point.timestamp_ms)
		.max()
		.map(|last| last + PRICE_CURSOR_EPSILON_MS)
		.unwrap_or_else(|| (Utc::now() - Duration::days(PRICE_BACKFILL_DAYS)).timestamp_millis());

	(start_ms, series)
}

/// Price point closest in time to `ts_ms`. Ties resolve to the earlier point.
fn nearest_price(series: &[PricePoint], ts_ms: i64) -> Option<f64> {
	series
		.iter()
		.min_by(|a, b| {
			let da = (a.timestamp_ms - ts_ms).abs();
			let db = (b.timestamp_ms - ts_ms).abs();
			da.cmp(&db).then(a.timestamp_ms.cmp(&b.timestamp_ms))
		})
		.map(|point| point.price)
}

fn render_rule(template: &str, sample: &ErrorRecord, count: usize) -> String {
	template
		.replace("{wallet}", &sample.wallet)
		.replace("{message}", &sample.message)
		.replace("{chain}", &sample.chain_id)
		.replace("{service_url}", &sample.service_url)
		.replace("{count}", &count.to_string())
}

pub struct ReconciliationEngine {
	store: Arc<RelayStore>,
	sink: Arc<dyn NotificationSink>,
	error_rules: Vec<ErrorRule>,
	error_max_age: Duration,
}

impl ReconciliationEngine {
	pub fn new(
		store: Arc<RelayStore>,
		sink: Arc<dyn NotificationSink>,
		error_rules: Vec<ErrorRule>,
		error_max_age_hours: i64,
	) -> Self {
		Self {
			store,
			sink,
			error_rules,
			error_max_age: Duration::hours(error_max_age_hours),
		}
	}

	/// Drain one transactions feed into the store.
	///
	/// Prices every record against the stored series, appends the rows
	/// deduplicated by height, and advances the cursor, all in one scope.
	/// When the series has no point at all the batch is rejected: the feed
	/// is rolled back to just below the batch's oldest record.
	pub async fn commit_transactions(
		&self,
		feed: &dyn TransactionBatchSource,
	) -> Result<(), SyncError> {
		let (mut batch, cursor) = feed.snapshot();
		let wallet = feed.address().to_string();

		if batch.is_empty() {
			// The page offset may still have advanced.
			self.store
				.bulk_op(|db| db.set(&transaction_cursor_key(&wallet), &cursor))
				.await?;
			return Ok(());
		}

		let series: Vec<PricePoint> = self.store.get(PRICES_KEY).await.unwrap_or_default();

		if series.is_empty() {
			let oldest = batch.iter().map(|tx| tx.height).min().unwrap_or(1);
			warn!(
				"No prices available yet, rejecting {} transactions of {} and rolling back to height {}",
				batch.len(),
				wallet,
				oldest.saturating_sub(1)
			);
			feed.rollback(oldest.saturating_sub(1));
			return Ok(());
		}

		for tx in &mut batch {
			let price = nearest_price(&series, tx.time.timestamp_millis());
			tx.price = price;
			tx.amount_price = price.map(|p| p * tx.amount);
		}

		let appended = batch.len();

		let notifications = self
			.store
			.bulk_op(|db| {
				let rows: Vec<NodeTransaction> = db.get_or_default(&transactions_key(&wallet));

				// Boundary rows already in the history must not re-announce a
				// staking change when an overlap re-fetch delivers them again.
				let known: std::collections::HashSet<u64> =
					rows.iter().map(|tx| tx.height).collect();
				let notifications: Vec<String> = batch
					.iter()
					.filter(|tx| tx.kind.is_staking_boundary() && !known.contains(&tx.height))
					.map(staking_message)
					.collect();

				let mut rows = rows;
				rows.extend(batch);

				// Existing rows come first, so a re-fetched height keeps its
				// original priced row.
				let rows: Vec<NodeTransaction> = rows
					.into_iter()
					.unique_by(|tx| tx.height)
					.sorted_by_key(|tx| tx.height)
					.collect();

				db.set(&transactions_key(&wallet), &rows)?;
				db.set(&transaction_cursor_key(&wallet), &cursor)?;
				Ok(notifications)
			})
			.await?;

		info!("{} committed {} transactions", wallet, appended);

		for message in notifications {
			self.sink.notify(&message).await;
		}

		Ok(())
	}

	/// Drain one errors feed into the store and raise rule notifications for
	/// the genuinely-new records still inside the alerting window.
	pub async fn commit_errors(&self, feed: &dyn ErrorBatchSource) -> Result<(), SyncError> {
		let (batch, watermark) = feed.snapshot();
		let wallet = feed.address().to_string();

		let new_records = self
			.store
			.bulk_op(|db| {
				let rows: Vec<ErrorRecord> = db.get_or_default(&errors_key(&wallet));

				let known: std::collections::HashSet<(i64, String)> = rows
					.iter()
					.map(|err| (err.time.timestamp_millis(), err.message.clone()))
					.collect();

				let new_records: Vec<ErrorRecord> = batch
					.into_iter()
					.filter(|err| {
						!known.contains(&(err.time.timestamp_millis(), err.message.clone()))
					})
					.collect();

				let mut rows = rows;
				rows.extend(new_records.iter().cloned());
				rows.sort_by_key(|err| err.time);

				db.set(&errors_key(&wallet), &rows)?;
				db.set(&error_watermark_key(&wallet), &watermark)?;
				Ok(new_records)
			})
			.await?;

		if new_records.is_empty() {
			return Ok(());
		}

		info!("{} committed {} errors", wallet, new_records.len());

		// Every new record lands in the history; only recent ones are worth
		// alerting on.
		let horizon = Utc::now() - self.error_max_age;

		for rule in &self.error_rules {
			let matching: Vec<&ErrorRecord> = new_records
				.iter()
				.filter(|err| err.time >= horizon && err.message.contains(&rule.find))
				.collect();

			match matching.len() {
				0 => {}
				1 => {
					self.sink
						.notify(&render_rule(&rule.notify_single, matching[0], 1))
						.await;
				}
				count => {
					self.sink
						.notify(&render_rule(&rule.notify_many, matching[0], count))
						.await;
				}
			}
		}

		Ok(())
	}

	/// Persist the in-memory price series wholesale.
	pub async fn commit_prices(&self, source: &dyn PriceSeriesSource) -> Result<(), SyncError> {
		let series = source.series();
		if series.is_empty() {
			return Ok(());
		}

		self.store
			.bulk_op(|db| db.set(PRICES_KEY, &series))
			.await?;

		Ok(())
	}
}

fn staking_message(tx: &NodeTransaction) -> String {
	use crate::feed::types::TxKind;

	match tx.kind {
		TxKind::StakeStart => format!(
			"\u{1F7E2} Node {} started staking on {}",
			tx.wallet,
			format_date(tx.time)
		),
		_ => format!(
			"\u{1F534} Node {} is no longer staking as of {}",
			tx.wallet,
			format_date(tx.time)
		),
	}
}

fn failed_sources(outcomes: &[SourceOutcome]) -> std::collections::HashSet<&str> {
	outcomes
		.iter()
		.filter(|o| o.result.is_err())
		.map(|o| o.name.as_str())
		.collect()
}

/// Commits transaction batches after each round, skipping feeds whose update
/// failed (their batch is stale).
pub struct StoreTransactions {
	pub engine: Arc<ReconciliationEngine>,
	pub feeds: Vec<Arc<dyn TransactionBatchSource>>,
}

#[async_trait::async_trait]
impl RoundCallback for StoreTransactions {
	fn name(&self) -> String {
		"store-transactions".to_string()
	}

	async fn on_round(&self, outcomes: &[SourceOutcome]) -> Result<(), SyncError> {
		let failed = failed_sources(outcomes);

		for feed in &self.feeds {
			if failed.contains(format!("transactions/{}", feed.address()).as_str()) {
				warn!("{} update failed, skipping commit", feed.address());
				continue;
			}
			self.engine.commit_transactions(feed.as_ref()).await?;
		}

		Ok(())
	}
}

/// Commits error batches after each round.
pub struct StoreErrors {
	pub engine: Arc<ReconciliationEngine>,
	pub feeds: Vec<Arc<dyn ErrorBatchSource>>,
}

#[async_trait::async_trait]
impl RoundCallback for StoreErrors {
	fn name(&self) -> String {
		"store-errors".to_string()
	}

	async fn on_round(&self, outcomes: &[SourceOutcome]) -> Result<(), SyncError> {
		let failed = failed_sources(outcomes);

		for feed in &self.feeds {
			if failed.contains(format!("errors/{}", feed.address()).as_str()) {
				warn!("{} errors update failed, skipping commit", feed.address());
				continue;
			}
			self.engine.commit_errors(feed.as_ref()).await?;
		}

		Ok(())
	}
}

/// Persists the price series after each round, before any transaction commit
/// of the same round can read it.
pub struct StorePrices {
	pub engine: Arc<ReconciliationEngine>,
	pub source: Arc<dyn PriceSeriesSource>,
}

#[async_trait::async_trait]
impl RoundCallback for StorePrices {
	fn name(&self) -> String {
		"store-prices".to_string()
	}

	async fn on_round(&self, _outcomes: &[SourceOutcome]) -> Result<(), SyncError> {
		self.engine.commit_prices(self.source.as_ref()).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::feed::types::TxKind;
	use crate::notify::testing::RecordingSink;
	use std::sync::Mutex;

	fn time(secs: i64) -> DateTime<Utc> {
		DateTime::from_timestamp(secs, 0).expect("valid timestamp")
	}

	fn point(ts_ms: i64, price: f64) -> PricePoint {
		PricePoint {
			timestamp_ms: ts_ms,
			price,
			market_cap: 0.0,
			volume: 0.0,
		}
	}

	fn tx(height: u64, kind: TxKind, amount: f64) -> NodeTransaction {
		NodeTransaction {
			wallet: "node-1".to_string(),
			hash: format!("hash-{height}"),
			kind,
			chain_id: String::new(),
			height,
			time: time(height as i64),
			amount,
			memo: String::new(),
			confirmed: true,
			staking: false,
			price: None,
			amount_price: None,
		}
	}

	struct FakeTxFeed {
		batch: Vec<NodeTransaction>,
		cursor: TransactionCursor,
		rolled_back_to: Mutex<Option<u64>>,
	}

	impl TransactionBatchSource for FakeTxFeed {
		fn address(&self) -> &str {
			"node-1"
		}

		fn snapshot(&self) -> (Vec<NodeTransaction>, TransactionCursor) {
			(self.batch.clone(), self.cursor)
		}

		fn rollback(&self, height: u64) {
			*self.rolled_back_to.lock().unwrap() = Some(height);
		}
	}

	struct FakeErrFeed {
		batch: Vec<ErrorRecord>,
		watermark: DateTime<Utc>,
	}

	impl ErrorBatchSource for FakeErrFeed {
		fn address(&self) -> &str {
			"node-1"
		}

		fn snapshot(&self) -> (Vec<ErrorRecord>, DateTime<Utc>) {
			(self.batch.clone(), self.watermark)
		}
	}

	fn err(secs: i64, message: &str) -> ErrorRecord {
		ErrorRecord {
			wallet: "node-1".to_string(),
			service_url: "https://node-1.example".to_string(),
			message: message.to_string(),
			chain_id: "Gnosis Chain".to_string(),
			time: time(secs),
		}
	}

	fn engine_with(rules: Vec<ErrorRule>) -> (Arc<RelayStore>, Arc<RecordingSink>, ReconciliationEngine) {
		let store = Arc::new(RelayStore::ephemeral("usd"));
		let sink = Arc::new(RecordingSink::default());
		let engine = ReconciliationEngine::new(
			Arc::clone(&store),
			sink.clone() as Arc<dyn NotificationSink>,
			rules,
			24,
		);
		(store, sink, engine)
	}

	#[test]
	fn test_nearest_price_picks_closest_point() {
		let series = vec![point(0, 10.0), point(100_000, 20.0)];

		// 60s is nearer to the 100s point.
		assert_eq!(nearest_price(&series, 60_000), Some(20.0));
		assert_eq!(nearest_price(&series, 40_000), Some(10.0));
	}

	#[test]
	fn test_nearest_price_tie_resolves_to_earlier_point() {
		let series = vec![point(0, 10.0), point(100_000, 20.0)];
		assert_eq!(nearest_price(&series, 50_000), Some(10.0));
	}

	#[test]
	fn test_nearest_price_empty_series() {
		assert_eq!(nearest_price(&[], 1000), None);
	}

	#[tokio::test]
	async fn test_missing_prices_reject_batch_and_roll_back() {
		let (store, _sink, engine) = engine_with(Vec::new());

		let feed = FakeTxFeed {
			batch: vec![tx(100, TxKind::Transfer, 1.0), tx(105, TxKind::Claim, 2.0)],
			cursor: TransactionCursor {
				last_height: 105,
				current_page: 3,
				in_staking: false,
			},
			rolled_back_to: Mutex::new(None),
		};

		engine.commit_transactions(&feed).await.expect("commit");

		assert_eq!(*feed.rolled_back_to.lock().unwrap(), Some(99));
		let rows: Option<Vec<NodeTransaction>> = store.get(&transactions_key("node-1")).await;
		assert!(rows.is_none());
		let cursor: Option<TransactionCursor> =
			store.get(&transaction_cursor_key("node-1")).await;
		assert!(cursor.is_none());
	}

	#[tokio::test]
	async fn test_commit_prices_rows_and_cursor_together() {
		let (store, _sink, engine) = engine_with(Vec::new());
		store
			.set(PRICES_KEY, &vec![point(100_000, 0.5)])
			.await
			.expect("seed prices");

		let cursor = TransactionCursor {
			last_height: 105,
			current_page: 2,
			in_staking: false,
		};
		let feed = FakeTxFeed {
			batch: vec![tx(100, TxKind::Transfer, 4.0)],
			cursor,
			rolled_back_to: Mutex::new(None),
		};

		engine.commit_transactions(&feed).await.expect("commit");

		let rows: Vec<NodeTransaction> = store
			.get(&transactions_key("node-1"))
			.await
			.expect("rows stored");
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].price, Some(0.5));
		assert_eq!(rows[0].amount_price, Some(2.0));

		let stored: TransactionCursor = store
			.get(&transaction_cursor_key("node-1"))
			.await
			.expect("cursor stored");
		assert_eq!(stored, cursor);
	}

	#[tokio::test]
	async fn test_refetched_height_is_not_double_counted() {
		let (store, _sink, engine) = engine_with(Vec::new());
		store
			.set(PRICES_KEY, &vec![point(0, 1.0)])
			.await
			.expect("seed prices");

		let mut original = tx(10, TxKind::Transfer, 7.0);
		original.price = Some(1.0);
		original.amount_price = Some(7.0);
		store
			.set(&transactions_key("node-1"), &vec![original])
			.await
			.expect("seed rows");

		let feed = FakeTxFeed {
			batch: vec![tx(10, TxKind::Transfer, 999.0), tx(11, TxKind::Claim, 1.0)],
			cursor: TransactionCursor {
				last_height: 11,
				current_page: 1,
				in_staking: false,
			},
			rolled_back_to: Mutex::new(None),
		};

		engine.commit_transactions(&feed).await.expect("commit");

		let rows: Vec<NodeTransaction> = store
			.get(&transactions_key("node-1"))
			.await
			.expect("rows stored");
		let heights: Vec<u64> = rows.iter().map(|tx| tx.height).collect();
		assert_eq!(heights, vec![10, 11]);
		// The original priced row for height 10 survives.
		assert_eq!(rows[0].amount, 7.0);
	}

	#[tokio::test]
	async fn test_staking_boundary_raises_notification_after_commit() {
		let (store, sink, engine) = engine_with(Vec::new());
		store
			.set(PRICES_KEY, &vec![point(0, 1.0)])
			.await
			.expect("seed prices");

		let feed = FakeTxFeed {
			batch: vec![tx(10, TxKind::StakeStart, 0.0)],
			cursor: TransactionCursor::default(),
			rolled_back_to: Mutex::new(None),
		};

		engine.commit_transactions(&feed).await.expect("commit");

		let messages = sink.messages.lock().unwrap();
		assert_eq!(messages.len(), 1);
		assert!(messages[0].contains("started staking"));
		assert!(messages[0].contains("node-1"));
	}

	#[tokio::test]
	async fn test_refetched_staking_boundary_does_not_renotify() {
		let (store, sink, engine) = engine_with(Vec::new());
		store
			.set(PRICES_KEY, &vec![point(0, 1.0)])
			.await
			.expect("seed prices");
		store
			.set(&transactions_key("node-1"), &vec![tx(10, TxKind::StakeStart, 0.0)])
			.await
			.expect("seed rows");

		// Overlap re-fetch delivers the stored boundary again, plus a new one.
		let feed = FakeTxFeed {
			batch: vec![tx(10, TxKind::StakeStart, 0.0), tx(20, TxKind::StakeEnd, 0.0)],
			cursor: TransactionCursor {
				last_height: 20,
				current_page: 1,
				in_staking: false,
			},
			rolled_back_to: Mutex::new(None),
		};

		engine.commit_transactions(&feed).await.expect("commit");

		let messages = sink.messages.lock().unwrap();
		assert_eq!(messages.len(), 1);
		assert!(messages[0].contains("no longer staking"));
	}

	#[tokio::test]
	async fn test_error_rule_aggregates_repeated_matches() {
		let rule = ErrorRule {
			find: "SESSION".to_string(),
			notify_single: "{wallet} failed: {message}".to_string(),
			notify_many: "{wallet} failed {count} sessions".to_string(),
		};
		let (_store, sink, engine) = engine_with(vec![rule]);

		let now = Utc::now().timestamp();
		let feed = FakeErrFeed {
			batch: vec![
				err(now - 30, "ERROR EXECUTING SESSION a"),
				err(now - 20, "ERROR EXECUTING SESSION b"),
				err(now - 10, "unrelated"),
			],
			watermark: time(now - 10),
		};

		engine.commit_errors(&feed).await.expect("commit");

		let messages = sink.messages.lock().unwrap();
		assert_eq!(messages.len(), 1);
		assert_eq!(messages[0], "node-1 failed 2 sessions");
	}

	#[tokio::test]
	async fn test_already_stored_errors_do_not_renotify() {
		let rule = ErrorRule {
			find: "SESSION".to_string(),
			notify_single: "single: {message}".to_string(),
			notify_many: "many: {count}".to_string(),
		};
		let (store, sink, engine) = engine_with(vec![rule]);

		let now = Utc::now().timestamp();
		let known = err(now - 30, "SESSION x");
		store
			.set(&errors_key("node-1"), &vec![known.clone()])
			.await
			.expect("seed errors");

		let feed = FakeErrFeed {
			batch: vec![known, err(now - 10, "SESSION y")],
			watermark: time(now - 10),
		};

		engine.commit_errors(&feed).await.expect("commit");

		let rows: Vec<ErrorRecord> = store
			.get(&errors_key("node-1"))
			.await
			.expect("rows stored");
		assert_eq!(rows.len(), 2);

		let messages = sink.messages.lock().unwrap();
		assert_eq!(messages.len(), 1);
		assert_eq!(messages[0], "single: SESSION y");
	}

	#[tokio::test]
	async fn test_old_errors_are_stored_but_not_notified() {
		let rule = ErrorRule {
			find: "SESSION".to_string(),
			notify_single: "single: {message}".to_string(),
			notify_many: "many: {count}".to_string(),
		};
		let (store, sink, engine) = engine_with(vec![rule]);

		let now = Utc::now().timestamp();
		let ancient = now - 48 * 3600;
		let feed = FakeErrFeed {
			batch: vec![err(ancient, "SESSION old"), err(now - 10, "SESSION fresh")],
			watermark: time(now - 10),
		};

		engine.commit_errors(&feed).await.expect("commit");

		// Both rows land in the durable history; the age window only gates
		// the notification.
		let rows: Vec<ErrorRecord> = store
			.get(&errors_key("node-1"))
			.await
			.expect("rows stored");
		assert_eq!(rows.len(), 2);

		let messages = sink.messages.lock().unwrap();
		assert_eq!(messages.len(), 1);
		assert_eq!(messages[0], "single: SESSION fresh");
	}

	#[tokio::test]
	async fn test_load_helpers_fall_back_to_defaults() {
		let store = RelayStore::ephemeral("usd");

		let cursor = load_transaction_cursor(&store, "node-1").await;
		assert_eq!(cursor, TransactionCursor::default());

		let watermark = load_error_watermark(&store, "node-1", 24).await;
		let expected = Utc::now() - Duration::hours(24);
		assert!((watermark - expected).num_seconds().abs() < 5);

		let (start_ms, series) = load_price_series(&store).await;
		assert!(series.is_empty());
		let expected = (Utc::now() - Duration::days(30)).timestamp_millis();
		assert!((start_ms - expected).abs() < 5000);
	}

	#[tokio::test]
	async fn test_price_cursor_resumes_past_stored_series() {
		let store = RelayStore::ephemeral("usd");
		store
			.set(PRICES_KEY, &vec![point(1000, 1.0), point(5000, 1.2)])
			.await
			.expect("seed prices");

		let (start_ms, series) = load_price_series(&store).await;
		assert_eq!(series.len(), 2);
		assert_eq!(start_ms, 6000);
	}
}
