//!
//! Relay-error feed for a single node.
//!
//! Errors are paginated newest-first, so every round walks from page 1
//! backward in time until a page overlaps the timestamp watermark. The new
//! records are re-sorted ascending before publication.

use crate::api::PaginatedSource;
use crate::api::types::{ApiError, LedgerErrorItem, SortDirection};
use crate::feed::ErrorBatchSource;
use crate::feed::types::ErrorRecord;
use crate::scheduler::{Pollable, SourceOutcome, SyncError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

struct ErrorFeedState {
	last_error_date: DateTime<Utc>,
	batch: Vec<ErrorRecord>,
}

/// Polls one node's relay-error ledger incrementally.
pub struct ErrorsFeed<S> {
	address: String,
	source: S,
	chain_ids: HashMap<String, String>,
	page_size: u32,
	max_page_count: u32,
	state: Mutex<ErrorFeedState>,
}

impl<S> ErrorsFeed<S>
where
	S: PaginatedSource<Item = LedgerErrorItem>,
{
	pub fn new(
		address: String,
		source: S,
		chain_ids: HashMap<String, String>,
		page_size: u32,
		max_page_count: u32,
		last_error_date: DateTime<Utc>,
	) -> Self {
		info!(
			"Node {} (errors) instantiated, watermark {}",
			address, last_error_date
		);

		Self {
			address,
			source,
			chain_ids,
			page_size,
			max_page_count,
			state: Mutex::new(ErrorFeedState {
				last_error_date,
				batch: Vec::new(),
			}),
		}
	}

	pub fn last_error_date(&self) -> DateTime<Utc> {
		self.state.lock().unwrap().last_error_date
	}

	/// Fetch all errors newer than the watermark and publish them as the
	/// current batch, sorted ascending by timestamp.
	pub async fn update(&self) -> Result<(), SyncError> {
		let watermark = self.last_error_date();
		let mut collected = Vec::new();

		for page in 1..=self.max_page_count {
			let result = self
				.source
				.fetch_page(page, self.page_size, SortDirection::Descending)
				.await?;

			debug!(
				"{} errors page {}: {} items",
				self.address,
				page,
				result.items.len()
			);

			let short = (result.items.len() as u32) < self.page_size;
			let mut overlap = false;

			for item in result.items {
				if item.timestamp <= watermark {
					overlap = true;
					continue;
				}
				collected.push(self.error_record(item));
			}

			if short || overlap {
				break;
			}
		}

		collected.sort_by_key(|err| err.time);

		info!("{} found {} new errors", self.address, collected.len());

		let mut state = self.state.lock().unwrap();
		if let Some(last) = collected.last() {
			state.last_error_date = last.time;
		}
		state.batch = collected;

		Ok(())
	}

	fn error_record(&self, item: LedgerErrorItem) -> ErrorRecord {
		let chain_id = item
			.blockchain
			.as_deref()
			.and_then(|id| self.chain_ids.get(id))
			.cloned()
			.unwrap_or_default();

		ErrorRecord {
			wallet: item.address,
			service_url: item.service_url,
			message: item.message,
			chain_id,
			time: item.timestamp,
		}
	}
}

impl<S> ErrorBatchSource for ErrorsFeed<S>
where
	S: PaginatedSource<Item = LedgerErrorItem>,
{
	fn address(&self) -> &str {
		&self.address
	}

	fn snapshot(&self) -> (Vec<ErrorRecord>, DateTime<Utc>) {
		let state = self.state.lock().unwrap();
		(state.batch.clone(), state.last_error_date)
	}
}

#[async_trait::async_trait]
impl<S> Pollable for ErrorsFeed<S>
where
	S: PaginatedSource<Item = LedgerErrorItem> + 'static,
{
	fn name(&self) -> String {
		format!("errors/{}", self.address)
	}

	async fn update(&self) -> Result<Vec<SourceOutcome>, SyncError> {
		ErrorsFeed::update(self).await?;
		Ok(Vec::new())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::types::Page;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn time(secs: i64) -> DateTime<Utc> {
		DateTime::from_timestamp(secs, 0).expect("valid timestamp")
	}

	fn item(secs: i64, message: &str) -> LedgerErrorItem {
		LedgerErrorItem {
			address: "node-1".to_string(),
			service_url: "https://node-1.example".to_string(),
			message: message.to_string(),
			blockchain: Some("0027".to_string()),
			timestamp: time(secs),
		}
	}

	struct FakeErrorLedger {
		/// Newest-first pages, as the remote returns them.
		pages: Vec<Vec<LedgerErrorItem>>,
		fetched: AtomicU32,
	}

	#[async_trait::async_trait]
	impl PaginatedSource for FakeErrorLedger {
		type Item = LedgerErrorItem;

		async fn fetch_page(
			&self,
			page: u32,
			_limit: u32,
			_direction: SortDirection,
		) -> Result<Page<LedgerErrorItem>, ApiError> {
			self.fetched.fetch_add(1, Ordering::SeqCst);
			let items = self
				.pages
				.get(page as usize - 1)
				.cloned()
				.unwrap_or_default();
			Ok(Page { items, total: 0 })
		}
	}

	fn feed(pages: Vec<Vec<LedgerErrorItem>>, watermark_secs: i64) -> ErrorsFeed<FakeErrorLedger> {
		ErrorsFeed::new(
			"node-1".to_string(),
			FakeErrorLedger {
				pages,
				fetched: AtomicU32::new(0),
			},
			HashMap::from([("0027".to_string(), "Gnosis Chain".to_string())]),
			2,
			10,
			time(watermark_secs),
		)
	}

	#[tokio::test]
	async fn test_batch_is_sorted_ascending_and_watermark_advances() {
		let feed = feed(
			vec![
				vec![item(400, "timeout"), item(300, "timeout")],
				vec![item(200, "refused"), item(50, "old")],
			],
			100,
		);

		feed.update().await.expect("update");

		let (batch, watermark) = feed.snapshot();
		let times: Vec<i64> = batch.iter().map(|err| err.time.timestamp()).collect();
		assert_eq!(times, vec![200, 300, 400]);
		assert_eq!(watermark, time(400));
		assert_eq!(batch[0].chain_id, "Gnosis Chain");
	}

	#[tokio::test]
	async fn test_pagination_stops_on_overlap() {
		let feed = feed(
			vec![
				vec![item(400, "timeout"), item(50, "old")],
				vec![item(40, "older"), item(30, "older")],
			],
			100,
		);

		feed.update().await.expect("update");

		// Page 1 already overlaps the watermark; page 2 is never requested.
		assert_eq!(feed.source.fetched.load(Ordering::SeqCst), 1);

		let (batch, _) = feed.snapshot();
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].time, time(400));
	}

	#[tokio::test]
	async fn test_empty_result_leaves_watermark_unchanged() {
		let feed = feed(vec![vec![item(80, "old"), item(50, "old")]], 100);

		feed.update().await.expect("update");

		let (batch, watermark) = feed.snapshot();
		assert!(batch.is_empty());
		assert_eq!(watermark, time(100));
	}
}
