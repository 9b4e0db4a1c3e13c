//!
//! Market price feed.
//!
//! Keeps the whole price series in memory (it is also persisted wholesale by
//! the engine) and extends it on every round with the range
//! `[start_date, now]`. The cursor only advances when the remote returned
//! data, so a failed or empty fetch is retried cleanly next round.

use crate::api::PriceSource;
use crate::feed::PriceSeriesSource;
use crate::feed::types::PricePoint;
use crate::scheduler::{Pollable, SourceOutcome, SyncError};
use chrono::Utc;
use std::sync::Mutex;
use tracing::info;

/// Advance past the last fetched point by one second.
const CURSOR_EPSILON_MS: i64 = 1000;

struct PriceState {
	start_date_ms: i64,
	series: Vec<PricePoint>,
}

/// Polls the price API for a contiguous, timestamp-indexed series.
pub struct PriceFeed<P> {
	source: P,
	state: Mutex<PriceState>,
}

impl<P> PriceFeed<P>
where
	P: PriceSource,
{
	pub fn new(source: P, start_date_ms: i64, series: Vec<PricePoint>) -> Self {
		info!(
			"Price feed instantiated with {} cached prices, cursor {}",
			series.len(),
			start_date_ms
		);

		Self {
			source,
			state: Mutex::new(PriceState {
				start_date_ms,
				series,
			}),
		}
	}

	pub fn start_date_ms(&self) -> i64 {
		self.state.lock().unwrap().start_date_ms
	}

	pub async fn update(&self) -> Result<(), SyncError> {
		let start = self.start_date_ms();
		let end = Utc::now().timestamp_millis();

		let new_points = self.source.fetch_range(start, end).await?;
		info!("Retrieved {} new prices from API", new_points.len());

		if new_points.is_empty() {
			// Cursor untouched: the same range is retried next round.
			return Ok(());
		}

		let mut state = self.state.lock().unwrap();
		state.series.extend(new_points);
		state.series.sort_by_key(|point| point.timestamp_ms);
		state.series.dedup_by_key(|point| point.timestamp_ms);

		if let Some(last) = state.series.last() {
			state.start_date_ms = last.timestamp_ms + CURSOR_EPSILON_MS;
		}

		Ok(())
	}
}

impl<P> PriceSeriesSource for PriceFeed<P>
where
	P: PriceSource,
{
	fn series(&self) -> Vec<PricePoint> {
		self.state.lock().unwrap().series.clone()
	}
}

#[async_trait::async_trait]
impl<P> Pollable for PriceFeed<P>
where
	P: PriceSource + 'static,
{
	fn name(&self) -> String {
		"prices".to_string()
	}

	async fn update(&self) -> Result<Vec<SourceOutcome>, SyncError> {
		PriceFeed::update(self).await?;
		Ok(Vec::new())
	}
}
