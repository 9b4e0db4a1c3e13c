//! Wire types and the error taxonomy for the remote node, rewards and price APIs.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Sort direction understood by the paginated explorer endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
	/// Oldest first, pages are stable across rounds.
	Ascending,
	/// Newest first, page 1 always holds the most recent items.
	Descending,
}

impl SortDirection {
	/// Numeric encoding used by the GraphQL `sort` input.
	pub fn as_i32(&self) -> i32 {
		match self {
			SortDirection::Ascending => 1,
			SortDirection::Descending => -1,
		}
	}
}

/// One page of items from a paginated endpoint.
#[derive(Debug, Clone)]
pub struct Page<T> {
	pub items: Vec<T>,
	/// Total number of items reported by the remote, when available.
	pub total: u64,
}

/// Raw transaction item from the generic ledger query.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerTxItem {
	pub hash: String,
	#[serde(rename = "type")]
	pub tx_type: String,
	pub chain: Option<String>,
	pub height: u64,
	/// Amount in micro-units.
	pub amount: f64,
	pub memo: Option<String>,
	pub block_time: DateTime<Utc>,
}

/// Raw error item from the node error query.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerErrorItem {
	pub address: String,
	pub service_url: String,
	pub message: String,
	pub blockchain: Option<String>,
	pub timestamp: DateTime<Utc>,
}

/// Rewards history for one chain, as returned by the rewards endpoint.
///
/// The rewards endpoint is not paginated; it always returns the complete
/// history grouped by chain.
#[derive(Debug, Clone, Deserialize)]
pub struct RewardChain {
	pub chain_id: String,
	pub transactions: Vec<RewardTxItem>,
}

/// One claim transaction from the rewards ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct RewardTxItem {
	pub hash: String,
	pub height: u64,
	pub time: DateTime<Utc>,
	pub num_relays: f64,
	pub pokt_per_relay: f64,
	pub is_confirmed: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RewardsResponse {
	pub data: Vec<RewardChain>,
}

/// Raw market chart from the price API: parallel `[timestamp_ms, value]` arrays.
#[derive(Debug, Deserialize)]
pub(crate) struct RawMarketChart {
	#[serde(default)]
	pub prices: Vec<(f64, f64)>,
	#[serde(default)]
	pub market_caps: Vec<(f64, f64)>,
	#[serde(default)]
	pub total_volumes: Vec<(f64, f64)>,
}

/// Error types for remote API calls.
///
/// Transient transport failures and bad responses are retryable; JSON and
/// contract errors are not and propagate straight to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
	#[error("HTTP request error: {0}")]
	Request(#[from] reqwest::Error),

	#[error("unexpected status code {0}")]
	Status(u16),

	#[error("GraphQL error: {0}")]
	GraphQl(String),

	#[error("JSON parse error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("missing field `{0}` in response")]
	MissingField(&'static str),
}

impl ApiError {
	/// Transport-level failure (connection error, timeout).
	pub fn is_transient(&self) -> bool {
		matches!(self, ApiError::Request(_))
	}

	/// The remote answered, but not with usable data (non-2xx status or a
	/// GraphQL-level error).
	pub fn is_lookup(&self) -> bool {
		matches!(self, ApiError::Status(_) | ApiError::GraphQl(_))
	}
}
