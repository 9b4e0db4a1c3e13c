//!
//! Remote API layer: retry policy, paginated-source protocol and the HTTP
//! clients for the transaction ledger, the error ledger, the rewards endpoint
//! and the price API.

use crate::feed::types::PricePoint;
use types::{ApiError, Page, RewardChain, SortDirection};

/// HTTP clients for the remote endpoints
pub mod client;
/// Bounded retry with fixed backoff
pub mod retry;
/// Wire types and error taxonomy
pub mod types;

pub use client::{ErrorLedger, GraphQlClient, PriceClient, RewardsClient, TransactionLedger};
pub use retry::RetryPolicy;

/// Protocol for fetching one page of records from a remote endpoint.
///
/// Implementations surface any non-success response as a retryable lookup
/// failure; deciding whether a page is terminal is the caller's concern,
/// since it depends on the feed's watermark.
#[async_trait::async_trait]
pub trait PaginatedSource: Send + Sync {
	type Item;

	async fn fetch_page(
		&self,
		page: u32,
		limit: u32,
		direction: SortDirection,
	) -> Result<Page<Self::Item>, ApiError>;
}

/// Source of the complete rewards history for a node.
#[async_trait::async_trait]
pub trait RewardsSource: Send + Sync {
	async fn fetch_all(&self) -> Result<Vec<RewardChain>, ApiError>;
}

/// Source of a time-indexed price series over a contiguous range.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
	async fn fetch_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<PricePoint>, ApiError>;
}
