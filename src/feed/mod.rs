//!
//! Incremental feeds over the remote sources.
//!
//! Each feed exclusively owns its cursor and its in-memory "last batch"
//! snapshot. A batch is transient: it is valid only until the next `update`
//! overwrites it and must be drained into the store in between. The engine
//! consumes feeds through the narrow batch-source traits below so it never
//! depends on the concrete client types.

use chrono::{DateTime, Utc};
use types::{ErrorRecord, NodeTransaction, PricePoint, TransactionCursor};

/// Relay-error feed
pub mod errors;
/// Market price feed
pub mod price;
/// Transactions and rewards feed
pub mod transactions;
/// Record and cursor types
pub mod types;

pub use errors::ErrorsFeed;
pub use price::PriceFeed;
pub use transactions::TransactionsFeed;

/// Engine-side view of a transactions feed.
pub trait TransactionBatchSource: Send + Sync {
	fn address(&self) -> &str;

	/// Current batch and cursor, captured in one critical section.
	fn snapshot(&self) -> (Vec<NodeTransaction>, TransactionCursor);

	/// Move the height watermark backward and discard the undrained batch,
	/// forcing a re-fetch on the next round.
	fn rollback(&self, height: u64);
}

/// Engine-side view of an errors feed.
pub trait ErrorBatchSource: Send + Sync {
	fn address(&self) -> &str;

	/// Current batch and timestamp watermark.
	fn snapshot(&self) -> (Vec<ErrorRecord>, DateTime<Utc>);
}

/// Engine-side view of the price feed.
pub trait PriceSeriesSource: Send + Sync {
	/// The full in-memory price series, sorted by timestamp.
	fn series(&self) -> Vec<PricePoint>;
}
