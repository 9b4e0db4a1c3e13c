//! Normalized record and cursor types shared by the feeds and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a node transaction after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
	Transfer,
	Claim,
	StakeStart,
	StakeEnd,
	Other,
}

impl TxKind {
	/// Map a generic-ledger type string.
	///
	/// `proof` and `claim` rows are sourced exclusively from the rewards
	/// ledger, so they are dropped here to avoid double counting.
	pub fn from_ledger_type(raw: &str) -> Option<Self> {
		match raw {
			"proof" | "claim" => None,
			"send" => Some(TxKind::Transfer),
			"stake_validator" => Some(TxKind::StakeStart),
			"begin_unstake_validator" => Some(TxKind::StakeEnd),
			_ => Some(TxKind::Other),
		}
	}

	/// Whether this kind toggles the staking status of the node.
	pub fn is_staking_boundary(&self) -> bool {
		matches!(self, TxKind::StakeStart | TxKind::StakeEnd)
	}
}

/// A normalized node transaction.
///
/// `height` is unique per wallet among confirmed records; the engine
/// deduplicates on it when appending to the durable history. `price` and
/// `amount_price` are filled in by the reconciliation engine at commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTransaction {
	pub wallet: String,
	pub hash: String,
	pub kind: TxKind,
	pub chain_id: String,
	pub height: u64,
	pub time: DateTime<Utc>,
	pub amount: f64,
	pub memo: String,
	pub confirmed: bool,
	/// Derived: whether the wallet was inside a staking period at this record.
	pub staking: bool,
	#[serde(default)]
	pub price: Option<f64>,
	#[serde(default)]
	pub amount_price: Option<f64>,
}

/// A normalized node relay error, unique by `(wallet, time, message)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
	pub wallet: String,
	pub service_url: String,
	pub message: String,
	pub chain_id: String,
	pub time: DateTime<Utc>,
}

/// One point of the market price series, indexed by millisecond epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
	pub timestamp_ms: i64,
	pub price: f64,
	pub market_cap: f64,
	pub volume: f64,
}

/// Progress marker for a transactions feed.
///
/// `last_height` and `current_page` are monotonically non-decreasing across
/// successful rounds; only `rollback` may move `last_height` backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCursor {
	pub last_height: u64,
	pub current_page: u32,
	pub in_staking: bool,
}

impl Default for TransactionCursor {
	fn default() -> Self {
		Self {
			last_height: 1,
			current_page: 1,
			in_staking: false,
		}
	}
}
