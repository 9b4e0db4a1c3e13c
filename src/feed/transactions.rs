//!
//! Transactions feed for a single node.
//!
//! Each update round merges two heterogeneous remote streams: the generic
//! transaction ledger (paginated by height, resumed from a persisted page
//! offset) and the rewards ledger (unpaginated, always the full history).
//! New records are filtered against the height watermark, merged, sorted and
//! annotated with the derived staking status before being published together
//! with the advanced cursor in a single critical section.

use crate::api::types::{ApiError, LedgerTxItem, SortDirection};
use crate::api::{PaginatedSource, RewardsSource};
use crate::feed::TransactionBatchSource;
use crate::feed::types::{NodeTransaction, TransactionCursor, TxKind};
use crate::scheduler::{Pollable, SourceOutcome, SyncError};
use crate::utils::upokt_to_pokt;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

struct FeedState {
	cursor: TransactionCursor,
	batch: Vec<NodeTransaction>,
	/// Page offset the last fetch started from; `rollback` returns to it so
	/// every page of a rejected batch is walked again.
	prior_page: u32,
}

/// Polls one node's transaction and rewards ledgers incrementally.
pub struct TransactionsFeed<L, R> {
	address: String,
	ledger: L,
	rewards: R,
	chain_ids: HashMap<String, String>,
	page_size: u32,
	max_page_count: u32,
	state: Mutex<FeedState>,
}

impl<L, R> TransactionsFeed<L, R>
where
	L: PaginatedSource<Item = LedgerTxItem>,
	R: RewardsSource,
{
	pub fn new(
		address: String,
		ledger: L,
		rewards: R,
		chain_ids: HashMap<String, String>,
		page_size: u32,
		max_page_count: u32,
		cursor: TransactionCursor,
	) -> Self {
		info!(
			"Node {} (transactions) instantiated at height {}, page {}, in staking: {}",
			address, cursor.last_height, cursor.current_page, cursor.in_staking
		);

		Self {
			address,
			ledger,
			rewards,
			chain_ids,
			page_size,
			max_page_count,
			state: Mutex::new(FeedState {
				cursor,
				batch: Vec::new(),
				prior_page: cursor.current_page,
			}),
		}
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	pub fn cursor(&self) -> TransactionCursor {
		self.state.lock().unwrap().cursor
	}

	/// Fetch everything newer than the cursor and publish it as the current
	/// batch. The previous batch is overwritten; it must have been drained
	/// into the store before the next round.
	pub async fn update(&self) -> Result<(), SyncError> {
		let cursor = self.cursor();

		let (ledger_new, next_page) = self.fetch_ledger(cursor).await?;
		let rewards_new = self.fetch_rewards(cursor.last_height).await?;

		let mut batch: Vec<NodeTransaction> = ledger_new;
		batch.extend(rewards_new);
		batch.sort_by_key(|tx| tx.height);
		batch.dedup_by_key(|tx| tx.height);

		info!("{} found {} new transactions", self.address, batch.len());

		// Single critical section: batch and cursor advance together so
		// readers never observe a half-updated cursor.
		let mut state = self.state.lock().unwrap();
		let staking = apply_staking_status(&mut batch, state.cursor.in_staking);

		if let Some(last) = batch.last() {
			state.cursor.last_height = last.height;
			state.cursor.in_staking = staking;
		}
		state.prior_page = cursor.current_page.max(1);
		state.cursor.current_page = next_page;
		state.batch = batch;

		Ok(())
	}

	/// Walk ledger pages from the persisted offset until the terminal page:
	/// a short page, or one whose oldest item is at or below the watermark.
	/// Returns the filtered new records and the next pagination offset.
	async fn fetch_ledger(
		&self,
		cursor: TransactionCursor,
	) -> Result<(Vec<NodeTransaction>, u32), ApiError> {
		let mut collected = Vec::new();
		let mut page = cursor.current_page.max(1);
		let mut last_fetched = page;
		let mut terminal = false;

		for _ in 0..self.max_page_count {
			let result = self
				.ledger
				.fetch_page(page, self.page_size, SortDirection::Ascending)
				.await?;

			debug!(
				"{} ledger page {}: {} items",
				self.address,
				page,
				result.items.len()
			);

			let short = (result.items.len() as u32) < self.page_size;
			let mut oldest = u64::MAX;

			for item in result.items {
				oldest = oldest.min(item.height);

				let Some(kind) = TxKind::from_ledger_type(&item.tx_type) else {
					continue;
				};
				if item.height <= cursor.last_height {
					continue;
				}
				collected.push(self.ledger_transaction(item, kind));
			}

			terminal = short || oldest <= cursor.last_height;
			last_fetched = page;

			if terminal {
				break;
			}
			page += 1;
		}

		// The terminal page is re-examined next round: a full or partial page
		// may still grow unseen items.
		let next_page = if terminal {
			last_fetched
		} else {
			last_fetched + 1
		};

		Ok((collected, next_page))
	}

	/// The rewards ledger does not filter by height, so already-stored claims
	/// must be dropped against the watermark here.
	async fn fetch_rewards(&self, watermark: u64) -> Result<Vec<NodeTransaction>, ApiError> {
		let chains = self.rewards.fetch_all().await?;
		let mut collected = Vec::new();

		for chain in chains {
			let chain_name = self.chain_name(Some(&chain.chain_id));

			for tx in chain.transactions {
				if tx.height <= watermark {
					continue;
				}

				collected.push(NodeTransaction {
					wallet: self.address.clone(),
					hash: tx.hash,
					kind: TxKind::Claim,
					chain_id: chain_name.clone(),
					height: tx.height,
					time: tx.time,
					amount: tx.num_relays * tx.pokt_per_relay,
					memo: String::new(),
					confirmed: tx.is_confirmed,
					staking: false,
					price: None,
					amount_price: None,
				});
			}
		}

		Ok(collected)
	}

	fn ledger_transaction(&self, item: LedgerTxItem, kind: TxKind) -> NodeTransaction {
		NodeTransaction {
			wallet: self.address.clone(),
			hash: item.hash,
			kind,
			chain_id: self.chain_name(item.chain.as_deref()),
			height: item.height,
			time: item.block_time,
			amount: upokt_to_pokt(item.amount),
			memo: item.memo.unwrap_or_default(),
			confirmed: true,
			staking: false,
			price: None,
			amount_price: None,
		}
	}

	fn chain_name(&self, raw: Option<&str>) -> String {
		raw.and_then(|id| self.chain_ids.get(id))
			.cloned()
			.unwrap_or_default()
	}
}

/// Forward-fill the staking status over a height-ordered batch.
///
/// `stake_start` turns the status on for that record and the following ones,
/// `stake_end` turns it off; records before the first boundary inherit
/// `previous`. Returns the status after the last record.
fn apply_staking_status(batch: &mut [NodeTransaction], previous: bool) -> bool {
	let mut staking = previous;

	for tx in batch.iter_mut() {
		match tx.kind {
			TxKind::StakeStart => staking = true,
			TxKind::StakeEnd => staking = false,
			_ => {}
		}
		tx.staking = staking;
	}

	staking
}

impl<L, R> TransactionBatchSource for TransactionsFeed<L, R>
where
	L: PaginatedSource<Item = LedgerTxItem>,
	R: RewardsSource,
{
	fn address(&self) -> &str {
		&self.address
	}

	fn snapshot(&self) -> (Vec<NodeTransaction>, TransactionCursor) {
		let state = self.state.lock().unwrap();
		(state.batch.clone(), state.cursor)
	}

	fn rollback(&self, height: u64) {
		let mut state = self.state.lock().unwrap();
		state.cursor.last_height = height;
		state.cursor.current_page = state.prior_page;
		state.batch.clear();
		info!(
			"{} rolled back to height {}, page {}",
			self.address, height, state.prior_page
		);
	}
}

#[async_trait::async_trait]
impl<L, R> Pollable for TransactionsFeed<L, R>
where
	L: PaginatedSource<Item = LedgerTxItem> + 'static,
	R: RewardsSource + 'static,
{
	fn name(&self) -> String {
		format!("transactions/{}", self.address)
	}

	async fn update(&self) -> Result<Vec<SourceOutcome>, SyncError> {
		TransactionsFeed::update(self).await?;
		Ok(Vec::new())
	}
}
