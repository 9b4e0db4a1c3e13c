mod api;
mod config;
mod engine;
mod feed;
mod notify;
mod scheduler;
mod storage;
mod utils;

use crate::api::client::{ErrorLedger, GraphQlClient, PriceClient, RewardsClient, TransactionLedger};
use crate::config::Config;
use crate::engine::{ReconciliationEngine, StoreErrors, StorePrices, StoreTransactions};
use crate::feed::{ErrorBatchSource, ErrorsFeed, PriceFeed, TransactionBatchSource, TransactionsFeed};
use crate::notify::LogNotificationSink;
use crate::scheduler::{Pollable, Scheduler};
use crate::storage::RelayStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting pocket node sync service");

	let config = match Config::load() {
		Ok(config) => config,
		Err(e) => {
			error!("Failed to load configuration: {}", e);
			return;
		}
	};

	if config.server.nodes.is_empty() {
		error!("No node addresses configured, nothing to track");
		return;
	}

	let store = match RelayStore::open(config.storage.path.clone(), &config.price.currency).await {
		Ok(store) => Arc::new(store),
		Err(e) => {
			error!("Failed to open the store: {}", e);
			return;
		}
	};

	let graphql = GraphQlClient::new(config.server.graphql_url.clone());
	let delay = Duration::from_secs(config.scheduler.delay_secs);
	let pool_size = config.scheduler.pool_size;

	// One transactions feed and one errors feed per tracked node, each
	// resumed from its persisted cursor.
	let tx_scheduler = Scheduler::new("nodes_transactions", pool_size, delay);
	let err_scheduler = Scheduler::new("nodes_errors", pool_size, delay);
	let mut tx_feeds: Vec<Arc<dyn TransactionBatchSource>> = Vec::new();
	let mut err_feeds: Vec<Arc<dyn ErrorBatchSource>> = Vec::new();

	for address in &config.server.nodes {
		let cursor = engine::load_transaction_cursor(&store, address).await;
		let feed = Arc::new(TransactionsFeed::new(
			address.clone(),
			TransactionLedger::new(graphql.clone(), address.clone()),
			RewardsClient::new(config.server.rewards_url.replace("{address}", address)),
			config.server.chain_ids.clone(),
			config.server.page_size,
			config.server.max_page_count,
			cursor,
		));
		tx_scheduler.add_source(feed.clone());
		tx_feeds.push(feed);

		let watermark =
			engine::load_error_watermark(&store, address, config.errors.max_age_hours).await;
		let feed = Arc::new(ErrorsFeed::new(
			address.clone(),
			ErrorLedger::new(graphql.clone(), address.clone()),
			config.server.chain_ids.clone(),
			config.server.page_size,
			config.server.max_page_count,
			watermark,
		));
		err_scheduler.add_source(feed.clone());
		err_feeds.push(feed);
	}

	let (price_start_ms, price_series) = engine::load_price_series(&store).await;
	let price_feed = Arc::new(PriceFeed::new(
		PriceClient::new(
			config.price.url.clone(),
			config.price.cryptocurrency.clone(),
			config.price.currency.clone(),
		),
		price_start_ms,
		price_series,
	));

	let engine = Arc::new(ReconciliationEngine::new(
		Arc::clone(&store),
		Arc::new(LogNotificationSink),
		config.errors.rules.clone(),
		config.errors.max_age_hours,
	));

	// The main scheduler drives one round: poll every nested source, then
	// commit prices first so transaction pricing sees the fresh series.
	let main_scheduler = Scheduler::new("main", pool_size, delay);
	main_scheduler.add_source(Arc::new(tx_scheduler) as Arc<dyn Pollable>);
	main_scheduler.add_source(Arc::new(err_scheduler) as Arc<dyn Pollable>);
	main_scheduler.add_source(price_feed.clone() as Arc<dyn Pollable>);

	main_scheduler.add_callback(Arc::new(StorePrices {
		engine: Arc::clone(&engine),
		source: price_feed,
	}));
	main_scheduler.add_callback(Arc::new(StoreTransactions {
		engine: Arc::clone(&engine),
		feeds: tx_feeds,
	}));
	main_scheduler.add_callback(Arc::new(StoreErrors {
		engine: Arc::clone(&engine),
		feeds: err_feeds,
	}));

	let main_scheduler = Arc::new(main_scheduler);
	main_scheduler.start(true);

	info!(
		"Tracking {} nodes, polling every {}s",
		config.server.nodes.len(),
		config.scheduler.delay_secs
	);

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for shutdown signal: {}", e);
	}

	info!("Shutting down...");
	main_scheduler.stop().await;
}
