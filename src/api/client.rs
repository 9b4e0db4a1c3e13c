//!
//! HTTP clients for the remote ledgers and the price API.
//!
//! The explorer exposes the transaction and error ledgers over GraphQL; the
//! rewards and price endpoints are plain REST. Every remote call is wrapped in
//! two stacked retry policies: one for transport failures and one for
//! lookup failures (non-2xx status, GraphQL-level errors).

use super::retry::RetryPolicy;
use super::types::*;
use super::{PaginatedSource, PriceSource, RewardsSource};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

fn network_policy() -> RetryPolicy<ApiError> {
	RetryPolicy::new(RETRY_ATTEMPTS, RETRY_INTERVAL).retry_on(ApiError::is_transient)
}

fn lookup_policy() -> RetryPolicy<ApiError> {
	RetryPolicy::new(RETRY_ATTEMPTS, RETRY_INTERVAL).retry_on(ApiError::is_lookup)
}

/// Shared GraphQL transport for the explorer endpoints.
#[derive(Clone)]
pub struct GraphQlClient {
	http: Client,
	url: String,
	network_policy: RetryPolicy<ApiError>,
	lookup_policy: RetryPolicy<ApiError>,
}

impl GraphQlClient {
	pub fn new(url: String) -> Self {
		let http = Client::builder()
			.timeout(HTTP_TIMEOUT)
			.build()
			.expect("Failed to create HTTP client");

		Self {
			http,
			url,
			network_policy: network_policy(),
			lookup_policy: lookup_policy(),
		}
	}

	/// Execute a GraphQL operation, retrying transport and lookup failures
	/// independently.
	pub async fn execute(
		&self,
		operation: &str,
		body: serde_json::Value,
	) -> Result<serde_json::Value, ApiError> {
		self.network_policy
			.run(operation, || {
				self.lookup_policy.run(operation, || async {
					let response = self.http.post(&self.url).json(&body).send().await?;

					let status = response.status();
					if !status.is_success() {
						return Err(ApiError::Status(status.as_u16()));
					}

					let payload: serde_json::Value = response.json().await?;

					if let Some(errors) = payload.get("errors") {
						return Err(ApiError::GraphQl(errors.to_string()));
					}

					Ok(payload)
				})
			})
			.await
	}
}

const TRANSACTIONS_QUERY: &str = r#"
query getTransactions($page: Int!, $limit: Int!, $addresses: [String!]!, $sort: [SortInput]) {
  getTransactions(page: $page, limit: $limit, addresses: $addresses, sort: $sort) {
	items {
	  hash
	  type
	  chain
	  height
	  amount
	  memo
	  block_time
	}
	pageInfo {
	  page
	  limit
	  total
	}
  }
}
"#;

const NODE_ERRORS_QUERY: &str = r#"
query getNodeErrors($page: Int!, $limit: Int!, $addresses: [String!]!, $sort: [SortInput]) {
  getNodeErrors(page: $page, limit: $limit, addresses: $addresses, sort: $sort) {
	items {
	  address
	  service_url
	  message
	  timestamp
	  blockchain
	}
	pageInfo {
	  page
	  limit
	  total
	}
  }
}
"#;

/// Paginated view over one node's generic transaction ledger.
pub struct TransactionLedger {
	client: GraphQlClient,
	address: String,
}

impl TransactionLedger {
	pub fn new(client: GraphQlClient, address: String) -> Self {
		Self { client, address }
	}
}

#[async_trait::async_trait]
impl PaginatedSource for TransactionLedger {
	type Item = LedgerTxItem;

	async fn fetch_page(
		&self,
		page: u32,
		limit: u32,
		direction: SortDirection,
	) -> Result<Page<LedgerTxItem>, ApiError> {
		let body = json!({
			"operationName": "getTransactions",
			"variables": {
				"addresses": [self.address],
				"page": page,
				"limit": limit,
				"sort": [{ "property": "height", "direction": direction.as_i32() }],
			},
			"query": TRANSACTIONS_QUERY,
		});

		let payload = self.client.execute("getTransactions", body).await?;
		let result = payload
			.pointer("/data/getTransactions")
			.ok_or(ApiError::MissingField("data.getTransactions"))?;

		let items = result
			.get("items")
			.ok_or(ApiError::MissingField("items"))?
			.clone();
		let items: Vec<LedgerTxItem> = serde_json::from_value(items)?;
		let total = result
			.pointer("/pageInfo/total")
			.and_then(serde_json::Value::as_u64)
			.unwrap_or(0);

		debug!(
			"{} transactions page {}: {} items retrieved",
			self.address,
			page,
			items.len()
		);

		Ok(Page { items, total })
	}
}

/// Paginated view over one node's relay error ledger.
pub struct ErrorLedger {
	client: GraphQlClient,
	address: String,
}

impl ErrorLedger {
	pub fn new(client: GraphQlClient, address: String) -> Self {
		Self { client, address }
	}
}

#[async_trait::async_trait]
impl PaginatedSource for ErrorLedger {
	type Item = LedgerErrorItem;

	async fn fetch_page(
		&self,
		page: u32,
		limit: u32,
		direction: SortDirection,
	) -> Result<Page<LedgerErrorItem>, ApiError> {
		let body = json!({
			"operationName": "getNodeErrors",
			"variables": {
				"addresses": [self.address],
				"page": page,
				"limit": limit,
				"sort": [{ "property": "timestamp", "direction": direction.as_i32() }],
			},
			"query": NODE_ERRORS_QUERY,
		});

		let payload = self.client.execute("getNodeErrors", body).await?;
		let result = payload
			.pointer("/data/getNodeErrors")
			.ok_or(ApiError::MissingField("data.getNodeErrors"))?;

		let items = result
			.get("items")
			.ok_or(ApiError::MissingField("items"))?
			.clone();
		let items: Vec<LedgerErrorItem> = serde_json::from_value(items)?;
		let total = result
			.pointer("/pageInfo/total")
			.and_then(serde_json::Value::as_u64)
			.unwrap_or(0);

		debug!(
			"{} errors page {}: {} items retrieved",
			self.address,
			page,
			items.len()
		);

		Ok(Page { items, total })
	}
}

/// Client for the unpaginated rewards endpoint of a single node.
pub struct RewardsClient {
	http: Client,
	/// Fully formatted URL, node address already substituted.
	url: String,
	network_policy: RetryPolicy<ApiError>,
	lookup_policy: RetryPolicy<ApiError>,
}

impl RewardsClient {
	pub fn new(url: String) -> Self {
		let http = Client::builder()
			.timeout(HTTP_TIMEOUT)
			.build()
			.expect("Failed to create HTTP client");

		Self {
			http,
			url,
			network_policy: network_policy(),
			lookup_policy: lookup_policy(),
		}
	}
}

#[async_trait::async_trait]
impl RewardsSource for RewardsClient {
	async fn fetch_all(&self) -> Result<Vec<RewardChain>, ApiError> {
		let response: RewardsResponse = self
			.network_policy
			.run("rewards", || {
				self.lookup_policy.run("rewards", || async {
					let response = self.http.get(&self.url).send().await?;

					let status = response.status();
					if !status.is_success() {
						return Err(ApiError::Status(status.as_u16()));
					}

					Ok(response.json().await?)
				})
			})
			.await?;

		Ok(response.data)
	}
}

/// Client for the market-chart range endpoint of the price API.
pub struct PriceClient {
	http: Client,
	/// URL template with `{cryptocurrency}`, `{currency}`, `{start}` and
	/// `{end}` placeholders; the range bounds are epoch seconds.
	url_template: String,
	cryptocurrency: String,
	currency: String,
	network_policy: RetryPolicy<ApiError>,
	lookup_policy: RetryPolicy<ApiError>,
}

impl PriceClient {
	pub fn new(url_template: String, cryptocurrency: String, currency: String) -> Self {
		let http = Client::builder()
			.timeout(HTTP_TIMEOUT)
			.build()
			.expect("Failed to create HTTP client");

		Self {
			http,
			url_template,
			cryptocurrency,
			currency,
			network_policy: network_policy(),
			lookup_policy: lookup_policy(),
		}
	}

	fn range_url(&self, start_ms: i64, end_ms: i64) -> String {
		self.url_template
			.replace("{cryptocurrency}", &self.cryptocurrency)
			.replace("{currency}", &self.currency)
			.replace("{start}", &(start_ms / 1000).to_string())
			.replace("{end}", &(end_ms / 1000).to_string())
	}
}

#[async_trait::async_trait]
impl PriceSource for PriceClient {
	async fn fetch_range(
		&self,
		start_ms: i64,
		end_ms: i64,
	) -> Result<Vec<crate::feed::types::PricePoint>, ApiError> {
		let url = self.range_url(start_ms, end_ms);
		debug!("Requesting prices from url {}", url);

		let chart: RawMarketChart = self
			.network_policy
			.run("prices", || {
				self.lookup_policy.run("prices", || async {
					let response = self.http.get(&url).send().await?;

					let status = response.status();
					if !status.is_success() {
						return Err(ApiError::Status(status.as_u16()));
					}

					Ok(response.json().await?)
				})
			})
			.await?;

		// The three arrays are aligned by index; market caps and volumes may
		// be shorter when the remote has gaps.
		let points = chart
			.prices
			.iter()
			.enumerate()
			.map(|(i, (ts, price))| crate::feed::types::PricePoint {
				timestamp_ms: *ts as i64,
				price: *price,
				market_cap: chart.market_caps.get(i).map(|(_, v)| *v).unwrap_or(0.0),
				volume: chart.total_volumes.get(i).map(|(_, v)| *v).unwrap_or(0.0),
			})
			.collect();

		Ok(points)
	}
}
