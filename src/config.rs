//!
//! Runtime configuration.
//!
//! Loaded from a JSON file whose path comes from `POCKET_SYNC_CONFIG`
//! (default `config.json`). Every section has defaults so a minimal file
//! only needs the node addresses.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	Parse {
		path: PathBuf,
		source: serde_json::Error,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub server: ServerConfig,
	pub price: PriceConfig,
	pub storage: StorageConfig,
	pub scheduler: SchedulerConfig,
	pub errors: ErrorsConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			server: ServerConfig::default(),
			price: PriceConfig::default(),
			storage: StorageConfig::default(),
			scheduler: SchedulerConfig::default(),
			errors: ErrorsConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	/// GraphQL endpoint of the transaction/error ledger.
	pub graphql_url: String,
	/// REST endpoint template for per-node rewards, `{address}` placeholder.
	pub rewards_url: String,
	/// Node addresses to track.
	pub nodes: Vec<String>,
	/// Maps on-chain relay chain ids to display names.
	pub chain_ids: HashMap<String, String>,
	pub page_size: u32,
	pub max_page_count: u32,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			graphql_url: "https://api.pokt.network/graphql".to_string(),
			rewards_url: "https://api.pokt.network/node/{address}/rewards".to_string(),
			nodes: Vec::new(),
			chain_ids: HashMap::new(),
			page_size: 100,
			max_page_count: 50,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
	/// Range endpoint template with `{cryptocurrency}`, `{currency}`,
	/// `{start}` and `{end}` placeholders (epoch seconds).
	pub url: String,
	pub cryptocurrency: String,
	pub currency: String,
}

impl Default for PriceConfig {
	fn default() -> Self {
		Self {
			url: "https://api.coingecko.com/api/v3/coins/{cryptocurrency}/market_chart/range?vs_currency={currency}&from={start}&to={end}"
				.to_string(),
			cryptocurrency: "pocket-network".to_string(),
			currency: "usd".to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	pub path: PathBuf,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			path: PathBuf::from("relaydb.json"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
	/// Seconds between rounds.
	pub delay_secs: u64,
	/// Concurrent source updates per round.
	pub pool_size: usize,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			delay_secs: 900,
			pool_size: 2,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
	/// Ignore errors older than this many hours.
	pub max_age_hours: i64,
	pub rules: Vec<ErrorRule>,
}

impl Default for ErrorsConfig {
	fn default() -> Self {
		Self {
			max_age_hours: 24,
			rules: Vec::new(),
		}
	}
}

/// Turns matching relay errors into notifications.
///
/// `find` is a substring matched against the error message. The templates
/// accept `{wallet}`, `{message}`, `{chain}`, `{service_url}` and, for the
/// aggregated form, `{count}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRule {
	pub find: String,
	pub notify_single: String,
	pub notify_many: String,
}

impl Config {
	/// Load from the path named by `POCKET_SYNC_CONFIG`, or `config.json`.
	pub fn load() -> Result<Self, ConfigError> {
		let path = std::env::var("POCKET_SYNC_CONFIG")
			.map(PathBuf::from)
			.unwrap_or_else(|_| PathBuf::from("config.json"));
		Self::load_from(path)
	}

	pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
		let bytes = std::fs::read(&path).map_err(|source| ConfigError::Read {
			path: path.clone(),
			source,
		})?;
		serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse { path, source })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_minimal_config_uses_defaults() {
		let config: Config = serde_json::from_str(
			r#"{"server": {"nodes": ["node-1"]}}"#,
		)
		.expect("parse");

		assert_eq!(config.server.nodes, vec!["node-1".to_string()]);
		assert_eq!(config.server.page_size, 100);
		assert_eq!(config.price.currency, "usd");
		assert_eq!(config.scheduler.delay_secs, 900);
		assert_eq!(config.errors.max_age_hours, 24);
	}

	#[test]
	fn test_load_from_missing_file_is_an_error() {
		let result = Config::load_from(PathBuf::from("/nonexistent/config.json"));
		assert!(matches!(result, Err(ConfigError::Read { .. })));
	}

	#[test]
	fn test_error_rules_parse() {
		let config: Config = serde_json::from_str(
			r#"{
				"errors": {
					"max_age_hours": 12,
					"rules": [{
						"find": "ERROR EXECUTING SESSION",
						"notify_single": "{wallet} failed a session on {chain}",
						"notify_many": "{wallet} failed {count} sessions"
					}]
				}
			}"#,
		)
		.expect("parse");

		assert_eq!(config.errors.max_age_hours, 12);
		assert_eq!(config.errors.rules.len(), 1);
		assert_eq!(config.errors.rules[0].find, "ERROR EXECUTING SESSION");
	}
}
