//!
//! Formatting helpers shared across feeds, the engine and notifications.

use chrono::{DateTime, Utc};

/// Ledger amounts arrive in micro-units (uPOKT).
pub const UPOKT_PER_POKT: f64 = 1_000_000.0;

/// Convert a micro-unit ledger amount into whole tokens.
pub fn upokt_to_pokt(amount: f64) -> f64 {
	amount / UPOKT_PER_POKT
}

/// Format a timestamp the way notification messages display dates.
pub fn format_date(time: DateTime<Utc>) -> String {
	time.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_upokt_conversion() {
		assert_eq!(upokt_to_pokt(119_736_200.0), 119.7362);
	}

	#[test]
	fn test_format_date() {
		let time = DateTime::from_timestamp(1_644_640_146, 0).expect("valid timestamp");
		assert_eq!(format_date(time), "2022-02-12 04:29:06");
	}
}
