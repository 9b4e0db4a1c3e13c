//!
//! Outbound notification seam.
//!
//! The engine emits human-readable messages (staking changes, relay error
//! alerts) through this trait. The default sink writes them to the log;
//! a chat transport slots in behind the same trait.

use tracing::info;

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
	async fn notify(&self, message: &str);
}

/// Emits notifications as log lines.
pub struct LogNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for LogNotificationSink {
	async fn notify(&self, message: &str) {
		info!("[notification] {}", message);
	}
}
