//!
//! Round-based polling scheduler.
//!
//! A scheduler owns a set of pollable sources and drives them in rounds: all
//! sources of a round are polled concurrently (bounded by the pool size), the
//! round waits for every one of them to settle, and only then the registered
//! callbacks run sequentially over the outcomes. A failing source never
//! aborts the round; its error is surfaced to the callbacks instead.
//!
//! Schedulers nest: a scheduler is itself `Pollable`, where one update is one
//! round with no sleep in between. The top-level scheduler owns the delay and
//! the manual trigger.

use crate::api::types::ApiError;
use crate::storage::StoreError;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("api error: {0}")]
	Api(#[from] ApiError),

	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("round error: {0}")]
	Round(String),
}

/// Anything the scheduler can poll once per round.
///
/// A successful update returns the outcomes of any nested sources, so a
/// failure deep inside a group stays visible to the enclosing round's
/// callbacks. Leaf sources return an empty list.
#[async_trait::async_trait]
pub trait Pollable: Send + Sync {
	fn name(&self) -> String;

	async fn update(&self) -> Result<Vec<SourceOutcome>, SyncError>;
}

/// Result of polling one source during a round.
pub struct SourceOutcome {
	pub name: String,
	pub result: Result<(), SyncError>,
}

/// Runs after every round, over the settled outcomes of all sources.
#[async_trait::async_trait]
pub trait RoundCallback: Send + Sync {
	fn name(&self) -> String;

	async fn on_round(&self, outcomes: &[SourceOutcome]) -> Result<(), SyncError>;
}

pub struct Scheduler {
	name: String,
	sources: std::sync::Mutex<Vec<Arc<dyn Pollable>>>,
	callbacks: std::sync::Mutex<Vec<Arc<dyn RoundCallback>>>,
	pool_size: usize,
	delay: Duration,
	trigger: Arc<Notify>,
	shutdown: watch::Sender<bool>,
	handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
	pub fn new(name: impl Into<String>, pool_size: usize, delay: Duration) -> Self {
		let (shutdown, _) = watch::channel(false);

		Self {
			name: name.into(),
			sources: std::sync::Mutex::new(Vec::new()),
			callbacks: std::sync::Mutex::new(Vec::new()),
			pool_size: pool_size.max(1),
			delay,
			trigger: Arc::new(Notify::new()),
			shutdown,
			handle: std::sync::Mutex::new(None),
		}
	}

	/// Safe to call while a round is running; the source joins the next round.
	pub fn add_source(&self, source: Arc<dyn Pollable>) {
		self.sources.lock().unwrap().push(source);
	}

	/// Remove a source by name. Safe to call while a round is running; a
	/// source already snapshotted into the in-flight round still finishes it.
	pub fn remove_source(&self, name: &str) {
		self.sources.lock().unwrap().retain(|source| source.name() != name);
	}

	pub fn add_callback(&self, callback: Arc<dyn RoundCallback>) {
		self.callbacks.lock().unwrap().push(callback);
	}

	/// Poll every source concurrently, wait for all of them, then run the
	/// callbacks in registration order over the flattened outcomes.
	pub async fn run_round(&self) -> Vec<SourceOutcome> {
		// The round operates on a snapshot of the registrations.
		let sources = self.sources.lock().unwrap().clone();
		let callbacks = self.callbacks.lock().unwrap().clone();

		debug!("[{}] round started ({} sources)", self.name, sources.len());

		let polls: Vec<BoxFuture<'static, Vec<SourceOutcome>>> = sources
			.into_iter()
			.map(|source| {
				Box::pin(async move {
					let name = source.name();
					match source.update().await {
						Ok(children) => {
							let mut outcomes = vec![SourceOutcome {
								name,
								result: Ok(()),
							}];
							outcomes.extend(children);
							outcomes
						}
						Err(err) => {
							warn!("[{}] update failed: {}", name, err);
							vec![SourceOutcome {
								name,
								result: Err(err),
							}]
						}
					}
				}) as BoxFuture<'static, Vec<SourceOutcome>>
			})
			.collect();

		let outcomes: Vec<SourceOutcome> = stream::iter(polls)
			.buffer_unordered(self.pool_size)
			.collect::<Vec<Vec<SourceOutcome>>>()
			.await
			.into_iter()
			.flatten()
			.collect();

		let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
		if failed > 0 {
			warn!(
				"[{}] round finished with {}/{} sources failed",
				self.name,
				failed,
				outcomes.len()
			);
		}

		for callback in &callbacks {
			if let Err(err) = callback.on_round(&outcomes).await {
				error!("[{}] callback {} failed: {}", self.name, callback.name(), err);
			}
		}

		outcomes
	}

	/// Spawn the polling loop. With `immediate` the first round runs right
	/// away, otherwise after the first delay.
	pub fn start(self: &Arc<Self>, immediate: bool) {
		let scheduler = Arc::clone(self);
		let mut shutdown = self.shutdown.subscribe();

		let handle = tokio::spawn(async move {
			info!("[{}] scheduler started", scheduler.name);

			if immediate {
				scheduler.run_round().await;
			}

			loop {
				tokio::select! {
					_ = tokio::time::sleep(scheduler.delay) => {}
					_ = scheduler.trigger.notified() => {
						info!("[{}] manual update triggered", scheduler.name);
					}
					_ = shutdown.changed() => {
						if *shutdown.borrow() {
							info!("[{}] scheduler stopped", scheduler.name);
							return;
						}
					}
				}

				scheduler.run_round().await;
			}
		});

		*self.handle.lock().unwrap() = Some(handle);
	}

	/// Wake the loop for an immediate round without waiting out the delay.
	pub fn trigger_update(&self) {
		self.trigger.notify_one();
	}

	/// Signal the loop to exit and wait for the in-flight round to finish.
	pub async fn stop(&self) {
		let _ = self.shutdown.send(true);

		let handle = self.handle.lock().unwrap().take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}
}

// A nested scheduler is a source of its parent: one update, one round. Its
// per-source outcomes flow back so the parent's callbacks see every leaf.
#[async_trait::async_trait]
impl Pollable for Scheduler {
	fn name(&self) -> String {
		self.name.clone()
	}

	async fn update(&self) -> Result<Vec<SourceOutcome>, SyncError> {
		Ok(self.run_round().await)
	}
}
