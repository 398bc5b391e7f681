use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RefreshConfig;
use crate::error::FeedError;
use crate::feed::PostFeed;

#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    pub interval: Duration,
    pub scopes: Vec<String>,
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        RefreshConfig::default().into()
    }
}

impl From<RefreshConfig> for RefreshSchedule {
    fn from(config: RefreshConfig) -> Self {
        Self {
            interval: config.interval(),
            scopes: config.scopes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    Refreshed { scope: String, posts: usize },
    Failed { scope: String, error: String },
}

pub struct RefresherHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl RefresherHandle {
    pub async fn stop(self) -> Result<(), FeedError> {
        let _ = self.cancel_tx.send(());
        self.join.await.map_err(FeedError::from)
    }
}

/// Refreshes every scope once, in order. Failures are logged and reported as
/// events; they do not stop the round.
pub async fn refresh_once(feed: &PostFeed, scopes: &[String]) -> Vec<RefreshEvent> {
    let mut events = Vec::with_capacity(scopes.len());
    for scope in scopes {
        match feed.refresh(scope).await {
            Ok(()) => events.push(RefreshEvent::Refreshed {
                scope: scope.clone(),
                posts: feed.current(scope).len(),
            }),
            Err(err) => {
                warn!(scope = %scope, error = %err, "refresh failed");
                events.push(RefreshEvent::Failed {
                    scope: scope.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    events
}

/// Refreshes the scheduled scopes on every tick until stopped. The first tick
/// fires immediately.
pub fn spawn_refresher(
    feed: Arc<PostFeed>,
    schedule: RefreshSchedule,
    events_tx: Option<mpsc::Sender<RefreshEvent>>,
) -> RefresherHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(schedule.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("refresher shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    for event in refresh_once(&feed, &schedule.scopes).await {
                        if let Some(tx) = &events_tx {
                            if tx.send(event).await.is_err() {
                                warn!("refresh event receiver dropped");
                            }
                        }
                    }
                }
            }
        }
    });

    RefresherHandle { cancel_tx, join }
}
