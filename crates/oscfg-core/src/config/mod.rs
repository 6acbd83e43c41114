//! Agent configuration from host metadata.
//!
//! The agent carries no local config file. Feature flags and identity come
//! from the instance metadata server, long-polled with wait-for-change
//! semantics and an etag. [`ConfigWatcher`] keeps the last good snapshot in
//! a `tokio::sync::watch` channel; subscribers read the current value and
//! wake on change events.
//!
//! The initial fetch is blocking and must succeed before the agent
//! considers itself started; a permanent failure there is fatal. Later
//! transport errors retry on capped exponential backoff while the last good
//! snapshot stays published.

mod metadata;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, BackoffConfig};

pub use metadata::{HttpMetadataClient, MetadataClient, MetadataResponse, DEFAULT_METADATA_URL};

/// Floor for the service poll interval; values below are clamped up.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Immutable settings snapshot.
///
/// One snapshot is passed at each decision point; components never read
/// global mutable config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Whether the task-notification stream should be open.
    #[serde(default)]
    pub task_notification_enabled: bool,

    /// Whether the legacy guest-policies run executes on the periodic tick.
    #[serde(default)]
    pub guest_policies_enabled: bool,

    /// Whether inventory reports are uploaded on the periodic tick.
    #[serde(default)]
    pub os_inventory_enabled: bool,

    /// Debug logging toggle; applied live, no restart.
    #[serde(default)]
    pub debug: bool,

    /// Interval between periodic service ticks.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub svc_poll_interval: Duration,

    /// Cloud project this instance reports under.
    #[serde(default)]
    pub project_id: String,

    /// Instance name.
    #[serde(default)]
    pub instance_name: String,

    /// Numeric instance id as a string.
    #[serde(default)]
    pub instance_id: String,

    /// Zone the instance runs in.
    #[serde(default)]
    pub zone: String,

    /// Suppress the local log sink.
    #[serde(default)]
    pub disable_local_logging: bool,

    /// Suppress the cloud log sink.
    #[serde(default)]
    pub disable_cloud_logging: bool,
}

const fn default_poll_interval() -> Duration {
    MIN_POLL_INTERVAL
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            task_notification_enabled: false,
            guest_policies_enabled: false,
            os_inventory_enabled: false,
            debug: false,
            svc_poll_interval: default_poll_interval(),
            project_id: String::new(),
            instance_name: String::new(),
            instance_id: String::new(),
            zone: String::new(),
            disable_local_logging: false,
            disable_cloud_logging: false,
        }
    }
}

impl AgentSettings {
    /// Poll interval with the floor applied.
    #[must_use]
    pub fn effective_poll_interval(&self) -> Duration {
        self.svc_poll_interval.max(MIN_POLL_INTERVAL)
    }
}

/// Errors from the metadata transport or the initial fetch.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The metadata endpoint could not be reached or answered non-success.
    #[error("metadata request failed: {0}")]
    Transport(String),

    /// The metadata document did not parse.
    #[error("metadata parse failed: {0}")]
    Parse(String),

    /// The watcher was cancelled before the initial snapshot arrived.
    #[error("cancelled before first config snapshot")]
    Cancelled,
}

/// Long-poll config watcher.
pub struct ConfigWatcher {
    client: Arc<dyn MetadataClient>,
    tx: watch::Sender<AgentSettings>,
    etag: Option<String>,
    backoff_config: BackoffConfig,
}

impl ConfigWatcher {
    /// Perform the blocking initial fetch and return the watcher plus a
    /// subscription carrying the first snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the initial fetch failure; the caller treats it as fatal.
    pub async fn start(
        client: Arc<dyn MetadataClient>,
    ) -> Result<(Self, watch::Receiver<AgentSettings>), ConfigError> {
        let initial = client.fetch(None, false).await?;
        tracing::info!(
            instance = %initial.settings.instance_name,
            project = %initial.settings.project_id,
            "initial config snapshot loaded"
        );

        let (tx, rx) = watch::channel(initial.settings);
        Ok((
            Self {
                client,
                tx,
                etag: Some(initial.etag),
                backoff_config: BackoffConfig {
                    initial_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(120),
                    multiplier: 2.0,
                },
            },
            rx,
        ))
    }

    /// Long-poll until cancelled, publishing snapshots on change.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.backoff_config.clone());
        loop {
            let fetch = self.client.fetch(self.etag.as_deref(), true);
            let response = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("config watcher stopping");
                    return;
                }
                response = fetch => response,
            };

            match response {
                Ok(response) => {
                    backoff.reset();
                    self.etag = Some(response.etag);
                    // send_if_modified keeps spurious wakeups off subscribers
                    // when the long poll returns an unchanged document.
                    self.tx.send_if_modified(|current| {
                        if *current == response.settings {
                            false
                        } else {
                            *current = response.settings.clone();
                            true
                        }
                    });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in = ?delay, "metadata watch failed");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Current snapshot (the last good one).
    #[must_use]
    pub fn snapshot(&self) -> AgentSettings {
        self.tx.borrow().clone()
    }

    /// New subscription to change events.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AgentSettings> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<MetadataResponse, ConfigError>>>,
    }

    #[async_trait]
    impl MetadataClient for ScriptedClient {
        async fn fetch(
            &self,
            _last_etag: Option<&str>,
            _wait: bool,
        ) -> Result<MetadataResponse, ConfigError> {
            let next = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    None
                } else {
                    Some(responses.remove(0))
                }
            };
            match next {
                Some(result) => result,
                None => {
                    // Park forever once the script is exhausted.
                    std::future::pending::<()>().await;
                    unreachable!();
                }
            }
        }
    }

    fn response(task_notification: bool, etag: &str) -> MetadataResponse {
        MetadataResponse {
            settings: AgentSettings {
                task_notification_enabled: task_notification,
                ..AgentSettings::default()
            },
            etag: etag.to_string(),
        }
    }

    #[tokio::test]
    async fn test_initial_fetch_blocking_success() {
        let client = Arc::new(ScriptedClient {
            responses: Mutex::new(vec![Ok(response(true, "e1"))]),
        });
        let (watcher, rx) = ConfigWatcher::start(client).await.unwrap();
        assert!(rx.borrow().task_notification_enabled);
        assert!(watcher.snapshot().task_notification_enabled);
    }

    #[tokio::test]
    async fn test_initial_fetch_failure_is_fatal() {
        let client = Arc::new(ScriptedClient {
            responses: Mutex::new(vec![Err(ConfigError::Transport("down".into()))]),
        });
        assert!(ConfigWatcher::start(client).await.is_err());
    }

    #[tokio::test]
    async fn test_change_events_published() {
        let client = Arc::new(ScriptedClient {
            responses: Mutex::new(vec![
                Ok(response(false, "e1")),
                Ok(response(true, "e2")),
            ]),
        });
        let (watcher, mut rx) = ConfigWatcher::start(client).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().task_notification_enabled);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_last_good_snapshot_survives_errors() {
        let client = Arc::new(ScriptedClient {
            responses: Mutex::new(vec![
                Ok(response(true, "e1")),
                Err(ConfigError::Transport("blip".into())),
            ]),
        });
        let (watcher, rx) = ConfigWatcher::start(client).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.borrow().task_notification_enabled);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_poll_interval_floor() {
        let settings = AgentSettings {
            svc_poll_interval: Duration::from_secs(5),
            ..AgentSettings::default()
        };
        assert_eq!(settings.effective_poll_interval(), MIN_POLL_INTERVAL);
    }
}
