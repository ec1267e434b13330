//! Polling-based live delivery
//!
//! Alternate transport strategy: instead of in-process fan-out, a
//! per-connection task polls the durable log at a fixed interval and forwards
//! everything past a high-water-mark cursor. Useful when producers and
//! consumers live in different processes sharing only the KV store. Delivery
//! semantics match the push path.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{LogFamily, SessionKey};
use crate::kv::KvStore;
use crate::log::DurableLog;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Per-family replay cursors (last forwarded event id)
#[derive(Debug, Default, Clone)]
pub(crate) struct PollCursors {
    pub message: Option<String>,
    pub chart: Option<String>,
}

impl PollCursors {
    fn get(&self, family: LogFamily) -> Option<&str> {
        match family {
            LogFamily::Message => self.message.as_deref(),
            LogFamily::Chart => self.chart.as_deref(),
        }
    }

    fn set(&mut self, family: LogFamily, id: String) {
        match family {
            LogFamily::Message => self.message = Some(id),
            LogFamily::Chart => self.chart = Some(id),
        }
    }
}

/// Run the poll loop until cancelled or the consumer goes away.
///
/// Each tick reads both family logs past the cursors and forwards new events
/// in stored order. Storage failures are logged and retried on the next tick;
/// they never tear down the connection.
pub(crate) async fn run_poller<S: KvStore>(
    log: DurableLog<S>,
    session: SessionKey,
    interval: Duration,
    mut cursors: PollCursors,
    tx: mpsc::Sender<crate::event::Event>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session = ?session.as_option(), "Poller cancelled");
                return;
            }
            _ = ticker.tick() => {
                for family in [LogFamily::Message, LogFamily::Chart] {
                    let batch = match log.events_after(family, &session, cursors.get(family)).await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(session = ?session.as_option(), error = %e, "Poll read failed, will retry");
                            continue;
                        }
                    };
                    for event in batch {
                        let id = event.id.clone();
                        if tx.send(event).await.is_err() {
                            // Consumer dropped its stream
                            return;
                        }
                        cursors.set(family, id);
                    }
                }
            }
        }
    }
}
