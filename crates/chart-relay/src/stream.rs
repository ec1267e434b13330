//! Per-connection stream session
//!
//! Drives one outbound stream through `Connecting -> Replaying -> Live ->
//! Closed`: connection ack first, then the history snapshot tagged as
//! replay, then live fan-out interleaved with heartbeats. Dropping the
//! session (transport write failure or client disconnect) deterministically
//! deregisters it.

use futures::Stream;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::event::{Event, SessionKey};
use crate::registry::{SessionRegistry, SubscriberToken};

/// One frame on the wire: UTF-8 JSON, one frame per delivered item
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Sent synchronously before anything else so clients can distinguish
    /// "never connected" from "connected, no data yet"
    Connected { session: SessionKey },
    /// An event delivery; `is_history` appears only on replayed frames
    Event {
        #[serde(flatten)]
        event: Event,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_history: bool,
    },
    /// Periodic keep-alive against idle-connection timeouts
    Heartbeat { ts_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Replaying,
    Live,
    Closed,
}

/// A connected consumer's stream of frames.
///
/// Implements `Stream<Item = Frame>`; the transport layer encodes each frame
/// and stops polling on write failure, which drops the session and releases
/// its subscription and timers.
pub struct StreamSession {
    session: SessionKey,
    state: State,
    history: VecDeque<Event>,
    /// Ids already emitted as history; the matching live delivery of the
    /// same event is skipped once
    replayed: HashSet<String>,
    live: mpsc::Receiver<Event>,
    heartbeat: Interval,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    registry: SessionRegistry,
    /// Present for registry-backed sessions; polling sessions are cleaned up
    /// via the cancellation token alone
    token: Option<SubscriberToken>,
}

impl StreamSession {
    pub(crate) fn new(
        session: SessionKey,
        history: Vec<Event>,
        live: mpsc::Receiver<Event>,
        registry: SessionRegistry,
        token: Option<SubscriberToken>,
        heartbeat_period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        // interval() would tick immediately; the first heartbeat belongs one
        // full period after connect
        let heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Self {
            session,
            state: State::Connecting,
            history: history.into(),
            replayed: HashSet::new(),
            live,
            heartbeat,
            cancel,
            cancelled,
            registry,
            token,
        }
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    /// Token the transport can use to signal disconnect
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        if let Some(token) = self.token.take() {
            self.registry.unsubscribe(&token);
        }
        self.cancel.cancel();
        self.live.close();
    }
}

impl Stream for StreamSession {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let this = self.get_mut();
        loop {
            match this.state {
                State::Closed => return Poll::Ready(None),
                State::Connecting => {
                    this.state = State::Replaying;
                    return Poll::Ready(Some(Frame::Connected {
                        session: this.session.clone(),
                    }));
                }
                State::Replaying => match this.history.pop_front() {
                    Some(event) => {
                        this.replayed.insert(event.id.clone());
                        return Poll::Ready(Some(Frame::Event {
                            event,
                            is_history: true,
                        }));
                    }
                    None => {
                        this.state = State::Live;
                    }
                },
                State::Live => {
                    if this.cancelled.as_mut().poll(cx).is_ready() {
                        this.close();
                        return Poll::Ready(None);
                    }
                    match this.live.poll_recv(cx) {
                        Poll::Ready(Some(event)) => {
                            if this.replayed.remove(&event.id) {
                                // already delivered as history
                                continue;
                            }
                            return Poll::Ready(Some(Frame::Event {
                                event,
                                is_history: false,
                            }));
                        }
                        Poll::Ready(None) => {
                            this.close();
                            return Poll::Ready(None);
                        }
                        Poll::Pending => {}
                    }
                    if this.heartbeat.poll_tick(cx).is_ready() {
                        return Poll::Ready(Some(Frame::Heartbeat {
                            ts_ms: chrono::Utc::now().timestamp_millis(),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}
