//! NDJSON encoding of a subscription.
//!
//! One line per event:
//!
//! ```text
//! {"event":"asset_update","sequence_token":"0:42","asset_uuid":"ASSET-42","id":"temp","timestamp":"...","data":{...}}
//! ```
//!
//! and `{"event":"keepalive"}` whenever the keepalive interval passes without
//! output, so dead connections surface as write errors.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::dispatcher::Subscription;
use crate::types::{Event, SequenceToken};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    AssetUpdate {
        sequence_token: SequenceToken,
        asset_uuid: &'a str,
        id: Option<&'a str>,
        timestamp: String,
        data: &'a serde_json::Value,
    },
    Keepalive,
}

fn encode(line: &Line<'_>) -> Bytes {
    // Serializing these borrowed shapes cannot fail.
    let mut buf = serde_json::to_vec(line).unwrap_or_default();
    buf.push(b'\n');
    Bytes::from(buf)
}

/// NDJSON line for one event.
pub fn event_line(event: &Event) -> Bytes {
    encode(&Line::AssetUpdate {
        sequence_token: event.sequence_token,
        asset_uuid: &event.entity_id,
        id: event.item_id.as_deref(),
        timestamp: event.timestamp.to_rfc3339(),
        data: &event.payload,
    })
}

pub fn keepalive_line() -> Bytes {
    encode(&Line::Keepalive)
}

struct StreamState {
    subscription: Subscription,
    keepalive: Interval,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
}

enum Next {
    Event(Bytes),
    Keepalive,
    Closed,
    Idle,
}

impl StreamState {
    async fn next(&mut self) -> Next {
        let deadline = self.idle_deadline;
        let idle = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            event = self.subscription.recv() => match event {
                Some(event) => Next::Event(event_line(&event)),
                None => Next::Closed,
            },
            _ = self.keepalive.tick() => Next::Keepalive,
            _ = idle => Next::Idle,
        }
    }
}

/// Body stream for a subscription.
///
/// Ends when the session is closed (Dispatcher shutdown) or, when
/// `idle_timeout` is set, after that long without an event. Dropping the
/// stream drops the subscription, which unregisters the session.
pub fn ndjson_stream(
    subscription: Subscription,
    keepalive: Duration,
    idle_timeout: Option<Duration>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut interval = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let state = StreamState {
        subscription,
        keepalive: interval,
        idle_timeout,
        idle_deadline: idle_timeout.map(|t| Instant::now() + t),
    };

    futures::stream::unfold(state, |mut state| async move {
        match state.next().await {
            Next::Event(line) => {
                if let Some(timeout) = state.idle_timeout {
                    state.idle_deadline = Some(Instant::now() + timeout);
                }
                state.keepalive.reset();
                Some((Ok(line), state))
            }
            Next::Keepalive => Some((Ok(keepalive_line()), state)),
            Next::Closed => {
                tracing::debug!(session = %state.subscription.id(), "Session closed, ending stream");
                None
            }
            Next::Idle => {
                tracing::info!(session = %state.subscription.id(), "Session idle timeout");
                state.subscription.close();
                None
            }
        }
    })
}
