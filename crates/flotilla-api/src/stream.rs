//! GET /formations: the formation change feed as server-sent events.
//!
//! ```text
//! event: formation
//! data: {"app":{...},"release":{...},"artifact":{...},"processes":{...},...}
//!
//! event: ready
//! data: {}
//! ```
//!
//! `ready` marks the end of the replay. The stream stays open until the
//! client goes away or the feed is closed; a lagging subscriber is cut off.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, future};
use serde::Deserialize;
use tracing::warn;

use flotilla_core::FeedEvent;

use crate::ApiState;
use crate::error::ApiResult;

pub const FORMATION_EVENT: &str = "formation";
pub const READY_EVENT: &str = "ready";

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// RFC 3339 timestamp; omitted means the Unix epoch.
    pub since: Option<DateTime<Utc>>,
}

fn to_event(event: FeedEvent) -> Option<Event> {
    match event {
        FeedEvent::ReplayComplete => Some(Event::default().event(READY_EVENT).data("{}")),
        FeedEvent::Formation(formation) => match serde_json::to_string(&formation) {
            Ok(json) => Some(Event::default().event(FORMATION_EVENT).data(json)),
            Err(e) => {
                warn!(key = %formation.key(), error = %e, "failed to encode formation event");
                None
            }
        },
    }
}

/// GET /formations?since=
pub async fn stream_formations(
    State(state): State<ApiState>,
    Query(params): Query<StreamParams>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let since = params.since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let subscription = state.feed.subscribe(since)?;

    let events = subscription
        .take_while(|item| {
            if let Err(e) = item {
                warn!(error = %e, "formation stream ended");
            }
            future::ready(item.is_ok())
        })
        .filter_map(|item| future::ready(item.ok().and_then(to_event)))
        .map(Ok);

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
