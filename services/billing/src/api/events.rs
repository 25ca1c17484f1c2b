//! Signal submission and event history.

use std::collections::{BTreeMap, BTreeSet};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use pulse_events::{Event, EventAction, EventData, EventPayload, EventType, Request};
use pulse_id::AccountId;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/events", post(submit_event).get(list_events))
}

/// A raw signal from an external producer.
#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub account_id: String,
    pub event_type: String,
    pub action: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub extras: Vec<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct SubmitResponse {
    pub accepted: bool,
    /// Live subscriptions the event was queued for.
    pub delivered: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event types; all types when absent.
    pub types: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub account_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct EventsResponse {
    pub events: Vec<Event>,
}

fn parse_account(raw: String) -> Result<AccountId, ApiError> {
    AccountId::parse(raw).map_err(|e| ApiError::bad_request("invalid_account_id", e.to_string()))
}

async fn submit_event(
    State(state): State<AppState>,
    Json(signal): Json<SignalRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let account_id = parse_account(signal.account_id)?;
    let event_type: EventType = signal.event_type.parse()?;
    let action: EventAction = signal.action.parse()?;
    let payload = EventPayload::from_data(
        action,
        EventData {
            fields: signal.fields,
            extras: signal.extras,
        },
    )?;

    let mut event = Event::new(account_id, event_type, action, payload);
    if let Some(timestamp) = signal.timestamp {
        event = event.at(timestamp);
    }

    info!(
        account_id = %event.account_id,
        event_type = %event_type,
        action = %action,
        "Signal received"
    );
    let delivered = state.events().add_event(event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            accepted: true,
            delivered,
        }),
    ))
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let types: BTreeSet<EventType> = match &query.types {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::parse::<EventType>)
            .collect::<Result<_, _>>()?,
        None => EventType::ALL.into_iter().collect(),
    };

    let request = Request {
        start: query.start,
        end: query.end,
        types,
        max_results: query.limit.unwrap_or(0),
        account_id: query.account_id.map(parse_account).transpose()?,
    };

    let events = state.events().get_events(&request).await?;
    Ok(Json(EventsResponse { events }))
}
