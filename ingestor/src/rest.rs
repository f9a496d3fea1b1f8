use crate::broadcast::StreamEvent;
use crate::gateway::IngestGateway;
use crate::model::{DeviceEntry, DeviceState};
use crate::recovery::DrainState;
use crate::stats::{StatsSnapshot, StatsSurface};
use axum::{
    extract::{Query, State},
    http::{header, HeaderName},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
struct AppState {
    gateway: Arc<IngestGateway>,
    stats: StatsSurface,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceEntry>,
}

impl DevicesResponse {
    fn from_states(states: &[DeviceState]) -> Self {
        Self {
            devices: states.iter().map(DeviceEntry::from).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    bootstrap: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    drain_state: DrainState,
    offline_queue_size: u64,
}

pub fn create_router(gateway: Arc<IngestGateway>, stats: StatsSurface) -> Router {
    let state = AppState { gateway, stats };

    Router::new()
        .route("/api/devices", get(get_devices))
        .route("/api/events/stream", get(stream_events))
        .route("/stats", get(get_stats))
        .route("/health", get(health))
        .with_state(state)
}

async fn get_devices(State(state): State<AppState>) -> Json<DevicesResponse> {
    Json(DevicesResponse::from_states(&state.gateway.devices()))
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let drain_state = state.stats.drain_state();
    Json(HealthResponse {
        status: match drain_state {
            DrainState::Healthy => "ok",
            DrainState::Degraded => "degraded",
        },
        drain_state,
        offline_queue_size: state.stats.offline_queue_size(),
    })
}

/// Live device changes plus periodic `heartbeat` events as Server-Sent
/// Events. With `?bootstrap=true` the stream opens with one `bootstrap` event
/// carrying the device snapshot taken atomically with the subscription.
async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<StreamQuery>,
) -> impl IntoResponse {
    let (snapshot, subscription) = if params.bootstrap {
        let (snapshot, subscription) = state.gateway.subscribe_with_snapshot();
        (Some(snapshot), subscription)
    } else {
        (None, state.gateway.subscribe())
    };

    info!(
        "Stream client connected (subscriber {}, bootstrap={})",
        subscription.id(),
        params.bootstrap
    );

    let bootstrap = snapshot.map(|states| {
        Event::default()
            .event("bootstrap")
            .json_data(DevicesResponse::from_states(&states))
    });

    let live = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((to_sse_event(&event), subscription))
    });

    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream::iter(bootstrap).chain(live)),
    )
}

fn to_sse_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    match event {
        StreamEvent::Change(change) => Event::default().json_data(change),
        StreamEvent::Heartbeat(at) => Ok(Event::default()
            .event("heartbeat")
            .data(at.to_rfc3339())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceChange, FieldValue, Fields};
    use chrono::Utc;

    #[test]
    fn test_devices_response_shape() {
        let mut fields = Fields::new();
        fields.insert("latitude".to_string(), FieldValue::Number(10.0));
        fields.insert("longitude".to_string(), FieldValue::Number(20.0));
        fields.insert("battery".to_string(), FieldValue::Number(55.0));
        let states = vec![DeviceState {
            device_id: "X".to_string(),
            timestamp: Utc::now(),
            updated_at: Utc::now(),
            fields,
        }];

        let json = serde_json::to_value(DevicesResponse::from_states(&states)).unwrap();
        let device = &json["devices"][0];
        assert_eq!(device["device_id"], "X");
        assert_eq!(device["latitude"], 10.0);
        assert_eq!(device["longitude"], 20.0);
        assert_eq!(device["battery"], 55.0);
    }

    #[test]
    fn test_change_event_is_unnamed_json() {
        let change = StreamEvent::Change(DeviceChange {
            device_id: "X".to_string(),
            timestamp: Utc::now(),
            fields: Fields::new(),
        });
        assert!(to_sse_event(&change).is_ok());
        assert!(to_sse_event(&StreamEvent::Heartbeat(Utc::now())).is_ok());
    }
}
