use crate::actuators::SystemState;
use crate::control::Action;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// What the last control cycle saw and did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StatusSnapshot {
    pub updated: Option<NaiveDateTime>,
    pub system_state: Option<SystemState>,
    pub mode: String,
    pub alarm_active: bool,
    pub current_dem_target: f64,
    pub total_predicted: f64,
    pub last_action: Option<Action>,
    pub in_time_frame: bool,
    pub schedule: Vec<ScheduledFrame>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledFrame {
    pub start: NaiveDateTime,
    pub mode: &'static str,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    /// Only frames starting at or after this instant.
    from: Option<NaiveDateTime>,
}

pub fn router(status: SharedStatus) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .with_state(status)
}

pub async fn create_web_server(bind: &str, status: SharedStatus) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding status endpoint on {bind}"))?;
    info!(%bind, "status endpoint listening");
    axum::serve(listener, router(status))
        .await
        .context("status endpoint failed")
}

async fn get_status(
    State(status): State<SharedStatus>,
    Query(query): Query<StatusQuery>,
) -> Json<StatusSnapshot> {
    let mut snapshot = status.read().await.clone();
    if let Some(from) = query.from {
        snapshot.schedule.retain(|frame| frame.start >= from);
    }
    Json(snapshot)
}
