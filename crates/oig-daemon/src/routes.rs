//! Control HTTP endpoint: a thin JSON-in/JSON-out wrapper delegating
//! straight to the control pipeline. No business logic lives here — it
//! builds a `SetRequest`, submits it, and translates the first resulting
//! event into a status code.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use oig_control::{Confirm, ControlEvent, SetRequest};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/setting", post(post_setting))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "session_id": state.session_id,
        "device_id": state.device_id(),
        "box_connected": state.box_connected.load(std::sync::atomic::Ordering::SeqCst),
        "cloud_connected": state.cloud.is_connected().await,
        "uptime_s": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct SettingRequestJson {
    tx_id: Option<String>,
    tbl_name: String,
    tbl_item: String,
    new_value: String,
    confirm: Option<String>,
}

fn parse_confirm(raw: Option<&str>) -> Confirm {
    match raw {
        Some(s) if s.eq_ignore_ascii_case("saved") => Confirm::Saved,
        _ => Confirm::New,
    }
}

/// Extracts `<TblName>`/`<TblItem>`/`<NewValue>`/`<Confirm>` from a minimal
/// XML snippet (single-level tags only, same dialect as the BOX's own
/// protocol).
fn parse_minimal_xml(body: &str) -> Option<SettingRequestJson> {
    let tag = |name: &str| -> Option<String> {
        let open = format!("<{name}>");
        let close = format!("</{name}>");
        let start = body.find(&open)? + open.len();
        let end = body[start..].find(&close)? + start;
        Some(body[start..end].to_string())
    };
    Some(SettingRequestJson {
        tx_id: tag("TxId"),
        tbl_name: tag("TblName")?,
        tbl_item: tag("TblItem")?,
        new_value: tag("NewValue")?,
        confirm: tag("Confirm"),
    })
}

async fn post_setting(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    let parsed = serde_json::from_str::<SettingRequestJson>(&body).ok().or_else(|| parse_minimal_xml(&body));

    let Some(parsed) = parsed else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing_fields" }))).into_response();
    };
    if parsed.tbl_name.trim().is_empty() || parsed.tbl_item.trim().is_empty() || parsed.new_value.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing_fields" }))).into_response();
    }

    let tx_id = parsed.tx_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    if !state.claim_http_tx_id(&tx_id) {
        return (StatusCode::CONFLICT, Json(json!({ "error": "duplicate_tx_id", "tx_id": tx_id }))).into_response();
    }

    let req = SetRequest {
        tx_id: tx_id.clone(),
        table: parsed.tbl_name.clone(),
        item: parsed.tbl_item.clone(),
        raw_value: parsed.new_value.clone(),
        confirm: parse_confirm(parsed.confirm.as_deref()),
        source: "http".to_string(),
    };

    let cached = state.cached_value(&parsed.tbl_name, &parsed.tbl_item);
    let events = {
        let mut pipeline = state.control.lock().unwrap();
        pipeline.submit(req, cached.as_deref())
    };

    let outcome = events.iter().find(|(id, _)| id == &tx_id).map(|(_, event)| event.clone());
    crate::orchestrator::publish_control_events(&state, events.clone());

    match outcome {
        Some(ControlEvent::Error { kind }) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": kind, "tx_id": tx_id }))).into_response()
        }
        Some(ControlEvent::Completed { reason }) => {
            (StatusCode::OK, Json(json!({ "status": "completed", "reason": reason, "tx_id": tx_id }))).into_response()
        }
        _ => (StatusCode::OK, Json(json!({ "status": "accepted", "tx_id": tx_id }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_defaults_to_new_for_unrecognized_values() {
        assert_eq!(parse_confirm(Some("garbage")), Confirm::New);
        assert_eq!(parse_confirm(None), Confirm::New);
    }

    #[test]
    fn confirm_saved_is_case_insensitive() {
        assert_eq!(parse_confirm(Some("SAVED")), Confirm::Saved);
    }

    #[test]
    fn minimal_xml_extracts_all_four_fields() {
        let xml = "<TblName>tbl_box_prms</TblName><TblItem>MODE</TblItem><NewValue>3</NewValue><Confirm>New</Confirm>";
        let parsed = parse_minimal_xml(xml).unwrap();
        assert_eq!(parsed.tbl_name, "tbl_box_prms");
        assert_eq!(parsed.tbl_item, "MODE");
        assert_eq!(parsed.new_value, "3");
        assert_eq!(parsed.confirm.as_deref(), Some("New"));
    }

    #[test]
    fn minimal_xml_missing_required_tag_is_none() {
        let xml = "<TblName>tbl_box_prms</TblName><NewValue>3</NewValue>";
        assert!(parse_minimal_xml(xml).is_none());
    }
}
