//! Telephony webhook handlers
//!
//! The provider POSTs a form when a call needs routing instructions; we
//! answer with an XML document directing it to open the media WebSocket
//! and to attach identifying values as stream parameters. 200 on success;
//! 5xx only on internal fault.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
};
use axum::extract::Form;
use serde::Deserialize;
use tracing::info;

use crate::orchestrator::AppContext;
use crate::telephony::stream_connect_xml;

/// Form body the provider sends on call events.
#[derive(Debug, Deserialize)]
pub struct VoiceForm {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "AccountSid", default)]
    pub account_sid: String,
}

/// Inbound call: route its media to our WebSocket, carrying the caller
/// identity as stream parameters.
pub async fn inbound_call(
    State(app): State<AppContext>,
    Form(form): Form<VoiceForm>,
) -> impl IntoResponse {
    info!(from = %form.from, call_sid = %form.call_sid, "inbound call webhook");
    let xml = stream_connect_xml(
        &app.config.server.websocket_url,
        &[
            ("From", form.from.as_str()),
            ("CallSid", form.call_sid.as_str()),
            ("AccountSid", form.account_sid.as_str()),
        ],
    );
    ([(header::CONTENT_TYPE, "text/xml")], xml)
}

#[derive(Debug, Deserialize)]
pub struct OutboundQuery {
    pub stream_id: String,
}

/// Child-call webhook: the callee answered the outbound verification call.
/// The stream parameter identifies the pre-created session.
pub async fn outbound_call(
    State(app): State<AppContext>,
    Query(query): Query<OutboundQuery>,
    Form(form): Form<VoiceForm>,
) -> impl IntoResponse {
    info!(stream_id = %query.stream_id, call_sid = %form.call_sid, "outbound call answered");
    if !app.store.contains(&query.stream_id) {
        // The media-open collector already reaped it, or the id is bogus.
        return (StatusCode::NOT_FOUND, "unknown stream").into_response();
    }
    let xml = stream_connect_xml(
        &app.config.server.websocket_url,
        &[
            ("From", form.from.as_str()),
            ("CallSid", form.call_sid.as_str()),
            ("StreamId", query.stream_id.as_str()),
        ],
    );
    ([(header::CONTENT_TYPE, "text/xml")], xml).into_response()
}
