//! The vendor protocol dispatcher
//!
//! Every POST to the API surface declares a command in its `request` field;
//! the command set is closed and dispatch is a plain match, so the full
//! protocol surface is visible right here. Responses are wrapped in the
//! fixed envelope `<?xml ..?><message>..</message>`; failures render
//! `<type>error</type><reason>..</reason>` inside the same envelope. The
//! fragments the GET surface serves (homepage, category list, stored
//! tracks) live here too, so all the wire emulation strings stay in one
//! place.

use super::{AppState, TrackingState};
use crate::codec;
use crate::error::ProtocolError;
use crate::fanout::DestinationSet;
use crate::gpx::{self, DEFAULT_CATEGORY};
use crate::normalize::{Command, ProtocolRequest};
use crate::registry::SessionRegistry;
use axum::http::StatusCode;
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Outcome of one protocol POST: what to answer and what to audit.
pub struct Handled {
    pub status: StatusCode,
    pub body: String,
    pub command: Option<String>,
    pub fields: HashMap<String, String>,
}

impl Handled {
    fn failure(
        command: Option<String>,
        fields: HashMap<String, String>,
        err: ProtocolError,
    ) -> Handled {
        tracing::warn!(status = err.status().as_u16(), error = %err, "request refused");
        Handled {
            status: err.status(),
            body: error_body(&err.to_string()),
            command,
            fields,
        }
    }
}

pub fn envelope(inner: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><message>{}</message>",
        inner
    )
}

pub fn error_body(reason: &str) -> String {
    envelope(&format!(
        "<type>error</type><reason>{}</reason>",
        gpx::escape_text(reason)
    ))
}

/// Make a title safe inside a CDATA section. A literal `]]>` would
/// terminate the section early; the standard split carries it across two
/// sections unchanged.
fn cdata_safe(title: &str) -> String {
    title.replace("]]>", "]]]]><![CDATA[>")
}

/// Run one protocol POST end to end: authenticate, decode, repair,
/// dispatch. Bodies from unauthenticated callers are never parsed.
pub async fn handle_post(
    state: &AppState,
    sender: IpAddr,
    auth_header: Option<&str>,
    body: &str,
) -> Handled {
    if let Err(err) = state.auth.check_basic_auth(auth_header) {
        return Handled::failure(None, HashMap::new(), err);
    }
    let mut request = match ProtocolRequest::parse(body) {
        Ok(request) => request,
        Err(err) => return Handled::failure(None, HashMap::new(), err),
    };
    request.repair();
    let fields = request.fields().clone();
    let command_name = request.field("request").map(str::to_string);

    let command = match request.command() {
        Ok(command) => command,
        Err(err) => return Handled::failure(command_name, fields, err),
    };

    let result = match command {
        Command::GetTime => Ok(get_time()),
        Command::GetActivities => get_activities(state, &request).await,
        Command::UploadActivity => upload_activity(state, &request).await,
        Command::StartActivity => start_activity(state, &request, sender).await,
        Command::UpdateActivity => update_activity(state, &request, sender).await,
        Command::StopActivity => stop_activity(state, &request, sender).await,
    };
    match result {
        Ok(inner) => Handled {
            status: StatusCode::OK,
            body: envelope(&inner),
            command: command_name,
            fields,
        },
        Err(err) => Handled::failure(command_name, fields, err),
    }
}

fn get_time() -> String {
    format!(
        "<type>time</type><server_time>{}</server_time>",
        Utc::now().timestamp()
    )
}

async fn get_activities(
    state: &AppState,
    request: &ProtocolRequest,
) -> Result<String, ProtocolError> {
    let mut entries = String::new();
    // Clients page with an offset; only the first page carries content and
    // a missing offset means the first page.
    if request.field("offset").unwrap_or("0") == "0" {
        let tracking = state.tracking.lock().await;
        for (idx, entry) in tracking.destinations.catalog()?.iter().enumerate() {
            entries.push_str(&format!(
                "<activity{n}><id>{id}</id><title><![CDATA[ {title} ]]></title>\
                 <activity_type>{category}</activity_type><date>{date}</date></activity{n}>",
                n = idx + 1,
                id = entry.ident,
                title = cdata_safe(&entry.title),
                category = entry.category,
                date = entry.time.timestamp(),
            ));
        }
    }
    Ok(format!("<activities>{}</activities>", entries))
}

async fn upload_activity(
    state: &AppState,
    request: &ProtocolRequest,
) -> Result<String, ProtocolError> {
    let content = request.require("gpx_file")?;
    let mut tracking = state.tracking.lock().await;
    let ident = tracking.destinations.store_raw(content)?;
    Ok(format!("<type>success</type><id>{}</id>", ident))
}

async fn start_activity(
    state: &AppState,
    request: &ProtocolRequest,
    sender: IpAddr,
) -> Result<String, ProtocolError> {
    let points = codec::decode_points(request.require("points")?)?;
    let title = request.field("title").unwrap_or("").to_string();
    let public = request.field("privacy") == Some("public");
    let category = match request.field("activity") {
        Some(raw) => gpx::normalize_category(raw).unwrap_or_else(|| {
            tracing::warn!(category = raw, "category not in the vocabulary, using default");
            DEFAULT_CATEGORY
        }),
        None => DEFAULT_CATEGORY,
    };

    let mut tracking = state.tracking.lock().await;
    let TrackingState {
        registry,
        destinations,
    } = &mut *tracking;
    let (key, _created) = registry.start(sender);
    if let Some(session) = registry.get_mut(key) {
        session.title = title;
        session.public = public;
        session.category = category.to_string();
    }
    registry.append_points(key, &points);
    let ident = write_out(registry, destinations, key)?;
    Ok(format!(
        "<type>activity_started</type><activity_id>{}</activity_id>",
        ident
    ))
}

async fn update_activity(
    state: &AppState,
    request: &ProtocolRequest,
    sender: IpAddr,
) -> Result<String, ProtocolError> {
    let points = codec::decode_points(request.require("points")?)?;
    let mut tracking = state.tracking.lock().await;
    let TrackingState {
        registry,
        destinations,
    } = &mut *tracking;
    let (key, _created) = registry.update(sender, request.field("activity_id"));
    registry.append_points(key, &points);
    write_out(registry, destinations, key)?;
    Ok("<type>activity_updated</type>".to_string())
}

async fn stop_activity(
    state: &AppState,
    request: &ProtocolRequest,
    sender: IpAddr,
) -> Result<String, ProtocolError> {
    let mut tracking = state.tracking.lock().await;
    tracking.registry.stop(sender, request.field("activity_id"));
    Ok("<type>activity_stopped</type>".to_string())
}

/// Push the session's accumulated track through the fan-out and record the
/// identifier the authoritative destination answered with.
fn write_out(
    registry: &mut SessionRegistry,
    destinations: &mut DestinationSet,
    key: Uuid,
) -> Result<String, ProtocolError> {
    let session = registry
        .get(key)
        .ok_or_else(|| ProtocolError::Destination("session disappeared mid-request".to_string()))?;
    let ident = destinations.write(session)?;
    registry.assign_ident(key, &ident);
    Ok(ident)
}

/// The homepage fragment: the caller's index in the sorted user list,
/// which the vendor's client scrapes out of a hidden form field.
pub fn homepage(state: &AppState, auth_header: Option<&str>) -> Result<String, ProtocolError> {
    let user = state.auth.check_basic_auth(auth_header)?;
    let users = state.auth.sorted_users()?;
    let index = users.iter().position(|u| *u == user).unwrap_or(0);
    Ok(format!(
        "<input type=\"hidden\" value=\"{}\" name=\"mid\" id=\"mid\" />",
        index
    ))
}

/// The category list fragment clients fetch from the explore wall.
pub fn categories() -> String {
    gpx::CATEGORIES
        .iter()
        .map(|c| format!("<li><input name=\"add-activity-x\">&nbsp;{}</li>", c))
        .collect()
}

/// Raw stored track text for a `tid` query, from the authoritative
/// destination.
pub async fn stored_track(state: &AppState, query: Option<&str>) -> Result<String, ProtocolError> {
    let tid = query
        .and_then(|q| {
            form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == "tid")
                .map(|(_, value)| value.into_owned())
        })
        .ok_or_else(|| ProtocolError::MalformedRequest("missing field tid".to_string()))?;
    let tracking = state.tracking.lock().await;
    tracking
        .destinations
        .read_raw(&tid)?
        .ok_or_else(|| ProtocolError::MalformedRequest(format!("unknown track {}", tid)))
}
