//! Decoding and classification of protocol POST bodies
//!
//! Tracker firmware sends `application/x-www-form-urlencoded` bodies where
//! every field appears at most once. Parsing walks the raw pairs instead of
//! deserializing into a map up front, so a repeated field is rejected
//! rather than silently collapsed to whichever value came last.

use crate::error::ProtocolError;
use regex::Regex;
use std::collections::HashMap;

/// The six commands the wire protocol knows, keyed off the `request` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetTime,
    GetActivities,
    UploadActivity,
    StartActivity,
    UpdateActivity,
    StopActivity,
}

impl std::str::FromStr for Command {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Command, ProtocolError> {
        Ok(match value {
            "get_time" => Command::GetTime,
            "get_activities" => Command::GetActivities,
            "upload_activity" => Command::UploadActivity,
            "start_activity" => Command::StartActivity,
            "update_activity" => Command::UpdateActivity,
            "stop_activity" => Command::StopActivity,
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        })
    }
}

/// A decoded request body with typed field access.
#[derive(Debug)]
pub struct ProtocolRequest {
    fields: HashMap<String, String>,
}

impl ProtocolRequest {
    /// Decode a form body, rejecting duplicate field names.
    pub fn parse(body: &str) -> Result<ProtocolRequest, ProtocolError> {
        let mut fields = HashMap::new();
        for (key, value) in form_urlencoded::parse(body.as_bytes()) {
            let key = key.into_owned();
            if fields.contains_key(&key) {
                return Err(ProtocolError::MalformedRequest(format!(
                    "{} must appear only once",
                    key
                )));
            }
            fields.insert(key, value.into_owned());
        }
        Ok(ProtocolRequest { fields })
    }

    /// Classify the command named by the `request` field.
    pub fn command(&self) -> Result<Command, ProtocolError> {
        self.require("request")?.parse()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// The decoded field map, for the audit trail.
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    /// A field the command cannot work without.
    pub fn require(&self, name: &str) -> Result<&str, ProtocolError> {
        self.field(name)
            .ok_or_else(|| ProtocolError::MalformedRequest(format!("missing field {}", name)))
    }

    /// Apply the vendor quirk repairs, idempotently, before dispatch.
    ///
    /// Three are known from deployed firmware: the misspelled `privicity`
    /// visibility field, start requests with the title left out entirely,
    /// and one client that titles every track with a verbose machine
    /// timestamp (`2023-11-14 09:31:07.123456`), kept here to its minute
    /// prefix.
    pub fn repair(&mut self) {
        if let Some(value) = self.fields.remove("privicity") {
            self.fields.entry("privacy".to_string()).or_insert(value);
        }
        if self.fields.get("request").map(String::as_str) == Some("start_activity") {
            self.fields
                .entry("title".to_string())
                .or_insert_with(String::new);
        }
        if let Some(title) = self.fields.get_mut("title") {
            // ASCII classes: the known client stamps in ASCII, and a match
            // end is then always a safe truncation point.
            let stamp = Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}").unwrap();
            if let Some(found) = stamp.find(title) {
                title.truncate(found.end());
            }
        }
    }
}
