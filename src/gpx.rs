//! Minimal GPX text handling for the storage boundary
//!
//! Destinations persist tracks as GPX 1.1 text. This module only *writes*
//! that text and offers a cheap tag scan for reading single header fields
//! back out of stored files; it is deliberately not a GPX parser. Uploaded
//! GPX payloads pass through the server untouched.

use crate::codec::Point;
use chrono::SecondsFormat;

/// The closed category vocabulary the vendor protocol understands.
pub const CATEGORIES: &[&str] = &[
    "Cycling",
    "Running",
    "Mountain biking",
    "Indoor cycling",
    "Sailing",
    "Walking",
    "Hiking",
    "Swimming",
    "Driving",
    "Off road driving",
    "Motor racing",
    "Motorcycling",
    "Enduro",
    "Skiing",
    "Cross country skiing",
    "Canoeing",
    "Kayaking",
    "Sea kayaking",
    "Stand up paddle boarding",
    "Rowing",
    "Windsurfing",
    "Kiteboarding",
    "Orienteering",
    "Mountaineering",
    "Skating",
    "Skateboarding",
    "Horse riding",
    "Hang gliding",
    "Gliding",
    "Flying",
    "Snowboarding",
    "Paragliding",
    "Hot air ballooning",
    "Nordic walking",
    "Snowshoeing",
    "Jet skiing",
    "Powerboating",
    "Pedelec",
    "Crossskating",
    "Handcycle",
    "Motorhome",
    "Cabriolet",
    "Coach",
    "Pack animal trekking",
    "Train",
    "Miscellaneous",
];

pub const DEFAULT_CATEGORY: &str = CATEGORIES[0];

/// Map a wire category to the canonical vocabulary.
///
/// The vendor's own API examples send `cycling` where the site says
/// `Cycling`, and at least one client follows suit, so the value gets the
/// same capitalization repair before lookup: first letter up, rest down.
pub fn normalize_category(raw: &str) -> Option<&'static str> {
    let mut chars = raw.chars();
    let first = chars.next()?;
    let repaired: String = first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect();
    CATEGORIES.iter().find(|c| **c == repaired).copied()
}

/// The fields a destination needs to persist one track.
#[derive(Debug, Clone, Copy)]
pub struct TrackSnapshot<'a> {
    pub title: &'a str,
    pub category: &'a str,
    pub public: bool,
    pub points: &'a [Point],
}

/// Serialize a snapshot as GPX 1.1.
///
/// Visibility and category ride in `<keywords>` as `Status:.., Category:..`,
/// the convention the surrounding tooling expects in stored files.
pub fn render_gpx(track: &TrackSnapshot<'_>) -> String {
    let mut xml = String::with_capacity(256 + track.points.len() * 96);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(
        "<gpx xmlns=\"http://www.topografix.com/GPX/1/1\" version=\"1.1\" creator=\"trackrelay\">\n",
    );

    let status = if track.public { "public" } else { "private" };
    xml.push_str("  <metadata>\n");
    xml.push_str(&format!("    <name>{}</name>\n", escape_text(track.title)));
    if let Some(first) = track.points.first() {
        xml.push_str(&format!("    <time>{}</time>\n", iso_time(first)));
    }
    xml.push_str(&format!(
        "    <keywords>Status:{}, Category:{}</keywords>\n",
        status,
        escape_text(track.category)
    ));
    xml.push_str("  </metadata>\n");

    xml.push_str("  <trk>\n");
    xml.push_str(&format!("    <name>{}</name>\n", escape_text(track.title)));
    xml.push_str("    <trkseg>\n");
    for point in track.points {
        xml.push_str(&format!(
            "      <trkpt lat=\"{}\" lon=\"{}\"><ele>{}</ele><time>{}</time></trkpt>\n",
            point.latitude,
            point.longitude,
            point.elevation,
            iso_time(point)
        ));
    }
    xml.push_str("    </trkseg>\n  </trk>\n</gpx>\n");
    xml
}

fn iso_time(point: &Point) -> String {
    point.time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Undo [`escape_text`] on a scanned field value. `&amp;` goes last so a
/// literal `&amp;lt;` in the source does not collapse twice.
pub(crate) fn unescape_text(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Pull one `<name>..</name>` style field out of stored track text.
///
/// String splitting only, the same quick scan the file catalog has always
/// used; nested or repeated tags resolve to the innermost occurrence.
pub fn scan_field<'a>(data: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let (before_close, _) = data.split_once(close.as_str())?;
    let (_, value) = before_close.rsplit_once(open.as_str())?;
    Some(value)
}

/// Extract `Category:` from a stored `<keywords>` field, if present.
pub fn scan_category(data: &str) -> Option<&str> {
    scan_field(data, "keywords")?
        .split(',')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("Category:"))
}
