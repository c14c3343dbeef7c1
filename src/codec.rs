//! Point codec for the live-tracking wire encoding
//!
//! The vendor protocol ships point batches as one flat whitespace-separated
//! string of `latitude longitude elevation unix_ts` tuples. Decoding is a
//! pure function; a batch either yields its points in input order or fails
//! as a whole. The single lenience is the timestamp token: real trackers
//! occasionally send garbage there, and dropping a whole live batch over it
//! would lose position data, so a bad timestamp degrades to the epoch-zero
//! sentinel with a warning.

use crate::error::ProtocolError;
use chrono::{DateTime, Utc};

/// Substitute time for points whose timestamp token does not parse.
pub const TIME_SENTINEL: DateTime<Utc> = DateTime::UNIX_EPOCH;

/// One position fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Degrees
    pub latitude: f64,
    /// Degrees
    pub longitude: f64,
    /// Meters
    pub elevation: f64,
    /// UTC instant; `TIME_SENTINEL` when the wire value was unusable
    pub time: DateTime<Utc>,
}

/// Decode a raw point batch into points, preserving input order.
pub fn decode_points(raw: &str) -> Result<Vec<Point>, ProtocolError> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.len() % 4 != 0 {
        return Err(ProtocolError::MalformedPointBatch(format!(
            "point elements not a multiple of 4: got {}",
            tokens.len()
        )));
    }

    let mut points = Vec::with_capacity(tokens.len() / 4);
    for tuple in tokens.chunks_exact(4) {
        points.push(Point {
            latitude: parse_coordinate(tuple[0], "latitude")?,
            longitude: parse_coordinate(tuple[1], "longitude")?,
            elevation: parse_coordinate(tuple[2], "elevation")?,
            time: parse_time(tuple[3]),
        });
    }
    Ok(points)
}

fn parse_coordinate(token: &str, what: &str) -> Result<f64, ProtocolError> {
    token
        .parse()
        .map_err(|_| ProtocolError::MalformedPointBatch(format!("bad {} value {:?}", what, token)))
}

/// Parse Unix seconds; clients send fractional seconds.
fn parse_time(token: &str) -> DateTime<Utc> {
    let Ok(seconds) = token.parse::<f64>() else {
        tracing::warn!(token, "unparseable point timestamp, substituting epoch");
        return TIME_SENTINEL;
    };
    let nanos = (seconds.fract() * 1e9) as u32;
    match DateTime::from_timestamp(seconds.trunc() as i64, nanos) {
        Some(time) => time,
        None => {
            tracing::warn!(token, "out-of-range point timestamp, substituting epoch");
            TIME_SENTINEL
        }
    }
}
