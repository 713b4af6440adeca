//! Broker payload parser.
//!
//! Producers publish JSON such as `{"latitude":41.0082,"longitude":28.9784}`,
//! sometimes wrapped in a larger object. The payload is never fully decoded:
//! we look for the literal `"latitude":<number>,"longitude":<number>`
//! sequence and keep both numbers as the text they were sent as, so the
//! stored and broadcast values carry no float formatting drift.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::RelayError;

/// Coordinate pair as decimal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinates {
    pub latitude: String,
    pub longitude: String,
}

/// `"latitude":<number>,"longitude":<number>` with JSON number syntax.
///
/// Group 1: latitude text, group 2: longitude text.
fn location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#""latitude":(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?),"longitude":(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)"#,
        )
        .unwrap()
    })
}

/// Extract the first `"latitude":X,"longitude":Y` pair from a payload.
pub fn parse_coordinates(payload: &[u8]) -> Result<Coordinates, RelayError> {
    let text = String::from_utf8_lossy(payload);

    let caps = location_pattern()
        .captures(&text)
        .ok_or_else(|| RelayError::MalformedPayload(preview(&text)))?;

    Ok(Coordinates {
        latitude: caps[1].to_string(),
        longitude: caps[2].to_string(),
    })
}

fn preview(text: &str) -> String {
    const MAX: usize = 64;
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
