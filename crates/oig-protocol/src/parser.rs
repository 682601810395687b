//! Field extraction for frame INNER content.
//!
//! The BOX's dialect is single-level, closed tags only (`<Tag>value</Tag>`,
//! never nested). A full XML parser would accept nesting the BOX never
//! sends and would need escaping rules the BOX doesn't implement, so a
//! direct byte scan matches the wire format exactly instead.

use std::collections::BTreeMap;
use std::fmt;

/// A coerced field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Decimal(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Meta fields that are consumed into synthetic keys or otherwise skipped
/// rather than surfaced as ordinary fields.
const SKIP_FIELDS: &[&str] = &[
    "TblName", "ID_Device", "ID_Set", "Reason", "ver", "CRC", "DT", "ID_SubD",
];

/// A parsed frame record: field name -> coerced value, plus synthetic keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRecord {
    pub fields: BTreeMap<String, Value>,
    pub table: Option<String>,
    pub device_id: Option<String>,
    pub dt: Option<String>,
    /// Raw `Reason` tag, if present. Not a spec-named synthetic key, but
    /// surfaced alongside the other meta fields because the offline
    /// synthesizer's end-of-stream suppression rule needs it.
    pub reason: Option<String>,
}

impl ParsedRecord {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.table.is_none() && self.device_id.is_none()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Outcome of [`parse_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A usable record.
    Record(ParsedRecord),
    /// `ID_SubD` was present and greater than zero: an inactive replica bank,
    /// dropped by design rather than surfaced as an empty record.
    DroppedInactiveReplica,
}

/// Scans `text` for single-level `<Tag>value</Tag>` elements.
fn scan_tags(text: &str) -> Vec<(&str, &str)> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let Some(tag_end) = text[i + 1..].find('>') else {
            break;
        };
        let tag_end = i + 1 + tag_end;
        let tag_name = &text[i + 1..tag_end];
        if tag_name.is_empty()
            || tag_name.starts_with('/')
            || !tag_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            i = tag_end + 1;
            continue;
        }
        let close_tag = format!("</{tag_name}>");
        let value_start = tag_end + 1;
        let Some(rel_close) = text[value_start..].find(&close_tag) else {
            i = tag_end + 1;
            continue;
        };
        let value_end = value_start + rel_close;
        let value = &text[value_start..value_end];
        // Reject values that themselves contain '<': not single-level.
        if !value.contains('<') {
            out.push((tag_name, value));
        }
        i = value_end + close_tag.len();
    }
    out
}

fn coerce(value: &str) -> Value {
    if value.contains('.') {
        if let Ok(f) = value.parse::<f64>() {
            return Value::Decimal(f);
        }
    } else if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = value.parse::<i64>() {
            return Value::Int(i);
        }
    }
    Value::Text(value.to_string())
}

/// Parses one frame's INNER content (or the whole frame; tag scanning does
/// not care about the `<Frame>` wrapper, matching the Python original).
pub fn parse_frame(text: &str) -> ParseOutcome {
    let tags = scan_tags(text);

    if let Some((_, v)) = tags.iter().find(|(k, _)| *k == "ID_SubD") {
        if v.parse::<i64>().unwrap_or(0) > 0 {
            return ParseOutcome::DroppedInactiveReplica;
        }
    }

    let mut record = ParsedRecord::default();
    for (key, value) in &tags {
        match *key {
            "TblName" => record.table = Some(value.to_string()),
            "Result" if record.table.is_none() => record.table = Some(value.to_string()),
            "ID_Device" => record.device_id = Some(value.to_string()),
            "DT" => record.dt = Some(value.to_string()),
            "Reason" => record.reason = Some(value.to_string()),
            _ => {}
        }
    }
    for (key, value) in &tags {
        if SKIP_FIELDS.contains(key) {
            continue;
        }
        record.fields.insert((*key).to_string(), coerce(value));
    }

    ParseOutcome::Record(record)
}

/// Extracts a new MODE value from a `tbl_events` `Content` string of the
/// form `"... MODE: [OLD]->[NEW]"`. Returns `None` if the pattern is absent
/// or NEW is not a valid integer.
pub fn parse_mode_from_event(content: &str) -> Option<i64> {
    let marker = "MODE:";
    let idx = content.find(marker)?;
    let rest = &content[idx + marker.len()..];
    let open = rest.find('[')?;
    let close = rest[open..].find(']')?;
    let _old = &rest[open + 1..open + close];
    let rest2 = &rest[open + close + 1..];
    let arrow = rest2.find("->")?;
    let rest3 = &rest2[arrow + 2..];
    let open2 = rest3.find('[')?;
    let close2 = rest3[open2..].find(']')?;
    rest3[open2 + 1..open2 + close2].parse::<i64>().ok()
}
