//! Offline synthesizer: builds protocol-correct cloud-style ACKs for the
//! BOX without ever contacting the cloud.

use chrono::{Local, Utc};
use oig_protocol::{build_frame, ParsedRecord};

/// What to do with an inbound BOX frame while operating offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineReply {
    /// Write this framed-and-CRC'd reply back to the BOX.
    Send(Vec<u8>),
    /// End-of-stream marker (`Result=END` + `Reason=All data sent`); the BOX
    /// is not asking for anything and must not be echoed.
    Suppress,
}

/// Synthesizes the reply the cloud would have sent, from a parsed frame.
pub fn synthesize(record: &ParsedRecord) -> OfflineReply {
    if record.table.as_deref() == Some("END") && record.reason.as_deref() == Some("All data sent") {
        return OfflineReply::Suppress;
    }

    let table = record.table.as_deref();
    let inner = match table {
        Some("IsNewSet") | Some("END") => end_with_times(),
        Some("IsNewWeather") | Some("IsNewFW") => "<Result>END</Result>".to_string(),
        Some(t) if t.starts_with("tbl_") => "<Result>ACK</Result><ToDo>GetActual</ToDo>".to_string(),
        _ => "<Result>ACK</Result>".to_string(),
    };

    OfflineReply::Send(build_frame(&inner, true))
}

fn end_with_times() -> String {
    let local = Local::now().format("%Y-%m-%d %H:%M:%S");
    let utc = Utc::now().format("%Y-%m-%d %H:%M:%S");
    format!("<Result>END</Result><Time>{local}</Time><UTCTime>{utc}</UTCTime>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use oig_protocol::{frame_crc, parse_frame, ParseOutcome};

    fn record_for(text: &str) -> ParsedRecord {
        match parse_frame(text) {
            ParseOutcome::Record(r) => r,
            ParseOutcome::DroppedInactiveReplica => panic!("unexpected drop"),
        }
    }

    fn crc_in(frame: &[u8]) -> u16 {
        let text = std::str::from_utf8(frame).unwrap();
        text.split("<CRC>").nth(1).unwrap().split("</CRC>").next().unwrap().parse().unwrap()
    }

    #[test]
    fn data_table_gets_ack_with_getactual() {
        let rec = record_for("<TblName>tbl_actual</TblName><ID_Device>123</ID_Device><X>1</X>");
        let OfflineReply::Send(frame) = synthesize(&rec) else {
            panic!("expected a reply");
        };
        let text = String::from_utf8(frame.clone()).unwrap();
        assert!(text.contains("<Result>ACK</Result><ToDo>GetActual</ToDo>"));
        assert_eq!(frame_crc(&frame), crc_in(&frame));
    }

    #[test]
    fn isnewset_gets_end_with_times() {
        let rec = record_for("<Result>IsNewSet</Result>");
        let OfflineReply::Send(frame) = synthesize(&rec) else {
            panic!("expected a reply");
        };
        let text = String::from_utf8(frame).unwrap();
        assert!(text.contains("<Result>END</Result>"));
        assert!(text.contains("<Time>"));
        assert!(text.contains("<UTCTime>"));
    }

    #[test]
    fn end_marker_gets_end_with_times() {
        let rec = record_for("<Result>END</Result>");
        let OfflineReply::Send(frame) = synthesize(&rec) else {
            panic!("expected a reply");
        };
        assert!(String::from_utf8(frame).unwrap().contains("<Time>"));
    }

    #[test]
    fn isnewweather_gets_bare_end() {
        let rec = record_for("<Result>IsNewWeather</Result>");
        let OfflineReply::Send(frame) = synthesize(&rec) else {
            panic!("expected a reply");
        };
        let text = String::from_utf8(frame).unwrap();
        assert!(text.contains("<Result>END</Result>"));
        assert!(!text.contains("<Time>"));
    }

    #[test]
    fn isnewfw_gets_bare_end() {
        let rec = record_for("<Result>IsNewFW</Result>");
        let OfflineReply::Send(frame) = synthesize(&rec) else {
            panic!("expected a reply");
        };
        assert!(!String::from_utf8(frame).unwrap().contains("<Time>"));
    }

    #[test]
    fn unknown_marker_gets_bare_ack() {
        let rec = record_for("<Result>Whatever</Result>");
        let OfflineReply::Send(frame) = synthesize(&rec) else {
            panic!("expected a reply");
        };
        assert_eq!(
            String::from_utf8(frame).unwrap().contains("<Result>ACK</Result>"),
            true
        );
    }

    #[test]
    fn end_of_stream_marker_is_suppressed() {
        let rec = record_for("<Result>END</Result><Reason>All data sent</Reason>");
        assert_eq!(synthesize(&rec), OfflineReply::Suppress);
    }
}
