//! Frame codec: `<Frame>...</Frame>` framing plus CRC16/MODBUS over the
//! inner payload with the `<CRC>` tag elided.
//!
//! The CRC table is precomputed once at compile time (a `const fn` table,
//! not a runtime-built `HashMap`) and exposed only through the pure
//! functions below.

use std::fmt;

const POLY_REFLECTED: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut n = 0usize;
    while n < 256 {
        let mut c = n as u16;
        let mut i = 0;
        while i < 8 {
            if c & 1 != 0 {
                c = (c >> 1) ^ POLY_REFLECTED;
            } else {
                c >>= 1;
            }
            i += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_table();

/// CRC16/MODBUS: poly 0x8005 (reflected 0xA001), init 0xFFFF, refin=refout=true, xorout=0.
pub fn compute_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        let idx = ((crc ^ b as u16) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC_TABLE[idx];
    }
    crc
}

const FRAME_OPEN: &[u8] = b"<Frame>";
const FRAME_CLOSE: &[u8] = b"</Frame>";

/// Errors raised while computing or validating a frame's CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The bytes did not look like a `<Frame>...</Frame>` wrapper at all.
    NotAFrame,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::NotAFrame => write!(f, "bytes are not a <Frame>...</Frame> wrapper"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Returns the bytes between `<Frame>` and `</Frame>`, with a trailing
/// `\r`/`\n`/`\r\n` already stripped from the outer slice. Falls back to the
/// input unchanged if the wrapper tags are not both present (matches the
/// Python original's permissive fallback).
fn frame_inner_bytes(frame_bytes: &[u8]) -> &[u8] {
    let trimmed = trim_trailing_crlf(frame_bytes);
    if let (Some(start), true) = (
        trimmed.windows(FRAME_OPEN.len()).position(|w| w == FRAME_OPEN),
        trimmed.ends_with(FRAME_CLOSE),
    ) {
        if start == 0 {
            let inner_start = FRAME_OPEN.len();
            let inner_end = trimmed.len() - FRAME_CLOSE.len();
            if inner_end >= inner_start {
                return &trimmed[inner_start..inner_end];
            }
        }
    }
    trimmed
}

fn trim_trailing_crlf(mut b: &[u8]) -> &[u8] {
    while let Some(&last) = b.last() {
        if last == b'\r' || last == b'\n' {
            b = &b[..b.len() - 1];
        } else {
            break;
        }
    }
    b
}

/// Removes the first `<CRC>digits</CRC>` substring, if any.
fn strip_crc_tag(inner: &[u8]) -> Vec<u8> {
    const OPEN: &[u8] = b"<CRC>";
    const CLOSE: &[u8] = b"</CRC>";
    let Some(open_at) = inner.windows(OPEN.len()).position(|w| w == OPEN) else {
        return inner.to_vec();
    };
    let digits_start = open_at + OPEN.len();
    let Some(close_rel) = inner[digits_start..]
        .windows(CLOSE.len())
        .position(|w| w == CLOSE)
    else {
        return inner.to_vec();
    };
    let digits_end = digits_start + close_rel;
    if !inner[digits_start..digits_end].iter().all(u8::is_ascii_digit) {
        return inner.to_vec();
    }
    let close_end = digits_end + CLOSE.len();
    let mut out = Vec::with_capacity(inner.len() - (close_end - open_at));
    out.extend_from_slice(&inner[..open_at]);
    out.extend_from_slice(&inner[close_end..]);
    out
}

/// Computes the CRC a `<Frame>...</Frame>` byte sequence *should* carry:
/// extract INNER, strip any `<CRC>...</CRC>` substring, then
/// [`compute_crc`] over what remains.
pub fn frame_crc(frame_bytes: &[u8]) -> u16 {
    let inner = frame_inner_bytes(frame_bytes);
    let inner_wo_crc = strip_crc_tag(inner);
    compute_crc(&inner_wo_crc)
}

/// Builds `<Frame>{inner}{crc_tag}</Frame>`, optionally followed by `\r\n`.
///
/// `inner_xml` must not include the outer `<Frame>` wrapper. Any
/// preexisting `<CRC>...</CRC>` tag is stripped before the new one (exactly
/// five zero-padded decimal digits) is computed and appended.
pub fn build_frame(inner_xml: &str, with_crlf: bool) -> Vec<u8> {
    let inner_wo_crc = strip_crc_tag(inner_xml.as_bytes());
    let crc = compute_crc(&inner_wo_crc);
    let mut out = Vec::with_capacity(inner_wo_crc.len() + 32);
    out.extend_from_slice(FRAME_OPEN);
    out.extend_from_slice(&inner_wo_crc);
    out.extend_from_slice(format!("<CRC>{crc:05}</CRC>").as_bytes());
    out.extend_from_slice(FRAME_CLOSE);
    if with_crlf {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Consumes the first complete `<Frame>...</Frame>[CRLF]` unit from `buf`,
/// removing it and returning it. Returns `None` if no complete frame is yet
/// available — in particular a trailing bare `\r` right after `</Frame>`
/// is treated as "might still be followed by `\n`" and is not consumed.
pub fn extract_one_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end_idx = find_subslice(buf, FRAME_CLOSE)?;
    let mut frame_end = end_idx + FRAME_CLOSE.len();

    if buf.len() > frame_end {
        match buf[frame_end] {
            b'\r' => {
                if buf.len() < frame_end + 2 {
                    // Might still be `\r\n` once more bytes arrive.
                    return None;
                }
                if buf[frame_end + 1] == b'\n' {
                    frame_end += 2;
                } else {
                    frame_end += 1;
                }
            }
            b'\n' => frame_end += 1,
            _ => {}
        }
    }

    let frame = buf[..frame_end].to_vec();
    buf.drain(..frame_end);
    Some(frame)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_known_modbus_vector() {
        // "123456789" -> CRC16/MODBUS 0x4B37 per the standard check vector.
        assert_eq!(compute_crc(b"123456789"), 0x4B37);
    }

    #[test]
    fn build_frame_round_trips_through_frame_crc() {
        let frame = build_frame("<Result>ACK</Result>", true);
        assert_eq!(frame_crc(&frame), embedded_crc(&frame));
    }

    #[test]
    fn build_frame_crc_is_five_digits() {
        let frame = build_frame("<X>1</X>", true);
        let text = String::from_utf8(frame).unwrap();
        let crc_text = text
            .split("<CRC>")
            .nth(1)
            .unwrap()
            .split("</CRC>")
            .next()
            .unwrap();
        assert_eq!(crc_text.len(), 5);
    }

    #[test]
    fn build_frame_strips_preexisting_crc_tag() {
        let frame = build_frame("<X>1</X><CRC>99999</CRC>", true);
        let text = String::from_utf8(frame.clone()).unwrap();
        assert_eq!(text.matches("<CRC>").count(), 1);
        assert_eq!(frame_crc(&frame), embedded_crc(&frame));
    }

    fn embedded_crc(frame: &[u8]) -> u16 {
        let text = std::str::from_utf8(frame).unwrap();
        let digits = text
            .split("<CRC>")
            .nth(1)
            .unwrap()
            .split("</CRC>")
            .next()
            .unwrap();
        digits.parse().unwrap()
    }

    #[test]
    fn extract_one_frame_waits_for_full_crlf() {
        let mut buf = b"<Frame>abc</Frame>\r".to_vec();
        assert!(extract_one_frame(&mut buf).is_none());
        assert_eq!(buf, b"<Frame>abc</Frame>\r");
    }

    #[test]
    fn extract_one_frame_consumes_crlf_terminated_frame() {
        let mut buf = b"<Frame>abc</Frame>\r\nTRAILING".to_vec();
        let frame = extract_one_frame(&mut buf).unwrap();
        assert_eq!(frame, b"<Frame>abc</Frame>\r\n");
        assert_eq!(buf, b"TRAILING");
    }

    #[test]
    fn extract_one_frame_consumes_lf_only_terminated_frame() {
        let mut buf = b"<Frame>abc</Frame>\nX".to_vec();
        let frame = extract_one_frame(&mut buf).unwrap();
        assert_eq!(frame, b"<Frame>abc</Frame>\n");
        assert_eq!(buf, b"X");
    }

    #[test]
    fn extract_one_frame_bare_end_tag_does_not_consume_next_byte() {
        let mut buf = b"<Frame>abc</Frame>X".to_vec();
        let frame = extract_one_frame(&mut buf).unwrap();
        assert_eq!(frame, b"<Frame>abc</Frame>");
        assert_eq!(buf, b"X");
    }

    #[test]
    fn extract_one_frame_returns_none_without_end_tag() {
        let mut buf = b"<Frame>abc".to_vec();
        assert!(extract_one_frame(&mut buf).is_none());
    }

    #[test]
    fn extract_one_frame_advances_past_multiple_frames() {
        let mut buf = b"<Frame>a</Frame>\r\n<Frame>b</Frame>\r\n".to_vec();
        let first = extract_one_frame(&mut buf).unwrap();
        assert_eq!(first, b"<Frame>a</Frame>\r\n");
        let second = extract_one_frame(&mut buf).unwrap();
        assert_eq!(second, b"<Frame>b</Frame>\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_crc_ignores_embedded_crc_tag() {
        let with_crc = b"<Frame><X>1</X><CRC>00000</CRC></Frame>";
        let without_crc = b"<Frame><X>1</X></Frame>";
        assert_eq!(frame_crc(with_crc), frame_crc(without_crc));
    }
}
