//! Frame codec (CRC16/MODBUS framing) and field parser for the BOX's
//! bespoke XML-over-TCP protocol.

pub mod frame;
pub mod parser;

pub use frame::{build_frame, compute_crc, extract_one_frame, frame_crc, FrameError};
pub use parser::{parse_frame, parse_mode_from_event, ParseOutcome, ParsedRecord, Value};
