//! Protocol detection module
//!
//! This module classifies inbound connections as TLCP or TLS by examining the
//! first record header, and provides the replaying stream that lets the chosen
//! handshake see the bytes consumed during classification.

mod detector;
mod rewind;
mod types;

pub use detector::{detect_protocol, peek_record_header, MIN_DETECT_BYTES, PEEK_BYTES, PEEK_TIMEOUT, RECORD_TYPE_HANDSHAKE};
pub use rewind::Rewind;
pub use types::ProtocolType;
