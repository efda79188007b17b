#![deny(unsafe_code)]

//! Wire-level types for the skein net-chan protocol.
//!
//! A session exchanges length-prefixed frames over an ordered reliable
//! bytestream. Each frame body is a [`Header`] followed by a payload whose
//! layout depends on the message type. Payloads are postcard-encoded; an
//! element frame carries a batch of values of the element type registered
//! for its channel id, encoded as a postcard sequence.

mod frame;

pub use frame::{FrameError, FrameReader, FrameWriter};

use serde::{Deserialize, Serialize};

/// Hard floor for the receive-side message size limit.
pub const MIN_MSG_SIZE_LIMIT: usize = 512;

/// Default receive-side message size limit.
pub const DEFAULT_MSG_SIZE_LIMIT: usize = 16 * 1024;

/// Longest allowed net-chan name, in bytes.
pub const MAX_NAME_LEN: usize = 500;

/// Soft byte budget for element batches and for the encoder's flush policy.
pub const WANT_BATCH_SIZE: usize = 4096;

/// Vacant-but-reserved send-table slots tolerated while the peer keeps
/// introducing fresh ids instead of reusing closed ones.
pub const MAX_HOLES: usize = 256;

/// Announced-but-unopened net-chans tolerated before the session aborts.
pub const MAX_HALF_OPEN: usize = 256;

/// Message types appear on the wire as the first byte of a frame header.
/// The values are wire-significant.
///
/// Types up to [`LAST_RESERVED_MSG_TYPE`] that are not listed here are
/// reserved: a decoder skips such frames instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Handshake. Must be the first frame in each direction.
    Hello = 1,
    /// A batch of values for one net-chan.
    Element = 2,
    /// Name announcement on the element path. Tolerated on receive for
    /// compatibility, never sent: announcement is carried by `InitCredit`.
    InitElement = 3,
    /// End of stream for one net-chan.
    Close = 4,
    /// Refill credit.
    Credit = 5,
    /// Initial credit: advertises a new net-chan (id, window, name).
    InitCredit = 6,
    /// Terminal error; last frame of an orderly encoder.
    Error = 7,
    /// Terminal network-flavored error with timeout/temporary bits.
    NetError = 8,
}

/// Highest reserved message type value.
pub const LAST_RESERVED_MSG_TYPE: u8 = 15;

/// Classification of a raw message-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgClass {
    /// A message type this protocol version understands.
    Known(MsgType),
    /// Reserved but unused; frames of this type are skipped.
    Reserved(u8),
    /// Outside the reserved range; a protocol violation.
    Invalid(u8),
}

impl MsgType {
    /// Classify a raw message-type byte from a frame header.
    pub fn classify(raw: u8) -> MsgClass {
        match raw {
            1 => MsgClass::Known(MsgType::Hello),
            2 => MsgClass::Known(MsgType::Element),
            3 => MsgClass::Known(MsgType::InitElement),
            4 => MsgClass::Known(MsgType::Close),
            5 => MsgClass::Known(MsgType::Credit),
            6 => MsgClass::Known(MsgType::InitCredit),
            7 => MsgClass::Known(MsgType::Error),
            8 => MsgClass::Known(MsgType::NetError),
            raw if raw <= LAST_RESERVED_MSG_TYPE && raw != 0 => MsgClass::Reserved(raw),
            raw => MsgClass::Invalid(raw),
        }
    }

    /// The raw wire value.
    pub const fn wire(self) -> u8 {
        self as u8
    }
}

/// Precedes every payload inside a frame.
///
/// Channel ids are unsigned on the wire; a varint that does not fit `u32`
/// fails decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_type: u8,
    pub chan_id: u32,
}

/// Payload of a `NetError` frame: a transport-like error with the
/// timeout/temporary bits preserved across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetFault {
    pub message: String,
    pub is_timeout: bool,
    pub is_temporary: bool,
}

/// Error from encoding or decoding a frame payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Encode a frame payload as postcard bytes.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    Ok(postcard::to_stdvec(value)?)
}

/// Decode a frame payload, requiring that it is consumed exactly.
pub fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(PayloadError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

/// Append the unsigned LEB128 encoding of `value` (postcard's integer
/// encoding), used here for the element count that prefixes a batch.
pub fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Assemble an element batch payload from individually encoded values.
///
/// `items` is the concatenation of `count` postcard-encoded values; the
/// result is exactly the postcard encoding of the corresponding sequence,
/// so the receiving side decodes it as a `Vec` of the element type.
pub fn batch_payload(count: u32, items: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.len() + 5);
    write_varint(u64::from(count), &mut out);
    out.extend_from_slice(items);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_the_full_byte_range() {
        assert_eq!(MsgType::classify(1), MsgClass::Known(MsgType::Hello));
        assert_eq!(MsgType::classify(8), MsgClass::Known(MsgType::NetError));
        assert_eq!(MsgType::classify(9), MsgClass::Reserved(9));
        assert_eq!(MsgType::classify(15), MsgClass::Reserved(15));
        assert_eq!(MsgType::classify(0), MsgClass::Invalid(0));
        assert_eq!(MsgType::classify(16), MsgClass::Invalid(16));
        assert_eq!(MsgType::classify(200), MsgClass::Invalid(200));
    }

    #[test]
    fn varint_matches_postcard() {
        for value in [0u64, 1, 0x7f, 0x80, 0x3fff, 0x4000, u64::from(u32::MAX), u64::MAX] {
            let mut ours = Vec::new();
            write_varint(value, &mut ours);
            let reference = postcard::to_stdvec(&value).unwrap();
            assert_eq!(ours, reference, "varint mismatch for {value}");
        }
    }

    #[test]
    fn batch_payload_matches_postcard_sequence() {
        let values: Vec<u32> = vec![7, 300, 0, u32::MAX];
        let mut items = Vec::new();
        for v in &values {
            items.extend_from_slice(&postcard::to_stdvec(v).unwrap());
        }
        let ours = batch_payload(values.len() as u32, &items);
        let reference = postcard::to_stdvec(&values).unwrap();
        assert_eq!(ours, reference);

        let decoded: Vec<u32> = decode_payload(&ours).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn header_roundtrip() {
        let header = Header {
            msg_type: MsgType::InitCredit.wire(),
            chan_id: 123_456,
        };
        let bytes = encode_payload(&header).unwrap();
        let back: Header = decode_payload(&bytes).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn net_fault_roundtrip() {
        let fault = NetFault {
            message: "connection reset by peer".into(),
            is_timeout: false,
            is_temporary: true,
        };
        let bytes = encode_payload(&fault).unwrap();
        let back: NetFault = decode_payload(&bytes).unwrap();
        assert_eq!(back, fault);
    }

    #[test]
    fn decode_payload_rejects_trailing_bytes() {
        let mut bytes = encode_payload(&42u32).unwrap();
        bytes.push(0xaa);
        let err = decode_payload::<u32>(&bytes).unwrap_err();
        assert!(matches!(err, PayloadError::TrailingBytes(1)));
    }
}
