// Wire codec - separates the header format from the frame domain model
//
// This module owns the three-byte frame header (type, big-endian body
// length) and the numeric frame-type registry. Frame bodies are interpreted
// in `frame`, which builds on the primitives here.

use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;

/// Maximum frame body size; the length field is an unsigned 16-bit integer.
pub const MAX_BODY_SIZE: usize = 65535;

/// Chunk size for bulk file streaming, on disk and on the wire.
pub const FILE_CHUNK_SIZE: usize = 4096;

/// Frame type codes (1-byte, part of the wire contract).
///
/// Codes 30/40/41 classify user input lines and never appear on the wire:
/// the client maps `StartFile` to a `FileStart` (60) announce and the two
/// cancel commands to `FileCancel` (63) / `FileCancelAll` (64). Code 60 is
/// the canonical file-start code in both directions.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Empty keep-nothing frame; ignored by both sides
    Empty = 0,
    /// Session id assignment (broker to client on the control socket,
    /// client to broker as the first frame on the file socket)
    Hello = 1,
    /// Chat text, relayed to every other participant
    Chat = 10,
    /// Leave notice; the body carries the user-visible text
    Quit = 20,
    /// Command-level classification of `-send <path>` (never on the wire)
    StartFile = 30,
    /// Command-level classification of `-cancel` (never on the wire)
    CancelCurrent = 40,
    /// Command-level classification of `-cancel-all` (never on the wire)
    CancelAll = 41,
    /// File transfer announce: 4-byte BE file size + UTF-8 file name
    FileStart = 60,
    /// Transfer accepted (peer response, and the broker's go signal)
    FileAccept = 61,
    /// Transfer refused
    FileRefuse = 62,
    /// Current transfer cancelled
    FileCancel = 63,
    /// All queued transfers cancelled
    FileCancelAll = 64,
    /// Transfer completed on the receiving side
    FileDone = 65,
    /// Anything not in this table
    Unknown = 255,
}

impl FrameType {
    /// Map a wire code to a frame type. Codes outside the registry decode
    /// as `Unknown` rather than failing; the peer-visible handler decides
    /// what to do with them.
    pub fn from_code(code: u8) -> FrameType {
        FrameType::try_from(code).unwrap_or(FrameType::Unknown)
    }
}

/// Frame header (3 bytes, common to all frames)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub body_len: u16,
}

impl FrameHeader {
    pub const SIZE: usize = 3;

    /// Decode a frame header from the buffer.
    ///
    /// The only failure is not having three bytes yet; any numeric type is
    /// accepted and mapped through [`FrameType::from_code`].
    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::Incomplete);
        }

        let frame_type = FrameType::from_code(buf.get_u8());
        let body_len = buf.get_u16();

        Ok(FrameHeader {
            frame_type,
            body_len,
        })
    }

    /// Encode the header into the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.body_len);
    }
}

/// Codec errors with enough context to tell protocol garbage from I/O.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("frame body too large: {len} bytes, max {MAX_BODY_SIZE}")]
    BodyTooLarge { len: usize },

    #[error("truncated {frame} body: need {need} bytes, got {got}")]
    TruncatedBody {
        frame: &'static str,
        need: usize,
        got: usize,
    },

    #[error("UTF-8 decoding error in {field}: {source}")]
    Utf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
