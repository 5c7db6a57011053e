//! Provides a type representing a protocol frame as well as utilities for
//! parsing frames from a byte array and classifying user input lines.

use crate::codec::{CodecError, FrameHeader, FrameType, MAX_BODY_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use core::fmt;
use std::io::Cursor;

/// Fixed body of the leave notice a `-quit` command carries.
pub const QUIT_NOTICE: &str = "User has left the room.";

/// One wire unit: a frame type plus its decoded body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Empty,
    Hello { id: u32 },
    Chat(String),
    Quit(String),
    /// Command-level only: `-send <path>`, resolved by the client
    StartFile(String),
    /// Command-level only: `-cancel`
    CancelCurrent,
    /// Command-level only: `-cancel-all`
    CancelAll,
    FileStart { size: u32, name: String },
    FileAccept,
    FileRefuse,
    FileCancel,
    FileCancelAll,
    FileDone,
    Unknown(String),
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data is available to parse a frame
    Incomplete,

    /// Invalid frame encoding
    Other(crate::Error),
}

impl Frame {
    /// The wire code for this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Empty => FrameType::Empty,
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Chat(_) => FrameType::Chat,
            Frame::Quit(_) => FrameType::Quit,
            Frame::StartFile(_) => FrameType::StartFile,
            Frame::CancelCurrent => FrameType::CancelCurrent,
            Frame::CancelAll => FrameType::CancelAll,
            Frame::FileStart { .. } => FrameType::FileStart,
            Frame::FileAccept => FrameType::FileAccept,
            Frame::FileRefuse => FrameType::FileRefuse,
            Frame::FileCancel => FrameType::FileCancel,
            Frame::FileCancelAll => FrameType::FileCancelAll,
            Frame::FileDone => FrameType::FileDone,
            Frame::Unknown(_) => FrameType::Unknown,
        }
    }

    /// The textual body, for frames that carry one. Used by the client when
    /// echoing control traffic to standard output.
    pub fn body_text(&self) -> &str {
        match self {
            Frame::Chat(text)
            | Frame::Quit(text)
            | Frame::StartFile(text)
            | Frame::Unknown(text) => text,
            _ => "",
        }
    }

    /// Checks if an entire frame can be decoded from `src`. On success,
    /// returns the total frame length (header plus body) so the caller can
    /// advance its buffer after parsing.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<usize, Error> {
        let header = FrameHeader::decode(src)?;
        let total = FrameHeader::SIZE + header.body_len as usize;

        if src.remaining() < header.body_len as usize {
            return Err(Error::Incomplete);
        }

        Ok(total)
    }

    /// The frame has already been validated with `check`.
    #[tracing::instrument]
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        let header = FrameHeader::decode(src)?;

        if src.remaining() < header.body_len as usize {
            return Err(Error::Incomplete);
        }
        let body = src.copy_to_bytes(header.body_len as usize);

        let frame = match header.frame_type {
            FrameType::Empty => Frame::Empty,
            FrameType::Hello => Frame::Hello {
                id: get_u32_prefix(&body, "hello")?,
            },
            FrameType::Chat => Frame::Chat(get_text(body, "chat")?),
            FrameType::Quit => Frame::Quit(get_text(body, "quit")?),
            FrameType::StartFile => Frame::StartFile(get_text(body, "start_file")?),
            FrameType::CancelCurrent => Frame::CancelCurrent,
            FrameType::CancelAll => Frame::CancelAll,
            FrameType::FileStart => {
                let size = get_u32_prefix(&body, "file_start")?;
                let name = get_text(body.slice(4..), "file_start")?;
                Frame::FileStart { size, name }
            }
            FrameType::FileAccept => Frame::FileAccept,
            FrameType::FileRefuse => Frame::FileRefuse,
            FrameType::FileCancel => Frame::FileCancel,
            FrameType::FileCancelAll => Frame::FileCancelAll,
            FrameType::FileDone => Frame::FileDone,
            // Preserve whatever the peer sent so the diagnostic can show it
            FrameType::Unknown => Frame::Unknown(String::from_utf8_lossy(&body).into_owned()),
        };

        Ok(frame)
    }

    /// Encode this frame as header plus body. Fails if the body would not
    /// fit the 16-bit length field.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut body = BytesMut::new();
        match self {
            Frame::Empty
            | Frame::CancelCurrent
            | Frame::CancelAll
            | Frame::FileAccept
            | Frame::FileRefuse
            | Frame::FileCancel
            | Frame::FileCancelAll
            | Frame::FileDone => {}
            Frame::Hello { id } => body.put_u32(*id),
            Frame::Chat(text) | Frame::Quit(text) | Frame::StartFile(text)
            | Frame::Unknown(text) => {
                body.put_slice(text.as_bytes());
            }
            Frame::FileStart { size, name } => {
                body.put_u32(*size);
                body.put_slice(name.as_bytes());
            }
        }

        if body.len() > MAX_BODY_SIZE {
            return Err(CodecError::BodyTooLarge { len: body.len() });
        }

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + body.len());
        FrameHeader {
            frame_type: self.frame_type(),
            body_len: body.len() as u16,
        }
        .encode(&mut buf);
        buf.unsplit(body);

        Ok(buf.freeze())
    }

    /// Classify one line of user input.
    ///
    /// An empty line is an `Empty` frame. A leading `-` marks a command;
    /// the token up to the first space is matched exactly, and anything
    /// unrecognized becomes `Unknown` (never chat text). Everything else is
    /// a `Chat` frame carrying the raw line.
    pub fn from_line(line: &str) -> Frame {
        if line.is_empty() {
            return Frame::Empty;
        }

        let Some(rest) = line.strip_prefix('-') else {
            return Frame::Chat(line.to_string());
        };

        let (token, arg) = match rest.split_once(' ') {
            Some((token, arg)) => (token, arg),
            None => (rest, ""),
        };

        match token {
            "quit" => Frame::Quit(QUIT_NOTICE.to_string()),
            "send" => Frame::StartFile(arg.to_string()),
            "cancel" => Frame::CancelCurrent,
            "cancel-all" => Frame::CancelAll,
            _ => Frame::Unknown(String::new()),
        }
    }
}

fn get_u32_prefix(body: &Bytes, frame: &'static str) -> Result<u32, Error> {
    if body.len() < 4 {
        return Err(Error::Other(
            CodecError::TruncatedBody {
                frame,
                need: 4,
                got: body.len(),
            }
            .into(),
        ));
    }
    Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

fn get_text(body: Bytes, field: &'static str) -> Result<String, Error> {
    String::from_utf8(body.to_vec())
        .map_err(|source| Error::Other(CodecError::Utf8 { field, source }.into()))
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Error {
        match err {
            CodecError::Incomplete => Error::Incomplete,
            other => Error::Other(other.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(f),
            Error::Other(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {}
