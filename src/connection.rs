// ABOUTME: Provides framed TCP connection management shared by the broker and the client
// ABOUTME: Implements buffered frame I/O with owned split halves and raw chunk reads for bulk file data

use crate::frame::{self, Frame};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A framed stream. Reads are buffered in a `BytesMut` so a frame is only
/// materialized once its declared length has arrived; writes go through a
/// `BufWriter` and are flushed per frame.
#[derive(Debug)]
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    /// Create a new `Connection`, backed by `socket`.
    pub fn new(socket: TcpStream) -> Connection {
        let (read_half, write_half) = socket.into_split();
        Connection {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        }
    }

    /// Read a single `Frame` value from the underlying stream.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        self.reader.read_frame().await
    }

    /// Write a single `Frame` value to the underlying stream.
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.writer.write_frame(frame).await
    }

    /// Read up to `max` raw bytes from the underlying stream.
    pub async fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        self.reader.read_chunk(max).await
    }

    /// Write raw file bytes to the underlying stream.
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_chunk(data).await
    }

    /// Split into independently owned reader and writer halves.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// The read half: a buffered frame parser over the raw byte stream.
#[derive(Debug)]
pub struct FrameReader {
    stream: OwnedReadHalf,

    // The buffer for reading frames. 4KB matches the file chunk size; a
    // control socket rarely holds more than a frame or two at once.
    buffer: BytesMut,
}

impl FrameReader {
    fn new(stream: OwnedReadHalf) -> FrameReader {
        FrameReader {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read a single `Frame` value from the underlying stream.
    ///
    /// The function waits until it has retrieved enough data to parse a
    /// frame. Any data remaining in the read buffer after the frame has
    /// been parsed is kept there for the next call.
    ///
    /// # Returns
    ///
    /// On success, the received frame is returned. If the stream is closed
    /// in a way that doesn't break a frame in half, it returns `None`.
    /// Otherwise, an error is returned.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            // Attempt to parse a frame from the buffered data. If enough
            // data has been buffered, the frame is returned.
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // Not enough buffered data to read a frame. Attempt to read
            // more data from the socket. `0` indicates "end of stream".
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                // The remote closed the connection. For this to be a clean
                // shutdown, there should be no data in the read buffer. If
                // there is, the peer closed the socket while sending a
                // frame.
                return self
                    .buffer
                    .is_empty()
                    .then_some(None)
                    .ok_or_else(|| "connection reset by peer".into());
            }
        }
    }

    /// Tries to parse a frame from the buffer. If the buffer contains
    /// enough data, the frame is returned and the data removed from the
    /// buffer. If not enough data has been buffered yet, `Ok(None)` is
    /// returned. If the buffered data does not represent a valid frame,
    /// `Err` is returned.
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        // Checking first is much cheaper than a full parse attempt and
        // tells us the total length to discard afterwards.
        match Frame::check(&mut buf) {
            Ok(len) => {
                buf.set_position(0);

                // If the encoded frame representation is invalid, an error
                // is returned. This should terminate the **current**
                // connection but not impact any other connected client.
                let frame = Frame::parse(&mut buf)?;

                // Discard the parsed data from the read buffer.
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            // Not enough data present in the read buffer to parse a single
            // frame. We must wait for more data to arrive from the socket.
            // This is an expected runtime condition, not an error.
            Err(Incomplete) => Ok(None),
            // The connection is in an invalid state; the caller closes it.
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `max` raw bytes from the stream.
    ///
    /// Used for bulk file data, which is not framed. Buffered bytes left
    /// over from frame reads are drained first so no data is lost when a
    /// socket switches from framed to raw mode (the go signal immediately
    /// precedes file bytes on the same socket).
    ///
    /// Returns `None` on a clean end of stream.
    pub async fn read_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        if self.buffer.is_empty() && 0 == self.stream.read_buf(&mut self.buffer).await? {
            return Ok(None);
        }

        let take = self.buffer.len().min(max);
        Ok(Some(self.buffer.split_to(take).freeze()))
    }
}

/// The write half: serialises frames and raw chunks onto the stream.
#[derive(Debug)]
pub struct FrameWriter {
    stream: BufWriter<OwnedWriteHalf>,
}

impl FrameWriter {
    fn new(stream: OwnedWriteHalf) -> FrameWriter {
        FrameWriter {
            stream: BufWriter::new(stream),
        }
    }

    /// Write a single `Frame` value to the underlying stream.
    ///
    /// Writes go to the buffered stream; `flush` pushes the remaining
    /// contents to the socket so the peer sees whole frames promptly.
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let bytes = frame
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    /// Write raw file bytes to the underlying stream.
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Half-close the stream, signalling no further writes.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
