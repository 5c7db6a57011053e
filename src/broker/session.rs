// One participant's task set on the broker side.
//
// A paired session runs four tasks: the control read loop (frame dispatch
// into room operations), two writer loops draining the session's control
// and file queues, and the file pump that consumes announced transfers
// from the sender's file socket. The room cancels the shared token to tear
// all four down; a transport error on either socket reports the session to
// the room, which does the same.

use crate::broker::room::{
    FileOut, PumpStart, Room, SessionHandle, SessionId, CONTROL_QUEUE_FRAMES, FILE_QUEUE_CHUNKS,
};
use crate::codec::FILE_CHUNK_SIZE;
use crate::connection::{Connection, FrameReader, FrameWriter};
use crate::frame::Frame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Register a freshly paired participant with the room and spawn its tasks.
pub fn spawn(room: Arc<Room>, id: SessionId, control: Connection, file: Connection) {
    let (control_rd, control_wr) = control.split();
    let (file_rd, file_wr) = file.split();

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_FRAMES);
    let (file_tx, file_rx) = mpsc::channel(FILE_QUEUE_CHUNKS);
    let (pump_tx, pump_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    room.join(SessionHandle {
        id,
        control_tx: control_tx.clone(),
        file_tx,
        pump_tx,
        cancel: cancel.clone(),
    });

    tokio::spawn(control_writer(control_wr, control_rx, cancel.clone()));
    tokio::spawn(file_writer(file_wr, file_rx, cancel.clone()));
    tokio::spawn(file_pump(
        room.clone(),
        id,
        file_rd,
        pump_rx,
        cancel.clone(),
    ));
    tokio::spawn(control_loop(room, id, control_rd, control_tx, cancel));
}

/// Read frames off the control socket and dispatch them by type.
async fn control_loop(
    room: Arc<Room>,
    id: SessionId,
    mut reader: FrameReader,
    reply_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read_frame() => match res {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(id, "control socket closed");
                    room.leave(id).await;
                    break;
                }
                Err(e) => {
                    warn!(id, error = %e, "control socket error");
                    room.leave(id).await;
                    break;
                }
            },
        };

        match frame {
            Frame::Empty => debug!(id, "empty frame received"),
            Frame::Chat(_) => room.broadcast(frame, id).await,
            Frame::Quit(_) => {
                let notice = format!("[Server] User {id} has left the room.");
                room.broadcast(Frame::Chat(notice), id).await;
                room.leave(id).await;
                break;
            }
            Frame::FileStart { size, name } => room.file_announce(size, name, id).await,
            Frame::FileAccept => room.file_accept(id).await,
            Frame::FileRefuse => room.file_refuse(id).await,
            Frame::FileCancel | Frame::CancelCurrent => {
                room.file_cancel(Frame::FileCancel, id).await
            }
            Frame::FileCancelAll | Frame::CancelAll => {
                room.file_cancel(Frame::FileCancelAll, id).await
            }
            Frame::FileDone => room.file_done(id).await,
            Frame::Hello { .. } | Frame::StartFile(_) => {
                warn!(id, ?frame, "unexpected frame on control socket");
            }
            Frame::Unknown(body) => {
                let reply = Frame::Chat(format!("[Server] Unknown command {body}"));
                let _ = reply_tx.send(reply).await;
            }
        }
    }
}

/// Drain the control queue onto the socket, one frame at a time.
async fn control_writer(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(frame) => frame,
                None => break,
            },
        };
        if writer.write_frame(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Drain the file queue onto the socket: go signals and cancels as frames,
/// bulk data as raw bytes, in queue order.
async fn file_writer(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<FileOut>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let res = match item {
            FileOut::Frame(frame) => writer.write_frame(&frame).await,
            FileOut::Chunk(data) => writer.write_chunk(&data).await,
        };
        if res.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Consume announced transfers from the sender's file socket.
///
/// Each start carries the announced size; exactly that many bytes are read,
/// in chunks, and handed to the room for fan-out. If the transfer dies
/// underneath us the remaining bytes are drained unrouted so the socket
/// stays aligned for the next transfer.
async fn file_pump(
    room: Arc<Room>,
    id: SessionId,
    mut reader: FrameReader,
    mut rx: mpsc::Receiver<PumpStart>,
    cancel: CancellationToken,
) {
    loop {
        let start = tokio::select! {
            _ = cancel.cancelled() => return,
            cmd = rx.recv() => match cmd {
                Some(start) => start,
                None => return,
            },
        };

        let mut remaining = start.size as u64;
        let mut live = true;
        while remaining > 0 {
            let take = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return,
                res = reader.read_chunk(take) => match res {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        debug!(id, "file socket closed mid-transfer");
                        room.leave(id).await;
                        return;
                    }
                    Err(e) => {
                        warn!(id, error = %e, "file socket error");
                        room.leave(id).await;
                        return;
                    }
                },
            };
            remaining -= chunk.len() as u64;
            if live {
                live = room.file_chunk(chunk, id).await;
                if !live {
                    debug!(id, remaining, "transfer gone; draining remaining bytes");
                }
            }
        }
        if live {
            debug!(id, size = start.size, "finished pumping transfer");
        }
    }
}
