// Bulk transfer engine: serialises every operation on the file socket.
//
// The file socket carries both directions of bulk traffic, so one engine
// task owns both halves and processes queued operations strictly in order.
// Sending waits for the broker's verdict frame before streaming; receiving
// is byte-count based so the socket stays open for further transfers.

use crate::client::error::{ClientError, ClientResult};
use crate::codec::FILE_CHUNK_SIZE;
use crate::connection::{FrameReader, FrameWriter};
use crate::frame::Frame;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One queued file operation.
#[derive(Debug)]
pub enum FileOp {
    /// Announce `name` (`size` bytes) and stream `path` once accepted
    Send {
        path: PathBuf,
        size: u32,
        name: String,
    },
    /// Receive `size` announced bytes into `path`
    Recv { path: PathBuf, size: u32 },
}

/// Shared handle the input loop uses to feed and steer the engine.
#[derive(Clone, Default)]
pub struct TransferQueue {
    ops: Arc<Mutex<VecDeque<FileOp>>>,
    wake: Arc<Notify>,
    cancel_current: Arc<AtomicBool>,
}

impl TransferQueue {
    pub fn new() -> TransferQueue {
        TransferQueue::default()
    }

    /// Queue an operation; the engine picks it up when it becomes current.
    pub fn push(&self, op: FileOp) {
        self.ops.lock().unwrap().push_back(op);
        self.wake.notify_one();
    }

    /// Abort the operation the engine is currently running.
    pub fn cancel_current(&self) {
        self.cancel_current.store(true, Ordering::Relaxed);
    }

    /// Drop every queued operation and abort the current one.
    pub fn cancel_all(&self) {
        self.ops.lock().unwrap().clear();
        self.cancel_current.store(true, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().unwrap().is_empty()
    }
}

/// The engine task. Owns the file socket; control-path frames it needs to
/// send (announces, completion and cancel notices) go through `ctrl_tx`.
pub struct FileEngine {
    reader: FrameReader,
    writer: FrameWriter,
    ctrl_tx: mpsc::Sender<Frame>,
    queue: TransferQueue,
    cancel: CancellationToken,
}

impl FileEngine {
    pub fn new(
        reader: FrameReader,
        writer: FrameWriter,
        ctrl_tx: mpsc::Sender<Frame>,
        queue: TransferQueue,
        cancel: CancellationToken,
    ) -> FileEngine {
        FileEngine {
            reader,
            writer,
            ctrl_tx,
            queue,
            cancel,
        }
    }

    /// Process queued operations until the session ends. Local file
    /// problems are reported and skipped; a transport failure cancels the
    /// whole client.
    pub async fn run(mut self) {
        loop {
            let op = loop {
                if let Some(op) = self.queue.ops.lock().unwrap().pop_front() {
                    break op;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.queue.wake.notified() => {}
                }
            };
            self.queue.cancel_current.store(false, Ordering::Relaxed);

            let result = match op {
                FileOp::Send { path, size, name } => self.send_file(&path, size, &name).await,
                FileOp::Recv { path, size } => self.recv_file(&path, size).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "file socket failed");
                self.cancel.cancel();
                return;
            }
        }
    }

    /// Announce one file on the control socket, await the verdict on the
    /// file socket, and stream the bytes if the room accepted.
    async fn send_file(&mut self, path: &Path, size: u32, name: &str) -> ClientResult<()> {
        self.send_control(Frame::FileStart {
            size,
            name: name.to_string(),
        })
        .await?;

        let verdict = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            res = self.reader.read_frame() => res.map_err(ClientError::from)?,
        };
        match verdict {
            Some(Frame::FileAccept) => {}
            Some(verdict) => {
                eprintln!("File transfer refused: {name}");
                debug!(?verdict, "transfer not accepted");
                return Ok(());
            }
            None => return Err(ClientError::ConnectionClosed),
        }

        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) => {
                eprintln!("[Error] Cannot open {}: {e}", path.display());
                self.send_control(Frame::FileCancel).await?;
                return Ok(());
            }
        };

        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut remaining = size as u64;
        while remaining > 0 {
            if self.queue.cancel_current.load(Ordering::Relaxed) {
                eprintln!("File transfer cancelled: {name}");
                return Ok(());
            }
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match file.read(&mut buf[..want]).await {
                Ok(0) => {
                    // the file shrank underneath the announced size
                    eprintln!("[Error] {} ended early while sending", path.display());
                    self.send_control(Frame::FileCancel).await?;
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    eprintln!("[Error] Reading {} failed: {e}", path.display());
                    self.send_control(Frame::FileCancel).await?;
                    return Ok(());
                }
            };
            self.writer.write_chunk(&buf[..n]).await?;
            remaining -= n as u64;
        }

        info!(name, size, "file sent");
        Ok(())
    }

    /// Receive exactly `size` bytes from the file socket into `path`, then
    /// report completion. The byte count is always consumed, even when the
    /// destination fails, so the socket stays aligned for the next
    /// transfer.
    async fn recv_file(&mut self, path: &Path, size: u32) -> ClientResult<()> {
        let mut file = match File::create(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("[Error] Cannot create {}: {e}", path.display());
                self.send_control(Frame::FileCancel).await?;
                None
            }
        };

        let mut remaining = size as u64;
        while remaining > 0 {
            let want = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                res = self.reader.read_chunk(want) => match res.map_err(ClientError::from)? {
                    Some(chunk) => chunk,
                    None => return Err(ClientError::ConnectionClosed),
                },
            };
            remaining -= chunk.len() as u64;

            if let Some(f) = file.as_mut() {
                if let Err(e) = f.write_all(&chunk).await {
                    eprintln!("[Error] Writing {} failed: {e}", path.display());
                    self.send_control(Frame::FileCancel).await?;
                    file = None;
                }
            }
        }

        if let Some(mut f) = file {
            f.flush().await?;
            info!(path = %path.display(), size, "file received");
        }
        self.send_control(Frame::FileDone).await?;
        Ok(())
    }

    async fn send_control(&self, frame: Frame) -> ClientResult<()> {
        self.ctrl_tx
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
