// User-facing client core: the id handshake, the input-line dispatch, and
// the control echo loop.
//
// Standard input drives frame classification; decoded control traffic goes
// to standard output; diagnostics go to standard error. An inbound file
// announce becomes a pending offer the user resolves with `-accept <path>`
// or `-refuse`, so the input loop stays the only reader of stdin.

use crate::client::error::{ClientError, ClientResult};
use crate::client::transfer::{FileEngine, FileOp, TransferQueue};
use crate::connection::{Connection, FrameReader, FrameWriter};
use crate::frame::{Frame, QUIT_NOTICE};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A file announce waiting for the user's verdict.
#[derive(Debug)]
struct FileOffer {
    size: u32,
    name: String,
}

type OfferQueue = Arc<Mutex<VecDeque<FileOffer>>>;

/// One connected participant: the paired control and file sockets plus the
/// broker-assigned session id.
#[derive(Debug)]
pub struct ChatClient {
    id: u32,
    control: Connection,
    file: Connection,
}

impl ChatClient {
    /// Connect both sockets and perform the id handshake: the broker
    /// assigns an id on the control socket, and the file socket introduces
    /// itself with that id so the broker can pair the two.
    pub async fn connect(host: &str, control_port: u16, file_port: u16) -> ClientResult<ChatClient> {
        let socket = TcpStream::connect((host, control_port)).await?;
        let mut control = Connection::new(socket);

        let id = match control.read_frame().await.map_err(ClientError::from)? {
            Some(Frame::Hello { id }) => id,
            Some(other) => {
                return Err(ClientError::Handshake(format!(
                    "expected id assignment, got {other:?}"
                )));
            }
            None => return Err(ClientError::ConnectionClosed),
        };

        let socket = TcpStream::connect((host, file_port)).await?;
        let mut file = Connection::new(socket);
        file.write_frame(&Frame::Hello { id }).await?;

        info!(id, "connected");
        Ok(ChatClient { id, control, file })
    }

    /// The broker-assigned session id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Drive the client until the user quits or the broker goes away.
    pub async fn run(self) -> ClientResult<()> {
        let (control_rd, control_wr) = self.control.split();
        let (file_rd, file_wr) = self.file.split();

        let (ctrl_tx, ctrl_rx) = mpsc::channel::<Frame>(64);
        let queue = TransferQueue::new();
        let offers: OfferQueue = Arc::new(Mutex::new(VecDeque::new()));
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(control_writer(control_wr, ctrl_rx, cancel.clone()));
        let echo = tokio::spawn(control_echo(control_rd, offers.clone(), cancel.clone()));
        let engine = FileEngine::new(
            file_rd,
            file_wr,
            ctrl_tx.clone(),
            queue.clone(),
            cancel.clone(),
        );
        let engine = tokio::spawn(engine.run());

        let result = input_loop(&ctrl_tx, &queue, &offers, &cancel).await;

        cancel.cancel();
        drop(ctrl_tx);
        let _ = tokio::join!(writer, echo, engine);
        result
    }
}

/// Drain outgoing control frames onto the socket in enqueue order.
///
/// Runs until every sender is gone rather than racing the cancellation
/// token, so a queued quit notice still reaches the broker on the way out.
async fn control_writer(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    while let Some(frame) = rx.recv().await {
        if writer.write_frame(&frame).await.is_err() {
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Print inbound control traffic; file announces become pending offers.
async fn control_echo(mut reader: FrameReader, offers: OfferQueue, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read_frame() => match res {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    eprintln!("Connection closed by broker.");
                    cancel.cancel();
                    break;
                }
                Err(e) => {
                    eprintln!("[Error] {e}");
                    cancel.cancel();
                    break;
                }
            },
        };

        match frame {
            Frame::Empty => {}
            Frame::FileStart { size, name } => {
                println!(
                    "Incoming file \"{name}\" ({size} bytes). \
                     Type -accept <path> to receive it or -refuse to decline."
                );
                offers.lock().unwrap().push_back(FileOffer { size, name });
            }
            other => println!("\t>>> {}", other.body_text()),
        }
    }
}

/// Read user lines, classify them, and dispatch.
async fn input_loop(
    ctrl_tx: &mpsc::Sender<Frame>,
    queue: &TransferQueue,
    offers: &OfferQueue,
    cancel: &CancellationToken,
) -> ClientResult<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            res = lines.next_line() => match res? {
                Some(line) => line,
                None => {
                    // stdin ended; leave the room cleanly
                    send(ctrl_tx, Frame::Quit(QUIT_NOTICE.to_string())).await?;
                    break;
                }
            },
        };

        if resolve_offer(&line, ctrl_tx, queue, offers).await? {
            continue;
        }

        match Frame::from_line(&line) {
            Frame::Empty => {}
            Frame::StartFile(path) => queue_send(path, queue).await,
            Frame::CancelCurrent => {
                queue.cancel_current();
                send(ctrl_tx, Frame::FileCancel).await?;
            }
            Frame::CancelAll => {
                queue.cancel_all();
                send(ctrl_tx, Frame::FileCancelAll).await?;
            }
            frame @ Frame::Quit(_) => {
                send(ctrl_tx, frame).await?;
                break;
            }
            frame => send(ctrl_tx, frame).await?,
        }
    }
    Ok(())
}

/// Handle the client-local `-accept <path>` / `-refuse` commands that
/// answer a pending file offer. Returns `true` when the line was consumed.
async fn resolve_offer(
    line: &str,
    ctrl_tx: &mpsc::Sender<Frame>,
    queue: &TransferQueue,
    offers: &OfferQueue,
) -> ClientResult<bool> {
    let Some(rest) = line.strip_prefix('-') else {
        return Ok(false);
    };
    let (token, arg) = match rest.split_once(' ') {
        Some((token, arg)) => (token, arg),
        None => (rest, ""),
    };

    match token {
        "accept" => {
            if arg.is_empty() {
                eprintln!("Usage: -accept <path>");
                return Ok(true);
            }
            let Some(offer) = offers.lock().unwrap().pop_front() else {
                eprintln!("No pending file offer.");
                return Ok(true);
            };
            info!(name = %offer.name, size = offer.size, "accepting transfer");
            send(ctrl_tx, Frame::FileAccept).await?;
            queue.push(FileOp::Recv {
                path: PathBuf::from(arg),
                size: offer.size,
            });
            Ok(true)
        }
        "refuse" => {
            if offers.lock().unwrap().pop_front().is_none() {
                eprintln!("No pending file offer.");
                return Ok(true);
            }
            send(ctrl_tx, Frame::FileRefuse).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Validate a `-send` path and queue the transfer.
async fn queue_send(path: String, queue: &TransferQueue) {
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) => {
            eprintln!("[Error] File doesn't exist: {path} ({e})");
            return;
        }
    };
    if !meta.is_file() {
        eprintln!("[Error] Not a regular file: {path}");
        return;
    }
    if meta.len() > u32::MAX as u64 {
        eprintln!("[Error] File too large to announce: {path}");
        return;
    }

    let name = Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.clone());

    queue.push(FileOp::Send {
        path: PathBuf::from(path),
        size: meta.len() as u32,
        name,
    });
}

async fn send(ctrl_tx: &mpsc::Sender<Frame>, frame: Frame) -> ClientResult<()> {
    ctrl_tx
        .send(frame)
        .await
        .map_err(|_| ClientError::ConnectionClosed)
}
