// Dual-endpoint listener: accepts the control and file sockets and pairs
// them into sessions by id.
//
// A control accept is answered immediately with a `Hello` carrying the
// assigned session id; the client's file socket introduces itself with the
// same id as its first frame. Pairing by id rather than accept order keeps
// simultaneous connects from racing each other.

use crate::broker::room::{Room, SessionId};
use crate::broker::session;
use crate::connection::Connection;
use crate::frame::Frame;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Broker {
    control: TcpListener,
    file: TcpListener,
    room: Arc<Room>,
}

impl Broker {
    /// Bind both endpoints on IPv4 `0.0.0.0`.
    pub async fn bind(control_port: u16, file_port: u16) -> crate::Result<Broker> {
        let control = TcpListener::bind(("0.0.0.0", control_port)).await?;
        let file = TcpListener::bind(("0.0.0.0", file_port)).await?;
        Ok(Broker {
            control,
            file,
            room: Arc::new(Room::new()),
        })
    }

    /// The bound control endpoint address.
    pub fn control_addr(&self) -> io::Result<SocketAddr> {
        self.control.local_addr()
    }

    /// The bound file endpoint address.
    pub fn file_addr(&self) -> io::Result<SocketAddr> {
        self.file.local_addr()
    }

    /// Accept and pair connections until the process ends. Accept failures
    /// are logged and survived; only the initial bind is fatal.
    pub async fn run(self) -> crate::Result<()> {
        let mut next_id: SessionId = 1;
        let mut pending: HashMap<SessionId, Connection> = HashMap::new();
        let (identified_tx, mut identified_rx) = mpsc::channel::<(SessionId, Connection)>(16);

        loop {
            tokio::select! {
                res = self.control.accept() => {
                    let (socket, addr) = match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "control accept failed");
                            continue;
                        }
                    };
                    let id = next_id;
                    next_id = next_id.wrapping_add(1);

                    // Hand the new participant its id; the file socket will
                    // echo it back so the two can be paired.
                    let mut conn = Connection::new(socket);
                    if let Err(e) = conn.write_frame(&Frame::Hello { id }).await {
                        warn!(%addr, error = %e, "dropping control socket");
                        continue;
                    }
                    info!(id, %addr, "control socket accepted");
                    pending.insert(id, conn);
                }
                res = self.file.accept() => {
                    let (socket, addr) = match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "file accept failed");
                            continue;
                        }
                    };
                    // Reading the introduction can block on the peer, so it
                    // happens off the accept loop.
                    let tx = identified_tx.clone();
                    tokio::spawn(async move {
                        let mut conn = Connection::new(socket);
                        match conn.read_frame().await {
                            Ok(Some(Frame::Hello { id })) => {
                                let _ = tx.send((id, conn)).await;
                            }
                            other => {
                                warn!(%addr, ?other, "file socket did not identify itself");
                            }
                        }
                    });
                }
                Some((id, file_conn)) = identified_rx.recv() => {
                    match pending.remove(&id) {
                        Some(control_conn) => {
                            info!(id, "session paired");
                            session::spawn(self.room.clone(), id, control_conn, file_conn);
                        }
                        None => warn!(id, "file socket named an unknown session id"),
                    }
                }
            }
        }
    }
}
