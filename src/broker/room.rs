// Room: membership, broadcast, and per-sender file-transfer coordination.
//
// The room separates routing from transport. It holds a non-owning handle
// per participant (the mpsc senders feeding that participant's writer
// tasks) and a `Transfer` entry per active sender. All mutations happen
// under one mutex; deliveries are collected while locked and performed
// after the lock is released, so slow peers never extend the critical
// section. The per-queue FIFO property comes from the channels themselves.

use crate::frame::Frame;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SessionId = u32;

/// High watermark for a reader's queued file chunks. A full queue suspends
/// the sender's pump, which in turn stops reading the sender's file socket;
/// backpressure reaches the sending client through TCP.
pub const FILE_QUEUE_CHUNKS: usize = 32;

/// Control-frame queue depth per session.
pub const CONTROL_QUEUE_FRAMES: usize = 64;

/// Items queued for a session's file socket: framed control messages (the
/// go signal, cancels) and raw bulk chunks, delivered strictly in order.
#[derive(Debug)]
pub enum FileOut {
    Frame(Frame),
    Chunk(Bytes),
}

/// Instruction for a session's file pump to consume one announced transfer.
#[derive(Debug, Clone, Copy)]
pub struct PumpStart {
    pub size: u32,
}

/// The room's view of one participant: its id, the queues feeding its two
/// sockets, and the token that tears its tasks down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub control_tx: mpsc::Sender<Frame>,
    pub file_tx: mpsc::Sender<FileOut>,
    pub pump_tx: mpsc::Sender<PumpStart>,
    pub cancel: CancellationToken,
}

/// One sender's active transfer. `pending` holds the peers that have not
/// yet answered the announce; tracking the set rather than a bare counter
/// means a duplicate response cannot decrement twice. The entry itself is
/// the transfer: removing it is the terminal transition for every outcome.
#[derive(Debug)]
struct Transfer {
    readers: HashSet<SessionId>,
    pending: HashSet<SessionId>,
    size: u32,
    streaming: bool,
}

#[derive(Debug, Default)]
struct RoomState {
    participants: HashMap<SessionId, SessionHandle>,
    transfers: HashMap<SessionId, Transfer>,
    awaiters: HashSet<SessionId>,
}

/// A delivery decided under the lock, performed after it is released.
enum Outbound {
    Control(mpsc::Sender<Frame>, Frame),
    File(mpsc::Sender<FileOut>, FileOut),
    Pump(mpsc::Sender<PumpStart>, PumpStart),
}

async fn dispatch(outbound: Vec<Outbound>) {
    for item in outbound {
        // A failed send means the recipient is already tearing down.
        match item {
            Outbound::Control(tx, frame) => {
                let _ = tx.send(frame).await;
            }
            Outbound::File(tx, out) => {
                let _ = tx.send(out).await;
            }
            Outbound::Pump(tx, start) => {
                let _ = tx.send(start).await;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Room {
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new() -> Room {
        Room::default()
    }

    /// Add a participant.
    pub fn join(&self, handle: SessionHandle) {
        let mut state = self.state.lock().unwrap();
        info!(id = handle.id, "participant joined");
        state.participants.insert(handle.id, handle);
    }

    /// Remove a participant and everything it owed the room: its own
    /// transfer, its slot in every reader set, and any response the other
    /// senders were still waiting on (a vanished peer counts as a refusal).
    pub async fn leave(&self, id: SessionId) {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(handle) = state.participants.remove(&id) else {
                return;
            };
            handle.cancel.cancel();
            state.awaiters.remove(&id);

            if let Some(transfer) = state.transfers.remove(&id) {
                for reader in &transfer.readers {
                    if let Some(h) = state.participants.get(reader) {
                        out.push(Outbound::File(
                            h.file_tx.clone(),
                            FileOut::Frame(Frame::FileCancel),
                        ));
                    }
                }
            }

            let senders: Vec<SessionId> = state.transfers.keys().copied().collect();
            for sender in senders {
                let (abandoned, resolved) = {
                    let Some(transfer) = state.transfers.get_mut(&sender) else {
                        continue;
                    };
                    transfer.readers.remove(&id);
                    let responded = transfer.pending.remove(&id);
                    (
                        transfer.streaming && transfer.readers.is_empty(),
                        responded && transfer.pending.is_empty(),
                    )
                };
                if abandoned {
                    state.transfers.remove(&sender);
                    warn!(sender, "transfer abandoned: no readers remain");
                } else if resolved {
                    Self::resolve(&mut state, sender, &mut out);
                }
            }

            info!(id, "participant left");
        }
        dispatch(out).await;
    }

    /// Deliver `frame` to every participant except `sender`.
    pub async fn broadcast(&self, frame: Frame, sender: SessionId) {
        let targets: Vec<mpsc::Sender<Frame>> = {
            let state = self.state.lock().unwrap();
            state
                .participants
                .values()
                .filter(|h| h.id != sender)
                .map(|h| h.control_tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(frame.clone()).await;
        }
    }

    /// Deliver `frame` to every participant, `sender` included.
    pub async fn broadcast_all(&self, frame: Frame) {
        let targets: Vec<mpsc::Sender<Frame>> = {
            let state = self.state.lock().unwrap();
            state
                .participants
                .values()
                .map(|h| h.control_tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(frame.clone()).await;
        }
    }

    /// A sender announced a transfer: snapshot every other participant as a
    /// prospective reader, forward the announce to each of them, and wait
    /// for their verdicts. A sender with an unresolved announce, or alone
    /// in the room, is refused outright on its file socket.
    pub async fn file_announce(&self, size: u32, name: String, sender: SessionId) {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(handle) = state.participants.get(&sender) else {
                return;
            };
            let sender_file_tx = handle.file_tx.clone();

            if state.awaiters.contains(&sender) || state.transfers.contains_key(&sender) {
                warn!(sender, "announce while a transfer is unresolved; refusing");
                out.push(Outbound::File(
                    sender_file_tx,
                    FileOut::Frame(Frame::FileRefuse),
                ));
            } else {
                let readers: HashSet<SessionId> = state
                    .participants
                    .keys()
                    .copied()
                    .filter(|&p| p != sender)
                    .collect();

                if readers.is_empty() {
                    debug!(sender, "announce with no peers; refusing");
                    out.push(Outbound::File(
                        sender_file_tx,
                        FileOut::Frame(Frame::FileRefuse),
                    ));
                } else {
                    info!(sender, size, %name, peers = readers.len(), "transfer announced");
                    for reader in &readers {
                        if let Some(h) = state.participants.get(reader) {
                            out.push(Outbound::Control(
                                h.control_tx.clone(),
                                Frame::FileStart {
                                    size,
                                    name: name.clone(),
                                },
                            ));
                        }
                    }
                    state.awaiters.insert(sender);
                    state.transfers.insert(
                        sender,
                        Transfer {
                            pending: readers.clone(),
                            readers,
                            size,
                            streaming: false,
                        },
                    );
                }
            }
        }
        dispatch(out).await;
    }

    /// A participant accepted an announce. Responses are not tagged with a
    /// target, so they count towards every awaiting sender except the
    /// responder itself; each sender registers at most one response per
    /// peer.
    pub async fn file_accept(&self, responder: SessionId) {
        self.respond(responder, true).await;
    }

    /// A participant refused an announce: as `file_accept`, but the
    /// responder also drops out of the reader set.
    pub async fn file_refuse(&self, responder: SessionId) {
        self.respond(responder, false).await;
    }

    async fn respond(&self, responder: SessionId, accepted: bool) {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let awaiting: Vec<SessionId> = state
                .awaiters
                .iter()
                .copied()
                .filter(|&s| s != responder)
                .collect();

            for sender in awaiting {
                let resolved = match state.transfers.get_mut(&sender) {
                    Some(transfer) => {
                        if !transfer.pending.remove(&responder) {
                            continue;
                        }
                        if !accepted {
                            transfer.readers.remove(&responder);
                        }
                        transfer.pending.is_empty()
                    }
                    None => continue,
                };
                if resolved {
                    Self::resolve(&mut state, sender, &mut out);
                }
            }
        }
        dispatch(out).await;
    }

    /// Fan a chunk out to the sender's current reader set, in arrival
    /// order. Returns `false` once the transfer no longer exists, so the
    /// pump can drain the remaining announced bytes without routing them.
    pub async fn file_chunk(&self, data: Bytes, sender: SessionId) -> bool {
        let targets: Vec<mpsc::Sender<FileOut>> = {
            let state = self.state.lock().unwrap();
            match state.transfers.get(&sender) {
                Some(transfer) if transfer.streaming => transfer
                    .readers
                    .iter()
                    .filter_map(|r| state.participants.get(r))
                    .map(|h| h.file_tx.clone())
                    .collect(),
                _ => return false,
            }
        };
        for tx in targets {
            let _ = tx.send(FileOut::Chunk(data.clone())).await;
        }
        true
    }

    /// A sender terminated its own transfer (`FileCancel` or
    /// `FileCancelAll` on the wire; `frame` is forwarded as received).
    /// Every remaining reader sees the frame on its file queue. A sender
    /// still blocked waiting for the go signal gets `FileCancel` on its own
    /// file queue so it unblocks and moves on.
    pub async fn file_cancel(&self, frame: Frame, sender: SessionId) {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.awaiters.remove(&sender);
            match state.transfers.remove(&sender) {
                Some(transfer) => {
                    for reader in &transfer.readers {
                        if let Some(h) = state.participants.get(reader) {
                            out.push(Outbound::File(
                                h.file_tx.clone(),
                                FileOut::Frame(frame.clone()),
                            ));
                        }
                    }
                    if !transfer.streaming {
                        if let Some(h) = state.participants.get(&sender) {
                            out.push(Outbound::File(
                                h.file_tx.clone(),
                                FileOut::Frame(Frame::FileCancel),
                            ));
                        }
                    }
                    info!(sender, "transfer cancelled");
                }
                None => debug!(sender, "cancel with no active transfer"),
            }
        }
        dispatch(out).await;
    }

    /// `FileDone` arrived from `from`. As a reader, it has consumed the
    /// announced byte count: prune it from every streaming transfer, and
    /// when a sender's last reader completes, clear the entry and notify
    /// the sender on its control socket. As a sender, done terminates its
    /// own transfer the same way a cancel does.
    pub async fn file_done(&self, from: SessionId) {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock().unwrap();

            let senders: Vec<SessionId> = state.transfers.keys().copied().collect();
            for sender in senders {
                if sender == from {
                    continue;
                }
                let finished = {
                    let Some(transfer) = state.transfers.get_mut(&sender) else {
                        continue;
                    };
                    if !(transfer.streaming && transfer.readers.remove(&from)) {
                        continue;
                    }
                    transfer.readers.is_empty()
                };
                if finished {
                    state.transfers.remove(&sender);
                    if let Some(h) = state.participants.get(&sender) {
                        out.push(Outbound::Control(h.control_tx.clone(), Frame::FileDone));
                    }
                    info!(sender, "transfer complete");
                }
            }

            state.awaiters.remove(&from);
            if let Some(transfer) = state.transfers.remove(&from) {
                for reader in &transfer.readers {
                    if let Some(h) = state.participants.get(reader) {
                        out.push(Outbound::File(
                            h.file_tx.clone(),
                            FileOut::Frame(Frame::FileDone),
                        ));
                    }
                }
            }
        }
        dispatch(out).await;
    }

    /// A sender's pending set emptied: start streaming if any reader
    /// accepted, refuse otherwise. Either way the sender stops awaiting.
    fn resolve(state: &mut RoomState, sender: SessionId, out: &mut Vec<Outbound>) {
        state.awaiters.remove(&sender);

        let (file_tx, pump_tx) = match state.participants.get(&sender) {
            Some(h) => (h.file_tx.clone(), h.pump_tx.clone()),
            None => {
                state.transfers.remove(&sender);
                return;
            }
        };

        let start = match state.transfers.get_mut(&sender) {
            Some(transfer) if !transfer.readers.is_empty() => {
                transfer.streaming = true;
                Some(transfer.size)
            }
            _ => None,
        };

        match start {
            Some(size) => {
                info!(sender, size, "transfer starting");
                out.push(Outbound::File(file_tx, FileOut::Frame(Frame::FileAccept)));
                out.push(Outbound::Pump(pump_tx, PumpStart { size }));
            }
            None => {
                info!(sender, "transfer refused by every peer");
                state.transfers.remove(&sender);
                out.push(Outbound::File(file_tx, FileOut::Frame(Frame::FileRefuse)));
            }
        }
    }
}

#[cfg(test)]
impl Room {
    fn participant_ids(&self) -> HashSet<SessionId> {
        self.state
            .lock()
            .unwrap()
            .participants
            .keys()
            .copied()
            .collect()
    }

    fn reader_set(&self, sender: SessionId) -> Option<HashSet<SessionId>> {
        self.state
            .lock()
            .unwrap()
            .transfers
            .get(&sender)
            .map(|t| t.readers.clone())
    }

    fn pending_count(&self, sender: SessionId) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .transfers
            .get(&sender)
            .map(|t| t.pending.len())
    }

    fn is_awaiting(&self, sender: SessionId) -> bool {
        self.state.lock().unwrap().awaiters.contains(&sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        handle: SessionHandle,
        control_rx: mpsc::Receiver<Frame>,
        file_rx: mpsc::Receiver<FileOut>,
        pump_rx: mpsc::Receiver<PumpStart>,
    }

    fn stub(id: SessionId) -> Stub {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_FRAMES);
        let (file_tx, file_rx) = mpsc::channel(FILE_QUEUE_CHUNKS);
        let (pump_tx, pump_rx) = mpsc::channel(4);
        Stub {
            handle: SessionHandle {
                id,
                control_tx,
                file_tx,
                pump_tx,
                cancel: CancellationToken::new(),
            },
            control_rx,
            file_rx,
            pump_rx,
        }
    }

    fn room_with(ids: &[SessionId]) -> (Room, Vec<Stub>) {
        let room = Room::new();
        let stubs: Vec<Stub> = ids.iter().map(|&id| stub(id)).collect();
        for s in &stubs {
            room.join(s.handle.clone());
        }
        (room, stubs)
    }

    fn assert_reader_invariant(room: &Room, sender: SessionId) {
        // readers[s] is always a subset of participants minus the sender
        if let Some(readers) = room.reader_set(sender) {
            let participants = room.participant_ids();
            assert!(!readers.contains(&sender));
            assert!(readers.is_subset(&participants));
        }
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);

        room.broadcast(Frame::Chat("hi".to_string()), 1).await;

        assert_eq!(
            stubs[1].control_rx.recv().await,
            Some(Frame::Chat("hi".to_string()))
        );
        assert_eq!(
            stubs[2].control_rx.recv().await,
            Some(Frame::Chat("hi".to_string()))
        );
        assert!(stubs[0].control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn announce_forwards_to_every_peer() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);

        room.file_announce(10240, "X".to_string(), 1).await;

        let expected = Frame::FileStart {
            size: 10240,
            name: "X".to_string(),
        };
        assert_eq!(stubs[1].control_rx.recv().await, Some(expected.clone()));
        assert_eq!(stubs[2].control_rx.recv().await, Some(expected));
        assert!(room.is_awaiting(1));
        assert_eq!(room.pending_count(1), Some(2));
        assert_reader_invariant(&room, 1);
    }

    #[tokio::test]
    async fn mixed_responses_start_streaming_to_acceptors() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);
        room.file_announce(10240, "X".to_string(), 1).await;

        room.file_accept(2).await;
        assert!(room.is_awaiting(1));
        assert_eq!(room.pending_count(1), Some(1));

        room.file_refuse(3).await;
        assert!(!room.is_awaiting(1));
        assert_eq!(room.reader_set(1), Some(HashSet::from([2])));
        assert_reader_invariant(&room, 1);

        // the go signal on the sender's file queue, then the pump order
        assert!(matches!(
            stubs[0].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileAccept))
        ));
        assert_eq!(stubs[0].pump_rx.recv().await.map(|p| p.size), Some(10240));
    }

    #[tokio::test]
    async fn duplicate_response_counts_once() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);
        room.file_announce(4096, "X".to_string(), 1).await;

        room.file_accept(2).await;
        room.file_accept(2).await;

        // still waiting on the third participant
        assert!(room.is_awaiting(1));
        assert_eq!(room.pending_count(1), Some(1));
        assert!(stubs[0].pump_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn all_refuse_refuses_the_sender() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);
        room.file_announce(10240, "X".to_string(), 1).await;

        room.file_refuse(2).await;
        room.file_refuse(3).await;

        assert!(!room.is_awaiting(1));
        assert_eq!(room.reader_set(1), None);
        assert!(matches!(
            stubs[0].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileRefuse))
        ));
        assert!(stubs[0].pump_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn announce_with_no_peers_is_refused() {
        let (room, mut stubs) = room_with(&[1]);
        room.file_announce(4096, "X".to_string(), 1).await;

        assert_eq!(room.reader_set(1), None);
        assert!(!room.is_awaiting(1));
        assert!(matches!(
            stubs[0].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileRefuse))
        ));
    }

    #[tokio::test]
    async fn second_announce_while_unresolved_is_refused() {
        let (room, mut stubs) = room_with(&[1, 2]);
        room.file_announce(4096, "X".to_string(), 1).await;
        room.file_announce(4096, "Y".to_string(), 1).await;

        assert!(matches!(
            stubs[0].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileRefuse))
        ));
        // the original announce is untouched
        assert!(room.is_awaiting(1));
        assert_eq!(room.pending_count(1), Some(1));
    }

    #[tokio::test]
    async fn chunks_reach_only_accepting_readers() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);
        room.file_announce(8, "X".to_string(), 1).await;
        room.file_accept(2).await;
        room.file_refuse(3).await;

        assert!(room.file_chunk(Bytes::from_static(b"abcd"), 1).await);
        assert!(room.file_chunk(Bytes::from_static(b"efgh"), 1).await);

        match stubs[1].file_rx.recv().await {
            Some(FileOut::Chunk(data)) => assert_eq!(&data[..], b"abcd"),
            other => panic!("expected first chunk, got {other:?}"),
        }
        match stubs[1].file_rx.recv().await {
            Some(FileOut::Chunk(data)) => assert_eq!(&data[..], b"efgh"),
            other => panic!("expected second chunk, got {other:?}"),
        }
        assert!(stubs[2].file_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chunk_without_transfer_reports_gone() {
        let (room, _stubs) = room_with(&[1, 2]);
        assert!(!room.file_chunk(Bytes::from_static(b"abcd"), 1).await);
    }

    #[tokio::test]
    async fn cancel_clears_transfer_and_notifies_readers() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);
        room.file_announce(4096, "X".to_string(), 1).await;

        room.file_cancel(Frame::FileCancel, 1).await;

        assert_eq!(room.reader_set(1), None);
        assert!(!room.is_awaiting(1));
        assert!(matches!(
            stubs[1].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileCancel))
        ));
        assert!(matches!(
            stubs[2].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileCancel))
        ));
        // the sender was still awaiting the go signal, so it gets unblocked
        assert!(matches!(
            stubs[0].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileCancel))
        ));
    }

    #[tokio::test]
    async fn reader_done_prunes_and_last_one_notifies_sender() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);
        room.file_announce(4096, "X".to_string(), 1).await;
        room.file_accept(2).await;
        room.file_accept(3).await;

        room.file_done(2).await;
        assert_eq!(room.reader_set(1), Some(HashSet::from([3])));
        assert!(stubs[0].control_rx.try_recv().is_err());

        room.file_done(3).await;
        assert_eq!(room.reader_set(1), None);
        assert!(!room.is_awaiting(1));
        assert_eq!(stubs[0].control_rx.recv().await, Some(Frame::FileDone));
    }

    #[tokio::test]
    async fn leave_counts_as_refusal_for_pending_announces() {
        let (room, mut stubs) = room_with(&[1, 2, 3]);
        room.file_announce(4096, "X".to_string(), 1).await;
        room.file_accept(2).await;

        room.leave(3).await;

        // the vanished peer resolved the announce; streaming starts to 2
        assert!(!room.is_awaiting(1));
        assert_eq!(room.reader_set(1), Some(HashSet::from([2])));
        assert!(matches!(
            stubs[0].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileAccept))
        ));
        assert_reader_invariant(&room, 1);
    }

    #[tokio::test]
    async fn leave_mid_stream_shrinks_the_reader_set() {
        let (room, _stubs) = room_with(&[1, 2, 3]);
        room.file_announce(8192, "X".to_string(), 1).await;
        room.file_accept(2).await;
        room.file_accept(3).await;

        room.leave(3).await;

        assert_eq!(room.reader_set(1), Some(HashSet::from([2])));
        assert!(room.file_chunk(Bytes::from_static(b"data"), 1).await);
        assert_reader_invariant(&room, 1);
    }

    #[tokio::test]
    async fn leave_of_last_reader_abandons_the_transfer() {
        let (room, _stubs) = room_with(&[1, 2]);
        room.file_announce(4096, "X".to_string(), 1).await;
        room.file_accept(2).await;

        room.leave(2).await;

        assert_eq!(room.reader_set(1), None);
        assert!(!room.file_chunk(Bytes::from_static(b"data"), 1).await);
    }

    #[tokio::test]
    async fn leaving_sender_cancels_its_readers() {
        let (room, mut stubs) = room_with(&[1, 2]);
        room.file_announce(4096, "X".to_string(), 1).await;
        room.file_accept(2).await;

        room.leave(1).await;

        assert_eq!(room.participant_ids(), HashSet::from([2]));
        assert!(matches!(
            stubs[1].file_rx.recv().await,
            Some(FileOut::Frame(Frame::FileCancel))
        ));
    }
}
