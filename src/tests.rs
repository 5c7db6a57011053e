//! End-to-end scenarios driving a real broker over loopback TCP with raw
//! framed peers.

use crate::broker::Broker;
use crate::connection::Connection;
use crate::frame::{Frame, QUIT_NOTICE};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// One raw participant: both sockets, handshake already done.
struct TestPeer {
    id: u32,
    control: Connection,
    file: Connection,
}

async fn start_broker() -> (u16, u16) {
    let broker = Broker::bind(0, 0).await.unwrap();
    let control_port = broker.control_addr().unwrap().port();
    let file_port = broker.file_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = broker.run().await;
    });
    (control_port, file_port)
}

async fn join_peer(control_port: u16, file_port: u16) -> TestPeer {
    let socket = TcpStream::connect(("127.0.0.1", control_port)).await.unwrap();
    let mut control = Connection::new(socket);

    let id = match control.read_frame().await.unwrap() {
        Some(Frame::Hello { id }) => id,
        other => panic!("expected id assignment, got {other:?}"),
    };

    let socket = TcpStream::connect(("127.0.0.1", file_port)).await.unwrap();
    let mut file = Connection::new(socket);
    file.write_frame(&Frame::Hello { id }).await.unwrap();

    TestPeer { id, control, file }
}

/// Give the broker a moment to finish pairing and room bookkeeping.
async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

async fn expect_frame(conn: &mut Connection) -> Frame {
    timeout(Duration::from_secs(2), conn.read_frame())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("connection closed")
}

async fn expect_control_quiet(conn: &mut Connection) {
    let res = timeout(Duration::from_millis(200), conn.read_frame()).await;
    assert!(res.is_err(), "expected silence, got {res:?}");
}

async fn expect_file_quiet(conn: &mut Connection) {
    let res = timeout(Duration::from_millis(200), conn.read_chunk(16)).await;
    assert!(res.is_err(), "expected silence, got {res:?}");
}

async fn read_exact(conn: &mut Connection, count: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(count);
    while data.len() < count {
        let chunk = timeout(Duration::from_secs(2), conn.read_chunk(count - data.len()))
            .await
            .expect("timed out waiting for file bytes")
            .unwrap()
            .expect("file connection closed");
        data.extend_from_slice(&chunk);
    }
    data
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[tokio::test]
async fn session_ids_are_assigned_monotonically() {
    let (cp, fp) = start_broker().await;
    let a = join_peer(cp, fp).await;
    let b = join_peer(cp, fp).await;
    let c = join_peer(cp, fp).await;

    assert_eq!(a.id, 1);
    assert_eq!(b.id, 2);
    assert_eq!(c.id, 3);
}

#[tokio::test]
async fn chat_reaches_every_other_participant_in_order() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    let mut c = join_peer(cp, fp).await;
    settle().await;

    let first = Frame::Chat("hi".to_string());
    let second = Frame::Chat("there".to_string());
    a.control.write_frame(&first).await.unwrap();
    a.control.write_frame(&second).await.unwrap();

    for peer in [&mut b, &mut c] {
        assert_eq!(expect_frame(&mut peer.control).await, first);
        assert_eq!(expect_frame(&mut peer.control).await, second);
    }
    expect_control_quiet(&mut a.control).await;
}

#[tokio::test]
async fn quit_broadcasts_a_leave_notice() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    let mut c = join_peer(cp, fp).await;
    settle().await;

    a.control
        .write_frame(&Frame::Quit(QUIT_NOTICE.to_string()))
        .await
        .unwrap();

    let notice = Frame::Chat(format!("[Server] User {} has left the room.", a.id));
    assert_eq!(expect_frame(&mut b.control).await, notice);
    assert_eq!(expect_frame(&mut c.control).await, notice);
    expect_control_quiet(&mut b.control).await;
    expect_control_quiet(&mut c.control).await;
}

#[tokio::test]
async fn file_fan_out_streams_to_acceptors_only() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    let mut c = join_peer(cp, fp).await;
    settle().await;

    let data = payload(10240);
    let announce = Frame::FileStart {
        size: 10240,
        name: "X".to_string(),
    };
    a.control.write_frame(&announce).await.unwrap();

    // every peer sees the announce with size and name intact
    assert_eq!(expect_frame(&mut b.control).await, announce);
    assert_eq!(expect_frame(&mut c.control).await, announce);

    b.control.write_frame(&Frame::FileAccept).await.unwrap();
    c.control.write_frame(&Frame::FileRefuse).await.unwrap();

    // both responses in: the go signal arrives on the sender's file socket
    assert_eq!(expect_frame(&mut a.file).await, Frame::FileAccept);
    a.file.write_chunk(&data).await.unwrap();

    assert_eq!(read_exact(&mut b.file, 10240).await, data);
    expect_file_quiet(&mut c.file).await;

    // the reader's completion comes back to the sender
    b.control.write_frame(&Frame::FileDone).await.unwrap();
    assert_eq!(expect_frame(&mut a.control).await, Frame::FileDone);
}

#[tokio::test]
async fn refused_by_everyone_means_no_bytes_flow() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    let mut c = join_peer(cp, fp).await;
    settle().await;

    a.control
        .write_frame(&Frame::FileStart {
            size: 10240,
            name: "X".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        expect_frame(&mut b.control).await,
        Frame::FileStart { .. }
    ));
    assert!(matches!(
        expect_frame(&mut c.control).await,
        Frame::FileStart { .. }
    ));

    b.control.write_frame(&Frame::FileRefuse).await.unwrap();
    c.control.write_frame(&Frame::FileRefuse).await.unwrap();

    assert_eq!(expect_frame(&mut a.file).await, Frame::FileRefuse);
    expect_file_quiet(&mut b.file).await;
    expect_file_quiet(&mut c.file).await;
}

#[tokio::test]
async fn reader_leaving_mid_stream_does_not_disturb_the_rest() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    let mut c = join_peer(cp, fp).await;
    settle().await;

    let data = payload(8192);
    a.control
        .write_frame(&Frame::FileStart {
            size: 8192,
            name: "X".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        expect_frame(&mut b.control).await,
        Frame::FileStart { .. }
    ));
    assert!(matches!(
        expect_frame(&mut c.control).await,
        Frame::FileStart { .. }
    ));
    b.control.write_frame(&Frame::FileAccept).await.unwrap();
    c.control.write_frame(&Frame::FileAccept).await.unwrap();
    assert_eq!(expect_frame(&mut a.file).await, Frame::FileAccept);

    // first half, then the third participant drops both sockets
    a.file.write_chunk(&data[..4096]).await.unwrap();
    settle().await;
    drop(c);
    settle().await;
    a.file.write_chunk(&data[4096..]).await.unwrap();

    // the remaining reader sees the whole file without a gap
    assert_eq!(read_exact(&mut b.file, 8192).await, data);

    b.control.write_frame(&Frame::FileDone).await.unwrap();
    assert_eq!(expect_frame(&mut a.control).await, Frame::FileDone);
}

#[tokio::test]
async fn unknown_command_is_answered_to_the_sender_only() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    settle().await;

    a.control
        .write_frame(&Frame::from_line("-wiggle"))
        .await
        .unwrap();

    match expect_frame(&mut a.control).await {
        Frame::Chat(body) => assert!(
            body.starts_with("[Server] Unknown command"),
            "unexpected reply: {body}"
        ),
        other => panic!("expected a chat reply, got {other:?}"),
    }
    expect_control_quiet(&mut b.control).await;
}

#[tokio::test]
async fn sender_cancel_before_go_unblocks_everyone() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    settle().await;

    a.control
        .write_frame(&Frame::FileStart {
            size: 4096,
            name: "X".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        expect_frame(&mut b.control).await,
        Frame::FileStart { .. }
    ));

    // the sender thinks better of it before anyone responds
    a.control.write_frame(&Frame::FileCancel).await.unwrap();

    // the prospective reader hears about it on the file channel, and the
    // sender's own wait for the go signal resolves
    assert_eq!(expect_frame(&mut b.file).await, Frame::FileCancel);
    assert_eq!(expect_frame(&mut a.file).await, Frame::FileCancel);
}

#[tokio::test]
async fn empty_frames_are_ignored() {
    let (cp, fp) = start_broker().await;
    let mut a = join_peer(cp, fp).await;
    let mut b = join_peer(cp, fp).await;
    settle().await;

    a.control.write_frame(&Frame::Empty).await.unwrap();
    a.control
        .write_frame(&Frame::Chat("still here".to_string()))
        .await
        .unwrap();

    assert_eq!(
        expect_frame(&mut b.control).await,
        Frame::Chat("still here".to_string())
    );
}
