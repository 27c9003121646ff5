//! End-to-end exercises of the engine through its public API: real loopback
//! sockets, a real watcher thread, `task::ChannelDispatcher` as the harness.

use std::net::SocketAddr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use sockio::task::ChannelDispatcher;
use sockio::{
    CancelMask, CompletionEvent, ErrorKind, EventKind, Family, ManagerConfig, OwnedBuffer,
    SocketError, SocketHandle, SocketKind, SocketManager, TaskHandle,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn new_manager() -> (SocketManager, Arc<ChannelDispatcher>) {
    let dispatcher = ChannelDispatcher::new();
    let manager = SocketManager::new(ManagerConfig::default(), dispatcher.clone()).unwrap();
    (manager, dispatcher)
}

fn new_task(dispatcher: &ChannelDispatcher) -> (Arc<dyn TaskHandle>, Receiver<CompletionEvent>) {
    let (task, rx) = dispatcher.spawn_task();
    (Arc::new(task) as Arc<dyn TaskHandle>, rx)
}

fn recv_event(rx: &Receiver<CompletionEvent>) -> CompletionEvent {
    rx.recv_timeout(TIMEOUT)
        .expect("completion event did not arrive in time")
}

fn loopback_udp(manager: &SocketManager) -> (SocketHandle, SocketAddr) {
    let sock = manager.create(SocketKind::Udp, Family::Inet).unwrap();
    sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = sock.getsockname().unwrap();
    (sock, addr)
}

#[test]
fn udp_ping_pong() {
    let (manager, dispatcher) = new_manager();
    let (a, addr_a) = loopback_udp(&manager);
    let (b, addr_b) = loopback_udp(&manager);

    let (recv_task, recv_rx) = new_task(&dispatcher);
    b.recv(
        Box::new(OwnedBuffer::with_capacity(64)),
        None,
        false,
        recv_task,
        1,
    )
    .unwrap();

    let (send_task, send_rx) = new_task(&dispatcher);
    a.sendto(
        Box::new(OwnedBuffer::from_vec(b"hello".to_vec())),
        addr_b,
        None,
        send_task,
        2,
    )
    .unwrap();

    let sent = recv_event(&send_rx);
    assert_eq!(sent.kind, EventKind::SendDone);
    assert!(sent.result.is_ok());

    let received = recv_event(&recv_rx);
    assert_eq!(received.kind, EventKind::RecvDone);
    assert!(received.result.is_ok());
    assert_eq!(received.n, 5);
    assert_eq!(received.addr, Some(addr_a));

    drop(a);
    drop(b);
    manager.shutdown();
}

#[test]
fn udp_truncation_is_reported() {
    let (manager, dispatcher) = new_manager();
    let (a, _addr_a) = loopback_udp(&manager);
    let (b, addr_b) = loopback_udp(&manager);

    let (recv_task, recv_rx) = new_task(&dispatcher);
    // A buffer far smaller than the datagram that is about to arrive.
    b.recv(
        Box::new(OwnedBuffer::with_capacity(2)),
        None,
        false,
        recv_task,
        1,
    )
    .unwrap();

    let (send_task, send_rx) = new_task(&dispatcher);
    a.sendto(
        Box::new(OwnedBuffer::from_vec(b"much too long".to_vec())),
        addr_b,
        None,
        send_task,
        2,
    )
    .unwrap();
    assert!(recv_event(&send_rx).result.is_ok());

    let received = recv_event(&recv_rx);
    assert!(received.result.is_ok());
    assert_eq!(received.n, 2);
    assert!(received.attrs.contains(sockio::CompletionAttrs::TRUNC));

    drop(a);
    drop(b);
    manager.shutdown();
}

#[test]
fn tcp_accept_and_connect() {
    let (manager, dispatcher) = new_manager();
    let listener = manager.create(SocketKind::Tcp, Family::Inet).unwrap();
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(16).unwrap();
    let listen_addr = listener.getsockname().unwrap();

    let (accept_task, accept_rx) = new_task(&dispatcher);
    listener.accept(accept_task, 10).unwrap();

    let client = manager.create(SocketKind::Tcp, Family::Inet).unwrap();
    let (connect_task, connect_rx) = new_task(&dispatcher);
    client.connect(listen_addr, connect_task, 20).unwrap();

    let connected = recv_event(&connect_rx);
    assert_eq!(connected.kind, EventKind::Connect);
    assert!(connected.result.is_ok());

    let accepted = recv_event(&accept_rx);
    assert_eq!(accepted.kind, EventKind::NewConn);
    assert!(accepted.result.is_ok());
    let server_peer = accepted.new_socket.expect("accept must hand back a socket");
    assert_eq!(server_peer.kind(), SocketKind::Tcp);

    drop(client);
    drop(server_peer);
    drop(listener);
    manager.shutdown();
}

#[test]
fn tcp_stream_then_orderly_shutdown_reports_eof() {
    let (manager, dispatcher) = new_manager();
    let listener = manager.create(SocketKind::Tcp, Family::Inet).unwrap();
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(16).unwrap();
    let listen_addr = listener.getsockname().unwrap();

    let (accept_task, accept_rx) = new_task(&dispatcher);
    listener.accept(accept_task, 10).unwrap();

    let client = manager.create(SocketKind::Tcp, Family::Inet).unwrap();
    let (connect_task, connect_rx) = new_task(&dispatcher);
    client.connect(listen_addr, connect_task, 20).unwrap();
    assert!(recv_event(&connect_rx).result.is_ok());
    let server = recv_event(&accept_rx)
        .new_socket
        .expect("accept must hand back a socket");

    let (send_task, send_rx) = new_task(&dispatcher);
    client
        .send(Box::new(OwnedBuffer::from_vec(b"abc".to_vec())), send_task, 1)
        .unwrap();
    assert!(recv_event(&send_rx).result.is_ok());

    let (recv_task, recv_rx) = new_task(&dispatcher);
    server
        .recv(Box::new(OwnedBuffer::with_capacity(3)), Some(3), false, recv_task, 2)
        .unwrap();
    let got = recv_event(&recv_rx);
    assert!(got.result.is_ok());
    assert_eq!(got.n, 3);

    drop(client);

    let (eof_task, eof_rx) = new_task(&dispatcher);
    server
        .recv(Box::new(OwnedBuffer::with_capacity(16)), None, false, eof_task, 3)
        .unwrap();
    let eof = recv_event(&eof_rx);
    assert!(matches!(eof.result, Err(SocketError::Eof)));

    drop(server);
    drop(listener);
    manager.shutdown();
}

#[test]
fn cancel_drains_queued_sends_with_canceled() {
    let (manager, dispatcher) = new_manager();
    let listener = manager.create(SocketKind::Tcp, Family::Inet).unwrap();
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(16).unwrap();
    let listen_addr = listener.getsockname().unwrap();

    let (accept_task, accept_rx) = new_task(&dispatcher);
    listener.accept(accept_task, 10).unwrap();
    let client = manager.create(SocketKind::Tcp, Family::Inet).unwrap();
    let (connect_task, connect_rx) = new_task(&dispatcher);
    client.connect(listen_addr, connect_task, 20).unwrap();
    assert!(recv_event(&connect_rx).result.is_ok());
    let server = recv_event(&accept_rx).new_socket.unwrap();

    // Queue a receive that nothing will ever satisfy, then cancel it.
    let (recv_task, recv_rx) = new_task(&dispatcher);
    client
        .recv(Box::new(OwnedBuffer::with_capacity(16)), Some(16), false, recv_task, 99)
        .unwrap();

    client.cancel(None, CancelMask::RECV);

    let canceled = recv_event(&recv_rx);
    assert_eq!(canceled.kind, EventKind::RecvDone);
    assert!(matches!(canceled.result, Err(SocketError::Canceled)));

    drop(client);
    drop(server);
    drop(listener);
    manager.shutdown();
}

#[test]
fn connect_to_closed_port_is_refused() {
    let (manager, dispatcher) = new_manager();

    // Bind a UDP socket to grab a port number, then drop it: nothing ever
    // listens on TCP for that port, so connecting to it should be refused.
    let probe = manager.create(SocketKind::Udp, Family::Inet).unwrap();
    probe.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = probe.getsockname().unwrap();
    drop(probe);

    let client = manager.create(SocketKind::Tcp, Family::Inet).unwrap();
    let (task, rx) = new_task(&dispatcher);
    client.connect(addr, task, 1).unwrap();

    let event = recv_event(&rx);
    assert_eq!(event.kind, EventKind::Connect);
    match &event.result {
        Err(err) => assert_eq!(err.kind(), ErrorKind::Connection),
        Ok(()) => panic!("connecting to a closed TCP port should not succeed"),
    }

    drop(client);
    manager.shutdown();
}
