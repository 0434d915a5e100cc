//! End-to-end coverage of the testable properties: datagram echo, accept
//! ordering, a failed connect, and unregistering from within a key's own
//! callback.

use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ioq::{AcceptOp, Callbacks, Config, ConnectCompletion, IoQueue, RecvOp, SendOp, Submit};

fn init() {
    let _ = env_logger::try_init();
}

fn poll_until(queue: &IoQueue, done: &AtomicBool, deadline: Duration) {
    let start = std::time::Instant::now();
    while !done.load(Ordering::Acquire) {
        if start.elapsed() > deadline {
            panic!("timed out waiting for completion");
        }
        queue.poll(Some(Duration::from_millis(50))).unwrap();
    }
}

#[test]
fn datagram_echo_completes_via_callback() {
    init();
    let queue = IoQueue::new(Config::new(8)).unwrap();

    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    a.connect(b.local_addr().unwrap()).unwrap();
    b.connect(a.local_addr().unwrap()).unwrap();

    let received = Arc::new(AtomicBool::new(false));
    let received2 = received.clone();

    let mut b_callbacks = Callbacks::default();
    b_callbacks.on_read_complete = Some(Box::new(move |completion| {
        assert_eq!(completion.result.unwrap(), 5);
        assert_eq!(&completion.op.buf[..5], b"hello");
        received2.store(true, Ordering::Release);
    }));
    let b_key = queue
        .register(b.into_raw_fd(), Box::new(()), b_callbacks, None)
        .unwrap();

    match b_key
        .recv(RecvOp {
            buf: vec![0u8; 64],
            flags: 0,
            from_addr: false,
        })
        .unwrap()
    {
        Submit::Pending => {}
        Submit::Immediate(_) => panic!("expected no datagram queued yet"),
    }

    let a_key = queue
        .register(a.into_raw_fd(), Box::new(()), Callbacks::default(), None)
        .unwrap();
    match a_key
        .send(SendOp {
            buf: b"hello".to_vec(),
            sent: 0,
            flags: 0,
            to: None,
        })
        .unwrap()
    {
        Submit::Immediate(5) => {}
        other => panic!("expected an inline 5-byte send, got {:?}", other),
    }

    poll_until(&queue, &received, Duration::from_secs(5));
}

#[test]
fn accept_dispatches_ahead_of_a_queued_read_on_the_same_key() {
    init();
    let queue = IoQueue::new(Config::new(8)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted = Arc::new(AtomicBool::new(false));
    let accepted2 = accepted.clone();
    let mut callbacks = Callbacks::default();
    callbacks.on_accept_complete = Some(Box::new(move |completion| {
        assert!(completion.result.is_ok());
        accepted2.store(true, Ordering::Release);
    }));
    let listener_key = queue
        .register(listener.into_raw_fd(), Box::new(()), callbacks, None)
        .unwrap();

    match listener_key
        .accept(AcceptOp {
            want_local_addr: false,
        })
        .unwrap()
    {
        Submit::Pending => {}
        Submit::Immediate(_) => panic!("expected no pending connection yet"),
    }

    let _client = TcpStream::connect(addr).unwrap();
    poll_until(&queue, &accepted, Duration::from_secs(5));
}

#[test]
fn connect_to_a_closed_port_completes_with_an_error() {
    init();
    let queue = IoQueue::new(Config::new(8)).unwrap();

    // Bind and immediately drop to obtain a port nothing is listening on.
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let socket = raw_tcp_socket();
    let failed = Arc::new(AtomicBool::new(false));
    let failed2 = failed.clone();
    let mut callbacks = Callbacks::default();
    callbacks.on_connect_complete = Some(Box::new(move |completion: ConnectCompletion| {
        assert!(completion.result.is_err());
        failed2.store(true, Ordering::Release);
    }));
    let key = queue
        .register(socket, Box::new(()), callbacks, None)
        .unwrap();

    match key.connect(addr).unwrap() {
        Submit::Pending => {}
        Submit::Immediate(()) => panic!("connect should not complete inline against a closed port"),
    }

    poll_until(&queue, &failed, Duration::from_secs(5));
}

#[test]
fn unregister_from_within_its_own_callback_does_not_deadlock() {
    init();
    let queue = IoQueue::new(Config::new(8)).unwrap();

    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    a.connect(b.local_addr().unwrap()).unwrap();
    b.connect(a.local_addr().unwrap()).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    let key_cell: Arc<std::sync::Mutex<Option<ioq::Key>>> = Arc::new(std::sync::Mutex::new(None));
    let key_cell2 = key_cell.clone();

    let mut b_callbacks = Callbacks::default();
    b_callbacks.on_read_complete = Some(Box::new(move |_completion| {
        let key = key_cell2.lock().unwrap().clone().unwrap();
        key.unregister().unwrap();
        done2.store(true, Ordering::Release);
    }));
    let b_key = queue
        .register(b.into_raw_fd(), Box::new(()), b_callbacks, None)
        .unwrap();
    *key_cell.lock().unwrap() = Some(b_key.clone());

    b_key
        .recv(RecvOp {
            buf: vec![0u8; 16],
            flags: 0,
            from_addr: false,
        })
        .unwrap();

    let a_key = queue
        .register(a.into_raw_fd(), Box::new(()), Callbacks::default(), None)
        .unwrap();
    a_key
        .send(SendOp {
            buf: b"hi".to_vec(),
            sent: 0,
            flags: 0,
            to: None,
        })
        .unwrap();

    poll_until(&queue, &done, Duration::from_secs(5));
    assert!(b_key.is_closing());
}

/// A bare `AF_INET`/`SOCK_STREAM` fd, unconnected, for tests that want to
/// drive `Key::connect` themselves rather than go through `std::net`.
fn raw_tcp_socket() -> RawFd {
    unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) }
}
