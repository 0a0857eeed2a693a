//! Stream socket scenarios driven through a deterministic reactor.

mod support;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keelson_core::data::Data;
use keelson_core::error::Error;
use keelson_core::options::{
    ConnectOptions, ReceiveOptions, SendOptions, SendToken, StreamSocketOptions,
};
use keelson_core::state::{Direction, ShutdownOrigin};
use keelson_net::handle::StreamHandle;
use keelson_net::monitor::{SocketEvent, SocketMonitor};
use keelson_net::reactor::{Reactor, ReactorRef};
use keelson_net::stream::StreamSocket;

use support::{FakeStreamHandle, TestReactor};

struct Fixture {
    reactor: Arc<TestReactor>,
    socket: Arc<StreamSocket>,
    handle: FakeStreamHandle,
    monitor: SocketMonitor,
}

fn connected_socket(options: StreamSocketOptions) -> Fixture {
    let reactor = TestReactor::create();
    let handle = FakeStreamHandle::new();
    let socket = StreamSocket::create_accepted(
        options,
        reactor.clone() as ReactorRef,
        Box::new(handle.clone()),
    )
    .expect("fixture socket opens");
    let monitor = socket.monitor();
    Fixture {
        reactor,
        socket,
        handle,
        monitor,
    }
}

fn drain_events(monitor: &SocketMonitor) -> Vec<SocketEvent> {
    monitor.try_iter().collect()
}

type SendOutcomes = Arc<Mutex<Vec<Result<usize, Error>>>>;

fn send_recorder() -> (
    SendOutcomes,
    impl Fn() -> keelson_core::queue::send::SendCallback,
) {
    let outcomes: SendOutcomes = Arc::new(Mutex::new(Vec::new()));
    let factory = {
        let outcomes = outcomes.clone();
        move || -> keelson_core::queue::send::SendCallback {
            let outcomes = outcomes.clone();
            Box::new(move |result| {
                outcomes
                    .lock()
                    .push(result.map(|context| context.bytes_sent));
            })
        }
    };
    (outcomes, factory)
}

#[test]
fn send_below_watermark_completes() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let (outcomes, callback) = send_recorder();

    // nothing fits in the kernel buffer yet: all 13 bytes queue
    fixture.handle.set_write_capacity(Some(0));
    fixture
        .socket
        .send(
            Data::from("Hello, world!"),
            &SendOptions::default(),
            Some(callback()),
        )
        .unwrap();
    fixture.reactor.pump();

    assert_eq!(fixture.socket.write_queue_size(), 13);
    assert!(fixture.reactor.is_writable_shown(fixture.handle.id()));
    assert!(outcomes.lock().is_empty());

    // the kernel drains on the writable event
    fixture.handle.set_write_capacity(None);
    assert!(fixture.reactor.fire_writable(fixture.handle.id()));

    assert_eq!(*outcomes.lock(), vec![Ok(13)]);
    assert_eq!(fixture.socket.write_queue_size(), 0);
    assert_eq!(fixture.handle.take_written(), b"Hello, world!");
    assert!(!fixture.reactor.is_writable_shown(fixture.handle.id()));
}

#[test]
fn backpressure_queue_full_then_low_watermark() {
    let options = StreamSocketOptions::default().with_write_queue_watermarks(3, 8);
    let fixture = connected_socket(options);
    let (outcomes, callback) = send_recorder();

    fixture.handle.set_write_capacity(Some(0));
    fixture
        .socket
        .send(Data::from("abcd"), &SendOptions::default(), Some(callback()))
        .unwrap();
    fixture
        .socket
        .send(Data::from("abcd"), &SendOptions::default(), Some(callback()))
        .unwrap();
    assert_eq!(fixture.socket.write_queue_size(), 8);

    // filling to the high watermark announced exactly one high event
    let events = drain_events(&fixture.monitor);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SocketEvent::WriteQueueHighWatermark { .. }))
            .count(),
        1
    );

    // a third send would breach the high watermark
    let error = fixture
        .socket
        .send(Data::from("X"), &SendOptions::default(), Some(callback()))
        .unwrap_err();
    assert_eq!(error, Error::QueueFull);
    assert_eq!(fixture.socket.write_queue_size(), 8);

    // draining five bytes crosses the low watermark: one low event
    fixture.handle.set_write_capacity(Some(5));
    fixture.reactor.fire_writable(fixture.handle.id());
    assert_eq!(fixture.socket.write_queue_size(), 3);

    let events = drain_events(&fixture.monitor);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SocketEvent::WriteQueueLowWatermark { .. }))
            .count(),
        1
    );
    // the first entry drained fully
    assert_eq!(*outcomes.lock(), vec![Ok(4)]);

    // a retried send now fits
    fixture
        .socket
        .send(Data::from("X"), &SendOptions::default(), Some(callback()))
        .unwrap();
    assert_eq!(fixture.socket.write_queue_size(), 4);
}

#[test]
fn cancel_by_token_completes_with_cancelled() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let (outcomes, _) = send_recorder();

    fixture.handle.set_write_capacity(Some(0));
    let token = SendToken::generate();
    let payload = vec![0u8; 100];
    let options = SendOptions::new()
        .with_token(token)
        .with_deadline(Instant::now() + Duration::from_secs(10));
    let recorder: keelson_core::queue::send::SendCallback = {
        let outcomes = outcomes.clone();
        Box::new(move |result| {
            outcomes.lock().push(match result {
                Ok(_) => Err(Error::Invalid),
                Err(error) => Err(error),
            });
        })
    };
    fixture
        .socket
        .send(Data::Buffer(payload.into()), &options, Some(recorder))
        .unwrap();
    assert_eq!(fixture.socket.write_queue_size(), 100);

    fixture.socket.cancel_send(token).unwrap();
    fixture.reactor.pump();

    assert_eq!(*outcomes.lock(), vec![Err(Error::Cancelled)]);
    assert_eq!(fixture.socket.write_queue_size(), 0);
    // the deadline timer was released with the entry
    assert_eq!(fixture.reactor.chronology().pending(), 0);

    // cancelling again finds nothing
    assert_eq!(fixture.socket.cancel_send(token), Err(Error::NotFound));
}

#[test]
fn cancel_of_in_progress_send_is_refused() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let token = SendToken::generate();

    // two of four bytes reach the kernel immediately
    fixture.handle.set_write_capacity(Some(2));
    fixture
        .socket
        .send(
            Data::from("abcd"),
            &SendOptions::new().with_token(token),
            None,
        )
        .unwrap();
    assert_eq!(fixture.socket.write_queue_size(), 2);

    assert_eq!(fixture.socket.cancel_send(token), Err(Error::InProgress));
    assert_eq!(fixture.socket.write_queue_size(), 2);
}

#[test]
fn send_deadline_times_out() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let (outcomes, callback) = send_recorder();

    fixture.handle.set_write_capacity(Some(0));
    let start = Instant::now();
    fixture
        .socket
        .send(
            Data::from("abcdef"),
            &SendOptions::new().with_deadline(start + Duration::from_millis(10)),
            Some(callback()),
        )
        .unwrap();

    fixture.reactor.advance(start + Duration::from_millis(20));
    assert_eq!(*outcomes.lock(), vec![Err(Error::TimedOut)]);
    assert_eq!(fixture.socket.write_queue_size(), 0);
}

#[test]
fn receive_waits_for_min_bytes() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let received: Arc<Mutex<Vec<Result<Vec<u8>, Error>>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let received = received.clone();
        fixture
            .socket
            .receive(
                &ReceiveOptions::new().with_min_bytes(5),
                Box::new(move |result| {
                    received
                        .lock()
                        .push(result.map(|context| context.data.to_bytes().to_vec()));
                }),
            )
            .unwrap();
    }
    fixture.reactor.pump();

    fixture.handle.push_incoming(b"abc");
    fixture.reactor.fire_readable(fixture.handle.id());
    assert!(received.lock().is_empty());
    assert_eq!(fixture.socket.read_queue_size(), 3);

    fixture.handle.push_incoming(b"de");
    fixture.reactor.fire_readable(fixture.handle.id());
    assert_eq!(*received.lock(), vec![Ok(b"abcde".to_vec())]);
    assert_eq!(fixture.socket.read_queue_size(), 0);
}

#[test]
fn receive_is_immediate_when_satisfied() {
    let fixture = connected_socket(StreamSocketOptions::default());

    fixture.handle.push_incoming(b"hello");
    fixture.reactor.fire_readable(fixture.handle.id());
    assert_eq!(fixture.socket.read_queue_size(), 5);

    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let received = received.clone();
        fixture
            .socket
            .receive(
                &ReceiveOptions::default(),
                Box::new(move |result| {
                    *received.lock() = Some(result.unwrap().data.to_bytes().to_vec());
                }),
            )
            .unwrap();
    }
    fixture.reactor.pump();
    assert_eq!(received.lock().as_deref(), Some(b"hello".as_slice()));
}

#[test]
fn remote_eof_fails_short_receives_with_end_of_stream() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let outcome: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    {
        let outcome = outcome.clone();
        fixture
            .socket
            .receive(
                &ReceiveOptions::new().with_min_bytes(10),
                Box::new(move |result| {
                    *outcome.lock() = result.err();
                }),
            )
            .unwrap();
    }

    fixture.handle.push_incoming(b"abc");
    fixture.handle.set_eof();
    fixture.reactor.fire_readable(fixture.handle.id());

    assert_eq!(*outcome.lock(), Some(Error::EndOfStream));
    let events = drain_events(&fixture.monitor);
    assert!(events.iter().any(|event| matches!(
        event,
        SocketEvent::ShutdownInitiated {
            origin: ShutdownOrigin::Remote
        }
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, SocketEvent::ShutdownReceive)));

    // bytes that arrived before the FIN stay deliverable
    let leftover: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let leftover = leftover.clone();
        fixture
            .socket
            .receive(
                &ReceiveOptions::default(),
                Box::new(move |result| {
                    *leftover.lock() = Some(result.unwrap().data.to_bytes().to_vec());
                }),
            )
            .unwrap();
    }
    fixture.reactor.pump();
    assert_eq!(leftover.lock().as_deref(), Some(b"abc".as_slice()));

    // once drained, a half-closed socket reports end of stream
    let error = fixture
        .socket
        .receive(&ReceiveOptions::default(), Box::new(|_| {}))
        .unwrap_err();
    assert_eq!(error, Error::EndOfStream);
}

#[test]
fn shutdown_flushes_queued_data_first() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let (outcomes, callback) = send_recorder();

    fixture.handle.set_write_capacity(Some(0));
    let payload = vec![b'A'; 100];
    fixture
        .socket
        .send(
            Data::Buffer(payload.into()),
            &SendOptions::default(),
            Some(callback()),
        )
        .unwrap();
    fixture.socket.shutdown(Direction::Send).unwrap();
    fixture.reactor.pump();

    // initiated, but the send side stays open until the queue drains
    let events = drain_events(&fixture.monitor);
    assert!(events.iter().any(|event| matches!(
        event,
        SocketEvent::ShutdownInitiated {
            origin: ShutdownOrigin::Source
        }
    )));
    assert!(!events
        .iter()
        .any(|event| matches!(event, SocketEvent::ShutdownSend)));
    assert!(fixture.handle.shutdowns().is_empty());

    // the queue drains fully, then the transport send side closes
    fixture.handle.set_write_capacity(None);
    fixture.reactor.fire_writable(fixture.handle.id());
    assert_eq!(*outcomes.lock(), vec![Ok(100)]);
    assert_eq!(fixture.handle.written_len(), 100);
    assert_eq!(fixture.handle.shutdowns(), vec![Direction::Send]);
    let events = drain_events(&fixture.monitor);
    assert!(events
        .iter()
        .any(|event| matches!(event, SocketEvent::ShutdownSend)));

    // a remote FIN completes the sequence
    fixture.handle.set_eof();
    fixture.reactor.fire_readable(fixture.handle.id());
    let events = drain_events(&fixture.monitor);
    assert!(events
        .iter()
        .any(|event| matches!(event, SocketEvent::ShutdownReceive)));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, SocketEvent::ShutdownComplete))
            .count(),
        1
    );

    // the socket is closed: further operations are refused
    assert_eq!(
        fixture
            .socket
            .send(Data::from("x"), &SendOptions::default(), None)
            .unwrap_err(),
        Error::Closed
    );
}

#[test]
fn close_completes_every_pending_operation_terminally() {
    let fixture = connected_socket(StreamSocketOptions::default());
    let (outcomes, callback) = send_recorder();
    let receive_outcome: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let closed = Arc::new(Mutex::new(0));

    fixture.handle.set_write_capacity(Some(0));
    fixture
        .socket
        .send(Data::from("pending"), &SendOptions::default(), Some(callback()))
        .unwrap();
    {
        let receive_outcome = receive_outcome.clone();
        fixture
            .socket
            .receive(
                &ReceiveOptions::new().with_min_bytes(100),
                Box::new(move |result| {
                    *receive_outcome.lock() = result.err();
                }),
            )
            .unwrap();
    }

    {
        let closed = closed.clone();
        fixture.socket.close(Some(Box::new(move || {
            *closed.lock() += 1;
        })));
    }
    fixture.reactor.pump();

    assert_eq!(*outcomes.lock(), vec![Err(Error::Closed)]);
    assert_eq!(*receive_outcome.lock(), Some(Error::Closed));
    assert_eq!(*closed.lock(), 1);
    assert!(!fixture.reactor.is_attached(fixture.handle.id()));

    let events = drain_events(&fixture.monitor);
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, SocketEvent::ShutdownComplete))
            .count(),
        1
    );

    // closing again only runs the callback
    let closed_again = Arc::new(Mutex::new(0));
    {
        let closed_again = closed_again.clone();
        fixture.socket.close(Some(Box::new(move || {
            *closed_again.lock() += 1;
        })));
    }
    fixture.reactor.pump();
    assert_eq!(*closed_again.lock(), 1);
    assert_eq!(
        drain_events(&fixture.monitor)
            .iter()
            .filter(|event| matches!(event, SocketEvent::ShutdownComplete))
            .count(),
        0
    );
}

#[test]
fn connect_completes_on_writable() {
    let reactor = TestReactor::create();
    let handle = FakeStreamHandle::new();
    let socket = StreamSocket::create(
        StreamSocketOptions::default(),
        reactor.clone() as ReactorRef,
        None,
    );
    let monitor = socket.monitor();
    socket.open_with_handle(Box::new(handle.clone())).unwrap();

    let outcome: Arc<Mutex<Option<Result<(), Error>>>> = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        socket
            .connect(
                &handle.remote_endpoint().unwrap(),
                ConnectOptions::default(),
                Box::new(move |result| {
                    *outcome.lock() = Some(result);
                }),
            )
            .unwrap();
    }
    reactor.pump();

    // connection pending: writable interest armed, no completion yet
    assert!(reactor.is_writable_shown(handle.id()));
    assert!(outcome.lock().is_none());

    // SO_ERROR is clean: the connection is up
    assert!(reactor.fire_writable(handle.id()));
    assert_eq!(*outcome.lock(), Some(Ok(())));
    assert!(reactor.is_readable_shown(handle.id()));
    assert!(!reactor.is_writable_shown(handle.id()));
    assert!(drain_events(&monitor)
        .iter()
        .any(|event| matches!(event, SocketEvent::Connected(_))));

    // a second connect is refused
    assert_eq!(
        socket
            .connect(
                &handle.remote_endpoint().unwrap(),
                ConnectOptions::default(),
                Box::new(|_| {}),
            )
            .unwrap_err(),
        Error::AlreadyOpen
    );
}

#[test]
fn connect_deadline_fails_with_timed_out() {
    let reactor = TestReactor::create();
    let handle = FakeStreamHandle::new();
    let socket = StreamSocket::create(
        StreamSocketOptions::default(),
        reactor.clone() as ReactorRef,
        None,
    );
    socket.open_with_handle(Box::new(handle.clone())).unwrap();

    let outcome: Arc<Mutex<Option<Result<(), Error>>>> = Arc::new(Mutex::new(None));
    let start = Instant::now();
    {
        let outcome = outcome.clone();
        socket
            .connect(
                &handle.remote_endpoint().unwrap(),
                ConnectOptions::new().with_deadline(start + Duration::from_millis(50)),
                Box::new(move |result| {
                    *outcome.lock() = Some(result);
                }),
            )
            .unwrap();
    }
    reactor.pump();
    assert!(outcome.lock().is_none());

    reactor.advance(start + Duration::from_millis(60));
    assert_eq!(*outcome.lock(), Some(Err(Error::TimedOut)));
}

#[test]
fn zero_copy_send_defers_until_acknowledged() {
    let options = StreamSocketOptions::default().with_zero_copy_threshold(4);
    let fixture = connected_socket(options);
    let (outcomes, callback) = send_recorder();

    // above the threshold: completion waits for the acknowledgement
    fixture
        .socket
        .send(
            Data::from("01234567"),
            &SendOptions::default(),
            Some(callback()),
        )
        .unwrap();
    fixture.reactor.pump();

    assert_eq!(*outcomes.lock(), vec![Ok(8)]);
    let events = drain_events(&fixture.monitor);
    assert!(events
        .iter()
        .any(|event| matches!(event, SocketEvent::ZeroCopyComplete { .. })));

    // below the threshold: the plain path completes directly
    fixture
        .socket
        .send(Data::from("ab"), &SendOptions::default(), Some(callback()))
        .unwrap();
    fixture.reactor.pump();
    assert_eq!(outcomes.lock().len(), 2);
    assert!(!drain_events(&fixture.monitor)
        .iter()
        .any(|event| matches!(event, SocketEvent::ZeroCopyComplete { .. })));
}

#[test]
fn read_queue_high_watermark_pauses_reading() {
    let options = StreamSocketOptions::default()
        .with_read_queue_watermarks(1, 4)
        .with_incoming_transfer_sizes(2, 2);
    let fixture = connected_socket(options);

    fixture.handle.push_incoming(b"0123456789");
    fixture.reactor.fire_readable(fixture.handle.id());

    // reading paused past the high watermark; bytes remain in the fake
    // kernel buffer
    assert!(fixture.socket.read_queue_size() > 4);
    assert!(fixture.socket.read_queue_size() < 10);
    assert!(!fixture.reactor.is_readable_shown(fixture.handle.id()));
    assert!(drain_events(&fixture.monitor)
        .iter()
        .any(|event| matches!(event, SocketEvent::ReadQueueHighWatermark { .. })));

    // receiving drains the queue and resumes reading
    let received: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    {
        let received = received.clone();
        fixture
            .socket
            .receive(
                &ReceiveOptions::default(),
                Box::new(move |result| {
                    *received.lock() = result.unwrap().data.len();
                }),
            )
            .unwrap();
    }
    fixture.reactor.pump();
    assert!(*received.lock() > 4);
    assert!(fixture.reactor.is_readable_shown(fixture.handle.id()));
}
