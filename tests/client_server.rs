use std::io::{Read, Write};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use may::go;
use may::net::{TcpListener, TcpStream};
use vrpc::{encode, write_frame, Client, Error, FrameReader, Server, ServerInstance};

const REVERSE: (u32, u32) = (7, 3);
const UPPER: (u32, u32) = (7, 4);

fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        // room for panic unwinding inside handlers
        may::config().set_stack_size(0x8000);
    });
}

fn start_server(server: &Server) -> ServerInstance {
    init();
    server.register(REVERSE.0, REVERSE.1, |req| req.iter().rev().copied().collect());
    server.register(UPPER.0, UPPER.1, |req| req.to_ascii_uppercase());
    server.start("127.0.0.1:0").unwrap()
}

fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}

// read until the peer closes, true if it did
fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(_) => return true,
        }
    }
}

#[test]
fn dispatch_to_registered_handler() {
    let server = Server::new();
    let instance = start_server(&server);
    let client = Client::connect(instance.local_addr()).unwrap();

    let rsp = client.request(REVERSE.0, REVERSE.1, b"hello").unwrap();
    assert_eq!(&rsp[..], b"olleh");
    let rsp = client.request(UPPER.0, UPPER.1, b"hello").unwrap();
    assert_eq!(&rsp[..], b"HELLO");
    // empty bodies travel too
    let rsp = client.request(REVERSE.0, REVERSE.1, b"").unwrap();
    assert!(rsp.is_empty());
    // bodies larger than one read chunk
    let big: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let rsp = client.request(UPPER.0, UPPER.1, &big).unwrap();
    assert_eq!(&rsp[..], &big.to_ascii_uppercase()[..]);
}

#[test]
fn reply_carries_next_sequence() {
    init();
    let server = Server::new();
    server.register(1, 1, |req| req.to_vec());
    let instance = server.start("127.0.0.1:0").unwrap();

    let mut stream = TcpStream::connect(instance.local_addr()).unwrap();
    write_frame(&mut stream, &encode(1, 1, 41, b"ping").unwrap()).unwrap();
    let rsp = FrameReader::new().read_frame(&mut stream).unwrap().unwrap();
    assert_eq!((rsp.service, rsp.method, rsp.sequence), (1, 1, 42));
    assert_eq!(rsp.body(), b"ping");
}

#[test]
fn unknown_route_drops_only_that_connection() {
    let server = Server::new();
    let instance = start_server(&server);
    let good = Client::connect(instance.local_addr()).unwrap();
    let bad = Client::connect(instance.local_addr()).unwrap();

    assert_eq!(&good.request(REVERSE.0, REVERSE.1, b"ab").unwrap()[..], b"ba");
    assert!(bad.request(99, 1, b"nobody home").is_err());

    // the other connection keeps working
    assert_eq!(&good.request(REVERSE.0, REVERSE.1, b"cd").unwrap()[..], b"dc");
    assert!(wait_until(|| server.connection_count() == 1));

    // and the dropped one can come back
    bad.reconnect().unwrap();
    assert_eq!(&bad.request(UPPER.0, UPPER.1, b"ok").unwrap()[..], b"OK");
}

#[test]
fn unregister_removes_route() {
    let server = Server::new();
    let instance = start_server(&server);
    let client = Client::connect(instance.local_addr()).unwrap();
    assert!(client.request(UPPER.0, UPPER.1, b"x").is_ok());

    server.unregister(UPPER.0, UPPER.1);
    assert!(client.request(UPPER.0, UPPER.1, b"x").is_err());
}

#[test]
fn last_registration_wins() {
    let server = Server::new();
    let instance = start_server(&server);
    server.register(REVERSE.0, REVERSE.1, |_| b"replaced".to_vec());

    let client = Client::connect(instance.local_addr()).unwrap();
    assert_eq!(&client.request(REVERSE.0, REVERSE.1, b"x").unwrap()[..], b"replaced");
}

#[test]
fn concurrent_clients_get_their_own_replies() {
    let server = Server::new();
    let instance = start_server(&server);
    let addr = instance.local_addr();

    let workers: Vec<_> = (0..4u32)
        .map(|id| {
            go!(move || {
                let client = Client::connect(addr).unwrap();
                for i in 0..100u32 {
                    let body = format!("client {id} request {i}");
                    let rsp = client.request(REVERSE.0, REVERSE.1, body.as_bytes()).unwrap();
                    let expected: Vec<u8> = body.bytes().rev().collect();
                    assert_eq!(&rsp[..], &expected[..]);
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn shared_client_serializes_callers() {
    let server = Server::new();
    let instance = start_server(&server);
    let client = Arc::new(Client::connect(instance.local_addr()).unwrap());

    let workers: Vec<_> = (0..8u32)
        .map(|id| {
            let client = client.clone();
            go!(move || {
                for i in 0..50u32 {
                    let body = format!("{id}-{i}");
                    let rsp = client.request(UPPER.0, UPPER.1, body.as_bytes()).unwrap();
                    assert_eq!(&rsp[..], body.to_ascii_uppercase().as_bytes());
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn wrong_reply_sequence_is_correlation_error() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // a peer that echoes the request sequence instead of sequence + 1
    let fake = go!(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let req = FrameReader::new().read_frame(&mut stream).unwrap().unwrap();
        let rsp = encode(req.service, req.method, req.sequence, req.body()).unwrap();
        write_frame(&mut stream, &rsp).unwrap();
        req.sequence
    });

    let client = Client::connect(addr).unwrap();
    let err = client.request(1, 2, b"hi").unwrap_err();
    let seq = fake.join().unwrap();
    match err {
        Error::Correlation { expected, actual } => {
            assert_eq!(actual, seq);
            assert_eq!(expected, seq.wrapping_add(1));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn overrun_drops_connection() {
    let server = Server::new();
    let instance = start_server(&server);
    let mut stream = TcpStream::connect(instance.local_addr()).unwrap();

    let mut data = encode(REVERSE.0, REVERSE.1, 1, b"abc").unwrap().to_vec();
    data.extend_from_slice(b"trailing junk");
    stream.write_all(&data).unwrap();

    assert!(closed_by_peer(&mut stream));
    assert!(wait_until(|| server.connection_count() == 0));
}

#[test]
fn malformed_header_drops_connection() {
    let server = Server::new();
    let instance = start_server(&server);
    let mut stream = TcpStream::connect(instance.local_addr()).unwrap();

    let mut data = encode(REVERSE.0, REVERSE.1, 1, b"abc").unwrap().to_vec();
    // declared end inside the header
    data[12..16].copy_from_slice(&3u32.to_le_bytes());
    stream.write_all(&data).unwrap();

    assert!(closed_by_peer(&mut stream));
}

#[test]
fn oversized_frame_drops_connection() {
    init();
    let server = Server::with_max_frame_len(64);
    server.register(1, 1, |req| req.to_vec());
    let instance = server.start("127.0.0.1:0").unwrap();
    let client = Client::connect(instance.local_addr()).unwrap();

    assert!(client.request(1, 1, &[0u8; 16]).is_ok());
    assert!(client.request(1, 1, &[0u8; 100]).is_err());
}

#[test]
fn handler_panic_drops_connection_only() {
    let server = Server::new();
    let instance = start_server(&server);
    server.register(5, 5, |_| panic!("handler failure"));

    let victim = Client::connect(instance.local_addr()).unwrap();
    let other = Client::connect(instance.local_addr()).unwrap();
    assert!(victim.request(5, 5, b"boom").is_err());
    assert_eq!(&other.request(UPPER.0, UPPER.1, b"fine").unwrap()[..], b"FINE");
}

#[test]
fn shutdown_closes_live_connections() {
    let server = Server::new();
    let instance = start_server(&server);
    let c1 = Client::connect(instance.local_addr()).unwrap();
    let c2 = Client::connect(instance.local_addr()).unwrap();
    assert!(c1.request(REVERSE.0, REVERSE.1, b"1").is_ok());
    assert!(c2.request(REVERSE.0, REVERSE.1, b"2").is_ok());
    assert_eq!(server.connection_count(), 2);

    server.shutdown();
    assert!(wait_until(|| server.connection_count() == 0));
    assert!(c1.request(REVERSE.0, REVERSE.1, b"1").is_err());

    // the listener is still accepting
    c1.reconnect().unwrap();
    assert_eq!(&c1.request(REVERSE.0, REVERSE.1, b"xy").unwrap()[..], b"yx");
}

#[test]
fn close_is_idempotent() {
    let server = Server::new();
    let instance = start_server(&server);
    let client = Client::connect(instance.local_addr()).unwrap();
    assert!(client.is_connected());
    assert_eq!(client.peer_addr(), Some(instance.local_addr()));

    client.close();
    client.close();
    assert!(!client.is_connected());
    assert!(matches!(
        client.request(REVERSE.0, REVERSE.1, b"x"),
        Err(Error::NotConnected)
    ));

    client.reconnect().unwrap();
    assert!(client.is_connected());
    assert_eq!(&client.request(REVERSE.0, REVERSE.1, b"ab").unwrap()[..], b"ba");
}

#[test]
fn drop_instance_with_open_connection() {
    let server = Server::new();
    let instance = start_server(&server);
    let addr = instance.local_addr();
    let client = Client::connect(addr).unwrap();
    assert_eq!(&client.request(REVERSE.0, REVERSE.1, b"ab").unwrap()[..], b"ba");
    assert_eq!(server.connection_count(), 1);

    drop(instance);
    assert!(wait_until(|| server.connection_count() == 0));
    assert!(client.request(REVERSE.0, REVERSE.1, b"ab").is_err());
    // nobody accepts anymore
    assert!(Client::connect(addr).is_err());
}

#[test]
fn failed_reconnect_stays_disconnected() {
    let server = Server::new();
    let instance = start_server(&server);
    let client = Client::connect(instance.local_addr()).unwrap();
    assert!(client.request(UPPER.0, UPPER.1, b"up").is_ok());

    drop(instance);
    assert!(matches!(client.reconnect(), Err(Error::Connection(_))));
    assert!(!client.is_connected());
    assert!(client.peer_addr().is_none());
    assert!(matches!(
        client.request(UPPER.0, UPPER.1, b"up"),
        Err(Error::NotConnected)
    ));
}

#[test]
fn silent_peer_times_out() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // accept and hold the connection without ever answering
    let silent = go!(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = FrameReader::new();
        assert!(reader.read_frame(&mut stream).unwrap().is_some());
        // returns once the client gives up and closes
        let _ = reader.read_frame(&mut stream);
    });

    let client = Client::connect(addr).unwrap();
    client.set_timeout(Some(Duration::from_millis(100))).unwrap();
    assert!(matches!(client.request(1, 1, b"hello?"), Err(Error::Timeout)));

    client.close();
    silent.join().unwrap();
}

#[test]
fn typed_call() {
    let server = Server::new();
    let instance = start_server(&server);
    server.register_typed(10, 1, |(x, y): (u32, u32)| x + y);
    server.register_typed(10, 2, |name: String| format!("Hello, {name}!"));

    let client = Client::connect(instance.local_addr()).unwrap();
    let sum: u32 = client.call(10, 1, &(2u32, 40u32)).unwrap();
    assert_eq!(sum, 42);
    let greeting: String = client.call(10, 2, &"Mom".to_string()).unwrap();
    assert_eq!(greeting, "Hello, Mom!");
}

#[test]
fn serve_blocks_in_a_coroutine() {
    init();
    // find a free port, then hand it to serve
    let addr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let server = Arc::new(Server::new());
    server.register(3, 3, |req| req.to_vec());
    let s = server.clone();
    go!(move || {
        s.serve(addr).ok();
    });

    assert!(wait_until(|| Client::connect(addr).is_ok()));
    let client = Client::connect(addr).unwrap();
    assert_eq!(&client.request(3, 3, b"served").unwrap()[..], b"served");
}
