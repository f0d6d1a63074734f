//! Loopback servers shared by the unit tests.
use std::{
    io::Write,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::Duration,
};

use crate::{
    ClientConfig, Connection,
    protocol::{DocumentServer, ProtocolTransport, Reply, ServerObserver, WireMessage},
};

pub fn config(address: SocketAddr) -> ClientConfig {
    ClientConfig::default()
        .with_address(address)
        .with_database("shop")
        .with_reply_timeout(Some(Duration::from_secs(5)))
}

/// Starts an in-memory server on an ephemeral port.
pub fn document_server() -> (SocketAddr, ServerObserver) {
    let server = DocumentServer::bind("127.0.0.1:0", 4).unwrap();
    let observer = server.observer();
    let address = server.spawn().unwrap();
    (address, observer)
}

pub fn connect(address: SocketAddr) -> Connection {
    Connection::connect(&config(address)).unwrap()
}

/// Serves a single connection, answering each frame with whatever the
/// handler returns. Every received message is forwarded on the channel.
pub fn scripted<F>(mut handler: F) -> (SocketAddr, mpsc::Receiver<WireMessage>)
where
    F: FnMut(&WireMessage) -> Option<Reply> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut transport = ProtocolTransport::new(stream);
        while let Ok(message) = transport.read_message() {
            let reply = handler(&message);
            if tx.send(message).is_err() {
                break;
            }
            if let Some(reply) = reply {
                if transport.write_reply(&reply).is_err() {
                    break;
                }
            }
        }
    });

    (address, rx)
}

/// Accepts connections and never answers them.
pub fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    thread::spawn(move || {
        let mut held: Vec<TcpStream> = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });

    address
}

/// Answers every frame, but writes the reply one byte at a time with `delay`
/// between bytes.
pub fn trickling(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut transport = ProtocolTransport::new(stream);
        while let Ok(message) = transport.read_message() {
            let frame = Reply::to(message.request_id, vec![]).encode().unwrap();
            let mut stream = transport.get_ref();
            for byte in frame {
                thread::sleep(delay);
                if stream.write_all(&[byte]).is_err() {
                    return;
                }
            }
        }
    });

    address
}
