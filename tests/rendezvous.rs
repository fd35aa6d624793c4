//! Loopback tests for the out-of-band endpoint exchange.

use dmalink::{DmalinkError, Endpoint, Rendezvous, RendezvousListener};
use std::thread;

fn endpoint(seed: u8) -> Endpoint {
    Endpoint {
        addr: 0x1000 + seed as u64,
        rkey: 0xAABB_0000 | seed as u32,
        qp_num: seed as u32,
        lid: seed as u16,
        gid: [seed; 16],
    }
}

#[test]
fn exchange_is_symmetric() {
    let listener = RendezvousListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let client_ep = endpoint(1);
    let server_ep = endpoint(2);

    let client = thread::spawn(move || {
        let mut sock = Rendezvous::connect("127.0.0.1", port).unwrap();
        sock.exchange(&client_ep).unwrap()
    });

    let mut sock = listener.accept().unwrap();
    let seen_by_server = sock.exchange(&server_ep).unwrap();
    let seen_by_client = client.join().unwrap();

    // Both sides finish holding the other's exact descriptor.
    assert_eq!(seen_by_server, client_ep);
    assert_eq!(seen_by_client, server_ep);
}

#[test]
fn done_signal_is_delivered() {
    let listener = RendezvousListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let client = thread::spawn(move || {
        let mut sock = Rendezvous::connect("127.0.0.1", port).unwrap();
        let _ = sock.exchange(&endpoint(3)).unwrap();
        sock.signal_done().unwrap();
    });

    let mut sock = listener.accept().unwrap();
    let _ = sock.exchange(&endpoint(4)).unwrap();
    sock.wait_done().unwrap();
    client.join().unwrap();
}

#[test]
fn short_exchange_is_an_error() {
    let listener = RendezvousListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    // The peer connects and immediately hangs up without sending its
    // descriptor; the survivor must see a hard exchange failure.
    let client = thread::spawn(move || {
        let sock = Rendezvous::connect("127.0.0.1", port).unwrap();
        drop(sock);
    });

    let mut sock = listener.accept().unwrap();
    let result = sock.exchange(&endpoint(5));
    assert!(matches!(result, Err(DmalinkError::Exchange(_))));
    client.join().unwrap();
}
