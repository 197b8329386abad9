//! Reliable delivery over clean, lossy, duplicating, and reordering links.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{Fate, Network, addr, is_data};
use ruc_protocol::manager::{ManagerConfig, ManagerConfigBuilder, ManagerEvent};
use ruc_protocol::transport::{ConnectionConfigBuilder, Segment};

const A: u16 = 4000;
const B: u16 = 5000;

fn config(fragment_size: usize, retry_limit: u32) -> ManagerConfig {
    ManagerConfigBuilder::new()
        .connection(
            ConnectionConfigBuilder::new()
                .fragment_size(fragment_size)
                .window_size(8)
                .retry_limit(retry_limit)
                .ack_timeout(Duration::from_millis(50))
                .heartbeat_interval(Duration::from_secs(1))
                .build(),
        )
        .build()
}

fn connected(fragment_size: usize, retry_limit: u32) -> Network {
    let mut net = Network::new();
    net.add(addr(A), config(fragment_size, retry_limit));
    net.add(addr(B), config(fragment_size, retry_limit));
    net.connect(addr(A), addr(B));
    net.events(addr(A));
    net.events(addr(B));
    net
}

fn message(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn send_all(net: &mut Network, messages: &[Vec<u8>]) {
    let now = net.now;
    for msg in messages {
        net.node(addr(A)).send(addr(B), msg, now).unwrap();
    }
}

#[test]
fn test_small_messages_in_order() {
    let mut net = connected(64, 4);
    let messages: Vec<Vec<u8>> = (0..100).map(|i| message(1 + i % 64, i as u8)).collect();

    send_all(&mut net, &messages);
    net.run();

    assert_eq!(net.messages(addr(B)), messages);
}

#[test]
fn test_fragmentation_reproduces_message() {
    let payload = message(1000, 7);
    for fragment_size in [1, 3, 7, 64, 999, 1000, 1024] {
        let mut net = connected(fragment_size, 4);
        send_all(&mut net, std::slice::from_ref(&payload));
        net.run();

        let events = net.events(addr(B));
        assert_eq!(
            events,
            vec![ManagerEvent::Data {
                peer: addr(A),
                data: payload.clone()
            }],
            "fragment size {fragment_size}"
        );
    }
}

#[test]
fn test_fragments_carry_more_bit() {
    let mut net = connected(4, 4);
    send_all(&mut net, &[message(10, 1)]);
    net.run();

    let more: Vec<bool> = net
        .sent
        .iter()
        .filter(|d| d.from == addr(A) && is_data(d))
        .map(|d| match Segment::decode(&d.bytes) {
            Ok(Segment::Data { more, .. }) => more,
            other => panic!("unexpected unit {other:?}"),
        })
        .collect();
    assert_eq!(more, vec![true, true, false]);
}

#[test]
fn test_sequence_numbers_wrap() {
    let mut net = connected(1, 4);
    let first = message(40_000, 1);
    let second = message(40_000, 2);

    send_all(&mut net, std::slice::from_ref(&first));
    net.run();
    // later send timestamps so reused sequence numbers are not judged stale
    net.advance(Duration::from_millis(10));
    send_all(&mut net, std::slice::from_ref(&second));
    net.run();

    assert_eq!(net.messages(addr(B)), vec![first, second]);
    let sender = net.node(addr(A)).connection(&addr(B)).unwrap();
    assert_eq!(sender.send_base(), ((1 + 80_000) % 65_536) as u16);
    let receiver = net.node(addr(B)).connection(&addr(A)).unwrap();
    assert_eq!(receiver.recv_cursor(), ((80_000) % 65_536) as u16);
}

#[test]
fn test_lossy_link_delivers_everything_once() {
    let mut net = connected(16, 20);
    let mut counter = 0u32;
    net.set_filter(move |_| {
        counter += 1;
        if counter % 4 == 0 {
            Fate::Drop
        } else {
            Fate::Deliver
        }
    });

    let messages: Vec<Vec<u8>> = (0..50).map(|i| message(1 + i * 7, i as u8)).collect();
    send_all(&mut net, &messages);
    net.advance(Duration::from_secs(10));

    assert_eq!(net.messages(addr(B)), messages);
    let retries = net
        .sent
        .iter()
        .filter(|d| d.from == addr(A) && is_data(d) && d.bytes[0] & 0x10 != 0)
        .count();
    assert!(retries > 0);
    assert!(net.node(addr(A)).connection(&addr(B)).is_some());
}

#[test]
fn test_duplicating_link_never_duplicates_delivery() {
    let mut net = Network::new();
    net.add(addr(A), config(8, 4));
    net.add(addr(B), config(8, 4));
    net.set_filter(|_| Fate::Duplicate);
    net.connect(addr(A), addr(B));
    assert_eq!(net.events(addr(B)), vec![ManagerEvent::Connected { peer: addr(A) }]);

    let messages: Vec<Vec<u8>> = (0..20).map(|i| message(5 + i * 3, i as u8)).collect();
    send_all(&mut net, &messages);
    net.run();

    assert_eq!(net.messages(addr(B)), messages);
}

#[test]
fn test_reordering_link_preserves_order() {
    let mut net = connected(4, 4);
    let mut delayed = HashSet::new();
    net.set_filter(move |datagram| {
        let Ok(Segment::Data { seq, .. }) = Segment::decode(&datagram.bytes) else {
            return Fate::Deliver;
        };
        if seq % 2 == 1 && delayed.insert(seq) {
            Fate::Delay
        } else {
            Fate::Deliver
        }
    });

    let messages: Vec<Vec<u8>> = (0..10).map(|i| message(3 + i * 5, i as u8)).collect();
    send_all(&mut net, &messages);
    net.run();

    assert_eq!(net.messages(addr(B)), messages);
}

#[test]
fn test_bidirectional_traffic() {
    let mut net = connected(16, 4);
    let now = net.now;
    let to_b = message(100, 1);
    let to_a = message(50, 2);

    net.node(addr(A)).send(addr(B), &to_b, now).unwrap();
    net.node(addr(B)).send(addr(A), &to_a, now).unwrap();
    net.run();

    assert_eq!(net.messages(addr(B)), vec![to_b]);
    assert_eq!(net.messages(addr(A)), vec![to_a]);
}

#[test]
fn test_unreliable_send_bypasses_window() {
    let mut net = connected(16, 4);
    let now = net.now;
    net.node(addr(A))
        .send_unreliable(addr(B), b"now or never", now)
        .unwrap();

    let sent = net.node(addr(A)).poll_transmit().unwrap();
    assert_eq!(sent.payload[0], 0x60);
    net.node(addr(B)).handle_datagram(addr(A), &sent.payload, now);

    assert_eq!(net.messages(addr(B)), vec![b"now or never".to_vec()]);
    assert_eq!(
        net.node(addr(A)).connection(&addr(B)).unwrap().in_flight(),
        0
    );
}
