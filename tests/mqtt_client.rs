//! MQTT packet client and threaded transport against an in-memory broker.

mod common;

use common::{MockConnection, contains, packets, wait_until};
use libiot_gateway::network::application::mqtt::{
    Client, Options, Packet, QoS, Transport, TransportOptions,
};
use libiot_gateway::network::error::Error;
use libiot_gateway::network::pubsub::{
    DISCONNECT_LOST, DISCONNECT_REQUESTED, EventSource, Message, Publisher, Subscriber,
};
use libiot_gateway::network::{Close, Connection, Read, Write};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn options() -> Options<'static> {
    Options {
        client_id: "dev-1",
        keep_alive_seconds: 120,
        clean_session: true,
    }
}

#[test]
fn connect_packet_layout() {
    let connection = MockConnection::new();
    let mut client = Client::new(connection.clone());
    client.send_connect(&options()).unwrap();

    let mut expected = vec![0x10, 17, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 120];
    expected.extend_from_slice(&[0x00, 0x05]);
    expected.extend_from_slice(b"dev-1");
    assert_eq!(connection.written(), expected);
}

#[test]
fn publish_qos1_carries_a_packet_id() {
    let connection = MockConnection::new();
    let mut client = Client::new(connection.clone());

    let id = client.publish("a/b", b"hi", QoS::AtLeastOnce).unwrap();
    assert_eq!(id, Some(1));
    assert_eq!(
        connection.take_written(),
        [0x32, 9, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'h', b'i']
    );

    assert_eq!(client.publish("a/b", b"", QoS::AtMostOnce).unwrap(), None);
    assert_eq!(connection.take_written(), [0x30, 5, 0x00, 0x03, b'a', b'/', b'b']);
}

#[test]
fn subscribe_ids_count_up() {
    let connection = MockConnection::new();
    let mut client = Client::new(connection.clone());

    assert_eq!(client.subscribe("a/b", QoS::AtLeastOnce).unwrap(), 1);
    assert_eq!(
        connection.take_written(),
        [0x82, 8, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x01]
    );
    assert_eq!(client.subscribe("c", QoS::AtLeastOnce).unwrap(), 2);
    // Publishes and subscribes share one counter.
    assert_eq!(client.publish("c", b"", QoS::AtLeastOnce).unwrap(), Some(3));
}

#[test]
fn oversized_topic_is_refused() {
    let mut client = Client::new(MockConnection::new());
    let topic = "t".repeat(300);
    assert_eq!(
        client.publish(&topic, b"", QoS::AtLeastOnce),
        Err(Error::PacketTooLarge)
    );
    assert_eq!(
        client.subscribe(&topic, QoS::AtLeastOnce),
        Err(Error::PacketTooLarge)
    );
}

#[test]
fn poll_decodes_broker_packets() {
    let connection = MockConnection::new();
    let mut client = Client::new(connection.clone());
    assert_eq!(client.poll(), Ok(None));

    connection.feed(&packets::connack(0));
    connection.feed(&packets::suback(1, 1));
    connection.feed(&packets::publish("x/y", b"{}", 9));
    connection.feed(&packets::puback(4));
    connection.feed(&packets::pingresp());

    assert_eq!(
        client.poll(),
        Ok(Some(Packet::ConnAck {
            session_present: false,
            return_code: 0
        }))
    );
    assert_eq!(
        client.poll(),
        Ok(Some(Packet::SubAck {
            packet_id: 1,
            return_code: 1
        }))
    );
    let Ok(Some(Packet::Publish(publish))) = client.poll() else {
        panic!("expected a publish");
    };
    assert_eq!(publish.topic.as_str(), "x/y");
    assert_eq!(&publish.payload[..], b"{}");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert_eq!(publish.packet_id, Some(9));
    assert_eq!(client.poll(), Ok(Some(Packet::PubAck { packet_id: 4 })));
    assert_eq!(client.poll(), Ok(Some(Packet::PingResp)));
    assert_eq!(client.poll(), Ok(None));
}

#[test]
fn large_publish_uses_multi_byte_length() {
    let connection = MockConnection::new();
    let mut client = Client::new(connection.clone());
    let payload = vec![b'a'; 300];
    connection.feed(&packets::publish_qos0("big", &payload));

    let Ok(Some(Packet::Publish(publish))) = client.poll() else {
        panic!("expected a publish");
    };
    assert_eq!(publish.payload.len(), 300);
    assert_eq!(publish.packet_id, None);
}

#[test]
fn truncated_packet_waits_for_the_rest() {
    let connection = MockConnection::new();
    let mut client = Client::new(connection.clone());
    connection.feed(&[0x90, 0x03, 0x00]);
    assert_eq!(client.poll(), Ok(None));
    assert_eq!(client.poll(), Ok(None));

    connection.feed(&[0x05, 0x01]);
    assert_eq!(
        client.poll(),
        Ok(Some(Packet::SubAck {
            packet_id: 5,
            return_code: 1
        }))
    );
}

/// Connection handing out one scripted chunk per read; an empty chunk reads
/// as `Ok(0)`, the way a socket read timeout does.
struct Chunked {
    chunks: VecDeque<Vec<u8>>,
}

impl Read for Chunked {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let Some(chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl Write for Chunked {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for Chunked {
    type Error = Error;

    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Connection for Chunked {}

#[test]
fn packet_split_across_idle_reads_is_reassembled() {
    let packet = packets::publish("press-7/shadow/get/accepted", br#"{"state":{}}"#, 3);
    let chunks = VecDeque::from(vec![
        packet[..1].to_vec(),
        packet[1..11].to_vec(),
        Vec::new(),
        packet[11..].to_vec(),
    ]);
    let mut client = Client::new(Chunked { chunks });

    assert_eq!(client.poll(), Ok(None));
    let Ok(Some(Packet::Publish(publish))) = client.poll() else {
        panic!("expected the publish once its last bytes arrived");
    };
    assert_eq!(publish.topic.as_str(), "press-7/shadow/get/accepted");
    assert_eq!(&publish.payload[..], br#"{"state":{}}"#);
    assert_eq!(publish.packet_id, Some(3));
}

#[test]
fn oversized_packet_is_skipped() {
    let connection = MockConnection::new();
    let mut client = Client::new(connection.clone());
    connection.feed(&packets::publish("big", &vec![b'a'; 3000], 1));
    connection.feed(&packets::publish("small", b"ok", 2));

    let Ok(Some(Packet::Publish(publish))) = client.poll() else {
        panic!("expected the publish after the oversized one");
    };
    assert_eq!(publish.topic.as_str(), "small");
    assert_eq!(publish.packet_id, Some(2));
    assert_eq!(client.poll(), Ok(None));
}

#[test]
fn disconnect_closes_the_connection() {
    let connection = MockConnection::new();
    let client = Client::new(connection.clone());
    client.disconnect().unwrap();
    assert_eq!(connection.written(), [0xE0, 0x00]);
    assert!(connection.is_closed());
}

fn transport() -> Transport<MockConnection> {
    let mut options = TransportOptions::new("dev-1");
    options.idle_interval = Duration::from_millis(1);
    Transport::new(options)
}

#[test]
fn transport_turns_packets_into_events() {
    let transport = transport();
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let log = events.clone();
    transport.hooks().on_connect(move |code| log.lock().push(format!("connect {code}")));
    let log = events.clone();
    transport
        .hooks()
        .on_subscribe(move |id, code| log.lock().push(format!("suback {id} {code}")));
    let log = events.clone();
    transport.hooks().on_message(move |message: &Message| {
        log.lock().push(format!(
            "message {} {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        ))
    });
    let log = events.clone();
    transport.hooks().on_disconnect(move |code| log.lock().push(format!("disconnect {code}")));

    let connection = MockConnection::new();
    transport.connect(connection.clone()).unwrap();
    assert!(contains(&connection.written(), b"\x00\x05dev-1"));
    assert!(!transport.is_connected());

    connection.feed(&packets::connack(0));
    assert!(wait_until(WAIT, || transport.is_connected()));

    let id = transport.subscribe("a/b").unwrap();
    connection.feed(&packets::suback(id, 1));
    connection.feed(&packets::publish("a/b", b"hello", 42));
    assert!(wait_until(WAIT, || events.lock().len() == 3));

    // Inbound QoS 1 is acknowledged.
    assert!(contains(&connection.written(), &packets::puback(42)));

    transport.publish("up", None).unwrap();
    assert!(contains(&connection.written(), &[0x32, 6, 0x00, 0x02, b'u', b'p']));

    transport.disconnect();
    assert!(!transport.is_connected());
    assert!(connection.is_closed());
    assert_eq!(
        *events.lock(),
        vec![
            "connect 0".to_string(),
            format!("suback {id} 1"),
            "message a/b hello".to_string(),
            format!("disconnect {DISCONNECT_REQUESTED}"),
        ]
    );
    assert_eq!(transport.publish("up", None), Err(Error::NotOpen));
}

#[test]
fn refused_connect_ends_the_session() {
    let transport = transport();
    let codes = Arc::new(Mutex::new(Vec::new()));
    let seen = codes.clone();
    transport.hooks().on_connect(move |code| seen.lock().push(("connect", code)));
    let seen = codes.clone();
    transport.hooks().on_disconnect(move |code| seen.lock().push(("disconnect", code)));

    let connection = MockConnection::new();
    transport.connect(connection.clone()).unwrap();
    connection.feed(&packets::connack(5));

    assert!(wait_until(WAIT, || codes.lock().len() == 2));
    assert_eq!(*codes.lock(), vec![("connect", 5), ("disconnect", 5)]);
    assert!(!transport.is_connected());
}

#[test]
fn read_failure_is_reported_as_lost() {
    let transport = transport();
    let codes = Arc::new(Mutex::new(Vec::new()));
    let seen = codes.clone();
    transport.hooks().on_disconnect(move |code| seen.lock().push(code));

    let connection = MockConnection::new();
    transport.connect(connection.clone()).unwrap();
    connection.feed(&packets::connack(0));
    assert!(wait_until(WAIT, || transport.is_connected()));

    connection.fail_reads();
    assert!(wait_until(WAIT, || !codes.lock().is_empty()));
    assert_eq!(*codes.lock(), vec![DISCONNECT_LOST]);
    assert!(!transport.is_connected());
}

#[test]
fn second_connect_is_refused() {
    let transport = transport();
    transport.connect(MockConnection::new()).unwrap();
    assert_eq!(
        transport.connect(MockConnection::new()),
        Err(Error::AlreadyConnected)
    );
    transport.disconnect();
}

#[test]
fn idle_loop_ticks() {
    let transport = transport();
    let ticks = Arc::new(Mutex::new(0u32));
    let count = ticks.clone();
    transport.hooks().on_tick(move |_| *count.lock() += 1);

    transport.connect(MockConnection::new()).unwrap();
    assert!(wait_until(WAIT, || *ticks.lock() >= 3));
    transport.disconnect();
}

#[test]
fn oversized_message_does_not_end_the_session() {
    let transport = transport();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    transport
        .hooks()
        .on_message(move |message: &Message| sink.lock().push(message.topic.clone()));
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let seen = disconnects.clone();
    transport.hooks().on_disconnect(move |code| seen.lock().push(code));

    let connection = MockConnection::new();
    transport.connect(connection.clone()).unwrap();
    connection.feed(&packets::connack(0));
    assert!(wait_until(WAIT, || transport.is_connected()));

    connection.feed(&packets::publish("big", &vec![b'a'; 3000], 1));
    connection.feed(&packets::publish("small", b"ok", 2));
    assert!(wait_until(WAIT, || !delivered.lock().is_empty()));

    assert_eq!(*delivered.lock(), vec!["small".to_string()]);
    assert!(disconnects.lock().is_empty());
    assert!(transport.is_connected());
    transport.disconnect();
}

#[test]
fn disconnect_waits_for_running_observers() {
    let transport = transport();
    let busy = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(None));

    let flag = busy.clone();
    transport.hooks().on_message(move |_: &Message| {
        flag.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(300));
        flag.store(false, Ordering::SeqCst);
    });
    let flag = busy.clone();
    let record = seen.clone();
    transport.hooks().on_disconnect(move |code| {
        *record.lock() = Some((
            code,
            flag.load(Ordering::SeqCst),
            thread::current().name().map(str::to_owned),
        ));
    });

    let connection = MockConnection::new();
    transport.connect(connection.clone()).unwrap();
    connection.feed(&packets::connack(0));
    connection.feed(&packets::publish("slow", b"", 5));
    assert!(wait_until(WAIT, || busy.load(Ordering::SeqCst)));

    transport.disconnect();
    assert_eq!(
        *seen.lock(),
        Some((DISCONNECT_REQUESTED, false, Some("mqtt-dev-1".to_string())))
    );
    assert!(connection.is_closed());
}
