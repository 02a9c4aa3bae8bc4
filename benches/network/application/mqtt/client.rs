use criterion::{BatchSize, Criterion, Throughput};
use libiot_gateway::network::application::mqtt::client::{Client, QoS};
use libiot_gateway::network::error::Error;
use libiot_gateway::network::{Close, Connection, Read, Write};

const TOPIC: &str = "$aws/things/press-7/shadow/get/accepted";
const DOCUMENT: &[u8] =
    br#"{"state":{"desired":{"sendTelemetryData":true,"color":"red","speed":12}},"version":42}"#;

/// Reads from a preloaded buffer and discards writes.
struct Loopback {
    inbound: Vec<u8>,
    read_pos: usize,
}

impl Loopback {
    fn new(inbound: Vec<u8>) -> Self {
        Self {
            inbound,
            read_pos: 0,
        }
    }
}

impl Read for Loopback {
    type Error = Error;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let remaining = &self.inbound[self.read_pos..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl Write for Loopback {
    type Error = Error;
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for Loopback {
    type Error = Error;
    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Connection for Loopback {}

/// `count` QoS 1 PUBLISH packets carrying `DOCUMENT` on `TOPIC`.
fn inbound_publishes(count: u16) -> Vec<u8> {
    let mut out = Vec::new();
    for id in 1..=count {
        let mut remaining = 2 + TOPIC.len() + 2 + DOCUMENT.len();
        out.push(0x32);
        loop {
            let byte = (remaining % 128) as u8;
            remaining /= 128;
            if remaining == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out.extend_from_slice(&(TOPIC.len() as u16).to_be_bytes());
        out.extend_from_slice(TOPIC.as_bytes());
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(DOCUMENT);
    }
    out
}

pub fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    group.throughput(Throughput::Bytes(DOCUMENT.len() as u64));
    group.bench_function("publish_qos1", |b| {
        let mut client = Client::new(Loopback::new(Vec::new()));
        b.iter(|| {
            client
                .publish("$aws/things/press-7/shadow/update", DOCUMENT, QoS::AtLeastOnce)
                .expect("Failed to publish")
        })
    });
    group.finish();
}

pub fn bench_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll");
    group.throughput(Throughput::Bytes(DOCUMENT.len() as u64 * 50));
    group.bench_function("poll_50_publishes", |b| {
        b.iter_batched_ref(
            || Client::new(Loopback::new(inbound_publishes(50))),
            |client| {
                for _ in 0..50 {
                    let packet = client.poll().expect("Failed to poll");
                    assert!(packet.is_some());
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}
