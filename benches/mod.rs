use criterion::{criterion_group, criterion_main};

mod network;

criterion_group!(
    benches,
    network::application::mqtt::client::bench_publish,
    network::application::mqtt::client::bench_poll,
    shadow::bench_decode_desired,
    shadow::bench_encode_reported
);
criterion_main!(benches);
