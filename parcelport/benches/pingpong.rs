//! Parcel round-trip benchmark over the in-process fabric.
//!
//! Measures one full transfer: read notification, header GET, payload GET
//! where needed, decode hand-off and acknowledgement.
//!
//! Run with:
//! ```bash
//! cargo bench --package parcelport --bench pingpong
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use fabric::md::register_domain;
use fabric::{CapFlags, TransportSpec};
use parcelport::{Config, Locality, ParcelBuffer, Parcelport, Sender};

const PAYLOAD_SIZES: &[usize] = &[8, 256, 4096, 65536];

struct Bench {
    sender_pp: Arc<Parcelport>,
    receiver_pp: Arc<Parcelport>,
    sender: Arc<Sender>,
    delivered: Arc<AtomicU64>,
}

fn setup() -> Bench {
    for domain in ["bench/pingpong-a", "bench/pingpong-b"] {
        register_domain(
            domain,
            &[TransportSpec {
                name: "lo".to_string(),
                caps: CapFlags::AM_SHORT
                    | CapFlags::GET_ZCOPY
                    | CapFlags::CONNECT_TO_IFACE
                    | CapFlags::AM_CB_SYNC,
            }],
        );
    }

    let sender_pp = Parcelport::new(Config::new("bench/pingpong-a"), Box::new(|_| {}))
        .expect("sender parcelport");
    let delivered = Arc::new(AtomicU64::new(0));
    let sink = delivered.clone();
    let receiver_pp = Parcelport::new(
        Config::new("bench/pingpong-b"),
        Box::new(move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        }),
    )
    .expect("receiver parcelport");

    // Drive the receiver while the connection is established.
    let sender = {
        let receiver_pp = receiver_pp.clone();
        let handle = std::thread::spawn({
            let sender_pp = sender_pp.clone();
            let there = receiver_pp.here().clone();
            move || sender_pp.create_connection(&there).expect("connection")
        });
        while !handle.is_finished() {
            receiver_pp.background_work(0);
        }
        handle.join().expect("connection thread")
    };

    Bench {
        sender_pp,
        receiver_pp,
        sender,
        delivered,
    }
}

fn roundtrip(bench: &Bench, payload: Vec<u8>) {
    let done = Arc::new(AtomicU64::new(0));
    let done_cb = done.clone();
    bench
        .sender
        .async_write(
            ParcelBuffer::from_data(payload),
            Box::new(move |_| {
                done_cb.fetch_add(1, Ordering::Relaxed);
            }),
            Box::new(|_ok: bool, _dest: &Locality, _sender: Arc<Sender>| {}),
        )
        .expect("async_write");
    while done.load(Ordering::Relaxed) == 0 {
        bench.receiver_pp.background_work(0);
        bench.sender_pp.background_work(0);
    }
}

fn bench_pingpong(c: &mut Criterion) {
    let bench = setup();
    let mut group = c.benchmark_group("parcel_roundtrip");

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| roundtrip(&bench, vec![0xa5u8; size]));
        });
    }
    group.finish();

    assert!(bench.delivered.load(Ordering::Relaxed) > 0);
}

criterion_group!(benches, bench_pingpong);
criterion_main!(benches);
