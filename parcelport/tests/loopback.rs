//! End-to-end tests: two localities in one process, each with its own
//! domain, parcelport and background progress thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fabric::md::{register_domain, Md, RKEY_PACKED_SIZE};
use fabric::{CapFlags, TransportSpec};
use parcelport::header::POS_PIGGY_BACK_DATA;
use parcelport::{
    Config, Locality, ParcelBuffer, Parcelport, Sender, CLOSE_MESSAGE, CONNECT_ACK_MESSAGE,
    CONNECT_MESSAGE, READ_ACK_MESSAGE, READ_MESSAGE,
};

const DEADLINE: Duration = Duration::from_secs(10);

// =============================================================================
// Test harness
// =============================================================================

/// One locality: a parcelport, its received parcels, and a background
/// progress thread standing in for the host scheduler's work hook.
struct Peer {
    pp: Arc<Parcelport>,
    parcels: Arc<Mutex<Vec<ParcelBuffer>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Peer {
    fn spawn(domain: &str, transports: &[TransportSpec]) -> Peer {
        register_domain(domain, transports);
        let parcels = Arc::new(Mutex::new(Vec::new()));
        let sink = parcels.clone();
        let pp = Parcelport::new(
            Config::new(domain),
            Box::new(move |buffer| sink.lock().unwrap().push(buffer)),
        )
        .expect("parcelport setup");

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let pp = pp.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    pp.background_work(0);
                    thread::yield_now();
                }
            })
        };
        Peer {
            pp,
            parcels,
            stop,
            thread: Some(thread),
        }
    }

    fn pd(&self) -> Md {
        self.pp.context().pd().clone()
    }

    fn wait_for_parcels(&self, count: usize) {
        wait_until(
            || self.parcels.lock().unwrap().len() >= count,
            "parcels did not arrive",
        );
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > DEADLINE {
            panic!("timed out: {}", what);
        }
        thread::yield_now();
    }
}

fn iface_mode() -> Vec<TransportSpec> {
    vec![TransportSpec {
        name: "lo".to_string(),
        caps: CapFlags::AM_SHORT
            | CapFlags::GET_ZCOPY
            | CapFlags::CONNECT_TO_IFACE
            | CapFlags::AM_CB_SYNC,
    }]
}

fn ep_mode() -> Vec<TransportSpec> {
    vec![
        TransportSpec {
            name: "am".to_string(),
            caps: CapFlags::AM_SHORT | CapFlags::CONNECT_TO_IFACE | CapFlags::AM_CB_SYNC,
        },
        TransportSpec {
            name: "rma".to_string(),
            caps: CapFlags::GET_ZCOPY | CapFlags::CONNECT_TO_EP,
        },
    ]
}

/// Send one parcel and wait until the sender-side completion fires.
fn send_and_wait(sender: &Arc<Sender>, payload: Vec<u8>) {
    let done = Arc::new(AtomicU32::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let done_cb = done.clone();
    let order_cb = order.clone();
    let handler = Box::new(move |ok: bool| {
        assert!(ok);
        order_cb.lock().unwrap().push("done");
        done_cb.fetch_add(1, Ordering::SeqCst);
    });

    let done_pp = done.clone();
    let order_pp = order.clone();
    let postprocess = Box::new(move |ok: bool, _dest: &Locality, _sender: Arc<Sender>| {
        assert!(ok);
        order_pp.lock().unwrap().push("postprocess");
        done_pp.fetch_add(1, Ordering::SeqCst);
    });

    sender
        .async_write(ParcelBuffer::from_data(payload), handler, postprocess)
        .expect("async_write");

    wait_until(
        || done.load(Ordering::SeqCst) == 2,
        "transfer did not complete",
    );
    assert_eq!(&*order.lock().unwrap(), &["done", "postprocess"]);
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_piggy_back_echo() {
    let a = Peer::spawn("test/e2e-piggy-a", &iface_mode());
    let b = Peer::spawn("test/e2e-piggy-b", &iface_mode());

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");
    assert_ne!(sender.receive_handle(), 0);

    send_and_wait(&sender, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    b.wait_for_parcels(1);

    {
        let parcels = b.parcels.lock().unwrap();
        assert_eq!(parcels.len(), 1);
        assert_eq!(parcels[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(parcels[0].size, 8);
    }

    let a_am = a.pp.context().am_iface();
    let b_am = b.pp.context().am_iface();
    assert_eq!(a_am.am_posted(CONNECT_MESSAGE), 1);
    assert_eq!(a_am.am_posted(READ_MESSAGE), 1);
    assert_eq!(b_am.am_posted(CONNECT_ACK_MESSAGE), 1);
    assert_eq!(b_am.am_posted(READ_ACK_MESSAGE), 1);
    assert_eq!(a_am.am_posted(CLOSE_MESSAGE), 0);

    // One header GET of 33 + 8 bytes, no payload GET.
    assert_eq!(
        b.pp.context().rma_iface().get_lengths(),
        vec![POS_PIGGY_BACK_DATA as u64 + 8]
    );
}

#[test]
fn test_large_payload() {
    let a = Peer::spawn("test/e2e-large-a", &iface_mode());
    let b = Peer::spawn("test/e2e-large-b", &iface_mode());

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    send_and_wait(&sender, payload.clone());
    b.wait_for_parcels(1);

    {
        let parcels = b.parcels.lock().unwrap();
        assert_eq!(parcels[0].data, payload);
    }

    // Header GET of the no-piggy-back length, then the payload GET.
    let header_length = (POS_PIGGY_BACK_DATA + 8 + RKEY_PACKED_SIZE) as u64;
    assert_eq!(
        b.pp.context().rma_iface().get_lengths(),
        vec![header_length, 4096]
    );

    // The ack reclaimed the payload registration: each side keeps exactly
    // its pinned header region.
    assert_eq!(a.pd().live_regions(), 1);
    assert_eq!(b.pd().live_regions(), 1);
}

#[test]
fn test_empty_payload() {
    let a = Peer::spawn("test/e2e-empty-a", &iface_mode());
    let b = Peer::spawn("test/e2e-empty-b", &iface_mode());

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");
    send_and_wait(&sender, Vec::new());

    // Header travels alone, and an empty buffer is not handed to the
    // decoder.
    assert_eq!(
        b.pp.context().rma_iface().get_lengths(),
        vec![POS_PIGGY_BACK_DATA as u64]
    );
    assert!(b.parcels.lock().unwrap().is_empty());
}

#[test]
fn test_transient_backpressure() {
    let a = Peer::spawn("test/e2e-nores-a", &iface_mode());
    let b = Peer::spawn("test/e2e-nores-b", &iface_mode());

    // The first three connect posts bounce with NO_RESOURCE.
    a.pp.context().am_iface().fail_next_am_short(3);

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");
    assert_ne!(sender.receive_handle(), 0);
    assert_eq!(a.pp.context().am_iface().am_posted(CONNECT_MESSAGE), 1);
    assert!(a.pp.context().worker().progress_count() >= 3);

    // The connection still works.
    send_and_wait(&sender, vec![42; 16]);
    b.wait_for_parcels(1);
}

#[test]
fn test_alternating_backpressure() {
    let a = Peer::spawn("test/e2e-alt-a", &iface_mode());
    let b = Peer::spawn("test/e2e-alt-b", &iface_mode());

    // Every other post fails on both sides: the connect loop on A, the
    // connect-ack and read-ack loops on B all have to retry.
    a.pp.context().am_iface().fail_alternate_am_short(true);
    b.pp.context().am_iface().fail_alternate_am_short(true);

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");
    assert_ne!(sender.receive_handle(), 0);

    // The read notification post does not retry, so lift the injection on
    // the sender side only.
    a.pp.context().am_iface().fail_alternate_am_short(false);

    send_and_wait(&sender, vec![7; 64]);
    b.wait_for_parcels(1);
    assert_eq!(b.parcels.lock().unwrap()[0].data, vec![7; 64]);
}

#[test]
fn test_ep_to_ep_capability_path() {
    let a = Peer::spawn("test/e2e-ep-a", &ep_mode());
    let b = Peer::spawn("test/e2e-ep-b", &ep_mode());

    // An EP-only RMA transport publishes no interface address.
    assert_eq!(a.pp.here().rma_addr().iface_len(), 0);

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");
    assert_ne!(sender.receive_handle(), 0);

    // Each side completed exactly one endpoint-to-endpoint link.
    assert_eq!(a.pp.context().rma_iface().ep_connects(), 1);
    assert_eq!(b.pp.context().rma_iface().ep_connects(), 1);

    // Both the piggy-backed and the pulled payload path work over the
    // endpoint pair.
    send_and_wait(&sender, vec![9; 8]);
    let big: Vec<u8> = (0..2048u32).map(|i| (i % 13) as u8).collect();
    send_and_wait(&sender, big.clone());
    b.wait_for_parcels(2);
    assert_eq!(b.parcels.lock().unwrap()[1].data, big);
}

#[test]
fn test_clean_shutdown_releases_everything() {
    let a = Peer::spawn("test/e2e-shutdown-a", &iface_mode());
    let b = Peer::spawn("test/e2e-shutdown-b", &iface_mode());
    let pd_a = a.pd();
    let pd_b = b.pd();

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");
    for i in 0..3u8 {
        send_and_wait(&sender, vec![i; 1024]);
    }
    b.wait_for_parcels(3);
    assert_eq!(b.pp.num_receivers(), 1);

    let mut k = 0;
    while !sender.close().expect("close") {
        a.pp.background_work(0);
        parcelport::util::yield_k(k);
        k += 1;
    }
    wait_until(|| b.pp.num_receivers() == 0, "receiver was not retired");

    // Tear both localities down; every registration and every key bundle
    // must be gone.
    drop(sender);
    drop(a);
    drop(b);
    assert_eq!(pd_a.live_regions(), 0);
    assert_eq!(pd_b.live_regions(), 0);
    assert_eq!(pd_a.live_rkey_bundles(), 0);
    assert_eq!(pd_b.live_rkey_bundles(), 0);
}

#[test]
fn test_header_reuse_across_sequential_writes() {
    let a = Peer::spawn("test/e2e-reuse-a", &iface_mode());
    let b = Peer::spawn("test/e2e-reuse-b", &iface_mode());

    let sender = a.pp.create_connection(b.pp.here()).expect("connection");
    let weak = Arc::downgrade(&sender);

    // One pinned header on each side, registered exactly once.
    assert_eq!(a.pd().live_regions(), 1);

    for i in 0..100u32 {
        send_and_wait(&sender, i.to_ne_bytes().to_vec());
        // Piggy-backed payloads never register anything new and the header
        // region is reused as-is.
        assert_eq!(a.pd().live_regions(), 1);
    }
    b.wait_for_parcels(100);

    {
        let parcels = b.parcels.lock().unwrap();
        for (i, parcel) in parcels.iter().enumerate() {
            assert_eq!(parcel.data, (i as u32).to_ne_bytes().to_vec());
        }
    }

    // The sender stays alive for as long as the dispatcher tracks it.
    drop(sender);
    assert!(weak.upgrade().is_some());
}
