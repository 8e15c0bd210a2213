//! Communication interfaces.
//!
//! An interface is one transport opened on a protection domain and bound to
//! a worker. Its attributes advertise capability flags and the lengths of
//! its address blobs; peers use those blobs to create endpoints against it.
//! Active messages land in a per-interface inbox and are delivered, FIFO, by
//! the owning worker's progress loop. Handlers may themselves drive progress;
//! no internal lock is held while a handler runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;

use crate::md::{Md, TransportDesc};
use crate::registry::registry;
use crate::status::Status;
use crate::worker::{Worker, WorkerInner};

bitflags! {
    /// Interface capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapFlags: u32 {
        /// Short eager active messages.
        const AM_SHORT = 1 << 0;
        /// One-sided zero-copy GET.
        const GET_ZCOPY = 1 << 1;
        /// Endpoints can connect directly to a remote interface address.
        const CONNECT_TO_IFACE = 1 << 2;
        /// Endpoints connect pairwise via exchanged endpoint addresses.
        const CONNECT_TO_EP = 1 << 3;
        /// Active message callbacks may fire from async context.
        const AM_CB_ASYNC = 1 << 4;
        /// Active message callbacks fire from explicit progress only.
        const AM_CB_SYNC = 1 << 5;
    }
}

bitflags! {
    /// Flags accepted when installing an active message handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AmCbFlags: u32 {
        const ASYNC = 1 << 0;
        const SYNC = 1 << 1;
    }
}

/// One transport a domain offers, with its capabilities.
#[derive(Debug, Clone)]
pub struct TransportSpec {
    /// Transport layer name.
    pub name: String,
    /// Capabilities the transport advertises.
    pub caps: CapFlags,
}

/// Parameters for opening an interface.
#[derive(Debug, Clone, Default)]
pub struct IfaceParams {
    /// Receive headroom in bytes reserved in front of delivered messages.
    pub rx_headroom: usize,
}

/// Interface attributes.
#[derive(Debug, Clone)]
pub struct IfaceAttr {
    /// Capability flags.
    pub caps: CapFlags,
    /// Length of the device address blob.
    pub device_addr_len: usize,
    /// Length of the interface address blob; zero for transports that only
    /// connect endpoint-to-endpoint.
    pub iface_addr_len: usize,
    /// Length of an endpoint address blob; zero without `CONNECT_TO_EP`.
    pub ep_addr_len: usize,
    /// Maximum body size of a short active message.
    pub am_max_short: usize,
}

/// Body size limit for short active messages.
const AM_MAX_SHORT: usize = 128;

pub(crate) type AmHandlerFn = dyn Fn(u64, &[u8]) -> Status + Send + Sync;

pub(crate) struct AmMessage {
    pub(crate) id: u8,
    pub(crate) header: u64,
    pub(crate) body: Vec<u8>,
}

#[derive(Default)]
struct Counters {
    am_posted: Mutex<HashMap<u8, u64>>,
    get_lengths: Mutex<Vec<u64>>,
    ep_connects: AtomicU64,
}

#[derive(Default)]
struct FaultInjection {
    budget: AtomicU32,
    alternate: AtomicBool,
    seq: AtomicU64,
}

pub(crate) struct IfaceInner {
    id: u64,
    device: u64,
    pub(crate) caps: CapFlags,
    rx_headroom: usize,
    handlers: Mutex<HashMap<u8, Arc<AmHandlerFn>>>,
    inbox: Mutex<VecDeque<AmMessage>>,
    counters: Counters,
    fault: FaultInjection,
    pub(crate) worker: Weak<WorkerInner>,
}

impl IfaceInner {
    pub(crate) fn enqueue(&self, msg: AmMessage) {
        self.inbox.lock().unwrap().push_back(msg);
    }

    /// Deliver queued active messages to their handlers. The inbox lock is
    /// dropped around every handler call so that handlers can recursively
    /// drive progress.
    pub(crate) fn deliver_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let msg = match self.inbox.lock().unwrap().pop_front() {
                Some(msg) => msg,
                None => break,
            };
            let handler = self.handlers.lock().unwrap().get(&msg.id).cloned();
            if let Some(handler) = handler {
                let _ = handler(msg.header, &msg.body);
            }
            delivered += 1;
        }
        delivered
    }

    /// True when fault injection wants this post to fail.
    pub(crate) fn should_fail_am(&self) -> bool {
        let mut budget = self.fault.budget.load(Ordering::Relaxed);
        while budget > 0 {
            match self.fault.budget.compare_exchange_weak(
                budget,
                budget - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => budget = current,
            }
        }
        if self.fault.alternate.load(Ordering::Relaxed) {
            let seq = self.fault.seq.fetch_add(1, Ordering::Relaxed);
            return seq % 2 == 0;
        }
        false
    }

    pub(crate) fn note_am_posted(&self, id: u8) {
        *self.counters.am_posted.lock().unwrap().entry(id).or_insert(0) += 1;
    }

    pub(crate) fn note_get(&self, len: u64) {
        self.counters.get_lengths.lock().unwrap().push(len);
    }

    pub(crate) fn note_ep_connect(&self) {
        self.counters.ep_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attr(&self) -> IfaceAttr {
        IfaceAttr {
            caps: self.caps,
            device_addr_len: 8,
            iface_addr_len: if self.caps.contains(CapFlags::CONNECT_TO_IFACE) {
                8
            } else {
                0
            },
            ep_addr_len: if self.caps.contains(CapFlags::CONNECT_TO_EP) {
                8
            } else {
                0
            },
            am_max_short: AM_MAX_SHORT - self.rx_headroom.min(AM_MAX_SHORT),
        }
    }
}

impl Drop for IfaceInner {
    fn drop(&mut self) {
        registry().ifaces.lock().unwrap().remove(&self.id);
    }
}

/// An open communication interface.
///
/// Cheaply cloneable; the interface closes when the last clone drops, so a
/// single interface can safely serve several roles at once.
#[derive(Clone)]
pub struct Iface(pub(crate) Arc<IfaceInner>);

impl Iface {
    /// Open a transport of `md` on `worker`.
    pub fn open(
        md: &Md,
        worker: &Worker,
        transport: &TransportDesc,
        params: &IfaceParams,
    ) -> Result<Iface, Status> {
        let spec = md
            .transport_spec(&transport.tl_name)
            .ok_or(Status::NoDevice)?;
        let inner = Arc::new(IfaceInner {
            id: registry().alloc_id(),
            device: md.instance(),
            caps: spec.caps,
            rx_headroom: params.rx_headroom,
            handlers: Mutex::new(HashMap::new()),
            inbox: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            fault: FaultInjection::default(),
            worker: worker.downgrade(),
        });
        registry()
            .ifaces
            .lock()
            .unwrap()
            .insert(inner.id, Arc::downgrade(&inner));
        worker.attach(&inner);
        Ok(Iface(inner))
    }

    /// Query interface attributes.
    pub fn query(&self) -> IfaceAttr {
        self.0.attr()
    }

    /// Write the device address blob into `out`.
    pub fn device_address(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.0.device.to_ne_bytes());
    }

    /// Write the interface address blob into `out`.
    pub fn iface_address(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.0.id.to_ne_bytes());
    }

    /// Install the handler for active message id `id`.
    pub fn set_am_handler<F>(&self, id: u8, _flags: AmCbFlags, handler: F)
    where
        F: Fn(u64, &[u8]) -> Status + Send + Sync + 'static,
    {
        self.0
            .handlers
            .lock()
            .unwrap()
            .insert(id, Arc::new(handler));
    }

    /// Force the next `n` active message posts through this interface to
    /// report [`Status::NoResource`]. Diagnostic hook for exercising retry
    /// paths.
    pub fn fail_next_am_short(&self, n: u32) {
        self.0.fault.budget.store(n, Ordering::Relaxed);
    }

    /// While enabled, every other active message post through this interface
    /// reports [`Status::NoResource`], starting with the next one.
    pub fn fail_alternate_am_short(&self, enabled: bool) {
        self.0.fault.seq.store(0, Ordering::Relaxed);
        self.0.fault.alternate.store(enabled, Ordering::Relaxed);
    }

    /// Number of active messages posted through this interface with the
    /// given id.
    pub fn am_posted(&self, id: u8) -> u64 {
        self.0
            .counters
            .am_posted
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Byte lengths of the one-sided GETs issued through this interface, in
    /// issue order.
    pub fn get_lengths(&self) -> Vec<u64> {
        self.0.counters.get_lengths.lock().unwrap().clone()
    }

    /// Number of endpoint-to-endpoint connections completed on this
    /// interface.
    pub fn ep_connects(&self) -> u64 {
        self.0.counters.ep_connects.load(Ordering::Relaxed)
    }

    pub(crate) fn inner(&self) -> &Arc<IfaceInner> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::{self, Md};
    use crate::worker::{AsyncContext, AsyncMode, ThreadMode, Worker};

    fn open_pair(domain: &str, caps: CapFlags) -> (Md, Worker, Iface) {
        md::register_domain(
            domain,
            &[TransportSpec {
                name: "lo".to_string(),
                caps,
            }],
        );
        let pd = Md::open(domain).unwrap();
        let async_ctx = AsyncContext::new(AsyncMode::Thread).unwrap();
        let worker = Worker::new(&async_ctx, ThreadMode::Multi).unwrap();
        let tl = pd.transports().remove(0);
        let iface = Iface::open(&pd, &worker, &tl, &IfaceParams::default()).unwrap();
        (pd, worker, iface)
    }

    #[test]
    fn test_attr_reflects_caps() {
        let caps = CapFlags::AM_SHORT | CapFlags::CONNECT_TO_IFACE | CapFlags::GET_ZCOPY;
        let (_pd, _worker, iface) = open_pair("test/iface-attr", caps);
        let attr = iface.query();
        assert_eq!(attr.caps, caps);
        assert_eq!(attr.device_addr_len, 8);
        assert_eq!(attr.iface_addr_len, 8);
        assert_eq!(attr.ep_addr_len, 0);
    }

    #[test]
    fn test_ep_only_transport_has_no_iface_address() {
        let caps = CapFlags::GET_ZCOPY | CapFlags::CONNECT_TO_EP;
        let (_pd, _worker, iface) = open_pair("test/iface-ep-only", caps);
        let attr = iface.query();
        assert_eq!(attr.iface_addr_len, 0);
        assert_eq!(attr.ep_addr_len, 8);
    }

    #[test]
    fn test_fault_budget_counts_down() {
        let (_pd, _worker, iface) = open_pair("test/iface-fault", CapFlags::AM_SHORT);
        iface.fail_next_am_short(2);
        assert!(iface.0.should_fail_am());
        assert!(iface.0.should_fail_am());
        assert!(!iface.0.should_fail_am());
    }

    #[test]
    fn test_fault_alternate() {
        let (_pd, _worker, iface) = open_pair("test/iface-alt", CapFlags::AM_SHORT);
        iface.fail_alternate_am_short(true);
        assert!(iface.0.should_fail_am());
        assert!(!iface.0.should_fail_am());
        assert!(iface.0.should_fail_am());
        iface.fail_alternate_am_short(false);
        assert!(!iface.0.should_fail_am());
    }
}
