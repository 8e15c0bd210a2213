//! Endpoints.
//!
//! An endpoint binds a local interface to one remote peer, either by the
//! peer's interface address (`CONNECT_TO_IFACE` transports) or pairwise via
//! exchanged endpoint addresses (`CONNECT_TO_EP` transports). It posts short
//! active messages and one-sided GETs; GETs are queued on the local worker
//! and complete, in issue order, through the supplied callback.

use std::sync::{Arc, Mutex};

use crate::iface::{AmMessage, CapFlags, Iface, IfaceInner};
use crate::registry::registry;
use crate::rkey::RkeyBundle;
use crate::status::Status;
use crate::worker::{Completion, PendingGet};

/// Scatter/gather entry naming local registered memory.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    /// Local virtual address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
    /// Local key of the registration covering the range.
    pub lkey: u64,
}

enum Remote {
    Iface(u64),
    Ep(u64),
}

pub(crate) struct EpInner {
    id: u64,
    iface: Arc<IfaceInner>,
    remote: Mutex<Option<Remote>>,
}

impl Drop for EpInner {
    fn drop(&mut self) {
        registry().eps.lock().unwrap().remove(&self.id);
    }
}

/// An endpoint connected (or connectable) to one remote peer.
///
/// Cheaply cloneable; destroyed when the last clone drops.
#[derive(Clone)]
pub struct Ep(Arc<EpInner>);

impl Ep {
    fn register(inner: EpInner) -> Ep {
        let inner = Arc::new(inner);
        registry()
            .eps
            .lock()
            .unwrap()
            .insert(inner.id, Arc::downgrade(&inner));
        Ep(inner)
    }

    /// Create an endpoint connected to the remote interface whose address
    /// blobs are given.
    pub fn create_connected(
        iface: &Iface,
        _device_addr: &[u8],
        iface_addr: &[u8],
    ) -> Result<Ep, Status> {
        if !iface.query().caps.contains(CapFlags::CONNECT_TO_IFACE) {
            return Err(Status::Unsupported);
        }
        if iface_addr.len() < 8 {
            return Err(Status::InvalidParam);
        }
        let target = read_u64(iface_addr);
        if registry().lookup_iface(target).is_none() {
            return Err(Status::Unreachable);
        }
        Ok(Self::register(EpInner {
            id: registry().alloc_id(),
            iface: iface.inner().clone(),
            remote: Mutex::new(Some(Remote::Iface(target))),
        }))
    }

    /// Create an unconnected endpoint, to be linked with
    /// [`Ep::connect_to_ep`] once the peer's endpoint address is known.
    pub fn create(iface: &Iface) -> Result<Ep, Status> {
        if !iface.query().caps.contains(CapFlags::CONNECT_TO_EP) {
            return Err(Status::Unsupported);
        }
        Ok(Self::register(EpInner {
            id: registry().alloc_id(),
            iface: iface.inner().clone(),
            remote: Mutex::new(None),
        }))
    }

    /// Write this endpoint's address blob into `out`.
    pub fn address(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.0.id.to_ne_bytes());
    }

    /// Complete an endpoint-to-endpoint connection.
    pub fn connect_to_ep(&self, _device_addr: &[u8], ep_addr: &[u8]) -> Status {
        if !self.0.iface.caps.contains(CapFlags::CONNECT_TO_EP) {
            return Status::Unsupported;
        }
        if ep_addr.len() < 8 {
            return Status::InvalidParam;
        }
        let target = read_u64(ep_addr);
        if registry().lookup_ep(target).is_none() {
            return Status::Unreachable;
        }
        *self.0.remote.lock().unwrap() = Some(Remote::Ep(target));
        self.0.iface.note_ep_connect();
        Status::Ok
    }

    fn resolve_target(&self) -> Result<Arc<IfaceInner>, Status> {
        let remote = self.0.remote.lock().unwrap();
        match remote.as_ref() {
            None => Err(Status::NotConnected),
            Some(Remote::Iface(id)) => registry().lookup_iface(*id).ok_or(Status::Unreachable),
            Some(Remote::Ep(id)) => registry()
                .lookup_ep(*id)
                .map(|ep| ep.iface.clone())
                .ok_or(Status::Unreachable),
        }
    }

    /// Post a short active message carrying a 64-bit header word and `body`.
    pub fn am_short(&self, id: u8, header: u64, body: &[u8]) -> Status {
        if !self.0.iface.caps.contains(CapFlags::AM_SHORT) {
            return Status::Unsupported;
        }
        if body.len() > self.0.iface.attr().am_max_short {
            return Status::InvalidParam;
        }
        if self.0.iface.should_fail_am() {
            return Status::NoResource;
        }
        let target = match self.resolve_target() {
            Ok(t) => t,
            Err(status) => return status,
        };
        target.enqueue(AmMessage {
            id,
            header,
            body: body.to_vec(),
        });
        self.0.iface.note_am_posted(id);
        Status::Ok
    }

    /// Issue a one-sided GET of `sge.len` bytes from `remote_addr` under
    /// `rkey` into the local registered range named by `sge`.
    ///
    /// Returns [`Status::InProgress`] when the transfer was queued; the
    /// completion callback observes the final status on a later progress
    /// iteration of the local worker.
    pub fn get_zcopy(
        &self,
        sge: Sge,
        remote_addr: u64,
        rkey: &RkeyBundle,
        completion: Completion,
    ) -> Status {
        if !self.0.iface.caps.contains(CapFlags::GET_ZCOPY) {
            return Status::Unsupported;
        }
        if self.0.remote.lock().unwrap().is_none() {
            return Status::NotConnected;
        }
        let worker = match self.0.iface.worker.upgrade() {
            Some(worker) => worker,
            None => return Status::NoDevice,
        };
        self.0.iface.note_get(sge.len as u64);
        worker.queue_get(PendingGet {
            local_addr: sge.addr,
            len: sge.len as usize,
            lkey: sge.lkey,
            remote_addr,
            rkey: rkey.rkey(),
            completion,
        });
        Status::InProgress
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_ne_bytes(word)
}
