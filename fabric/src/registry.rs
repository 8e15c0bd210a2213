//! Process-wide resource tables.
//!
//! These tables stand in for what device firmware and kernel drivers keep on
//! real hardware: the set of discoverable protection domains, the memory
//! translation table that resolves a key to registered bytes, and the routing
//! tables that resolve address blobs to live interfaces and endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, Weak};

use crate::ep::EpInner;
use crate::iface::{IfaceInner, TransportSpec};
use crate::status::Status;

pub(crate) struct Registry {
    next_id: AtomicU64,
    pub(crate) domains: Mutex<HashMap<String, Vec<TransportSpec>>>,
    pub(crate) regions: Mutex<HashMap<u64, Region>>,
    pub(crate) ifaces: Mutex<HashMap<u64, Weak<IfaceInner>>>,
    pub(crate) eps: Mutex<HashMap<u64, Weak<EpInner>>>,
    pub(crate) live_bundles: AtomicI64,
}

/// One registered memory region as the translation table sees it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    pub(crate) addr: usize,
    pub(crate) len: usize,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub(crate) fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        next_id: AtomicU64::new(1),
        domains: Mutex::new(HashMap::new()),
        regions: Mutex::new(HashMap::new()),
        ifaces: Mutex::new(HashMap::new()),
        eps: Mutex::new(HashMap::new()),
        live_bundles: AtomicI64::new(0),
    })
}

impl Registry {
    /// Allocate a process-unique id. Ids are shared between interfaces,
    /// endpoints and memory keys and are never reused.
    pub(crate) fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn lookup_iface(&self, id: u64) -> Option<std::sync::Arc<IfaceInner>> {
        self.ifaces.lock().unwrap().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn lookup_ep(&self, id: u64) -> Option<std::sync::Arc<EpInner>> {
        self.eps.lock().unwrap().get(&id).and_then(Weak::upgrade)
    }

    /// Move `len` bytes from the region named by `rkey` into the region named
    /// by `lkey`. Both ranges are validated against the translation table,
    /// and the table lock is held across the copy so no deregistration can
    /// race the transfer.
    pub(crate) fn copy_remote(
        &self,
        rkey: u64,
        remote_addr: u64,
        lkey: u64,
        local_addr: u64,
        len: usize,
    ) -> Status {
        let regions = self.regions.lock().unwrap();
        let resolve = |key: u64, addr: u64| -> Result<usize, Status> {
            let region = regions.get(&key).ok_or(Status::InvalidParam)?;
            let start = addr as usize;
            let end = start.checked_add(len).ok_or(Status::OutOfRange)?;
            if start < region.addr || end > region.addr + region.len {
                return Err(Status::OutOfRange);
            }
            Ok(start)
        };
        let src = match resolve(rkey, remote_addr) {
            Ok(p) => p,
            Err(status) => return status,
        };
        let dst = match resolve(lkey, local_addr) {
            Ok(p) => p,
            Err(status) => return status,
        };
        // Safety: both ranges sit inside live registrations and stay live
        // while the table lock is held; the registration contract
        // (`Md::register`) covers the pointer accesses.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        }
        Status::Ok
    }
}
