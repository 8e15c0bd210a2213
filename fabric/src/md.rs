//! Protection domains and memory registration.
//!
//! A protection domain (MD) scopes memory registrations: a remote key packed
//! under one domain is only honored for endpoints whose interfaces were
//! opened on a domain of the same fabric. Every buffer the fabric touches
//! must be registered before use and stays accessible until the returned
//! [`MemoryRegion`] is dropped, which deregisters it exactly once.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::iface::TransportSpec;
use crate::registry::{registry, Region};
use crate::status::Status;

/// Size of a packed remote key blob: an 8-byte key id followed by an 8-byte
/// format tag.
pub const RKEY_PACKED_SIZE: usize = 16;

/// Format tag stamped into every packed remote key.
pub(crate) const RKEY_FORMAT_TAG: u64 = 0x4642_524b_4559_0001;

bitflags! {
    /// Memory registration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Register without blocking on page pinning.
        const NONBLOCK = 1 << 0;
    }
}

/// A discoverable protection domain resource.
#[derive(Debug, Clone)]
pub struct MdResource {
    /// Domain name, e.g. `ib/mlx4_0`.
    pub md_name: String,
}

/// Attributes of an open protection domain.
#[derive(Debug, Clone, Copy)]
pub struct MdAttr {
    /// Size of a packed remote key produced by [`MemoryRegion::pack_rkey`].
    pub rkey_packed_size: usize,
}

/// A transport available on a protection domain.
#[derive(Debug, Clone)]
pub struct TransportDesc {
    /// Transport layer name.
    pub tl_name: String,
    /// Device the transport runs on.
    pub dev_name: String,
}

/// Enumerate the protection domain resources known to the process.
pub fn query_resources() -> Vec<MdResource> {
    let domains = registry().domains.lock().unwrap();
    let mut res: Vec<MdResource> = domains
        .keys()
        .map(|name| MdResource {
            md_name: name.clone(),
        })
        .collect();
    res.sort_by(|a, b| a.md_name.cmp(&b.md_name));
    res
}

/// Publish a domain and its transports, as a device driver would at load
/// time. Re-registering a name replaces its transport list.
pub fn register_domain(name: &str, transports: &[TransportSpec]) {
    registry()
        .domains
        .lock()
        .unwrap()
        .insert(name.to_string(), transports.to_vec());
}

/// Number of memory regions currently registered process-wide.
pub fn live_regions() -> usize {
    registry().regions.lock().unwrap().len()
}

pub(crate) struct MdInner {
    name: String,
    instance: u64,
    pub(crate) live_regions: AtomicI64,
    pub(crate) live_bundles: AtomicI64,
}

/// An open protection domain.
///
/// Cheaply cloneable; the domain closes when the last clone drops.
#[derive(Clone)]
pub struct Md(pub(crate) Arc<MdInner>);

impl Md {
    /// Open the domain with the given name.
    pub fn open(name: &str) -> Result<Md, Status> {
        let domains = registry().domains.lock().unwrap();
        if !domains.contains_key(name) {
            return Err(Status::NoDevice);
        }
        Ok(Md(Arc::new(MdInner {
            name: name.to_string(),
            instance: registry().alloc_id(),
            live_regions: AtomicI64::new(0),
            live_bundles: AtomicI64::new(0),
        })))
    }

    /// Domain name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Identity of this open domain instance. Doubles as the device part of
    /// the address blobs of interfaces opened on it.
    pub fn instance(&self) -> u64 {
        self.0.instance
    }

    /// Query domain attributes.
    pub fn query(&self) -> MdAttr {
        MdAttr {
            rkey_packed_size: RKEY_PACKED_SIZE,
        }
    }

    /// Enumerate the transports available on this domain.
    pub fn transports(&self) -> Vec<TransportDesc> {
        let domains = registry().domains.lock().unwrap();
        domains
            .get(&self.0.name)
            .map(|specs| {
                specs
                    .iter()
                    .map(|s| TransportDesc {
                        tl_name: s.name.clone(),
                        dev_name: self.0.name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn transport_spec(&self, tl_name: &str) -> Option<TransportSpec> {
        let domains = registry().domains.lock().unwrap();
        domains
            .get(&self.0.name)?
            .iter()
            .find(|s| s.name == tl_name)
            .cloned()
    }

    /// Register a memory region with the domain.
    ///
    /// # Safety
    /// The caller must ensure that the `len` bytes starting at `addr` stay
    /// valid, and at a stable address, for the lifetime of the returned
    /// `MemoryRegion`. The fabric reads and writes the range through this
    /// pointer while serving remote operations.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        _flags: MemFlags,
    ) -> Result<MemoryRegion, Status> {
        if addr.is_null() && len != 0 {
            return Err(Status::InvalidParam);
        }
        let key = registry().alloc_id();
        registry().regions.lock().unwrap().insert(
            key,
            Region {
                addr: addr as usize,
                len,
            },
        );
        self.0.live_regions.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryRegion {
            key,
            addr,
            len,
            md: self.clone(),
        })
    }

    /// Unpack a remote key blob received from a peer. The bundle is
    /// accounted against this domain and released on drop.
    pub fn rkey_unpack(&self, blob: &[u8]) -> Result<crate::rkey::RkeyBundle, Status> {
        crate::rkey::unpack(self, blob)
    }

    /// Memory regions currently registered with this domain instance.
    pub fn live_regions(&self) -> i64 {
        self.0.live_regions.load(Ordering::Relaxed)
    }

    /// Remote key bundles currently held under this domain instance.
    pub fn live_rkey_bundles(&self) -> i64 {
        self.0.live_bundles.load(Ordering::Relaxed)
    }
}

/// A memory region registered with a protection domain.
///
/// Provides the local key used in [`crate::ep::Sge`] descriptors and the
/// remote key that, once packed and shipped to a peer, authorizes one-sided
/// access. Deregistered on drop.
pub struct MemoryRegion {
    key: u64,
    addr: *mut u8,
    len: usize,
    /// Keep the domain open while the region exists.
    md: Md,
}

// Safety: the raw pointer is only dereferenced by the fabric's validated
// copy path; the registration contract pins the underlying memory.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Local key naming this region in scatter/gather entries.
    pub fn lkey(&self) -> u64 {
        self.key
    }

    /// Remote key authorizing one-sided access to this region.
    pub fn rkey(&self) -> u64 {
        self.key
    }

    /// Starting address of the registered range.
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Length of the registered range in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the registered range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pack the remote key into `out`, which must hold at least
    /// [`RKEY_PACKED_SIZE`] bytes.
    pub fn pack_rkey(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.key.to_ne_bytes());
        out[8..RKEY_PACKED_SIZE].copy_from_slice(&RKEY_FORMAT_TAG.to_ne_bytes());
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        registry().regions.lock().unwrap().remove(&self.key);
        self.md.0.live_regions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Number of remote key bundles currently held process-wide.
pub fn live_rkey_bundles() -> i64 {
    registry().live_bundles.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::CapFlags;

    fn spec(name: &str, caps: CapFlags) -> TransportSpec {
        TransportSpec {
            name: name.to_string(),
            caps,
        }
    }

    #[test]
    fn test_domain_discovery() {
        register_domain("test/md-disc", &[spec("lo", CapFlags::AM_SHORT)]);
        assert!(query_resources()
            .iter()
            .any(|r| r.md_name == "test/md-disc"));
        assert!(Md::open("test/md-missing").is_err());

        let md = Md::open("test/md-disc").unwrap();
        assert_eq!(md.query().rkey_packed_size, RKEY_PACKED_SIZE);
        assert_eq!(md.transports().len(), 1);
        assert_eq!(md.transports()[0].tl_name, "lo");
    }

    #[test]
    fn test_registration_accounting() {
        register_domain("test/md-reg", &[spec("lo", CapFlags::AM_SHORT)]);
        let md = Md::open("test/md-reg").unwrap();

        assert_eq!(md.live_regions(), 0);
        let mut buf = vec![0u8; 64];
        let mr = unsafe { md.register(buf.as_mut_ptr(), buf.len(), MemFlags::NONBLOCK) }.unwrap();
        assert_eq!(md.live_regions(), 1);
        assert_eq!(mr.len(), 64);
        assert_eq!(mr.lkey(), mr.rkey());

        drop(mr);
        assert_eq!(md.live_regions(), 0);
    }

    #[test]
    fn test_pack_rkey_layout() {
        register_domain("test/md-pack", &[spec("lo", CapFlags::AM_SHORT)]);
        let md = Md::open("test/md-pack").unwrap();
        let mut buf = vec![0u8; 16];
        let mr = unsafe { md.register(buf.as_mut_ptr(), buf.len(), MemFlags::NONBLOCK) }.unwrap();

        let mut packed = [0u8; RKEY_PACKED_SIZE];
        mr.pack_rkey(&mut packed);
        let mut key = [0u8; 8];
        key.copy_from_slice(&packed[..8]);
        assert_eq!(u64::from_ne_bytes(key), mr.rkey());
    }
}
