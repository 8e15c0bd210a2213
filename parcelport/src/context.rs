//! The transport context: async substrate, progress worker, protection
//! domain and the two interface roles.

use std::sync::{Arc, Mutex, MutexGuard};

use fabric::md::{self, Md, MdAttr};
use fabric::{
    AsyncContext, AsyncMode, CapFlags, Iface, IfaceAttr, IfaceParams, ThreadMode, Worker,
};

use crate::error::{Error, Result};
use crate::locality::Locality;

/// Owns the fabric resources of one locality.
///
/// Opened in thread-safe mode: `progress` and post operations may be invoked
/// from any thread, with the hot path serialized through progress callbacks.
pub struct Context {
    _async_ctx: AsyncContext,
    worker: Worker,
    pd: Md,
    pd_attr: MdAttr,
    am_iface: Iface,
    am_attr: IfaceAttr,
    rma_iface: Iface,
    rma_attr: IfaceAttr,
    here: Locality,
    mtx: Mutex<()>,
}

impl Context {
    /// Open the domain named by `domain` and bind the first interfaces
    /// satisfying the active-message and RMA roles. Interfaces not selected
    /// for either role are closed immediately. A single interface may serve
    /// both roles; it is then shared and closed exactly once.
    pub fn new(domain: &str) -> Result<Arc<Context>> {
        let async_ctx = AsyncContext::new(AsyncMode::Thread)
            .map_err(|status| Error::fabric("init async context", status))?;
        let worker = Worker::new(&async_ctx, ThreadMode::Multi)
            .map_err(|status| Error::fabric("create worker", status))?;

        let mut found_domain = false;
        let mut selected: Option<(Md, Iface, IfaceAttr, Iface, IfaceAttr)> = None;

        for resource in md::query_resources() {
            if resource.md_name != domain {
                continue;
            }
            found_domain = true;

            let pd =
                Md::open(&resource.md_name).map_err(|status| Error::fabric("open pd", status))?;

            // The AM role needs short active messages and direct interface
            // connections to signal new GETs; the RMA role needs zero-copy
            // GET to pull the arguments.
            let mut am: Option<(Iface, IfaceAttr)> = None;
            let mut rma: Option<(Iface, IfaceAttr)> = None;
            let params = IfaceParams { rx_headroom: 0 };
            for transport in pd.transports() {
                let iface = Iface::open(&pd, &worker, &transport, &params)
                    .map_err(|status| Error::fabric("open interface", status))?;
                let attr = iface.query();

                if am.is_none()
                    && attr.caps.contains(CapFlags::AM_SHORT | CapFlags::CONNECT_TO_IFACE)
                {
                    am = Some((iface.clone(), attr.clone()));
                }
                if rma.is_none() && attr.caps.contains(CapFlags::GET_ZCOPY) {
                    rma = Some((iface.clone(), attr.clone()));
                }
                // An iface selected for neither role closes here when the
                // last clone drops.
                if am.is_some() && rma.is_some() {
                    break;
                }
            }

            if let (Some((am_iface, am_attr)), Some((rma_iface, rma_attr))) = (am, rma) {
                selected = Some((pd, am_iface, am_attr, rma_iface, rma_attr));
                break;
            }
        }

        let (pd, am_iface, am_attr, rma_iface, rma_attr) = match selected {
            Some(s) => s,
            None if found_domain => return Err(Error::NoSuitableInterface(domain.to_string())),
            None => return Err(Error::NoSuchDomain(domain.to_string())),
        };

        let pd_attr = pd.query();

        // Publish our addresses so the bootstrap layer can exchange them.
        let mut here = Locality::default();
        here.rma_addr_mut().set_iface_attr(&rma_attr);
        rma_iface.device_address(here.rma_addr_mut().device_addr_mut());
        if rma_attr.caps.contains(CapFlags::CONNECT_TO_IFACE) {
            rma_iface.iface_address(here.rma_addr_mut().iface_addr_mut());
        }
        here.am_addr_mut().set_iface_attr(&am_attr);
        am_iface.device_address(here.am_addr_mut().device_addr_mut());
        am_iface.iface_address(here.am_addr_mut().iface_addr_mut());

        Ok(Arc::new(Context {
            _async_ctx: async_ctx,
            worker,
            pd,
            pd_attr,
            am_iface,
            am_attr,
            rma_iface,
            rma_attr,
            here,
            mtx: Mutex::new(()),
        }))
    }

    /// One non-blocking iteration of the progress worker.
    pub fn progress(&self) {
        self.worker.progress();
    }

    /// Serialize mutating access to dispatcher resource maps.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mtx.lock().unwrap()
    }

    /// Non-blocking variant of [`Context::lock`].
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.mtx.try_lock().ok()
    }

    pub fn pd(&self) -> &Md {
        &self.pd
    }

    pub fn pd_attr(&self) -> &MdAttr {
        &self.pd_attr
    }

    pub fn am_iface(&self) -> &Iface {
        &self.am_iface
    }

    pub fn am_attr(&self) -> &IfaceAttr {
        &self.am_attr
    }

    pub fn rma_iface(&self) -> &Iface {
        &self.rma_iface
    }

    pub fn rma_attr(&self) -> &IfaceAttr {
        &self.rma_attr
    }

    /// The local locality, ready for bootstrap exchange.
    pub fn here(&self) -> &Locality {
        &self.here
    }

    /// The underlying worker; exposed for diagnostics.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }
}
