//! The server side of a connection pair.
//!
//! A receiver is created when a connect message arrives. It pulls the peer's
//! header with a one-sided GET, then either lifts the piggy-backed payload
//! out of it or issues a second GET for the payload proper, hands the
//! assembled buffer to the external decoder and acknowledges.
//!
//! Per-transfer state machine:
//!
//! ```text
//! IDLE ──read()──▶ READING_HEADER ──hdr-complete──▶
//!     ├─ piggy ─────────────────────────────────▶ ACKING ──ok──▶ IDLE
//!     └─ no piggy ──read_data()──▶ READING_DATA ──data-complete──▶ ACKING
//! ```
//!
//! GET failures are fatal; ACKING retries on back-pressure with cooperative
//! yield.

use std::sync::{Arc, Mutex};

use fabric::md::MemoryRegion;
use fabric::worker::Completion;
use fabric::{Ep, MemFlags, RkeyBundle, Sge, Status};

use crate::buffer::ParcelBuffer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::header::{Header, HEADER_MAX_SIZE};
use crate::{CONNECT_ACK_MESSAGE, READ_ACK_MESSAGE};

struct RecvState {
    header: Header,
    rkey_scratch: Vec<u8>,
    buffer: ParcelBuffer,
    payload_mem: Option<MemoryRegion>,
}

/// The receiving half of one connection.
pub struct Receiver {
    ticket: u64,
    sender_handle: u64,
    remote_header_addr: u64,
    remote_header_key: RkeyBundle,
    am_ep: Mutex<Option<Ep>>,
    rma_ep: Mutex<Option<Ep>>,
    state: Mutex<RecvState>,
}

impl Receiver {
    /// Build the receiver for a peer whose header region lives at
    /// `remote_header_addr` under `packed_key`.
    pub(crate) fn new(
        context: &Context,
        ticket: u64,
        sender_handle: u64,
        remote_header_addr: u64,
        packed_key: &[u8],
    ) -> Result<Arc<Receiver>> {
        let remote_header_key = context
            .pd()
            .rkey_unpack(packed_key)
            .map_err(|status| Error::fabric("unpack header key", status))?;
        let rkey_packed_size = context.pd_attr().rkey_packed_size;
        let header = Header::new(context.pd(), HEADER_MAX_SIZE, rkey_packed_size)
            .map_err(|status| Error::fabric("register receiver header", status))?;

        Ok(Arc::new(Receiver {
            ticket,
            sender_handle,
            remote_header_addr,
            remote_header_key,
            am_ep: Mutex::new(None),
            rma_ep: Mutex::new(None),
            state: Mutex::new(RecvState {
                header,
                rkey_scratch: vec![0u8; rkey_packed_size],
                buffer: ParcelBuffer::default(),
                payload_mem: None,
            }),
        }))
    }

    /// Our opaque handle, the AM header word of read notifications.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// The peer-side sender handle, echoed on acknowledgements.
    pub fn sender_handle(&self) -> u64 {
        self.sender_handle
    }

    /// Connect both endpoints to the peer's interfaces.
    pub(crate) fn connect_iface(
        &self,
        context: &Context,
        am_iface_addr: &[u8],
        am_device_addr: &[u8],
        rma_iface_addr: &[u8],
        rma_device_addr: &[u8],
    ) -> Result<()> {
        let am_ep = Ep::create_connected(context.am_iface(), am_device_addr, am_iface_addr)
            .map_err(|status| Error::fabric("connect receiver am endpoint", status))?;
        let rma_ep = Ep::create_connected(context.rma_iface(), rma_device_addr, rma_iface_addr)
            .map_err(|status| Error::fabric("connect receiver rma endpoint", status))?;
        *self.am_ep.lock().unwrap() = Some(am_ep);
        *self.rma_ep.lock().unwrap() = Some(rma_ep);
        Ok(())
    }

    /// Connect the AM endpoint to the peer's interface and the RMA endpoint
    /// to the peer's endpoint address.
    pub(crate) fn connect_ep(
        &self,
        context: &Context,
        am_iface_addr: &[u8],
        am_device_addr: &[u8],
        rma_device_addr: &[u8],
        rma_ep_addr: &[u8],
    ) -> Result<()> {
        let am_ep = Ep::create_connected(context.am_iface(), am_device_addr, am_iface_addr)
            .map_err(|status| Error::fabric("connect receiver am endpoint", status))?;
        let rma_ep = Ep::create(context.rma_iface())
            .map_err(|status| Error::fabric("create receiver rma endpoint", status))?;
        match rma_ep.connect_to_ep(rma_device_addr, rma_ep_addr) {
            Status::Ok => {}
            status => return Err(Error::fabric("link receiver rma endpoint", status)),
        }
        *self.am_ep.lock().unwrap() = Some(am_ep);
        *self.rma_ep.lock().unwrap() = Some(rma_ep);
        Ok(())
    }

    fn am_ep(&self) -> Result<Ep> {
        self.am_ep
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::fabric("receiver am endpoint", Status::NotConnected))
    }

    fn rma_ep(&self) -> Result<Ep> {
        self.rma_ep
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::fabric("receiver rma endpoint", Status::NotConnected))
    }

    /// Acknowledge the connection, carrying our ticket so the peer can
    /// address read notifications, plus our RMA endpoint address when the
    /// peer still has to finish the endpoint-to-endpoint link. Returns
    /// `false` on transient back-pressure.
    pub(crate) fn send_connect_ack(
        &self,
        connects_to_ep: bool,
        ep_addr_len: usize,
    ) -> Result<bool> {
        let mut payload = vec![0u8; 8];
        payload[..8].copy_from_slice(&self.sender_handle.to_ne_bytes());
        if connects_to_ep {
            payload.resize(16 + ep_addr_len, 0);
            self.rma_ep()?.address(&mut payload[16..]);
        }

        match self
            .am_ep()?
            .am_short(CONNECT_ACK_MESSAGE, self.ticket, &payload)
        {
            Status::Ok => Ok(true),
            Status::NoResource => Ok(false),
            status => Err(Error::fabric("post connect ack", status)),
        }
    }

    /// Pull `header_length` bytes of the peer's header. Returns `Ok(true)`
    /// when the GET completed inline; `Ok(false)` means the completion
    /// callback will fire later.
    pub(crate) fn read(&self, header_length: u64, completion: Completion) -> Result<bool> {
        let sge = {
            let mut state = self.state.lock().unwrap();
            state.payload_mem = None;
            state.header.reset_length(header_length as usize);
            Sge {
                addr: state.header.data_addr(),
                len: header_length as u32,
                lkey: state.header.lkey(),
            }
        };

        match self.rma_ep()?.get_zcopy(
            sge,
            self.remote_header_addr,
            &self.remote_header_key,
            completion,
        ) {
            Status::InProgress => Ok(false),
            Status::Ok => Ok(true),
            status => Err(Error::fabric("header get", status)),
        }
    }

    /// Size the payload buffer from the pulled header and record the chunk
    /// counts. Returns `true` when the payload was piggy-backed and no
    /// second GET is needed.
    pub(crate) fn read_header_done(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let RecvState { header, buffer, .. } = &mut *state;

        buffer.data.resize(header.size() as usize, 0);
        buffer.size = header.size();
        buffer.num_chunks = header.num_chunks();
        let total_chunks = buffer.num_chunks.0 + buffer.num_chunks.1;
        buffer
            .transmission_chunks
            .resize(total_chunks as usize, Default::default());

        if let Some(piggy) = header.piggy_back() {
            let len = buffer.data.len();
            buffer.data.copy_from_slice(&piggy[..len]);
            true
        } else {
            false
        }
    }

    /// Register the payload buffer and pull the payload from the address and
    /// key advertised in the header tail. Same completion protocol as
    /// [`Receiver::read`].
    pub(crate) fn read_data(&self, context: &Context, completion: Completion) -> Result<bool> {
        let (sge, remote_addr, remote_key) = {
            let mut state = self.state.lock().unwrap();
            let RecvState {
                header,
                rkey_scratch,
                buffer,
                payload_mem,
            } = &mut *state;

            // Safety: the payload vector is not resized again until the
            // transfer completes and the registration drops.
            let mem = unsafe {
                context.pd().register(
                    buffer.data.as_mut_ptr(),
                    buffer.data.len(),
                    MemFlags::NONBLOCK,
                )
            }
            .map_err(|status| Error::fabric("register payload", status))?;

            let key_len = rkey_scratch.len();
            let (remote_addr, key) = header.remote_payload(key_len);
            rkey_scratch.copy_from_slice(key);
            let remote_key = context
                .pd()
                .rkey_unpack(rkey_scratch)
                .map_err(|status| Error::fabric("unpack payload key", status))?;

            let sge = Sge {
                addr: buffer.data.as_ptr() as u64,
                len: buffer.data.len() as u32,
                lkey: mem.lkey(),
            };
            *payload_mem = Some(mem);
            (sge, remote_addr, remote_key)
        };

        match self
            .rma_ep()?
            .get_zcopy(sge, remote_addr, &remote_key, completion)
        {
            Status::InProgress => Ok(false),
            Status::Ok => Ok(true),
            status => Err(Error::fabric("payload get", status)),
        }
    }

    /// Hand the assembled buffer to `deliver`, drop the payload registration
    /// and acknowledge the transfer. Returns `false` when the
    /// acknowledgement hit back-pressure; the call is idempotent, so the
    /// caller just retries.
    pub(crate) fn read_done(&self, deliver: impl FnOnce(ParcelBuffer)) -> Result<bool> {
        let buffer = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.buffer)
        };
        if !buffer.data.is_empty() {
            deliver(buffer);
        }
        {
            let mut state = self.state.lock().unwrap();
            state.payload_mem = None;
        }

        match self.am_ep()?.am_short(READ_ACK_MESSAGE, self.sender_handle, &[]) {
            Status::Ok => Ok(true),
            Status::NoResource => Ok(false),
            status => Err(Error::fabric("post read ack", status)),
        }
    }
}
