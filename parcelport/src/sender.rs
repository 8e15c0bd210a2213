//! The client side of a connection pair.
//!
//! A sender owns the outbound header region and, per transfer, the user
//! payload buffer and its registration. It initiates the handshake, posts
//! the read notification and is woken by the read acknowledgement, at which
//! point the user callbacks fire and the buffers are reclaimed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fabric::md::MemoryRegion;
use fabric::{Ep, MemFlags, Status};

use crate::buffer::ParcelBuffer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::header::{Header, HEADER_MAX_SIZE};
use crate::locality::Locality;
use crate::{CLOSE_MESSAGE, CONNECT_MESSAGE, READ_MESSAGE};

/// Completion callback of one transfer.
pub type WriteHandler = Box<dyn FnOnce(bool) + Send>;

/// Post-transfer callback; receives the destination and the shared owner of
/// the sender so the pool can requeue it.
pub type PostprocessHandler = Box<dyn FnOnce(bool, &Locality, Arc<Sender>) + Send>;

struct SenderState {
    header: Header,
    rkey_scratch: Vec<u8>,
    buffer: ParcelBuffer,
    payload_mem: Option<MemoryRegion>,
    handler: Option<WriteHandler>,
    postprocess: Option<PostprocessHandler>,
    /// Shared owner of ourselves, held across an outstanding transfer and
    /// released in `done`.
    this: Option<Arc<Sender>>,
}

/// A connection to one destination locality.
pub struct Sender {
    there: Locality,
    ticket: u64,
    context: Arc<Context>,
    am_ep: Ep,
    rma_ep: Option<Ep>,
    /// Peer-side receiver handle, echoed as the AM header word of read
    /// notifications. Zero until the connection is acknowledged.
    receive_handle: AtomicU64,
    state: Mutex<SenderState>,
}

impl Sender {
    /// Create a sender towards `there`. With `rma_connect_to_ep`, a
    /// standalone RMA endpoint is created now and linked when the connect
    /// acknowledgement delivers the peer's endpoint address; otherwise the
    /// peer connects straight to our RMA interface.
    pub(crate) fn new(
        there: Locality,
        context: Arc<Context>,
        rma_connect_to_ep: bool,
        ticket: u64,
    ) -> Result<Arc<Sender>> {
        let am_ep = Ep::create_connected(
            context.am_iface(),
            there.am_addr().device_addr(),
            there.am_addr().iface_addr(),
        )
        .map_err(|status| Error::fabric("connect sender am endpoint", status))?;

        let rma_ep = if rma_connect_to_ep {
            Some(
                Ep::create(context.rma_iface())
                    .map_err(|status| Error::fabric("create sender rma endpoint", status))?,
            )
        } else {
            None
        };

        let rkey_packed_size = context.pd_attr().rkey_packed_size;
        let header = Header::new(context.pd(), HEADER_MAX_SIZE, rkey_packed_size)
            .map_err(|status| Error::fabric("register sender header", status))?;

        Ok(Arc::new(Sender {
            there,
            ticket,
            context,
            am_ep,
            rma_ep,
            receive_handle: AtomicU64::new(0),
            state: Mutex::new(SenderState {
                header,
                rkey_scratch: vec![0u8; rkey_packed_size],
                buffer: ParcelBuffer::default(),
                payload_mem: None,
                handler: None,
                postprocess: None,
                this: None,
            }),
        }))
    }

    /// The destination locality.
    pub fn destination(&self) -> &Locality {
        &self.there
    }

    /// Our opaque handle, carried on the wire so acknowledgements find us.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// The peer-side receiver handle; zero until acknowledged.
    pub fn receive_handle(&self) -> u64 {
        self.receive_handle.load(Ordering::Acquire)
    }

    pub(crate) fn set_receive_handle(&self, handle: u64) {
        let previous = self.receive_handle.swap(handle, Ordering::AcqRel);
        debug_assert_eq!(previous, 0);
    }

    /// Post the connect message advertising our addresses and the header
    /// region. Returns `false` on transient back-pressure; the caller
    /// retries with cooperative yield.
    pub fn connect(&self, here: &Locality, rma_ep_addr_len: usize) -> Result<bool> {
        let payload = {
            let state = self.state.lock().unwrap();

            let mut payload = Vec::with_capacity(64);
            match &self.rma_ep {
                // The peer completes an endpoint-to-endpoint link: ship our
                // RMA device address and our endpoint address.
                Some(rma_ep) => {
                    payload.extend_from_slice(here.rma_addr().device_addr());
                    let at = payload.len();
                    payload.resize(at + rma_ep_addr_len, 0);
                    rma_ep.address(&mut payload[at..]);
                }
                // The peer connects to our RMA interface directly.
                None => {
                    payload.extend_from_slice(here.rma_addr().iface_addr());
                    payload.extend_from_slice(here.rma_addr().device_addr());
                }
            }
            payload.extend_from_slice(here.am_addr().iface_addr());
            payload.extend_from_slice(here.am_addr().device_addr());
            payload.extend_from_slice(state.header.packed_rkey());
            payload.extend_from_slice(&state.header.data_addr().to_ne_bytes());
            payload.extend_from_slice(&self.ticket.to_ne_bytes());
            payload
        };

        match self.am_ep.am_short(CONNECT_MESSAGE, self.ticket, &payload) {
            Status::Ok => Ok(true),
            Status::NoResource => Ok(false),
            status => Err(Error::fabric("post connect", status)),
        }
    }

    /// Start one transfer. The connection must have been acknowledged and
    /// the previous transfer completed.
    ///
    /// Fills the header from `buffer`; when the payload does not fit
    /// piggy-backed, registers it and advertises its address and key through
    /// the header tail. Finally notifies the peer that the header is ready.
    pub fn async_write(
        self: &Arc<Self>,
        buffer: ParcelBuffer,
        handler: WriteHandler,
        postprocess: PostprocessHandler,
    ) -> Result<()> {
        debug_assert_ne!(self.receive_handle(), 0);
        debug_assert!(buffer.transmission_chunks.is_empty());

        let header_length;
        {
            let mut state = self.state.lock().unwrap();
            state.this = Some(self.clone());
            state.handler = Some(handler);
            state.postprocess = Some(postprocess);
            state.buffer = buffer;

            let SenderState {
                header,
                rkey_scratch,
                buffer,
                payload_mem,
                ..
            } = &mut *state;

            header.reset_from(buffer);
            if header.piggy_back().is_none() {
                // Safety: the payload vector stays untouched in our state
                // until `done` drops the registration.
                let mem = unsafe {
                    self.context.pd().register(
                        buffer.data.as_mut_ptr(),
                        buffer.data.len(),
                        MemFlags::NONBLOCK,
                    )
                }
                .map_err(|status| Error::fabric("register payload", status))?;
                mem.pack_rkey(rkey_scratch);
                header.set_remote_payload(buffer.data.as_ptr() as u64, rkey_scratch);
                *payload_mem = Some(mem);
            }
            header_length = header.length() as u64;
        }

        let receive_handle = self.receive_handle();
        match self.am_ep.am_short(
            READ_MESSAGE,
            receive_handle,
            &header_length.to_ne_bytes(),
        ) {
            Status::Ok => Ok(()),
            status => Err(Error::fabric("post read notification", status)),
        }
    }

    /// Complete the outstanding transfer: run the user callbacks, reclaim
    /// the payload registration and release the shared self-reference,
    /// making the sender reusable.
    pub fn done(&self) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            state.handler.take()
        };
        debug_assert!(handler.is_some());
        if let Some(handler) = handler {
            handler(true);
        }

        let (postprocess, this) = {
            let mut state = self.state.lock().unwrap();
            state.payload_mem = None;
            state.buffer.clear();
            (state.postprocess.take(), state.this.take())
        };
        debug_assert!(postprocess.is_some());
        if let (Some(postprocess), Some(this)) = (postprocess, this) {
            postprocess(true, &self.there, this);
        }
    }

    /// Ask the peer to retire its receiver for this connection. Returns
    /// `false` on transient back-pressure.
    pub fn close(&self) -> Result<bool> {
        let receive_handle = self.receive_handle();
        debug_assert_ne!(receive_handle, 0);
        match self.am_ep.am_short(CLOSE_MESSAGE, receive_handle, &[]) {
            Status::Ok => Ok(true),
            Status::NoResource => Ok(false),
            status => Err(Error::fabric("post close", status)),
        }
    }

    /// Finish the endpoint-to-endpoint RMA linkage with the address the
    /// connect acknowledgement carried.
    pub(crate) fn connect_rma_to_ep(&self, ep_addr: &[u8]) -> Result<()> {
        let rma_ep = match &self.rma_ep {
            Some(ep) => ep,
            None => {
                return Err(Error::fabric(
                    "connect rma endpoint",
                    Status::NotConnected,
                ))
            }
        };
        match rma_ep.connect_to_ep(self.there.rma_addr().device_addr(), ep_addr) {
            Status::Ok => Ok(()),
            status => Err(Error::fabric("connect rma endpoint", status)),
        }
    }
}
