//! The parcelport dispatcher.
//!
//! One per locality. Owns the context, installs the five active message
//! handlers, tracks live receivers and senders by ticket, and drives
//! background progress. Tickets are process-local monotonically allocated
//! 64-bit words carried in AM header words; they never leave the process's
//! meaning space, so no pointer ever crosses the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use fabric::worker::Completion;
use fabric::{AmCbFlags, CapFlags, Status};

use crate::buffer::ParcelBuffer;
use crate::config::Config;
use crate::context::Context;
use crate::error::Result;
use crate::locality::Locality;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::util::yield_k;
use crate::{
    CLOSE_MESSAGE, CONNECT_ACK_MESSAGE, CONNECT_MESSAGE, READ_ACK_MESSAGE, READ_MESSAGE,
};

/// Hand-off hook for assembled parcels; the external decoder sits behind it.
pub type ParcelHandler = Box<dyn Fn(ParcelBuffer) + Send + Sync>;

/// The process-wide transport dispatcher of one locality.
pub struct Parcelport {
    config: Config,
    context: Arc<Context>,
    stopped: AtomicBool,
    next_ticket: AtomicU64,
    senders: Mutex<HashMap<u64, Arc<Sender>>>,
    receivers: Mutex<HashMap<u64, Arc<Receiver>>>,
    on_parcel: ParcelHandler,
    weak_self: Weak<Parcelport>,
}

impl Parcelport {
    /// Open the configured domain and install the active message handlers.
    /// `on_parcel` receives every assembled parcel buffer.
    pub fn new(config: Config, on_parcel: ParcelHandler) -> Result<Arc<Parcelport>> {
        config.validate()?;
        let context = Context::new(&config.domain)?;

        let pp = Arc::new_cyclic(|weak_self| Parcelport {
            config,
            context,
            stopped: AtomicBool::new(false),
            // Ticket 0 stays reserved as "not yet acknowledged".
            next_ticket: AtomicU64::new(1),
            senders: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            on_parcel,
            weak_self: weak_self.clone(),
        });
        pp.install_am_handlers();
        Ok(pp)
    }

    fn install_am_handlers(&self) {
        let am_iface = self.context.am_iface();
        let caps = self.context.am_attr().caps;
        let flags = if caps.contains(CapFlags::AM_CB_ASYNC) {
            AmCbFlags::ASYNC
        } else {
            AmCbFlags::SYNC
        };

        let weak = self.weak_self.clone();
        am_iface.set_am_handler(CONNECT_MESSAGE, flags, move |header, body| {
            match weak.upgrade() {
                Some(pp) => pp.handle_connect(header, body),
                None => Status::Ok,
            }
        });
        let weak = self.weak_self.clone();
        am_iface.set_am_handler(CONNECT_ACK_MESSAGE, flags, move |header, body| {
            match weak.upgrade() {
                Some(pp) => pp.handle_connect_ack(header, body),
                None => Status::Ok,
            }
        });
        let weak = self.weak_self.clone();
        am_iface.set_am_handler(READ_MESSAGE, flags, move |header, body| {
            match weak.upgrade() {
                Some(pp) => pp.handle_read(header, body),
                None => Status::Ok,
            }
        });
        let weak = self.weak_self.clone();
        am_iface.set_am_handler(READ_ACK_MESSAGE, flags, move |header, body| {
            match weak.upgrade() {
                Some(pp) => pp.handle_read_ack(header, body),
                None => Status::Ok,
            }
        });
        let weak = self.weak_self.clone();
        am_iface.set_am_handler(CLOSE_MESSAGE, flags, move |header, body| {
            match weak.upgrade() {
                Some(pp) => pp.handle_close(header, body),
                None => Status::Ok,
            }
        });
    }

    /// The local locality, for bootstrap exchange.
    pub fn here(&self) -> &Locality {
        self.context.here()
    }

    /// The transport context.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Ranking of this transport against others.
    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    /// Number of live receivers.
    pub fn num_receivers(&self) -> usize {
        self.receivers.lock().unwrap().len()
    }

    /// Stop background progress; in-flight transfers are expected to have
    /// drained.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Host scheduler hook: one progress iteration unless stopped. Always
    /// reports that no high-priority work was pending.
    pub fn background_work(&self, _num_thread: usize) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.context.progress();
        false
    }

    fn alloc_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Establish a connection to `there` and wait, cooperatively, until the
    /// peer acknowledges it.
    pub fn create_connection(&self, there: &Locality) -> Result<Arc<Sender>> {
        let connects_to_ep = self
            .context
            .rma_attr()
            .caps
            .contains(CapFlags::CONNECT_TO_EP);

        let ticket = self.alloc_ticket();
        let sender = Sender::new(there.clone(), self.context.clone(), connects_to_ep, ticket)?;
        {
            let _guard = self.context.lock();
            self.senders.lock().unwrap().insert(ticket, sender.clone());
        }

        let rma_ep_addr_len = self.context.rma_attr().ep_addr_len;
        let here = self.context.here().clone();

        let mut k = 0;
        while !sender.connect(&here, rma_ep_addr_len)? {
            self.background_work(usize::MAX);
            yield_k(k);
            k += 1;
        }

        let mut k = 0;
        while sender.receive_handle() == 0 {
            self.background_work(usize::MAX);
            yield_k(k);
            k += 1;
        }

        Ok(sender)
    }

    fn sender(&self, ticket: u64) -> Option<Arc<Sender>> {
        self.senders.lock().unwrap().get(&ticket).cloned()
    }

    fn receiver(&self, ticket: u64) -> Option<Arc<Receiver>> {
        self.receivers.lock().unwrap().get(&ticket).cloned()
    }

    pub(crate) fn deliver(&self, buffer: ParcelBuffer) {
        (self.on_parcel)(buffer);
    }

    /// Connect message: build a receiver for the advertised header region,
    /// connect it in the flavour the RMA transport requires, acknowledge
    /// and track it.
    ///
    /// Body, parsed tail-first: the RMA address block, the peer's AM iface
    /// and device addresses, the packed key of the peer's header, the
    /// header's virtual address and the peer's sender handle.
    fn handle_connect(&self, _header: u64, body: &[u8]) -> Status {
        let rkey_len = self.context.pd_attr().rkey_packed_size;
        let am_attr = self.context.am_attr().clone();
        let rma_attr = self.context.rma_attr().clone();

        let mut idx = body.len();
        idx -= 8;
        let sender_handle = read_u64(body, idx);
        idx -= 8;
        let remote_header_addr = read_u64(body, idx);
        idx -= rkey_len;
        let packed_key = &body[idx..idx + rkey_len];
        idx -= am_attr.device_addr_len;
        let am_device_addr = &body[idx..idx + am_attr.device_addr_len];
        idx -= am_attr.iface_addr_len;
        let am_iface_addr = &body[idx..idx + am_attr.iface_addr_len];
        let rma_block = &body[..idx];

        let ticket = self.alloc_ticket();
        let receiver = match Receiver::new(
            &self.context,
            ticket,
            sender_handle,
            remote_header_addr,
            packed_key,
        ) {
            Ok(receiver) => receiver,
            Err(e) => panic!("handle_connect: {}", e),
        };

        let connects_to_ep = rma_attr.caps.contains(CapFlags::CONNECT_TO_EP);
        let connected = if connects_to_ep {
            let rma_device_addr = &rma_block[..rma_attr.device_addr_len];
            let rma_ep_addr = &rma_block
                [rma_attr.device_addr_len..rma_attr.device_addr_len + rma_attr.ep_addr_len];
            receiver.connect_ep(
                &self.context,
                am_iface_addr,
                am_device_addr,
                rma_device_addr,
                rma_ep_addr,
            )
        } else {
            let rma_iface_addr = &rma_block[..rma_attr.iface_addr_len];
            let rma_device_addr = &rma_block
                [rma_attr.iface_addr_len..rma_attr.iface_addr_len + rma_attr.device_addr_len];
            receiver.connect_iface(
                &self.context,
                am_iface_addr,
                am_device_addr,
                rma_iface_addr,
                rma_device_addr,
            )
        };
        if let Err(e) = connected {
            panic!("handle_connect: {}", e);
        }

        // Track before acknowledging so a prompt read notification already
        // resolves the ticket.
        {
            let _guard = self.context.lock();
            self.receivers.lock().unwrap().insert(ticket, receiver.clone());
        }

        let mut k = 0;
        loop {
            match receiver.send_connect_ack(connects_to_ep, rma_attr.ep_addr_len) {
                Ok(true) => break,
                Ok(false) => {
                    self.context.progress();
                    yield_k(k);
                    k += 1;
                }
                Err(e) => panic!("handle_connect: {}", e),
            }
        }

        Status::Ok
    }

    /// Connect acknowledgement: finish the RMA linkage when running
    /// endpoint-to-endpoint, then publish the receiver handle, which
    /// unblocks `create_connection`.
    fn handle_connect_ack(&self, header: u64, body: &[u8]) -> Status {
        let receive_handle = header;
        let sender_ticket = read_u64(body, 0);

        let sender = match self.sender(sender_ticket) {
            Some(sender) => sender,
            None => panic!("handle_connect_ack: unknown sender {}", sender_ticket),
        };

        let rma_attr = self.context.rma_attr();
        if rma_attr.caps.contains(CapFlags::CONNECT_TO_EP) {
            let ep_addr = &body[16..16 + rma_attr.ep_addr_len];
            if let Err(e) = sender.connect_rma_to_ep(ep_addr) {
                panic!("handle_connect_ack: {}", e);
            }
        }

        sender.set_receive_handle(receive_handle);
        Status::Ok
    }

    /// Read notification: start pulling the peer's header.
    fn handle_read(&self, header: u64, body: &[u8]) -> Status {
        let header_length = read_u64(body, 0);
        let receiver = match self.receiver(header) {
            Some(receiver) => receiver,
            None => panic!("handle_read: unknown receiver {}", header),
        };

        self.start_read(receiver, header_length);
        self.background_work(0);
        Status::Ok
    }

    /// Read acknowledgement: the peer pulled everything, complete the
    /// transfer on the sender.
    fn handle_read_ack(&self, header: u64, _body: &[u8]) -> Status {
        let sender = match self.sender(header) {
            Some(sender) => sender,
            None => panic!("handle_read_ack: unknown sender {}", header),
        };
        sender.done();
        Status::Ok
    }

    /// Close message: retire the receiver.
    fn handle_close(&self, header: u64, _body: &[u8]) -> Status {
        let removed = {
            let _guard = self.context.lock();
            self.receivers.lock().unwrap().remove(&header)
        };
        debug_assert!(removed.is_some());
        Status::Ok
    }

    fn start_read(&self, receiver: Arc<Receiver>, header_length: u64) {
        let completion = self.header_completion(receiver.clone());
        match receiver.read(header_length, completion) {
            Ok(false) => {}
            Ok(true) => self.header_done(receiver, Status::Ok),
            Err(e) => panic!("header get: {}", e),
        }
    }

    fn header_completion(&self, receiver: Arc<Receiver>) -> Completion {
        let weak = self.weak_self.clone();
        Box::new(move |status| {
            if let Some(pp) = weak.upgrade() {
                pp.header_done(receiver, status);
            }
        })
    }

    fn data_completion(&self, receiver: Arc<Receiver>) -> Completion {
        let weak = self.weak_self.clone();
        Box::new(move |status| {
            if let Some(pp) = weak.upgrade() {
                pp.data_done(receiver, status);
            }
        })
    }

    fn header_done(&self, receiver: Arc<Receiver>, status: Status) {
        if status != Status::Ok {
            panic!("header get completion: {}", status.as_str());
        }
        if receiver.read_header_done() {
            self.finish_read(&receiver);
        } else {
            let completion = self.data_completion(receiver.clone());
            match receiver.read_data(&self.context, completion) {
                Ok(false) => {}
                Ok(true) => self.data_done(receiver, Status::Ok),
                Err(e) => panic!("payload get: {}", e),
            }
        }
    }

    fn data_done(&self, receiver: Arc<Receiver>, status: Status) {
        if status != Status::Ok {
            panic!("payload get completion: {}", status.as_str());
        }
        self.finish_read(&receiver);
    }

    fn finish_read(&self, receiver: &Arc<Receiver>) {
        let mut k = 0;
        loop {
            match receiver.read_done(|buffer| self.deliver(buffer)) {
                Ok(true) => break,
                Ok(false) => {
                    self.context.progress();
                    yield_k(k);
                    k += 1;
                }
                Err(e) => panic!("read ack: {}", e),
            }
        }
    }
}

impl Drop for Parcelport {
    fn drop(&mut self) {
        // Drain whatever receivers the peers never closed.
        self.receivers.lock().unwrap().clear();
        self.senders.lock().unwrap().clear();
    }
}

fn read_u64(body: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&body[at..at + 8]);
    u64::from_ne_bytes(word)
}
