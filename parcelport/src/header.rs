//! The per-transfer wire header.
//!
//! A fixed-size scratch region, registered with the protection domain for
//! its whole lifetime so the peer can pull it with a one-sided GET. Layout
//! (native-endian 64-bit words unless noted):
//!
//! ```text
//! offset  0  u64  logical payload size
//! offset  8  u64  payload byte count
//! offset 16  u64  number of zero-copy chunks
//! offset 24  u64  number of non-zero-copy chunks
//! offset 32  u8   piggy-back flag
//! offset 33  ...  flag=1: payload bytes inline
//!                 flag=0: u64 remote payload address, then packed remote key
//! ```

use fabric::md::{Md, MemFlags, MemoryRegion};
use fabric::Status;

use crate::buffer::ParcelBuffer;

/// Size of the header scratch region.
pub const HEADER_MAX_SIZE: usize = 512;

const POS_SIZE: usize = 0;
const POS_NUMBYTES: usize = 8;
const POS_NUMCHUNKS_FIRST: usize = 16;
const POS_NUMCHUNKS_SECOND: usize = 24;
const POS_PIGGY_BACK_FLAG: usize = 32;

/// Offset of the inline payload, and of the remote address/key pair when the
/// payload does not fit inline.
pub const POS_PIGGY_BACK_DATA: usize = 33;

/// The pinned per-transfer header region.
pub struct Header {
    max_size: usize,
    size: usize,
    data: Box<[u8]>,
    mem: MemoryRegion,
    rkey: Vec<u8>,
}

impl Header {
    /// Allocate and register a header region with `pd` and pack its remote
    /// key. `rkey_packed_size` comes from the domain attributes.
    pub fn new(pd: &Md, max_size: usize, rkey_packed_size: usize) -> Result<Header, Status> {
        // The no-piggy-back tail needs room for the remote address and key.
        if max_size < POS_PIGGY_BACK_DATA + 8 + rkey_packed_size {
            return Err(Status::InvalidParam);
        }
        let mut data = vec![0u8; max_size].into_boxed_slice();
        // Safety: `data` is heap-allocated and owned by the header; the
        // region is dropped before the allocation in `Drop` order.
        let mem = unsafe { pd.register(data.as_mut_ptr(), max_size, MemFlags::NONBLOCK)? };
        let mut rkey = vec![0u8; rkey_packed_size];
        mem.pack_rkey(&mut rkey);
        Ok(Header {
            max_size,
            size: 0,
            data,
            mem,
            rkey,
        })
    }

    /// Fill the header for an outgoing transfer. Inlines the payload when it
    /// fits; otherwise leaves the tail for the remote address/key pair,
    /// which the sender fills once the payload is registered.
    pub fn reset_from(&mut self, buffer: &ParcelBuffer) {
        self.set_u64(POS_SIZE, buffer.size);
        self.set_u64(POS_NUMBYTES, buffer.data_size());
        self.set_u64(POS_NUMCHUNKS_FIRST, buffer.num_chunks.0);
        self.set_u64(POS_NUMCHUNKS_SECOND, buffer.num_chunks.1);

        if buffer.data.len() <= self.max_size - POS_PIGGY_BACK_DATA {
            self.data[POS_PIGGY_BACK_FLAG] = 1;
            self.data[POS_PIGGY_BACK_DATA..POS_PIGGY_BACK_DATA + buffer.data.len()]
                .copy_from_slice(&buffer.data);
            self.size = POS_PIGGY_BACK_DATA + buffer.data.len();
        } else {
            self.data[POS_PIGGY_BACK_FLAG] = 0;
            self.size = POS_PIGGY_BACK_DATA + 8 + self.rkey.len();
        }
    }

    /// Set the logical length only; used by the receiver before pulling the
    /// peer's header bytes over this region.
    pub fn reset_length(&mut self, size: usize) {
        self.size = size.min(self.max_size);
    }

    /// Current logical length.
    pub fn length(&self) -> usize {
        self.size
    }

    /// Local virtual address of the region, for GET descriptors and for
    /// advertising to the peer.
    pub fn data_addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    /// Local key of the region's registration.
    pub fn lkey(&self) -> u64 {
        self.mem.lkey()
    }

    /// The packed remote key of this region, published at connect time.
    pub fn packed_rkey(&self) -> &[u8] {
        &self.rkey
    }

    /// Logical payload size field.
    pub fn size(&self) -> u64 {
        self.get_u64(POS_SIZE)
    }

    /// Payload byte count field.
    pub fn numbytes(&self) -> u64 {
        self.get_u64(POS_NUMBYTES)
    }

    /// Zero-copy and non-zero-copy chunk counts.
    pub fn num_chunks(&self) -> (u64, u64) {
        (
            self.get_u64(POS_NUMCHUNKS_FIRST),
            self.get_u64(POS_NUMCHUNKS_SECOND),
        )
    }

    /// The inline payload region, present when the piggy-back flag is set.
    pub fn piggy_back(&self) -> Option<&[u8]> {
        if self.data[POS_PIGGY_BACK_FLAG] != 0 {
            Some(&self.data[POS_PIGGY_BACK_DATA..])
        } else {
            None
        }
    }

    /// Write the remote payload address and packed key into the tail slots.
    /// Only meaningful after a no-piggy-back [`Header::reset_from`].
    pub fn set_remote_payload(&mut self, addr: u64, packed_key: &[u8]) {
        debug_assert_eq!(self.data[POS_PIGGY_BACK_FLAG], 0);
        let at = self.size - 8 - self.rkey.len();
        self.data[at..at + 8].copy_from_slice(&addr.to_ne_bytes());
        self.data[at + 8..at + 8 + packed_key.len()].copy_from_slice(packed_key);
    }

    /// Parse the remote payload address and packed key out of the tail.
    pub fn remote_payload(&self, key_len: usize) -> (u64, &[u8]) {
        let at = self.size - 8 - key_len;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.data[at..at + 8]);
        (u64::from_ne_bytes(word), &self.data[at + 8..at + 8 + key_len])
    }

    fn set_u64(&mut self, pos: usize, value: u64) {
        self.data[pos..pos + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn get_u64(&self, pos: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.data[pos..pos + 8]);
        u64::from_ne_bytes(word)
    }
}
