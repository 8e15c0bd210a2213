//! Parcel buffers.
//!
//! The higher layer serializes parcels into one of these and hands it to a
//! sender; the receiver rebuilds one and passes it to the external decoder.
//! The transport treats the contents as opaque bytes plus chunk bookkeeping.

/// Descriptor for one chunk of a scattered transmission.
///
/// Reserved for the zero-copy chunk path; the chunk-count slots in the wire
/// header are already allocated for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionChunk {
    /// Offset of the chunk in the decoded stream.
    pub offset: u64,
    /// Length of the chunk in bytes.
    pub length: u64,
}

/// A serialized parcel as the transport moves it.
#[derive(Debug, Default)]
pub struct ParcelBuffer {
    /// Logical size advertised to the peer.
    pub size: u64,
    /// The serialized bytes.
    pub data: Vec<u8>,
    /// Numbers of zero-copy and non-zero-copy chunks.
    pub num_chunks: (u64, u64),
    /// Chunk descriptors for scattered transmissions.
    pub transmission_chunks: Vec<TransmissionChunk>,
}

impl ParcelBuffer {
    /// Wrap serialized bytes; the logical size is the byte count.
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            size: data.len() as u64,
            data,
            num_chunks: (0, 0),
            transmission_chunks: Vec::new(),
        }
    }

    /// Byte count of the serialized payload.
    pub fn data_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Release the payload and reset bookkeeping.
    pub fn clear(&mut self) {
        self.size = 0;
        self.data = Vec::new();
        self.num_chunks = (0, 0);
        self.transmission_chunks.clear();
    }
}
