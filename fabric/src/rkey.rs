//! Remote key bundles.
//!
//! A peer ships the packed key blob produced by
//! [`crate::md::MemoryRegion::pack_rkey`]; unpacking it through
//! [`crate::md::Md::rkey_unpack`] yields a bundle that resolves remote
//! one-sided operations. A bundle must be released exactly once, which
//! `Drop` takes care of.

use std::sync::atomic::Ordering;

use crate::md::{Md, RKEY_FORMAT_TAG, RKEY_PACKED_SIZE};
use crate::registry::registry;
use crate::status::Status;

/// An unpacked remote key.
pub struct RkeyBundle {
    rkey: u64,
    md: Md,
}

impl RkeyBundle {
    /// The resolved remote key.
    pub fn rkey(&self) -> u64 {
        self.rkey
    }
}

impl std::fmt::Debug for RkeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RkeyBundle").field("rkey", &self.rkey).finish()
    }
}

impl Drop for RkeyBundle {
    fn drop(&mut self) {
        registry().live_bundles.fetch_sub(1, Ordering::Relaxed);
        self.md.0.live_bundles.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) fn unpack(md: &Md, blob: &[u8]) -> Result<RkeyBundle, Status> {
    if blob.len() < RKEY_PACKED_SIZE {
        return Err(Status::InvalidParam);
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&blob[8..16]);
    if u64::from_ne_bytes(word) != RKEY_FORMAT_TAG {
        return Err(Status::InvalidParam);
    }
    word.copy_from_slice(&blob[..8]);
    registry().live_bundles.fetch_add(1, Ordering::Relaxed);
    md.0.live_bundles.fetch_add(1, Ordering::Relaxed);
    Ok(RkeyBundle {
        rkey: u64::from_ne_bytes(word),
        md: md.clone(),
    })
}

#[cfg(test)]
mod tests {
    use crate::iface::{CapFlags, TransportSpec};
    use crate::md::{self, Md, MemFlags, RKEY_PACKED_SIZE};

    #[test]
    fn test_unpack_roundtrip_and_release() {
        md::register_domain(
            "test/rkey",
            &[TransportSpec {
                name: "lo".to_string(),
                caps: CapFlags::AM_SHORT,
            }],
        );
        let pd = Md::open("test/rkey").unwrap();
        let mut buf = vec![0u8; 32];
        let mr = unsafe { pd.register(buf.as_mut_ptr(), buf.len(), MemFlags::NONBLOCK) }.unwrap();

        let mut packed = [0u8; RKEY_PACKED_SIZE];
        mr.pack_rkey(&mut packed);

        assert_eq!(pd.live_rkey_bundles(), 0);
        let bundle = pd.rkey_unpack(&packed).unwrap();
        assert_eq!(bundle.rkey(), mr.rkey());
        assert_eq!(pd.live_rkey_bundles(), 1);
        drop(bundle);
        assert_eq!(pd.live_rkey_bundles(), 0);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        md::register_domain(
            "test/rkey-bad",
            &[TransportSpec {
                name: "lo".to_string(),
                caps: CapFlags::AM_SHORT,
            }],
        );
        let pd = Md::open("test/rkey-bad").unwrap();
        assert!(pd.rkey_unpack(&[0u8; 4]).is_err());
        assert!(pd.rkey_unpack(&[0xffu8; RKEY_PACKED_SIZE]).is_err());
    }
}
