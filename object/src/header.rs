use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Bookkeeping flags stored atomically in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// The object must not be moved by any collection.
        const PINNED = 1 << 0;
    }
}

const HEADER_TAG: u8 = 0b11;
const KIND_MAX: u8 = (1 << 6) - 1;

/// The 8-byte header at the start of every heap object.
///
/// ```text
/// byte  0:    [tag:2 = 0b11] [kind:6]
/// byte  1:    flags (atomic) — Pinned
/// bytes 2‥3:  reserved (zero)
/// bytes 4‥7:  object size in words, header included (u32, little-endian)
/// ```
///
/// The `kind` bits are opaque to the collector; consumers assign them and
/// interpret them inside their trace function. The size field is written
/// once at allocation and never changes: liveness lives in the external
/// mark bitmaps, while sliding compaction needs every object to report its
/// own footprint.
///
/// On little-endian systems, reading these 8 bytes as a `u64` yields a
/// value whose low 2 bits are `0b11`, which [`Value::is_header`] detects.
///
/// [`Value::is_header`]: crate::Value::is_header
#[repr(C)]
pub struct Header {
    tag_and_kind: u8,
    flags: AtomicU8,
    _reserved: [u8; 2],
    size_words: u32,
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(kind: u8, size_words: u32) -> Self {
        debug_assert!(kind <= KIND_MAX, "kind does not fit in 6 bits: {kind}");
        debug_assert!(size_words >= 1, "object smaller than its header");
        Self {
            tag_and_kind: (kind << 2) | HEADER_TAG,
            flags: AtomicU8::new(0),
            _reserved: [0; 2],
            size_words,
        }
    }

    /// Consumer-assigned object kind (6 bits).
    #[inline(always)]
    pub fn kind(&self) -> u8 {
        self.tag_and_kind >> 2
    }

    /// Total object size in words, header included, forwarding word excluded.
    #[inline(always)]
    pub fn size_words(&self) -> u32 {
        self.size_words
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .field("size_words", &self.size_words)
            .finish()
    }
}

/// Read the size of the object at `obj` from its header, in words.
///
/// # Safety
///
/// `obj` must point to a valid heap object whose first 8 bytes are a
/// [`Header`].
#[inline(always)]
pub unsafe fn object_size(obj: *const u8) -> usize {
    // SAFETY: caller guarantees a valid header at `obj`.
    unsafe { (*(obj as *const Header)).size_words() as usize }
}
