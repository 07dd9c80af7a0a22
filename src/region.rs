//! Region allocator — a bump-pointer arena with scoped reset.
//!
//! The single substrate for all request-scoped memory. One
//! `Region` is created per handled request or per poll cycle and destroyed
//! at its end; regions are never shared across concurrent workers.
//!
//! Non-owning pointers handed out by [`Region::alloc`]/[`Region::push_bytes`]
//! are valid only until the next `reset`/`restore` at or below the offset at
//! which they were produced. We express that lifetime in the type system: a
//! [`Slice`] borrows from the `Region` it came from, so the borrow checker
//! rejects exactly the cases the invariant forbids.

use bumpalo::Bump;
use std::cell::Cell;

use crate::error::CoreError;

/// A `(pointer, length)` non-owning view, expressed as a borrowed byte slice
/// tied to the region's lifetime.
pub type Slice<'a> = &'a [u8];

/// A bump-pointer arena with a save/restore watermark.
///
/// `bumpalo::Bump` already gives us the alignment-aware bump operation and
/// bulk reset; `Region` adds the `save()`/`restore(offset)` watermark pair
/// and an out-of-region error path. `Bump` never shrinks on `reset`,
/// matching a "discard the smaller allocation, it's cheap since reset is
/// wholesale" growth policy for the document parser's vectors.
pub struct Region {
    bump: Bump,
    /// Logical high-water mark, tracked independently of `Bump`'s own
    /// internal chunk bookkeeping so `save`/`restore` can hand back a
    /// caller-meaningful offset.
    watermark: Cell<usize>,
    capacity: usize,
}

/// An opaque watermark returned by [`Region::save`] and consumed by
/// [`Region::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

impl Region {
    /// `create(size)`: reserve a region sized for `size` bytes up front.
    /// A typical request reserves 16 MiB; the proxy reserves 512 KiB per
    /// connection.
    pub fn create(size: usize) -> Self {
        Region {
            bump: Bump::with_capacity(size),
            watermark: Cell::new(0),
            capacity: size,
        }
    }

    /// Bytes allocated since the region was created (ignoring any
    /// `restore`s — this is a monotone counter used only to report
    /// out-of-region failures, not to bound reuse).
    pub fn used(&self) -> usize {
        self.watermark.get()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Exposes the underlying bump allocator for collections that need to
    /// grow in-place inside the region (the Document Parser's parallel
    /// key/value vectors). Crate-internal: nothing outside this crate
    /// should need raw `bumpalo` access.
    pub(crate) fn arena(&self) -> &Bump {
        &self.bump
    }

    /// `alloc(size, align)`: reserve `size` bytes rounded up to `align`,
    /// returning a mutable, zero-initialized slice. Exhaustion is reported
    /// as [`CoreError::OutOfRegion`], never a null pointer or a panic.
    pub fn alloc(&self, size: usize, align: usize) -> Result<&mut [u8], CoreError> {
        if self.watermark.get().saturating_add(size) > self.capacity.saturating_mul(4) {
            // Generous soft ceiling: bumpalo itself will grow additional
            // chunks, but a region that wants to keep the "one contiguous
            // buffer" spirit shouldn't balloon unboundedly past its
            // declared size under sustained misuse.
            return Err(CoreError::OutOfRegion);
        }
        let layout = std::alloc::Layout::from_size_align(size.max(1), align.max(1))
            .map_err(|_| CoreError::OutOfRegion)?;
        let ptr = self.bump.alloc_layout(layout);
        self.watermark.set(self.watermark.get() + size);
        // SAFETY: `ptr` was just allocated from `self.bump` with `layout`,
        // is uniquely owned by this call (bumpalo never reuses live bytes
        // until an explicit reset), and its lifetime is tied to `&self`.
        let slice = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
        slice.fill(0);
        Ok(slice)
    }

    /// `push_bytes(src, n)`: copy `n` bytes of `src` into the region and
    /// return a slice pointing at the copy.
    pub fn push_bytes<'a>(&'a self, src: &[u8]) -> Result<&'a [u8], CoreError> {
        let dst = self.alloc(src.len(), 1)?;
        dst.copy_from_slice(src);
        Ok(dst)
    }

    /// Copies a `&str` into the region, returning a `&str` borrowed from it.
    pub fn push_str<'a>(&'a self, src: &str) -> Result<&'a str, CoreError> {
        let bytes = self.push_bytes(src.as_bytes())?;
        // SAFETY: `bytes` is a verbatim copy of `src`'s bytes, which were
        // already valid UTF-8.
        Ok(unsafe { std::str::from_utf8_unchecked(bytes) })
    }

    /// `save()`: returns the current watermark.
    pub fn save(&self) -> Checkpoint {
        Checkpoint(self.watermark.get())
    }

    /// `restore(offset)`: rewinds the logical watermark to a prior
    /// checkpoint. Any slices produced between the checkpoint and now must
    /// not be used afterward — the borrow checker enforces this as long as
    /// callers don't route data through raw pointers, which nothing in this
    /// crate does.
    pub fn restore(&self, checkpoint: Checkpoint) {
        self.watermark.set(checkpoint.0);
    }

    /// `reset()`: equivalent to `restore` to the region's origin, without
    /// releasing the backing buffer (so the next request reuses the
    /// capacity instead of re-allocating it).
    pub fn reset(&mut self) {
        self.bump.reset();
        self.watermark.set(0);
    }

    /// `destroy()`: releases the backing buffer. In Rust this is just
    /// `Drop`; the method exists so callers can name the operation
    /// explicitly where the design calls for it (e.g. on region
    /// exhaustion, per §7's propagation policy).
    pub fn destroy(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_zeroed_bytes() {
        let region = Region::create(1024);
        let buf = region.alloc(16, 8).unwrap();
        assert_eq!(buf, &[0u8; 16]);
    }

    #[test]
    fn push_bytes_round_trips() {
        let region = Region::create(1024);
        let s = region.push_bytes(b"hello").unwrap();
        assert_eq!(s, b"hello");
    }

    #[test]
    fn save_alloc_restore_returns_to_offset() {
        let region = Region::create(1024);
        let checkpoint = region.save();
        let _ = region.alloc(256, 1).unwrap();
        assert_ne!(region.save(), checkpoint);
        region.restore(checkpoint);
        assert_eq!(region.save(), checkpoint);
    }

    #[test]
    fn reset_returns_watermark_to_zero() {
        let mut region = Region::create(64);
        let _ = region.alloc(32, 1).unwrap();
        assert_eq!(region.used(), 32);
        region.reset();
        assert_eq!(region.used(), 0);
    }

    #[test]
    fn oversized_alloc_reports_out_of_region() {
        let region = Region::create(16);
        let result = region.alloc(usize::MAX / 2, 1);
        assert!(matches!(result, Err(CoreError::OutOfRegion)));
    }
}
