//! Text marshaling across the runtime's linear memory.
//!
//! Input text is written as UTF-8 followed by a single NUL terminator, the
//! native string format of the hosted interpreter. Output text is read back by
//! explicit length and may itself contain NUL bytes.

use std::ops::{Deref, DerefMut, Range};

use tracing::warn;

use crate::{
    TRACE_TARGET_WORKER,
    error::{Error, Result},
};

/// Allocator and byte view of a runtime's addressable memory.
pub trait GuestMemory {
    /// Allocate `byte_length` bytes and return the guest address.
    ///
    /// # Errors
    /// Returns an error if the guest allocator fails.
    fn allocate(&mut self, byte_length: u32) -> Result<u32>;

    /// Release an address previously returned by [`GuestMemory::allocate`].
    ///
    /// # Errors
    /// Returns an error if the guest deallocator fails.
    fn release(&mut self, address: u32) -> Result<()>;

    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];
}

/// A marshaled text buffer inside guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextHandle {
    address: u32,
    capacity: u32,
}

impl TextHandle {
    #[must_use]
    pub const fn address(self) -> u32 {
        self.address
    }

    /// Allocated size in bytes, terminator included.
    #[must_use]
    pub const fn capacity(self) -> u32 {
        self.capacity
    }

    /// Encoded length of the text, terminator excluded.
    #[must_use]
    pub const fn len(self) -> u32 {
        self.capacity - 1
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }
}

fn guest_range(memory_len: usize, address: u32, length: u32) -> Result<Range<usize>> {
    let start = address as usize;
    start
        .checked_add(length as usize)
        .filter(|end| *end <= memory_len)
        .map(|end| start..end)
        .ok_or(Error::OutOfBounds { address, length })
}

fn encode_into(data: &mut [u8], address: u32, capacity: u32, encoded: &[u8]) -> Result<()> {
    let range = guest_range(data.len(), address, capacity)?;
    let buffer = &mut data[range];
    let (text, terminator) = buffer.split_at_mut(encoded.len());
    text.copy_from_slice(encoded);
    terminator[0] = 0;
    Ok(())
}

/// Copy `text` into a freshly allocated guest buffer.
///
/// The buffer is sized from the UTF-8 byte length plus one terminator byte,
/// so multi-byte characters are never truncated.
///
/// # Errors
/// Returns an error if the text is too large for a 32-bit guest, the guest
/// allocation fails, or the allocator returns an address outside memory.
pub fn write_text<M: GuestMemory + ?Sized>(memory: &mut M, text: &str) -> Result<TextHandle> {
    let encoded = text.as_bytes();
    let capacity = encoded
        .len()
        .checked_add(1)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(Error::TooLarge(encoded.len()))?;

    let address = memory.allocate(capacity)?;
    if let Err(err) = encode_into(memory.data_mut(), address, capacity, encoded) {
        if let Err(release_err) = memory.release(address) {
            warn!(target: TRACE_TARGET_WORKER, %release_err, address, "failed to release text buffer");
        }
        return Err(err);
    }

    Ok(TextHandle { address, capacity })
}

/// Release a buffer returned by [`write_text`].
///
/// # Errors
/// Returns an error if the guest deallocator fails.
pub fn release_text<M: GuestMemory + ?Sized>(memory: &mut M, handle: TextHandle) -> Result<()> {
    memory.release(handle.address)
}

/// Decode exactly `length` bytes at `address`.
///
/// Embedded NUL bytes are kept as data. Invalid UTF-8 sequences are replaced
/// with U+FFFD rather than failing the whole output.
///
/// # Errors
/// Returns [`Error::OutOfBounds`] if the range is outside `data`.
pub fn read_text(data: &[u8], address: u32, length: u32) -> Result<String> {
    let range = guest_range(data.len(), address, length)?;
    Ok(String::from_utf8_lossy(&data[range]).into_owned())
}

/// Guard that releases a marshaled text buffer when dropped.
///
/// Derefs to the underlying memory so the owner can keep driving the runtime
/// while the buffer is live.
pub struct ScopedText<'a, M: GuestMemory + ?Sized> {
    memory: &'a mut M,
    handle: TextHandle,
    armed: bool,
}

impl<'a, M: GuestMemory + ?Sized> ScopedText<'a, M> {
    /// # Errors
    /// See [`write_text`].
    pub fn write(memory: &'a mut M, text: &str) -> Result<Self> {
        let handle = write_text(memory, text)?;
        Ok(Self {
            memory,
            handle,
            armed: true,
        })
    }

    #[must_use]
    pub const fn handle(&self) -> TextHandle {
        self.handle
    }

    /// Drop the guard without releasing the buffer.
    ///
    /// Used when the runtime is being torn down and its memory is reclaimed
    /// wholesale.
    pub fn abandon(mut self) {
        self.armed = false;
    }
}

impl<M: GuestMemory + ?Sized> Drop for ScopedText<'_, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = release_text(&mut *self.memory, self.handle) {
            warn!(
                target: TRACE_TARGET_WORKER,
                %err,
                address = self.handle.address,
                "failed to release text buffer"
            );
        }
    }
}

impl<M: GuestMemory + ?Sized> Deref for ScopedText<'_, M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        self.memory
    }
}

impl<M: GuestMemory + ?Sized> DerefMut for ScopedText<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bump allocator over a fixed heap that records every release.
    struct Heap {
        bytes: Vec<u8>,
        next: u32,
        released: Vec<u32>,
    }

    impl Heap {
        fn new(size: usize) -> Self {
            Self {
                bytes: vec![0xAA; size],
                next: 8,
                released: Vec::new(),
            }
        }
    }

    impl GuestMemory for Heap {
        fn allocate(&mut self, byte_length: u32) -> Result<u32> {
            let address = self.next;
            self.next += byte_length;
            Ok(address)
        }

        fn release(&mut self, address: u32) -> Result<()> {
            self.released.push(address);
            Ok(())
        }

        fn data(&self) -> &[u8] {
            &self.bytes
        }

        fn data_mut(&mut self) -> &mut [u8] {
            &mut self.bytes
        }
    }

    #[test]
    fn buffer_is_sized_by_encoded_length() {
        let mut heap = Heap::new(64);
        let text = "héllo → wörld";
        let handle = write_text(&mut heap, text).expect("write");

        assert_eq!(handle.len() as usize, text.len());
        assert!(handle.len() as usize > text.chars().count());
        assert_eq!(handle.capacity(), handle.len() + 1);

        let start = handle.address() as usize;
        let end = start + text.len();
        assert_eq!(&heap.bytes[start..end], text.as_bytes());
        assert_eq!(heap.bytes[end], 0, "missing terminator");
    }

    #[test]
    fn read_text_keeps_embedded_terminators() {
        let mut heap = Heap::new(64);
        let text = "a\0b\0";
        let handle = write_text(&mut heap, text).expect("write");

        let decoded = read_text(heap.data(), handle.address(), handle.len()).expect("read");
        assert_eq!(decoded, text);
    }

    #[test]
    fn read_text_replaces_invalid_utf8() {
        let data = [b'o', b'k', 0xFF, b'!'];
        assert_eq!(read_text(&data, 0, 4).expect("read"), "ok\u{FFFD}!");
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let data = [0u8; 16];
        assert!(matches!(
            read_text(&data, 10, 7),
            Err(Error::OutOfBounds {
                address: 10,
                length: 7
            })
        ));
        assert!(matches!(
            read_text(&data, u32::MAX, 2),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn failed_encode_releases_allocation() {
        let mut heap = Heap::new(4);
        let err = write_text(&mut heap, "too long").expect_err("should not fit");
        assert!(matches!(err, Error::OutOfBounds { .. }));
        assert_eq!(heap.released, vec![8]);
    }

    #[test]
    fn scoped_text_releases_once_on_drop() {
        let mut heap = Heap::new(64);
        let address = {
            let scoped = ScopedText::write(&mut heap, "print 1;").expect("write");
            scoped.handle().address()
        };
        assert_eq!(heap.released, vec![address]);
    }

    #[test]
    fn abandoned_scoped_text_is_not_released() {
        let mut heap = Heap::new(64);
        let scoped = ScopedText::write(&mut heap, "spin").expect("write");
        scoped.abandon();
        assert!(heap.released.is_empty());
    }

    #[test]
    fn empty_text_still_gets_a_terminator() {
        let mut heap = Heap::new(16);
        let handle = write_text(&mut heap, "").expect("write");
        assert!(handle.is_empty());
        assert_eq!(handle.capacity(), 1);
        assert_eq!(heap.bytes[handle.address() as usize], 0);
    }
}
