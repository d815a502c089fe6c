// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EAGAIN EINTR

//! The [`Buffer`] type itself plus the peek/steal guard objects.

use std::{fmt,
          ops::Deref,
          os::fd::BorrowedFd,
          ptr::NonNull,
          slice,
          sync::{Arc, Mutex, MutexGuard,
                 atomic::{AtomicBool, Ordering}}};

use rustix::io::Errno;

use super::allocator::{BufferAllocator, HeapAllocator};
use crate::common::MutexExt;

/// How the payload bytes are to be interpreted.
///
/// The encoding is fixed at construction. UTF-16 buffers store little-endian code
/// units; [`Buffer::append_ascii`] widens each ASCII byte to one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEncoding {
    Utf8,
    Utf16,
    Binary,
}

impl BufferEncoding {
    /// Bytes per code unit (and per terminator).
    fn unit_size(self) -> usize {
        match self {
            BufferEncoding::Utf16 => 2,
            BufferEncoding::Utf8 | BufferEncoding::Binary => 1,
        }
    }
}

/// Reference-counted byte container with a publish ("lock") step.
///
/// Lifecycle: build the contents with [`append_ascii`] on one thread, then
/// [`lock`]. Once locked the bytes and length never change again (stealing the
/// allocation out empties the buffer but never mutates published bytes), so clones
/// can be read from any thread. Cloning shares the same storage; the allocator is
/// destroyed exactly once when the last clone (and any stolen allocation) drops.
///
/// Contract violations panic: appending to a locked buffer, peeking or stealing an
/// unlocked one, and peeking with the wrong encoding are bugs in the caller, not
/// runtime errors.
///
/// Text peeks guarantee a terminating zero unit directly past the end of the
/// contents, so embeddings that need zero-terminated strings can hand the storage
/// over without copying. See [`Utf16Peek::with_nul`], [`StolenUtf8`],
/// [`StolenUtf16`].
///
/// [`append_ascii`]: Self::append_ascii
/// [`lock`]: Self::lock
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    encoding: BufferEncoding,
    locked: AtomicBool,
    storage: Mutex<Storage>,
}

enum Storage {
    Owned(RawStorage),
    /// Borrowed bytes that are never freed. Only the UTF-8 static constructor
    /// produces this variant.
    Static(&'static str),
}

/// Allocator-managed region. `ptr` is `None` while empty (nothing appended yet, or
/// the allocation was stolen).
struct RawStorage {
    ptr: Option<NonNull<u8>>,
    len_bytes: usize,
    cap_bytes: usize,
    allocator: Arc<dyn BufferAllocator>,
}

// Safety: RawStorage exclusively owns its allocation; the raw pointer is never
// aliased outside the mutex that wraps the storage.
unsafe impl Send for RawStorage {}

impl RawStorage {
    fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self { ptr: None, len_bytes: 0, cap_bytes: 0, allocator }
    }

    fn bytes(&self) -> &[u8] {
        match self.ptr {
            None => &[],
            // Safety: ptr covers cap_bytes >= len_bytes initialized bytes.
            Some(p) => unsafe { slice::from_raw_parts(p.as_ptr(), self.len_bytes) },
        }
    }

    /// Grows so at least `additional` more bytes fit past the current length,
    /// returning the base pointer.
    fn reserve(&mut self, additional: usize) -> NonNull<u8> {
        let needed = self.len_bytes + additional;
        if needed > self.cap_bytes {
            let new_cap = needed.next_power_of_two().max(16);
            self.ptr = Some(match self.ptr {
                None => self.allocator.alloc(new_cap),
                // Safety: ptr came from this allocator with cap_bytes.
                Some(p) => unsafe { self.allocator.grow(p, self.cap_bytes, new_cap) },
            });
            self.cap_bytes = new_cap;
        }
        self.ptr.expect("reserve always leaves an allocation in place")
    }

    /// Appends raw bytes and refreshes the `unit`-sized zero terminator.
    fn push_bytes(&mut self, bytes: &[u8], unit: usize) {
        let base = self.reserve(bytes.len() + unit);
        // Safety: reserve made room for bytes.len() + unit past len_bytes.
        unsafe {
            let dst = base.as_ptr().add(self.len_bytes);
            dst.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            dst.add(bytes.len()).write_bytes(0, unit);
        }
        self.len_bytes += bytes.len();
    }

    /// Appends ASCII bytes widened to little-endian UTF-16 units, terminator
    /// included.
    fn push_ascii_widened(&mut self, bytes: &[u8]) {
        let base = self.reserve(bytes.len() * 2 + 2);
        // Safety: reserve made room for 2 * bytes.len() + 2 past len_bytes.
        unsafe {
            let dst = base.as_ptr().add(self.len_bytes);
            for (i, b) in bytes.iter().enumerate() {
                let unit = u16::from(*b).to_le_bytes();
                dst.add(i * 2).write(unit[0]);
                dst.add(i * 2 + 1).write(unit[1]);
            }
            dst.add(bytes.len() * 2).write_bytes(0, 2);
        }
        self.len_bytes += bytes.len() * 2;
    }

    /// Transfers the allocation out, leaving the storage empty.
    fn steal(&mut self) -> (Option<NonNull<u8>>, usize, usize) {
        let taken = (self.ptr.take(), self.len_bytes, self.cap_bytes);
        self.len_bytes = 0;
        self.cap_bytes = 0;
        taken
    }
}

impl Drop for RawStorage {
    fn drop(&mut self) {
        if let Some(p) = self.ptr {
            // Safety: we own the allocation; ptr came from this allocator with
            // cap_bytes.
            unsafe { self.allocator.dealloc(p, self.cap_bytes) }
        }
    }
}

impl Buffer {
    /// Creates an empty, unlocked buffer using `allocator` for storage.
    pub fn new(encoding: BufferEncoding, allocator: impl BufferAllocator) -> Self {
        Self::with_arc_allocator(encoding, Arc::new(allocator))
    }

    fn with_arc_allocator(encoding: BufferEncoding, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                encoding,
                locked: AtomicBool::new(false),
                storage: Mutex::new(Storage::Owned(RawStorage::new(allocator))),
            }),
        }
    }

    /// Creates an unlocked UTF-8 buffer holding a heap copy of `text`.
    pub fn new_copy_utf8(text: &str) -> Self {
        let buffer = Self::new(BufferEncoding::Utf8, HeapAllocator);
        {
            let mut st = buffer.inner.storage.lock_unpoisoned();
            let Storage::Owned(raw) = &mut *st else { unreachable!() };
            if !text.is_empty() {
                raw.push_bytes(text.as_bytes(), 1);
            }
        }
        buffer
    }

    /// Creates an already-locked UTF-8 buffer borrowing `text` with zero copies.
    ///
    /// The bytes are never freed by the buffer; dropping the last clone only
    /// releases the wrapper.
    #[must_use]
    pub fn new_static_utf8_locked(text: &'static str) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                encoding: BufferEncoding::Utf8,
                locked: AtomicBool::new(true),
                storage: Mutex::new(Storage::Static(text)),
            }),
        }
    }

    #[must_use]
    pub fn encoding(&self) -> BufferEncoding { self.inner.encoding }

    #[must_use]
    pub fn is_locked(&self) -> bool { self.inner.locked.load(Ordering::SeqCst) }

    /// Publishes the contents. Idempotent; after this the buffer is immutable.
    pub fn lock(&self) { self.inner.locked.store(true, Ordering::SeqCst); }

    /// Appends ASCII bytes, re-encoding to the buffer's encoding (each byte widens
    /// to one little-endian unit in a UTF-16 buffer). Zero-length appends are
    /// no-ops. Panics if the buffer is locked.
    pub fn append_ascii(&self, bytes: &[u8]) {
        assert!(!self.is_locked(), "append_ascii on a locked buffer");
        if bytes.is_empty() {
            return;
        }
        let mut st = self.inner.storage.lock_unpoisoned();
        let Storage::Owned(raw) = &mut *st else {
            unreachable!("static buffers are born locked")
        };
        match self.inner.encoding {
            BufferEncoding::Utf8 => {
                debug_assert!(bytes.is_ascii(), "append_ascii fed non-ASCII bytes");
                raw.push_bytes(bytes, 1);
            }
            BufferEncoding::Utf16 => {
                debug_assert!(bytes.is_ascii(), "append_ascii fed non-ASCII bytes");
                raw.push_ascii_widened(bytes);
            }
            BufferEncoding::Binary => raw.push_bytes(bytes, 1),
        }
    }

    /// Length in code units (bytes for UTF-8/binary, 16-bit units for UTF-16).
    #[must_use]
    pub fn len(&self) -> usize {
        let st = self.inner.storage.lock_unpoisoned();
        let byte_len = match &*st {
            Storage::Owned(raw) => raw.len_bytes,
            Storage::Static(s) => s.len(),
        };
        byte_len / self.inner.encoding.unit_size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// How many bytes a full [`write_to_fd`] drain would move. Requires locked.
    ///
    /// [`write_to_fd`]: Self::write_to_fd
    #[must_use]
    pub fn write_size(&self) -> usize {
        assert!(self.is_locked(), "write_size on an unlocked buffer");
        let st = self.inner.storage.lock_unpoisoned();
        match &*st {
            Storage::Owned(raw) => raw.len_bytes,
            Storage::Static(s) => s.len(),
        }
    }

    /// Borrows the contents as text. Requires locked and UTF-8.
    #[must_use]
    pub fn peek_utf8(&self) -> Utf8Peek<'_> {
        assert!(self.is_locked(), "peek_utf8 on an unlocked buffer");
        assert_eq!(self.inner.encoding, BufferEncoding::Utf8, "peek_utf8 on a non-UTF-8 buffer");
        Utf8Peek { guard: self.inner.storage.lock_unpoisoned() }
    }

    /// Borrows the contents as UTF-16 units. Requires locked and UTF-16.
    #[must_use]
    pub fn peek_utf16(&self) -> Utf16Peek<'_> {
        assert!(self.is_locked(), "peek_utf16 on an unlocked buffer");
        assert_eq!(self.inner.encoding, BufferEncoding::Utf16, "peek_utf16 on a non-UTF-16 buffer");
        Utf16Peek { guard: self.inner.storage.lock_unpoisoned() }
    }

    /// Transfers the allocation out as zero-terminated UTF-8. The buffer becomes
    /// empty; subsequent peeks return zero length. Requires locked (and an owned,
    /// non-static allocation).
    #[must_use]
    pub fn steal_utf8(&self) -> StolenUtf8 {
        assert!(self.is_locked(), "steal_utf8 on an unlocked buffer");
        assert_eq!(self.inner.encoding, BufferEncoding::Utf8, "steal_utf8 on a non-UTF-8 buffer");
        let mut st = self.inner.storage.lock_unpoisoned();
        let Storage::Owned(raw) = &mut *st else {
            panic!("cannot steal borrowed static storage")
        };
        let allocator = raw.allocator.clone();
        let (ptr, len_bytes, cap_bytes) = raw.steal();
        StolenUtf8 { ptr, len_bytes, cap_bytes, allocator }
    }

    /// Transfers the allocation out as zero-terminated UTF-16 units. The buffer
    /// becomes empty. Requires locked.
    #[must_use]
    pub fn steal_utf16(&self) -> StolenUtf16 {
        assert!(self.is_locked(), "steal_utf16 on an unlocked buffer");
        assert_eq!(self.inner.encoding, BufferEncoding::Utf16, "steal_utf16 on a non-UTF-16 buffer");
        let mut st = self.inner.storage.lock_unpoisoned();
        let Storage::Owned(raw) = &mut *st else {
            unreachable!("static buffers are always UTF-8")
        };
        let allocator = raw.allocator.clone();
        let (ptr, len_bytes, cap_bytes) = raw.steal();
        StolenUtf16 { ptr, len_units: len_bytes / 2, cap_bytes, allocator }
    }

    /// Writes the tail region of the locked contents to `fd`.
    ///
    /// `remaining` counts the bytes still to be written, starting at
    /// [`write_size`]; successful writes shrink it. `EAGAIN`/`EINTR` report
    /// success without progress so the caller can wait for writability and retry;
    /// any other errno is returned.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error for anything other than `EAGAIN`/`EINTR`.
    ///
    /// [`write_size`]: Self::write_size
    pub fn write_to_fd(&self, fd: BorrowedFd<'_>, remaining: &mut usize) -> std::io::Result<()> {
        assert!(self.is_locked(), "write_to_fd on an unlocked buffer");
        let st = self.inner.storage.lock_unpoisoned();
        let bytes = match &*st {
            Storage::Owned(raw) => raw.bytes(),
            Storage::Static(s) => s.as_bytes(),
        };
        assert!(*remaining <= bytes.len(), "remaining exceeds buffer contents");
        if *remaining == 0 {
            return Ok(());
        }
        let start = bytes.len() - *remaining;
        match rustix::io::write(fd, &bytes[start..]) {
            Ok(n) => {
                *remaining -= n;
                Ok(())
            }
            Err(e) if e == Errno::AGAIN || e == Errno::INTR => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("encoding", &self.inner.encoding)
            .field("locked", &self.is_locked())
            .field("len", &self.len())
            .finish()
    }
}

/// Borrow of a locked UTF-8 buffer's contents. Derefs to [`str`].
pub struct Utf8Peek<'a> {
    guard: MutexGuard<'a, Storage>,
}

impl Deref for Utf8Peek<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        match &*self.guard {
            Storage::Static(s) => s,
            // Safety: UTF-8 storage only ever holds bytes copied from &str plus
            // ASCII appends, so the region is valid UTF-8.
            Storage::Owned(raw) => unsafe { std::str::from_utf8_unchecked(raw.bytes()) },
        }
    }
}

impl fmt::Debug for Utf8Peek<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Borrow of a locked UTF-16 buffer's contents. Derefs to `[u16]`.
pub struct Utf16Peek<'a> {
    guard: MutexGuard<'a, Storage>,
}

const EMPTY_WITH_NUL_U16: &[u16] = &[0];

impl Utf16Peek<'_> {
    fn raw(&self) -> &RawStorage {
        match &*self.guard {
            Storage::Owned(raw) => raw,
            Storage::Static(_) => unreachable!("static buffers are always UTF-8"),
        }
    }

    /// The contents plus the guaranteed terminating zero unit.
    #[must_use]
    pub fn with_nul(&self) -> &[u16] {
        let raw = self.raw();
        match raw.ptr {
            None => EMPTY_WITH_NUL_U16,
            // Safety: appends keep a zero unit initialized at len_bytes, and the
            // base pointer is 2-aligned by the allocator contract.
            Some(p) => unsafe {
                slice::from_raw_parts(p.as_ptr().cast::<u16>(), raw.len_bytes / 2 + 1)
            },
        }
    }
}

impl Deref for Utf16Peek<'_> {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        let raw = self.raw();
        match raw.ptr {
            None => &[],
            // Safety: len_bytes is even for UTF-16 storage and the region is
            // initialized; base pointer is 2-aligned by the allocator contract.
            Some(p) => unsafe {
                slice::from_raw_parts(p.as_ptr().cast::<u16>(), raw.len_bytes / 2)
            },
        }
    }
}

impl fmt::Debug for Utf16Peek<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A zero-terminated UTF-8 allocation stolen out of a buffer. Frees through the
/// originating allocator on drop. Derefs to [`str`].
pub struct StolenUtf8 {
    ptr: Option<NonNull<u8>>,
    len_bytes: usize,
    cap_bytes: usize,
    allocator: Arc<dyn BufferAllocator>,
}

// Safety: the stolen allocation is exclusively owned by this guard.
unsafe impl Send for StolenUtf8 {}

const EMPTY_WITH_NUL_U8: &[u8] = &[0];

impl StolenUtf8 {
    /// The contents plus the terminating zero byte.
    #[must_use]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        match self.ptr {
            None => EMPTY_WITH_NUL_U8,
            // Safety: appends keep a zero byte initialized at len_bytes.
            Some(p) => unsafe { slice::from_raw_parts(p.as_ptr(), self.len_bytes + 1) },
        }
    }
}

impl Deref for StolenUtf8 {
    type Target = str;

    fn deref(&self) -> &str {
        match self.ptr {
            None => "",
            // Safety: same UTF-8 invariant as Utf8Peek.
            Some(p) => unsafe {
                std::str::from_utf8_unchecked(slice::from_raw_parts(p.as_ptr(), self.len_bytes))
            },
        }
    }
}

impl Drop for StolenUtf8 {
    fn drop(&mut self) {
        if let Some(p) = self.ptr {
            // Safety: we own the allocation; it came from this allocator with
            // cap_bytes.
            unsafe { self.allocator.dealloc(p, self.cap_bytes) }
        }
    }
}

impl fmt::Debug for StolenUtf8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A zero-terminated UTF-16 allocation stolen out of a buffer. Frees through the
/// originating allocator on drop. Derefs to `[u16]`.
pub struct StolenUtf16 {
    ptr: Option<NonNull<u8>>,
    len_units: usize,
    cap_bytes: usize,
    allocator: Arc<dyn BufferAllocator>,
}

// Safety: the stolen allocation is exclusively owned by this guard.
unsafe impl Send for StolenUtf16 {}

impl StolenUtf16 {
    /// The contents plus the terminating zero unit.
    #[must_use]
    pub fn as_slice_with_nul(&self) -> &[u16] {
        match self.ptr {
            None => EMPTY_WITH_NUL_U16,
            // Safety: appends keep a zero unit initialized past the contents.
            Some(p) => unsafe {
                slice::from_raw_parts(p.as_ptr().cast::<u16>(), self.len_units + 1)
            },
        }
    }
}

impl Deref for StolenUtf16 {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        match self.ptr {
            None => &[],
            // Safety: the region holds len_units initialized units, 2-aligned.
            Some(p) => unsafe {
                slice::from_raw_parts(p.as_ptr().cast::<u16>(), self.len_units)
            },
        }
    }
}

impl Drop for StolenUtf16 {
    fn drop(&mut self) {
        if let Some(p) = self.ptr {
            // Safety: we own the allocation; it came from this allocator with
            // cap_bytes.
            unsafe { self.allocator.dealloc(p, self.cap_bytes) }
        }
    }
}

impl fmt::Debug for StolenUtf16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{os::fd::AsFd, sync::atomic::AtomicUsize};

    const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    const ALPHABET_CHUNKS: &[&str] = &[
        "",
        "a",
        "",
        "b",
        "",
        "c",
        "defghijklmnopqrstuvwxyz",
        "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    ];

    /// Heap allocator that counts drops, so tests can observe the
    /// destroyed-exactly-once guarantee.
    #[derive(Debug)]
    struct CountingAllocator {
        drops: Arc<AtomicUsize>,
    }

    impl BufferAllocator for CountingAllocator {
        fn alloc(&self, size: usize) -> NonNull<u8> { HeapAllocator.alloc(size) }

        unsafe fn grow(&self, ptr: NonNull<u8>, old: usize, new: usize) -> NonNull<u8> {
            unsafe { HeapAllocator.grow(ptr, old, new) }
        }

        unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
            unsafe { HeapAllocator.dealloc(ptr, size) }
        }
    }

    impl Drop for CountingAllocator {
        fn drop(&mut self) { self.drops.fetch_add(1, Ordering::SeqCst); }
    }

    fn append_alphabet_in_chunks(buffer: &Buffer) {
        for chunk in ALPHABET_CHUNKS {
            buffer.append_ascii(chunk.as_bytes());
        }
    }

    #[test]
    fn utf16_append_ascii_widens_each_byte() {
        let buffer = Buffer::new(BufferEncoding::Utf16, HeapAllocator);
        append_alphabet_in_chunks(&buffer);
        buffer.lock();

        let peek = buffer.peek_utf16();
        assert_eq!(peek.len(), ALPHABET.len());
        assert_eq!(buffer.len(), ALPHABET.len());
        for (i, b) in ALPHABET.bytes().enumerate() {
            assert_eq!(peek[i], u16::from(b));
        }
        let with_nul = peek.with_nul();
        assert_eq!(with_nul.len(), ALPHABET.len() + 1);
        assert_eq!(with_nul[ALPHABET.len()], 0);
    }

    #[test]
    fn utf8_append_ascii_in_chunks() {
        let buffer = Buffer::new(BufferEncoding::Utf8, HeapAllocator);
        append_alphabet_in_chunks(&buffer);
        buffer.lock();
        assert_eq!(&*buffer.peek_utf8(), ALPHABET);
    }

    #[test]
    fn copy_utf8_accepts_further_appends() {
        let buffer = Buffer::new_copy_utf8("");
        assert!(!buffer.is_locked());
        append_alphabet_in_chunks(&buffer);
        buffer.lock();
        assert_eq!(&*buffer.peek_utf8(), ALPHABET);
    }

    #[test]
    fn utf16_steal_transfers_terminated_allocation() {
        let buffer = Buffer::new(BufferEncoding::Utf16, HeapAllocator);
        buffer.append_ascii(ALPHABET.as_bytes());
        buffer.lock();

        let stolen = buffer.steal_utf16();
        assert_eq!(stolen.len(), ALPHABET.len());
        assert_eq!(stolen.as_slice_with_nul()[ALPHABET.len()], 0);
        for (i, b) in ALPHABET.bytes().enumerate() {
            assert_eq!(stolen[i], u16::from(b));
        }

        // The buffer is empty afterwards; peeks observe zero length.
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.peek_utf16().len(), 0);
        assert_eq!(buffer.peek_utf16().with_nul(), &[0u16][..]);
    }

    #[test]
    fn utf8_steal_transfers_terminated_allocation() {
        let buffer = Buffer::new(BufferEncoding::Utf8, HeapAllocator);
        buffer.append_ascii(ALPHABET.as_bytes());
        buffer.lock();

        let stolen = buffer.steal_utf8();
        assert_eq!(&*stolen, ALPHABET);
        assert_eq!(*stolen.as_bytes_with_nul().last().unwrap(), 0);
        assert_eq!(buffer.len(), 0);
        assert_eq!(&*buffer.peek_utf8(), "");
    }

    #[test]
    fn static_utf8_is_born_locked_and_borrows() {
        let buffer = Buffer::new_static_utf8_locked(ALPHABET);
        assert!(buffer.is_locked());
        assert_eq!(buffer.len(), ALPHABET.len());
        assert_eq!(&*buffer.peek_utf8(), ALPHABET);
    }

    #[test]
    fn allocator_destroyed_exactly_once_on_last_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let buffer = Buffer::new(
            BufferEncoding::Utf8,
            CountingAllocator { drops: drops.clone() },
        );
        buffer.append_ascii(b"hello");
        buffer.lock();

        let clone = buffer.clone();
        drop(buffer);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stolen_allocation_keeps_allocator_alive() {
        let drops = Arc::new(AtomicUsize::new(0));
        let buffer = Buffer::new(
            BufferEncoding::Utf8,
            CountingAllocator { drops: drops.clone() },
        );
        buffer.append_ascii(b"payload");
        buffer.lock();

        let stolen = buffer.steal_utf8();
        drop(buffer);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(stolen);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_length_append_is_a_noop() {
        let buffer = Buffer::new(BufferEncoding::Utf16, HeapAllocator);
        buffer.append_ascii(b"");
        assert_eq!(buffer.len(), 0);
        buffer.lock();
        assert_eq!(buffer.peek_utf16().len(), 0);
    }

    #[test]
    #[should_panic(expected = "append_ascii on a locked buffer")]
    fn append_to_locked_buffer_panics() {
        let buffer = Buffer::new(BufferEncoding::Utf8, HeapAllocator);
        buffer.lock();
        buffer.append_ascii(b"too late");
    }

    #[test]
    #[should_panic(expected = "peek_utf8 on an unlocked buffer")]
    fn peek_before_lock_panics() {
        let buffer = Buffer::new(BufferEncoding::Utf8, HeapAllocator);
        let _peek = buffer.peek_utf8();
    }

    #[test]
    #[should_panic(expected = "peek_utf8 on a non-UTF-8 buffer")]
    fn binary_buffer_refuses_text_peek() {
        let buffer = Buffer::new(BufferEncoding::Binary, HeapAllocator);
        buffer.lock();
        let _peek = buffer.peek_utf8();
    }

    #[test]
    #[should_panic(expected = "cannot steal borrowed static storage")]
    fn steal_from_static_buffer_panics() {
        let buffer = Buffer::new_static_utf8_locked("abc");
        let _stolen = buffer.steal_utf8();
    }

    #[test]
    fn write_to_fd_drains_and_reports_progress() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        rustix::io::ioctl_fionbio(&write_end, true).unwrap();

        let buffer = Buffer::new_copy_utf8("hello");
        buffer.lock();
        let mut remaining = buffer.write_size();
        buffer.write_to_fd(write_end.as_fd(), &mut remaining).unwrap();
        assert_eq!(remaining, 0);

        let mut out = [0u8; 16];
        let n = rustix::io::read(&read_end, &mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
    }

    #[test]
    fn write_to_fd_survives_full_pipe() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        rustix::io::ioctl_fionbio(&write_end, true).unwrap();

        // Large enough to overrun any default pipe capacity.
        let buffer = Buffer::new(BufferEncoding::Binary, HeapAllocator);
        let chunk = [b'x'; 4096];
        for _ in 0..192 {
            buffer.append_ascii(&chunk);
        }
        buffer.lock();

        let total = buffer.write_size();
        let mut remaining = total;
        // Fill the pipe. EAGAIN must read as success with no progress.
        loop {
            let before = remaining;
            buffer.write_to_fd(write_end.as_fd(), &mut remaining).unwrap();
            if remaining == before {
                break;
            }
        }
        assert!(remaining > 0, "pipe never filled; test is not exercising EAGAIN");

        // Drain the reader and finish the write.
        let mut sink = [0u8; 8192];
        let mut read_total = 0;
        while remaining > 0 {
            let n = rustix::io::read(&read_end, &mut sink).unwrap();
            read_total += n;
            buffer.write_to_fd(write_end.as_fd(), &mut remaining).unwrap();
        }
        while read_total < total {
            let n = rustix::io::read(&read_end, &mut sink).unwrap();
            read_total += n;
        }
        assert_eq!(read_total, total);
    }

    #[test]
    fn write_to_fd_reports_real_errors() {
        let fd = rustix::fs::open(
            "/dev/null",
            rustix::fs::OFlags::RDONLY,
            rustix::fs::Mode::empty(),
        )
        .unwrap();
        let buffer = Buffer::new_copy_utf8("doomed");
        buffer.lock();
        let mut remaining = buffer.write_size();
        let err = buffer.write_to_fd(fd.as_fd(), &mut remaining).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(rustix::io::Errno::BADF.raw_os_error()));
    }
}
