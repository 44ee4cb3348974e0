//! # Real-Time Scratch Memory
//!
//! Per-worker scratch buffers are allocated once, cache-line aligned, when a
//! worker is constructed. They are never resized on the task path.
//!
//! ## Example
//!
//! ```rust
//! use mimo_demul::rt::AlignedBuffer;
//! use mimo_demul::IQSample;
//!
//! let mut buf: AlignedBuffer<IQSample> = AlignedBuffer::new(64).unwrap();
//! buf.as_mut_slice()[0] = IQSample::new(1.0, -1.0);
//! assert_eq!(buf.as_ptr() as usize % mimo_demul::rt::CACHE_LINE_SIZE, 0);
//! ```

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;

use crate::error::{DemulError, DemulResult};

/// Cache line size for alignment (64 bytes on most x86/ARM platforms).
pub const CACHE_LINE_SIZE: usize = 64;

/// Align a value up to the nearest multiple of alignment.
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Cache-line aligned, zero-initialised buffer of plain-data elements.
///
/// On Linux the pages are memory-locked with `mlock()` when the process is
/// allowed to, so the real-time path never takes a page fault on scratch.
/// `T` must be valid when all-zero (floats, integers and complex numbers).
#[derive(Debug)]
pub struct AlignedBuffer<T: Copy> {
    ptr: *mut T,
    len: usize,
    layout: Layout,
    locked: bool,
    _marker: PhantomData<T>,
}

impl<T: Copy> AlignedBuffer<T> {
    /// Allocate a new buffer of `len` elements.
    ///
    /// Returns `None` for an empty request or if the allocator fails.
    pub fn new(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }

        let size = align_up(len.checked_mul(std::mem::size_of::<T>())?, CACHE_LINE_SIZE);
        let layout = Layout::from_size_align(size, CACHE_LINE_SIZE).ok()?;

        let ptr = unsafe { alloc_zeroed(layout) as *mut T };
        if ptr.is_null() {
            return None;
        }

        let locked = Self::try_mlock(ptr, size);

        Some(Self {
            ptr,
            len,
            layout,
            locked,
            _marker: PhantomData,
        })
    }

    /// Allocate, mapping failure to a startup error tagged with `what`.
    pub fn try_new(what: &'static str, len: usize) -> DemulResult<Self> {
        Self::new(len).ok_or(DemulError::AllocationFailed { what, len })
    }

    /// Check if memory is locked.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Get buffer length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    #[cfg(target_os = "linux")]
    fn try_mlock(ptr: *mut T, size: usize) -> bool {
        unsafe { libc::mlock(ptr as *const libc::c_void, size) == 0 }
    }

    #[cfg(not(target_os = "linux"))]
    fn try_mlock(_ptr: *mut T, _size: usize) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    fn try_munlock(ptr: *mut T, size: usize) {
        unsafe {
            libc::munlock(ptr as *const libc::c_void, size);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn try_munlock(_ptr: *mut T, _size: usize) {}
}

impl<T: Copy> Drop for AlignedBuffer<T> {
    fn drop(&mut self) {
        if self.locked {
            Self::try_munlock(self.ptr, self.layout.size());
        }
        unsafe {
            dealloc(self.ptr as *mut u8, self.layout);
        }
    }
}

// The buffer owns its allocation exclusively.
unsafe impl<T: Copy + Send> Send for AlignedBuffer<T> {}
unsafe impl<T: Copy + Sync> Sync for AlignedBuffer<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IQSample;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_aligned_buffer_zeroed_and_aligned() {
        let buf: AlignedBuffer<IQSample> = AlignedBuffer::new(24).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(buf.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        assert!(buf.as_slice().iter().all(|s| s.re == 0.0 && s.im == 0.0));
    }

    #[test]
    fn test_aligned_buffer_access() {
        let mut buf: AlignedBuffer<i8> = AlignedBuffer::new(100).unwrap();
        buf.as_mut_slice()[0] = -42;
        buf.as_mut_slice()[99] = 99;
        assert_eq!(buf.as_slice()[0], -42);
        assert_eq!(buf.as_slice()[99], 99);
    }

    #[test]
    fn test_empty_request_is_resource_error() {
        assert!(AlignedBuffer::<f32>::new(0).is_none());
        let err = AlignedBuffer::<f32>::try_new("scratch", 0).unwrap_err();
        assert!(err.is_resource_fatal());
    }
}
