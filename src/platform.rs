use std::ptr::NonNull;

use crate::Pointer;

/// The page-granular provider the heap grows from. The heap only ever
/// asks for aligned byte runs and reports how much it got; it doesn't
/// care which kernel API hands them out.
///
/// # Safety
///
/// `alloc` must return a pointer aligned to `ALIGNMENT` that stays valid
/// for `size` bytes until passed to `free`. `ALIGNMENT` must be a power
/// of two and a multiple of [`crate::ALIGNMENT`]. If the implementing
/// type is `Sync`, `alloc` and `free` must tolerate concurrent calls.
pub unsafe trait Backing {
    /// Alignment of every returned pointer and every granted length.
    const ALIGNMENT: usize;

    /// Requests at least `size` bytes. The implementation may round the
    /// request up to its own granularity and reports the granted length
    /// back through `size`. Returns `None` when out of memory.
    ///
    /// # Safety
    ///
    /// Caller must not assume more than the granted `size` bytes are
    /// writable.
    unsafe fn alloc(&self, size: &mut usize) -> Pointer<u8>;

    /// Returns a run previously granted by [`Backing::alloc`]. The heap
    /// never calls this (it keeps its arena forever); it exists so
    /// backings compose with other consumers.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe exactly one previous grant.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// Abstraction for platform specific memory handling, so [`Mmap`] does
/// not care about the APIs offered by the underlying kernel.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can
    /// be written safely.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the kernel.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Page-granular [`Backing`] over anonymous memory mappings. Grants are
/// rounded up to whole pages; nothing else is tracked, so the type is a
/// ZST and trivially shareable.
pub struct Mmap;

unsafe impl Backing for Mmap {
    const ALIGNMENT: usize = 0x1000;

    unsafe fn alloc(&self, size: &mut usize) -> Pointer<u8> {
        *size = (*size + Self::ALIGNMENT - 1) & !(Self::ALIGNMENT - 1);
        Platform::request_memory(*size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        Platform::return_memory(ptr, size);
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-write, private, not backed by any file. See
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The region is still mapped and still valid; there is
                // nothing sensible to do about a failed unmap here.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Reserve and commit in one call. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE requires the base address of the original
            // reservation and a length of zero.
            let address = address.cast().as_ptr();
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address, 0, flags).as_bool() {
                // Same situation as a failed munmap, nothing to do.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI support, so mmap is mocked with the global
    //! allocator. This also lets Miri see arenas the heap never returns.

    use std::{alloc, ptr::NonNull};

    use super::{Backing, Mmap, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, Mmap::ALIGNMENT).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
