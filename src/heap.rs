use std::ptr::NonNull;

use crate::{
    header::{Header, ALIGNMENT, ALIGN_MASK, MIN_REGION_SIZE},
    index::FreeIndex,
    lock::{Lock, Mutex, SpinLock},
    platform::Backing,
    Pointer,
};

/// Arena growth is requested this many times larger than the allocation
/// that triggered it, amortizing trips into the backing allocator.
const GROWTH_SHIFT: usize = 4;

/// Everything the heap mutates, bundled so one lock guards all of it.
struct State {
    index: FreeIndex,
    /// Bytes currently handed out to callers.
    used: usize,
    /// Bytes ever obtained from the backing allocator.
    total: usize,
}

/// Best-fit heap allocator over a growable arena.
///
/// Free space is indexed by the dual AVL trees of [`FreeIndex`], whose
/// nodes live inside the free regions themselves, so the heap needs no
/// storage beyond this struct. Allocation rounds the request up to a
/// multiple of [`ALIGNMENT`], takes the smallest free region that fits
/// and splits off the tail; freeing reconstitutes the region header and
/// merges with address-adjacent neighbours. When no region fits, the
/// arena grows by sixteen times the request through the [`Backing`]
/// provider.
///
/// All mutations serialize through one lock of the caller's choosing;
/// the only thing done without it is the call into the backing allocator,
/// which may block in the kernel.
///
/// The heap never returns memory to the backing allocator: once grown,
/// the arena stays.
///
/// # Examples
///
/// ```
/// use avalloc::{Heap, Mmap};
///
/// let heap: Heap<Mmap> = Heap::new(Mmap);
///
/// let mut size = 100;
/// let address = heap.alloc(&mut size).unwrap();
/// // The request was rounded up; `size` now holds the value that the
/// // paired `free` must be given.
/// assert!(size >= 100);
/// assert_eq!(address.as_ptr() as usize % avalloc::ALIGNMENT, 0);
///
/// unsafe { heap.free(address, size) };
/// assert_eq!(heap.used(), 0);
/// ```
pub struct Heap<B: Backing, L: Lock = SpinLock> {
    state: Mutex<State, L>,
    backing: B,
}

impl<B: Backing, L: Lock + Default> Heap<B, L> {
    /// Builds a heap over `backing` with a default-constructed lock.
    pub fn new(backing: B) -> Self {
        Self::with_lock(backing, L::default())
    }
}

impl<B: Backing, L: Lock> Heap<B, L> {
    /// Builds a heap over `backing`, serializing mutations through
    /// `lock`.
    pub fn with_lock(backing: B, lock: L) -> Self {
        assert!(
            B::ALIGNMENT % ALIGNMENT == 0,
            "backing alignment must be a multiple of {ALIGNMENT}"
        );
        Self {
            state: Mutex::new(
                State {
                    index: FreeIndex::new(),
                    used: 0,
                    total: 0,
                },
                lock,
            ),
            backing,
        }
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Bytes ever acquired from the backing allocator.
    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`].
    ///
    /// The request is rounded up to a multiple of [`ALIGNMENT`], floored
    /// at [`MIN_REGION_SIZE`], and may grow further when consuming a
    /// region whose tail is too small to stand alone. The effective size
    /// is reported back through `size`; that exact value must be passed
    /// to [`Heap::free`] later. Returns `None` once the backing
    /// allocator is exhausted.
    pub fn alloc(&self, size: &mut usize) -> Pointer<u8> {
        *size = align_size(*size);
        loop {
            let mut state = self.state.lock();
            let Some(found) = (unsafe { state.index.best_fit(*size) }) else {
                // Growing goes through the kernel and can block; the heap
                // lock must not be held across it.
                drop(state);
                if self.expand(*size << GROWTH_SHIFT) == 0 {
                    return None;
                }
                continue;
            };

            let region_size = unsafe { found.as_ref().size() };
            unsafe { state.index.erase(found) };

            if region_size - *size >= MIN_REGION_SIZE {
                // Carve off the tail as a fresh region. It came out of a
                // free region, so it cannot touch another free region and
                // needs no coalescing.
                unsafe {
                    let at = NonNull::new_unchecked(found.as_ptr().cast::<u8>().add(*size));
                    let remainder = Header::emplace(at, region_size - *size);
                    state.index.insert(remainder);
                }
            } else {
                *size = region_size;
            }

            state.used += *size;
            let address = Header::base_of(found);
            log::trace!("alloc {:#x} bytes at {:p}", *size, address.as_ptr());
            return Some(address);
        }
    }

    /// Returns a region to the heap and coalesces it with any
    /// address-adjacent free neighbours.
    ///
    /// Panics if `size` is below [`MIN_REGION_SIZE`] or `ptr` is not
    /// aligned to [`ALIGNMENT`]: both mean the pair cannot have come from
    /// [`Heap::alloc`] and the heap refuses to guess.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly an address returned by
    /// [`Heap::alloc`] on this heap and the effective size it reported,
    /// not freed since.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        if size < MIN_REGION_SIZE || ptr.as_ptr() as usize & ALIGN_MASK != 0 {
            panic!("invalid free: ptr {:p}, size {:#x}", ptr.as_ptr(), size);
        }
        log::trace!("free {:#x} bytes at {:p}", size, ptr.as_ptr());

        let mut state = self.state.lock();
        let region = Header::emplace(ptr, size);
        insert_free_region(&mut state.index, region);
        state.used -= size;
    }

    /// Grows the arena by at least `size` bytes. The backing allocator
    /// rounds the request up to its own granularity; the granted length
    /// is returned, or 0 when the backing fails or grants a run too
    /// short to hold a region header.
    pub fn expand(&self, mut size: usize) -> usize {
        let address = unsafe { self.backing.alloc(&mut size) };
        match address {
            Some(address) if size >= MIN_REGION_SIZE => {
                log::trace!("expand grants {:#x} bytes at {:p}", size, address.as_ptr());
                let mut state = self.state.lock();
                unsafe {
                    let region = Header::emplace(address, size);
                    insert_free_region(&mut state.index, region);
                }
                state.total += size;
                size
            }
            _ => 0,
        }
    }

    /// In-place reallocation is never attempted; callers are expected to
    /// allocate, copy and free. Always returns `None`.
    pub fn realloc(&self, _ptr: NonNull<u8>, _old_size: usize, _new_size: &mut usize) -> Pointer<u8> {
        None
    }
}

/// Rounds a request up to a multiple of [`ALIGNMENT`], floored at
/// [`MIN_REGION_SIZE`] so the region can later store its own header.
fn align_size(size: usize) -> usize {
    if size <= MIN_REGION_SIZE {
        return MIN_REGION_SIZE;
    }
    (size + ALIGN_MASK) & !ALIGN_MASK
}

/// Links `region` into the index, then merges it with its address
/// neighbours where they touch. At most two merges can happen: one with
/// the predecessor, one with the successor.
unsafe fn insert_free_region(index: &mut FreeIndex, mut region: NonNull<Header>) {
    index.insert(region);

    if let Some(prev) = index.addr_prev(region) {
        if merge_regions(index, prev, region) {
            region = prev;
        }
    }
    if let Some(next) = index.addr_next(region) {
        merge_regions(index, region, next);
    }
}

/// Merges `extra` into `base` if `base` ends exactly where `extra`
/// begins. A predecessor reaching past the start of its successor means
/// the region set no longer describes disjoint memory, which is beyond
/// repair.
unsafe fn merge_regions(index: &mut FreeIndex, base: NonNull<Header>, extra: NonNull<Header>) -> bool {
    let base_end = base.as_ptr() as usize + base.as_ref().size();
    let extra_base = extra.as_ptr() as usize;
    if base_end > extra_base {
        panic!(
            "heap corruption: region {:p} + {:#x} overlaps region {:p}",
            base.as_ptr(),
            base.as_ref().size(),
            extra.as_ptr(),
        );
    }
    if base_end < extra_base {
        return false;
    }

    let merged_size = base.as_ref().size() + extra.as_ref().size();
    index.erase(base);
    index.erase(extra);
    let region = Header::emplace(Header::base_of(base), merged_size);
    index.insert(region);
    log::trace!(
        "coalesced {:p} and {:p} into {:#x} bytes",
        base.as_ptr(),
        extra.as_ptr(),
        merged_size
    );
    true
}
