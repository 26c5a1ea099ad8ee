//! Best-fit heap allocator over a growable arena, with zero bookkeeping
//! overhead: every free region is indexed by two intrusive AVL trees
//! whose nodes live inside the region's own bytes. One tree is keyed by
//! size and answers best-fit queries, the other is keyed by address and
//! finds the neighbours to coalesce with, both in O(log n).
//!
//! The pieces, bottom up:
//!
//! - [`crate::tree`] is the balanced tree working purely on caller-owned
//!   nodes (it cannot allocate: the thing built on top of it is the
//!   allocator).
//! - [`crate::header`] squeezes two tree nodes plus the region length
//!   into the first bytes of each free region.
//! - [`crate::index`] keeps the size view and the address view of the
//!   free set in lockstep.
//! - [`Heap`] drives it all: rounding, best-fit, split, coalesce and
//!   growing through a pluggable [`Backing`] provider, serialized by a
//!   pluggable [`Lock`].
//! - [`Set`] is a standalone ordered container over the same tree core.
//!
//! ```
//! use avalloc::{Heap, Mmap};
//!
//! let heap: Heap<Mmap> = Heap::new(Mmap);
//!
//! let mut size = 48;
//! let address = heap.alloc(&mut size).unwrap();
//! unsafe { heap.free(address, size) };
//! ```

use std::ptr::NonNull;

mod header;
mod heap;
mod index;
mod lock;
mod node;
mod platform;
mod set;
mod tree;

/// Non-null pointer to `T`, or the null sentinel. Spelled as an `Option`
/// so the compiler insists on handling the `None` case everywhere.
pub type Pointer<T> = Option<NonNull<T>>;

pub use header::{ALIGNMENT, MIN_REGION_SIZE};
pub use heap::Heap;
pub use lock::{Lock, SingleThreadedLock, SpinLock};
pub use platform::{Backing, Mmap};
pub use set::{Cursor, CursorMut, Iter, Set};
