use std::{cmp::Ordering, ptr::NonNull};

use crate::{
    header::{HalfSize, Header},
    node::Node,
    tree::{NodeOrder, Tree},
    Pointer,
};

/// Orders size-tree nodes by the full region length, reassembled from
/// both header halves. Ties are common here (lots of regions share a
/// size) and are fine: the tree flattens equal-key clusters on insert.
pub(crate) struct BySize;

impl NodeOrder<HalfSize> for BySize {
    unsafe fn less_than(a: NonNull<Node<HalfSize>>, b: NonNull<Node<HalfSize>>) -> bool {
        Header::from_size_node(a).as_ref().size() < Header::from_size_node(b).as_ref().size()
    }
}

/// Orders address-tree nodes by region base address. Free regions never
/// overlap, so these keys are unique by construction.
pub(crate) struct ByAddress;

impl NodeOrder<HalfSize> for ByAddress {
    unsafe fn less_than(a: NonNull<Node<HalfSize>>, b: NonNull<Node<HalfSize>>) -> bool {
        Header::from_addr_node(a) < Header::from_addr_node(b)
    }
}

/// The free-space index: every free region is linked into both trees
/// through the two nodes embedded in its own [`Header`]. The size view
/// answers best-fit queries, the address view finds the neighbours a
/// freshly freed region might coalesce with. Both views always describe
/// the same set of regions; keeping them in lockstep is the whole job of
/// this type.
pub(crate) struct FreeIndex {
    pub by_size: Tree<HalfSize, BySize>,
    pub by_addr: Tree<HalfSize, ByAddress>,
}

// Safety: every header linked into the trees is owned exclusively by the
// index until it is erased again. Nothing aliases a linked header.
unsafe impl Send for FreeIndex {}

impl FreeIndex {
    pub const fn new() -> Self {
        Self {
            by_size: Tree::new(),
            by_addr: Tree::new(),
        }
    }

    /// Links `header` into both trees. No coalescing happens here; that
    /// is the heap's business, see [`crate::heap`].
    ///
    /// # Safety
    ///
    /// `header` must be a live header freshly built by
    /// [`Header::emplace`] and not already linked.
    pub unsafe fn insert(&mut self, header: NonNull<Header>) {
        self.by_size.insert(Header::size_node_of(header));
        self.by_addr.insert(Header::addr_node_of(header));
    }

    /// Unlinks `header` from both trees. The header bytes are untouched
    /// and can be handed to the user right away.
    ///
    /// # Safety
    ///
    /// `header` must be linked in this index.
    pub unsafe fn erase(&mut self, header: NonNull<Header>) {
        self.by_size.erase(Header::size_node_of(header));
        self.by_addr.erase(Header::addr_node_of(header));
    }

    /// Smallest free region of at least `min_size` bytes. Every node that
    /// qualifies is recorded and the descent continues left towards
    /// smaller regions, so the last recorded one is the best fit.
    ///
    /// # Safety
    ///
    /// All linked headers must be live.
    pub unsafe fn best_fit(&self, min_size: usize) -> Pointer<Header> {
        let mut found = None;
        self.by_size.search(|node| {
            let header = unsafe { Header::from_size_node(node) };
            if unsafe { header.as_ref() }.size() >= min_size {
                found = Some(header);
                Ordering::Less
            } else {
                Ordering::Greater
            }
        });
        found
    }

    /// Free region with the largest base address below `header`'s.
    ///
    /// # Safety
    ///
    /// `header` must be linked in this index.
    pub unsafe fn addr_prev(&self, header: NonNull<Header>) -> Pointer<Header> {
        self.by_addr
            .prev(Header::addr_node_of(header))
            .map(|node| unsafe { Header::from_addr_node(node) })
    }

    /// Free region with the smallest base address above `header`'s.
    ///
    /// # Safety
    ///
    /// `header` must be linked in this index.
    pub unsafe fn addr_next(&self, header: NonNull<Header>) -> Pointer<Header> {
        self.by_addr
            .next(Header::addr_node_of(header))
            .map(|node| unsafe { Header::from_addr_node(node) })
    }
}
