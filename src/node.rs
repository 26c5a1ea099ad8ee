use crate::Pointer;

/// Intrusive AVL tree node. The tree only manipulates the links and the
/// balance factor; `data` belongs to whoever owns the node storage. See
/// [`crate::tree::Tree`] for the operations and [`crate::header::Header`]
/// for the trick that makes two of these fit inside a free region.
pub(crate) struct Node<T> {
    pub left: Pointer<Self>,
    pub right: Pointer<Self>,
    pub parent: Pointer<Self>,
    /// Height of the right subtree minus height of the left subtree.
    /// Stays in `{-1, 0, 1}` between operations, reaches `±2` only in the
    /// middle of a rebalance.
    pub balance: i8,
    pub data: T,
}

impl<T> Node<T> {
    /// Builds a detached node, ready for [`crate::tree::Tree::insert`].
    pub const fn new(data: T) -> Self {
        Self {
            left: None,
            right: None,
            parent: None,
            balance: 0,
            data,
        }
    }

    /// Whether this node is linked into a tree. [`crate::tree::Tree::insert`]
    /// only accepts detached nodes.
    pub fn is_detached(&self) -> bool {
        self.left.is_none() && self.right.is_none() && self.parent.is_none() && self.balance == 0
    }
}
