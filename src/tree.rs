use std::{cmp::Ordering, marker::PhantomData, ptr::NonNull};

use crate::{node::Node, Pointer};

/// Strict weak ordering over tree nodes. Implementations are zero sized
/// and read their key through the node pointer, which is what lets the
/// same node type participate in two differently keyed trees at once.
/// See [`crate::index`] for the two heap orderings and [`crate::set`] for
/// the plain by-value one.
pub(crate) trait NodeOrder<T> {
    /// Returns true if `a` orders strictly before `b`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live nodes owned by the tree this
    /// order was instantiated for.
    unsafe fn less_than(a: NonNull<Node<T>>, b: NonNull<Node<T>>) -> bool;
}

/// Which child slot of its parent a node occupies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn flip(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Height differential contributed by this side, in the sign
    /// convention of [`Node::balance`] (right minus left).
    fn diff(self) -> i8 {
        match self {
            Side::Left => -1,
            Side::Right => 1,
        }
    }
}

/// Height-balanced binary search tree over externally owned nodes. The
/// tree stores no keys of its own; ordering is delegated to the `O`
/// strategy and node storage is whatever the caller hands to
/// [`Tree::insert`]. Since it cannot allocate (the heap built on top of
/// it IS the allocator), every operation works purely on links.
///
/// Erasing a node never touches its storage, so the same bytes can be
/// handed back to the allocator user the moment [`Tree::erase`] returns.
pub(crate) struct Tree<T, O> {
    root: Pointer<Node<T>>,
    order: PhantomData<O>,
}

impl<T, O: NodeOrder<T>> Tree<T, O> {
    pub const fn new() -> Self {
        Self {
            root: None,
            order: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Leftmost node, or `None` if the tree is empty.
    ///
    /// # Safety
    ///
    /// All linked nodes must be live. The same requirement applies to
    /// every traversal method below.
    pub unsafe fn head(&self) -> Pointer<Node<T>> {
        let mut cur = self.root?;
        while let Some(left) = cur.as_ref().left {
            cur = left;
        }
        Some(cur)
    }

    /// Rightmost node, or `None` if the tree is empty.
    ///
    /// # Safety
    ///
    /// See [`Tree::head`].
    pub unsafe fn tail(&self) -> Pointer<Node<T>> {
        let mut cur = self.root?;
        while let Some(right) = cur.as_ref().right {
            cur = right;
        }
        Some(cur)
    }

    /// In-order predecessor of `cur`: either the rightmost node of the
    /// left subtree, or the first ancestor reached from the right.
    ///
    /// # Safety
    ///
    /// `cur` must be linked into this tree.
    pub unsafe fn prev(&self, cur: NonNull<Node<T>>) -> Pointer<Node<T>> {
        if let Some(left) = cur.as_ref().left {
            let mut cur = left;
            while let Some(right) = cur.as_ref().right {
                cur = right;
            }
            return Some(cur);
        }
        let mut cur = Some(cur);
        while let Some(node) = cur {
            let side = self.side_of(node);
            cur = node.as_ref().parent;
            if side != Some(Side::Left) {
                break;
            }
        }
        cur
    }

    /// In-order successor of `cur`. Mirror of [`Tree::prev`].
    ///
    /// # Safety
    ///
    /// `cur` must be linked into this tree.
    pub unsafe fn next(&self, cur: NonNull<Node<T>>) -> Pointer<Node<T>> {
        if let Some(right) = cur.as_ref().right {
            let mut cur = right;
            while let Some(left) = cur.as_ref().left {
                cur = left;
            }
            return Some(cur);
        }
        let mut cur = Some(cur);
        while let Some(node) = cur {
            let side = self.side_of(node);
            cur = node.as_ref().parent;
            if side != Some(Side::Right) {
                break;
            }
        }
        cur
    }

    /// Guided descent. At every visited node the decider picks a
    /// direction: `Less` descends left, `Greater` descends right, `Equal`
    /// stops and returns the node. Walking off the tree returns `None`.
    /// This one primitive covers exact lookup, best-fit and range probes.
    ///
    /// # Safety
    ///
    /// All linked nodes must be live. The decider must not unlink nodes.
    pub unsafe fn search<F>(&self, mut decider: F) -> Pointer<Node<T>>
    where
        F: FnMut(NonNull<Node<T>>) -> Ordering,
    {
        let mut cur = self.root;
        while let Some(node) = cur {
            match decider(node) {
                Ordering::Equal => break,
                Ordering::Less => cur = node.as_ref().left,
                Ordering::Greater => cur = node.as_ref().right,
            }
        }
        cur
    }

    /// Links `new_node` as a leaf and rebalances. Equal keys descend into
    /// the shallower subtree, keeping clusters of duplicates flat.
    ///
    /// # Safety
    ///
    /// `new_node` must be live, detached and not already linked anywhere.
    pub unsafe fn insert(&mut self, mut new_node: NonNull<Node<T>>) {
        debug_assert!(new_node.as_ref().is_detached());

        let Some(mut cur) = self.root else {
            self.root = Some(new_node);
            return;
        };

        let side = loop {
            let side = if O::less_than(new_node, cur) {
                Side::Left
            } else if O::less_than(cur, new_node) {
                Side::Right
            } else if cur.as_ref().balance > 0 {
                Side::Left
            } else {
                Side::Right
            };
            let child = match side {
                Side::Left => cur.as_ref().left,
                Side::Right => cur.as_ref().right,
            };
            match child {
                Some(next) => cur = next,
                None => break side,
            }
        };

        match side {
            Side::Left => cur.as_mut().left = Some(new_node),
            Side::Right => cur.as_mut().right = Some(new_node),
        }
        new_node.as_mut().parent = Some(cur);
        self.rebalance(cur, side, false);
    }

    /// Unlinks `del_node` from the tree and rebalances. The node's
    /// storage is untouched; its links are left stale, so it must go
    /// through [`Node::new`] again before any reinsertion.
    ///
    /// A leaf is unlinked directly. An inner node is replaced by a leaf
    /// neighbour from its taller subtree; when neither neighbour is a
    /// leaf, the neighbour on the taller side is erased first (it is a
    /// proper descendant, so this recursion walks strictly down) and then
    /// reinstalled in the deleted node's place, inheriting its links and
    /// balance.
    ///
    /// # Safety
    ///
    /// `del_node` must be linked into this tree.
    pub unsafe fn erase(&mut self, del_node: NonNull<Node<T>>) {
        if is_leaf(del_node) {
            self.unlink(del_node);
            return;
        }

        let tall_side = if del_node.as_ref().balance > 0 {
            Side::Right
        } else {
            Side::Left
        };

        let mut replace_node = None;
        for side in [tall_side, tall_side.flip()] {
            let candidate = match side {
                Side::Left => self.prev(del_node),
                Side::Right => self.next(del_node),
            };
            if let Some(candidate) = candidate {
                if is_leaf(candidate) {
                    replace_node = Some(candidate);
                    break;
                }
            }
        }

        let mut replace_node = match replace_node {
            Some(node) => {
                self.unlink(node);
                node
            }
            None => {
                let neighbour = match tall_side {
                    Side::Left => self.prev(del_node).unwrap(),
                    Side::Right => self.next(del_node).unwrap(),
                };
                self.erase(neighbour);
                neighbour
            }
        };

        // Unlinking the replacement may have rebalanced the tree, so the
        // deleted node's links are only read from here on.
        replace_node.as_mut().left = del_node.as_ref().left;
        if let Some(mut left) = del_node.as_ref().left {
            left.as_mut().parent = Some(replace_node);
        }
        replace_node.as_mut().right = del_node.as_ref().right;
        if let Some(mut right) = del_node.as_ref().right {
            right.as_mut().parent = Some(replace_node);
        }
        replace_node.as_mut().parent = del_node.as_ref().parent;
        match self.side_of(del_node) {
            None => self.root = Some(replace_node),
            Some(side) => {
                let mut parent = del_node.as_ref().parent.unwrap();
                match side {
                    Side::Left => parent.as_mut().left = Some(replace_node),
                    Side::Right => parent.as_mut().right = Some(replace_node),
                }
            }
        }
        replace_node.as_mut().balance = del_node.as_ref().balance;
    }

    /// Post-order traversal handing every node to `visitor`, then resets
    /// the tree to empty. The owner releases storage from the visitor.
    ///
    /// # Safety
    ///
    /// All linked nodes must be live. After the visitor returns the node
    /// is never touched again, so it may free the storage.
    pub unsafe fn clear<F>(&mut self, mut visitor: F)
    where
        F: FnMut(NonNull<Node<T>>),
    {
        unsafe fn walk<T, F: FnMut(NonNull<Node<T>>)>(cur: Pointer<Node<T>>, visitor: &mut F) {
            let Some(node) = cur else { return };
            walk(node.as_ref().left, visitor);
            walk(node.as_ref().right, visitor);
            visitor(node);
        }
        walk(self.root, &mut visitor);
        self.root = None;
    }

    fn side_of(&self, cur: NonNull<Node<T>>) -> Option<Side> {
        unsafe {
            let Some(parent) = cur.as_ref().parent else {
                debug_assert_eq!(self.root, Some(cur));
                return None;
            };
            if parent.as_ref().left == Some(cur) {
                Some(Side::Left)
            } else {
                debug_assert_eq!(parent.as_ref().right, Some(cur));
                Some(Side::Right)
            }
        }
    }

    /// Detaches a leaf from its parent and propagates the height change.
    unsafe fn unlink(&mut self, cur: NonNull<Node<T>>) {
        debug_assert!(is_leaf(cur));
        match self.side_of(cur) {
            None => self.root = None,
            Some(side) => {
                let mut parent = cur.as_ref().parent.unwrap();
                match side {
                    Side::Left => parent.as_mut().left = None,
                    Side::Right => parent.as_mut().right = None,
                }
                self.rebalance(parent, side, true);
            }
        }
    }

    /// Height-differential propagation. `diff` names the side of `cur`
    /// whose subtree just grew (`remove == false`) or shrank
    /// (`remove == true`) by one level.
    ///
    /// On insert, a balance that moved away from zero means the whole
    /// subtree grew, so the change propagates to the parent; a balance
    /// that reached zero absorbed the growth. On remove it is the other
    /// way around: reaching zero means the subtree shrank and the change
    /// propagates, leaving zero means it absorbed the shrink. A balance
    /// at `±2` is repaired with one or two rotations; a repair that
    /// levels the subtree after a removal keeps propagating.
    unsafe fn rebalance(&mut self, mut cur: NonNull<Node<T>>, diff: Side, remove: bool) {
        let parent = cur.as_ref().parent;
        let side = self.side_of(cur);

        if remove {
            cur.as_mut().balance -= diff.diff();
            if cur.as_ref().balance == 0 {
                if let Some(parent) = parent {
                    self.rebalance(parent, side.unwrap(), true);
                    return;
                }
            }
        } else {
            cur.as_mut().balance += diff.diff();
            if cur.as_ref().balance == diff.diff() {
                if let Some(parent) = parent {
                    self.rebalance(parent, side.unwrap(), false);
                    return;
                }
            }
        }

        if (-1..=1).contains(&cur.as_ref().balance) {
            return;
        }

        cur = if cur.as_ref().balance == -2 {
            if cur.as_ref().left.unwrap().as_ref().balance == 1 {
                // LR rotation
                let left = Self::rotate_left(cur.as_ref().left.unwrap());
                cur.as_mut().left = Some(left);
                Self::rotate_right(cur)
            } else {
                // RR rotation
                Self::rotate_right(cur)
            }
        } else if cur.as_ref().right.unwrap().as_ref().balance == -1 {
            // RL rotation
            let right = Self::rotate_right(cur.as_ref().right.unwrap());
            cur.as_mut().right = Some(right);
            Self::rotate_left(cur)
        } else {
            // LL rotation
            Self::rotate_left(cur)
        };

        match side {
            None => {
                debug_assert!(parent.is_none());
                self.root = Some(cur);
            }
            Some(side) => {
                let mut parent = parent.unwrap();
                match side {
                    Side::Left => parent.as_mut().left = Some(cur),
                    Side::Right => parent.as_mut().right = Some(cur),
                }
            }
        }

        if remove && parent.is_some() && cur.as_ref().balance == 0 {
            debug_assert_eq!(parent, cur.as_ref().parent);
            self.rebalance(parent.unwrap(), self.side_of(cur).unwrap(), true);
        }
    }

    unsafe fn rotate_left(mut cur: NonNull<Node<T>>) -> NonNull<Node<T>> {
        let mut top = cur.as_ref().right.unwrap();

        cur.as_mut().right = top.as_ref().left;
        if let Some(mut left) = top.as_ref().left {
            debug_assert_eq!(left.as_ref().parent, Some(top));
            left.as_mut().parent = Some(cur);
        }
        top.as_mut().left = Some(cur);
        top.as_mut().parent = cur.as_ref().parent;
        cur.as_mut().parent = Some(top);

        let same = cur.as_ref().balance == top.as_ref().balance;
        cur.as_mut().balance -= 1;
        if top.as_ref().balance > 0 {
            cur.as_mut().balance -= top.as_ref().balance;
        }
        top.as_mut().balance -= 1 + same as i8;

        top
    }

    unsafe fn rotate_right(mut cur: NonNull<Node<T>>) -> NonNull<Node<T>> {
        let mut top = cur.as_ref().left.unwrap();

        cur.as_mut().left = top.as_ref().right;
        if let Some(mut right) = top.as_ref().right {
            debug_assert_eq!(right.as_ref().parent, Some(top));
            right.as_mut().parent = Some(cur);
        }
        top.as_mut().right = Some(cur);
        top.as_mut().parent = cur.as_ref().parent;
        cur.as_mut().parent = Some(top);

        let same = cur.as_ref().balance == top.as_ref().balance;
        cur.as_mut().balance += 1;
        if top.as_ref().balance < 0 {
            cur.as_mut().balance -= top.as_ref().balance;
        }
        top.as_mut().balance += 1 + same as i8;

        top
    }

    /// In-order walk, cheapest way for tests to snapshot the tree.
    #[cfg(test)]
    pub unsafe fn for_each<F: FnMut(NonNull<Node<T>>)>(&self, mut f: F) {
        let mut cur = self.head();
        while let Some(node) = cur {
            f(node);
            cur = self.next(node);
        }
    }

    /// Full structural audit: link symmetry, balance range, recomputed
    /// subtree heights and key order. Returns the node count.
    #[cfg(test)]
    pub unsafe fn check_integrity(&self) -> usize {
        let mut count = 0;
        if let Some(root) = self.root {
            assert!(root.as_ref().parent.is_none());
            self.check_node(root, &mut count);
        }
        count
    }

    #[cfg(test)]
    unsafe fn check_node(&self, cur: NonNull<Node<T>>, count: &mut usize) -> usize {
        *count += 1;

        match cur.as_ref().parent {
            Some(parent) => assert!(
                (parent.as_ref().left == Some(cur)) ^ (parent.as_ref().right == Some(cur))
            ),
            None => assert_eq!(self.root, Some(cur)),
        }

        assert!((-1..=1).contains(&cur.as_ref().balance));

        if is_leaf(cur) {
            return 1;
        }
        let mut depth_l = 0;
        let mut depth_r = 0;
        if let Some(left) = cur.as_ref().left {
            assert_eq!(left.as_ref().parent, Some(cur));
            assert!(!O::less_than(cur, left));
            depth_l = self.check_node(left, count);
        }
        if let Some(right) = cur.as_ref().right {
            assert_eq!(right.as_ref().parent, Some(cur));
            assert!(!O::less_than(right, cur));
            depth_r = self.check_node(right, count);
        }
        assert_eq!(depth_l as i64 + cur.as_ref().balance as i64, depth_r as i64);
        depth_l.max(depth_r) + 1
    }
}

unsafe fn is_leaf<T>(cur: NonNull<Node<T>>) -> bool {
    if cur.as_ref().left.is_some() || cur.as_ref().right.is_some() {
        return false;
    }
    debug_assert_eq!(cur.as_ref().balance, 0);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ByData;

    impl<T: Ord> NodeOrder<T> for ByData {
        unsafe fn less_than(a: NonNull<Node<T>>, b: NonNull<Node<T>>) -> bool {
            a.as_ref().data < b.as_ref().data
        }
    }

    fn new_node<T>(data: T) -> NonNull<Node<T>> {
        NonNull::from(Box::leak(Box::new(Node::new(data))))
    }

    unsafe fn free_node<T>(node: NonNull<Node<T>>) {
        drop(Box::from_raw(node.as_ptr()));
    }

    fn xorshift(mut x: u64) -> u64 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x
    }

    fn shuffle<T>(items: &mut [T], mut seed: u64) {
        for i in 0..items.len() {
            seed = xorshift(seed);
            let j = i + (seed as usize) % (items.len() - i);
            items.swap(i, j);
        }
    }

    unsafe fn snapshot(tree: &Tree<u64, ByData>) -> Vec<u64> {
        let mut values = Vec::new();
        tree.for_each(|node| values.push(unsafe { node.as_ref().data }));
        values
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut tree = Tree::<u64, ByData>::new();
        let nodes: Vec<_> = (0..64).map(new_node).collect();

        unsafe {
            for &node in &nodes {
                tree.insert(node);
                tree.check_integrity();
            }
            assert_eq!(snapshot(&tree), (0..64).collect::<Vec<_>>());

            for &node in &nodes {
                tree.erase(node);
                tree.check_integrity();
                free_node(node);
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn descending_inserts_stay_balanced() {
        let mut tree = Tree::<u64, ByData>::new();
        let nodes: Vec<_> = (0..64).rev().map(new_node).collect();

        unsafe {
            for &node in &nodes {
                tree.insert(node);
                tree.check_integrity();
            }
            assert_eq!(snapshot(&tree), (0..64).collect::<Vec<_>>());

            for &node in &nodes {
                tree.erase(node);
                tree.check_integrity();
                free_node(node);
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn zig_zag_inserts_trigger_double_rotations() {
        // Interleaving from both ends produces LR and RL shapes.
        let mut values = Vec::new();
        let (mut lo, mut hi) = (0u64, 1000u64);
        while lo < hi {
            values.push(lo);
            values.push(hi);
            lo += 1;
            hi -= 1;
        }

        let mut tree = Tree::<u64, ByData>::new();
        let nodes: Vec<_> = values.iter().map(|&v| new_node(v)).collect();
        unsafe {
            for &node in &nodes {
                tree.insert(node);
                tree.check_integrity();
            }
            let mut sorted = values.clone();
            sorted.sort_unstable();
            assert_eq!(snapshot(&tree), sorted);
            tree.clear(|node| unsafe { free_node(node) });
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn random_insert_erase() {
        let mut tree = Tree::<u64, ByData>::new();
        let mut seed = 0xDEADBEEF;
        let mut nodes = Vec::new();
        for _ in 0..1000 {
            seed = xorshift(seed);
            nodes.push(new_node(seed));
        }

        unsafe {
            for &node in &nodes {
                tree.insert(node);
            }
            assert_eq!(tree.check_integrity(), nodes.len());

            let mut sorted: Vec<u64> = nodes.iter().map(|n| unsafe { n.as_ref().data }).collect();
            sorted.sort_unstable();
            assert_eq!(snapshot(&tree), sorted);

            shuffle(&mut nodes, 0xC0FFEE);
            for &node in &nodes {
                tree.erase(node);
                tree.check_integrity();
                free_node(node);
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn equal_keys_cluster_flat() {
        let mut tree = Tree::<u64, ByData>::new();
        let mut nodes: Vec<_> = (0..128).map(|_| new_node(42u64)).collect();
        nodes.extend((0..16).map(|v| new_node(v)));
        nodes.extend((100..116).map(|v| new_node(v)));

        unsafe {
            for &node in &nodes {
                tree.insert(node);
                tree.check_integrity();
            }
            shuffle(&mut nodes, 0xBADC0DE);
            for &node in &nodes {
                tree.erase(node);
                tree.check_integrity();
                free_node(node);
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn prev_next_walk_both_ways() {
        let mut tree = Tree::<u64, ByData>::new();
        let nodes: Vec<_> = (0..100).map(new_node).collect();

        unsafe {
            for &node in &nodes {
                tree.insert(node);
            }

            let mut forward = Vec::new();
            let mut cur = tree.head();
            while let Some(node) = cur {
                forward.push(node.as_ref().data);
                cur = tree.next(node);
            }
            assert_eq!(forward, (0..100).collect::<Vec<_>>());

            let mut backward = Vec::new();
            let mut cur = tree.tail();
            while let Some(node) = cur {
                backward.push(node.as_ref().data);
                cur = tree.prev(node);
            }
            assert_eq!(backward, (0..100).rev().collect::<Vec<_>>());

            tree.clear(|node| unsafe { free_node(node) });
        }
    }

    #[test]
    fn search_steers_the_descent() {
        let mut tree = Tree::<u64, ByData>::new();
        let nodes: Vec<_> = (0..50).map(|v| new_node(v * 2)).collect();

        unsafe {
            for &node in &nodes {
                tree.insert(node);
            }

            // Exact lookup.
            let hit = tree.search(|node| 48u64.cmp(unsafe { &node.as_ref().data }));
            assert_eq!(hit.unwrap().as_ref().data, 48);

            // Miss walks off the tree.
            let miss = tree.search(|node| 47u64.cmp(unsafe { &node.as_ref().data }));
            assert!(miss.is_none());

            // First value >= 31, best-fit style: keep descending left
            // through qualifying nodes.
            let mut found = None;
            tree.search(|node| {
                let data = unsafe { node.as_ref().data };
                if data >= 31 {
                    found = Some(data);
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            });
            assert_eq!(found, Some(32));

            tree.clear(|node| unsafe { free_node(node) });
        }
    }
}
