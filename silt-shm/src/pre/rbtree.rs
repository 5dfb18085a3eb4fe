//! # Preallocated Red-Black Tree
//!
//! Shared-memory ordered map over caller-owned nodes. The node type embeds
//! [`RbLinks`] (children, parent, color, key); the tree stores offsets only.
//! Keys are `u64`; duplicate keys are permitted and land in the right
//! subtree, so `find` returns the first inserted duplicate.

use std::marker::PhantomData;

use crate::ptr::{AllocatorId, FullPtr, MemResolver, OffsetPtr, ShmPtr};

const RED: u32 = 0;
const BLACK: u32 = 1;

/// Embedded tree linkage. Node types expose it through [`RbNode`].
#[repr(C)]
#[derive(Debug)]
pub struct RbLinks {
    left: OffsetPtr,
    right: OffsetPtr,
    parent: OffsetPtr,
    color: u32,
    _pad: u32,
    /// The comparable field the tree orders by.
    pub key: u64,
}

impl RbLinks {
    /// Fresh links carrying `key`.
    pub fn new(key: u64) -> Self {
        Self {
            left: OffsetPtr::NULL,
            right: OffsetPtr::NULL,
            parent: OffsetPtr::NULL,
            color: RED,
            _pad: 0,
            key,
        }
    }
}

/// Implemented by node types that embed [`RbLinks`].
pub trait RbNode {
    /// Borrow the embedded links.
    fn links(&self) -> &RbLinks;
    /// Mutably borrow the embedded links.
    fn links_mut(&mut self) -> &mut RbLinks;
}

/// Shared-memory red-black tree of caller-owned nodes.
#[repr(C)]
pub struct RbTree<N> {
    len: u64,
    root: OffsetPtr,
    _marker: PhantomData<N>,
}

impl<N: RbNode> RbTree<N> {
    /// Initialize in place to the empty tree.
    pub fn init(&mut self) {
        self.len = 0;
        self.root = OffsetPtr::NULL;
    }

    /// Number of nodes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // Raw link access. All offsets handled below were either emplaced into
    // this tree by the caller or read back out of its own links.

    unsafe fn links<'a, R: MemResolver>(&self, res: &R, off: OffsetPtr) -> &'a mut RbLinks
    where
        N: 'a,
    {
        debug_assert!(!off.is_null());
        (*res.resolve_t::<N>(off)).links_mut()
    }

    fn left<R: MemResolver>(&self, res: &R, off: OffsetPtr) -> OffsetPtr {
        unsafe { self.links(res, off).left }
    }

    fn right<R: MemResolver>(&self, res: &R, off: OffsetPtr) -> OffsetPtr {
        unsafe { self.links(res, off).right }
    }

    fn parent<R: MemResolver>(&self, res: &R, off: OffsetPtr) -> OffsetPtr {
        unsafe { self.links(res, off).parent }
    }

    fn key<R: MemResolver>(&self, res: &R, off: OffsetPtr) -> u64 {
        unsafe { self.links(res, off).key }
    }

    /// Color of a node; null counts as black.
    fn color<R: MemResolver>(&self, res: &R, off: OffsetPtr) -> u32 {
        if off.is_null() {
            BLACK
        } else {
            unsafe { self.links(res, off).color }
        }
    }

    fn set_color<R: MemResolver>(&self, res: &R, off: OffsetPtr, color: u32) {
        if !off.is_null() {
            unsafe { self.links(res, off).color = color };
        }
    }

    /// Find a node by key; null when absent.
    pub fn find<R: MemResolver>(&self, res: &R, key: u64) -> FullPtr<N> {
        let mut curr = self.root;
        while !curr.is_null() {
            let k = self.key(res, curr);
            if key == k {
                return FullPtr::new(
                    res.resolve_t::<N>(curr),
                    ShmPtr::new(AllocatorId::null(), curr),
                );
            }
            curr = if key < k {
                self.left(res, curr)
            } else {
                self.right(res, curr)
            };
        }
        FullPtr::null()
    }

    /// Insert a caller-owned node. The key is read from the node's links;
    /// the remaining link fields are reset here.
    pub fn emplace<R: MemResolver>(&mut self, res: &R, node: FullPtr<N>) {
        debug_assert!(!node.is_null());
        let off = node.off();
        let key = unsafe { self.links(res, off).key };
        unsafe {
            let links = self.links(res, off);
            links.left = OffsetPtr::NULL;
            links.right = OffsetPtr::NULL;
            links.parent = OffsetPtr::NULL;
            links.color = RED;
        }

        // Standard BST descent.
        let mut parent = OffsetPtr::NULL;
        let mut curr = self.root;
        let mut went_left = false;
        while !curr.is_null() {
            parent = curr;
            went_left = key < self.key(res, curr);
            curr = if went_left {
                self.left(res, curr)
            } else {
                self.right(res, curr)
            };
        }

        if parent.is_null() {
            self.root = off;
        } else {
            unsafe {
                self.links(res, off).parent = parent;
                if went_left {
                    self.links(res, parent).left = off;
                } else {
                    self.links(res, parent).right = off;
                }
            }
        }
        self.len += 1;
        self.insert_fixup(res, off);
    }

    /// Remove the node with `key` and return it; null when absent.
    /// The node is unlinked, not deallocated.
    pub fn remove<R: MemResolver>(&mut self, res: &R, key: u64) -> FullPtr<N> {
        let node = self.find(res, key);
        if node.is_null() {
            return node;
        }
        let z = node.off();

        // The color of the node physically removed decides whether a fix-up
        // is needed; x replaces it, and (x_parent, x_is_left) records the
        // vacated position when x is null.
        let y_color;
        let x;
        let x_parent;
        let x_is_left;

        let z_left = self.left(res, z);
        let z_right = self.right(res, z);

        if z_left.is_null() {
            y_color = self.color(res, z);
            x = z_right;
            x_parent = self.parent(res, z);
            x_is_left = self.is_left_child(res, z);
            self.transplant(res, z, z_right);
        } else if z_right.is_null() {
            y_color = self.color(res, z);
            x = z_left;
            x_parent = self.parent(res, z);
            x_is_left = self.is_left_child(res, z);
            self.transplant(res, z, z_left);
        } else {
            let succ = self.minimum(res, z_right);
            y_color = self.color(res, succ);
            x = self.right(res, succ);
            if self.parent(res, succ) == z {
                x_parent = succ;
                x_is_left = false;
            } else {
                x_parent = self.parent(res, succ);
                x_is_left = true; // the successor is always a left child here
                self.transplant(res, succ, x);
                unsafe {
                    self.links(res, succ).right = z_right;
                    self.links(res, z_right).parent = succ;
                }
            }
            self.transplant(res, z, succ);
            unsafe {
                self.links(res, succ).left = z_left;
                self.links(res, z_left).parent = succ;
            }
            self.set_color(res, succ, self.color(res, z));
        }

        self.len -= 1;
        if y_color == BLACK {
            self.remove_fixup(res, x, x_parent, x_is_left);
        }
        node
    }

    fn is_left_child<R: MemResolver>(&self, res: &R, off: OffsetPtr) -> bool {
        let parent = self.parent(res, off);
        !parent.is_null() && self.left(res, parent) == off
    }

    fn minimum<R: MemResolver>(&self, res: &R, mut off: OffsetPtr) -> OffsetPtr {
        loop {
            let left = self.left(res, off);
            if left.is_null() {
                return off;
            }
            off = left;
        }
    }

    /// Replace the subtree rooted at `u` with the subtree rooted at `v`.
    fn transplant<R: MemResolver>(&mut self, res: &R, u: OffsetPtr, v: OffsetPtr) {
        let u_parent = self.parent(res, u);
        if u_parent.is_null() {
            self.root = v;
        } else if self.left(res, u_parent) == u {
            unsafe { self.links(res, u_parent).left = v };
        } else {
            unsafe { self.links(res, u_parent).right = v };
        }
        if !v.is_null() {
            unsafe { self.links(res, v).parent = u_parent };
        }
    }

    fn rotate_left<R: MemResolver>(&mut self, res: &R, x: OffsetPtr) {
        let y = self.right(res, x);
        debug_assert!(!y.is_null());
        let y_left = self.left(res, y);
        unsafe {
            self.links(res, x).right = y_left;
            if !y_left.is_null() {
                self.links(res, y_left).parent = x;
            }
            let x_parent = self.links(res, x).parent;
            self.links(res, y).parent = x_parent;
            if x_parent.is_null() {
                self.root = y;
            } else if self.links(res, x_parent).left == x {
                self.links(res, x_parent).left = y;
            } else {
                self.links(res, x_parent).right = y;
            }
            self.links(res, y).left = x;
            self.links(res, x).parent = y;
        }
    }

    fn rotate_right<R: MemResolver>(&mut self, res: &R, x: OffsetPtr) {
        let y = self.left(res, x);
        debug_assert!(!y.is_null());
        let y_right = self.right(res, y);
        unsafe {
            self.links(res, x).left = y_right;
            if !y_right.is_null() {
                self.links(res, y_right).parent = x;
            }
            let x_parent = self.links(res, x).parent;
            self.links(res, y).parent = x_parent;
            if x_parent.is_null() {
                self.root = y;
            } else if self.links(res, x_parent).left == x {
                self.links(res, x_parent).left = y;
            } else {
                self.links(res, x_parent).right = y;
            }
            self.links(res, y).right = x;
            self.links(res, x).parent = y;
        }
    }

    fn insert_fixup<R: MemResolver>(&mut self, res: &R, mut z: OffsetPtr) {
        while {
            let p = self.parent(res, z);
            !p.is_null() && self.color(res, p) == RED
        } {
            let parent = self.parent(res, z);
            let grandparent = self.parent(res, parent);
            if grandparent.is_null() {
                break;
            }
            if parent == self.left(res, grandparent) {
                let uncle = self.right(res, grandparent);
                if self.color(res, uncle) == RED {
                    self.set_color(res, parent, BLACK);
                    self.set_color(res, uncle, BLACK);
                    self.set_color(res, grandparent, RED);
                    z = grandparent;
                } else {
                    if z == self.right(res, parent) {
                        z = parent;
                        self.rotate_left(res, z);
                    }
                    let parent = self.parent(res, z);
                    let grandparent = self.parent(res, parent);
                    self.set_color(res, parent, BLACK);
                    self.set_color(res, grandparent, RED);
                    self.rotate_right(res, grandparent);
                }
            } else {
                let uncle = self.left(res, grandparent);
                if self.color(res, uncle) == RED {
                    self.set_color(res, parent, BLACK);
                    self.set_color(res, uncle, BLACK);
                    self.set_color(res, grandparent, RED);
                    z = grandparent;
                } else {
                    if z == self.left(res, parent) {
                        z = parent;
                        self.rotate_right(res, z);
                    }
                    let parent = self.parent(res, z);
                    let grandparent = self.parent(res, parent);
                    self.set_color(res, parent, BLACK);
                    self.set_color(res, grandparent, RED);
                    self.rotate_left(res, grandparent);
                }
            }
        }
        let root = self.root;
        self.set_color(res, root, BLACK);
    }

    /// Restore the black-height invariant after removing a black node.
    /// `x` may be null; `(x_parent, x_is_left)` locate the deficit.
    fn remove_fixup<R: MemResolver>(
        &mut self,
        res: &R,
        mut x: OffsetPtr,
        mut x_parent: OffsetPtr,
        mut x_is_left: bool,
    ) {
        while x != self.root && self.color(res, x) == BLACK {
            if x_parent.is_null() {
                break;
            }
            if x_is_left {
                let mut w = self.right(res, x_parent);
                if self.color(res, w) == RED {
                    self.set_color(res, w, BLACK);
                    self.set_color(res, x_parent, RED);
                    self.rotate_left(res, x_parent);
                    w = self.right(res, x_parent);
                }
                if w.is_null() {
                    break;
                }
                let w_left = self.left(res, w);
                let w_right = self.right(res, w);
                if self.color(res, w_left) == BLACK && self.color(res, w_right) == BLACK {
                    self.set_color(res, w, RED);
                    x = x_parent;
                    x_parent = self.parent(res, x);
                    x_is_left = !x_parent.is_null() && self.left(res, x_parent) == x;
                } else {
                    if self.color(res, w_right) == BLACK {
                        self.set_color(res, w_left, BLACK);
                        self.set_color(res, w, RED);
                        self.rotate_right(res, w);
                        w = self.right(res, x_parent);
                    }
                    self.set_color(res, w, self.color(res, x_parent));
                    self.set_color(res, x_parent, BLACK);
                    let w_right = self.right(res, w);
                    self.set_color(res, w_right, BLACK);
                    self.rotate_left(res, x_parent);
                    x = self.root;
                }
            } else {
                let mut w = self.left(res, x_parent);
                if self.color(res, w) == RED {
                    self.set_color(res, w, BLACK);
                    self.set_color(res, x_parent, RED);
                    self.rotate_right(res, x_parent);
                    w = self.left(res, x_parent);
                }
                if w.is_null() {
                    break;
                }
                let w_left = self.left(res, w);
                let w_right = self.right(res, w);
                if self.color(res, w_left) == BLACK && self.color(res, w_right) == BLACK {
                    self.set_color(res, w, RED);
                    x = x_parent;
                    x_parent = self.parent(res, x);
                    x_is_left = !x_parent.is_null() && self.left(res, x_parent) == x;
                } else {
                    if self.color(res, w_left) == BLACK {
                        self.set_color(res, w_right, BLACK);
                        self.set_color(res, w, RED);
                        self.rotate_left(res, w);
                        w = self.left(res, x_parent);
                    }
                    self.set_color(res, w, self.color(res, x_parent));
                    self.set_color(res, x_parent, BLACK);
                    let w_left = self.left(res, w);
                    self.set_color(res, w_left, BLACK);
                    self.rotate_right(res, x_parent);
                    x = self.root;
                }
            }
        }
        self.set_color(res, x, BLACK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr::MemRegion;

    #[repr(C)]
    struct TestNode {
        links: RbLinks,
        payload: u64,
    }

    impl RbNode for TestNode {
        fn links(&self) -> &RbLinks {
            &self.links
        }
        fn links_mut(&mut self) -> &mut RbLinks {
            &mut self.links
        }
    }

    struct Fixture {
        _buf: Vec<u8>,
        region: MemRegion,
        stride: u64,
    }

    impl Fixture {
        fn new(count: usize) -> Self {
            let stride = std::mem::size_of::<TestNode>().next_power_of_two();
            let mut buf = vec![0u8; stride * (count + 1)];
            let region = MemRegion::new(buf.as_mut_ptr(), 0, buf.len() as u64);
            Self {
                _buf: buf,
                region,
                stride: stride as u64,
            }
        }

        /// Node slot `i` (1-based so offset 0 stays the null sentinel).
        fn node(&self, i: usize, key: u64) -> FullPtr<TestNode> {
            let off = OffsetPtr::new(i as u64 * self.stride);
            let ptr = self.region.resolve_t::<TestNode>(off);
            unsafe {
                (*ptr).links = RbLinks::new(key);
                (*ptr).payload = key * 100;
            }
            FullPtr::new(ptr, ShmPtr::new(AllocatorId::null(), off))
        }
    }

    fn new_tree() -> RbTree<TestNode> {
        let mut tree = RbTree {
            len: 0,
            root: OffsetPtr::NULL,
            _marker: PhantomData,
        };
        tree.init();
        tree
    }

    /// Check the red-black invariants: root black, no red-red edge, equal
    /// black heights. Returns the black height.
    fn check_invariants(tree: &RbTree<TestNode>, region: &MemRegion, off: OffsetPtr) -> usize {
        if off.is_null() {
            return 1;
        }
        let color = tree.color(region, off);
        let left = tree.left(region, off);
        let right = tree.right(region, off);
        if color == RED {
            assert_eq!(tree.color(region, left), BLACK, "red-red violation");
            assert_eq!(tree.color(region, right), BLACK, "red-red violation");
        }
        if !left.is_null() {
            assert!(tree.key(region, left) <= tree.key(region, off));
        }
        if !right.is_null() {
            assert!(tree.key(region, right) >= tree.key(region, off));
        }
        let lh = check_invariants(tree, region, left);
        let rh = check_invariants(tree, region, right);
        assert_eq!(lh, rh, "black-height mismatch");
        lh + if color == BLACK { 1 } else { 0 }
    }

    fn assert_valid(tree: &RbTree<TestNode>, region: &MemRegion) {
        let root = tree.root;
        assert_eq!(tree.color(region, root), BLACK, "root must be black");
        check_invariants(tree, region, root);
    }

    #[test]
    fn test_emplace_find() {
        let fx = Fixture::new(16);
        let mut tree = new_tree();
        for (i, key) in [50u64, 30, 70, 20, 40, 60, 80].iter().enumerate() {
            tree.emplace(&fx.region, fx.node(i + 1, *key));
        }
        assert_eq!(tree.len(), 7);
        assert_valid(&tree, &fx.region);

        for key in [50u64, 30, 70, 20, 40, 60, 80] {
            let node = tree.find(&fx.region, key);
            assert!(!node.is_null(), "key {} missing", key);
            assert_eq!(unsafe { node.get().payload }, key * 100);
        }
        assert!(tree.find(&fx.region, 99).is_null());
    }

    #[test]
    fn test_remove_leaf_and_internal() {
        let fx = Fixture::new(16);
        let mut tree = new_tree();
        for (i, key) in [50u64, 30, 70, 20, 40, 60, 80].iter().enumerate() {
            tree.emplace(&fx.region, fx.node(i + 1, *key));
        }

        // Leaf.
        let removed = tree.remove(&fx.region, 20);
        assert!(!removed.is_null());
        assert!(tree.find(&fx.region, 20).is_null());
        assert_valid(&tree, &fx.region);

        // Internal node with two children.
        let removed = tree.remove(&fx.region, 50);
        assert_eq!(unsafe { removed.get().links.key }, 50);
        assert!(tree.find(&fx.region, 50).is_null());
        assert_valid(&tree, &fx.region);

        // The rest are still reachable.
        for key in [30u64, 70, 40, 60, 80] {
            assert!(!tree.find(&fx.region, key).is_null());
        }
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_remove_missing_is_null() {
        let fx = Fixture::new(4);
        let mut tree = new_tree();
        tree.emplace(&fx.region, fx.node(1, 10));
        assert!(tree.remove(&fx.region, 11).is_null());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_ascending_inserts_stay_balanced() {
        let count = 64usize;
        let fx = Fixture::new(count);
        let mut tree = new_tree();
        for i in 1..=count {
            tree.emplace(&fx.region, fx.node(i, i as u64));
            assert_valid(&tree, &fx.region);
        }
        assert_eq!(tree.len(), count as u64);
        for i in 1..=count {
            assert!(!tree.find(&fx.region, i as u64).is_null());
        }
    }

    #[test]
    fn test_interleaved_insert_remove() {
        let count = 48usize;
        let fx = Fixture::new(count);
        let mut tree = new_tree();
        // Keys chosen by a fixed stride walk to mix the shape up.
        let keys: Vec<u64> = (0..count as u64).map(|i| (i * 37) % 101).collect();
        for (i, key) in keys.iter().enumerate() {
            tree.emplace(&fx.region, fx.node(i + 1, *key));
        }
        assert_valid(&tree, &fx.region);

        for key in keys.iter().step_by(2) {
            assert!(!tree.remove(&fx.region, *key).is_null());
            assert_valid(&tree, &fx.region);
        }
        for (idx, key) in keys.iter().enumerate() {
            let found = tree.find(&fx.region, *key);
            if idx % 2 == 0 {
                assert!(found.is_null(), "key {} should be gone", key);
            } else {
                assert!(!found.is_null(), "key {} should remain", key);
            }
        }
    }
}
