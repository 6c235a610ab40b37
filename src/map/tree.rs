//! Red-black trees over heap offsets
//!
//! One tree per bucket. Nodes are chunks in the segment's storage and are
//! linked by offset; `NIL` is the null leaf. A node's offset is its identity
//! for the whole rebalance, so a node is never moved in place: promoting a
//! successor or growing a value allocates a replacement and splices it in.

use crate::error::Result;
use crate::malloc::{Offset, Storage, NIL};

use super::format::{NodeLayout, BLACK, RED};

/// Root of `bucket` in a little-endian table of offsets
pub(crate) fn root_of(table: &[u8], bucket: usize) -> Offset {
    let at = bucket * 4;
    u32::from_le_bytes([table[at], table[at + 1], table[at + 2], table[at + 3]])
}

/// Leftmost node under `node`
pub(crate) fn first_under(layout: &NodeLayout, storage: &Storage, mut node: Offset) -> Offset {
    if node == NIL {
        return NIL;
    }
    loop {
        let left = layout.left(storage, node);
        if left == NIL {
            return node;
        }
        node = left;
    }
}

/// In-order successor of `node` within its tree
pub(crate) fn successor(layout: &NodeLayout, storage: &Storage, node: Offset) -> Offset {
    let right = layout.right(storage, node);
    if right != NIL {
        return first_under(layout, storage, right);
    }
    let mut child = node;
    let mut parent = layout.parent(storage, node);
    while parent != NIL && child == layout.right(storage, parent) {
        child = parent;
        parent = layout.parent(storage, parent);
    }
    parent
}

/// Mutable view of one bucket's tree
pub(crate) struct Tree<'a> {
    pub storage: &'a mut Storage,
    pub table: &'a mut [u8],
    pub layout: NodeLayout,
    pub bucket: usize,
}

impl Tree<'_> {
    pub fn root(&self) -> Offset {
        root_of(self.table, self.bucket)
    }

    fn set_root(&mut self, node: Offset) {
        let at = self.bucket * 4;
        self.table[at..at + 4].copy_from_slice(&node.to_le_bytes());
    }

    // -------------------------------------------------------------------------
    // Link helpers (all tolerate NIL)
    // -------------------------------------------------------------------------

    fn left(&self, node: Offset) -> Offset {
        self.layout.left(self.storage, node)
    }

    fn right(&self, node: Offset) -> Offset {
        self.layout.right(self.storage, node)
    }

    fn parent(&self, node: Offset) -> Offset {
        self.layout.parent(self.storage, node)
    }

    fn color(&self, node: Offset) -> i8 {
        self.layout.color(self.storage, node)
    }

    fn set_left(&mut self, node: Offset, value: Offset) {
        self.layout.set_left(self.storage, node, value)
    }

    fn set_right(&mut self, node: Offset, value: Offset) {
        self.layout.set_right(self.storage, node, value)
    }

    fn set_parent(&mut self, node: Offset, value: Offset) {
        self.layout.set_parent(self.storage, node, value)
    }

    fn set_color(&mut self, node: Offset, color: i8) {
        self.layout.set_color(self.storage, node, color)
    }

    /// Point whatever referenced `old` from above (parent or root) at `new`
    fn replace_in_parent(&mut self, old: Offset, parent: Offset, new: Offset) {
        if parent == NIL {
            self.set_root(new);
        } else if self.left(parent) == old {
            self.set_left(parent, new);
        } else {
            self.set_right(parent, new);
        }
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Make `node` the root of an empty tree
    pub fn attach_root(&mut self, node: Offset) {
        self.set_left(node, NIL);
        self.set_right(node, NIL);
        self.set_parent(node, NIL);
        self.set_color(node, BLACK);
        self.set_root(node);
    }

    /// Hang `node` below `parent` and rebalance
    pub fn attach(&mut self, node: Offset, parent: Offset, as_left: bool) {
        self.set_left(node, NIL);
        self.set_right(node, NIL);
        self.set_parent(node, parent);
        self.set_color(node, BLACK);
        if as_left {
            self.set_left(parent, node);
        } else {
            self.set_right(parent, node);
        }
        self.fix_after_insertion(node);
    }

    fn rotate_left(&mut self, p: Offset) {
        if p == NIL {
            return;
        }
        let r = self.right(p);
        let r_left = self.left(r);
        self.set_right(p, r_left);
        if r_left != NIL {
            self.set_parent(r_left, p);
        }
        let pp = self.parent(p);
        self.set_parent(r, pp);
        self.replace_in_parent(p, pp, r);
        self.set_left(r, p);
        self.set_parent(p, r);
    }

    fn rotate_right(&mut self, p: Offset) {
        if p == NIL {
            return;
        }
        let l = self.left(p);
        let l_right = self.right(l);
        self.set_left(p, l_right);
        if l_right != NIL {
            self.set_parent(l_right, p);
        }
        let pp = self.parent(p);
        self.set_parent(l, pp);
        if pp == NIL {
            self.set_root(l);
        } else if self.right(pp) == p {
            self.set_right(pp, l);
        } else {
            self.set_left(pp, l);
        }
        self.set_right(l, p);
        self.set_parent(p, l);
    }

    fn fix_after_insertion(&mut self, mut x: Offset) {
        self.set_color(x, RED);

        while x != NIL && x != self.root() && self.color(self.parent(x)) == RED {
            let xp = self.parent(x);
            let xpp = self.parent(xp);
            if xp == self.left(xpp) {
                let y = self.right(xpp);
                if self.color(y) == RED {
                    self.set_color(xp, BLACK);
                    self.set_color(y, BLACK);
                    self.set_color(xpp, RED);
                    x = xpp;
                } else {
                    if x == self.right(xp) {
                        x = xp;
                        self.rotate_left(x);
                    }
                    let xp = self.parent(x);
                    let xpp = self.parent(xp);
                    self.set_color(xp, BLACK);
                    self.set_color(xpp, RED);
                    self.rotate_right(xpp);
                }
            } else {
                let y = self.left(xpp);
                if self.color(y) == RED {
                    self.set_color(xp, BLACK);
                    self.set_color(y, BLACK);
                    self.set_color(xpp, RED);
                    x = xpp;
                } else {
                    if x == self.left(xp) {
                        x = xp;
                        self.rotate_right(x);
                    }
                    let xp = self.parent(x);
                    let xpp = self.parent(xp);
                    self.set_color(xp, BLACK);
                    self.set_color(xpp, RED);
                    self.rotate_left(xpp);
                }
            }
        }

        let root = self.root();
        self.set_color(root, BLACK);
    }

    // =========================================================================
    // Replacement
    // =========================================================================

    /// Put `new` where `old` is: same parent, children and color
    ///
    /// `new` must already carry `old`'s links (a header copy) or have them
    /// written by the caller; only the neighbours are rewired here.
    pub fn splice(&mut self, old: Offset, new: Offset) {
        let parent = self.parent(old);
        self.replace_in_parent(old, parent, new);
        let left = self.left(old);
        if left != NIL {
            self.set_parent(left, new);
        }
        let right = self.right(old);
        if right != NIL {
            self.set_parent(right, new);
        }
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Unlink `p` from the tree and free every chunk it vacates
    pub fn delete(&mut self, mut p: Offset) -> Result<()> {
        if self.left(p) != NIL && self.right(p) != NIL {
            // Copy the successor's entry into a node standing where p stands
            let s = successor(&self.layout, self.storage, p);
            let size = self.storage.size_of(s);
            let clone = self.storage.allocate(size)?;
            self.storage.copy(s, clone, size);

            let (left, right, parent, color) = (self.left(p), self.right(p), self.parent(p), self.color(p));
            self.set_left(clone, left);
            self.set_right(clone, right);
            self.set_parent(clone, parent);
            self.set_color(clone, color);
            self.splice(p, clone);
            self.storage.free(p);

            p = s;
        }

        let replacement = if self.left(p) != NIL {
            self.left(p)
        } else {
            self.right(p)
        };

        if replacement != NIL {
            let parent = self.parent(p);
            self.set_parent(replacement, parent);
            self.replace_in_parent(p, parent, replacement);
            if self.color(p) == BLACK {
                self.fix_after_deletion(replacement);
            }
        } else if self.parent(p) == NIL {
            self.set_root(NIL);
        } else {
            if self.color(p) == BLACK {
                self.fix_after_deletion(p);
            }
            let parent = self.parent(p);
            if parent != NIL {
                if self.left(parent) == p {
                    self.set_left(parent, NIL);
                } else if self.right(parent) == p {
                    self.set_right(parent, NIL);
                }
            }
        }

        self.storage.free(p);
        Ok(())
    }

    fn fix_after_deletion(&mut self, mut x: Offset) {
        while x != self.root() && self.color(x) == BLACK {
            let xp = self.parent(x);
            if x == self.left(xp) {
                let mut sib = self.right(xp);
                if self.color(sib) == RED {
                    self.set_color(sib, BLACK);
                    self.set_color(xp, RED);
                    self.rotate_left(xp);
                    sib = self.right(self.parent(x));
                }

                if self.color(self.left(sib)) == BLACK && self.color(self.right(sib)) == BLACK {
                    self.set_color(sib, RED);
                    x = self.parent(x);
                } else {
                    if self.color(self.right(sib)) == BLACK {
                        let sl = self.left(sib);
                        self.set_color(sl, BLACK);
                        self.set_color(sib, RED);
                        self.rotate_right(sib);
                        sib = self.right(self.parent(x));
                    }
                    let xp = self.parent(x);
                    let xp_color = self.color(xp);
                    self.set_color(sib, xp_color);
                    self.set_color(xp, BLACK);
                    let sr = self.right(sib);
                    self.set_color(sr, BLACK);
                    self.rotate_left(xp);
                    x = self.root();
                }
            } else {
                let mut sib = self.left(xp);
                if self.color(sib) == RED {
                    self.set_color(sib, BLACK);
                    self.set_color(xp, RED);
                    self.rotate_right(xp);
                    sib = self.left(self.parent(x));
                }

                if self.color(self.right(sib)) == BLACK && self.color(self.left(sib)) == BLACK {
                    self.set_color(sib, RED);
                    x = self.parent(x);
                } else {
                    if self.color(self.left(sib)) == BLACK {
                        let sr = self.right(sib);
                        self.set_color(sr, BLACK);
                        self.set_color(sib, RED);
                        self.rotate_left(sib);
                        sib = self.left(self.parent(x));
                    }
                    let xp = self.parent(x);
                    let xp_color = self.color(xp);
                    self.set_color(sib, xp_color);
                    self.set_color(xp, BLACK);
                    let sl = self.left(sib);
                    self.set_color(sl, BLACK);
                    self.rotate_right(xp);
                    x = self.root();
                }
            }
        }

        self.set_color(x, BLACK);
    }
}
