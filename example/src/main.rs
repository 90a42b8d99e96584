//! A quadtree of points, with every node and point bucket coming out of a
//! dedicated `cellar` state — the kind of pointer-heavy, uniform-node
//! workload the allocator is built for.

use cellar::{HandleFlags, State};
use std::ptr;

const BUCKET: usize = 8;

#[repr(C)]
struct Node {
    // Quadrant children; null for leaves.
    children: [*mut Node; 4],
    points: *mut (f32, f32),
    len: usize,
}

struct Tree<'a> {
    state: &'a State,
    root: *mut Node,
    nodes: usize,
}

impl<'a> Tree<'a> {
    fn new(state: &'a State) -> Tree<'a> {
        Tree {
            state,
            root: ptr::null_mut(),
            nodes: 0,
        }
    }

    fn new_node(&mut self) -> *mut Node {
        let node: *mut Node = cellar::alloc_items_in(self.state, 1, true);
        assert!(!node.is_null(), "out of memory");
        unsafe {
            (*node).points = cellar::alloc_items_in(self.state, BUCKET, false);
            assert!(!(*node).points.is_null(), "out of memory");
        }
        self.nodes += 1;
        node
    }

    fn insert(&mut self, x: f32, y: f32) {
        if self.root.is_null() {
            self.root = self.new_node();
        }

        let mut node = self.root;
        let (mut cx, mut cy, mut half) = (0.5f32, 0.5f32, 0.25f32);

        unsafe {
            loop {
                if (*node).len < BUCKET {
                    let slot = (*node).points.add((*node).len);
                    ptr::write(slot, (x, y));
                    (*node).len += 1;
                    return;
                }

                // Bucket full: descend into the point's quadrant, splitting
                // lazily.
                let quadrant = (x > cx) as usize | (((y > cy) as usize) << 1);
                if (*node).children[quadrant].is_null() {
                    (*node).children[quadrant] = self.new_node();
                }
                cx += if x > cx { half } else { -half };
                cy += if y > cy { half } else { -half };
                half *= 0.5;
                node = (*node).children[quadrant];
            }
        }
    }

    unsafe fn free_node(&mut self, node: *mut Node) {
        for i in 0..4 {
            let child = (*node).children[i];
            if !child.is_null() {
                self.free_node(child);
            }
        }
        cellar::free_items_in(self.state, (*node).points, BUCKET);
        cellar::free_items_in(self.state, node, 1);
        self.nodes -= 1;
    }

    fn clear(&mut self) {
        if !self.root.is_null() {
            unsafe { self.free_node(self.root) };
            self.root = ptr::null_mut();
        }
    }
}

fn main() {
    let raw = State::new(None).expect("cannot reserve an allocator state");
    let state = unsafe { &*raw.as_ptr() };

    // Node churn is the point of this demo; keep the node class's blocks
    // mapped across clears.
    let node_handle = state
        .handle_of(std::mem::size_of::<Node>())
        .expect("node class");
    node_handle.add_flags(HandleFlags::DO_NOT_FREE);

    let mut tree = Tree::new(state);

    for round in 0..8 {
        let mut x = 0.137f32;
        let mut y = 0.731f32;
        for _ in 0..100_000 {
            // A cheap deterministic scatter in the unit square.
            x = (x * 29.0 + 0.17) % 1.0;
            y = (y * 37.0 + 0.29) % 1.0;
            tree.insert(x, y);
        }

        println!(
            "round {}: {} nodes, node class holds {} blocks / {} live cells",
            round,
            tree.nodes,
            node_handle.block_count(),
            node_handle.live_cell_count(),
        );

        tree.clear();
        assert_eq!(tree.nodes, 0);
    }

    node_handle.del_flags(HandleFlags::DO_NOT_FREE);
    unsafe { State::destroy(raw) };
    println!("done");
}
