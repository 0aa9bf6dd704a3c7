//! Timer scheduler — indexed binary min-heap
//!
//! Pending scheduled tasks ordered by `(queue_id, trigger_time, id)`.
//! Every node stores its own slot index, kept current by the heap's swaps,
//! so an arbitrary node (a cancelled task) is removed in O(log n) without a
//! search and without leaving a ghost entry behind.
//!
//! Owned by exactly one loop and only touched from the loop thread.
//!
//! Author: Moroya Sakamoto

/// Slot index of a node that is not in any heap
pub const INDEX_NOT_IN_QUEUE: usize = usize::MAX;

/// Heap ordering key: shard, then trigger time, then insertion id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskKey {
    /// Logical timer queue the node belongs to
    pub queue_id: u32,
    /// Absolute trigger time (nanoseconds)
    pub trigger_time: i64,
    /// Monotonic id, tie-break for equal trigger times
    pub id: u64,
}

/// Element of a `Scheduler`
///
/// The slot index is a back-reference maintained by the heap; nodes never
/// set it themselves.
pub trait HeapNode {
    fn key(&self) -> TaskKey;
    fn queue_index(&self) -> usize;
    fn set_queue_index(&self, index: usize);
    /// Identity, not key equality
    fn is_same(&self, other: &Self) -> bool;
}

/// Indexed min-heap of timer nodes
pub struct Scheduler<N: HeapNode> {
    nodes: Vec<N>,
}

impl<N: HeapNode> Scheduler<N> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node that is not queued anywhere
    pub fn push(&mut self, node: N) {
        let index = self.nodes.len();
        node.set_queue_index(index);
        self.nodes.push(node);
        self.sift_up(index);
    }

    /// Earliest node
    pub fn peek(&self) -> Option<&N> {
        self.nodes.first()
    }

    /// Remove and return the earliest node
    pub fn pop(&mut self) -> Option<N> {
        if self.nodes.is_empty() {
            return None;
        }
        let top = self.nodes.swap_remove(0);
        top.set_queue_index(INDEX_NOT_IN_QUEUE);
        if !self.nodes.is_empty() {
            self.nodes[0].set_queue_index(0);
            self.sift_down(0);
        }
        Some(top)
    }

    /// Is `node` currently queued here?
    pub fn contains(&self, node: &N) -> bool {
        let index = node.queue_index();
        index < self.nodes.len() && self.nodes[index].is_same(node)
    }

    /// Remove `node` using its stored slot index
    ///
    /// Returns false when the node is not in this heap.
    pub fn remove(&mut self, node: &N) -> bool {
        if !self.contains(node) {
            return false;
        }
        let index = node.queue_index();
        let removed = self.nodes.swap_remove(index);
        removed.set_queue_index(INDEX_NOT_IN_QUEUE);
        if index < self.nodes.len() {
            self.nodes[index].set_queue_index(index);
            if index > 0 && self.nodes[index].key() < self.nodes[(index - 1) / 2].key() {
                self.sift_up(index);
            } else {
                self.sift_down(index);
            }
        }
        true
    }

    /// Remove every node, in no particular order
    pub fn drain(&mut self) -> Vec<N> {
        let nodes = std::mem::take(&mut self.nodes);
        for node in &nodes {
            node.set_queue_index(INDEX_NOT_IN_QUEUE);
        }
        nodes
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.nodes[a].set_queue_index(a);
        self.nodes[b].set_queue_index(b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.nodes[index].key() >= self.nodes[parent].key() {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.nodes.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let smallest = if right < len && self.nodes[right].key() < self.nodes[left].key() {
                right
            } else {
                left
            };
            if self.nodes[index].key() <= self.nodes[smallest].key() {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

impl<N: HeapNode> Default for Scheduler<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Node {
        key: TaskKey,
        index: Cell<usize>,
    }

    type NodeRef = Rc<Node>;

    impl HeapNode for NodeRef {
        fn key(&self) -> TaskKey {
            self.key
        }

        fn queue_index(&self) -> usize {
            self.index.get()
        }

        fn set_queue_index(&self, index: usize) {
            self.index.set(index);
        }

        fn is_same(&self, other: &Self) -> bool {
            Rc::ptr_eq(self, other)
        }
    }

    fn node(queue_id: u32, trigger_time: i64, id: u64) -> NodeRef {
        Rc::new(Node {
            key: TaskKey {
                queue_id,
                trigger_time,
                id,
            },
            index: Cell::new(INDEX_NOT_IN_QUEUE),
        })
    }

    fn drain_ids(sched: &mut Scheduler<NodeRef>) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(n) = sched.pop() {
            assert_eq!(n.queue_index(), INDEX_NOT_IN_QUEUE);
            ids.push(n.key.id);
        }
        ids
    }

    #[test]
    fn test_scheduler_empty() {
        let mut sched: Scheduler<NodeRef> = Scheduler::new();
        assert!(sched.is_empty());
        assert!(sched.peek().is_none());
        assert!(sched.pop().is_none());
    }

    #[test]
    fn test_earliest_first() {
        let mut sched = Scheduler::new();
        sched.push(node(0, 100, 1));
        sched.push(node(0, 50, 2));
        sched.push(node(0, 150, 3));
        assert_eq!(sched.peek().map(|n| n.key.id), Some(2));
        assert_eq!(drain_ids(&mut sched), vec![2, 1, 3]);
    }

    #[test]
    fn test_equal_trigger_times_keep_insertion_order() {
        let mut sched = Scheduler::new();
        for id in [5, 1, 4, 2, 3] {
            sched.push(node(0, 10, id));
        }
        assert_eq!(drain_ids(&mut sched), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_queue_id_is_primary_key() {
        let mut sched = Scheduler::new();
        sched.push(node(1, 0, 1));
        sched.push(node(0, 500, 2));
        assert_eq!(drain_ids(&mut sched), vec![2, 1]);
    }

    #[test]
    fn test_remove_middle() {
        let mut sched = Scheduler::new();
        let nodes: Vec<_> = (0..8).map(|i| node(0, i * 10, i as u64)).collect();
        for n in &nodes {
            sched.push(n.clone());
        }
        assert!(sched.remove(&nodes[3]));
        assert!(!sched.contains(&nodes[3]));
        assert_eq!(nodes[3].queue_index(), INDEX_NOT_IN_QUEUE);
        assert!(!sched.remove(&nodes[3]));
        assert_eq!(drain_ids(&mut sched), vec![0, 1, 2, 4, 5, 6, 7]);
    }

    #[test]
    fn test_remove_foreign_node() {
        let mut sched = Scheduler::new();
        sched.push(node(0, 1, 1));
        let stranger = node(0, 1, 1);
        stranger.set_queue_index(0);
        assert!(!sched.remove(&stranger));
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn test_drain_resets_indices() {
        let mut sched = Scheduler::new();
        let a = node(0, 1, 1);
        sched.push(a.clone());
        sched.push(node(0, 2, 2));
        assert_eq!(sched.drain().len(), 2);
        assert!(sched.is_empty());
        assert_eq!(a.queue_index(), INDEX_NOT_IN_QUEUE);
    }

    proptest! {
        #[test]
        fn prop_pop_order_is_sorted_after_removals(
            triggers in proptest::collection::vec(-50i64..50, 1..64),
            remove_mask in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let mut sched = Scheduler::new();
            let nodes: Vec<_> = triggers
                .iter()
                .enumerate()
                .map(|(id, t)| node(0, *t, id as u64))
                .collect();
            for n in &nodes {
                sched.push(n.clone());
            }
            let mut expected = Vec::new();
            for (n, remove) in nodes.iter().zip(remove_mask.iter()) {
                if *remove {
                    prop_assert!(sched.remove(n));
                } else {
                    expected.push(n.key);
                }
            }
            for (i, n) in nodes.iter().enumerate() {
                if sched.contains(n) {
                    prop_assert!(!remove_mask[i]);
                }
            }
            expected.sort();
            let mut popped = Vec::new();
            while let Some(n) = sched.pop() {
                popped.push(n.key);
            }
            prop_assert_eq!(popped, expected);
        }
    }
}
