//! Singly linked list of heap-allocated nodes, generic over the element
//! type. Used wherever the kernel needs an ordered, growable set: the
//! runqueue (of pids), the all-tasks list, and a task's memory sections.
//!
//! Each `Node<T>` owns its `data` and is allocated individually on the
//! kernel heap (`heap.rs`) the moment it's pushed, rather than the duck-typed
//! `void*` payload the original container carried — one instantiation per
//! element type in place of one re-implementation per use site.

use alloc::boxed::Box;

struct Node<T> {
    data: T,
    next: *mut Node<T>,
}

pub struct List<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    len: usize,
}

unsafe impl<T: Send> Send for List<T> {}

impl<T> List<T> {
    pub const fn new() -> Self {
        List {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_head(&mut self, data: T) {
        let node = Box::into_raw(Box::new(Node {
            data,
            next: self.head,
        }));
        self.head = node;
        if self.tail.is_null() {
            self.tail = node;
        }
        self.len += 1;
    }

    pub fn push_tail(&mut self, data: T) {
        let node = Box::into_raw(Box::new(Node {
            data,
            next: core::ptr::null_mut(),
        }));
        if self.tail.is_null() {
            self.head = node;
        } else {
            unsafe {
                (*self.tail).next = node;
            }
        }
        self.tail = node;
        self.len += 1;
    }

    /// Remove and return the head element, freeing its node.
    pub fn pop_head(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        if self.head.is_null() {
            self.tail = core::ptr::null_mut();
        }
        self.len -= 1;
        Some(node.data)
    }

    /// Detach the head element without invoking any extra teardown beyond
    /// unlinking it — used by the scheduler to discard runqueue entries for
    /// tasks that changed state after being queued (see `scheduler::yield_`),
    /// where the node carries nothing but a pid and there is nothing else to
    /// release.
    pub fn pop_head_without_free(&mut self) -> Option<T> {
        self.pop_head()
    }

    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        let mut cursor = self.head;
        while !cursor.is_null() {
            unsafe {
                f(&(*cursor).data);
                cursor = (*cursor).next;
            }
        }
    }

    pub fn for_each_mut<F: FnMut(&mut T)>(&mut self, mut f: F) {
        let mut cursor = self.head;
        while !cursor.is_null() {
            unsafe {
                f(&mut (*cursor).data);
                cursor = (*cursor).next;
            }
        }
    }
}

impl<T: PartialEq> List<T> {
    /// Remove the first node whose data equals `data`. Returns whether
    /// anything was removed.
    pub fn remove_by_data(&mut self, data: &T) -> bool {
        let mut cursor = &mut self.head as *mut *mut Node<T>;
        loop {
            let node = unsafe { *cursor };
            if node.is_null() {
                return false;
            }
            if unsafe { &(*node).data } == data {
                let next = unsafe { (*node).next };
                unsafe {
                    *cursor = next;
                }
                if node == self.tail {
                    self.tail = self.find_tail();
                }
                unsafe {
                    drop(Box::from_raw(node));
                }
                self.len -= 1;
                return true;
            }
            cursor = unsafe { &mut (*node).next as *mut *mut Node<T> };
        }
    }

    fn find_tail(&self) -> *mut Node<T> {
        let mut cursor = self.head;
        if cursor.is_null() {
            return core::ptr::null_mut();
        }
        unsafe {
            while !(*cursor).next.is_null() {
                cursor = (*cursor).next;
            }
        }
        cursor
    }
}

impl<T> Drop for List<T> {
    fn drop(&mut self) {
        while self.pop_head().is_some() {}
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_list_is_empty() {
        let list: List<u32> = List::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn push_tail_preserves_order() {
        let mut list = List::new();
        list.push_tail(1);
        list.push_tail(2);
        list.push_tail(3);
        let mut seen = alloc::vec::Vec::new();
        list.for_each(|v| seen.push(*v));
        assert_eq!(seen, alloc::vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn push_head_reverses_order() {
        let mut list = List::new();
        list.push_head(1);
        list.push_head(2);
        list.push_head(3);
        let mut seen = alloc::vec::Vec::new();
        list.for_each(|v| seen.push(*v));
        assert_eq!(seen, alloc::vec![3, 2, 1]);
    }

    #[test]
    fn pop_head_drains_in_order_then_empties() {
        let mut list = List::new();
        list.push_tail('a');
        list.push_tail('b');
        assert_eq!(list.pop_head(), Some('a'));
        assert_eq!(list.pop_head(), Some('b'));
        assert_eq!(list.pop_head(), None);
        assert!(list.is_empty());
        // tail must have been reset too, or a push after draining would
        // append onto a dangling node.
        list.push_tail('c');
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn for_each_mut_updates_in_place() {
        let mut list = List::new();
        list.push_tail(1);
        list.push_tail(2);
        list.push_tail(3);
        list.for_each_mut(|v| *v *= 10);
        let mut seen = alloc::vec::Vec::new();
        list.for_each(|v| seen.push(*v));
        assert_eq!(seen, alloc::vec![10, 20, 30]);
    }

    #[test]
    fn remove_by_data_unlinks_matching_node() {
        let mut list = List::new();
        list.push_tail(1);
        list.push_tail(2);
        list.push_tail(3);
        assert!(list.remove_by_data(&2));
        let mut seen = alloc::vec::Vec::new();
        list.for_each(|v| seen.push(*v));
        assert_eq!(seen, alloc::vec![1, 3]);
        assert_eq!(list.len(), 2);
        assert!(!list.remove_by_data(&42));
    }

    #[test]
    fn remove_by_data_of_tail_updates_tail() {
        let mut list = List::new();
        list.push_tail(1);
        list.push_tail(2);
        assert!(list.remove_by_data(&2));
        // pushing again must land after the new tail (1), not corrupt it.
        list.push_tail(3);
        let mut seen = alloc::vec::Vec::new();
        list.for_each(|v| seen.push(*v));
        assert_eq!(seen, alloc::vec![1, 3]);
    }

    #[test]
    fn drop_runs_without_leaking_or_crashing() {
        let mut list = List::new();
        for i in 0..100 {
            list.push_tail(i);
        }
        drop(list);
    }
}
