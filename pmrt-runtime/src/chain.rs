//! Handler chains in locked memory
//!
//! Interrupt and exception dispatch walk their handler chains on an
//! interrupt stack, so every node lives in the locked heap. Chains are only
//! modified with interrupts masked. The scheduler uses the same lists for
//! its thread ring and for deferred calls queued from interrupt context.

use alloc::sync::Arc;

use pmrt_api::{Error, Result};
use pmrt_memory::{LockedBox, LockedHeap};

struct Node<T> {
    value: T,
    next: Option<LockedBox<Node<T>>>,
}

pub struct HandlerChain<T> {
    head: Option<LockedBox<Node<T>>>,
    len: usize,
}

impl<T> HandlerChain<T> {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&mut self, index: usize) -> Option<&mut Option<LockedBox<Node<T>>>> {
        let mut cursor = &mut self.head;
        for _ in 0..index {
            cursor = &mut cursor.as_mut()?.next;
        }
        Some(cursor)
    }

    /// Appends `value`; it runs after every existing entry
    pub fn push_back(&mut self, heap: &Arc<LockedHeap>, value: T) -> Result<()> {
        let node = LockedBox::new(heap, Node { value, next: None })?;
        let slot = self.slot(self.len).ok_or(Error::InvalidState("handler chain corrupted"))?;
        *slot = Some(node);
        self.len += 1;
        Ok(())
    }

    /// Prepends `value`; it runs before every existing entry
    pub fn push_front(&mut self, heap: &Arc<LockedHeap>, value: T) -> Result<()> {
        let next = self.head.take();
        self.head = Some(LockedBox::new(heap, Node { value, next })?);
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let node = LockedBox::into_inner(self.head.take()?);
        self.head = node.next;
        self.len -= 1;
        Some(node.value)
    }

    /// Unlinks and returns the first entry matching `pred`
    pub fn remove_where(&mut self, pred: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.iter().position(pred)?;
        let slot = self.slot(index)?;
        let node = LockedBox::into_inner(slot.take()?);
        *slot = node.next;
        self.len -= 1;
        Some(node.value)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { next: self.head.as_deref() }
    }
}

impl<T> Default for HandlerChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    next: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use pmrt_api::sim::SimulatedHost;

    #[test]
    fn test_order_and_removal() {
        let heap = Arc::new(LockedHeap::new(Arc::new(SimulatedHost::new())));
        let mut chain = HandlerChain::new();
        chain.push_back(&heap, 2).unwrap();
        chain.push_back(&heap, 3).unwrap();
        chain.push_front(&heap, 1).unwrap();
        assert_eq!(chain.iter().copied().collect::<Vec<_>>(), [1, 2, 3]);

        assert_eq!(chain.remove_where(|v| *v == 2), Some(2));
        assert_eq!(chain.remove_where(|v| *v == 7), None);
        assert_eq!(chain.iter().copied().collect::<Vec<_>>(), [1, 3]);
        assert_eq!(chain.remove_where(|v| *v == 1), Some(1));
        assert_eq!(chain.pop_front(), Some(3));
        assert_eq!(chain.pop_front(), None);
        assert!(chain.is_empty());
        assert_eq!(heap.stats().in_use, 0);
    }
}
