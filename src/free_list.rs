//! The doubly-linked, address-ordered list of free chunks.
//!
//! Unlike `slitter`'s lock-free `MagazineStack`, this list is only ever
//! touched with the single global heap mutex held, so the links are plain
//! reads and writes through `ChunkRef` rather than atomics.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use crate::chunk::ChunkRef;

#[derive(Default)]
pub(crate) struct FreeList {
    head: Option<ChunkRef>,
}

impl FreeList {
    pub(crate) fn head(&self) -> Option<ChunkRef> {
        self.head
    }

    /// First-fit scan: the first free chunk whose size is at least `size`.
    pub(crate) fn find_fit(&self, size: usize) -> Option<ChunkRef> {
        let mut cursor = self.head;

        while let Some(chunk) = cursor {
            if chunk.size() >= size {
                return Some(chunk);
            }
            cursor = chunk.next_link();
        }

        None
    }

    /// Inserts `item` at its address-sorted position. A no-op if `item`'s
    /// address is already present, which must never happen under correct
    /// invariants.
    #[requires(item.prev_link().is_none() && item.next_link().is_none(),
               "item must not already be linked")]
    pub(crate) fn insert(&mut self, item: ChunkRef) {
        let head = match self.head {
            None => {
                item.set_prev_link(None);
                item.set_next_link(None);
                self.head = Some(item);
                return;
            }
            Some(head) => head,
        };

        if item.addr() < head.addr() {
            item.set_prev_link(None);
            item.set_next_link(Some(head));
            head.set_prev_link(Some(item));
            self.head = Some(item);
            return;
        }

        let mut front = head;
        while let Some(next) = front.next_link() {
            if next.addr() > item.addr() {
                break;
            }
            front = next;
        }

        if let Some(next) = front.next_link() {
            if next.addr() == item.addr() {
                return;
            }
        }

        let next = front.next_link();
        item.set_prev_link(Some(front));
        item.set_next_link(next);
        front.set_next_link(Some(item));
        if let Some(next) = next {
            next.set_prev_link(Some(item));
        }
    }

    /// Unlinks `item`, which must currently be a member of this list.
    pub(crate) fn remove(&mut self, item: ChunkRef) {
        let prev = item.prev_link();
        let next = item.next_link();

        match prev {
            Some(prev) => prev.set_next_link(next),
            None => self.head = next,
        }

        if let Some(next) = next {
            next.set_prev_link(prev);
        }

        item.set_prev_link(None);
        item.set_next_link(None);
    }
}
