/// Sentinel value indicating "no slot" (null pointer equivalent).
const NIL: u32 = u32::MAX;

/// Generation-checked reference to an arena slot.
///
/// A handle stays valid until its node is removed. Once the slot is reused
/// the generation no longer matches, so a stale handle can never reach the
/// new occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

struct Node<T> {
    value: T,
    prev: u32,
    next: u32,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Arena-allocated doubly-linked list.
///
/// Nodes are stored in a `Vec` of slots and `u32` indices serve as pointers.
/// A free-list tracks reclaimed slots for O(1) allocation. New nodes are
/// linked at the head, so walking from the tail visits nodes oldest first.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> Arena<T> {
    /// Create an arena with room for `capacity` nodes before it has to grow.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Number of active (occupied) nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest node, if any.
    pub fn tail(&self) -> Option<Handle> {
        self.handle_at(self.tail)
    }

    pub fn head(&self) -> Option<Handle> {
        self.handle_at(self.head)
    }

    /// The node inserted just after `handle` (one step toward the head).
    pub fn prev(&self, handle: Handle) -> Option<Handle> {
        let node = self.node(handle)?;
        self.handle_at(node.prev)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.node(handle).is_some()
    }

    #[inline]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.node(handle).map(|n| &n.value)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_mut().map(|n| &mut n.value)
    }

    /// Allocate a node and link it at the head of the list.
    pub fn push_head(&mut self, value: T) -> Handle {
        let node = Node {
            value,
            prev: NIL,
            next: self.head,
        };

        let index = match self.free_list.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                debug_assert!(index != NIL, "arena index space exhausted");
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                index
            }
        };

        if let Some(old_head) = self.node_at_mut(self.head) {
            old_head.prev = index;
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }

        self.len += 1;
        Handle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Unlink a node and return its value. The slot is reclaimed and its
    /// generation bumped. Stale handles return `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        match self.node_at_mut(node.prev) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match self.node_at_mut(node.next) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }

        self.free_list.push(handle.index);
        self.len -= 1;
        Some(node.value)
    }

    /// Remove the oldest node and return it.
    pub fn pop_tail(&mut self) -> Option<T> {
        let handle = self.tail()?;
        self.remove(handle)
    }

    /// Remove every node, yielding values oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(value) = self.pop_tail() {
            out.push(value);
        }
        out
    }

    /// Remove the nodes matching `pred`, yielding them oldest first.
    pub fn drain_filter<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut out = Vec::new();
        let mut cursor = self.tail();
        while let Some(handle) = cursor {
            cursor = self.prev(handle);
            if self.get(handle).map(&mut pred).unwrap_or(false) {
                if let Some(value) = self.remove(handle) {
                    out.push(value);
                }
            }
        }
        out
    }

    /// Iterate values oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            let node = self.node_at(cursor)?;
            cursor = node.prev;
            Some(&node.value)
        })
    }

    fn node(&self, handle: Handle) -> Option<&Node<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_at(&self, index: u32) -> Option<&Node<T>> {
        if index == NIL {
            return None;
        }
        self.slots.get(index as usize).and_then(|s| s.node.as_ref())
    }

    fn node_at_mut(&mut self, index: u32) -> Option<&mut Node<T>> {
        if index == NIL {
            return None;
        }
        self.slots.get_mut(index as usize).and_then(|s| s.node.as_mut())
    }

    fn handle_at(&self, index: u32) -> Option<Handle> {
        let slot = self.slots.get(index as usize)?;
        slot.node.as_ref().map(|_| Handle {
            index,
            generation: slot.generation,
        })
    }
}
