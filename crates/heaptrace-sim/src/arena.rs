//! Span storage and intrusive list membership.
//!
//! Spans are owned by a slab and addressed through stable [`SpanRef`]
//! handles. A span sits on at most one list at a time; instead of back
//! pointers it records *which* list holds it, and the lists link spans by
//! handle. Putting a span on two lists, or removing it through the wrong
//! one, is a model bug and aborts.

use std::fmt::Debug;

/// Stable handle to a span in a [`SpanArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SpanRef(u32);

/// Intrusive linkage embedded in every span.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Links<L> {
    prev: Option<SpanRef>,
    next: Option<SpanRef>,
    home: Option<L>,
}

impl<L> Default for Links<L> {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
            home: None,
        }
    }
}

impl<L: Copy> Links<L> {
    /// The list currently holding this span, if any.
    pub(crate) fn home(&self) -> Option<L> {
        self.home
    }

    /// The next span on the same list.
    pub(crate) fn next(&self) -> Option<SpanRef> {
        self.next
    }
}

/// A span type that embeds [`Links`].
pub(crate) trait Linked {
    /// Identifies the list slot a span can live on.
    type ListId: Copy + PartialEq + Debug;

    fn links(&self) -> &Links<Self::ListId>;
    fn links_mut(&mut self) -> &mut Links<Self::ListId>;
}

/// Slab of spans with stable handles and slot reuse.
pub(crate) struct SpanArena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> SpanArena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> SpanRef {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(value);
            SpanRef(idx)
        } else {
            self.slots.push(Some(value));
            SpanRef(u32::try_from(self.slots.len() - 1).expect("span arena overflow"))
        }
    }

    pub(crate) fn remove(&mut self, r: SpanRef) -> T {
        let value = self.slots[r.0 as usize].take().expect("span removed twice");
        self.free.push(r.0);
        value
    }

    pub(crate) fn get(&self, r: SpanRef) -> &T {
        self.slots[r.0 as usize].as_ref().expect("stale span handle")
    }

    pub(crate) fn get_mut(&mut self, r: SpanRef) -> &mut T {
        self.slots[r.0 as usize].as_mut().expect("stale span handle")
    }
}

/// A doubly-linked list of spans, identified by a list id that spans record
/// while they are members.
#[derive(Debug)]
pub(crate) struct SpanList<L> {
    first: Option<SpanRef>,
    last: Option<SpanRef>,
    id: L,
}

impl<L: Copy + PartialEq + Debug> SpanList<L> {
    pub(crate) const fn new(id: L) -> Self {
        Self {
            first: None,
            last: None,
            id,
        }
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub(crate) const fn first(&self) -> Option<SpanRef> {
        self.first
    }

    pub(crate) fn push_front<T>(&mut self, arena: &mut SpanArena<T>, r: SpanRef)
    where
        T: Linked<ListId = L>,
    {
        {
            let links = arena.get_mut(r).links_mut();
            assert!(links.home.is_none(), "span already on a list");
            links.home = Some(self.id);
            links.prev = None;
            links.next = self.first;
        }
        match self.first {
            Some(old) => arena.get_mut(old).links_mut().prev = Some(r),
            None => self.last = Some(r),
        }
        self.first = Some(r);
    }

    pub(crate) fn remove<T>(&mut self, arena: &mut SpanArena<T>, r: SpanRef)
    where
        T: Linked<ListId = L>,
    {
        let links = *arena.get(r).links();
        assert!(
            links.home == Some(self.id),
            "removing span from the wrong list: on {:?}, asked {:?}",
            links.home,
            self.id
        );
        match links.prev {
            Some(prev) => arena.get_mut(prev).links_mut().next = links.next,
            None => self.first = links.next,
        }
        match links.next {
            Some(next) => arena.get_mut(next).links_mut().prev = links.prev,
            None => self.last = links.prev,
        }
        let cleared = arena.get_mut(r).links_mut();
        cleared.prev = None;
        cleared.next = None;
        cleared.home = None;
    }

    /// Detach and return the span at the back of the list.
    pub(crate) fn pop_back<T>(&mut self, arena: &mut SpanArena<T>) -> Option<SpanRef>
    where
        T: Linked<ListId = L>,
    {
        let r = self.last?;
        self.remove(arena, r);
        Some(r)
    }

    /// Snapshot the member handles front to back, for walks that mutate
    /// the list as they go.
    pub(crate) fn refs<T>(&self, arena: &SpanArena<T>) -> Vec<SpanRef>
    where
        T: Linked<ListId = L>,
    {
        let mut out = Vec::new();
        let mut cur = self.first;
        while let Some(r) = cur {
            out.push(r);
            cur = arena.get(r).links().next;
        }
        out
    }
}
