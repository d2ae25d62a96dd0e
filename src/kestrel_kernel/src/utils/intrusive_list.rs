//! Minimal intrusive doubly-linked lists over `'static` elements.
//!
//! The list head and the per-element links live in lock-protected cells owned
//! by the caller. The [`CellList`] trait abstracts over how those cells are
//! reached, so the same operations serve both the ready queues and the wait
//! queues.
use super::Init;

/// The head of a list.
pub(crate) struct ListHead<T: 'static> {
    pub first: Option<&'static T>,
    pub last: Option<&'static T>,
}

impl<T: 'static> Clone for ListHead<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: 'static> Copy for ListHead<T> {}

impl<T: 'static> Init for ListHead<T> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<T: 'static> ListHead<T> {
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// The neighbors of a linked element. An element with no `Link` is not in any
/// list.
pub(crate) struct Link<T: 'static> {
    pub prev: Option<&'static T>,
    pub next: Option<&'static T>,
}

impl<T: 'static> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: 'static> Copy for Link<T> {}

/// Mediates access to the head and link cells of one particular list.
///
/// All methods are expected to be cheap cell reads/writes performed under
/// whatever lock protects the cells.
pub(crate) trait CellList {
    type Elem: 'static;

    fn head(&self) -> ListHead<Self::Elem>;
    fn set_head(&mut self, head: ListHead<Self::Elem>);
    fn link(&self, elem: &Self::Elem) -> Option<Link<Self::Elem>>;
    fn set_link(&mut self, elem: &Self::Elem, link: Option<Link<Self::Elem>>);
}

/// Insert `elem` at the back.
///
/// `elem` must not be in any list that shares its link cell.
pub(crate) fn push_back<L: CellList>(l: &mut L, elem: &'static L::Elem) {
    debug_assert!(l.link(elem).is_none());
    let mut head = l.head();
    if let Some(last) = head.last {
        let mut last_link = l.link(last).unwrap();
        last_link.next = Some(elem);
        l.set_link(last, Some(last_link));
        l.set_link(
            elem,
            Some(Link {
                prev: Some(last),
                next: None,
            }),
        );
        head.last = Some(elem);
    } else {
        l.set_link(
            elem,
            Some(Link {
                prev: None,
                next: None,
            }),
        );
        head.first = Some(elem);
        head.last = Some(elem);
    }
    l.set_head(head);
}

/// Insert `elem` at the front.
pub(crate) fn push_front<L: CellList>(l: &mut L, elem: &'static L::Elem) {
    debug_assert!(l.link(elem).is_none());
    let mut head = l.head();
    if let Some(first) = head.first {
        let mut first_link = l.link(first).unwrap();
        first_link.prev = Some(elem);
        l.set_link(first, Some(first_link));
        l.set_link(
            elem,
            Some(Link {
                prev: None,
                next: Some(first),
            }),
        );
        head.first = Some(elem);
    } else {
        l.set_link(
            elem,
            Some(Link {
                prev: None,
                next: None,
            }),
        );
        head.first = Some(elem);
        head.last = Some(elem);
    }
    l.set_head(head);
}

/// Insert `elem` right before `pos`. `pos == None` inserts at the back.
pub(crate) fn insert_before<L: CellList>(
    l: &mut L,
    elem: &'static L::Elem,
    pos: Option<&'static L::Elem>,
) {
    let pos = if let Some(pos) = pos {
        pos
    } else {
        push_back(l, elem);
        return;
    };

    debug_assert!(l.link(elem).is_none());
    let mut pos_link = l.link(pos).unwrap();
    if let Some(prev) = pos_link.prev {
        let mut prev_link = l.link(prev).unwrap();
        prev_link.next = Some(elem);
        l.set_link(prev, Some(prev_link));
    } else {
        let mut head = l.head();
        head.first = Some(elem);
        l.set_head(head);
    }
    l.set_link(
        elem,
        Some(Link {
            prev: pos_link.prev,
            next: Some(pos),
        }),
    );
    pos_link.prev = Some(elem);
    l.set_link(pos, Some(pos_link));
}

/// Unlink `elem`. `elem` must be in this list.
pub(crate) fn remove<L: CellList>(l: &mut L, elem: &'static L::Elem) {
    // The element is linked; this is the caller's invariant
    let link = l.link(elem).unwrap();
    let mut head = l.head();

    if let Some(prev) = link.prev {
        let mut prev_link = l.link(prev).unwrap();
        prev_link.next = link.next;
        l.set_link(prev, Some(prev_link));
    } else {
        head.first = link.next;
    }

    if let Some(next) = link.next {
        let mut next_link = l.link(next).unwrap();
        next_link.prev = link.prev;
        l.set_link(next, Some(next_link));
    } else {
        head.last = link.prev;
    }

    l.set_head(head);
    l.set_link(elem, None);
}

/// Unlink and return the first element.
pub(crate) fn pop_front<L: CellList>(l: &mut L) -> Option<&'static L::Elem> {
    let first = l.head().first?;
    remove(l, first);
    Some(first)
}
