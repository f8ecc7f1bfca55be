//! Readiness-event types
//!
//! An `Event` is one direction of interest on a descriptor; an `EventSet`
//! is the registered mask for a descriptor. The bit values match the
//! kernel's `EPOLLIN`/`EPOLLOUT` so a mask ORs directly into an epoll
//! registration without translation.

use core::fmt;

/// `EPOLLIN`
const READ_BIT: u32 = 0x001;
/// `EPOLLOUT`
const WRITE_BIT: u32 = 0x004;

/// One direction of readiness interest on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Readable (EPOLLIN).
    Read,
    /// Writable (EPOLLOUT).
    Write,
}

impl Event {
    /// The epoll bit for this event.
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Event::Read => READ_BIT,
            Event::Write => WRITE_BIT,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Read => write!(f, "READ"),
            Event::Write => write!(f, "WRITE"),
        }
    }
}

/// Registered event mask for one descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u32);

impl EventSet {
    /// The empty mask.
    pub const NONE: EventSet = EventSet(0);
    /// Read interest only.
    pub const READ: EventSet = EventSet(READ_BIT);
    /// Write interest only.
    pub const WRITE: EventSet = EventSet(WRITE_BIT);

    /// Build a mask from raw epoll bits, keeping only READ/WRITE.
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        EventSet(bits & (READ_BIT | WRITE_BIT))
    }

    /// The raw epoll bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, event: Event) -> bool {
        self.0 & event.bits() != 0
    }

    #[inline]
    pub fn insert(&mut self, event: Event) {
        self.0 |= event.bits();
    }

    #[inline]
    pub fn remove(&mut self, event: Event) {
        self.0 &= !event.bits();
    }

    /// Mask intersection.
    #[inline]
    pub const fn intersection(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }

    /// Events in `self` but not in `other`.
    #[inline]
    pub const fn difference(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    /// Number of events in the mask (0, 1, or 2).
    #[inline]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate the individual events in the mask.
    pub fn iter(self) -> impl Iterator<Item = Event> {
        [Event::Read, Event::Write]
            .into_iter()
            .filter(move |e| self.contains(*e))
    }
}

impl From<Event> for EventSet {
    #[inline]
    fn from(e: Event) -> Self {
        EventSet(e.bits())
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventSet({})", self)
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "0");
        }
        let mut first = true;
        for e in self.iter() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", e)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_match_epoll() {
        assert_eq!(Event::Read.bits(), 0x001);
        assert_eq!(Event::Write.bits(), 0x004);
    }

    #[test]
    fn test_set_ops() {
        let mut set = EventSet::NONE;
        assert!(set.is_empty());

        set.insert(Event::Read);
        assert!(set.contains(Event::Read));
        assert!(!set.contains(Event::Write));
        assert_eq!(set.len(), 1);

        set.insert(Event::Write);
        assert_eq!(set.len(), 2);

        set.remove(Event::Read);
        assert!(!set.contains(Event::Read));
        assert!(set.contains(Event::Write));
    }

    #[test]
    fn test_difference_and_intersection() {
        let mut both = EventSet::NONE;
        both.insert(Event::Read);
        both.insert(Event::Write);

        let read: EventSet = Event::Read.into();
        assert_eq!(both.difference(read), EventSet::WRITE);
        assert_eq!(both.intersection(read), EventSet::READ);
    }

    #[test]
    fn test_display() {
        let mut set = EventSet::NONE;
        assert_eq!(format!("{}", set), "0");
        set.insert(Event::Read);
        set.insert(Event::Write);
        assert_eq!(format!("{}", set), "READ|WRITE");
    }
}
