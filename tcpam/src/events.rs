//! Readiness interest and the event-set abstraction.
//!
//! Endpoints never poll. They declare READ/WRITE interest on the owning
//! interface's [`EventSet`] and are driven by whoever waits on it.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Interest, Poll, Token};

use crate::ep::EpId;

/// Readiness bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Events(u8);

impl Events {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    pub const ALL: Self = Self(0x03);

    pub fn contains(self, other: Events) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn intersects(self, other: Events) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `self` with every bit of `other` cleared.
    pub fn difference(self, other: Events) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Events::READ) { 'r' } else { '-' };
        let w = if self.contains(Events::WRITE) { 'w' } else { '-' };
        write!(f, "{r}{w}")
    }
}

/// Readiness multiplexer consumed by the interface.
///
/// `add` registers a descriptor that has no interest yet, `modify` replaces the
/// interest of a registered descriptor and `remove` unregisters it. Callers
/// never pass an empty interest to `add` or `modify`.
pub trait EventSet: Send {
    fn add(&mut self, fd: RawFd, events: Events, token: EpId) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, events: Events, token: EpId) -> io::Result<()>;
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` and append ready `(token, events)` pairs to `out`.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(EpId, Events)>)
        -> io::Result<()>;
}

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// [`EventSet`] backed by `mio::Poll`.
pub struct MioEventSet {
    poll: Poll,
    events: mio::Events,
}

impl MioEventSet {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: mio::Events::with_capacity(capacity),
        })
    }

    fn interest(events: Events) -> io::Result<Interest> {
        match (events.contains(Events::READ), events.contains(Events::WRITE)) {
            (true, true) => Ok(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Ok(Interest::READABLE),
            (false, true) => Ok(Interest::WRITABLE),
            (false, false) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty readiness interest",
            )),
        }
    }
}

impl EventSet for MioEventSet {
    fn add(&mut self, fd: RawFd, events: Events, token: EpId) -> io::Result<()> {
        let interest = Self::interest(events)?;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token.0), interest)
    }

    fn modify(&mut self, fd: RawFd, events: Events, token: EpId) -> io::Result<()> {
        let interest = Self::interest(events)?;
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token.0), interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<(EpId, Events)>,
    ) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        for event in self.events.iter() {
            let Token(id) = event.token();
            let mut ready = Events::NONE;
            // errors and hang-ups surface through the next read or write
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ready |= Events::READ;
            }
            if event.is_writable() || event.is_write_closed() {
                ready |= Events::WRITE;
            }
            if !ready.is_empty() {
                out.push((EpId(id), ready));
            }
        }
        Ok(())
    }
}
