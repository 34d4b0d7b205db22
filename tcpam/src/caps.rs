//! Per-direction endpoint capabilities.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// One direction (or the zero-copy marker) an endpoint can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CtxType {
    Tx = 0,
    Rx = 1,
    /// Set only while a zero-copy send is in flight.
    ZcopyTx = 2,
}

impl fmt::Display for CtxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtxType::Tx => write!(f, "Tx"),
            CtxType::Rx => write!(f, "Rx"),
            CtxType::ZcopyTx => write!(f, "ZcopyTx"),
        }
    }
}

/// Bitset of [`CtxType`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CtxCaps(u8);

impl CtxCaps {
    pub const NONE: Self = Self(0);
    pub const TX: Self = Self::of(CtxType::Tx);
    pub const RX: Self = Self::of(CtxType::Rx);
    pub const ZCOPY_TX: Self = Self::of(CtxType::ZcopyTx);
    pub const DUPLEX: Self = Self(Self::TX.0 | Self::RX.0);

    pub const fn of(ctx: CtxType) -> Self {
        Self(1 << ctx as u8)
    }

    pub fn has(self, ctx: CtxType) -> bool {
        self.contains(Self::of(ctx))
    }

    pub fn contains(self, other: CtxCaps) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn with(self, ctx: CtxType) -> Self {
        Self(self.0 | Self::of(ctx).0)
    }

    pub fn without(self, ctx: CtxType) -> Self {
        Self(self.0 & !Self::of(ctx).0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The TX/RX bits only.
    pub fn directions(self) -> Self {
        Self(self.0 & Self::DUPLEX.0)
    }

    /// Both TX and RX are held.
    pub fn is_duplex(self) -> bool {
        self.contains(Self::DUPLEX)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for CtxCaps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CtxCaps {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Renders as `[Tx:Rx]`, with `-` for a missing direction.
impl fmt::Display for CtxCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tx = if self.has(CtxType::Tx) { "Tx" } else { "-" };
        let rx = if self.has(CtxType::Rx) { "Rx" } else { "-" };
        write!(f, "[{tx}:{rx}]")
    }
}
