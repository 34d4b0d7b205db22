//! tcpam -- TCP active-message transport engine for the Strand Protocol stack.
//!
//! Carries id-tagged messages over non-blocking TCP byte streams:
//! - **Framing**: `[am_id][length][payload]`, reassembled across partial reads
//! - **Sends**: short, buffered-copy and zero-copy, with a pending queue for
//!   operations that found no transmit capacity
//! - **Connection duality**: one socket may carry TX, RX or both, tracked by
//!   per-endpoint capability bits and a per-peer connection index
//!
//! The engine is poll-driven: a [`TcpIface`] owns its endpoints and is
//! advanced by readiness events and an explicit progress call.

pub mod buffer;
pub mod caps;
pub mod cm;
pub mod config;
pub mod deferred;
pub mod endpoint;
pub mod ep;
pub mod error;
pub mod events;
pub mod frame;
pub mod iface;
pub mod pending;
pub mod sock;
pub mod sockcm;
pub mod state;
mod zcopy;

// Re-export key public types at crate root.
pub use caps::{CtxCaps, CtxType};
pub use cm::{CmEvent, ConnIndex, ConnManager, HandshakeCm, PacketOutcome};
pub use config::{IfaceConfig, SendLimits};
pub use endpoint::{Completion, Endpoint, SendStatus};
pub use ep::{EpHandle, EpId, TcpEp};
pub use error::{Result, TcpAmError};
pub use events::{EventSet, Events, MioEventSet};
pub use frame::{AmHeader, Frame};
pub use iface::{FailureNotifier, IfaceResources, TcpIface};
pub use pending::PendingOp;
pub use sock::{Connector, MioConnector, Socket};
pub use sockcm::{SockCmEp, SockCmHandle, SockCmState};
pub use state::ConnState;
