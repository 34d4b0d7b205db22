use thiserror::Error;

/// All errors produced by the TCP active-message transport.
#[derive(Debug, Error)]
pub enum TcpAmError {
    #[error("no transmit resources available")]
    NoResource,

    #[error("transmit resources are available, send directly instead of queueing")]
    Busy,

    #[error("destination is unreachable")]
    Unreachable,

    #[error("operation canceled")]
    Canceled,

    #[error("operation is not supported by this endpoint")]
    Unsupported,

    #[error("invalid active message id: {0}")]
    InvalidAmId(u8),

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("header too large: {size} bytes exceeds maximum {max}")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("too many iov entries: {count} exceeds maximum {max}")]
    TooManyIov { count: usize, max: usize },

    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown control event: 0x{0:02x}")]
    UnknownControlEvent(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("endpoint {0} not found")]
    EndpointNotFound(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TcpAmError {
    /// Transient condition: retry later or queue a pending operation.
    pub fn is_no_resource(&self) -> bool {
        matches!(self, TcpAmError::NoResource | TcpAmError::Busy)
    }

    /// The caller violated a precondition; no I/O was attempted.
    pub fn is_invalid_param(&self) -> bool {
        matches!(
            self,
            TcpAmError::InvalidAmId(_)
                | TcpAmError::PayloadTooLarge { .. }
                | TcpAmError::HeaderTooLarge { .. }
                | TcpAmError::TooManyIov { .. }
                | TcpAmError::FrameTooShort { .. }
                | TcpAmError::InvalidConfig(_)
                | TcpAmError::Unsupported
        )
    }
}

pub type Result<T> = std::result::Result<T, TcpAmError>;
