//! Error types for amflux.
//!
//! Only configuration and construction problems surface as `Err` values.
//! Violated runtime invariants (oversized messages, out-of-range
//! destinations, wrong-core delivery) indicate corrupted distributed state
//! and abort via `panic!`/`assert!` instead.

/// Aggregation layer errors.
#[derive(Debug)]
pub enum Error {
    /// Buffer capacity is too small to hold even a single record header.
    BufferCapacityTooSmall { capacity: usize, min: usize },
    /// Requested fill target exceeds the fixed network buffer capacity.
    TargetSizeTooLarge { target_size: usize, max: usize },
    /// Topology must have at least one locale and one core per locale.
    EmptyTopology,
    /// A locale id was out of range for the configured topology.
    LocaleOutOfRange { locale: usize, locales: usize },
    /// The free buffer pool must hold at least one buffer.
    EmptyBufferPool,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BufferCapacityTooSmall { capacity, min } => {
                write!(f, "buffer capacity {} below minimum {}", capacity, min)
            }
            Error::TargetSizeTooLarge { target_size, max } => {
                write!(f, "target size {} exceeds buffer capacity {}", target_size, max)
            }
            Error::EmptyTopology => write!(f, "topology has no locales or no cores"),
            Error::LocaleOutOfRange { locale, locales } => {
                write!(f, "locale {} out of range ({} locales)", locale, locales)
            }
            Error::EmptyBufferPool => write!(f, "free buffer pool size must be nonzero"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for amflux operations.
pub type Result<T> = std::result::Result<T, Error>;
