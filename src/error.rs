/*
 * flowsession - concurrent TTL session map core
 *
 * error kinds returned by the control-plane-facing operations of this
 * crate (construction and resize). data-plane operations never fail
 * with a `Result` — they return a packed `Status` instead (see
 * `bucket::Status`), per the error handling design in the core spec.
 */

use core::fmt;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced to the control plane. Never returned from a
/// data-plane hot path operation.
#[derive(Debug)]
pub enum CoreError {
    /// A chunk (or the initial bucket array) could not be obtained from
    /// the allocator. The structure that raised this reverts to its
    /// empty-sentinel state; already-allocated chunks are freed first.
    AllocationFailed { requested_bytes: usize },
    /// `initial_kv_entries` (or a resize target) could not be turned
    /// into a valid power-of-two bucket count under the allocator's
    /// block ceiling.
    InvalidConfig(String),
}

impl CoreError {
    pub fn allocation_failed(requested_bytes: usize) -> Self {
        Self::AllocationFailed { requested_bytes }
    }
    pub fn invalid_config(why: impl ToString) -> Self {
        Self::InvalidConfig(why.to_string())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed { requested_bytes } => {
                write!(f, "allocator could not satisfy a {requested_bytes}-byte chunk request")
            }
            Self::InvalidConfig(why) => write!(f, "invalid configuration: {why}"),
        }
    }
}

impl std::error::Error for CoreError {}
