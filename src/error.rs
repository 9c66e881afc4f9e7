//! Error taxonomy shared by every container.

use std::ops::Range;
use thiserror::Error;

/// Errors the pool/transaction surface can signal.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The referenced object does not live inside any known pool.
    #[error("object is not located inside a pool")]
    Pool,

    /// A transactional API was used outside (or inside) the wrong
    /// transaction context, e.g. `run` called while an accessor is held.
    #[error("transaction API misused: {0}")]
    TransactionScope(&'static str),

    /// A transactional allocation failed; the enclosing transaction rolls
    /// back in full.
    #[error("transactional allocation failed")]
    TransactionAlloc,

    /// A transactional free failed; the enclosing transaction rolls back
    /// in full.
    #[error("transactional free failed")]
    TransactionFree,

    /// On-disk layout does not match what this build understands.
    #[error("incompatible on-disk layout: incompat bits 0x{0:x}")]
    Layout(u32),

    /// A percentage/index argument fell outside its valid range.
    #[error("value {value} out of range {range:?}")]
    OutOfRange { value: i64, range: Range<i64> },

    /// A `reserve`-style request exceeded an implementation maximum.
    #[error("requested length {requested} exceeds maximum {max}")]
    Length { requested: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, CoreError>;
