//! Error types for entry-guards-rs.
//!
//! This module defines the [`enum@Error`] enum covering every failure the guard
//! subsystem can surface. Per-guard connection failures are *not* errors: they
//! drive state-machine transitions and are recovered locally.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── DuplicateGuard     ◄── Store invariant violation on add
//!   ├── NoEligibleGuards   ◄── Sampler pool empty under constraints
//!   ├── NoUsableGuard      ◄── Every selection state exhausted for a session
//!   ├── StoreCorrupt       ◄── Persisted guard state unreadable
//!   ├── Consensus          ◄── Malformed consensus input
//!   ├── Cancelled          ◄── Session cancelled between attempts
//!   ├── Io                 ◄── File I/O failures
//!   └── Config             ◄── Invalid configuration
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Recommended Action |
//! |-------|-------------|--------------------|
//! | [`DuplicateGuard`](Error::DuplicateGuard) | No | Programmer error, fix the caller |
//! | [`NoEligibleGuards`](Error::NoEligibleGuards) | Yes | Relax constraints or wait for a new consensus |
//! | [`NoUsableGuard`](Error::NoUsableGuard) | Yes | Retry the session later |
//! | [`StoreCorrupt`](Error::StoreCorrupt) | No | Operator must inspect the state file |
//! | [`Consensus`](Error::Consensus) | Yes | Wait for a well-formed consensus |
//! | [`Cancelled`](Error::Cancelled) | Yes | Start a new session if still wanted |
//! | [`Io`](Error::Io) | Sometimes | Check permissions, disk space |
//! | [`Config`](Error::Config) | No | Fix configuration file |
//!
//! # Example
//!
//! ```rust
//! use entry_guards_rs::Error;
//!
//! fn is_session_retryable(err: &Error) -> bool {
//!     matches!(err, Error::NoUsableGuard | Error::NoEligibleGuards | Error::Cancelled)
//! }
//!
//! assert!(is_session_retryable(&Error::NoUsableGuard));
//! assert!(!is_session_retryable(&Error::StoreCorrupt("truncated".into())));
//! ```

use thiserror::Error;

/// Errors that can occur during guard selection and persistence.
#[derive(Debug, Error)]
pub enum Error {
    /// A guard with this fingerprint is already in the store.
    ///
    /// The store holds each fingerprint at most once; hitting this means a
    /// caller skipped the exclusion check before inserting.
    #[error("guard {0} is already in the guard store")]
    DuplicateGuard(String),

    /// The sampler found no candidate under the current constraints.
    ///
    /// # Recovery
    ///
    /// Callers walk the relaxation ladder in
    /// [`node_selection`](crate::node_selection); this is only surfaced once
    /// every rung has been tried.
    #[error("no eligible guards remain under the current constraints")]
    NoEligibleGuards,

    /// Every selection state was exhausted for one circuit-build session.
    ///
    /// Fatal for that session only. A later session may succeed once network
    /// conditions change.
    #[error("no usable guard: all selection states exhausted")]
    NoUsableGuard,

    /// The persisted guard state could not be parsed or validated.
    ///
    /// # Recovery
    ///
    /// None automatic. Resetting the state would discard the primary guard
    /// ordering, so startup halts until an operator intervenes.
    #[error("guard state file is corrupt: {0}")]
    StoreCorrupt(String),

    /// The consensus input is malformed.
    ///
    /// A refresh that fails with this error leaves both the consensus view and
    /// the guard store untouched.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// The session was cancelled between connection attempts.
    #[error("circuit build session cancelled")]
    Cancelled,

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for entry-guards-rs operations.
pub type Result<T> = std::result::Result<T, Error>;
