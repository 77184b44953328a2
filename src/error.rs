//! Error types for the concurrent B+ tree.
//!
//! The tree itself never fails: point operations either succeed or report a
//! plain boolean/`Option` outcome, and contract violations (releasing a latch
//! that is not held, clearing a context with latches outstanding) are
//! asserted rather than returned.
//!
//! The one recoverable condition lives in the range iterator. Its latch
//! handoff onto the next leaf is a non-blocking try: a blocking acquisition
//! could deadlock against a writer that itself needs the iterator's current
//! leaf for a rebalance. When the try fails the iterator surfaces
//! [`Error::Contended`] and stays where it is; the caller decides whether to
//! call `next` again or abandon the scan.

use thiserror::Error;

/// Errors surfaced by B+ tree iterators.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
	/// The next leaf in the chain is held by a writer.
	///
	/// The iterator has not moved; calling `next` again retries the handoff.
	#[error("next leaf is latched by a writer")]
	Contended,
}

/// Result alias used by the iterator API.
pub type Result<T> = std::result::Result<T, Error>;
