//! The changes-feed synchronizer.
//!
//! A long-running loop against the upstream feed keeps cached entries in
//! step with upstream edits and deletions, resuming after restarts from a
//! persisted sequence cursor. The loop never exits: rate limits and other
//! failures turn into backoff sleeps.

pub use cursor::SeqCursor;
pub use sync::{StepOutcome, SyncOptions, Synchronizer};

mod cursor;
mod sync;
