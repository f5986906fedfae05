//! # Base - shared vocabulary of the Shoal storage engine
//!
//! Everything the other crates agree on lives here: the internal key
//! encoding, sequence numbers, the injected comparer and merge operator,
//! key spans (range deletions and range keys), the internal iterator
//! contract and the error taxonomy.
//!
//! ## Internal Key Layout
//!
//! ```text
//! [user_key bytes ...][trailer: u64 LE]
//!
//! trailer = (seq << 8) | kind
//! ```
//!
//! Internal keys sort by user key ascending (per [`Comparer`]), then by
//! trailer descending, so the newest version of a user key comes first.

mod comparer;
pub mod encoding;
mod error;
mod iter;
mod key;
pub mod keyspan;

pub use comparer::{
    Comparer, MergeFn, Merger, ShortAttributeExtractor, DEFAULT_COMPARER, DEFAULT_MERGER,
    VERSIONED_COMPARER,
};
pub use error::{classify, corruption, invalid_argument, invariant, Error};
pub use iter::{
    BlobHandle, BlobValue, InlineHandle, InternalIterator, InternalKv, InternalValue, ValueFetcher,
};
pub use key::{
    make_trailer, trailer_kind, trailer_seq, InternalKey, InternalKeyKind, SeqNum, SEQ_NUM_MAX,
    TRAILER_LEN,
};
pub use keyspan::{Span, SpanKey};

#[cfg(test)]
mod tests;
