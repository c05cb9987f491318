/*!
A splitting and coalescing block allocator for one bounded guest address range.

Kernel partitions and heaps inside them are carved out with a [`BlockAllocator`].
Every allocation and free is reported through a [`guestmem::MemNotify`], so a
[`guestmem::MemInfo`] can record who owns which memory.
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

pub mod allocator;
pub mod block;
pub mod error;

pub use allocator::BlockAllocator;
pub use block::{Block, BlockTag};
pub use error::AllocError;
