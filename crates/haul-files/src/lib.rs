//! # haul files
//!
//! File checksums and the share-registration hash queue.
//!
//! This crate provides:
//! - Streaming BLAKE3 checksums of files on disk
//! - A single-consumer queue that hashes files waiting to be shared and
//!   registers them once their checksum is known

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash_queue;
pub mod hasher;

pub use error::FilesError;
pub use hash_queue::{
    DEFAULT_MAX_FAILURES, HashQueue, HashRequest, ShareRegistry, SharedFileRegistration,
};
pub use hasher::{FileChecksum, hash_file};
