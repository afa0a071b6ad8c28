//! Drop-directory watching for skiff.
//!
//! [`DropWatcher`] turns notify callbacks into a stream of [`FileEvent`]s;
//! [`Stabilizer`] debounces those into at-most-one [`StableFile`] per settled
//! write, using size polling so a file still being written is never picked up
//! early.

pub mod errors;
pub mod stabilizer;
pub mod watcher;

pub use errors::{Result, WatchError};
pub use stabilizer::{StabilizerSettings, StableFile, Stabilizer};
pub use watcher::{DropWatcher, FileEvent, FileEventKind};
