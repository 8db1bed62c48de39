//! Trigger-file caches and follow-up bookkeeping.

pub mod entry;
pub mod followup;
pub mod index;

pub use entry::urls_intersecting;
pub use index::{FileCache, IfoCombo, files_matching_gps_in_cache};
