//! Durable tracking of processed offset ranges.
//!
//! An [`OffsetRangeSet`] records which offsets of each topic partition
//! have already been written to the output tree. The set is persisted
//! through an [`OffsetPersistence`] backend (one CSV file per topic, or
//! a redis key), wrapped in an [`OffsetStore`] that postpones and
//! coalesces durable writes on a background thread.

mod file;
mod postponed;
mod range_set;
mod redis;
mod store;

pub use self::file::FileOffsetPersistence;
pub use self::range_set::{OffsetRange, OffsetRangeSet, TopicPartition};
pub use self::redis::RedisOffsetPersistence;
pub use self::store::{OffsetPersistence, OffsetStore};
