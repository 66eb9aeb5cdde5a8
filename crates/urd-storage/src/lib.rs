pub mod fjall;
pub mod keys;
pub mod timetag;
pub mod value;

pub use fjall::{DbError, DbGetContext, FjallWrapper, ReplicaStore, LAST_FLUSHED_DECREE};
