pub mod error;
pub mod job;
pub mod keys;
pub mod store;
pub mod time;

pub use error::{CoreError, Result};
pub use job::{
    Coordinates, JobEvent, JobId, JobStatus, JobStatusRecord, StreamStatus, published_status,
};
pub use keys::{canonical_uri, cache_key, notify_channel, status_key};
pub use store::{MessageStream, StatusStore, StoreError};
pub use time::now_rfc3339;
