//! Rate limiting: in-process and shared-store limiters behind one trait.

mod distributed;
mod limiter;
mod sliding_window;
pub mod store;
mod token_bucket;

pub use distributed::{DistributedTokenBucket, DEFAULT_KEY_PREFIX, DEFAULT_TTL};
pub use limiter::{RateLimiter, Reservation, WaitContext};
pub use sliding_window::{SlidingWindow, WindowEntry, DEFAULT_PRECISION, DEFAULT_WINDOW};
pub use store::{BucketMode, BucketOutcome, BucketRequest, MemoryStore, RedisStore, ScriptStore};
pub use token_bucket::{TokenBucket, DEFAULT_BURST, DEFAULT_RATE};
