//! multipart upload sessions: stateful, out-of-order-tolerant part
//! processing over a persistent CTR stream and HMAC calculator.

mod manager;
mod session;

pub use manager::{MultipartSessionManager, MAX_PART_NUMBER, MAX_PART_SIZE, MIN_PART_NUMBER};
pub use session::{PartResult, Session};
