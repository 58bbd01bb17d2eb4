//! Admission control and rate limiting.
//!
//! Two independent mechanisms protect the server: the [`AdmissionGate`] caps
//! how many uploads and downloads run at the same time (excess requests
//! wait), and the [`RateLimiter`] caps how often each client may ask
//! (excess requests are rejected).

pub mod admission;
pub mod error;
pub mod ratelimit;

pub use crate::admission::{AdmissionGate, Kind, Slot};
pub use crate::ratelimit::{RateLimiter, Settings as RateLimitSettings};
