//! PriceMesh Store
//!
//! The two stores the aggregation core touches: the in-memory
//! latest-local map written by the fetcher, and the persistent result
//! store read by the submitter.

pub mod latest;
pub mod results;

pub use latest::LatestLocalAggregates;
pub use results::{ResultStore, StoreError};
