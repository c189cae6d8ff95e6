//! # Application map engine
//!
//! Turns the transactions an application recorded within a time window into
//! a graph of services (nodes) and the calls between them (links), with
//! response-time histograms and per-bucket time series for both.
//!
//! The pipeline is scan → fetch → filter → aggregate. Aggregation happens in
//! private per-worker [`MapAccumulator`]s that are merged once at the end;
//! the merge is associative and commutative, so the resulting
//! [`ApplicationMap`] does not depend on worker scheduling.

pub mod builder;
pub mod cancel;
pub mod config;
pub mod error;
pub mod histogram;
pub mod map;
pub mod response;
pub mod scanner;
pub mod service;
pub mod timeseries;

pub use builder::{MapBuildResult, MapBuilder};
pub use cancel::{CancelHandle, CancelSignal, cancellation};
pub use config::{LimitConfig, MapConfig, TimeSeriesConfig};
pub use error::{FetchError, MapError};
pub use histogram::{CallOutcome, ResponseHistogram};
pub use map::{ApplicationMap, LinkKey, MapAccumulator};
pub use response::FilteredMapResponse;
pub use scanner::TransactionIndexScanner;
pub use service::{FilteredMapQuery, FilteredMapService, FilteredServerMap, LastFilteredMapQuery};
pub use timeseries::{BucketStats, EntityId, TimeSeriesStore, TimeWindow, WindowMismatch};
