pub mod error;
pub mod filter;
pub mod range;
pub mod scan;
pub mod storage;
pub mod trace;

pub use error::{FilterParseError, InvalidRangeError, StorageError, TransactionIdParseError};
pub use filter::{Filter, FilterBuilder, Predicate, UrlPattern};
pub use range::Range;
pub use scan::LimitedScanResult;
pub use trace::{CallSpan, ServiceRef, ServiceType, Transaction, TransactionId};
