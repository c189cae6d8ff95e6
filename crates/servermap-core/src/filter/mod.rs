//! # Transaction filters
//!
//! A [`Filter`] decides whether a whole transaction contributes to the map.
//! Filters are built from [`Predicate`]s, which test a single caller→callee
//! edge; [`Filter::AnyEdge`] lifts an edge predicate to the transaction level
//! by requiring that at least one edge satisfy it.
//!
//! Filters are plain immutable values and can be shared across worker threads
//! without synchronization.

mod parser;

use std::fmt;

use regex::Regex;

use crate::error::FilterParseError;
use crate::trace::{CallSpan, ServiceType, Transaction};

pub use parser::FilterBuilder;

/// Predicate over a single caller→callee edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    FromApplication(String),
    ToApplication(String),
    FromServiceType(ServiceType),
    ToServiceType(ServiceType),
    /// Elapsed time lower bound, inclusive.
    ElapsedAtLeast(u64),
    /// Elapsed time upper bound, inclusive.
    ElapsedAtMost(u64),
    ErrorOnly,
    Url(UrlPattern),
    Endpoint(String),
    /// Every predicate holds. Empty is vacuously true.
    All(Vec<Predicate>),
    /// At least one predicate holds. Empty never matches.
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, span: &CallSpan) -> bool {
        match self {
            Self::FromApplication(name) => span.caller.application == *name,
            Self::ToApplication(name) => span.callee.application == *name,
            Self::FromServiceType(service_type) => span.caller.service_type == *service_type,
            Self::ToServiceType(service_type) => span.callee.service_type == *service_type,
            Self::ElapsedAtLeast(bound) => span.elapsed_ms >= *bound,
            Self::ElapsedAtMost(bound) => span.elapsed_ms <= *bound,
            Self::ErrorOnly => span.error,
            Self::Url(pattern) => span.rpc.as_deref().is_some_and(|rpc| pattern.matches(rpc)),
            Self::Endpoint(endpoint) => span.endpoint.as_deref() == Some(endpoint.as_str()),
            Self::All(predicates) => predicates.iter().all(|p| p.matches(span)),
            Self::Any(predicates) => predicates.iter().any(|p| p.matches(span)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromApplication(name) => write!(f, "fromApplication={name}"),
            Self::ToApplication(name) => write!(f, "toApplication={name}"),
            Self::FromServiceType(service_type) => write!(f, "fromServiceType={service_type}"),
            Self::ToServiceType(service_type) => write!(f, "toServiceType={service_type}"),
            Self::ElapsedAtLeast(bound) => write!(f, "elapsed>={bound}"),
            Self::ElapsedAtMost(bound) => write!(f, "elapsed<={bound}"),
            Self::ErrorOnly => f.write_str("errorOnly"),
            Self::Url(pattern) => write!(f, "url={}", pattern.as_str()),
            Self::Endpoint(endpoint) => write!(f, "endpoint={endpoint}"),
            Self::All(predicates) => write_joined(f, predicates, "; "),
            Self::Any(predicates) => {
                f.write_str("(")?;
                write_joined(f, predicates, " | ")?;
                f.write_str(")")
            }
        }
    }
}

/// Glob over a request URL where `*` matches any run of characters.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    glob: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn new(glob: &str) -> Result<Self, FilterParseError> {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$"))
            .map_err(|e| FilterParseError::new(glob, e.to_string()))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.glob == other.glob
    }
}

/// Predicate over a whole transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Every transaction is included.
    #[default]
    AcceptAll,
    /// Some edge of the transaction satisfies the predicate. All parts of the
    /// predicate are evaluated against that same edge.
    AnyEdge(Predicate),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Whether `transaction` contributes to the map. A rejected transaction
    /// contributes none of its spans.
    pub fn include(&self, transaction: &Transaction) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::AnyEdge(predicate) => transaction.spans.iter().any(|s| predicate.matches(s)),
            Self::And(filters) => filters.iter().all(|f| f.include(transaction)),
            Self::Or(filters) => filters.iter().any(|f| f.include(transaction)),
        }
    }

    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Self::AcceptAll, f) | (f, Self::AcceptAll) => f,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), f) => {
                left.push(f);
                Self::And(left)
            }
            (f, right) => Self::And(vec![f, right]),
        }
    }

    pub fn or(self, other: Filter) -> Filter {
        match (self, other) {
            (Self::AcceptAll, _) | (_, Self::AcceptAll) => Self::AcceptAll,
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), f) => {
                left.push(f);
                Self::Or(left)
            }
            (f, right) => Self::Or(vec![f, right]),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAll => f.write_str("*"),
            Self::AnyEdge(predicate) => write!(f, "edge({predicate})"),
            Self::And(filters) => write_joined(f, filters, " AND "),
            Self::Or(filters) => write_joined(f, filters, " OR "),
        }
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}
