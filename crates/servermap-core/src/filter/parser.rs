//! # Filter text parser
//!
//! Two input forms are accepted.
//!
//! The clause DSL:
//! ```text
//! fromApplication=web; toServiceType=MYSQL|ORACLE; elapsed>=500; errorOnly
//! ```
//! Clauses are separated by `;` and must all hold on the same edge;
//! alternatives within a clause are separated by `|`.
//!
//! Descriptor JSON, one object or an array of them:
//! ```text
//! [{"fa":"web","fst":"TOMCAT","ta":"db","tst":"MYSQL","ie":true,"rf":0,"rt":1000,"url":"/api/*"}]
//! ```
//! Each descriptor must be matched by some edge; separate descriptors may be
//! matched by different edges.

use serde::Deserialize;

use super::{Filter, Predicate, UrlPattern};
use crate::error::FilterParseError;
use crate::trace::ServiceType;

/// Turns filter text into a [`Filter`].
///
/// Parsing is all-or-nothing: any malformed clause fails the whole build.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterBuilder;

impl FilterBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Missing or blank text yields [`Filter::AcceptAll`].
    pub fn build(&self, text: Option<&str>) -> Result<Filter, FilterParseError> {
        let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(Filter::AcceptAll);
        };
        if text.starts_with('[') || text.starts_with('{') {
            parse_descriptors(text)
        } else {
            parse_clauses(text)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clause DSL
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

fn parse_clauses(text: &str) -> Result<Filter, FilterParseError> {
    let mut clauses = Vec::new();
    for clause in text.split(';') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        clauses.push(parse_clause(clause)?);
    }

    match clauses.len() {
        0 => Err(FilterParseError::new(text, "filter contains no clauses")),
        1 => Ok(Filter::AnyEdge(clauses.remove(0))),
        _ => Ok(Filter::AnyEdge(Predicate::All(clauses))),
    }
}

fn parse_clause(clause: &str) -> Result<Predicate, FilterParseError> {
    let key_end = clause
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(clause.len());
    let key = &clause[..key_end];
    let rest = clause[key_end..].trim_start();

    if key.is_empty() {
        return Err(FilterParseError::new(clause, "missing clause key"));
    }

    // Try operators in order of specificity
    let (op, value) = if rest.is_empty() {
        return parse_bare(clause, key);
    } else if let Some(v) = rest.strip_prefix(">=") {
        (Op::Gte, v)
    } else if let Some(v) = rest.strip_prefix("<=") {
        (Op::Lte, v)
    } else if let Some(v) = rest.strip_prefix('>') {
        (Op::Gt, v)
    } else if let Some(v) = rest.strip_prefix('<') {
        (Op::Lt, v)
    } else if let Some(v) = rest.strip_prefix('=') {
        (Op::Eq, v)
    } else {
        return Err(FilterParseError::new(clause, "expected an operator after the key"));
    };

    let alternatives = split_alternatives(clause, value)?;
    let mut predicates = Vec::with_capacity(alternatives.len());
    for alternative in alternatives {
        predicates.push(parse_alternative(clause, key, op, alternative)?);
    }

    Ok(if predicates.len() == 1 {
        predicates.remove(0)
    } else {
        Predicate::Any(predicates)
    })
}

fn parse_bare(clause: &str, key: &str) -> Result<Predicate, FilterParseError> {
    match key.to_ascii_lowercase().as_str() {
        "erroronly" | "ie" => Ok(Predicate::ErrorOnly),
        _ => Err(FilterParseError::new(clause, format!("'{key}' requires a value"))),
    }
}

fn split_alternatives<'a>(clause: &str, value: &'a str) -> Result<Vec<&'a str>, FilterParseError> {
    let alternatives: Vec<&str> = value.split('|').map(|v| unquote(v.trim())).collect();
    if alternatives.iter().any(|v| v.is_empty()) {
        return Err(FilterParseError::new(clause, "empty value"));
    }
    Ok(alternatives)
}

fn unquote(value: &str) -> &str {
    value.trim_matches('"').trim_matches('\'')
}

fn parse_alternative(
    clause: &str,
    key: &str,
    op: Op,
    value: &str,
) -> Result<Predicate, FilterParseError> {
    let lower = key.to_ascii_lowercase();
    let require_eq = || {
        if op == Op::Eq {
            Ok(())
        } else {
            Err(FilterParseError::new(clause, format!("'{key}' only supports '='")))
        }
    };

    match lower.as_str() {
        "fromapplication" | "fa" => {
            require_eq()?;
            Ok(Predicate::FromApplication(value.to_string()))
        }
        "toapplication" | "ta" => {
            require_eq()?;
            Ok(Predicate::ToApplication(value.to_string()))
        }
        "fromservicetype" | "fst" => {
            require_eq()?;
            Ok(Predicate::FromServiceType(ServiceType::new(value)))
        }
        "toservicetype" | "tst" => {
            require_eq()?;
            Ok(Predicate::ToServiceType(ServiceType::new(value)))
        }
        "endpoint" | "ep" => {
            require_eq()?;
            Ok(Predicate::Endpoint(value.to_string()))
        }
        "url" => {
            require_eq()?;
            UrlPattern::new(value).map(Predicate::Url)
        }
        "erroronly" | "ie" => {
            require_eq()?;
            match value.to_ascii_lowercase().as_str() {
                "true" => Ok(Predicate::ErrorOnly),
                "false" => Ok(Predicate::All(Vec::new())),
                _ => Err(FilterParseError::new(clause, format!("'{value}' is not a boolean"))),
            }
        }
        "elapsed" => parse_elapsed(clause, op, value),
        _ => Err(FilterParseError::new(clause, format!("unknown filter key '{key}'"))),
    }
}

fn parse_elapsed(clause: &str, op: Op, value: &str) -> Result<Predicate, FilterParseError> {
    let number = |raw: &str| {
        raw.trim()
            .parse::<u64>()
            .map_err(|_| FilterParseError::new(clause, format!("'{raw}' is not a millisecond count")))
    };

    match op {
        Op::Gte => Ok(Predicate::ElapsedAtLeast(number(value)?)),
        Op::Gt => {
            let bound = number(value)?;
            let bound = bound
                .checked_add(1)
                .ok_or_else(|| FilterParseError::new(clause, "bound out of range"))?;
            Ok(Predicate::ElapsedAtLeast(bound))
        }
        Op::Lte => Ok(Predicate::ElapsedAtMost(number(value)?)),
        Op::Lt => {
            let bound = number(value)?;
            let bound = bound
                .checked_sub(1)
                .ok_or_else(|| FilterParseError::new(clause, "no elapsed time is below 0"))?;
            Ok(Predicate::ElapsedAtMost(bound))
        }
        Op::Eq => {
            let (low, high) = match value.split_once("..") {
                Some((low, high)) => (number(low)?, number(high)?),
                None => {
                    let exact = number(value)?;
                    (exact, exact)
                }
            };
            elapsed_between(clause, low, high)
        }
    }
}

fn elapsed_between(clause: &str, low: u64, high: u64) -> Result<Predicate, FilterParseError> {
    if low > high {
        return Err(FilterParseError::new(
            clause,
            format!("elapsed range {low}..{high} is inverted"),
        ));
    }
    Ok(Predicate::All(vec![
        Predicate::ElapsedAtLeast(low),
        Predicate::ElapsedAtMost(high),
    ]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor JSON
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterDescriptor {
    fa: Option<String>,
    fst: Option<String>,
    ta: Option<String>,
    tst: Option<String>,
    ie: Option<bool>,
    rf: Option<u64>,
    rt: Option<u64>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DescriptorText {
    Many(Vec<FilterDescriptor>),
    One(FilterDescriptor),
}

fn parse_descriptors(text: &str) -> Result<Filter, FilterParseError> {
    let descriptors = match serde_json::from_str::<DescriptorText>(text) {
        Ok(DescriptorText::Many(descriptors)) => descriptors,
        Ok(DescriptorText::One(descriptor)) => vec![descriptor],
        Err(e) => return Err(FilterParseError::new(text, e.to_string())),
    };
    if descriptors.is_empty() {
        return Err(FilterParseError::new(text, "descriptor list is empty"));
    }

    let mut filter = Filter::AcceptAll;
    for (i, descriptor) in descriptors.into_iter().enumerate() {
        let clause = format!("descriptor[{i}]");
        filter = filter.and(Filter::AnyEdge(descriptor_predicate(&clause, descriptor)?));
    }
    Ok(filter)
}

fn descriptor_predicate(
    clause: &str,
    descriptor: FilterDescriptor,
) -> Result<Predicate, FilterParseError> {
    let non_empty = |field: &str, value: Option<String>| match value {
        Some(v) if v.trim().is_empty() => {
            Err(FilterParseError::new(clause, format!("'{field}' is empty")))
        }
        other => Ok(other.map(|v| v.trim().to_string())),
    };

    let mut predicates = Vec::new();
    if let Some(application) = non_empty("fa", descriptor.fa)? {
        predicates.push(Predicate::FromApplication(application));
    }
    if let Some(service_type) = non_empty("fst", descriptor.fst)? {
        predicates.push(Predicate::FromServiceType(ServiceType::new(service_type)));
    }
    if let Some(application) = non_empty("ta", descriptor.ta)? {
        predicates.push(Predicate::ToApplication(application));
    }
    if let Some(service_type) = non_empty("tst", descriptor.tst)? {
        predicates.push(Predicate::ToServiceType(ServiceType::new(service_type)));
    }
    if descriptor.ie == Some(true) {
        predicates.push(Predicate::ErrorOnly);
    }
    match (descriptor.rf, descriptor.rt) {
        (Some(low), Some(high)) => predicates.push(elapsed_between(clause, low, high)?),
        (Some(low), None) => predicates.push(Predicate::ElapsedAtLeast(low)),
        (None, Some(high)) => predicates.push(Predicate::ElapsedAtMost(high)),
        (None, None) => {}
    }
    if let Some(url) = non_empty("url", descriptor.url)? {
        predicates.push(Predicate::Url(UrlPattern::new(&url)?));
    }

    if predicates.is_empty() && descriptor.ie.is_none() {
        return Err(FilterParseError::new(clause, "descriptor has no conditions"));
    }
    Ok(Predicate::All(predicates))
}
