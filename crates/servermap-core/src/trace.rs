use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransactionIdParseError;

const TRANSACTION_ID_DELIMITER: char = '^';

/// Unique identifier of one distributed trace.
///
/// Issued by the agent that received the originating request: the agent's
/// identity, the epoch at which that agent started, and a sequence that is
/// monotonic within that agent run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionId {
    pub agent_id: String,
    pub agent_start_time: i64,
    pub sequence: i64,
}

impl TransactionId {
    pub fn new(agent_id: impl Into<String>, agent_start_time: i64, sequence: i64) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_start_time,
            sequence,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{TRANSACTION_ID_DELIMITER}{}{TRANSACTION_ID_DELIMITER}{}",
            self.agent_id, self.agent_start_time, self.sequence
        )
    }
}

impl FromStr for TransactionId {
    type Err = TransactionIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransactionIdParseError(s.to_string());

        // Agent ids may themselves contain the delimiter; the numeric parts
        // are always the last two fields.
        let mut parts = s.rsplitn(3, TRANSACTION_ID_DELIMITER);
        let sequence = parts.next().ok_or_else(invalid)?;
        let start_time = parts.next().ok_or_else(invalid)?;
        let agent_id = parts.next().ok_or_else(invalid)?;
        if agent_id.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            agent_id: agent_id.to_string(),
            agent_start_time: start_time.parse().map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

/// Normalized service-type name (`TOMCAT`, `MYSQL`, `USER`, …).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServiceType(String);

impl ServiceType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ServiceType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

/// An application as seen on the map: its name plus the kind of service it
/// runs as. Node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub application: String,
    pub service_type: ServiceType,
}

impl ServiceRef {
    pub fn new(application: impl Into<String>, service_type: impl AsRef<str>) -> Self {
        Self {
            application: application.into(),
            service_type: ServiceType::new(service_type),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.application, self.service_type)
    }
}

/// One caller→callee call inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSpan {
    pub caller: ServiceRef,
    pub callee: ServiceRef,

    // -- Timing --
    /// Start of the call, epoch milliseconds.
    pub timestamp: i64,
    pub elapsed_ms: u64,

    // -- Outcome --
    #[serde(default)]
    pub error: bool,

    // -- Call metadata --
    /// Request URL or RPC name, when the callee recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<String>,
    /// Remote address the caller connected to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// The full call tree of one distributed trace, flattened to its edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub transaction_id: TransactionId,
    /// Start of the originating request, epoch milliseconds. This is the
    /// timestamp the trace index is ordered by.
    pub start_time: i64,
    pub spans: Vec<CallSpan>,
}

impl Transaction {
    /// Applications that recorded at least one span of this transaction, in
    /// first-seen order. These are the applications whose trace index lists
    /// it.
    pub fn recording_applications(&self) -> Vec<&str> {
        let mut applications: Vec<&str> = Vec::new();
        for span in &self.spans {
            let application = span.callee.application.as_str();
            if !applications.contains(&application) {
                applications.push(application);
            }
        }
        applications
    }
}
