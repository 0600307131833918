//! Core runtime types for the routing engine.
//!
//! - [`LabelSet`]: the labels an alert carries
//! - [`Fingerprint`]: stable identity of an alert, derived from its labels
//! - [`AlertStatus`]: whether an alert is firing or resolved
//! - [`Alert`]: an incoming alert as handed to the engine

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Labels attached to an alert. Ordered so that iteration is deterministic.
pub type LabelSet = BTreeMap<String, String>;

/// Builds a [`LabelSet`] from string pairs.
#[must_use]
pub fn labels<'a, I>(pairs: I) -> LabelSet
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Deduplication identity of an alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an externally supplied fingerprint.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Computes a fingerprint from a label set.
    ///
    /// Labels are hashed in sorted order so the result does not depend on
    /// insertion order.
    #[must_use]
    pub fn from_labels(labels: &LabelSet) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for (k, v) in labels {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        Self(format!("{:016x}", hasher.finish()))
    }

    /// Returns the fingerprint as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an alert is currently firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The alert condition holds.
    Firing,
    /// The alert condition no longer holds.
    Resolved,
}

impl AlertStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Identifying labels.
    pub labels: LabelSet,
    /// Informational annotations; not used for routing.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: LabelSet,
    /// When the alert started.
    #[serde(default = "Utc::now")]
    pub starts_at: DateTime<Utc>,
    /// When the alert ends; a time in the past means resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    /// Deduplication identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl Alert {
    /// Creates a firing alert starting now.
    #[must_use]
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            annotations: LabelSet::new(),
            starts_at: Utc::now(),
            ends_at: None,
            fingerprint: None,
        }
    }

    /// Creates an alert from string pairs.
    #[must_use]
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self::new(labels(pairs))
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets an explicit fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(Fingerprint::new(fingerprint));
        self
    }

    /// Sets the end time.
    #[must_use]
    pub const fn with_ends_at(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    /// Returns the supplied fingerprint or one computed from the labels.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
            .clone()
            .unwrap_or_else(|| Fingerprint::from_labels(&self.labels))
    }

    /// Returns the value of a label, or `""` if the label is absent.
    #[must_use]
    pub fn label(&self, name: &str) -> &str {
        self.labels.get(name).map_or("", String::as_str)
    }

    /// Status of the alert at `now`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> AlertStatus {
        match self.ends_at {
            Some(ends_at) if ends_at <= now => AlertStatus::Resolved,
            _ => AlertStatus::Firing,
        }
    }
}
