//! Work items and the batches they are grouped into
//!
//! An [`AppName`] names one testable app; a [`Batch`] is the non-empty group
//! of apps handed to a single test-runner process.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of one testable app
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppName(String);

impl AppName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A group of apps dispatched as one unit of concurrent execution.
///
/// Membership is fixed once the partitioner has formed the batch. Batches
/// are numbered from 1 in partition order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    index: usize,
    apps: Vec<AppName>,
}

impl Batch {
    pub fn new(index: usize, apps: Vec<AppName>) -> Self {
        Self { index, apps }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn apps(&self) -> &[AppName] {
        &self.apps
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Space-separated membership, as passed to the test runner
    pub fn joined(&self) -> String {
        self.apps
            .iter()
            .map(AppName::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch {} [{}]", self.index, self.joined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_joined() {
        let batch = Batch::new(1, vec!["basic".into(), "admin_views".into()]);
        assert_eq!(batch.joined(), "basic admin_views");
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_batch_display() {
        let batch = Batch::new(3, vec!["queries".into()]);
        assert_eq!(batch.to_string(), "Batch 3 [queries]");
    }

    #[test]
    fn test_app_name_serializes_as_string() {
        let json = serde_json::to_string(&AppName::new("basic")).unwrap();
        assert_eq!(json, "\"basic\"");
    }
}
