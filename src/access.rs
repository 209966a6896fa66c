//! Operation access control
//!
//! The engine does not authenticate users. It asks an [`AccessPolicy`]
//! whether an operation may run and reports a refusal like any other failed
//! operation.

use std::collections::BTreeSet;

use tracing::debug;

use crate::toolbox::ToolboxOperation;

/// Decides whether an operation may run
pub trait AccessPolicy: Send + Sync {
    fn permits(&self, operation: &ToolboxOperation) -> bool;
}

/// Permits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn permits(&self, _operation: &ToolboxOperation) -> bool {
        true
    }
}

/// Allow-list of operation names; `"*"` permits everything
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    allowed: BTreeSet<String>,
}

impl StaticPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl AccessPolicy for StaticPolicy {
    fn permits(&self, operation: &ToolboxOperation) -> bool {
        let permitted = self.allowed.contains("*") || self.allowed.contains(operation.name());
        if !permitted {
            debug!("{operation} not in allow-list");
        }
        permitted
    }
}
