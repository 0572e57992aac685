//! Tenant → collection name mapping.
//!
//! Every tenant gets its own collection named `<prefix>_<tenant_key>`.
//! Collection names end up inside SQL identifiers, so both the prefix and
//! the tenant key are restricted to ASCII letters, digits, and `_`.
//!
//! The registry also remembers which collections have already been
//! verified by the schema manager in this process, so callers only pay for
//! `ensure_collection` once per collection.

use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;

use crate::error::{KbError, Result};

/// A validated collection name, safe to splice into SQL identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionName(String);

impl CollectionName {
    /// Wrap an already-built name after checking the identifier rule.
    pub fn parse(name: &str) -> Result<Self> {
        if is_identifier_safe(name) {
            Ok(CollectionName(name.to_string()))
        } else {
            Err(KbError::validation(format!(
                "invalid collection name {:?}",
                name
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CollectionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub struct CollectionRegistry {
    prefix: String,
    verified: RwLock<HashSet<CollectionName>>,
}

impl CollectionRegistry {
    pub fn new(prefix: &str) -> Result<Self> {
        if !is_identifier_safe(prefix) {
            return Err(KbError::validation(format!(
                "invalid collection prefix {:?}",
                prefix
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            verified: RwLock::new(HashSet::new()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Map a tenant key to its collection name. Pure.
    pub fn resolve(&self, tenant_key: &str) -> Result<CollectionName> {
        if !is_identifier_safe(tenant_key) {
            return Err(KbError::InvalidTenantKey(tenant_key.to_string()));
        }
        Ok(CollectionName(format!("{}_{}", self.prefix, tenant_key)))
    }

    pub fn is_verified(&self, name: &CollectionName) -> bool {
        self.verified
            .read()
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    pub fn mark_verified(&self, name: &CollectionName) {
        if let Ok(mut set) = self.verified.write() {
            set.insert(name.clone());
        }
    }

    /// Drop a name from the cache so the next use re-runs verification.
    pub fn forget(&self, name: &CollectionName) {
        if let Ok(mut set) = self.verified.write() {
            set.remove(name);
        }
    }
}

fn is_identifier_safe(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
