//! Module set data model
//!
//! A `ModuleSet` maps module names to the remote endpoint they are pulled
//! from. Two sets exist per run: the freshly loaded `current` set and the
//! `previous` set read back from the config copy persisted by the last run.
//!
//! Equality is set-of-(name, descriptor) equality; configuration order is
//! kept only so that runs iterate (and log) deterministically.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::types::HostOs;

/// Remote endpoint and tree backed up by one module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostDescriptor {
    pub user: String,
    pub host: String,
    pub os: HostOs,
    pub source_path: String,
}

impl HostDescriptor {
    /// `user@host`, as used in rsync remote sources and report entries.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// rsync source locator for `path` on this host (`user@host:path`).
    pub fn remote(&self, path: &str) -> String {
        format!("{}:{}", self.login(), path)
    }

    /// De-duplication key for host-level work.
    pub fn key(&self) -> HostKey {
        HostKey {
            user: self.user.clone(),
            host: self.host.clone(),
        }
    }
}

/// Identity of a remote account: one `(user, host)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey {
    pub user: String,
    pub host: String,
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Immutable mapping of module name to host descriptor.
#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    modules: BTreeMap<String, HostDescriptor>,
    /// Names in configuration order
    order: Vec<String>,
}

impl ModuleSet {
    /// Build a set from `(name, descriptor)` pairs in configuration order.
    ///
    /// A repeated name keeps its first position and its last descriptor.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, HostDescriptor)>,
    {
        let mut set = Self::default();
        for (name, descriptor) in entries {
            if set.modules.insert(name.clone(), descriptor).is_none() {
                set.order.push(name);
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&HostDescriptor> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Modules in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostDescriptor)> {
        self.order
            .iter()
            .filter_map(|name| self.modules.get_key_value(name))
            .map(|(name, descriptor)| (name.as_str(), descriptor))
    }

    /// Module names in configuration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Names present in `self` but absent from `other`.
    ///
    /// Compares names only: a module whose descriptor changed is not missing.
    pub fn missing_from(&self, other: &ModuleSet) -> BTreeSet<String> {
        self.modules
            .keys()
            .filter(|name| !other.contains(name))
            .cloned()
            .collect()
    }
}

impl PartialEq for ModuleSet {
    fn eq(&self, other: &Self) -> bool {
        self.modules == other.modules
    }
}

impl Eq for ModuleSet {}
