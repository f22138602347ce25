//! Scope/group policy engine.
//!
//! One [`ScopeMapping`] is active at a time, held as `Arc` behind a lock that
//! is taken only to clone or swap the pointer (read-copy-update). An
//! authorization call works against the snapshot it started with, so a
//! concurrent reload is never observed half-applied.
//!
//! Mutations (`add_group`, `remove_group`, `update_server_rules`) clone the
//! active mapping, modify the copy, validate it, and swap it in. A separate
//! writer mutex serializes them so two admins never lose each other's edits.

pub mod mapping;
pub mod watcher;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

pub use mapping::{Group, ScopeMapping, ServerRule, normalize_server};

use crate::config::ScopesConfig;
use crate::{Error, Result};

/// Policy engine over the active scope mapping
pub struct ScopePolicyEngine {
    active: RwLock<Arc<ScopeMapping>>,
    writer: Mutex<()>,
    source: Option<PathBuf>,
}

impl ScopePolicyEngine {
    /// Engine over an in-memory mapping (mutations are not persisted)
    #[must_use]
    pub fn new(mapping: ScopeMapping) -> Self {
        Self {
            active: RwLock::new(Arc::new(mapping)),
            writer: Mutex::new(()),
            source: None,
        }
    }

    /// Engine backed by a YAML file; mutations are written back to it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mapping = ScopeMapping::load(path)?;
        info!(
            path = %path.display(),
            groups = mapping.groups.len(),
            aliases = mapping.group_mappings.len(),
            "Loaded scope mapping"
        );
        Ok(Self {
            active: RwLock::new(Arc::new(mapping)),
            writer: Mutex::new(()),
            source: Some(path.to_path_buf()),
        })
    }

    /// Build from config: file-backed when a path is set, empty otherwise.
    pub fn from_config(config: &ScopesConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::from_file(path),
            None => {
                warn!("No scopes.path configured; every authorization will be denied");
                Ok(Self::new(ScopeMapping::default()))
            }
        }
    }

    /// Backing file, if any
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// The mapping active right now
    #[must_use]
    pub fn snapshot(&self) -> Arc<ScopeMapping> {
        Arc::clone(&self.active.read())
    }

    /// Whether `groups` may perform `operation` on `server`.
    #[must_use]
    pub fn authorize<'a, I>(&self, groups: I, server: &str, operation: &str) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.snapshot().authorize(groups, server, operation)
    }

    /// Internal group names `groups` resolve to; these are the scopes a
    /// broker token may carry.
    #[must_use]
    pub fn scopes_for<'a, I>(&self, groups: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.snapshot().resolve_groups(groups)
    }

    /// Replace the active mapping atomically.
    pub fn reload(&self, mapping: ScopeMapping) -> Result<()> {
        mapping.validate()?;
        let _w = self.writer.lock();
        self.swap(mapping);
        Ok(())
    }

    /// Re-read the backing file and swap it in. On any error the current
    /// mapping stays active.
    pub fn reload_from_source(&self) -> Result<Arc<ScopeMapping>> {
        let path = self
            .source
            .as_deref()
            .ok_or_else(|| Error::Configuration("no scopes file configured".into()))?;
        let mapping = ScopeMapping::load(path)?;
        let _w = self.writer.lock();
        self.swap(mapping);
        Ok(self.snapshot())
    }

    /// Create or replace a group and point `idp_aliases` at it.
    ///
    /// Returns `true` when the group did not exist before.
    pub fn add_group(&self, name: &str, group: Group, idp_aliases: &[String]) -> Result<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("group name must not be empty".into()));
        }
        self.mutate(|m| {
            let mut group = group;
            for rule in &mut group.servers {
                rule.server = normalize_server(&rule.server);
            }
            group.servers.retain(|r| !r.operations.is_empty());
            let created = m.groups.insert(name.to_string(), group).is_none();
            for alias in idp_aliases {
                let targets = m.group_mappings.entry(alias.clone()).or_default();
                if !targets.iter().any(|t| t == name) {
                    targets.push(name.to_string());
                }
            }
            Ok(created)
        })
    }

    /// Delete a group and every alias entry pointing at it.
    pub fn remove_group(&self, name: &str) -> Result<()> {
        self.mutate(|m| {
            if m.groups.remove(name).is_none() {
                return Err(Error::ScopeNotFound(format!("group '{name}'")));
            }
            for targets in m.group_mappings.values_mut() {
                targets.retain(|t| t != name);
            }
            m.group_mappings.retain(|_, targets| !targets.is_empty());
            Ok(())
        })
    }

    /// Set the operations `group` may perform on `server`. An empty set
    /// removes the rule.
    pub fn update_server_rules(
        &self,
        group: &str,
        server: &str,
        operations: BTreeSet<String>,
    ) -> Result<()> {
        let server = normalize_server(server);
        if server == "/" {
            return Err(Error::InvalidRequest("server path must not be empty".into()));
        }
        self.mutate(|m| {
            let entry = m
                .groups
                .get_mut(group)
                .ok_or_else(|| Error::ScopeNotFound(format!("group '{group}'")))?;
            let existing = entry.servers.iter().position(|r| r.server == server);
            match (existing, operations.is_empty()) {
                (Some(idx), true) => {
                    entry.servers.remove(idx);
                }
                (Some(idx), false) => entry.servers[idx].operations = operations,
                (None, true) => {}
                (None, false) => entry.servers.push(ServerRule {
                    server: server.clone(),
                    operations,
                }),
            }
            Ok(())
        })
    }

    /// Per-group summary of the active mapping: group -> server -> operations.
    #[must_use]
    pub fn describe(&self) -> BTreeMap<String, BTreeMap<String, BTreeSet<String>>> {
        let snapshot = self.snapshot();
        snapshot
            .groups
            .keys()
            .map(|name| (name.clone(), snapshot.effective_rules([name.as_str()])))
            .collect()
    }

    /// Clone, modify, validate, persist, swap.
    fn mutate<T>(&self, f: impl FnOnce(&mut ScopeMapping) -> Result<T>) -> Result<T> {
        let _w = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        let out = f(&mut next)?;
        next.validate()?;
        if let Some(path) = &self.source {
            next.save(path)?;
        }
        self.swap(next);
        Ok(out)
    }

    fn swap(&self, mapping: ScopeMapping) {
        let (groups, aliases) = (mapping.groups.len(), mapping.group_mappings.len());
        *self.active.write() = Arc::new(mapping);
        info!(groups, aliases, "Scope mapping swapped");
    }
}
