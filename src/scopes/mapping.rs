//! Scope mapping document: groups, their server rules, and IdP aliases.
//!
//! ```yaml
//! groups:
//!   mcp-servers-finance/read:
//!     description: Read-only finance tools
//!     servers:
//!       - server: /finance-tools
//!         operations: [read]
//! group_mappings:
//!   finance-analysts: [mcp-servers-finance/read]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Matches every operation (or every server, when used as the path)
pub const WILDCARD: &str = "*";

/// One server-access rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRule {
    /// Server path (`/finance-tools`)
    pub server: String,
    /// Allowed operations; `*` allows all
    #[serde(default)]
    pub operations: BTreeSet<String>,
}

impl ServerRule {
    /// Rule for `server` allowing `operations`
    #[must_use]
    pub fn new<I, S>(server: &str, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            server: normalize_server(server),
            operations: operations.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, server: &str, operation: &str) -> bool {
        let server_ok = self.server == WILDCARD || normalize_server(&self.server) == server;
        server_ok && (self.operations.contains(WILDCARD) || self.operations.contains(operation))
    }
}

/// Internal group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    /// Human description
    pub description: String,
    /// Ordered server rules
    pub servers: Vec<ServerRule>,
}

/// The full policy: groups plus IdP group/role aliases
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeMapping {
    /// Internal groups by name
    pub groups: BTreeMap<String, Group>,
    /// IdP group or role name -> internal group names
    pub group_mappings: BTreeMap<String, Vec<String>>,
}

/// Canonical form of a server path: no surrounding whitespace or slashes,
/// one leading slash.
#[must_use]
pub fn normalize_server(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed == WILDCARD {
        WILDCARD.to_string()
    } else {
        format!("/{trimmed}")
    }
}

impl ScopeMapping {
    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut mapping: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        mapping.normalize();
        mapping.validate()?;
        Ok(mapping)
    }

    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Write as YAML, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reject aliases pointing at undefined groups and rules without a path.
    pub fn validate(&self) -> Result<()> {
        for (alias, targets) in &self.group_mappings {
            if let Some(missing) = targets.iter().find(|t| !self.groups.contains_key(*t)) {
                return Err(Error::ScopeNotFound(format!(
                    "group_mappings.{alias} references undefined group '{missing}'"
                )));
            }
        }
        for (name, group) in &self.groups {
            if name.trim().is_empty() {
                return Err(Error::InvalidRequest("group name must not be empty".into()));
            }
            if group.servers.iter().any(|r| r.server.trim_matches('/').is_empty()) {
                return Err(Error::InvalidRequest(format!(
                    "group '{name}' has a server rule without a path"
                )));
            }
        }
        Ok(())
    }

    fn normalize(&mut self) {
        for group in self.groups.values_mut() {
            for rule in &mut group.servers {
                rule.server = normalize_server(&rule.server);
            }
        }
    }

    /// Internal groups reached by `groups`: direct names plus alias targets.
    #[must_use]
    pub fn resolve_groups<'a, I>(&self, groups: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut resolved = BTreeSet::new();
        for g in groups {
            if self.groups.contains_key(g) {
                resolved.insert(g.to_string());
            }
            if let Some(targets) = self.group_mappings.get(g) {
                resolved.extend(
                    targets
                        .iter()
                        .filter(|t| self.groups.contains_key(*t))
                        .cloned(),
                );
            }
        }
        resolved
    }

    /// Whether any group reached by `groups` allows `operation` on `server`.
    #[must_use]
    pub fn authorize<'a, I>(&self, groups: I, server: &str, operation: &str) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let server = normalize_server(server);
        self.resolve_groups(groups)
            .iter()
            .filter_map(|name| self.groups.get(name))
            .flat_map(|group| group.servers.iter())
            .any(|rule| rule.matches(&server, operation))
    }

    /// Server rules reachable from `groups`, merged per server path.
    #[must_use]
    pub fn effective_rules<'a, I>(&self, groups: I) -> BTreeMap<String, BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut rules: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in self.resolve_groups(groups) {
            if let Some(group) = self.groups.get(&name) {
                for rule in &group.servers {
                    rules
                        .entry(rule.server.clone())
                        .or_default()
                        .extend(rule.operations.iter().cloned());
                }
            }
        }
        rules
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const FINANCE: &str = r"
groups:
  mcp-servers-finance/read:
    description: Read-only finance tools
    servers:
      - server: finance-tools/
        operations: [read]
  mcp-registry-admin:
    description: Everything
    servers:
      - server: '*'
        operations: ['*']
group_mappings:
  finance-analysts: [mcp-servers-finance/read]
";

    #[test]
    fn finance_group_scenario() {
        let mapping = ScopeMapping::from_yaml(FINANCE).unwrap();
        let groups = ["mcp-servers-finance/read"];

        assert!(mapping.authorize(groups, "/finance-tools", "read"));
        assert!(!mapping.authorize(groups, "/finance-tools", "write"));
        assert!(!mapping.authorize(groups, "/hr-tools", "read"));
    }

    #[test]
    fn idp_alias_resolves_to_internal_group() {
        let mapping = ScopeMapping::from_yaml(FINANCE).unwrap();
        assert!(mapping.authorize(["finance-analysts"], "finance-tools", "read"));
        assert!(!mapping.authorize(["strangers"], "/finance-tools", "read"));
        assert_eq!(
            mapping.resolve_groups(["finance-analysts", "unknown"]),
            BTreeSet::from(["mcp-servers-finance/read".to_string()])
        );
    }

    #[test]
    fn wildcards_allow_everything() {
        let mapping = ScopeMapping::from_yaml(FINANCE).unwrap();
        assert!(mapping.authorize(["mcp-registry-admin"], "/hr-tools", "delete"));
    }

    #[test]
    fn server_paths_are_normalized() {
        assert_eq!(normalize_server("finance-tools/"), "/finance-tools");
        assert_eq!(normalize_server(" //finance-tools "), "/finance-tools");
        let mapping = ScopeMapping::from_yaml(FINANCE).unwrap();
        let rules = &mapping.groups["mcp-servers-finance/read"].servers;
        assert_eq!(rules[0].server, "/finance-tools");
    }

    #[test]
    fn alias_to_undefined_group_is_rejected() {
        let yaml = "group_mappings:\n  devs: [ghost]\n";
        assert!(matches!(
            ScopeMapping::from_yaml(yaml),
            Err(Error::ScopeNotFound(_))
        ));
    }

    #[test]
    fn empty_document_is_empty_mapping() {
        assert_eq!(ScopeMapping::from_yaml("").unwrap(), ScopeMapping::default());
    }

    #[test]
    fn save_then_load_preserves_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scopes.yaml");
        let mapping = ScopeMapping::from_yaml(FINANCE).unwrap();

        mapping.save(&path).unwrap();

        assert_eq!(ScopeMapping::load(&path).unwrap(), mapping);
    }

    #[test]
    fn effective_rules_merge_across_groups() {
        let yaml = r"
groups:
  a:
    servers:
      - server: /tools
        operations: [read]
  b:
    servers:
      - server: /tools
        operations: [write]
";
        let mapping = ScopeMapping::from_yaml(yaml).unwrap();
        let rules = mapping.effective_rules(["a", "b"]);
        assert_eq!(
            rules["/tools"],
            BTreeSet::from(["read".to_string(), "write".to_string()])
        );
    }
}
