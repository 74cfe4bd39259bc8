//! Pack registry
//!
//! An ordered, identity-indexed collection of packs. Registration order is
//! the order packs run in `pre`, so it is preserved exactly. Once frozen the
//! registry is read-only and shared across requests without locking.

use crate::error::InitializationError;
use packtap_api::{PackId, PackManifest, Permissions, Phase};
use packtap_host::EnvAllowList;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

/// A loaded pack with its patterns compiled
#[derive(Debug, Clone)]
pub struct Pack {
    id: PackId,
    manifest: PackManifest,
    domains: Vec<Regex>,
    environment: EnvAllowList,
}

impl Pack {
    /// Validate a manifest and compile its patterns
    pub fn new(manifest: PackManifest) -> Result<Self, InitializationError> {
        let id = manifest.id();

        let domains = manifest
            .permissions
            .domains
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| InitializationError::InvalidDomain {
                    pack: id.clone(),
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let environment = EnvAllowList::new(&manifest.permissions.environment).map_err(
            |source| InitializationError::InvalidEnvironment {
                pack: id.clone(),
                source,
            },
        )?;

        Ok(Self {
            id,
            manifest,
            domains,
            environment,
        })
    }

    pub fn id(&self) -> &PackId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn manifest(&self) -> &PackManifest {
        &self.manifest
    }

    pub fn permissions(&self) -> &Permissions {
        &self.manifest.permissions
    }

    pub fn environment(&self) -> &EnvAllowList {
        &self.environment
    }

    /// Whether this pack runs `phase`
    pub fn declares(&self, phase: Phase) -> bool {
        self.manifest.declares(phase)
    }

    /// Whether any domain pattern matches `url`
    ///
    /// A pack without domain patterns never matches.
    pub fn matches(&self, url: &str) -> bool {
        self.domains.iter().any(|re| re.is_match(url))
    }
}

/// Ordered collection of packs
#[derive(Debug, Default)]
pub struct PackRegistry {
    packs: Vec<Arc<Pack>>,
    ids: HashSet<PackId>,
    frozen: bool,
}

impl PackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pack
    ///
    /// Returns `Ok(false)` when a pack with the same identity is already
    /// registered; the first registration wins.
    pub fn insert(&mut self, pack: Pack) -> Result<bool, InitializationError> {
        if self.frozen {
            return Err(InitializationError::RegistryFrozen(pack.id.clone()));
        }
        if !self.ids.insert(pack.id.clone()) {
            tracing::debug!(pack = %pack.id, "Duplicate pack ignored");
            return Ok(false);
        }
        self.packs.push(Arc::new(pack));
        Ok(true)
    }

    /// Remove a pack before the registry is frozen
    pub fn remove(&mut self, id: &PackId) -> bool {
        if self.frozen || !self.ids.remove(id) {
            return false;
        }
        self.packs.retain(|p| p.id() != id);
        true
    }

    /// Make the registry read-only
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn get(&self, id: &PackId) -> Option<&Arc<Pack>> {
        self.packs.iter().find(|p| p.id() == id)
    }

    /// Packs matching `url`, in registration order
    pub fn matching(&self, url: &str) -> Vec<Arc<Pack>> {
        self.packs
            .iter()
            .filter(|p| p.matches(url))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pack>> {
        self.packs.iter()
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(name: &str, version: &str, domains: &[&str]) -> Pack {
        Pack::new(
            PackManifest::new(name, version)
                .permissions(Permissions::default().with_domains(domains.iter().copied())),
        )
        .unwrap()
    }

    #[test]
    fn test_matching_preserves_registration_order() {
        let mut registry = PackRegistry::new();
        registry.insert(pack("b", "1.0.0", &["example\\.com"])).unwrap();
        registry.insert(pack("a", "1.0.0", &[".+"])).unwrap();
        registry.insert(pack("c", "1.0.0", &["openai\\.com"])).unwrap();

        let names: Vec<_> = registry
            .matching("https://example.com/x")
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_pack_without_domains_never_matches() {
        let p = pack("silent", "1.0.0", &[]);
        assert!(!p.matches("https://example.com/"));
    }

    #[test]
    fn test_first_write_wins() {
        let mut registry = PackRegistry::new();
        assert!(registry.insert(pack("apm", "1.0.0", &["a"])).unwrap());
        assert!(!registry.insert(pack("apm", "1.0.0", &["b"])).unwrap());
        assert!(registry.insert(pack("apm", "2.0.0", &["b"])).unwrap());

        assert_eq!(registry.len(), 2);
        let first = registry.get(&PackId::new("apm", "1.0.0")).unwrap();
        assert!(first.matches("a"));
        assert!(!first.matches("b"));
    }

    #[test]
    fn test_frozen_registry_rejects_changes() {
        let mut registry = PackRegistry::new();
        registry.insert(pack("apm", "1.0.0", &[".+"])).unwrap();
        registry.freeze();

        let err = registry.insert(pack("late", "1.0.0", &[".+"])).unwrap_err();
        assert!(matches!(err, InitializationError::RegistryFrozen(_)));
        assert!(!registry.remove(&PackId::new("apm", "1.0.0")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_patterns_are_rejected() {
        let bad_domain = PackManifest::new("x", "1.0.0")
            .permissions(Permissions::default().with_domains(["("]));
        assert!(matches!(
            Pack::new(bad_domain),
            Err(InitializationError::InvalidDomain { .. })
        ));

        let bad_env = PackManifest::new("x", "1.0.0")
            .permissions(Permissions::default().with_environment(["*"]));
        assert!(matches!(
            Pack::new(bad_env),
            Err(InitializationError::InvalidEnvironment { .. })
        ));
    }
}
