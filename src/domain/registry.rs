//! Code registry - static mapping from scanned codes to locations and objects
//!
//! Built once from configuration and never mutated afterwards, so it can be
//! shared behind an `Arc` by any number of scanner sessions.

use crate::domain::types::{Entity, Location, TrackedObject};
use rustc_hash::FxHashMap;

#[derive(Debug, Default, Clone)]
pub struct CodeRegistry {
    locations: FxHashMap<String, Location>,
    objects: FxHashMap<String, TrackedObject>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(mut self, code: &str, display_name: &str) -> Self {
        self.insert_location(code, display_name);
        self
    }

    pub fn with_object(mut self, code: &str, display_name: &str, category: &str) -> Self {
        self.insert_object(TrackedObject {
            id: code.to_string(),
            display_name: display_name.to_string(),
            category: category.to_string(),
            serial: None,
            owner: None,
        });
        self
    }

    pub fn insert_location(&mut self, code: &str, display_name: &str) {
        self.locations.insert(
            code.to_string(),
            Location { id: code.to_string(), display_name: display_name.to_string() },
        );
    }

    pub fn insert_object(&mut self, object: TrackedObject) {
        self.objects.insert(object.id.clone(), object);
    }

    /// Resolve a decoded payload
    ///
    /// Tries the payload verbatim first, then trimmed and upper-cased, since
    /// decoders regularly hand back stray whitespace or lower-case text.
    pub fn lookup(&self, code: &str) -> Option<Entity<'_>> {
        if let Some(entity) = self.lookup_exact(code) {
            return Some(entity);
        }
        let normalized = code.trim().to_uppercase();
        if normalized != code {
            return self.lookup_exact(&normalized);
        }
        None
    }

    fn lookup_exact(&self, code: &str) -> Option<Entity<'_>> {
        if let Some(location) = self.locations.get(code) {
            return Some(Entity::Location(location));
        }
        self.objects.get(code).map(Entity::Object)
    }

    pub fn location(&self, id: &str) -> Option<&Location> {
        self.locations.get(id)
    }

    pub fn object(&self, id: &str) -> Option<&TrackedObject> {
        self.objects.get(id)
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Codes registered as both a location and an object
    ///
    /// Such codes always resolve as a location.
    pub fn ambiguous_codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self
            .objects
            .keys()
            .filter(|code| self.locations.contains_key(*code))
            .map(String::as_str)
            .collect();
        codes.sort_unstable();
        codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CodeRegistry {
        CodeRegistry::new()
            .with_location("LOC001", "Loading Dock")
            .with_location("LOC002", "Server Room")
            .with_object("OBJ002", "Laptop", "personal")
    }

    #[test]
    fn test_lookup_location_and_object() {
        let reg = registry();
        assert!(matches!(reg.lookup("LOC002"), Some(Entity::Location(l)) if l.display_name == "Server Room"));
        assert!(matches!(reg.lookup("OBJ002"), Some(Entity::Object(o)) if o.category == "personal"));
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(registry().lookup("NOPE").is_none());
        assert!(registry().lookup("").is_none());
    }

    #[test]
    fn test_lookup_normalizes_whitespace_and_case() {
        let reg = registry();
        assert!(matches!(reg.lookup("  obj002\n"), Some(Entity::Object(o)) if o.id == "OBJ002"));
        assert!(matches!(reg.lookup("loc001"), Some(Entity::Location(_))));
    }

    #[test]
    fn test_ambiguous_codes_resolve_as_location() {
        let reg = registry().with_object("LOC001", "Mislabelled", "misc");
        assert_eq!(reg.ambiguous_codes(), vec!["LOC001"]);
        assert!(matches!(reg.lookup("LOC001"), Some(Entity::Location(_))));
    }

    #[test]
    fn test_counts() {
        let reg = registry();
        assert_eq!(reg.location_count(), 2);
        assert_eq!(reg.object_count(), 1);
    }
}
