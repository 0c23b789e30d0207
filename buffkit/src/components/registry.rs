//! The component registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Attribute map passed to a renderer: attribute name to value.
pub type AttrMap = HashMap<String, String>;

/// Slot map passed to a renderer: slot name to captured inner HTML.
/// Unnamed child content is gathered under `"default"`.
pub type SlotMap = HashMap<String, String>;

/// A renderer: a pure function from (attributes, slots) to HTML.
pub type Renderer = Arc<dyn Fn(&AttrMap, &SlotMap) -> Result<String> + Send + Sync>;

/// Registry of named component renderers.
///
/// Safe for concurrent reads; registrations are serialized behind a write
/// lock. Registration is append-or-replace: the latest registration for a
/// tag wins, so hosts can override the built-in component set.
pub struct ComponentRegistry {
    prefix: String,
    renderers: RwLock<HashMap<String, Renderer>>,
}

impl ComponentRegistry {
    /// Create an empty registry with the given reserved tag prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            renderers: RwLock::new(HashMap::new()),
        }
    }

    /// The reserved tag prefix (default `bk-`).
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register a renderer under a tag name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] when the name does not start with the
    /// reserved prefix.
    pub fn register<F>(&self, name: impl Into<String>, renderer: F) -> Result<()>
    where
        F: Fn(&AttrMap, &SlotMap) -> Result<String> + Send + Sync + 'static,
    {
        let name = name.into();
        if !name.starts_with(&self.prefix) {
            return Err(Error::BadRequest(format!(
                "component tag '{}' must start with '{}'",
                name, self.prefix
            )));
        }
        let mut renderers = self.renderers.write().expect("registry lock poisoned");
        let replaced = renderers.insert(name.clone(), Arc::new(renderer)).is_some();
        tracing::debug!(tag = %name, replaced, "component registered");
        Ok(())
    }

    /// Remove a renderer. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.renderers
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Registered tag names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .renderers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Whether a renderer is registered for the tag.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.renderers
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// Look up the renderer for a tag.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Renderer> {
        self.renderers
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Invoke the renderer registered for `name`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no renderer is registered; the renderer's
    /// own error otherwise.
    pub fn render(&self, name: &str, attrs: &AttrMap, slots: &SlotMap) -> Result<String> {
        let renderer = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("no renderer for '{name}'")))?;
        renderer(attrs, slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_render() {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-badge", |attrs, _slots| {
                Ok(format!(
                    "<span class=\"badge\">{}</span>",
                    attrs.get("label").map(String::as_str).unwrap_or("")
                ))
            })
            .unwrap();

        let mut attrs = AttrMap::new();
        attrs.insert("label".to_string(), "new".to_string());
        let html = registry.render("bk-badge", &attrs, &SlotMap::new()).unwrap();
        assert_eq!(html, "<span class=\"badge\">new</span>");
    }

    #[test]
    fn test_register_rejects_unprefixed_name() {
        let registry = ComponentRegistry::new("bk-");
        let result = registry.register("button", |_, _| Ok(String::new()));
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_latest_registration_wins() {
        let registry = ComponentRegistry::new("bk-");
        registry.register("bk-x", |_, _| Ok("first".into())).unwrap();
        registry.register("bk-x", |_, _| Ok("second".into())).unwrap();

        let html = registry
            .render("bk-x", &AttrMap::new(), &SlotMap::new())
            .unwrap();
        assert_eq!(html, "second");
    }

    #[test]
    fn test_register_then_unregister_leaves_nothing() {
        let registry = ComponentRegistry::new("bk-");
        registry.register("bk-x", |_, _| Ok(String::new())).unwrap();
        assert!(registry.unregister("bk-x"));
        assert!(!registry.has("bk-x"));
        assert!(registry.list().is_empty());
        assert!(matches!(
            registry.render("bk-x", &AttrMap::new(), &SlotMap::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ComponentRegistry::new("bk-");
        registry.register("bk-b", |_, _| Ok(String::new())).unwrap();
        registry.register("bk-a", |_, _| Ok(String::new())).unwrap();
        assert_eq!(registry.list(), vec!["bk-a", "bk-b"]);
    }
}
