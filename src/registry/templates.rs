//! Template registry.
//!
//! Templates are immutable once stored: readers get `Arc` clones, and the
//! only mutation is a wholesale replace. Saving an identical body twice is
//! a no-op; deleting an unknown name is a no-op returning `false`.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::schema::ServiceTemplate;
use crate::error::Result;

/// Validated service templates keyed by name.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: DashMap<String, Arc<ServiceTemplate>>,
}

impl TemplateRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a template, replacing any previous body.
    ///
    /// Returns `true` when the stored set changed (new name or different
    /// body); saving an identical body is a no-op returning `false`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the template fails its invariants.
    pub fn register(&self, template: ServiceTemplate) -> Result<bool> {
        template.validate()?;
        if let Some(existing) = self.templates.get(&template.name) {
            if **existing == template {
                return Ok(false);
            }
        }
        self.templates.insert(template.name.clone(), Arc::new(template));
        Ok(true)
    }

    /// Returns the template with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ServiceTemplate>> {
        self.templates.get(name).map(|t| Arc::clone(&t))
    }

    /// All templates, sorted by name for stable listings.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ServiceTemplate>> {
        let mut all: Vec<_> = self.templates.iter().map(|t| Arc::clone(&t)).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Removes a template; `false` when the name was unknown.
    pub fn remove(&self, name: &str) -> bool {
        self.templates.remove(name).is_some()
    }

    /// Whether a template with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Number of stored templates.
    #[must_use]
    pub fn count(&self) -> usize {
        self.templates.len()
    }
}
