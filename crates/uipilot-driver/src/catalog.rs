//! Capability catalog: the named operations a backend exposes.
//!
//! The same catalog serves two purposes. It is rendered into prompts as the
//! available-API documentation, and its bindings are the only callables the
//! sandbox makes visible to generated code.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A callable exposed to generated code.
///
/// Bindings are invoked from the sandbox's blocking thread with the script
/// arguments converted to JSON values.
pub type Binding = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// Wrap a closure as a [`Binding`]
pub fn binding<F>(f: F) -> Binding
where
    F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fetch a required string argument
pub fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(anyhow!("argument '{}' must be a string, got {}", name, other)),
        None => Err(anyhow!("missing argument '{}'", name)),
    }
}

/// Fetch an optional non-negative integer argument
pub fn optional_u64_arg(args: &[Value], index: usize, name: &str) -> Result<Option<u64>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("argument '{}' must be a non-negative integer", name)),
    }
}

/// A single documented operation
#[derive(Clone)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub example: String,
    pub guidelines: Vec<String>,
    pub binding: Binding,
}

impl Capability {
    pub fn new(name: &str, description: &str, example: &str, binding: Binding) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            example: example.to_string(),
            guidelines: Vec::new(),
            binding,
        }
    }

    pub fn with_guideline(mut self, guideline: &str) -> Self {
        self.guidelines.push(guideline.to_string());
        self
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("example", &self.example)
            .field("guidelines", &self.guidelines)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityCategory {
    pub title: String,
    pub items: Vec<Capability>,
}

impl CapabilityCategory {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: Capability) -> Self {
        self.items.push(item);
        self
    }
}

/// The backend-declared set of operations, organized into categories
#[derive(Clone, Default)]
pub struct CapabilityCatalog {
    pub name: String,
    pub description: String,
    pub categories: Vec<CapabilityCategory>,
    pub restrictions: Vec<String>,
    /// Undocumented helpers bound into the sandbox alongside the catalog items
    extra_bindings: BTreeMap<String, Binding>,
}

impl CapabilityCatalog {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: CapabilityCategory) -> Self {
        self.extend(vec![category], BTreeMap::new());
        self
    }

    pub fn with_restriction(mut self, restriction: &str) -> Self {
        self.restrictions.push(restriction.to_string());
        self
    }

    /// Merge new categories and extra bindings into the catalog.
    ///
    /// Categories with an existing title are merged item by item; an item whose
    /// name already exists in that category replaces the old one.
    pub fn extend(
        &mut self,
        categories: Vec<CapabilityCategory>,
        extra_bindings: BTreeMap<String, Binding>,
    ) {
        for category in categories {
            match self
                .categories
                .iter_mut()
                .find(|existing| existing.title == category.title)
            {
                Some(existing) => {
                    for item in category.items {
                        match existing.items.iter_mut().find(|i| i.name == item.name) {
                            Some(slot) => *slot = item,
                            None => existing.items.push(item),
                        }
                    }
                }
                None => self.categories.push(category),
            }
        }
        self.extra_bindings.extend(extra_bindings);
    }

    pub fn find(&self, name: &str) -> Option<&Capability> {
        self.categories
            .iter()
            .flat_map(|category| category.items.iter())
            .find(|item| item.name == name)
    }

    /// Every name visible to generated code with its callable.
    ///
    /// Extra bindings win over catalog items of the same name.
    pub fn bindings(&self) -> Vec<(String, Binding)> {
        let mut merged: BTreeMap<String, Binding> = BTreeMap::new();
        for item in self.categories.iter().flat_map(|c| c.items.iter()) {
            merged.insert(item.name.clone(), item.binding.clone());
        }
        for (name, binding) in &self.extra_bindings {
            merged.insert(name.clone(), binding.clone());
        }
        merged.into_iter().collect()
    }

    /// Render the catalog as API documentation for prompts
    pub fn render_documentation(&self) -> String {
        let mut doc = String::new();
        doc.push_str(&format!("# {}\n\n{}\n", self.name, self.description));

        for category in &self.categories {
            doc.push_str(&format!("\n## {}\n", category.title));
            for item in &category.items {
                doc.push_str(&format!("\n### {}\n{}\n", item.name, item.description));
                if !item.example.is_empty() {
                    doc.push_str(&format!("Example:\n```\n{}\n```\n", item.example));
                }
                for guideline in &item.guidelines {
                    doc.push_str(&format!("- {}\n", guideline));
                }
            }
        }

        if !self.restrictions.is_empty() {
            doc.push_str("\n## Restrictions\n");
            for restriction in &self.restrictions {
                doc.push_str(&format!("- {}\n", restriction));
            }
        }

        doc
    }
}

impl fmt::Debug for CapabilityCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityCatalog")
            .field("name", &self.name)
            .field("categories", &self.categories)
            .field("restrictions", &self.restrictions)
            .field("extra_bindings", &self.extra_bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}
