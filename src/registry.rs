//! Named instance registry shared by the managers.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, ErrorContext, Result};

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("valid name pattern"));

/// Instance names: 1-64 chars of `[A-Za-z0-9_.-]`, starting alphanumeric.
pub fn validate_name(name: &str, source: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(Error::configuration_with_context(
            "invalid instance name",
            ErrorContext::new()
                .with_field_path(name)
                .with_details("expected 1-64 characters of [A-Za-z0-9_.-] starting with a letter or digit")
                .with_source(source),
        ))
    }
}

/// Name → instance map behind one lock.
pub struct Registry<T> {
    source: &'static str,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new entry built by `make`; fails on invalid or duplicate names.
    ///
    /// `make` runs under the write lock so two concurrent creates of the same
    /// name cannot both succeed.
    pub fn insert_with<F>(&self, name: &str, make: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        validate_name(name, self.source)?;
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(Error::configuration_with_context(
                "instance already exists",
                ErrorContext::new()
                    .with_field_path(name)
                    .with_source(self.source),
            ));
        }
        let value = Arc::new(make()?);
        entries.insert(name.to_string(), Arc::clone(&value));
        Ok(value)
    }

    /// Existing entry, or a new one built by `make`.
    pub fn get_or_insert_with<F>(&self, name: &str, make: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        validate_name(name, self.source)?;
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            return Ok(Arc::clone(existing));
        }
        let value = Arc::new(make()?);
        entries.insert(name.to_string(), Arc::clone(&value));
        Ok(value)
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().get(name).cloned()
    }

    /// Like [`get`](Self::get) but unknown names are a configuration error.
    pub fn require(&self, name: &str) -> Result<Arc<T>> {
        self.get(name).ok_or_else(|| self.not_found(name))
    }

    pub fn remove(&self, name: &str) -> Result<Arc<T>> {
        self.entries
            .write()
            .remove(name)
            .ok_or_else(|| self.not_found(name))
    }

    /// Sorted instance names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Entries sorted by name.
    pub fn values(&self) -> Vec<Arc<T>> {
        let entries = self.entries.read();
        let mut pairs: Vec<(&String, &Arc<T>)> = entries.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs.into_iter().map(|(_, v)| Arc::clone(v)).collect()
    }

    pub fn drain(&self) -> Vec<Arc<T>> {
        self.entries.write().drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn not_found(&self, name: &str) -> Error {
        Error::configuration_with_context(
            "unknown instance",
            ErrorContext::new()
                .with_field_path(name)
                .with_source(self.source),
        )
    }
}
