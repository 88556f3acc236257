use std::collections::HashMap;

use dbpilot_common::{MigrationError, Result};

use crate::migrations::Migration;

/// Ordered set of every migration compiled into this build.
///
/// Registry order is the only authority on application order. Building a
/// registry never touches storage.
pub struct MigrationRegistry {
    migrations: Vec<Box<dyn Migration>>,
    index: HashMap<String, usize>,
}

impl MigrationRegistry {
    /// Fails with `DuplicateDefinition` if two migrations share a name.
    pub fn new(migrations: Vec<Box<dyn Migration>>) -> Result<Self> {
        let mut index = HashMap::with_capacity(migrations.len());
        for (position, migration) in migrations.iter().enumerate() {
            let name = migration.name().to_string();
            if index.insert(name.clone(), position).is_some() {
                return Err(MigrationError::DuplicateDefinition { name }.into());
            }
        }
        Ok(Self { migrations, index })
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Migration> {
        self.migrations.iter().map(|m| m.as_ref())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Migration> {
        self.index
            .get(name)
            .map(|&position| self.migrations[position].as_ref())
    }

    /// Position of `name` in registry order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|m| m.name()))
            .finish()
    }
}
