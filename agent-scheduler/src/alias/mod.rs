//! Metric key aliases.
//!
//! An alias maps a user visible key name to the real metric key. Names ending
//! in `[*]` are wildcards: they match any key with the same name, and when the
//! mapped key also ends in `[*]` the caller's parameters are carried over.
//!
//! The table is loaded once at startup and read concurrently afterwards, so
//! [`AliasResolver`] swaps whole tables instead of mutating one in place.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::itemutil::parse_key;
use crate::{Error, Result};

const WILDCARD: &str = "[*]";

/// A single `name:key` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    pub key: String,
}

/// An immutable set of aliases.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: Vec<Alias>,
}

impl AliasTable {
    /// Builds a table from `name:key` definitions.
    ///
    /// The definition is split on the first `:`. Both sides must be valid
    /// item keys and alias names must be unique.
    pub fn parse<S: AsRef<str>>(definitions: &[S]) -> Result<Self> {
        let mut aliases: Vec<Alias> = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let definition = definition.as_ref();
            let (name, key) = definition.split_once(':').ok_or_else(|| {
                Error::config(format!("cannot add alias \"{definition}\": missing ':' separator"))
            })?;

            parse_key(name).map_err(|e| {
                Error::config(format!("cannot add alias \"{definition}\": {e}"))
            })?;
            parse_key(key).map_err(|e| {
                Error::config(format!("cannot add alias \"{definition}\": {e}"))
            })?;

            if aliases.iter().any(|a| a.name == name) {
                return Err(Error::config(format!(
                    "failed to add alias \"{name}\": duplicate name"
                )));
            }

            aliases.push(Alias {
                name: name.to_string(),
                key: key.to_string(),
            });
        }

        Ok(Self { aliases })
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Returns the key `orig` resolves to, or `orig` itself when no alias applies.
    pub fn resolve(&self, orig: &str) -> String {
        if parse_key(orig).is_err() {
            return orig.to_string();
        }

        if let Some(alias) = self.aliases.iter().find(|a| a.name == orig) {
            return alias.key.clone();
        }

        for alias in &self.aliases {
            let name_len = alias.name.len();
            if name_len <= WILDCARD.len() || !alias.name.ends_with(WILDCARD) {
                continue;
            }

            // Compare through the opening bracket.
            let prefix = &alias.name[..name_len - 2];
            match orig.get(..name_len - 2) {
                Some(head) if head == prefix => {}
                _ => continue,
            }

            if alias.key.len() <= WILDCARD.len() || !alias.key.ends_with(WILDCARD) {
                return alias.key.clone();
            }

            let key_head = &alias.key[..alias.key.len() - WILDCARD.len()];
            return format!("{}{}", key_head, &orig[name_len - WILDCARD.len()..]);
        }

        orig.to_string()
    }
}

/// Process-wide alias lookup.
#[derive(Debug, Default)]
pub struct AliasResolver {
    table: RwLock<Arc<AliasTable>>,
}

impl AliasResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver already loaded with `definitions`.
    pub fn with_aliases<S: AsRef<str>>(definitions: &[S]) -> Result<Self> {
        let resolver = Self::new();
        resolver.load(definitions)?;
        Ok(resolver)
    }

    /// Replaces the current table. On error the previous table stays in effect.
    pub fn load<S: AsRef<str>>(&self, definitions: &[S]) -> Result<()> {
        let table = AliasTable::parse(definitions)?;
        debug!(count = table.len(), "Loaded key aliases");
        *self.table.write() = Arc::new(table);
        Ok(())
    }

    pub fn resolve(&self, orig: &str) -> String {
        self.table.read().resolve(orig)
    }

    /// Snapshot of the table currently in effect.
    pub fn table(&self) -> Arc<AliasTable> {
        self.table.read().clone()
    }
}
