use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::store::StorageEngine;
use crate::types::SCHEMA_NOT_VERSIONED;

/// Column types understood by the object model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Bool,
    Float,
    Double,
    String,
    Binary,
    DateTime,
    Table,
    Mixed,
    Link,
    LinkList,
}

/// Strength of a link column's ownership semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Strong,
    Weak,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<(String, ColumnType)>,
}

/// Declared schema carried by a configuration. The coordinator only enforces
/// the version-bump policy; deep table-by-table comparison is left to the
/// schema layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    pub tables: Vec<TableSchema>,
}

/// Everything needed to open one database file.
///
/// Handles opened against the same path must agree on the fields the
/// coordinator captures; see `Coordinator::get_realm` for the reconciliation
/// rules.
#[derive(Clone)]
pub struct Config {
    pub path: PathBuf,
    pub read_only: bool,
    pub in_memory: bool,
    pub encryption_key: Option<Vec<u8>>,
    pub schema_version: u64,
    pub schema: Option<Arc<Schema>>,
    /// Whether handles opened with this config may be reused on their thread.
    pub cache: bool,
    pub engine: Arc<dyn StorageEngine>,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>, engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            in_memory: false,
            encryption_key: None,
            schema_version: SCHEMA_NOT_VERSIONED,
            schema: None,
            cache: true,
            engine,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn encryption_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.encryption_key = key;
        self
    }

    pub fn schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn schema(mut self, schema: Option<Arc<Schema>>) -> Self {
        self.schema = schema;
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("in_memory", &self.in_memory)
            .field("encrypted", &self.encryption_key.is_some())
            .field("schema_version", &self.schema_version)
            .field("cache", &self.cache)
            .finish()
    }
}
