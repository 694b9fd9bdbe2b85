//! Catalog directory layout and locking.
//!
//! ```text
//! <catalog_dir>/
//! ├─ LOCK                               # advisory lock for the single writer
//! ├─ {catalog}.boot                     # bootstrap log
//! ├─ {catalog}_{fileIndex}.catalog      # catalog header + catalog-level parts
//! ├─ {entityType}_{typePK}_{fileIndex}.entity
//! └─ {catalog}_{index}.wal              # WAL segments
//! ```
//!
//! Entity types may contain underscores, so file names are parsed from the
//! right.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Extension of the bootstrap log.
pub const BOOTSTRAP_EXTENSION: &str = "boot";
/// Extension of catalog files.
pub const CATALOG_EXTENSION: &str = "catalog";
/// Extension of entity-collection files.
pub const ENTITY_EXTENSION: &str = "entity";
/// Extension of WAL segments.
pub const WAL_EXTENSION: &str = "wal";

const LOCK_FILE: &str = "LOCK";

/// `{catalog}.boot`
#[must_use]
pub fn bootstrap_file_name(catalog: &str) -> String {
    format!("{catalog}.{BOOTSTRAP_EXTENSION}")
}

/// `{catalog}_{fileIndex}.catalog`
#[must_use]
pub fn catalog_file_name(catalog: &str, file_index: u32) -> String {
    format!("{catalog}_{file_index}.{CATALOG_EXTENSION}")
}

/// `{entityType}_{typePK}_{fileIndex}.entity`
#[must_use]
pub fn entity_file_name(entity_type: &str, type_pk: i32, file_index: u32) -> String {
    format!("{entity_type}_{type_pk}_{file_index}.{ENTITY_EXTENSION}")
}

/// `{entityType}_{fileIndex}.entity`, the naming used by protocol 1.
#[must_use]
pub fn legacy_entity_file_name(entity_type: &str, file_index: u32) -> String {
    format!("{entity_type}_{file_index}.{ENTITY_EXTENSION}")
}

/// `{catalog}_{index}.wal`
#[must_use]
pub fn wal_file_name(catalog: &str, index: u32) -> String {
    format!("{catalog}_{index}.{WAL_EXTENSION}")
}

fn indexed_suffix(catalog: &str, name: &str, extension: &str) -> Option<u32> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    let index = stem.strip_prefix(catalog)?.strip_prefix('_')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

/// File index of a `{catalog}_{fileIndex}.catalog` name.
#[must_use]
pub fn parse_catalog_file_name(catalog: &str, name: &str) -> Option<u32> {
    indexed_suffix(catalog, name, CATALOG_EXTENSION)
}

/// Segment index of a `{catalog}_{index}.wal` name.
#[must_use]
pub fn parse_wal_file_name(catalog: &str, name: &str) -> Option<u32> {
    indexed_suffix(catalog, name, WAL_EXTENSION)
}

/// Parsed `{entityType}_{typePK}_{fileIndex}.entity` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFileName {
    /// Entity type.
    pub entity_type: String,
    /// Entity type id.
    pub entity_type_primary_key: i32,
    /// Generation.
    pub file_index: u32,
}

/// Parses an entity-collection file name.
#[must_use]
pub fn parse_entity_file_name(name: &str) -> Option<EntityFileName> {
    let stem = name.strip_suffix(ENTITY_EXTENSION)?.strip_suffix('.')?;
    let mut parts = stem.rsplitn(3, '_');
    let file_index = parts.next()?.parse().ok()?;
    let entity_type_primary_key = parts.next()?.parse().ok()?;
    let entity_type = parts.next().filter(|t| !t.is_empty())?;
    Some(EntityFileName {
        entity_type: entity_type.to_string(),
        entity_type_primary_key,
        file_index,
    })
}

/// Kind of a file found in a catalog directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogFileKind {
    /// The bootstrap log.
    Bootstrap,
    /// A catalog file generation.
    Catalog {
        /// Generation.
        file_index: u32,
    },
    /// An entity-collection file generation.
    Entity(EntityFileName),
    /// A WAL segment.
    Wal {
        /// Segment index.
        index: u32,
    },
}

/// A catalog directory, optionally holding the writer lock.
#[derive(Debug)]
pub struct CatalogDir {
    path: PathBuf,
    catalog_name: String,
    lock_file: Option<File>,
}

impl CatalogDir {
    /// Opens a catalog directory for writing and takes the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CatalogLocked`] if another handle holds the
    /// lock, or [`CoreError::InvalidFormat`] if the path is missing and
    /// `create_if_missing` is false or is not a directory.
    pub fn open(path: &Path, catalog_name: &str, create_if_missing: bool) -> CoreResult<Self> {
        validate_catalog_name(catalog_name)?;
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "catalog directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::CatalogLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            catalog_name: catalog_name.to_string(),
            lock_file: Some(lock_file),
        })
    }

    /// Opens a catalog directory for inspection without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if the path is not a directory.
    pub fn open_unlocked(path: &Path, catalog_name: &str) -> CoreResult<Self> {
        validate_catalog_name(catalog_name)?;
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "catalog directory does not exist: {}",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            catalog_name: catalog_name.to_string(),
            lock_file: None,
        })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Catalog name.
    #[must_use]
    pub fn catalog_name(&self) -> &str {
        &self.catalog_name
    }

    /// Returns `true` if this handle holds the writer lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_file.is_some()
    }

    /// Path of the bootstrap log.
    #[must_use]
    pub fn bootstrap_path(&self) -> PathBuf {
        self.path.join(bootstrap_file_name(&self.catalog_name))
    }

    /// Path of a catalog file generation.
    #[must_use]
    pub fn catalog_file_path(&self, file_index: u32) -> PathBuf {
        self.path.join(catalog_file_name(&self.catalog_name, file_index))
    }

    /// Path of an entity-collection file generation.
    #[must_use]
    pub fn entity_file_path(&self, entity_type: &str, type_pk: i32, file_index: u32) -> PathBuf {
        self.path.join(entity_file_name(entity_type, type_pk, file_index))
    }

    /// Path of a WAL segment.
    #[must_use]
    pub fn wal_file_path(&self, index: u32) -> PathBuf {
        self.path.join(wal_file_name(&self.catalog_name, index))
    }

    /// Path of an arbitrary file in the directory.
    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Returns `true` if the catalog has a bootstrap log.
    #[must_use]
    pub fn has_bootstrap(&self) -> bool {
        self.bootstrap_path().is_file()
    }

    /// Classifies a file name relative to this catalog.
    #[must_use]
    pub fn classify(&self, name: &str) -> Option<CatalogFileKind> {
        if name == bootstrap_file_name(&self.catalog_name) {
            return Some(CatalogFileKind::Bootstrap);
        }
        if let Some(file_index) = parse_catalog_file_name(&self.catalog_name, name) {
            return Some(CatalogFileKind::Catalog { file_index });
        }
        if let Some(index) = parse_wal_file_name(&self.catalog_name, name) {
            return Some(CatalogFileKind::Wal { index });
        }
        parse_entity_file_name(name).map(CatalogFileKind::Entity)
    }

    /// Lists the catalog's files, sorted by name.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be read.
    pub fn list_files(&self) -> CoreResult<Vec<(CatalogFileKind, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(kind) = self.classify(name) {
                files.push((kind, entry.path()));
            }
        }
        files.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(files)
    }

    /// Fsyncs the directory entries.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be synced.
    pub fn sync(&self) -> CoreResult<()> {
        kestrel_storage::sync_directory(&self.path)?;
        Ok(())
    }
}

fn validate_catalog_name(name: &str) -> CoreResult<()> {
    validate_name("catalog", name)
}

/// Checks that an entity type can be embedded in a file name.
///
/// # Errors
///
/// Returns [`CoreError::InvalidFormat`] for empty names or names with
/// characters other than ASCII letters, digits, `-` and `_`.
pub fn validate_entity_type(entity_type: &str) -> CoreResult<()> {
    validate_name("entity type", entity_type)
}

fn validate_name(kind: &str, name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid_format(format!(
            "{kind} name `{name}` must be non-empty ASCII letters, digits, `-` or `_`"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn names_roundtrip() {
        assert_eq!(catalog_file_name("shop", 3), "shop_3.catalog");
        assert_eq!(parse_catalog_file_name("shop", "shop_3.catalog"), Some(3));
        assert_eq!(parse_catalog_file_name("shop", "shop_x.catalog"), None);
        assert_eq!(parse_catalog_file_name("shop", "shopping_3.catalog"), None);
        assert_eq!(parse_wal_file_name("shop", "shop_12.wal"), Some(12));
    }

    #[test]
    fn entity_names_parse_from_the_right() {
        let parsed = parse_entity_file_name("gift_card_7_2.entity").unwrap();
        assert_eq!(parsed.entity_type, "gift_card");
        assert_eq!(parsed.entity_type_primary_key, 7);
        assert_eq!(parsed.file_index, 2);
        assert!(parse_entity_file_name("_7_2.entity").is_none());
        assert!(parse_entity_file_name("product_2.entity").is_none());
    }

    #[test]
    fn lock_prevents_second_writer() {
        let temp = tempdir().unwrap();
        let _first = CatalogDir::open(temp.path(), "shop", true).unwrap();
        assert!(matches!(
            CatalogDir::open(temp.path(), "shop", true),
            Err(CoreError::CatalogLocked)
        ));
        let reader = CatalogDir::open_unlocked(temp.path(), "shop").unwrap();
        assert!(!reader.is_locked());
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(CatalogDir::open(temp.path(), "shop", true).unwrap());
        CatalogDir::open(temp.path(), "shop", false).unwrap();
    }

    #[test]
    fn lists_only_catalog_files() {
        let temp = tempdir().unwrap();
        let dir = CatalogDir::open(temp.path(), "shop", true).unwrap();
        for name in ["shop.boot", "shop_0.catalog", "brand_1_0.entity", "shop_0.wal", "notes.txt"] {
            fs::write(dir.file_path(name), b"x").unwrap();
        }
        let kinds: Vec<_> = dir.list_files().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds.len(), 4);
        assert!(kinds.contains(&CatalogFileKind::Bootstrap));
        assert!(kinds.contains(&CatalogFileKind::Wal { index: 0 }));
    }

    #[test]
    fn rejects_bad_catalog_names() {
        let temp = tempdir().unwrap();
        assert!(CatalogDir::open(temp.path(), "", true).is_err());
        assert!(CatalogDir::open(temp.path(), "a/b", true).is_err());
    }
}
