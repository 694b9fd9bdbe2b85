//! Version-to-service lookup.
//!
//! Readers pin a catalog version and need the service instance (file
//! generation) that was current at that version. [`VersionedServices`]
//! keeps an immutable, sorted list of `(version, service)` pairs published
//! through an [`ArcSwap`]. The writer publishes a new copy on every change
//! and never mutates a published list, so lookups are a single atomic load
//! followed by a binary search.
//!
//! A retired generation leaves a gap: versions it served resolve to an
//! error instead of falling through to an older generation.

use crate::error::{CoreError, CoreResult};
use crate::types::CatalogVersion;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// One registered service generation.
#[derive(Debug)]
pub struct Versioned<T> {
    /// First catalog version served by this generation.
    pub version: CatalogVersion,
    /// The service.
    pub service: Arc<T>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            service: Arc::clone(&self.service),
        }
    }
}

#[derive(Debug)]
struct Slot<T> {
    version: CatalogVersion,
    // `None` once the generation was retired.
    service: Option<Arc<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            service: self.service.clone(),
        }
    }
}

#[derive(Debug)]
struct Published<T> {
    older: Vec<Slot<T>>,
    newest: Versioned<T>,
}

impl<T> Clone for Published<T> {
    fn clone(&self) -> Self {
        Self {
            older: self.older.clone(),
            newest: self.newest.clone(),
        }
    }
}

/// Sorted, copy-on-write index from catalog version to service.
#[derive(Debug)]
pub struct VersionedServices<T> {
    published: ArcSwap<Published<T>>,
    writer: Mutex<()>,
}

impl<T> VersionedServices<T> {
    /// An index with a single generation.
    #[must_use]
    pub fn new(version: CatalogVersion, service: Arc<T>) -> Self {
        Self {
            published: ArcSwap::from_pointee(Published {
                older: Vec::new(),
                newest: Versioned { version, service },
            }),
            writer: Mutex::new(()),
        }
    }

    /// Every retained generation, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Versioned<T>> {
        let published = self.published.load();
        published
            .older
            .iter()
            .filter_map(|slot| {
                slot.service.as_ref().map(|service| Versioned {
                    version: slot.version,
                    service: Arc::clone(service),
                })
            })
            .chain(std::iter::once(published.newest.clone()))
            .collect()
    }

    /// The service for the greatest registered version `<= version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] if `version` precedes the
    /// oldest retained generation or falls into a retired one.
    pub fn service_for(&self, version: CatalogVersion) -> CoreResult<Arc<T>> {
        let published = self.published.load();
        if version >= published.newest.version {
            return Ok(Arc::clone(&published.newest.service));
        }
        let index = published.older.partition_point(|slot| slot.version <= version);
        let Some(slot) = index.checked_sub(1).map(|i| &published.older[i]) else {
            return Err(CoreError::invariant(format!(
                "no service generation registered at or before {version} (oldest is {})",
                published
                    .older
                    .first()
                    .map_or(published.newest.version, |slot| slot.version)
            )));
        };
        match &slot.service {
            Some(service) => Ok(Arc::clone(service)),
            None => Err(CoreError::invariant(format!(
                "generation serving {version} (from {}) is no longer addressable",
                slot.version
            ))),
        }
    }

    /// The newest generation.
    #[must_use]
    pub fn latest(&self) -> Versioned<T> {
        self.published.load().newest.clone()
    }

    /// Number of retained generations.
    #[must_use]
    pub fn len(&self) -> usize {
        let published = self.published.load();
        1 + published
            .older
            .iter()
            .filter(|slot| slot.service.is_some())
            .count()
    }

    /// Always `false`: the newest generation is never retired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Publishes a new generation serving `version` and later.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] unless `version` is
    /// greater than the newest registered version.
    pub fn register(&self, version: CatalogVersion, service: Arc<T>) -> CoreResult<()> {
        let _writer = self.writer.lock();
        let current = self.published.load_full();
        if version <= current.newest.version {
            return Err(CoreError::invariant(format!(
                "service registered at {version} after {}",
                current.newest.version
            )));
        }
        let mut next = Published::clone(&current);
        next.older.push(Slot {
            version: current.newest.version,
            service: Some(Arc::clone(&current.newest.service)),
        });
        next.newest = Versioned { version, service };
        self.published.store(Arc::new(next));
        Ok(())
    }

    /// Swaps the newest generation for one serving the same version.
    ///
    /// Used while warming up, when the whole catalog lives at one version
    /// and nobody can be pinned to the replaced generation. Returns the
    /// replaced service.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] if `version` is not the
    /// newest registered version.
    pub fn replace_latest(&self, version: CatalogVersion, service: Arc<T>) -> CoreResult<Arc<T>> {
        let _writer = self.writer.lock();
        let current = self.published.load_full();
        if current.newest.version != version {
            return Err(CoreError::invariant(format!(
                "cannot replace generation {} with one for {version}",
                current.newest.version
            )));
        }
        let mut next = Published::clone(&current);
        let replaced = std::mem::replace(&mut next.newest.service, service);
        self.published.store(Arc::new(next));
        Ok(replaced)
    }

    /// Drops every generation no reader at `version` or later can address
    /// and returns them.
    ///
    /// The generation serving `version` itself is kept.
    pub fn retire_below(&self, version: CatalogVersion) -> Vec<Versioned<T>> {
        let _writer = self.writer.lock();
        let current = self.published.load_full();
        let keep_from = if version >= current.newest.version {
            current.older.len()
        } else {
            current
                .older
                .partition_point(|slot| slot.version <= version)
                .saturating_sub(1)
        };
        if keep_from == 0 {
            return Vec::new();
        }
        let retired = current.older[..keep_from]
            .iter()
            .filter_map(|slot| {
                slot.service.as_ref().map(|service| Versioned {
                    version: slot.version,
                    service: Arc::clone(service),
                })
            })
            .collect();
        self.published.store(Arc::new(Published {
            older: current.older[keep_from..].to_vec(),
            newest: current.newest.clone(),
        }));
        retired
    }

    /// Retires one superseded generation and returns it.
    ///
    /// Versions it served stop resolving. The newest generation is never
    /// retired.
    pub fn retire_generation(&self, version: CatalogVersion) -> Option<Versioned<T>> {
        let _writer = self.writer.lock();
        let current = self.published.load_full();
        let position = current
            .older
            .iter()
            .position(|slot| slot.version == version && slot.service.is_some())?;
        let mut next = Published::clone(&current);
        let service = next.older[position].service.take()?;
        self.published.store(Arc::new(next));
        Some(Versioned { version, service })
    }
}
