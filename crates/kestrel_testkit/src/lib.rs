//! # Kestrel Testkit
//!
//! Test utilities for Kestrel storage.
//!
//! This crate provides:
//! - Catalog fixtures in temporary directories with sample storage parts
//! - Property-based test generators using proptest
//! - Fault injection: failing backends, torn tails and flipped bytes
//! - A recording [`StorageObserver`](kestrel_core::StorageObserver)
//! - Builders for catalogs in the legacy protocol 1 layout
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kestrel_testkit::prelude::*;
//!
//! #[test]
//! fn survives_reopen() {
//!     let fixture = TestCatalog::create();
//!     let products = fixture.catalog().create_entity_collection("product", WARM_UP).unwrap();
//!     products.parts().put(WARM_UP, &Product::sample(1)).unwrap();
//!     fixture.catalog().go_live().unwrap();
//!     let fixture = fixture.reopen();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod legacy;
pub mod observer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::legacy::*;
    pub use crate::observer::*;
    pub use kestrel_core::CatalogVersion;

    /// The warm-up version.
    pub const WARM_UP: CatalogVersion = CatalogVersion::WARM_UP;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use legacy::*;
pub use observer::*;
