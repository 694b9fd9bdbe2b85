//! Property-based test generators using proptest.
//!
//! Provides strategies for generating storage parts and version-ordered
//! workloads, plus a plain in-memory model to compare a catalog against.

use crate::fixtures::Product;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for generating valid entity type names.
pub fn entity_type_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,15}").expect("Invalid regex")
}

/// Strategy for generating products with keys in `0..max_key`.
pub fn product_strategy(max_key: i64) -> impl Strategy<Value = Product> {
    (0..max_key, "[a-z ]{0,24}", any::<u32>()).prop_map(|(id, name, price)| Product {
        id,
        name,
        price_cents: u64::from(price),
    })
}

/// One mutation of a product collection.
#[derive(Debug, Clone)]
pub enum PartOperation {
    /// Insert or replace a product.
    Put(Product),
    /// Remove the product with this key.
    Remove(i64),
}

/// Strategy for a single operation on keys in `0..max_key`.
pub fn part_operation_strategy(max_key: i64) -> impl Strategy<Value = PartOperation> {
    prop_oneof![
        3 => product_strategy(max_key).prop_map(PartOperation::Put),
        1 => (0..max_key).prop_map(PartOperation::Remove),
    ]
}

/// Strategy for `1..=max_versions` batches of operations, one batch per
/// catalog version.
pub fn version_batches_strategy(
    max_versions: usize,
    max_ops: usize,
    max_key: i64,
) -> impl Strategy<Value = Vec<Vec<PartOperation>>> {
    prop::collection::vec(
        prop::collection::vec(part_operation_strategy(max_key), 0..=max_ops),
        1..=max_versions,
    )
}

/// Reference model: the expected products after each version.
#[derive(Debug, Clone, Default)]
pub struct ProductModel {
    current: BTreeMap<i64, Product>,
    history: Vec<BTreeMap<i64, Product>>,
}

impl ProductModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one operation to the open version.
    pub fn apply(&mut self, operation: &PartOperation) {
        match operation {
            PartOperation::Put(product) => {
                self.current.insert(product.id, product.clone());
            }
            PartOperation::Remove(id) => {
                self.current.remove(id);
            }
        }
    }

    /// Seals the open version; it becomes `version_count() - 1`.
    pub fn seal(&mut self) {
        self.history.push(self.current.clone());
    }

    /// Number of sealed versions.
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.history.len()
    }

    /// Products of sealed version `index`.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&BTreeMap<i64, Product>> {
        self.history.get(index)
    }

    /// Products of the open version.
    #[must_use]
    pub fn current(&self) -> &BTreeMap<i64, Product> {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_entity_type_is_valid(name in entity_type_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.len() <= 16);
            prop_assert!(name.chars().next().is_some_and(|c| c.is_ascii_lowercase()));
        }

        #[test]
        fn test_model_history_is_frozen(batches in version_batches_strategy(4, 8, 16)) {
            let mut model = ProductModel::new();
            let mut sizes = Vec::new();
            for batch in &batches {
                for operation in batch {
                    model.apply(operation);
                }
                model.seal();
                sizes.push(model.current().len());
            }
            prop_assert_eq!(model.version_count(), batches.len());
            for (index, size) in sizes.iter().enumerate() {
                prop_assert_eq!(model.at(index).map(BTreeMap::len), Some(*size));
            }
        }
    }
}
