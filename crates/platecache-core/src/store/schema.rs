//! Versioned, additive-only partition schema.
//!
//! Each schema version is a list of changes applied on top of the previous
//! one. Changes only ever create partitions or indexes; nothing is dropped, so
//! a store written by any version can be opened by any later version.

use serde::{Deserialize, Serialize};

/// Partition holding restaurant payloads (collection snapshot and items).
pub const RESTAURANTS: &str = "restaurants";

/// Partition holding review records.
pub const REVIEWS: &str = "reviews";

/// Partition holding the pending write queue.
pub const PENDING: &str = "pending";

/// Non-unique index on `reviews` by restaurant id.
pub const RESTAURANT_ID_INDEX: &str = "restaurant_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    /// Top-level field of the record value the index is built on.
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSchema {
    pub name: String,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl PartitionSchema {
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Schema {
    pub version: u32,
    #[serde(default)]
    pub partitions: Vec<PartitionSchema>,
}

#[derive(Debug, Clone, Copy)]
enum Change {
    CreatePartition {
        name: &'static str,
        auto_increment: bool,
    },
    CreateIndex {
        partition: &'static str,
        name: &'static str,
        field: &'static str,
    },
}

/// Schema steps, in version order.
const MIGRATIONS: &[(u32, &[Change])] = &[
    (
        1,
        &[Change::CreatePartition {
            name: RESTAURANTS,
            auto_increment: false,
        }],
    ),
    (
        2,
        &[
            Change::CreatePartition {
                name: REVIEWS,
                auto_increment: false,
            },
            Change::CreateIndex {
                partition: REVIEWS,
                name: RESTAURANT_ID_INDEX,
                field: "restaurant_id",
            },
        ],
    ),
    (
        3,
        &[Change::CreatePartition {
            name: PENDING,
            auto_increment: true,
        }],
    ),
];

/// Latest schema version known to this build.
pub const SCHEMA_VERSION: u32 = 3;

impl Schema {
    /// The schema produced by running every migration on an empty store.
    pub fn latest() -> Self {
        Self::default().upgraded()
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionSchema> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Apply every migration above the current version.
    ///
    /// A schema written by a newer build is returned unchanged apart from
    /// making sure this build's partitions exist; the version never goes down.
    pub fn upgraded(mut self) -> Self {
        for (version, changes) in MIGRATIONS {
            if *version <= self.version && self.version <= SCHEMA_VERSION {
                continue;
            }
            for change in changes.iter() {
                self.apply(*change);
            }
        }
        self.version = self.version.max(SCHEMA_VERSION);
        self
    }

    fn apply(&mut self, change: Change) {
        match change {
            Change::CreatePartition {
                name,
                auto_increment,
            } => {
                if self.partition(name).is_none() {
                    self.partitions.push(PartitionSchema {
                        name: name.to_string(),
                        auto_increment,
                        indexes: Vec::new(),
                    });
                }
            }
            Change::CreateIndex {
                partition,
                name,
                field,
            } => {
                if let Some(p) = self.partitions.iter_mut().find(|p| p.name == partition) {
                    if p.index(name).is_none() {
                        p.indexes.push(IndexSchema {
                            name: name.to_string(),
                            field: field.to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_has_all_partitions() {
        let schema = Schema::latest();
        assert_eq!(schema.version, SCHEMA_VERSION);
        assert!(schema.partition(RESTAURANTS).is_some());
        assert!(schema.partition(PENDING).unwrap().auto_increment);
        let reviews = schema.partition(REVIEWS).unwrap();
        assert_eq!(reviews.index(RESTAURANT_ID_INDEX).unwrap().field, "restaurant_id");
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let once = Schema::latest();
        let twice = once.clone().upgraded();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_upgrade_from_v1_keeps_existing_partition() {
        let v1 = Schema {
            version: 1,
            partitions: vec![PartitionSchema {
                name: RESTAURANTS.to_string(),
                auto_increment: false,
                indexes: vec![IndexSchema {
                    name: "by_name".to_string(),
                    field: "name".to_string(),
                }],
            }],
        };
        let upgraded = v1.upgraded();
        assert_eq!(upgraded.version, SCHEMA_VERSION);
        assert_eq!(upgraded.partitions.len(), 3);
        // Indexes added by other writers survive
        assert!(upgraded.partition(RESTAURANTS).unwrap().index("by_name").is_some());
    }

    #[test]
    fn test_newer_schema_is_not_downgraded() {
        let mut future = Schema::latest();
        future.version = SCHEMA_VERSION + 2;
        future.partitions.push(PartitionSchema {
            name: "photos".to_string(),
            auto_increment: false,
            indexes: Vec::new(),
        });
        let opened = future.clone().upgraded();
        assert_eq!(opened, future);
    }
}
