//! Entity types, foreign keys, and the dependency order derived from them.
//!
//! The order is computed once when the engine is built. An entity type that
//! references another always comes after the type it references, so a batch
//! assembled in this order never contains a dependent item ahead of the
//! item it points at.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors in an entity schema declaration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The same entity type was declared twice.
    #[error("entity type {0} declared more than once")]
    DuplicateEntity(String),

    /// A foreign key targets an undeclared entity type.
    #[error("{entity}.{field} references unknown entity type {target}")]
    UnknownTarget {
        /// Declaring entity type.
        entity: String,
        /// Foreign-key field.
        field: String,
        /// Missing target.
        target: String,
    },

    /// The foreign-key graph has a cycle, so no total order exists.
    #[error("dependency cycle among entity types: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// A field holding another entity's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKey {
    /// Field name in the declaring entity.
    pub field: String,
    /// Referenced entity type.
    pub target: String,
}

/// Declaration of a single entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    /// Entity type name, used as the collection name.
    pub name: String,
    /// Foreign keys declared by this type.
    pub foreign_keys: Vec<ForeignKey>,
}

impl EntityDef {
    /// Declares an entity type without foreign keys.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a foreign key.
    pub fn references(mut self, field: impl Into<String>, target: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            field: field.into(),
            target: target.into(),
        });
        self
    }
}

/// The set of synchronized entity types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitySchema {
    entities: Vec<EntityDef>,
}

impl EntitySchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity type.
    pub fn with_entity(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    /// Returns the declared entity types in declaration order.
    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    /// Schema of the school enrollment domain.
    pub fn school_enrollment() -> Self {
        Self::new()
            .with_entity(EntityDef::new("school"))
            .with_entity(EntityDef::new("guardian"))
            .with_entity(
                EntityDef::new("student")
                    .references("schoolId", "school")
                    .references("guardianId", "guardian"),
            )
            .with_entity(EntityDef::new("classGroup").references("schoolId", "school"))
            .with_entity(
                EntityDef::new("enrollment")
                    .references("studentId", "student")
                    .references("classGroupId", "classGroup"),
            )
            .with_entity(EntityDef::new("payment").references("enrollmentId", "enrollment"))
    }

    /// Computes the dependency order.
    ///
    /// Ties are broken by declaration order, so the result is deterministic.
    pub fn dependency_order(&self) -> Result<DependencyOrder, SchemaError> {
        let mut declared = HashSet::new();
        for entity in &self.entities {
            if !declared.insert(entity.name.as_str()) {
                return Err(SchemaError::DuplicateEntity(entity.name.clone()));
            }
        }

        for entity in &self.entities {
            for fk in &entity.foreign_keys {
                if !declared.contains(fk.target.as_str()) {
                    return Err(SchemaError::UnknownTarget {
                        entity: entity.name.clone(),
                        field: fk.field.clone(),
                        target: fk.target.clone(),
                    });
                }
            }
        }

        let mut placed: HashSet<&str> = HashSet::new();
        let mut order: Vec<String> = Vec::with_capacity(self.entities.len());

        while order.len() < self.entities.len() {
            let next = self.entities.iter().find(|entity| {
                !placed.contains(entity.name.as_str())
                    && entity
                        .foreign_keys
                        .iter()
                        .all(|fk| placed.contains(fk.target.as_str()))
            });

            match next {
                Some(entity) => {
                    placed.insert(entity.name.as_str());
                    order.push(entity.name.clone());
                }
                None => {
                    let remaining = self
                        .entities
                        .iter()
                        .filter(|entity| !placed.contains(entity.name.as_str()))
                        .map(|entity| entity.name.clone())
                        .collect();
                    return Err(SchemaError::Cycle(remaining));
                }
            }
        }

        let ranks = order
            .iter()
            .enumerate()
            .map(|(rank, name)| (name.clone(), rank))
            .collect();
        let foreign_keys = self
            .entities
            .iter()
            .map(|entity| (entity.name.clone(), entity.foreign_keys.clone()))
            .collect();

        Ok(DependencyOrder {
            order,
            ranks,
            foreign_keys,
        })
    }
}

/// Static total order over entity types.
#[derive(Debug, Clone)]
pub struct DependencyOrder {
    order: Vec<String>,
    ranks: HashMap<String, usize>,
    foreign_keys: HashMap<String, Vec<ForeignKey>>,
}

impl DependencyOrder {
    /// Entity types, referenced types first.
    pub fn entity_types(&self) -> &[String] {
        &self.order
    }

    /// Position of an entity type in the order.
    pub fn rank(&self, entity_type: &str) -> Option<usize> {
        self.ranks.get(entity_type).copied()
    }

    /// Foreign keys declared by an entity type.
    pub fn foreign_keys(&self, entity_type: &str) -> &[ForeignKey] {
        self.foreign_keys
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Entity types (with the field) that reference `target`.
    pub fn referencing<'a>(&'a self, target: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.order.iter().flat_map(move |entity| {
            self.foreign_keys(entity)
                .iter()
                .filter(move |fk| fk.target == target)
                .map(move |fk| (entity.as_str(), fk.field.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_order_respects_foreign_keys() {
        let order = EntitySchema::school_enrollment().dependency_order().unwrap();
        let schema = EntitySchema::school_enrollment();

        for entity in schema.entities() {
            let rank = order.rank(&entity.name).unwrap();
            for fk in &entity.foreign_keys {
                assert!(
                    order.rank(&fk.target).unwrap() < rank,
                    "{} must follow {}",
                    entity.name,
                    fk.target
                );
            }
        }
    }

    #[test]
    fn order_is_stable_for_declaration_order() {
        let schema = EntitySchema::new()
            .with_entity(EntityDef::new("child").references("parentId", "parent"))
            .with_entity(EntityDef::new("parent"))
            .with_entity(EntityDef::new("standalone"));

        let order = schema.dependency_order().unwrap();
        assert_eq!(order.entity_types(), ["parent", "child", "standalone"]);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let schema =
            EntitySchema::new().with_entity(EntityDef::new("child").references("parentId", "parent"));
        assert!(matches!(
            schema.dependency_order(),
            Err(SchemaError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let schema = EntitySchema::new()
            .with_entity(EntityDef::new("a").references("bId", "b"))
            .with_entity(EntityDef::new("b").references("aId", "a"))
            .with_entity(EntityDef::new("c"));

        match schema.dependency_order() {
            Err(SchemaError::Cycle(members)) => assert_eq!(members, ["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn duplicates_are_rejected() {
        let schema = EntitySchema::new()
            .with_entity(EntityDef::new("a"))
            .with_entity(EntityDef::new("a"));
        assert_eq!(
            schema.dependency_order().unwrap_err(),
            SchemaError::DuplicateEntity("a".into())
        );
    }

    #[test]
    fn referencing_lists_dependents() {
        let order = EntitySchema::school_enrollment().dependency_order().unwrap();
        let mut dependents: Vec<_> = order.referencing("school").collect();
        dependents.sort();
        assert_eq!(dependents, [("classGroup", "schoolId"), ("student", "schoolId")]);
    }
}
