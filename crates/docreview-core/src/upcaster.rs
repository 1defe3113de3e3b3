//! Event upcasting.
//!
//! Stored payloads are never rewritten. When code expects a newer payload
//! shape than the one on disk, the registry walks a chain of single-step
//! transforms (`v1 -> v2 -> v3 ...`) before the payload is deserialized.
//!
//! Versions that the current code still reads directly (for example because
//! the newer shape only added optional fields) need no transform. Declare
//! them with `min_readable` and the chain simply stops there.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::DomainError;
use crate::repository::StoredEvent;

/// A single-step payload transform from version `n` to `n + 1`.
pub type UpcastFn =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

struct EventSchema {
    current: i32,
    min_readable: i32,
    steps: BTreeMap<i32, UpcastFn>,
}

/// Registry of upcast chains keyed by event type.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct UpcasterRegistry {
    schemas: HashMap<String, Arc<EventSchema>>,
}

impl fmt::Debug for UpcasterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (event_type, schema) in &self.schemas {
            map.entry(
                event_type,
                &format_args!(
                    "current=v{} min_readable=v{} steps={:?}",
                    schema.current,
                    schema.min_readable,
                    schema.steps.keys().collect::<Vec<_>>()
                ),
            );
        }
        map.finish()
    }
}

impl UpcasterRegistry {
    /// Creates an empty registry. Undeclared event types pass through as-is.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the schema version current code produces for `event_type`
    /// and the oldest version it can still deserialize without upcasting.
    #[must_use]
    pub fn with_schema(mut self, event_type: &str, current: i32, min_readable: i32) -> Self {
        let steps = self
            .schemas
            .remove(event_type)
            .map(|schema| schema.steps.clone())
            .unwrap_or_default();
        self.schemas.insert(
            event_type.to_owned(),
            Arc::new(EventSchema {
                current,
                min_readable: min_readable.min(current),
                steps,
            }),
        );
        self
    }

    /// Registers the transform that lifts `event_type` payloads from
    /// `from_version` to `from_version + 1`.
    ///
    /// If the type was not declared yet, the current version is raised to
    /// `from_version + 1`.
    #[must_use]
    pub fn with_upcaster<F>(mut self, event_type: &str, from_version: i32, transform: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        let (current, min_readable, mut steps) = match self.schemas.remove(event_type) {
            Some(schema) => (schema.current, schema.min_readable, schema.steps.clone()),
            None => (from_version + 1, from_version + 1, BTreeMap::new()),
        };
        steps.insert(from_version, Arc::new(transform));
        let current = current.max(from_version + 1);
        self.schemas.insert(
            event_type.to_owned(),
            Arc::new(EventSchema {
                current,
                min_readable: min_readable.min(current),
                steps,
            }),
        );
        self
    }

    /// Current schema version for `event_type`, if declared.
    #[must_use]
    pub fn current_version(&self, event_type: &str) -> Option<i32> {
        self.schemas.get(event_type).map(|schema| schema.current)
    }

    /// Brings `payload` from `schema_version` to the newest version reachable.
    ///
    /// Returns the resulting version alongside the payload.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::SchemaIncompatible` if the stored version is
    /// newer than the running code, if no transform path exists to a
    /// readable version, or if a transform rejects the payload.
    pub fn upcast(
        &self,
        event_type: &str,
        schema_version: i32,
        payload: serde_json::Value,
    ) -> Result<(i32, serde_json::Value), DomainError> {
        let Some(schema) = self.schemas.get(event_type) else {
            return Ok((schema_version, payload));
        };

        let incompatible = |version: i32, reason: String| DomainError::SchemaIncompatible {
            event_type: event_type.to_owned(),
            schema_version: version,
            reason,
        };

        if schema_version > schema.current {
            return Err(incompatible(
                schema_version,
                format!(
                    "stored version is newer than the current v{}",
                    schema.current
                ),
            ));
        }

        let mut version = schema_version;
        let mut payload = payload;
        while version < schema.current {
            match schema.steps.get(&version) {
                Some(step) => {
                    payload = step(payload).map_err(|reason| {
                        incompatible(version, format!("upcast from v{version} failed: {reason}"))
                    })?;
                    version += 1;
                }
                None if version >= schema.min_readable => break,
                None => {
                    return Err(incompatible(
                        schema_version,
                        format!(
                            "no upcaster from v{version} and v{} is the oldest readable version",
                            schema.min_readable
                        ),
                    ));
                }
            }
        }

        Ok((version, payload))
    }

    /// Returns a copy of `event` with its payload upcast.
    ///
    /// # Errors
    ///
    /// See [`UpcasterRegistry::upcast`].
    pub fn upcast_event(&self, event: &StoredEvent) -> Result<StoredEvent, DomainError> {
        let (schema_version, payload) =
            self.upcast(&event.event_type, event.schema_version, event.payload.clone())?;
        Ok(StoredEvent {
            schema_version,
            payload,
            ..event.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_field(
        name: &'static str,
        value: serde_json::Value,
    ) -> impl Fn(serde_json::Value) -> Result<serde_json::Value, String> {
        move |mut payload| {
            let object = payload
                .as_object_mut()
                .ok_or_else(|| "payload is not an object".to_owned())?;
            object.entry(name).or_insert_with(|| value.clone());
            Ok(payload)
        }
    }

    #[test]
    fn test_undeclared_event_type_passes_through() {
        let registry = UpcasterRegistry::new();

        let (version, payload) = registry
            .upcast("unknown.event", 7, json!({"a": 1}))
            .unwrap();

        assert_eq!(version, 7);
        assert_eq!(payload, json!({"a": 1}));
    }

    #[test]
    fn test_chain_applies_every_step_in_order() {
        // Arrange
        let registry = UpcasterRegistry::new()
            .with_upcaster("doc.uploaded", 1, add_field("file_size", json!(0)))
            .with_upcaster("doc.uploaded", 2, |mut payload| {
                let size = payload["file_size"].clone();
                payload
                    .as_object_mut()
                    .ok_or_else(|| "not an object".to_owned())?
                    .insert("size_bytes".into(), size);
                Ok(payload)
            });

        // Act
        let (version, payload) = registry
            .upcast("doc.uploaded", 1, json!({"filename": "a.pdf"}))
            .unwrap();

        // Assert
        assert_eq!(version, 3);
        assert_eq!(payload["file_size"], json!(0));
        assert_eq!(payload["size_bytes"], json!(0));
        assert_eq!(registry.current_version("doc.uploaded"), Some(3));
    }

    #[test]
    fn test_current_version_is_untouched() {
        let registry = UpcasterRegistry::new()
            .with_upcaster("doc.uploaded", 1, add_field("file_size", json!(0)));

        let (version, payload) = registry
            .upcast("doc.uploaded", 2, json!({"file_size": 10}))
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(payload, json!({"file_size": 10}));
    }

    #[test]
    fn test_directly_readable_version_needs_no_upcaster() {
        let registry = UpcasterRegistry::new().with_schema("doc.renamed", 3, 2);

        let (version, payload) = registry
            .upcast("doc.renamed", 2, json!({"title": "x"}))
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(payload, json!({"title": "x"}));
    }

    #[test]
    fn test_missing_path_is_schema_incompatible() {
        let registry = UpcasterRegistry::new().with_schema("doc.renamed", 3, 3);

        let err = registry
            .upcast("doc.renamed", 1, json!({}))
            .unwrap_err();

        match err {
            DomainError::SchemaIncompatible {
                event_type,
                schema_version,
                ..
            } => {
                assert_eq!(event_type, "doc.renamed");
                assert_eq!(schema_version, 1);
            }
            other => panic!("expected SchemaIncompatible, got {other:?}"),
        }
    }

    #[test]
    fn test_newer_stored_version_is_schema_incompatible() {
        let registry = UpcasterRegistry::new().with_schema("doc.renamed", 2, 1);

        let err = registry.upcast("doc.renamed", 5, json!({})).unwrap_err();

        assert!(matches!(err, DomainError::SchemaIncompatible { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_failing_transform_is_schema_incompatible() {
        let registry = UpcasterRegistry::new()
            .with_upcaster("doc.uploaded", 1, add_field("file_size", json!(0)));

        let err = registry
            .upcast("doc.uploaded", 1, json!("not an object"))
            .unwrap_err();

        assert!(matches!(err, DomainError::SchemaIncompatible { .. }));
    }

    #[test]
    fn test_with_schema_keeps_registered_steps() {
        let registry = UpcasterRegistry::new()
            .with_upcaster("doc.uploaded", 1, add_field("file_size", json!(0)))
            .with_schema("doc.uploaded", 2, 2);

        let (version, payload) = registry.upcast("doc.uploaded", 1, json!({})).unwrap();

        assert_eq!(version, 2);
        assert_eq!(payload["file_size"], json!(0));
    }
}
