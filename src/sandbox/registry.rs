// Operation registry built once per loaded connector

use rquickjs::{Function, Object, Value};
use std::collections::HashMap;
use std::fmt;

/// Recognized operation families of a connector module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `connection.*` (e.g. `connection.auth.validate`)
    Connection,
    /// `actions.<id>.*`
    Action,
    /// `triggers.<id>.*`
    Trigger,
    /// `methods.<name>`
    Method,
    /// `pick_lists.<name>`
    PickList,
    /// Functions exported at the top level (e.g. `test`)
    TopLevel,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Connection => "connection",
            OperationKind::Action => "action",
            OperationKind::Trigger => "trigger",
            OperationKind::Method => "method",
            OperationKind::PickList => "pick_list",
            OperationKind::TopLevel => "top_level",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index from method path to operation family
///
/// Built by walking the connector once at load time, reading own data
/// properties only so no connector getter runs during the walk. The index
/// classifies paths; the callable itself is always resolved by
/// [`traverse`] at call time so reassignments made after load are honored.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, OperationKind>,
}

/// (root key, kind, levels walked below the root key)
const FAMILIES: &[(&str, OperationKind, usize)] = &[
    ("connection", OperationKind::Connection, 2),
    ("actions", OperationKind::Action, 4),
    ("triggers", OperationKind::Trigger, 4),
    ("methods", OperationKind::Method, 1),
    ("pick_lists", OperationKind::PickList, 1),
];

impl OperationRegistry {
    /// Walk `root` and record every function in the recognized families
    ///
    /// `data_property(object, key)` must return `{value}` for an own data
    /// property and null for anything else (accessors included).
    pub fn build<'js>(root: &Value<'js>, data_property: &Function<'js>) -> Self {
        let mut registry = Self::default();
        let Some(root) = root.as_object() else {
            return registry;
        };

        let top_level = data_properties(root, data_property);
        for (key, value) in &top_level {
            if value.is_function() {
                registry.operations.insert(key.clone(), OperationKind::TopLevel);
            }
        }

        for (family, kind, levels) in FAMILIES {
            let family_root = top_level
                .iter()
                .find(|(key, _)| key == family)
                .and_then(|(_, value)| value.as_object());
            if let Some(object) = family_root {
                registry.collect(object, data_property, family, *kind, *levels);
            }
        }

        registry
    }

    fn collect<'js>(
        &mut self,
        object: &Object<'js>,
        data_property: &Function<'js>,
        prefix: &str,
        kind: OperationKind,
        levels: usize,
    ) {
        if levels == 0 {
            return;
        }
        for (key, value) in data_properties(object, data_property) {
            let path = format!("{prefix}.{key}");
            if value.is_function() {
                self.operations.insert(path, kind);
            } else if let Some(child) = value.as_object() {
                if !value.is_array() {
                    self.collect(child, data_property, &path, kind, levels - 1);
                }
            }
        }
    }

    pub fn kind_of(&self, path: &str) -> Option<OperationKind> {
        self.operations.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Registered paths, sorted
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

/// Own enumerable data properties of `object`; accessors are skipped unread
fn data_properties<'js>(
    object: &Object<'js>,
    data_property: &Function<'js>,
) -> Vec<(String, Value<'js>)> {
    object
        .keys::<String>()
        .filter_map(Result::ok)
        .filter_map(|key| {
            let found = data_property
                .call::<_, Option<Object>>((object.clone(), key.as_str()))
                .ok()??;
            let value = found.get::<_, Value>("value").ok()?;
            Some((key, value))
        })
        .collect()
}

/// Resolve a dotted path by sequential property access
///
/// Only plain reads happen along the way; nothing is invoked. An empty path
/// yields the root itself. `None` means some segment was missing.
pub fn traverse<'js>(root: &Value<'js>, path: &str) -> rquickjs::Result<Option<Value<'js>>> {
    let mut current = root.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next: Value = match current.as_object() {
            Some(object) => object.get(segment)?,
            None => return Ok(None),
        };
        if next.is_undefined() || next.is_null() {
            return Ok(None);
        }
        current = next;
    }
    Ok(Some(current))
}

/// Own enumerable top-level keys of the connector, for diagnostics
pub fn top_level_keys<'js>(root: &Value<'js>) -> Vec<String> {
    root.as_object()
        .map(|object| object.keys::<String>().filter_map(Result::ok).collect())
        .unwrap_or_default()
}
