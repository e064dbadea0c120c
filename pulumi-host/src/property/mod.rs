//! The engine's rich property value model.
//!
//! A [`PropertyValue`] is the payload of nearly every plugin method. On the
//! wire it travels as a `google.protobuf.Struct`; the translation between
//! the two worlds lives in [`marshal`]. Special values — assets, archives,
//! secrets, resource references, output values — are encoded as objects
//! carrying a reserved signature key whose value is a fixed magic string, so
//! no plain object can collide with them by accident.

pub mod diff;
pub mod marshal;
pub mod path;
pub mod secrets;

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use crate::urn::Urn;

/// The wire signature constants identifying special property objects.
pub mod sig {
    /// The reserved key under which a special object's signature is stored.
    pub const KEY: &str = "4dabf18193072939515e22adb298388d";
    /// The signature of an asset object.
    pub const ASSET: &str = "c44067f5952c0a294b673a41bacd8c17";
    /// The signature of an archive object.
    pub const ARCHIVE: &str = "0def7320c3a5731c473e5ecbe6d01bc7";
    /// The signature of a secret wrapper.
    pub const SECRET: &str = "1b47061264138c4ac30d75fd1265c8a7";
    /// The signature of a resource reference.
    pub const RESOURCE_REFERENCE: &str = "5cf8f73096256a8f31e491e813e4eb8e";
    /// The signature of an output value.
    pub const OUTPUT_VALUE: &str = "d0e6a833031e9bbcd3f4e8bde6ca49a4";
}

/// The sentinel string standing in for a value that is not yet known.
pub const UNKNOWN_VALUE: &str = "04da6b54-80e4-46f7-96ec-b56ff0331ba9";

/// The reserved prefix marking internal keys that are never sent to plugins
/// when internal-key skipping is on.
pub const INTERNAL_KEY_PREFIX: &str = "__";

/// A key in a property map: an opaque, non-empty string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKey(String);

impl PropertyKey {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        debug_assert!(!key.is_empty(), "property keys must be non-empty");
        PropertyKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the key is reserved for the engine's internal use.
    pub fn is_internal(&self) -> bool {
        self.0.starts_with(INTERNAL_KEY_PREFIX)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        PropertyKey::new(s)
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        PropertyKey::new(s)
    }
}

impl Borrow<str> for PropertyKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// An object-valued node of the property model; the payload of most plugin
/// methods.
pub type PropertyMap = BTreeMap<PropertyKey, PropertyValue>;

/// A primitive-kind hint attached to an unknown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownHint {
    Bool,
    Number,
    #[default]
    String,
    Array,
    Object,
    Asset,
    Archive,
}

/// The contents of an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetBody {
    /// Literal text contents.
    Text(String),
    /// A path to a local file holding the contents.
    Path(String),
    /// A URI the contents can be fetched from.
    Uri(String),
}

/// A blob of textual or binary data, identified by the SHA-256 of its
/// logical content. The body is absent when contents were elided in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub hash: String,
    pub body: Option<AssetBody>,
}

/// The contents of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveBody {
    /// A literal map of member names to assets or sub-archives.
    Assets(BTreeMap<String, AssetOrArchive>),
    /// A path to a local archive file.
    Path(String),
    /// A URI the archive can be fetched from.
    Uri(String),
}

/// A collection of named assets, identified by the SHA-256 of its logical
/// content. The body is absent when contents were elided in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub hash: String,
    pub body: Option<ArchiveBody>,
}

/// Either an asset or an archive; the member type of an archive's asset map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOrArchive {
    Asset(Asset),
    Archive(Archive),
}

/// A first-class reference to another resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    pub urn: Urn,
    /// The referenced resource's ID, for custom resources. An empty string
    /// means the ID exists but is not yet known; consumers treat it as
    /// unknown.
    pub id: Option<String>,
    pub package_version: String,
}

/// The canonical lifted form of a possibly unknown, possibly secret value
/// with dependency information. `Unknown` and `Secret` are the older lowered
/// forms; the codec converts in both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputValue {
    pub value: Option<Box<PropertyValue>>,
    pub known: bool,
    pub secret: bool,
    pub dependencies: Vec<Urn>,
}

/// A value exchanged with plugins.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<PropertyValue>),
    Object(PropertyMap),
    Asset(Asset),
    Archive(Archive),
    /// A value that will not be known until the resource is actually
    /// created or updated.
    Unknown(UnknownHint),
    /// A value whose plaintext must not be shown to the user. Never nests
    /// directly under another secret.
    Secret(Box<PropertyValue>),
    ResourceReference(ResourceReference),
    Output(OutputValue),
}

impl PropertyValue {
    pub fn string(s: impl Into<String>) -> Self {
        PropertyValue::String(s.into())
    }

    /// Wrap a value in a secret marker, flattening nested secrets.
    pub fn secret(value: PropertyValue) -> Self {
        match value {
            v @ PropertyValue::Secret(_) => v,
            v => PropertyValue::Secret(Box::new(v)),
        }
    }

    /// An unknown value with the default string hint.
    pub fn unknown() -> Self {
        PropertyValue::Unknown(UnknownHint::default())
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, PropertyValue::Secret(_))
    }

    pub fn is_unknown(&self) -> bool {
        match self {
            PropertyValue::Unknown(_) => true,
            PropertyValue::Output(o) => !o.known,
            _ => false,
        }
    }

    /// True if this value or any value nested within it is unknown.
    pub fn contains_unknowns(&self) -> bool {
        match self {
            PropertyValue::Unknown(_) => true,
            PropertyValue::Output(o) => !o.known,
            PropertyValue::Array(items) => items.iter().any(PropertyValue::contains_unknowns),
            PropertyValue::Object(map) => contains_unknowns(map),
            PropertyValue::Secret(inner) => inner.contains_unknowns(),
            _ => false,
        }
    }

    /// True if this value or any value nested within it is secret.
    pub fn contains_secrets(&self) -> bool {
        match self {
            PropertyValue::Secret(_) => true,
            PropertyValue::Output(o) => {
                o.secret || o.value.as_deref().is_some_and(PropertyValue::contains_secrets)
            }
            PropertyValue::Array(items) => items.iter().any(PropertyValue::contains_secrets),
            PropertyValue::Object(map) => map.values().any(PropertyValue::contains_secrets),
            _ => false,
        }
    }

    /// Lower an output value to the older unknown/secret forms.
    pub(crate) fn lower_output(output: &OutputValue) -> PropertyValue {
        let inner = if !output.known {
            PropertyValue::unknown()
        } else {
            output
                .value
                .as_deref()
                .cloned()
                .unwrap_or(PropertyValue::Null)
        };
        if output.secret {
            PropertyValue::secret(inner)
        } else {
            inner
        }
    }

    /// A plain-JSON rendition of the value with secrets unwrapped and
    /// unknowns nulled. Used where plugins expect ordinary JSON, e.g. the
    /// serialized configuration handed to policy packs; assets and archives
    /// do not appear in such data and render as null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null | PropertyValue::Unknown(_) => serde_json::Value::Null,
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
            PropertyValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(PropertyValue::to_json).collect())
            }
            PropertyValue::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.as_str().to_string(), v.to_json()))
                    .collect(),
            ),
            PropertyValue::Secret(inner) => inner.to_json(),
            PropertyValue::Output(o) => match (&o.value, o.known) {
                (Some(v), true) => v.to_json(),
                _ => serde_json::Value::Null,
            },
            PropertyValue::ResourceReference(r) => match &r.id {
                Some(id) if !id.is_empty() => serde_json::Value::String(id.clone()),
                _ => serde_json::Value::String(r.urn.to_string()),
            },
            PropertyValue::Asset(_) | PropertyValue::Archive(_) => serde_json::Value::Null,
        }
    }
}

/// True if any value in the map, recursively, is unknown.
pub fn contains_unknowns(map: &PropertyMap) -> bool {
    map.values().any(PropertyValue::contains_unknowns)
}

/// True if any value in the map, recursively, is secret.
pub fn contains_secrets(map: &PropertyMap) -> bool {
    map.values().any(PropertyValue::contains_secrets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(entries: Vec<(&str, PropertyValue)>) -> PropertyMap {
        entries
            .into_iter()
            .map(|(k, v)| (PropertyKey::from(k), v))
            .collect()
    }

    #[test]
    fn secret_never_nests() {
        let inner = PropertyValue::secret(PropertyValue::string("hunter2"));
        let outer = PropertyValue::secret(inner.clone());
        assert_eq!(outer, inner);
    }

    #[test]
    fn unknown_detection_sees_through_wrappers() {
        let map = obj(vec![
            ("region", PropertyValue::string("us-west-2")),
            (
                "zone",
                PropertyValue::secret(PropertyValue::Unknown(UnknownHint::String)),
            ),
        ]);
        assert!(contains_unknowns(&map));

        let known = obj(vec![("region", PropertyValue::string("us-west-2"))]);
        assert!(!contains_unknowns(&known));
    }

    #[test]
    fn output_values_carry_unknown_and_secret() {
        let out = PropertyValue::Output(OutputValue {
            value: None,
            known: false,
            secret: true,
            dependencies: vec![],
        });
        assert!(out.contains_unknowns());
        assert!(out.contains_secrets());
    }

    #[test]
    fn to_json_unwraps_secrets() {
        let v = PropertyValue::secret(PropertyValue::Object(obj(vec![(
            "token",
            PropertyValue::string("abc"),
        )])));
        assert_eq!(v.to_json(), serde_json::json!({"token": "abc"}));
    }
}
