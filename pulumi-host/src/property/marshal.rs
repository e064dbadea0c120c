//! The wire codec: translation between [`PropertyValue`]s and protobuf
//! `Struct`/`Value` trees.
//!
//! Marshaling is driven by a [`MarshalOptions`] record negotiated per plugin:
//! a plugin that does not understand secrets gets them unwrapped, one that
//! does not understand resource references gets plain IDs, and so on. The
//! same options steer decoding on the way back.

use std::collections::BTreeMap;

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value};
use thiserror::Error;

use super::{
    sig, Archive, ArchiveBody, Asset, AssetBody, AssetOrArchive, OutputValue, PropertyKey,
    PropertyMap, PropertyValue, ResourceReference, UnknownHint, UNKNOWN_VALUE,
};
use crate::urn::Urn;

/// Options controlling marshaling and unmarshaling of property values.
#[derive(Debug, Clone, Default)]
pub struct MarshalOptions {
    /// A label prefixed to error messages, conventionally the method that is
    /// marshaling (e.g. `Provider[aws].Check`).
    pub label: String,
    /// Encode unknown values as the unknown sentinel; accept the sentinel
    /// when decoding. When off, unknowns are silently dropped.
    pub keep_unknowns: bool,
    /// Fail if an unknown value is seen. Takes precedence over
    /// `keep_unknowns`.
    pub reject_unknowns: bool,
    /// Encode secrets as signed wrappers. When off, secrets are unwrapped to
    /// their inner value.
    pub keep_secrets: bool,
    /// Encode resource references as signed wrappers. When off, references
    /// lower to their ID, or URN if no ID is present.
    pub keep_resources: bool,
    /// Encode output values as signed wrappers. When off, they lower to the
    /// older secret/unknown forms.
    pub keep_output_values: bool,
    /// Drop asset/archive literal contents, retaining only hash and URI.
    pub elide_asset_contents: bool,
    /// Drop keys beginning with the reserved `__` prefix.
    pub skip_internal_keys: bool,
}

impl MarshalOptions {
    pub fn with_label(label: impl Into<String>) -> Self {
        MarshalOptions {
            label: label.into(),
            ..Default::default()
        }
    }
}

/// An error produced by the codec.
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("{label}: unexpected unknown property value")]
    UnexpectedUnknown { label: String },

    #[error("{label}: unrecognized signature '{signature}' in property map")]
    UnrecognizedSignature { label: String, signature: String },

    #[error("{label}: malformed {object} object: {reason}")]
    MalformedObject {
        label: String,
        object: &'static str,
        reason: String,
    },
}

/// Marshal a property map into its wire form.
pub fn marshal_properties(props: &PropertyMap, opts: &MarshalOptions) -> Result<Struct, MarshalError> {
    let mut fields = BTreeMap::new();
    for (key, value) in props {
        if opts.skip_internal_keys && key.is_internal() {
            continue;
        }
        if let Some(wire) = marshal_property_value(value, opts)? {
            fields.insert(key.as_str().to_string(), wire);
        }
    }
    Ok(Struct { fields })
}

/// Marshal a single property value. Returns `None` when the value is to be
/// omitted from its enclosing object (an unknown under permissive options).
pub fn marshal_property_value(
    v: &PropertyValue,
    opts: &MarshalOptions,
) -> Result<Option<Value>, MarshalError> {
    match v {
        PropertyValue::Null => Ok(Some(null())),
        PropertyValue::Bool(b) => Ok(Some(bool_value(*b))),
        PropertyValue::Number(n) => Ok(Some(number(*n))),
        PropertyValue::String(s) => Ok(Some(string(s.clone()))),
        PropertyValue::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                if let Some(wire) = marshal_property_value(item, opts)? {
                    values.push(wire);
                }
            }
            Ok(Some(Value {
                kind: Some(Kind::ListValue(ListValue { values })),
            }))
        }
        PropertyValue::Object(map) => Ok(Some(struct_value(marshal_properties(map, opts)?))),
        PropertyValue::Asset(asset) => Ok(Some(marshal_asset(asset, opts))),
        PropertyValue::Archive(archive) => marshal_archive(archive, opts).map(Some),
        PropertyValue::Unknown(_) => marshal_unknown(opts),
        PropertyValue::Secret(inner) => {
            if !opts.keep_secrets {
                return marshal_property_value(inner, opts);
            }
            let mut fields = BTreeMap::new();
            fields.insert(sig::KEY.to_string(), string(sig::SECRET.to_string()));
            if let Some(wire) = marshal_property_value(inner, opts)? {
                fields.insert("value".to_string(), wire);
            }
            Ok(Some(struct_value(Struct { fields })))
        }
        PropertyValue::ResourceReference(r) => {
            if !opts.keep_resources {
                return match &r.id {
                    Some(id) if !id.is_empty() => Ok(Some(string(id.clone()))),
                    // An empty ID means the ID is not yet known.
                    Some(_) => marshal_unknown(opts),
                    None => Ok(Some(string(r.urn.to_string()))),
                };
            }
            let mut fields = BTreeMap::new();
            fields.insert(
                sig::KEY.to_string(),
                string(sig::RESOURCE_REFERENCE.to_string()),
            );
            fields.insert("urn".to_string(), string(r.urn.to_string()));
            if let Some(id) = &r.id {
                fields.insert("id".to_string(), string(id.clone()));
            }
            if !r.package_version.is_empty() {
                fields.insert(
                    "packageVersion".to_string(),
                    string(r.package_version.clone()),
                );
            }
            Ok(Some(struct_value(Struct { fields })))
        }
        PropertyValue::Output(output) => {
            if !opts.keep_output_values {
                return marshal_property_value(&PropertyValue::lower_output(output), opts);
            }
            let mut fields = BTreeMap::new();
            fields.insert(sig::KEY.to_string(), string(sig::OUTPUT_VALUE.to_string()));
            if let Some(value) = &output.value {
                if let Some(wire) = marshal_property_value(value, opts)? {
                    fields.insert("value".to_string(), wire);
                }
            }
            fields.insert("known".to_string(), bool_value(output.known));
            fields.insert("secret".to_string(), bool_value(output.secret));
            if !output.dependencies.is_empty() {
                fields.insert(
                    "dependencies".to_string(),
                    Value {
                        kind: Some(Kind::ListValue(ListValue {
                            values: output
                                .dependencies
                                .iter()
                                .map(|urn| string(urn.to_string()))
                                .collect(),
                        })),
                    },
                );
            }
            Ok(Some(struct_value(Struct { fields })))
        }
    }
}

/// Unmarshal a wire struct into a property map.
pub fn unmarshal_properties(s: &Struct, opts: &MarshalOptions) -> Result<PropertyMap, MarshalError> {
    let mut map = PropertyMap::new();
    for (key, value) in &s.fields {
        if let Some(v) = unmarshal_property_value(value, opts)? {
            map.insert(PropertyKey::new(key.clone()), v);
        }
    }
    Ok(map)
}

/// Unmarshal a single wire value. Returns `None` when the value is to be
/// omitted (an unknown under permissive options).
pub fn unmarshal_property_value(
    v: &Value,
    opts: &MarshalOptions,
) -> Result<Option<PropertyValue>, MarshalError> {
    match &v.kind {
        None | Some(Kind::NullValue(_)) => Ok(Some(PropertyValue::Null)),
        Some(Kind::BoolValue(b)) => Ok(Some(PropertyValue::Bool(*b))),
        Some(Kind::NumberValue(n)) => Ok(Some(PropertyValue::Number(*n))),
        Some(Kind::StringValue(s)) => {
            if s == UNKNOWN_VALUE {
                unmarshal_unknown(UnknownHint::String, opts)
            } else {
                Ok(Some(PropertyValue::String(s.clone())))
            }
        }
        Some(Kind::ListValue(list)) => {
            let mut items = Vec::with_capacity(list.values.len());
            for value in &list.values {
                if let Some(v) = unmarshal_property_value(value, opts)? {
                    items.push(v);
                }
            }
            Ok(Some(PropertyValue::Array(items)))
        }
        Some(Kind::StructValue(s)) => unmarshal_struct(s, opts),
    }
}

fn unmarshal_struct(s: &Struct, opts: &MarshalOptions) -> Result<Option<PropertyValue>, MarshalError> {
    let signature = match s.fields.get(sig::KEY) {
        Some(Value {
            kind: Some(Kind::StringValue(signature)),
        }) => signature.as_str(),
        Some(_) => {
            return Err(malformed(opts, "special", "signature key is not a string"));
        }
        None => return Ok(Some(PropertyValue::Object(unmarshal_properties(s, opts)?))),
    };

    match signature {
        sig::ASSET => Ok(Some(PropertyValue::Asset(unmarshal_asset(s)))),
        sig::ARCHIVE => Ok(Some(PropertyValue::Archive(unmarshal_archive(s, opts)?))),
        sig::SECRET => {
            let inner = match s.fields.get("value") {
                Some(value) => unmarshal_property_value(value, opts)?,
                None => Some(PropertyValue::Null),
            };
            let Some(inner) = inner else { return Ok(None) };
            Ok(Some(if opts.keep_secrets {
                PropertyValue::secret(inner)
            } else {
                inner
            }))
        }
        sig::RESOURCE_REFERENCE => {
            let urn_text = string_field(s, "urn")
                .ok_or_else(|| malformed(opts, "resource reference", "missing urn"))?;
            let urn = Urn::parse(&urn_text).map_err(|e| {
                malformed(opts, "resource reference", e.to_string())
            })?;
            let id = string_field(s, "id");
            let package_version = string_field(s, "packageVersion").unwrap_or_default();
            if !opts.keep_resources {
                return match &id {
                    Some(id) if !id.is_empty() => Ok(Some(PropertyValue::String(id.clone()))),
                    Some(_) => unmarshal_unknown(UnknownHint::String, opts),
                    None => Ok(Some(PropertyValue::String(urn.to_string()))),
                };
            }
            Ok(Some(PropertyValue::ResourceReference(ResourceReference {
                urn,
                id,
                package_version,
            })))
        }
        sig::OUTPUT_VALUE => {
            let value = match s.fields.get("value") {
                Some(v) => unmarshal_property_value(v, opts)?.map(Box::new),
                None => None,
            };
            let known = bool_field(s, "known").unwrap_or(value.is_some());
            let secret = bool_field(s, "secret").unwrap_or(false);
            let mut dependencies = Vec::new();
            if let Some(Value {
                kind: Some(Kind::ListValue(list)),
            }) = s.fields.get("dependencies")
            {
                for dep in &list.values {
                    if let Some(Kind::StringValue(urn)) = &dep.kind {
                        dependencies.push(Urn::parse(urn).map_err(|e| {
                            malformed(opts, "output value", e.to_string())
                        })?);
                    }
                }
            }
            let output = OutputValue {
                value,
                known,
                secret,
                dependencies,
            };
            if opts.keep_output_values {
                return Ok(Some(PropertyValue::Output(output)));
            }
            // Lower to the older forms, honoring the unknown/secret options.
            if !output.known {
                let Some(unknown) = unmarshal_unknown(UnknownHint::String, opts)? else {
                    return Ok(None);
                };
                return Ok(Some(if output.secret && opts.keep_secrets {
                    PropertyValue::secret(unknown)
                } else {
                    unknown
                }));
            }
            let inner = output
                .value
                .map(|b| *b)
                .unwrap_or(PropertyValue::Null);
            Ok(Some(if output.secret && opts.keep_secrets {
                PropertyValue::secret(inner)
            } else {
                inner
            }))
        }
        other => Err(MarshalError::UnrecognizedSignature {
            label: opts.label.clone(),
            signature: other.to_string(),
        }),
    }
}

fn marshal_asset(asset: &Asset, opts: &MarshalOptions) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert(sig::KEY.to_string(), string(sig::ASSET.to_string()));
    fields.insert("hash".to_string(), string(asset.hash.clone()));
    match &asset.body {
        Some(AssetBody::Text(text)) if !opts.elide_asset_contents => {
            fields.insert("text".to_string(), string(text.clone()));
        }
        Some(AssetBody::Path(path)) if !opts.elide_asset_contents => {
            fields.insert("path".to_string(), string(path.clone()));
        }
        Some(AssetBody::Uri(uri)) => {
            fields.insert("uri".to_string(), string(uri.clone()));
        }
        _ => {}
    }
    struct_value(Struct { fields })
}

fn marshal_archive(archive: &Archive, opts: &MarshalOptions) -> Result<Value, MarshalError> {
    let mut fields = BTreeMap::new();
    fields.insert(sig::KEY.to_string(), string(sig::ARCHIVE.to_string()));
    fields.insert("hash".to_string(), string(archive.hash.clone()));
    match &archive.body {
        Some(ArchiveBody::Assets(assets)) if !opts.elide_asset_contents => {
            let mut members = BTreeMap::new();
            for (name, member) in assets {
                let wire = match member {
                    AssetOrArchive::Asset(a) => marshal_asset(a, opts),
                    AssetOrArchive::Archive(a) => marshal_archive(a, opts)?,
                };
                members.insert(name.clone(), wire);
            }
            fields.insert("assets".to_string(), struct_value(Struct { fields: members }));
        }
        Some(ArchiveBody::Path(path)) if !opts.elide_asset_contents => {
            fields.insert("path".to_string(), string(path.clone()));
        }
        Some(ArchiveBody::Uri(uri)) => {
            fields.insert("uri".to_string(), string(uri.clone()));
        }
        _ => {}
    }
    Ok(struct_value(Struct { fields }))
}

fn unmarshal_asset(s: &Struct) -> Asset {
    let hash = string_field(s, "hash").unwrap_or_default();
    let body = if let Some(text) = non_empty(string_field(s, "text")) {
        Some(AssetBody::Text(text))
    } else if let Some(path) = non_empty(string_field(s, "path")) {
        Some(AssetBody::Path(path))
    } else {
        non_empty(string_field(s, "uri")).map(AssetBody::Uri)
    };
    Asset { hash, body }
}

fn unmarshal_archive(s: &Struct, opts: &MarshalOptions) -> Result<Archive, MarshalError> {
    let hash = string_field(s, "hash").unwrap_or_default();
    let body = if let Some(Value {
        kind: Some(Kind::StructValue(members)),
    }) = s.fields.get("assets")
    {
        let mut assets = BTreeMap::new();
        for (name, member) in &members.fields {
            let Some(Kind::StructValue(member)) = &member.kind else {
                return Err(malformed(opts, "archive", format!("member '{name}' is not an object")));
            };
            let member_sig = string_field(member, sig::KEY).unwrap_or_default();
            let parsed = match member_sig.as_str() {
                sig::ASSET => AssetOrArchive::Asset(unmarshal_asset(member)),
                sig::ARCHIVE => AssetOrArchive::Archive(unmarshal_archive(member, opts)?),
                _ => {
                    return Err(malformed(
                        opts,
                        "archive",
                        format!("member '{name}' is neither an asset nor an archive"),
                    ))
                }
            };
            assets.insert(name.clone(), parsed);
        }
        Some(ArchiveBody::Assets(assets))
    } else if let Some(path) = non_empty(string_field(s, "path")) {
        Some(ArchiveBody::Path(path))
    } else {
        non_empty(string_field(s, "uri")).map(ArchiveBody::Uri)
    };
    Ok(Archive { hash, body })
}

fn marshal_unknown(opts: &MarshalOptions) -> Result<Option<Value>, MarshalError> {
    if opts.reject_unknowns {
        Err(MarshalError::UnexpectedUnknown {
            label: opts.label.clone(),
        })
    } else if opts.keep_unknowns {
        Ok(Some(string(UNKNOWN_VALUE.to_string())))
    } else {
        Ok(None)
    }
}

fn unmarshal_unknown(
    hint: UnknownHint,
    opts: &MarshalOptions,
) -> Result<Option<PropertyValue>, MarshalError> {
    if opts.reject_unknowns {
        Err(MarshalError::UnexpectedUnknown {
            label: opts.label.clone(),
        })
    } else if opts.keep_unknowns {
        Ok(Some(PropertyValue::Unknown(hint)))
    } else {
        Ok(None)
    }
}

fn malformed(opts: &MarshalOptions, object: &'static str, reason: impl Into<String>) -> MarshalError {
    MarshalError::MalformedObject {
        label: opts.label.clone(),
        object,
        reason: reason.into(),
    }
}

fn string_field(s: &Struct, key: &str) -> Option<String> {
    match s.fields.get(key) {
        Some(Value {
            kind: Some(Kind::StringValue(v)),
        }) => Some(v.clone()),
        _ => None,
    }
}

fn bool_field(s: &Struct, key: &str) -> Option<bool> {
    match s.fields.get(key) {
        Some(Value {
            kind: Some(Kind::BoolValue(v)),
        }) => Some(*v),
        _ => None,
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

fn null() -> Value {
    Value {
        kind: Some(Kind::NullValue(0)),
    }
}

fn bool_value(b: bool) -> Value {
    Value {
        kind: Some(Kind::BoolValue(b)),
    }
}

fn number(n: f64) -> Value {
    Value {
        kind: Some(Kind::NumberValue(n)),
    }
}

fn string(s: String) -> Value {
    Value {
        kind: Some(Kind::StringValue(s)),
    }
}

fn struct_value(s: Struct) -> Value {
    Value {
        kind: Some(Kind::StructValue(s)),
    }
}
