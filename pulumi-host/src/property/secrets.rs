//! Post-hoc repairs for responses from plugins that cannot carry the full
//! value model.
//!
//! Secret-blind plugins return plaintext for values the user marked secret;
//! [`annotate_secrets`] re-applies secretness by walking the old inputs and
//! new outputs in lock-step. Similarly, when asset contents were elided on
//! the way out, [`restore_elided_asset_contents`] repopulates them from the
//! original values by matching on content hash.

use std::collections::BTreeMap;

use super::{Archive, ArchiveBody, Asset, AssetOrArchive, PropertyMap, PropertyValue};

/// Mark every key of `outputs` secret whose counterpart in `inputs` contains
/// a secret. Objects recurse by key; arrays do not — any secret within an
/// array taints the whole array.
pub fn annotate_secrets(outputs: &mut PropertyMap, inputs: &PropertyMap) {
    for (key, output) in outputs.iter_mut() {
        if let Some(input) = inputs.get(key.as_str()) {
            annotate_value(output, input);
        }
    }
}

fn annotate_value(output: &mut PropertyValue, input: &PropertyValue) {
    if input.is_secret() {
        make_secret(output);
        return;
    }
    match (&mut *output, input) {
        (PropertyValue::Object(out), PropertyValue::Object(inp)) => annotate_secrets(out, inp),
        _ => {
            if input.contains_secrets() {
                make_secret(output);
            }
        }
    }
}

fn make_secret(value: &mut PropertyValue) {
    if value.is_secret() {
        return;
    }
    let inner = std::mem::replace(value, PropertyValue::Null);
    *value = PropertyValue::secret(inner);
}

/// Restore asset and archive contents in `decoded` that were elided in
/// transit, matching against `original` by SHA-256 hash.
pub fn restore_elided_asset_contents(original: &PropertyMap, decoded: &mut PropertyMap) {
    let mut assets = BTreeMap::new();
    let mut archives = BTreeMap::new();
    for value in original.values() {
        collect_contents(value, &mut assets, &mut archives);
    }
    for value in decoded.values_mut() {
        restore_value(value, &assets, &archives);
    }
}

fn collect_contents<'a>(
    value: &'a PropertyValue,
    assets: &mut BTreeMap<String, &'a Asset>,
    archives: &mut BTreeMap<String, &'a Archive>,
) {
    match value {
        PropertyValue::Asset(asset) => collect_asset(asset, assets),
        PropertyValue::Archive(archive) => collect_archive(archive, assets, archives),
        PropertyValue::Array(items) => {
            for item in items {
                collect_contents(item, assets, archives);
            }
        }
        PropertyValue::Object(map) => {
            for v in map.values() {
                collect_contents(v, assets, archives);
            }
        }
        PropertyValue::Secret(inner) => collect_contents(inner, assets, archives),
        PropertyValue::Output(output) => {
            if let Some(v) = output.value.as_deref() {
                collect_contents(v, assets, archives);
            }
        }
        _ => {}
    }
}

fn collect_asset<'a>(asset: &'a Asset, assets: &mut BTreeMap<String, &'a Asset>) {
    if asset.body.is_some() && !asset.hash.is_empty() {
        assets.insert(asset.hash.clone(), asset);
    }
}

fn collect_archive<'a>(
    archive: &'a Archive,
    assets: &mut BTreeMap<String, &'a Asset>,
    archives: &mut BTreeMap<String, &'a Archive>,
) {
    if archive.body.is_some() && !archive.hash.is_empty() {
        archives.insert(archive.hash.clone(), archive);
    }
    if let Some(ArchiveBody::Assets(members)) = &archive.body {
        for member in members.values() {
            match member {
                AssetOrArchive::Asset(a) => collect_asset(a, assets),
                AssetOrArchive::Archive(a) => collect_archive(a, assets, archives),
            }
        }
    }
}

fn restore_value(
    value: &mut PropertyValue,
    assets: &BTreeMap<String, &Asset>,
    archives: &BTreeMap<String, &Archive>,
) {
    match value {
        PropertyValue::Asset(asset) => restore_asset(asset, assets),
        PropertyValue::Archive(archive) => restore_archive(archive, assets, archives),
        PropertyValue::Array(items) => {
            for item in items {
                restore_value(item, assets, archives);
            }
        }
        PropertyValue::Object(map) => {
            for v in map.values_mut() {
                restore_value(v, assets, archives);
            }
        }
        PropertyValue::Secret(inner) => restore_value(inner, assets, archives),
        PropertyValue::Output(output) => {
            if let Some(v) = output.value.as_deref_mut() {
                restore_value(v, assets, archives);
            }
        }
        _ => {}
    }
}

fn restore_asset(asset: &mut Asset, assets: &BTreeMap<String, &Asset>) {
    if asset.body.is_none() {
        if let Some(original) = assets.get(&asset.hash) {
            asset.body.clone_from(&original.body);
        }
    }
}

fn restore_archive(
    archive: &mut Archive,
    assets: &BTreeMap<String, &Asset>,
    archives: &BTreeMap<String, &Archive>,
) {
    if archive.body.is_none() {
        if let Some(original) = archives.get(&archive.hash) {
            archive.body.clone_from(&original.body);
            return;
        }
    }
    if let Some(ArchiveBody::Assets(members)) = &mut archive.body {
        for member in members.values_mut() {
            match member {
                AssetOrArchive::Asset(a) => restore_asset(a, assets),
                AssetOrArchive::Archive(a) => restore_archive(a, assets, archives),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::marshal::{
        marshal_properties, unmarshal_properties, MarshalOptions,
    };
    use crate::property::{AssetBody, PropertyKey};
    use pretty_assertions::assert_eq;

    fn obj(entries: Vec<(&str, PropertyValue)>) -> PropertyMap {
        entries
            .into_iter()
            .map(|(k, v)| (PropertyKey::from(k), v))
            .collect()
    }

    #[test]
    fn secret_inputs_taint_matching_outputs() {
        let inputs = obj(vec![
            (
                "password",
                PropertyValue::secret(PropertyValue::string("hunter2")),
            ),
            ("region", PropertyValue::string("us-west-2")),
        ]);
        let mut outputs = obj(vec![
            ("password", PropertyValue::string("hunter2")),
            ("region", PropertyValue::string("us-west-2")),
        ]);
        annotate_secrets(&mut outputs, &inputs);
        assert!(outputs.get("password").unwrap().is_secret());
        assert!(!outputs.get("region").unwrap().is_secret());
    }

    #[test]
    fn objects_recurse_by_key() {
        let inputs = obj(vec![(
            "db",
            PropertyValue::Object(obj(vec![
                (
                    "password",
                    PropertyValue::secret(PropertyValue::string("hunter2")),
                ),
                ("host", PropertyValue::string("localhost")),
            ])),
        )]);
        let mut outputs = obj(vec![(
            "db",
            PropertyValue::Object(obj(vec![
                ("password", PropertyValue::string("hunter2")),
                ("host", PropertyValue::string("localhost")),
            ])),
        )]);
        annotate_secrets(&mut outputs, &inputs);
        let PropertyValue::Object(db) = outputs.get("db").unwrap() else {
            panic!("db should still be an object");
        };
        assert!(db.get("password").unwrap().is_secret());
        assert!(!db.get("host").unwrap().is_secret());
    }

    #[test]
    fn any_secret_in_an_array_taints_the_whole_array() {
        let inputs = obj(vec![(
            "items",
            PropertyValue::Array(vec![
                PropertyValue::string("plain"),
                PropertyValue::secret(PropertyValue::string("hidden")),
            ]),
        )]);
        let mut outputs = obj(vec![(
            "items",
            PropertyValue::Array(vec![
                PropertyValue::string("plain"),
                PropertyValue::string("hidden"),
            ]),
        )]);
        annotate_secrets(&mut outputs, &inputs);
        assert!(outputs.get("items").unwrap().is_secret());
    }

    #[test]
    fn restores_elided_text_through_the_wire() {
        let original = obj(vec![(
            "doc",
            PropertyValue::Asset(Asset {
                hash: "ab12".into(),
                body: Some(AssetBody::Text("hello".into())),
            }),
        )]);

        let opts = MarshalOptions {
            label: "test".into(),
            elide_asset_contents: true,
            ..Default::default()
        };
        let wire = marshal_properties(&original, &opts).unwrap();
        let mut decoded = unmarshal_properties(&wire, &opts).unwrap();

        let PropertyValue::Asset(elided) = decoded.get("doc").unwrap() else {
            panic!("doc should be an asset");
        };
        assert_eq!(elided.body, None);

        restore_elided_asset_contents(&original, &mut decoded);
        let PropertyValue::Asset(restored) = decoded.get("doc").unwrap() else {
            panic!("doc should be an asset");
        };
        assert_eq!(restored.body, Some(AssetBody::Text("hello".into())));
    }
}
