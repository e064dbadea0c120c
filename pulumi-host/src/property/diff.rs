//! Structural diffing of property maps.
//!
//! [`diff_properties`] computes the adds/deletes/updates between two maps,
//! descending into nested objects and arrays. The result feeds the
//! detailed-diff synthesis in [`crate::diff`] when a provider reports only
//! a coarse diff.

use std::collections::BTreeMap;

use super::{PropertyKey, PropertyMap, PropertyValue};

/// The difference between two property maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectDiff {
    /// Keys present only in the new map.
    pub adds: PropertyMap,
    /// Keys present only in the old map.
    pub deletes: PropertyMap,
    /// Keys present in both with equal values.
    pub sames: PropertyMap,
    /// Keys present in both with differing values.
    pub updates: BTreeMap<PropertyKey, ValueDiff>,
}

impl ObjectDiff {
    /// All keys that changed in any way.
    pub fn changed_keys(&self) -> Vec<PropertyKey> {
        let mut keys: Vec<PropertyKey> = self
            .adds
            .keys()
            .chain(self.deletes.keys())
            .chain(self.updates.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// The difference between two values.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueDiff {
    pub old: PropertyValue,
    pub new: PropertyValue,
    /// Populated when both sides are objects.
    pub object: Option<Box<ObjectDiff>>,
    /// Populated when both sides are arrays.
    pub array: Option<Box<ArrayDiff>>,
}

impl ValueDiff {
    fn leaf(old: PropertyValue, new: PropertyValue) -> Self {
        ValueDiff {
            old,
            new,
            object: None,
            array: None,
        }
    }
}

/// The difference between two arrays, by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayDiff {
    pub adds: BTreeMap<usize, PropertyValue>,
    pub deletes: BTreeMap<usize, PropertyValue>,
    pub sames: BTreeMap<usize, PropertyValue>,
    pub updates: BTreeMap<usize, ValueDiff>,
}

/// Diff two property maps. Returns `None` when they are equal.
pub fn diff_properties(old: &PropertyMap, new: &PropertyMap) -> Option<ObjectDiff> {
    let mut diff = ObjectDiff::default();
    for (key, old_value) in old {
        match new.get(key.as_str()) {
            Some(new_value) => match diff_values(old_value, new_value) {
                Some(vd) => {
                    diff.updates.insert(key.clone(), vd);
                }
                None => {
                    diff.sames.insert(key.clone(), old_value.clone());
                }
            },
            None => {
                diff.deletes.insert(key.clone(), old_value.clone());
            }
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key.as_str()) {
            diff.adds.insert(key.clone(), new_value.clone());
        }
    }
    if diff.adds.is_empty() && diff.deletes.is_empty() && diff.updates.is_empty() {
        None
    } else {
        Some(diff)
    }
}

/// Diff two values. Returns `None` when they are equal.
pub fn diff_values(old: &PropertyValue, new: &PropertyValue) -> Option<ValueDiff> {
    match (old, new) {
        (PropertyValue::Object(o), PropertyValue::Object(n)) => {
            diff_properties(o, n).map(|d| ValueDiff {
                old: old.clone(),
                new: new.clone(),
                object: Some(Box::new(d)),
                array: None,
            })
        }
        (PropertyValue::Array(o), PropertyValue::Array(n)) => {
            let mut diff = ArrayDiff::default();
            for i in 0..o.len().max(n.len()) {
                match (o.get(i), n.get(i)) {
                    (Some(ov), Some(nv)) => match diff_values(ov, nv) {
                        Some(vd) => {
                            diff.updates.insert(i, vd);
                        }
                        None => {
                            diff.sames.insert(i, ov.clone());
                        }
                    },
                    (Some(ov), None) => {
                        diff.deletes.insert(i, ov.clone());
                    }
                    (None, Some(nv)) => {
                        diff.adds.insert(i, nv.clone());
                    }
                    (None, None) => unreachable!(),
                }
            }
            if diff.adds.is_empty() && diff.deletes.is_empty() && diff.updates.is_empty() {
                None
            } else {
                Some(ValueDiff {
                    old: old.clone(),
                    new: new.clone(),
                    object: None,
                    array: Some(Box::new(diff)),
                })
            }
        }
        _ if old == new => None,
        _ => Some(ValueDiff::leaf(old.clone(), new.clone())),
    }
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
    fn equal_maps_have_no_diff() {
        let a = obj(vec![("x", PropertyValue::Number(1.0))]);
        assert_eq!(diff_properties(&a, &a.clone()), None);
    }

    #[test]
    fn classifies_adds_deletes_updates() {
        let old = obj(vec![
            ("kept", PropertyValue::Bool(true)),
            ("gone", PropertyValue::Number(1.0)),
            ("changed", PropertyValue::string("a")),
        ]);
        let new = obj(vec![
            ("kept", PropertyValue::Bool(true)),
            ("fresh", PropertyValue::Number(2.0)),
            ("changed", PropertyValue::string("b")),
        ]);
        let diff = diff_properties(&old, &new).unwrap();
        assert!(diff.adds.contains_key("fresh"));
        assert!(diff.deletes.contains_key("gone"));
        assert!(diff.updates.contains_key("changed"));
        assert!(diff.sames.contains_key("kept"));
        assert_eq!(
            diff.changed_keys(),
            vec![
                PropertyKey::from("changed"),
                PropertyKey::from("fresh"),
                PropertyKey::from("gone")
            ]
        );
    }

    #[test]
    fn nested_objects_produce_nested_diffs() {
        let old = obj(vec![(
            "cfg",
            PropertyValue::Object(obj(vec![("size", PropertyValue::Number(1.0))])),
        )]);
        let new = obj(vec![(
            "cfg",
            PropertyValue::Object(obj(vec![("size", PropertyValue::Number(2.0))])),
        )]);
        let diff = diff_properties(&old, &new).unwrap();
        let vd = diff.updates.get("cfg").unwrap();
        let nested = vd.object.as_ref().unwrap();
        assert!(nested.updates.contains_key("size"));
    }

    #[test]
    fn arrays_diff_by_index() {
        let old = obj(vec![(
            "items",
            PropertyValue::Array(vec![
                PropertyValue::string("a"),
                PropertyValue::string("b"),
            ]),
        )]);
        let new = obj(vec![(
            "items",
            PropertyValue::Array(vec![
                PropertyValue::string("a"),
                PropertyValue::string("c"),
                PropertyValue::string("d"),
            ]),
        )]);
        let diff = diff_properties(&old, &new).unwrap();
        let vd = diff.updates.get("items").unwrap();
        let array = vd.array.as_ref().unwrap();
        assert!(array.sames.contains_key(&0));
        assert!(array.updates.contains_key(&1));
        assert!(array.adds.contains_key(&2));
    }
}
