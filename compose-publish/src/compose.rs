//! Mutations of the Compose service map
//!
//! The document is handled as a generic YAML mapping so unknown keys
//! round-trip faithfully. Key insertion order is preserved end-to-end
//! because it contributes to byte-stable output.

use crate::{digest::sha256_hex, error::*, media_types::CONFIG_HASH_LABEL};
use serde_yaml::{Mapping, Value};

/// The `services` section of a parsed Compose document
pub fn services(config: &mut Value) -> Result<&mut Mapping> {
    config
        .as_mapping_mut()
        .and_then(|doc| doc.get_mut("services"))
        .and_then(Value::as_mapping_mut)
        .ok_or(Error::MissingServices)
}

/// Name and mutable entry of one service; non-mapping entries are rejected
pub fn as_service_entry<'a>(name: &Value, entry: &'a mut Value) -> Result<(String, &'a mut Mapping)> {
    let name = name.as_str().unwrap_or_default().to_string();
    let entry = entry
        .as_mapping_mut()
        .ok_or_else(|| Error::InvalidService(name.clone()))?;
    Ok((name, entry))
}

/// The `image` attribute of a service entry
pub fn image_of(name: &str, entry: &Mapping) -> Result<String> {
    entry
        .get("image")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::MissingImage(name.to_string()))
}

pub fn set_image(entry: &mut Mapping, pinned: &str) {
    entry.insert("image".into(), pinned.into());
}

/// Drop a `build` stanza; a published app carries only pinned images
pub fn strip_build(entry: &mut Mapping) -> bool {
    entry.remove("build").is_some()
}

/// Compute and inject the configuration hash label of one service
///
/// The hash covers the pinned entry serialized as canonical YAML. The label
/// form is normalized and any hash left behind by an earlier run is stripped
/// before serializing, so hashing is stable under repetition.
pub fn hash_config(entry: &mut Mapping) -> Result<String> {
    if entry.get("labels").is_some() {
        labels_mapping(entry).remove(CONFIG_HASH_LABEL);
    }
    let mut input = entry.clone();
    if input
        .get("labels")
        .and_then(Value::as_mapping)
        .map_or(false, Mapping::is_empty)
    {
        input.remove("labels");
    }

    let marshalled = serde_yaml::to_string(&input)?;
    let hash = sha256_hex(marshalled.as_bytes());
    labels_mapping(entry).insert(CONFIG_HASH_LABEL.into(), hash.clone().into());
    Ok(hash)
}

/// Hash every service in place, reporting each computed hash
pub fn hash_services(services: &mut Mapping) -> Result<()> {
    for (name, entry) in services.iter_mut() {
        let (name, entry) = as_service_entry(name, entry)?;
        let hash = hash_config(entry)?;
        log::info!("   |-> {} : {}", name, hash);
    }
    Ok(())
}

/// The `labels` sub-mapping, created if absent
///
/// Compose also allows the list form (`- k=v`); it is normalized to the
/// mapping form before the hash label lands next to the existing entries.
fn labels_mapping(entry: &mut Mapping) -> &mut Mapping {
    let converted = match entry.get("labels") {
        Some(Value::Mapping(_)) => None,
        Some(Value::Sequence(seq)) => {
            let mut map = Mapping::new();
            for item in seq {
                if let Some(s) = item.as_str() {
                    let (key, value) = s.split_once('=').unwrap_or((s, ""));
                    map.insert(key.into(), value.into());
                }
            }
            Some(map)
        }
        _ => Some(Mapping::new()),
    };
    if let Some(map) = converted {
        entry.insert("labels".into(), Value::Mapping(map));
    }
    match entry.get_mut("labels") {
        Some(Value::Mapping(map)) => map,
        _ => unreachable!("labels was just normalized to a mapping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn services_section_required() {
        let mut config: Value = serde_yaml::from_str("version: '3'").unwrap();
        assert!(matches!(services(&mut config), Err(Error::MissingServices)));
    }

    #[test]
    fn image_attribute_required() {
        let entry = service("build: .");
        assert!(matches!(
            image_of("web", &entry),
            Err(Error::MissingImage(name)) if name == "web"
        ));
    }

    #[test]
    fn build_stanza_dropped() {
        let mut entry = service("image: nginx:1.25\nbuild: .");
        assert!(strip_build(&mut entry));
        assert!(entry.get("build").is_none());
        assert!(!strip_build(&mut entry));
    }

    #[test]
    fn hash_is_stable_under_repetition() {
        let mut entry = service("image: nginx@sha256:abcd\nports:\n  - '80:80'");
        let first = hash_config(&mut entry).unwrap();
        let second = hash_config(&mut entry).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            entry
                .get("labels")
                .and_then(Value::as_mapping)
                .and_then(|labels| labels.get(CONFIG_HASH_LABEL))
                .and_then(Value::as_str),
            Some(first.as_str())
        );
    }

    #[test]
    fn hash_is_stable_with_preexisting_empty_labels() {
        let mut entry = service("image: nginx@sha256:abcd\nlabels: {}");
        let first = hash_config(&mut entry).unwrap();
        let second = hash_config(&mut entry).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hash_is_stable_after_label_list_normalization() {
        let mut entry = service("image: nginx@sha256:abcd\nlabels:\n  - role=frontend");
        let first = hash_config(&mut entry).unwrap();
        let second = hash_config(&mut entry).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hash_tracks_entry_changes() {
        let mut entry = service("image: nginx@sha256:abcd");
        let before = hash_config(&mut entry).unwrap();
        entry.insert("restart".into(), "always".into());
        let after = hash_config(&mut entry).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn label_list_form_is_normalized() {
        let mut entry = service("image: nginx@sha256:abcd\nlabels:\n  - role=frontend");
        hash_config(&mut entry).unwrap();
        let labels = entry
            .get("labels")
            .and_then(Value::as_mapping)
            .expect("labels must become a mapping");
        assert_eq!(
            labels.get("role").and_then(Value::as_str),
            Some("frontend")
        );
        assert!(labels.get(CONFIG_HASH_LABEL).is_some());
    }

    #[test]
    fn unknown_keys_round_trip_in_order() {
        let yaml = "image: nginx@sha256:abcd\nx-custom: keep\nports:\n- 80:80\n";
        let mut entry = service(yaml);
        set_image(&mut entry, "hub.io/app@sha256:beef");
        let out = serde_yaml::to_string(&entry).unwrap();
        let image_at = out.find("image:").unwrap();
        let custom_at = out.find("x-custom:").unwrap();
        let ports_at = out.find("ports:").unwrap();
        assert!(image_at < custom_at && custom_at < ports_at);
        assert!(out.contains("x-custom: keep"));
    }
}
