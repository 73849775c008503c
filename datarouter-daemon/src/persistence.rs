// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent runtime configuration: the subset of routing state that DCP
//! commands may mutate, snapshotted into a key-value store as an opaque JSON
//! string under `"dltConfig"`, plus the `"dltOutputEnabled"` boolean.

use crate::config::{parse_assignments, parse_thresholds, IdPair, ZwoState};
use datarouter_dlt::{DltId, LogLevel};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_DATABASE_KEY: &str = "dltConfig";
pub const CONFIG_OUTPUT_ENABLED_KEY: &str = "dltOutputEnabled";

/// Abstract key-value store. The daemon only ever uses these four calls.
pub trait PersistentDictionary: Send {
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn set_string(&mut self, key: &str, value: &str);
    fn set_bool(&mut self, key: &str, value: bool);
}

/// Store without a backing file; state lives for the process lifetime.
#[derive(Default)]
pub struct InMemoryDictionary {
    values: Map<String, Value>,
}

impl PersistentDictionary for InMemoryDictionary {
    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_owned()
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn set_string(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), Value::from(value));
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_owned(), Value::from(value));
    }
}

/// JSON-file-backed store, written through on every mutation.
pub struct FileDictionary {
    path: PathBuf,
    values: Map<String, Value>,
}

impl FileDictionary {
    pub fn open(path: &Path) -> io::Result<FileDictionary> {
        let values = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|value| value.as_object().cloned())
                .unwrap_or_default(),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(error) => return Err(error),
        };
        Ok(FileDictionary {
            path: path.to_owned(),
            values,
        })
    }

    fn flush(&self) {
        let text = Value::Object(self.values.clone()).to_string();
        if let Err(error) = std::fs::write(&self.path, text) {
            warn!("could not write {}: {error}", self.path.display());
        }
    }
}

impl PersistentDictionary for FileDictionary {
    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_owned()
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn set_string(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), Value::from(value));
        self.flush();
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_owned(), Value::from(value));
        self.flush();
    }
}

/// Selects the store backing the persistent configuration. Without
/// persistence every DCP mutation lives only for the process lifetime and
/// nothing touches the filesystem; an unusable file store degrades the same
/// way instead of failing startup.
pub fn open_dictionary(persistent: bool, path: &Path) -> Box<dyn PersistentDictionary> {
    if !persistent {
        return Box::new(InMemoryDictionary::default());
    }
    match FileDictionary::open(path) {
        Ok(store) => Box::new(store),
        Err(err) => {
            warn!(
                "persistence store {} unavailable ({err}), using in-memory store",
                path.display()
            );
            Box::new(InMemoryDictionary::default())
        }
    }
}

/// The DCP-mutable configuration subset. An empty channel map means "no
/// persistent configuration": the static configuration applies unchanged.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    pub channels: BTreeMap<String, LogLevel>,
    pub channel_assignments: HashMap<IdPair, Vec<DltId>, ZwoState>,
    pub filtering_enabled: bool,
    pub default_threshold: LogLevel,
    pub message_thresholds: HashMap<IdPair, LogLevel, ZwoState>,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        PersistentConfig {
            channels: BTreeMap::new(),
            channel_assignments: HashMap::default(),
            filtering_enabled: true,
            default_threshold: LogLevel::Verbose,
            message_thresholds: HashMap::default(),
        }
    }
}

impl PersistentConfig {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Decodes `"dltConfig"`. Unparsable or channel-less payloads yield the
/// empty configuration; the static configuration then wins.
pub fn read_dlt(store: &dyn PersistentDictionary) -> PersistentConfig {
    let mut config = PersistentConfig::default();

    let text = store.get_string(CONFIG_DATABASE_KEY, "{}");
    let Ok(doc) = serde_json::from_str::<Value>(&text) else {
        return config;
    };
    let Some(root) = doc.as_object() else {
        return config;
    };
    let Some(channels) = root.get("channels").and_then(Value::as_object) else {
        return config;
    };
    if channels.is_empty() {
        return config;
    }

    for (name, channel) in channels {
        if let Some(threshold) = channel
            .get("channelThreshold")
            .and_then(Value::as_str)
            .and_then(LogLevel::from_name)
        {
            config.channels.insert(name.clone(), threshold);
        }
    }

    config.channel_assignments = parse_assignments(root.get("channelAssignments"));
    config.filtering_enabled = root
        .get("filteringEnabled")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    // Both spellings are accepted; the correct one is preferred. The store
    // itself only ever writes the misspelled legacy key.
    config.default_threshold = root
        .get("defaultThreshold")
        .or_else(|| root.get("defaultThresold"))
        .and_then(Value::as_str)
        .and_then(LogLevel::from_name)
        .unwrap_or(LogLevel::Verbose);
    config.message_thresholds = parse_thresholds(root.get("messageThresholds"));

    config
}

/// Encodes and stores `"dltConfig"`. The format must round-trip losslessly
/// through [`read_dlt`].
pub fn write_dlt(config: &PersistentConfig, store: &mut dyn PersistentDictionary) {
    let mut channels = Map::new();
    for (name, threshold) in &config.channels {
        channels.insert(
            name.clone(),
            json!({ "channelThreshold": threshold.as_str() }),
        );
    }

    let mut assignments = Map::new();
    for ((app_id, ctx_id), assigned) in &config.channel_assignments {
        let names: Vec<Value> = assigned
            .iter()
            .map(|channel| Value::from(channel.display_name()))
            .collect();
        if let Some(contexts) = assignments
            .entry(app_id.display_name())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
        {
            contexts.insert(ctx_id.display_name(), Value::from(names));
        }
    }

    let mut thresholds = Map::new();
    for ((app_id, ctx_id), threshold) in &config.message_thresholds {
        if let Some(contexts) = thresholds
            .entry(app_id.display_name())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
        {
            contexts.insert(ctx_id.display_name(), Value::from(threshold.as_str()));
        }
    }

    // TODO: fix typo once a migration window for existing stores is defined.
    let document = json!({
        "channels": channels,
        "channelAssignments": assignments,
        "filteringEnabled": config.filtering_enabled,
        "defaultThresold": config.default_threshold.as_str(),
        "messageThresholds": thresholds,
    });
    store.set_string(CONFIG_DATABASE_KEY, &document.to_string());
}

pub fn read_dlt_enabled(store: &dyn PersistentDictionary) -> bool {
    store.get_bool(CONFIG_OUTPUT_ENABLED_KEY, true)
}

pub fn write_dlt_enabled(enabled: bool, store: &mut dyn PersistentDictionary) {
    store.set_bool(CONFIG_OUTPUT_ENABLED_KEY, enabled);
}
