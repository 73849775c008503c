// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static channel configuration, read once at startup. Parse tolerance
//! mirrors the runtime behaviour: optional members fall back to defaults,
//! but a missing file, unparsable JSON or an empty channel list is fatal.

use crate::error::ConfigError;
use datarouter_dlt::{DltId, LogLevel};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasherDefault;
use std::path::Path;
use zwohash::ZwoHasher;

pub type ZwoState = BuildHasherDefault<ZwoHasher>;
pub type IdPair = (DltId, DltId);

pub const DEFAULT_DST_ADDRESS: &str = "239.255.42.99";
pub const DEFAULT_DST_PORT: u16 = 3490;

#[derive(Debug, Clone)]
pub struct ChannelDescription {
    pub ecu: DltId,
    pub address: String,
    pub port: u16,
    pub dst_address: String,
    pub dst_port: u16,
    pub channel_threshold: LogLevel,
    pub multicast_interface: String,
}

#[derive(Debug, Clone, Default)]
pub struct ThroughputQuotas {
    pub quota_enforcement_enabled: bool,
    pub overall_mbps: f64,
    pub applications_kbps: HashMap<DltId, f64, ZwoState>,
}

#[derive(Debug, Clone)]
pub struct StaticConfig {
    /// Ordered by name; the iteration order defines channel indices.
    pub channels: BTreeMap<String, ChannelDescription>,
    pub channel_assignments: HashMap<IdPair, Vec<DltId>, ZwoState>,
    pub message_thresholds: HashMap<IdPair, LogLevel, ZwoState>,
    pub filtering_enabled: bool,
    pub default_channel: DltId,
    pub coredump_channel: Option<DltId>,
    pub default_threshold: LogLevel,
    pub throughput: ThroughputQuotas,
}

impl StaticConfig {
    pub fn load(path: &Path) -> Result<StaticConfig, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NoFileFound(path.display().to_string()))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<StaticConfig, ConfigError> {
        let doc: Value = serde_json::from_str(text)
            .map_err(|error| ConfigError::ParseError(error.to_string()))?;
        if doc.is_array() {
            return Err(ConfigError::ParseError(
                "old (incompatible) json format".into(),
            ));
        }
        let Some(root) = doc.as_object() else {
            return Err(ConfigError::ParseError("top level is not an object".into()));
        };

        let channels = match root.get("channels").and_then(Value::as_object) {
            Some(channels) if !channels.is_empty() => channels,
            _ => return Err(ConfigError::NoChannelsFound),
        };

        let mut parsed_channels = BTreeMap::new();
        for (name, value) in channels {
            parsed_channels.insert(name.clone(), parse_channel(name, value)?);
        }

        let default_channel = root
            .get("defaultChannel")
            .and_then(Value::as_str)
            .map(DltId::new)
            .unwrap_or_default();
        let coredump_channel = root
            .get("coredumpChannel")
            .and_then(Value::as_str)
            .map(DltId::new);

        let filtering_enabled = root
            .get("filteringEnabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        // The misspelled key is a legacy artifact that still exists in the
        // field; the correctly spelled one wins when both are present.
        let default_threshold = root
            .get("defaultThreshold")
            .or_else(|| root.get("defaultThresold"))
            .and_then(Value::as_str)
            .and_then(LogLevel::from_name)
            .unwrap_or(LogLevel::Verbose);

        Ok(StaticConfig {
            channels: parsed_channels,
            channel_assignments: parse_assignments(root.get("channelAssignments")),
            message_thresholds: parse_thresholds(root.get("messageThresholds")),
            filtering_enabled,
            default_channel,
            coredump_channel,
            default_threshold,
            throughput: parse_quotas(root.get("quotas")),
        })
    }
}

fn parse_channel(name: &str, value: &Value) -> Result<ChannelDescription, ConfigError> {
    let object = value
        .as_object()
        .ok_or_else(|| ConfigError::ParseError(format!("channel {name} is not an object")))?;

    let ecu = object
        .get("ecu")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::ParseError(format!("channel {name} has no ecu")))?;
    let port = object
        .get("port")
        .and_then(Value::as_u64)
        .ok_or_else(|| ConfigError::ParseError(format!("channel {name} has no port")))?;
    let channel_threshold = object
        .get("channelThreshold")
        .and_then(Value::as_str)
        .and_then(LogLevel::from_name)
        .ok_or_else(|| {
            ConfigError::ParseError(format!("channel {name} has no valid channelThreshold"))
        })?;

    let dst_port = object
        .get("dstPort")
        .and_then(Value::as_u64)
        .map(|port| port as u16)
        .filter(|&port| port != 0)
        .unwrap_or(DEFAULT_DST_PORT);
    let dst_address = object
        .get("dstAddress")
        .and_then(Value::as_str)
        .filter(|address| !address.is_empty())
        .unwrap_or(DEFAULT_DST_ADDRESS);

    Ok(ChannelDescription {
        ecu: DltId::new(ecu),
        address: object
            .get("address")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned(),
        port: port as u16,
        dst_address: dst_address.to_owned(),
        dst_port,
        channel_threshold,
        multicast_interface: object
            .get("multicastInterface")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned(),
    })
}

pub(crate) fn parse_assignments(value: Option<&Value>) -> HashMap<IdPair, Vec<DltId>, ZwoState> {
    let mut assignments: HashMap<IdPair, Vec<DltId>, ZwoState> = HashMap::default();
    let Some(apps) = value.and_then(Value::as_object) else {
        return assignments;
    };
    for (app, contexts) in apps {
        let app_id = DltId::new(app);
        let Some(contexts) = contexts.as_object() else {
            continue;
        };
        for (ctx, channels) in contexts {
            let ctx_id = DltId::new(ctx);
            let Some(channels) = channels.as_array() else {
                continue;
            };
            let names = channels
                .iter()
                .filter_map(Value::as_str)
                .map(DltId::new)
                .collect();
            assignments.insert((app_id, ctx_id), names);
        }
    }
    assignments
}

pub(crate) fn parse_thresholds(value: Option<&Value>) -> HashMap<IdPair, LogLevel, ZwoState> {
    let mut thresholds: HashMap<IdPair, LogLevel, ZwoState> = HashMap::default();
    let Some(apps) = value.and_then(Value::as_object) else {
        return thresholds;
    };
    for (app, contexts) in apps {
        let app_id = DltId::new(app);
        let Some(contexts) = contexts.as_object() else {
            continue;
        };
        for (ctx, level) in contexts {
            if let Some(level) = level.as_str().and_then(LogLevel::from_name) {
                thresholds.insert((app_id, DltId::new(ctx)), level);
            }
        }
    }
    thresholds
}

fn parse_quotas(value: Option<&Value>) -> ThroughputQuotas {
    let mut quotas = ThroughputQuotas::default();
    let Some(object) = value.and_then(Value::as_object) else {
        return quotas;
    };
    quotas.quota_enforcement_enabled = object
        .get("quotaEnforcementEnabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(throughput) = object.get("throughput").and_then(Value::as_object) {
        quotas.overall_mbps = throughput
            .get("overallMbps")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if let Some(apps) = throughput.get("applicationsKbps").and_then(Value::as_object) {
            for (app, kbps) in apps {
                if let Some(kbps) = kbps.as_f64() {
                    quotas.applications_kbps.insert(DltId::new(app), kbps);
                }
            }
        }
    }
    quotas
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"{
        "channels": {
            "CORE": {
                "ecu": "ECU1",
                "port": 3492,
                "dstAddress": "239.255.42.100",
                "dstPort": 3493,
                "channelThreshold": "verbose"
            },
            "DFLT": {
                "ecu": "ECU1",
                "address": "0.0.0.0",
                "port": 3491,
                "channelThreshold": "error",
                "multicastInterface": "10.0.0.1"
            }
        },
        "channelAssignments": {
            "APP0": { "CTX0": ["DFLT", "CORE"] }
        },
        "messageThresholds": {
            "APP0": { "CTX0": "warn" }
        },
        "filteringEnabled": false,
        "defaultChannel": "DFLT",
        "coredumpChannel": "CORE",
        "defaultThreshold": "debug",
        "quotas": {
            "quotaEnforcementEnabled": true,
            "throughput": {
                "overallMbps": 12.5,
                "applicationsKbps": { "APP0": 256.0 }
            }
        }
    }"#;

    #[test]
    fn full_config_parses() {
        let config = StaticConfig::from_json(FULL_CONFIG).unwrap();
        assert_eq!(config.channels.len(), 2);
        let dflt = &config.channels["DFLT"];
        assert_eq!(dflt.port, 3491);
        assert_eq!(dflt.dst_address, DEFAULT_DST_ADDRESS);
        assert_eq!(dflt.dst_port, DEFAULT_DST_PORT);
        assert_eq!(dflt.channel_threshold, LogLevel::Error);
        let core = &config.channels["CORE"];
        assert_eq!(core.dst_address, "239.255.42.100");
        assert_eq!(core.dst_port, 3493);

        assert!(!config.filtering_enabled);
        assert_eq!(config.default_channel, DltId::new("DFLT"));
        assert_eq!(config.coredump_channel, Some(DltId::new("CORE")));
        assert_eq!(config.default_threshold, LogLevel::Debug);
        assert_eq!(
            config.channel_assignments[&(DltId::new("APP0"), DltId::new("CTX0"))],
            vec![DltId::new("DFLT"), DltId::new("CORE")]
        );
        assert_eq!(
            config.message_thresholds[&(DltId::new("APP0"), DltId::new("CTX0"))],
            LogLevel::Warn
        );
        assert!(config.throughput.quota_enforcement_enabled);
        assert_eq!(config.throughput.overall_mbps, 12.5);
    }

    #[test]
    fn optional_members_default() {
        let config = StaticConfig::from_json(
            r#"{"channels": {"ONLY": {"ecu": "E", "port": 1, "channelThreshold": "info"}}}"#,
        )
        .unwrap();
        assert!(config.filtering_enabled);
        assert_eq!(config.default_threshold, LogLevel::Verbose);
        assert!(config.coredump_channel.is_none());
        assert!(config.channel_assignments.is_empty());
    }

    #[test]
    fn misspelled_default_threshold_is_accepted() {
        let config = StaticConfig::from_json(
            r#"{"channels": {"A": {"ecu": "E", "port": 1, "channelThreshold": "info"}},
                "defaultThresold": "fatal"}"#,
        )
        .unwrap();
        assert_eq!(config.default_threshold, LogLevel::Fatal);

        let both = StaticConfig::from_json(
            r#"{"channels": {"A": {"ecu": "E", "port": 1, "channelThreshold": "info"}},
                "defaultThreshold": "warn", "defaultThresold": "fatal"}"#,
        )
        .unwrap();
        assert_eq!(both.default_threshold, LogLevel::Warn);
    }

    #[test]
    fn fatal_error_classes() {
        assert!(matches!(
            StaticConfig::load(Path::new("/nonexistent/datarouter.json")),
            Err(ConfigError::NoFileFound(_))
        ));
        assert!(matches!(
            StaticConfig::from_json("{not json"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            StaticConfig::from_json(r#"[1, 2]"#),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            StaticConfig::from_json(r#"{"channels": {}}"#),
            Err(ConfigError::NoChannelsFound)
        ));
        assert!(matches!(
            StaticConfig::from_json(r#"{"noChannels": true}"#),
            Err(ConfigError::NoChannelsFound)
        ));
    }
}
