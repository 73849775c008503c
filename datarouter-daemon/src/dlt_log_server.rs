// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The routing and filtering engine. Every log record is dispatched to the
//! set of channels selected by its `(application, context)` routing mask,
//! gated by the per-message and per-channel thresholds. Runtime mutations
//! arrive through the diagnostic configuration protocol and take effect
//! without restart.

use crate::channel::DltLogChannel;
use crate::config::{IdPair, StaticConfig, ZwoState};
use crate::persistence::{
    read_dlt, read_dlt_enabled, write_dlt, write_dlt_enabled, PersistentConfig,
    PersistentDictionary,
};
use crate::record::LogEntry;
use datarouter_dlt::{DltId, LogLevel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Bit set over channel indices. Channel count is bounded below the bit
/// width at initialization.
pub type ChannelMask = u64;

const MAX_CHANNELS: usize = ChannelMask::BITS as usize - 1;

pub const RET_OK: u8 = 0x00;
pub const RET_ERROR: u8 = 0xFE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignmentAction {
    Remove = 0,
    Add = 1,
}

/// A message threshold update: either an explicit level or a reset to the
/// default threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Threshold {
    UseDefault,
    Level(LogLevel),
}

/// Descriptor of a non-verbose message source.
#[derive(Clone, Copy, Debug)]
pub struct NvMessageDescriptor {
    pub app_id: DltId,
    pub ctx_id: DltId,
    pub log_level: LogLevel,
    pub msgid: u32,
}

/// Seam between filtering and the sockets, so tests can count dispatches.
pub trait LogSender: Send + Sync {
    fn send_verbose(&self, tmsp: u32, entry: &LogEntry<'_>, channel: &DltLogChannel);
    fn send_non_verbose(
        &self,
        desc: &NvMessageDescriptor,
        tmsp: u32,
        data: &[u8],
        channel: &DltLogChannel,
    );
    #[allow(clippy::too_many_arguments)]
    fn send_ft_verbose(
        &self,
        data: &[u8],
        level: LogLevel,
        app_id: DltId,
        ctx_id: DltId,
        nor: u8,
        tmsp: u32,
        channel: &DltLogChannel,
    );
}

/// Production sender: forwards to the channel's UDP socket.
pub struct UdpLogSender;

impl LogSender for UdpLogSender {
    fn send_verbose(&self, tmsp: u32, entry: &LogEntry<'_>, channel: &DltLogChannel) {
        channel.send_verbose(tmsp, entry);
    }

    fn send_non_verbose(
        &self,
        desc: &NvMessageDescriptor,
        tmsp: u32,
        data: &[u8],
        channel: &DltLogChannel,
    ) {
        channel.send_non_verbose(desc.msgid, tmsp, data);
    }

    fn send_ft_verbose(
        &self,
        data: &[u8],
        level: LogLevel,
        app_id: DltId,
        ctx_id: DltId,
        nor: u8,
        tmsp: u32,
        channel: &DltLogChannel,
    ) {
        channel.send_ft_verbose(data, level, app_id, ctx_id, nor, tmsp);
    }
}

/// Mutable routing state, everything behind the single configuration mutex.
struct RoutingState {
    channel_assignments: HashMap<IdPair, ChannelMask, ZwoState>,
    message_thresholds: HashMap<IdPair, LogLevel, ZwoState>,
    filtering_enabled: bool,
    default_threshold: LogLevel,
}

pub struct DltLogServer {
    channels: Vec<DltLogChannel>,
    channel_nums: HashMap<DltId, usize, ZwoState>,
    default_channel: usize,
    coredump_channel: Option<usize>,
    fallback_mode: bool,
    dlt_output_enabled: AtomicBool,
    routing: Mutex<RoutingState>,
    static_config: StaticConfig,
    store: Mutex<Box<dyn PersistentDictionary>>,
    sender: Box<dyn LogSender>,
}

impl DltLogServer {
    pub fn new(static_config: StaticConfig, store: Box<dyn PersistentDictionary>) -> DltLogServer {
        Self::with_sender(static_config, store, Box::new(UdpLogSender))
    }

    pub fn with_sender(
        static_config: StaticConfig,
        store: Box<dyn PersistentDictionary>,
        sender: Box<dyn LogSender>,
    ) -> DltLogServer {
        let persistent = read_dlt(&*store);
        let output_enabled = read_dlt_enabled(&*store);

        let mut fallback_mode =
            static_config.channels.is_empty() || static_config.channels.len() > MAX_CHANNELS;

        let mut channels = Vec::new();
        let mut channel_nums: HashMap<DltId, usize, ZwoState> = HashMap::default();
        let mut default_channel = 0usize;
        let mut coredump_channel = None;

        if !fallback_mode {
            let has_persistent = !persistent.is_empty();
            for (index, (name, description)) in static_config.channels.iter().enumerate() {
                let id = DltId::new(name);
                if static_config.default_channel == id {
                    default_channel = index;
                }
                if static_config.coredump_channel == Some(id) {
                    coredump_channel = Some(index);
                }
                let threshold = if has_persistent {
                    persistent
                        .channels
                        .get(name)
                        .copied()
                        .unwrap_or(description.channel_threshold)
                } else {
                    description.channel_threshold
                };
                match DltLogChannel::new(
                    id,
                    threshold,
                    description.ecu,
                    &description.address,
                    description.port,
                    &description.dst_address,
                    description.dst_port,
                    &description.multicast_interface,
                ) {
                    Ok(channel) => {
                        channel_nums.insert(id, index);
                        channels.push(channel);
                    }
                    Err(err) => {
                        // A channel without a socket would shift every
                        // following index, corrupting the routing masks;
                        // degrade like an invalid channel list instead.
                        error!("channel {name} could not be created: {err}");
                        fallback_mode = true;
                        break;
                    }
                }
            }
        }

        if fallback_mode {
            error!(
                "invalid channel list ({} channels), using the fallback channel",
                static_config.channels.len()
            );
            channels.clear();
            channel_nums.clear();
            default_channel = 0;
            coredump_channel = None;
            match fallback_channel() {
                Ok(channel) => {
                    channel_nums.insert(channel.name(), 0);
                    channels.push(channel);
                }
                Err(err) => error!("fallback channel could not be created: {err}"),
            }
        }

        let routing = build_routing_state(
            fallback_mode,
            &static_config,
            &persistent,
            &channel_nums,
        );

        DltLogServer {
            channels,
            channel_nums,
            default_channel,
            coredump_channel,
            fallback_mode,
            dlt_output_enabled: AtomicBool::new(output_enabled),
            routing: Mutex::new(routing),
            static_config,
            store: Mutex::new(store),
            sender,
        }
    }

    pub fn channels(&self) -> &[DltLogChannel] {
        &self.channels
    }

    pub fn dlt_output_enabled(&self) -> bool {
        self.dlt_output_enabled.load(Ordering::Relaxed)
    }

    /// The dispatch core. Invokes `sender` for every channel that passes the
    /// enable gate, the message threshold, the routing mask and the channel
    /// threshold. No lock is held while `sender` runs.
    pub fn filter_and_call(
        &self,
        app_id: DltId,
        ctx_id: DltId,
        level: LogLevel,
        mut sender: impl FnMut(usize, &DltLogChannel),
    ) {
        if !self.dlt_output_enabled.load(Ordering::Relaxed) {
            return;
        }

        let mask = {
            let routing = lock(&self.routing);
            if routing.filtering_enabled {
                let threshold = routing
                    .message_thresholds
                    .get(&(app_id, ctx_id))
                    .copied()
                    .unwrap_or(routing.default_threshold);
                if level > threshold {
                    return;
                }
            }
            match routing.channel_assignments.get(&(app_id, ctx_id)) {
                Some(&mask) if mask != 0 => mask,
                _ => 1 << self.default_channel,
            }
        };

        for (index, channel) in self.channels.iter().enumerate() {
            if mask & (1 << index) != 0 && level <= channel.threshold() {
                sender(index, channel);
            }
        }
    }

    pub fn send_verbose(&self, tmsp: u32, entry: &LogEntry<'_>) {
        self.filter_and_call(entry.app_id, entry.ctx_id, entry.log_level, |_, channel| {
            self.sender.send_verbose(tmsp, entry, channel);
        });
    }

    pub fn send_non_verbose(&self, desc: &NvMessageDescriptor, tmsp: u32, data: &[u8]) {
        self.filter_and_call(desc.app_id, desc.ctx_id, desc.log_level, |_, channel| {
            self.sender.send_non_verbose(desc, tmsp, data, channel);
        });
    }

    /// File-transfer frames bypass all filtering when a coredump channel is
    /// configured: a crashing process' partial logs must reach the dedicated
    /// endpoint regardless of runtime configuration.
    pub fn send_ft_verbose(
        &self,
        data: &[u8],
        level: LogLevel,
        app_id: DltId,
        ctx_id: DltId,
        nor: u8,
        tmsp: u32,
    ) {
        if let Some(index) = self.coredump_channel {
            if let Some(channel) = self.channels.get(index) {
                self.sender
                    .send_ft_verbose(data, level, app_id, ctx_id, nor, tmsp, channel);
            }
            return;
        }
        self.filter_and_call(app_id, ctx_id, level, |_, channel| {
            self.sender
                .send_ft_verbose(data, level, app_id, ctx_id, nor, tmsp, channel);
        });
    }

    // --- Diagnostic operations -------------------------------------------

    pub fn read_log_channel_names(&self) -> Vec<u8> {
        let _routing = lock(&self.routing);
        let mut response = vec![RET_OK];
        for channel in &self.channels {
            response.extend_from_slice(channel.name().as_bytes());
        }
        response
    }

    pub fn reset_to_default(&self) -> Vec<u8> {
        self.clear_database();
        self.reload_from_persistent();
        vec![RET_OK]
    }

    pub fn store_dlt_config(&self) -> Vec<u8> {
        self.save_database();
        vec![RET_OK]
    }

    pub fn set_trace_state(&self) -> Vec<u8> {
        vec![RET_OK]
    }

    pub fn set_default_trace_state(&self) -> Vec<u8> {
        vec![RET_OK]
    }

    pub fn set_log_channel_threshold(&self, channel: DltId, threshold: LogLevel) -> Vec<u8> {
        let Some(&index) = self.channel_nums.get(&channel) else {
            return vec![RET_ERROR];
        };
        let _routing = lock(&self.routing);
        self.channels[index].set_threshold(threshold);
        vec![RET_OK]
    }

    pub fn set_log_level(&self, app_id: DltId, ctx_id: DltId, threshold: Threshold) -> Vec<u8> {
        let mut routing = lock(&self.routing);
        routing.message_thresholds.remove(&(app_id, ctx_id));
        if let Threshold::Level(level) = threshold {
            routing.message_thresholds.insert((app_id, ctx_id), level);
        }
        vec![RET_OK]
    }

    pub fn set_messaging_filtering_state(&self, enabled: bool) -> Vec<u8> {
        lock(&self.routing).filtering_enabled = enabled;
        vec![RET_OK]
    }

    pub fn set_default_log_level(&self, level: LogLevel) -> Vec<u8> {
        lock(&self.routing).default_threshold = level;
        vec![RET_OK]
    }

    pub fn set_log_channel_assignment(
        &self,
        app_id: DltId,
        ctx_id: DltId,
        channel: DltId,
        action: AssignmentAction,
    ) -> Vec<u8> {
        let Some(&index) = self.channel_nums.get(&channel) else {
            return vec![RET_ERROR];
        };
        let mask: ChannelMask = 1 << index;

        let mut routing = lock(&self.routing);
        match routing.channel_assignments.get_mut(&(app_id, ctx_id)) {
            None => {
                if action == AssignmentAction::Add {
                    routing.channel_assignments.insert((app_id, ctx_id), mask);
                }
            }
            Some(assigned) => {
                if action == AssignmentAction::Add {
                    *assigned |= mask;
                } else {
                    *assigned &= !mask;
                    if *assigned == 0 {
                        routing.channel_assignments.remove(&(app_id, ctx_id));
                    }
                }
            }
        }
        vec![RET_OK]
    }

    pub fn set_dlt_output_enable(&self, enable: bool) -> Vec<u8> {
        if enable {
            info!("DRCMD: enable output");
        } else {
            error!("DRCMD: disable output");
        }
        self.set_output_enabled(enable);
        vec![RET_OK]
    }

    fn set_output_enabled(&self, enabled: bool) {
        let update = self.dlt_output_enabled.load(Ordering::Relaxed) != enabled;
        if update {
            self.dlt_output_enabled.store(enabled, Ordering::Relaxed);
            write_dlt_enabled(enabled, &mut **lock(&self.store));
        }
    }

    // --- Persistence ------------------------------------------------------

    fn save_database(&self) {
        let mut persistent = PersistentConfig::default();

        {
            let routing = lock(&self.routing);
            for channel in &self.channels {
                persistent
                    .channels
                    .insert(channel.name().display_name(), channel.threshold());
            }
            for (&(app_id, ctx_id), &mask) in &routing.channel_assignments {
                let mut assigned = Vec::new();
                for (index, channel) in self.channels.iter().enumerate() {
                    if mask & (1 << index) != 0 {
                        assigned.push(channel.name());
                    }
                }
                persistent
                    .channel_assignments
                    .insert((app_id, ctx_id), assigned);
            }
            persistent.filtering_enabled = routing.filtering_enabled;
            persistent.default_threshold = routing.default_threshold;
            persistent.message_thresholds = routing.message_thresholds.clone();
        }

        write_dlt(&persistent, &mut **lock(&self.store));
    }

    fn clear_database(&self) {
        write_dlt(&PersistentConfig::default(), &mut **lock(&self.store));
    }

    /// Reload thresholds and routing from the store (or static defaults),
    /// preserving sockets: channels are never recreated.
    fn reload_from_persistent(&self) {
        if self.fallback_mode {
            if let Some(channel) = self.channels.first() {
                channel.set_threshold(LogLevel::Off);
            }
            return;
        }

        let persistent = read_dlt(&**lock(&self.store));
        let has_persistent = !persistent.is_empty();

        for channel in &self.channels {
            let name = channel.name().display_name();
            let threshold = if has_persistent {
                persistent.channels.get(&name).copied()
            } else {
                None
            }
            .or_else(|| {
                self.static_config
                    .channels
                    .get(&name)
                    .map(|description| description.channel_threshold)
            })
            .unwrap_or(LogLevel::Off);
            channel.set_threshold(threshold);
        }

        let mut routing = lock(&self.routing);
        *routing = build_routing_state(
            self.fallback_mode,
            &self.static_config,
            &persistent,
            &self.channel_nums,
        );
    }
}

fn fallback_channel() -> std::io::Result<DltLogChannel> {
    DltLogChannel::new(
        DltId::new("TEST"),
        LogLevel::Error,
        DltId::new("HOST"),
        "0.0.0.0",
        3491,
        "239.255.42.99",
        3490,
        "",
    )
}

fn build_routing_state(
    fallback_mode: bool,
    static_config: &StaticConfig,
    persistent: &PersistentConfig,
    channel_nums: &HashMap<DltId, usize, ZwoState>,
) -> RoutingState {
    if fallback_mode {
        return RoutingState {
            channel_assignments: HashMap::default(),
            message_thresholds: HashMap::default(),
            filtering_enabled: false,
            default_threshold: LogLevel::Error,
        };
    }

    let has_persistent = !persistent.is_empty();

    let assignments_source = if has_persistent {
        &persistent.channel_assignments
    } else {
        &static_config.channel_assignments
    };
    let mut channel_assignments: HashMap<IdPair, ChannelMask, ZwoState> = HashMap::default();
    for (&pair, assigned) in assignments_source {
        let mut mask: ChannelMask = 0;
        for name in assigned {
            match channel_nums.get(name) {
                Some(&index) => mask |= 1 << index,
                None => warn!("assignment references unknown channel {name}"),
            }
        }
        channel_assignments.insert(pair, mask);
    }

    RoutingState {
        channel_assignments,
        message_thresholds: if has_persistent {
            persistent.message_thresholds.clone()
        } else {
            static_config.message_thresholds.clone()
        },
        filtering_enabled: if has_persistent {
            persistent.filtering_enabled
        } else {
            static_config.filtering_enabled
        },
        default_threshold: if has_persistent {
            persistent.default_threshold
        } else {
            static_config.default_threshold
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
