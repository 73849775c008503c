// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary diagnostic command protocol. A command is one identifier byte plus
//! fixed-size operands; parsing yields a command value whose execution calls
//! exactly one engine operation. Malformed input parses to nothing and the
//! peer receives a single error byte.

use crate::dlt_log_server::{AssignmentAction, DltLogServer, Threshold, RET_ERROR};
use datarouter_dlt::{DltId, LogLevel};
use tracing::warn;

pub const SET_LOG_LEVEL: u8 = 0;
pub const RESET_TO_DEFAULT: u8 = 1;
pub const SET_MESSAGING_FILTERING_STATE: u8 = 2;
pub const SET_LOG_CHANNEL_THRESHOLD: u8 = 3;
pub const STORE_DLT_CONFIG: u8 = 4;
pub const SET_TRACE_STATE: u8 = 5;
pub const SET_DEFAULT_LOG_LEVEL: u8 = 6;
pub const SET_DEFAULT_TRACE_STATE: u8 = 7;
pub const READ_LOG_CHANNEL_NAMES: u8 = 8;
pub const SET_LOG_CHANNEL_ASSIGNMENT: u8 = 9;
pub const SET_DLT_OUTPUT_ENABLE: u8 = 10;

pub const ENABLE: u8 = 1;
pub const DISABLE: u8 = 0;

/// Threshold byte requesting a fall back to the default threshold; only
/// valid for SET_LOG_LEVEL.
pub const USE_DEFAULT_THRESHOLD: u8 = 0xFF;

const COMMAND_ID_SIZE: usize = 1;
const LOG_LEVEL_SIZE: usize = 1;
const STATE_SIZE: usize = 1;
const TRACE_STATE_SIZE: usize = 1;
const ID_SIZE: usize = DltId::SIZE;

/// Parsed diagnostic command. Execution dispatches exhaustively; there is
/// one variant per wire command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticCommand {
    SetLogLevel {
        app_id: DltId,
        ctx_id: DltId,
        threshold: Threshold,
    },
    ResetToDefault,
    SetMessagingFilteringState {
        enabled: bool,
    },
    SetLogChannelThreshold {
        channel: DltId,
        threshold: LogLevel,
    },
    StoreDltConfig,
    SetTraceState,
    SetDefaultLogLevel {
        level: LogLevel,
    },
    SetDefaultTraceState,
    ReadLogChannelNames,
    SetLogChannelAssignment {
        app_id: DltId,
        ctx_id: DltId,
        channel: DltId,
        action: AssignmentAction,
    },
    SetDltOutputEnable {
        enable: bool,
    },
}

fn extract_id(command: &[u8], offset: usize) -> DltId {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&command[offset..offset + ID_SIZE]);
    DltId::from_bytes(bytes)
}

fn assignment_action(value: u8) -> Option<AssignmentAction> {
    match value {
        0 => Some(AssignmentAction::Remove),
        1 => Some(AssignmentAction::Add),
        _ => None,
    }
}

impl DiagnosticCommand {
    pub fn parse(command: &[u8]) -> Option<DiagnosticCommand> {
        let (&command_id, _) = command.split_first()?;

        match command_id {
            READ_LOG_CHANNEL_NAMES => Some(DiagnosticCommand::ReadLogChannelNames),
            RESET_TO_DEFAULT => Some(DiagnosticCommand::ResetToDefault),
            STORE_DLT_CONFIG => Some(DiagnosticCommand::StoreDltConfig),
            SET_TRACE_STATE => Some(DiagnosticCommand::SetTraceState),
            SET_DEFAULT_TRACE_STATE => Some(DiagnosticCommand::SetDefaultTraceState),

            SET_LOG_CHANNEL_THRESHOLD => {
                if command.len() != COMMAND_ID_SIZE + ID_SIZE + LOG_LEVEL_SIZE + TRACE_STATE_SIZE {
                    return None;
                }
                let Some(threshold) =
                    LogLevel::try_from_u8(command[COMMAND_ID_SIZE + ID_SIZE])
                else {
                    warn!("incorrect log level value received from diagnostics");
                    return None;
                };
                // The trailing trace state byte is ignored for now.
                Some(DiagnosticCommand::SetLogChannelThreshold {
                    channel: extract_id(command, COMMAND_ID_SIZE),
                    threshold,
                })
            }

            SET_LOG_LEVEL => {
                if command.len() != COMMAND_ID_SIZE + 2 * ID_SIZE + LOG_LEVEL_SIZE {
                    return None;
                }
                let threshold_byte = command[COMMAND_ID_SIZE + 2 * ID_SIZE];
                let threshold = if threshold_byte == USE_DEFAULT_THRESHOLD {
                    Threshold::UseDefault
                } else {
                    match LogLevel::try_from_u8(threshold_byte) {
                        Some(level) => Threshold::Level(level),
                        None => {
                            warn!("incorrect log level value received from diagnostics");
                            return None;
                        }
                    }
                };
                Some(DiagnosticCommand::SetLogLevel {
                    app_id: extract_id(command, COMMAND_ID_SIZE),
                    ctx_id: extract_id(command, COMMAND_ID_SIZE + ID_SIZE),
                    threshold,
                })
            }

            SET_MESSAGING_FILTERING_STATE => {
                if command.len() != COMMAND_ID_SIZE + STATE_SIZE {
                    return None;
                }
                Some(DiagnosticCommand::SetMessagingFilteringState {
                    enabled: command[COMMAND_ID_SIZE] != 0,
                })
            }

            SET_DEFAULT_LOG_LEVEL => {
                if command.len() != COMMAND_ID_SIZE + LOG_LEVEL_SIZE {
                    return None;
                }
                match LogLevel::try_from_u8(command[COMMAND_ID_SIZE]) {
                    Some(level) => Some(DiagnosticCommand::SetDefaultLogLevel { level }),
                    None => {
                        warn!("incorrect default log level received from diagnostics");
                        None
                    }
                }
            }

            SET_LOG_CHANNEL_ASSIGNMENT => {
                if command.len() != COMMAND_ID_SIZE + 3 * ID_SIZE + 1 {
                    return None;
                }
                let Some(action) = assignment_action(command[COMMAND_ID_SIZE + 3 * ID_SIZE])
                else {
                    warn!("incorrect assignment action received from diagnostics");
                    return None;
                };
                Some(DiagnosticCommand::SetLogChannelAssignment {
                    app_id: extract_id(command, COMMAND_ID_SIZE),
                    ctx_id: extract_id(command, COMMAND_ID_SIZE + ID_SIZE),
                    channel: extract_id(command, COMMAND_ID_SIZE + 2 * ID_SIZE),
                    action,
                })
            }

            SET_DLT_OUTPUT_ENABLE => {
                if command.len() != COMMAND_ID_SIZE + STATE_SIZE {
                    return None;
                }
                let flag = command[COMMAND_ID_SIZE];
                if flag != ENABLE && flag != DISABLE {
                    return None;
                }
                Some(DiagnosticCommand::SetDltOutputEnable {
                    enable: flag == ENABLE,
                })
            }

            _ => None,
        }
    }

    /// Executes the parsed command against the engine; every variant calls
    /// exactly one engine operation.
    pub fn execute(&self, server: &DltLogServer) -> Vec<u8> {
        match *self {
            DiagnosticCommand::SetLogLevel {
                app_id,
                ctx_id,
                threshold,
            } => server.set_log_level(app_id, ctx_id, threshold),
            DiagnosticCommand::ResetToDefault => server.reset_to_default(),
            DiagnosticCommand::SetMessagingFilteringState { enabled } => {
                server.set_messaging_filtering_state(enabled)
            }
            DiagnosticCommand::SetLogChannelThreshold { channel, threshold } => {
                server.set_log_channel_threshold(channel, threshold)
            }
            DiagnosticCommand::StoreDltConfig => server.store_dlt_config(),
            DiagnosticCommand::SetTraceState => server.set_trace_state(),
            DiagnosticCommand::SetDefaultLogLevel { level } => server.set_default_log_level(level),
            DiagnosticCommand::SetDefaultTraceState => server.set_default_trace_state(),
            DiagnosticCommand::ReadLogChannelNames => server.read_log_channel_names(),
            DiagnosticCommand::SetLogChannelAssignment {
                app_id,
                ctx_id,
                channel,
                action,
            } => server.set_log_channel_assignment(app_id, ctx_id, channel, action),
            DiagnosticCommand::SetDltOutputEnable { enable } => {
                server.set_dlt_output_enable(enable)
            }
        }
    }
}

impl DltLogServer {
    /// Parse-then-execute entry point for the control socket; unparsable
    /// commands answer with a single error byte.
    pub fn on_config_command(&self, command: &[u8]) -> Vec<u8> {
        match DiagnosticCommand::parse(command) {
            Some(parsed) => parsed.execute(self),
            None => vec![RET_ERROR],
        }
    }
}
