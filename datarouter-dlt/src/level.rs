// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// DLT log levels. The numeric ordering matters: a message passes a
/// threshold when its level is numerically less than or equal to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Fatal = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Verbose = 6,
}

impl LogLevel {
    /// Maps the on-wire byte; anything outside 0..=6 is invalid.
    pub fn try_from_u8(value: u8) -> Option<LogLevel> {
        match value {
            0 => Some(LogLevel::Off),
            1 => Some(LogLevel::Fatal),
            2 => Some(LogLevel::Error),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Info),
            5 => Some(LogLevel::Debug),
            6 => Some(LogLevel::Verbose),
            _ => None,
        }
    }

    /// Name used in configuration files and the persistence payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
        }
    }

    pub fn from_name(name: &str) -> Option<LogLevel> {
        match name {
            "off" => Some(LogLevel::Off),
            "fatal" => Some(LogLevel::Fatal),
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "verbose" => Some(LogLevel::Verbose),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_mapping_is_total_over_0_to_6() {
        for value in 0u8..=6 {
            assert_eq!(LogLevel::try_from_u8(value).unwrap() as u8, value);
        }
        assert!(LogLevel::try_from_u8(7).is_none());
        assert!(LogLevel::try_from_u8(0xFF).is_none());
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(LogLevel::Fatal < LogLevel::Verbose);
        assert!(LogLevel::Info <= LogLevel::Info);
        assert!(LogLevel::Verbose > LogLevel::Error);
    }

    #[test]
    fn names_roundtrip() {
        for value in 0u8..=6 {
            let level = LogLevel::try_from_u8(value).unwrap();
            assert_eq!(LogLevel::from_name(level.as_str()), Some(level));
        }
        assert!(LogLevel::from_name("chatty").is_none());
    }
}
