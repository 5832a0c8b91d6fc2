use std::fmt;
use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;


pub const HEART_RATE_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a3700001000800000805f9b34fb);
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a1900001000800000805f9b34fb);

/// Bit 0 of the Heart Rate Measurement flags selects the 16-bit BPM format.
const HR_FORMAT_16BIT: u8 = 0x01;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    HeartRate { bpm: u8 },
    BatteryLevel { percent: u8 },
}

/// One decoded sample from the sensor. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryReading {
    pub kind: ReadingKind,
    pub at: Instant,
}

impl TelemetryReading {
    pub fn heart_rate(bpm: u8) -> Self {
        TelemetryReading {
            kind: ReadingKind::HeartRate { bpm },
            at: Instant::now(),
        }
    }

    pub fn battery_level(percent: u8) -> Self {
        TelemetryReading {
            kind: ReadingKind::BatteryLevel { percent },
            at: Instant::now(),
        }
    }

    pub fn is_heart_rate(&self) -> bool {
        matches!(self.kind, ReadingKind::HeartRate { .. })
    }

    /// What subscribers receive: the numeric payload as a decimal string.
    pub fn wire_payload(&self) -> String {
        match self.kind {
            ReadingKind::HeartRate { bpm } => bpm.to_string(),
            ReadingKind::BatteryLevel { percent } => percent.to_string(),
        }
    }
}

impl fmt::Display for TelemetryReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ReadingKind::HeartRate { bpm } => write!(f, "{bpm} BPM"),
            ReadingKind::BatteryLevel { percent } => write!(f, "battery {percent}%"),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("heart rate frame too short ({len} bytes)")]
    HeartRateTooShort { len: usize },
    #[error("heart rate frame uses the unsupported 16-bit format (flags {flags:#04x})")]
    HeartRate16Bit { flags: u8 },
    #[error("battery frame must be exactly 1 byte, got {len}")]
    BatteryLength { len: usize },
    #[error("battery level {value} is outside 0-100")]
    BatteryOutOfRange { value: u8 },
}

pub fn decode_heart_rate(frame: &[u8]) -> Result<TelemetryReading, DecodeError> {
    let &[flags, bpm, ..] = frame else {
        return Err(DecodeError::HeartRateTooShort { len: frame.len() });
    };
    if flags & HR_FORMAT_16BIT != 0 {
        return Err(DecodeError::HeartRate16Bit { flags });
    }

    Ok(TelemetryReading::heart_rate(bpm))
}

pub fn decode_battery(frame: &[u8]) -> Result<TelemetryReading, DecodeError> {
    let &[value] = frame else {
        return Err(DecodeError::BatteryLength { len: frame.len() });
    };
    if value > 100 {
        return Err(DecodeError::BatteryOutOfRange { value });
    }

    Ok(TelemetryReading::battery_level(value))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heart_rate_8bit_uses_second_byte() {
        for bpm in [0u8, 1, 72, 180, 255] {
            // RR-interval and energy bits in the flags don't matter
            for flags in [0x00u8, 0x06, 0x10, 0x16] {
                let reading = decode_heart_rate(&[flags, bpm, 0xaa, 0xbb]).unwrap();
                assert_eq!(reading.kind, ReadingKind::HeartRate { bpm });
            }
        }
    }

    #[test]
    fn heart_rate_16bit_is_rejected() {
        assert_eq!(
            decode_heart_rate(&[0x01, 0x48, 0x00]),
            Err(DecodeError::HeartRate16Bit { flags: 0x01 })
        );
    }

    #[test]
    fn heart_rate_short_frames_are_rejected() {
        assert_eq!(decode_heart_rate(&[]), Err(DecodeError::HeartRateTooShort { len: 0 }));
        assert_eq!(decode_heart_rate(&[0x00]), Err(DecodeError::HeartRateTooShort { len: 1 }));
    }

    #[test]
    fn battery_single_byte() {
        for percent in 0..=100u8 {
            let reading = decode_battery(&[percent]).unwrap();
            assert_eq!(reading.kind, ReadingKind::BatteryLevel { percent });
        }
    }

    #[test]
    fn battery_bad_frames() {
        assert_eq!(decode_battery(&[]), Err(DecodeError::BatteryLength { len: 0 }));
        assert_eq!(decode_battery(&[50, 1]), Err(DecodeError::BatteryLength { len: 2 }));
        assert_eq!(decode_battery(&[101]), Err(DecodeError::BatteryOutOfRange { value: 101 }));
    }

    #[test]
    fn wire_payload_is_plain_decimal() {
        assert_eq!(TelemetryReading::heart_rate(72).wire_payload(), "72");
        assert_eq!(TelemetryReading::battery_level(5).wire_payload(), "5");
    }
}
