//! Register descriptors, the value codec and the static register catalog.
//!
//! Every register is described by a [`RegisterSpec`]: where it lives, how many 16-bit words it
//! spans, how the combined integer is interpreted and what it has to be multiplied by to obtain
//! the physical value.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::EnumString)]
pub enum DataType {
    UInt16,
    UInt32,
    Int16,
    Int32,
    /// Raw integer shown in hexadecimal. Never scaled.
    Hex,
    /// Packed `year(2) month day hour minute second` byte stream. Never scaled.
    Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct RegisterSpec {
    pub address: u16,
    pub words: u16,
    /// Multiplier applied to the raw integer. `0` and `1` both mean "unscaled".
    pub scale: f64,
    pub data_type: DataType,
}

impl RegisterSpec {
    pub const fn new(address: u16, words: u16, scale: f64, data_type: DataType) -> Self {
        Self { address, words, scale, data_type }
    }

    pub fn factor(&self) -> f64 {
        if self.scale == 0.0 { 1.0 } else { self.scale }
    }

    /// Interpret words read from the device.
    ///
    /// Never fails: malformed data is represented by [`Value::Invalid`].
    pub fn decode(&self, raw: &[u16]) -> Value {
        if raw.len() != usize::from(self.words) {
            return Value::Invalid(DecodeError::WordCount { expected: self.words, got: raw.len() });
        }
        if self.data_type == DataType::Timestamp {
            return decode_timestamp(raw);
        }
        if raw.len() > 4 {
            return Value::Invalid(DecodeError::TooWide { words: self.words });
        }
        let combined = raw.iter().fold(0u64, |acc, &word| (acc << 16) | u64::from(word));
        let scale = self.factor();
        match self.data_type {
            DataType::Hex => Value::Hex(combined),
            // Sign reinterpretation happens at the declared width, not at the combined width.
            DataType::Int16 => Value::Signed { raw: i64::from(combined as u16 as i16), scale },
            DataType::Int32 => Value::Signed { raw: i64::from(combined as u32 as i32), scale },
            DataType::UInt16 | DataType::UInt32 => Value::Unsigned { raw: combined, scale },
            DataType::Timestamp => decode_timestamp(raw),
        }
    }

    /// Convert a physical value into the raw integer to write. Truncates, does not clamp.
    pub fn encode(&self, physical: f64) -> i64 {
        match self.data_type {
            DataType::Hex | DataType::Timestamp => physical.trunc() as i64,
            _ => (physical / self.factor()).trunc() as i64,
        }
    }

    /// Range check a raw integer against a single register word.
    pub fn to_word(&self, raw: i64) -> Option<u16> {
        match self.data_type {
            DataType::Int16 | DataType::Int32 => i16::try_from(raw).ok().map(|v| v as u16),
            _ => u16::try_from(raw).ok(),
        }
    }
}

fn decode_timestamp(raw: &[u16]) -> Value {
    let bytes = raw.iter().flat_map(|word| word.to_be_bytes()).collect::<Vec<u8>>();
    let &[y0, y1, month, day, hour, minute, second, ..] = bytes.as_slice() else {
        return Value::Invalid(DecodeError::ShortTimestamp { bytes });
    };
    let year = u16::from_be_bytes([y0, y1]);
    let fields = (
        i16::try_from(year),
        i8::try_from(month),
        i8::try_from(day),
        i8::try_from(hour),
        i8::try_from(minute),
        i8::try_from(second),
    );
    let (Ok(year), Ok(month), Ok(day), Ok(hour), Ok(minute), Ok(second)) = fields else {
        let reason = "field out of range".to_string();
        return Value::Invalid(DecodeError::InvalidTimestamp { bytes, reason });
    };
    match jiff::civil::DateTime::new(year, month, day, hour, minute, second, 0) {
        Ok(datetime) => Value::Timestamp(datetime),
        Err(e) => Value::Invalid(DecodeError::InvalidTimestamp { bytes, reason: e.to_string() }),
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} words, got {got}")]
    WordCount { expected: u16, got: usize },
    #[error("{words} words do not fit into an integer")]
    TooWide { words: u16 },
    #[error("not enough bytes for a timestamp: {bytes:02x?}")]
    ShortTimestamp { bytes: Vec<u8> },
    #[error("invalid timestamp {bytes:02x?}: {reason}")]
    InvalidTimestamp { bytes: Vec<u8>, reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Unsigned { raw: u64, scale: f64 },
    Signed { raw: i64, scale: f64 },
    Hex(u64),
    Timestamp(jiff::civil::DateTime),
    Invalid(DecodeError),
}

impl Value {
    /// The physical value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Unsigned { raw, scale } => Some(raw as f64 * scale),
            Value::Signed { raw, scale } => Some(raw as f64 * scale),
            Value::Hex(raw) => Some(raw as f64),
            Value::Timestamp(_) | Value::Invalid(_) => None,
        }
    }

    /// The unscaled integer for unsigned and hexadecimal values.
    ///
    /// Status words and fault bitfields are read through this.
    pub fn as_bits(&self) -> Option<u64> {
        match *self {
            Value::Unsigned { raw, .. } | Value::Hex(raw) => Some(raw),
            Value::Signed { raw, .. } => u64::try_from(raw).ok(),
            Value::Timestamp(_) | Value::Invalid(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid(_))
    }
}

fn decimals(scale: f64) -> usize {
    if scale >= 1.0 { 0 } else { (-scale.log10()).round() as usize }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned { raw, scale } if *scale == 1.0 => write!(f, "{raw}"),
            Value::Signed { raw, scale } if *scale == 1.0 => write!(f, "{raw}"),
            Value::Unsigned { scale, .. } | Value::Signed { scale, .. } => {
                let value = self.as_f64().unwrap_or_default();
                write!(f, "{value:.*}", decimals(*scale))
            }
            Value::Hex(raw) => write!(f, "{raw:#x}"),
            Value::Timestamp(datetime) => write!(f, "{datetime}"),
            Value::Invalid(e) => write!(f, "invalid ({e})"),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Unsigned { raw, scale } if scale == 1.0 => serializer.serialize_u64(raw),
            Value::Signed { raw, scale } if scale == 1.0 => serializer.serialize_i64(raw),
            Value::Unsigned { .. } | Value::Signed { .. } => {
                serializer.serialize_f64(self.as_f64().unwrap_or_default())
            }
            Value::Hex(_) | Value::Timestamp(_) | Value::Invalid(_) => {
                serializer.collect_str(self)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::ReadOnly => "R-",
            Access::ReadWrite => "RW",
        })
    }
}

#[derive(Debug, serde::Serialize)]
pub struct Register {
    pub name: &'static str,
    pub unit: &'static str,
    pub access: Access,
    #[serde(flatten)]
    pub spec: RegisterSpec,
}

impl Register {
    pub fn is_match(&self, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        self.name.contains(&pattern)
            || self.unit.to_uppercase() == pattern
            || self.spec.address.to_string().contains(&pattern)
            || format!("{:#06x}", self.spec.address).to_uppercase().contains(&pattern)
    }
}

macro_rules! catalog {
    (@words) => { 1 };
    (@words $words:literal) => { $words };
    (@scale) => { 1.0 };
    (@scale $scale:literal) => { $scale };
    (@unit) => { "" };
    (@unit $unit:literal) => { $unit };
    ($table:ident: $access:ident {
        $($name:ident = $address:literal: $ty:ident $(x $words:literal)?
            $(, scale = $scale:literal)? $(, unit = $unit:literal)?;)*
    }) => {
        $(
            pub static $name: Register = Register {
                name: stringify!($name),
                unit: catalog!(@unit $($unit)?),
                access: Access::$access,
                spec: RegisterSpec::new(
                    $address,
                    catalog!(@words $($words)?),
                    catalog!(@scale $($scale)?),
                    DataType::$ty,
                ),
            };
        )*
        pub static $table: &[&Register] = &[$(&$name),*];
    };
}

catalog!(READ_REGISTERS: ReadOnly {
    TIME = 0x4000: Timestamp x 4;
    MPV_MODE = 0x4004: UInt16;
    BOARD_FAULT_MSG = 0x4005: UInt32 x 2;
    MASTER_FAULT_MSG = 0x4007: UInt32 x 2;
    MASTER_FAULT_MSG2 = 0x4009: UInt32 x 2;
    ERROR_COUNT = 0x400F: UInt16;
    SINK_TEMP = 0x4010: Int16, scale = 0.1, unit = "°C";
    AMBIENT_TEMP = 0x4011: Int16, scale = 0.1, unit = "°C";
    BATTERY_STATUS = 0x4027: UInt16;
    GRID_VOLTAGE = 0x4031: UInt16, scale = 0.1, unit = "V";
    GRID_CURRENT = 0x4032: Int16, scale = 0.01, unit = "A";
    GRID_FREQUENCY = 0x4033: UInt16, scale = 0.01, unit = "Hz";
    GRID_POWER = 0x4035: Int16, unit = "W";
    BATTERY_VOLTAGE = 0x4069: UInt16, scale = 0.1, unit = "V";
    BATTERY_CURRENT = 0x406A: Int16, scale = 0.01, unit = "A";
    BATTERY_POWER = 0x406D: Int16, unit = "W";
    BATTERY_TEMP = 0x406E: Int16, scale = 0.1, unit = "°C";
    BATTERY_SOC = 0x406F: UInt16, scale = 0.01, unit = "%";
    PV1_POWER = 0x4073: UInt16, unit = "W";
    PV2_POWER = 0x4076: UInt16, unit = "W";
    METER_A_POWER = 0xA03F: Int16, unit = "W";
});

catalog!(READ_WRITE_REGISTERS: ReadWrite {
    CHARGE_TIME_ENABLE = 0x3604: UInt16;
    DISCHARGE_TIME_ENABLE = 0x3605: UInt16;
    FIRST_CHARGE_START_TIME = 0x3606: Hex;
    FIRST_CHARGE_END_TIME = 0x3607: Hex;
    FIRST_CHARGE_POWER_TIME = 0x3608: Hex;
    FIRST_DISCHARGE_START_TIME = 0x361B: Hex;
    FIRST_DISCHARGE_END_TIME = 0x361C: Hex;
    FIRST_DISCHARGE_POWER_TIME = 0x361D: Hex;
    PASSIVE_CHARGE_ENABLE = 0x3636: UInt16;
    PASSIVE_GRID_CHARGE_POWER = 0x3637: UInt16, scale = 0.001, unit = "pu";
    PASSIVE_GRID_DISCHARGE_POWER = 0x3638: UInt16, scale = 0.001, unit = "pu";
    PASSIVE_BAT_CHARGE_POWER = 0x3639: UInt16, scale = 0.001, unit = "pu";
    PASSIVE_BAT_DISCHARGE_POWER = 0x363A: UInt16, scale = 0.001, unit = "pu";
    APP_MODE = 0x3647: UInt16;
});

/// Every register together with its index.
///
/// Read-only registers are numbered first, read/write registers continue where they end.
pub fn all_registers() -> impl Iterator<Item = (usize, &'static Register)> {
    READ_REGISTERS.iter().chain(READ_WRITE_REGISTERS.iter()).copied().enumerate()
}

#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    #[error("register index {0} is out of range (there are {1} registers)")]
    IndexOutOfRange(usize, usize),
    #[error("there is no register named `{0}`")]
    UnknownName(String),
    #[error("register `{0}` is read-only")]
    ReadOnly(&'static str),
}

/// A register selected on the command line, either by its index or by its name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterRef {
    Index(usize),
    Name(String),
}

impl FromStr for RegisterRef {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<usize>() {
            Ok(index) => RegisterRef::Index(index),
            Err(_) => RegisterRef::Name(s.to_string()),
        })
    }
}

impl RegisterRef {
    pub fn resolve(&self) -> Result<&'static Register, LookupError> {
        match self {
            RegisterRef::Index(index) => {
                let total = READ_REGISTERS.len() + READ_WRITE_REGISTERS.len();
                all_registers()
                    .nth(*index)
                    .map(|(_, register)| register)
                    .ok_or(LookupError::IndexOutOfRange(*index, total))
            }
            RegisterRef::Name(name) => all_registers()
                .map(|(_, register)| register)
                .find(|register| register.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| LookupError::UnknownName(name.clone())),
        }
    }

    pub fn resolve_writable(&self) -> Result<&'static Register, LookupError> {
        let register = self.resolve()?;
        match register.access {
            Access::ReadWrite => Ok(register),
            Access::ReadOnly => Err(LookupError::ReadOnly(register.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(data_type: DataType, words: u16, scale: f64) -> RegisterSpec {
        RegisterSpec::new(0x4000, words, scale, data_type)
    }

    #[test]
    fn combines_words_most_significant_first() {
        let value = spec(DataType::UInt32, 2, 1.0).decode(&[0x0001, 0x0002]);
        assert_eq!(value, Value::Unsigned { raw: 0x0001_0002, scale: 1.0 });
    }

    #[test]
    fn signed_types_reinterpret_at_declared_width() {
        assert_eq!(
            spec(DataType::Int16, 1, 1.0).decode(&[0xFF38]).as_f64(),
            Some(-200.0)
        );
        // Only the low word takes part in an Int16 read over two words.
        assert_eq!(
            spec(DataType::Int16, 2, 1.0).decode(&[0x1234, 0xFFFF]),
            Value::Signed { raw: -1, scale: 1.0 }
        );
        assert_eq!(
            spec(DataType::Int32, 2, 1.0).decode(&[0xFFFF, 0xFFFE]),
            Value::Signed { raw: -2, scale: 1.0 }
        );
    }

    #[test]
    fn scale_applies_after_sign() {
        let value = spec(DataType::Int16, 1, 0.01).decode(&[0xFF9C]);
        assert_eq!(value.as_f64(), Some(-1.0));
        assert_eq!(value.to_string(), "-1.00");
        // zero means unscaled
        assert_eq!(spec(DataType::UInt16, 1, 0.0).decode(&[42]).as_f64(), Some(42.0));
    }

    #[test]
    fn hex_is_not_scaled() {
        let value = spec(DataType::Hex, 1, 0.1).decode(&[0x0A1E]);
        assert_eq!(value, Value::Hex(0x0A1E));
        assert_eq!(value.to_string(), "0xa1e");
    }

    #[test]
    fn timestamp_decodes_byte_stream() {
        let value = spec(DataType::Timestamp, 4, 0.1).decode(&[0x07E5, 0x0615, 0x0A1E, 0x2D00]);
        let expected = jiff::civil::date(2021, 6, 21).at(10, 30, 45, 0);
        assert_eq!(value, Value::Timestamp(expected));
    }

    #[test]
    fn invalid_timestamp_degrades_to_sentinel() {
        // hour 0x1E = 30
        let value = spec(DataType::Timestamp, 3, 1.0).decode(&[0x07E5, 0x0615, 0x1E00]);
        assert!(matches!(value, Value::Invalid(DecodeError::ShortTimestamp { .. })));

        let value = spec(DataType::Timestamp, 4, 1.0).decode(&[0x07E5, 0x0615, 0x1E00, 0x0000]);
        let Value::Invalid(DecodeError::InvalidTimestamp { bytes, .. }) = value else {
            panic!("expected an invalid timestamp, got {value:?}");
        };
        assert_eq!(bytes, [0x07, 0xE5, 0x06, 0x15, 0x1E, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn wrong_word_count_is_invalid() {
        let value = spec(DataType::UInt32, 2, 1.0).decode(&[1]);
        assert_eq!(value, Value::Invalid(DecodeError::WordCount { expected: 2, got: 1 }));
        assert!(!value.is_valid());
    }

    #[test]
    fn encode_truncates_without_clamping() {
        let percent = spec(DataType::UInt16, 1, 0.1);
        assert_eq!(percent.encode(12.39), 123);
        assert_eq!(percent.encode(100_000.0), 1_000_000);
        assert_eq!(percent.to_word(1_000_000), None);
        let signed = spec(DataType::Int16, 1, 1.0);
        assert_eq!(signed.to_word(signed.encode(-200.0)), Some(0xFF38));
        assert_eq!(spec(DataType::Hex, 1, 0.1).encode(2590.0), 2590);
    }

    #[test]
    fn decode_encode_round_trip() {
        for (spec, raw) in [
            (spec(DataType::UInt16, 1, 0.1), 4321u16),
            (spec(DataType::Int16, 1, 0.01), 0xFF9C),
            (spec(DataType::UInt16, 1, 1.0), 65535),
        ] {
            let physical = spec.decode(&[raw]).as_f64().unwrap();
            let word = spec.to_word(spec.encode(physical)).unwrap();
            let again = spec.decode(&[word]).as_f64().unwrap();
            assert!((again - physical).abs() <= spec.factor(), "{physical} vs {again}");
        }
        let hex = spec(DataType::Hex, 1, 1.0);
        let value = hex.decode(&[0x1234]).as_f64().unwrap();
        assert_eq!(hex.to_word(hex.encode(value)), Some(0x1234));
    }

    #[test]
    fn indices_number_read_registers_first() {
        let read_count = READ_REGISTERS.len();
        let first_rw = RegisterRef::Index(read_count).resolve().unwrap();
        assert!(std::ptr::eq(first_rw, READ_WRITE_REGISTERS[0]));
        assert!(RegisterRef::Index(0).resolve_writable().is_err());
        assert!(matches!(
            RegisterRef::Index(read_count + READ_WRITE_REGISTERS.len()).resolve(),
            Err(LookupError::IndexOutOfRange(..))
        ));
    }

    #[test]
    fn names_resolve_case_insensitively() {
        let reference = "app_mode".parse::<RegisterRef>().unwrap();
        assert!(std::ptr::eq(reference.resolve_writable().unwrap(), &APP_MODE));
        assert_eq!("12".parse::<RegisterRef>().unwrap(), RegisterRef::Index(12));
        assert!(matches!(
            RegisterRef::Name("BATTERY_POWER".into()).resolve_writable(),
            Err(LookupError::ReadOnly("BATTERY_POWER"))
        ));
    }

    #[test]
    fn addresses_are_unique() {
        let mut addresses = all_registers().map(|(_, r)| r.spec.address).collect::<Vec<_>>();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), READ_REGISTERS.len() + READ_WRITE_REGISTERS.len());
    }
}
