//! UPnP primitive data types (§6.6) and the runtime-typed [`Value`] a [`StateVariable`]
//! holds. The teacher crate encodes variable types at compile time via a generic
//! `SVariable` trait; a control point building devices it has never seen source for
//! cannot do that, so values here are typed at runtime and coerced against the
//! `dataType` declared in the SCPD.
//!
//! [`StateVariable`]: crate::model::StateVariable

use std::fmt::Display;

use base64::{engine::general_purpose::STANDARD, Engine};
use quick_xml::events::{BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::{IntoXml, XmlWriter};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Ui1,
    Ui2,
    Ui4,
    Ui8,
    I1,
    I2,
    I4,
    I8,
    Int,
    R4,
    R8,
    Number,
    Float,
    Fixed14_4,
    Char,
    #[default]
    String,
    Date,
    DateTime,
    DateTimeTz,
    Time,
    TimeTz,
    Boolean,
    BinBase64,
    BinHex,
    Uri,
    Uuid,
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Ui1 => "ui1",
            DataType::Ui2 => "ui2",
            DataType::Ui4 => "ui4",
            DataType::Ui8 => "ui8",
            DataType::I1 => "i1",
            DataType::I2 => "i2",
            DataType::I4 => "i4",
            DataType::I8 => "i8",
            DataType::Int => "int",
            DataType::R4 => "r4",
            DataType::R8 => "r8",
            DataType::Number => "number",
            DataType::Float => "float",
            DataType::Fixed14_4 => "fixed.14.4",
            DataType::Char => "char",
            DataType::String => "string",
            DataType::Date => "date",
            DataType::DateTime => "dateTime",
            DataType::DateTimeTz => "dateTime.tz",
            DataType::Time => "time",
            DataType::TimeTz => "time.tz",
            DataType::Boolean => "boolean",
            DataType::BinBase64 => "bin.base64",
            DataType::BinHex => "bin.hex",
            DataType::Uri => "uri",
            DataType::Uuid => "uuid",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ui1" => DataType::Ui1,
            "ui2" => DataType::Ui2,
            "ui4" => DataType::Ui4,
            "ui8" => DataType::Ui8,
            "i1" => DataType::I1,
            "i2" => DataType::I2,
            "i4" => DataType::I4,
            "i8" => DataType::I8,
            "int" => DataType::Int,
            "r4" => DataType::R4,
            "r8" => DataType::R8,
            "number" => DataType::Number,
            "float" => DataType::Float,
            "fixed.14.4" => DataType::Fixed14_4,
            "char" => DataType::Char,
            "string" => DataType::String,
            "date" => DataType::Date,
            "dateTime" => DataType::DateTime,
            "dateTime.tz" => DataType::DateTimeTz,
            "time" => DataType::Time,
            "time.tz" => DataType::TimeTz,
            "boolean" => DataType::Boolean,
            "bin.base64" => DataType::BinBase64,
            "bin.hex" => DataType::BinHex,
            "uri" => DataType::Uri,
            "uuid" => DataType::Uuid,
            other => anyhow::bail!("unrecognized data type: {other}"),
        })
    }
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Ui1
                | DataType::Ui2
                | DataType::Ui4
                | DataType::Ui8
                | DataType::I1
                | DataType::I2
                | DataType::I4
                | DataType::I8
                | DataType::Int
                | DataType::R4
                | DataType::R8
                | DataType::Number
                | DataType::Float
                | DataType::Fixed14_4
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Ui1
                | DataType::Ui2
                | DataType::Ui4
                | DataType::Ui8
                | DataType::I1
                | DataType::I2
                | DataType::I4
                | DataType::I8
                | DataType::Int
        )
    }

    /// Default step for `<allowedValueRange>` when the description omits it: `1` for
    /// integers, `max/10` (falls back to `1.0`) for reals, per §4.2.
    pub fn default_step(&self, max: f64) -> f64 {
        if self.is_integer() {
            1.0
        } else if max != 0.0 {
            max / 10.0
        } else {
            1.0
        }
    }
}

fn parse_bool(s: &str) -> anyhow::Result<bool> {
    match s {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => anyhow::bail!("unknown boolean value: {other}"),
    }
}

/// A runtime-typed state variable / argument value. Numeric variants carry the widest
/// representation for their family (`i64`/`u64`/`f64`); `coerce` below validates that a
/// literal actually fits the declared width before constructing one.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt(u64, DataType),
    Int(i64, DataType),
    Real(f64, DataType),
    Char(char),
    String(String),
    Boolean(bool),
    BinBase64(Vec<u8>),
    BinHex(Vec<u8>),
    Uri(String),
    Uuid(uuid::Uuid),
    /// date/date-time/time family: stored as the literal from the wire. Full ISO-8601
    /// partial-form parsing is a non-goal here (§1); validation is limited to
    /// non-emptiness.
    Temporal(String, DataType),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::UInt(_, dt) | Value::Int(_, dt) | Value::Real(_, dt) | Value::Temporal(_, dt) => *dt,
            Value::Char(_) => DataType::Char,
            Value::String(_) => DataType::String,
            Value::Boolean(_) => DataType::Boolean,
            Value::BinBase64(_) => DataType::BinBase64,
            Value::BinHex(_) => DataType::BinHex,
            Value::Uri(_) => DataType::Uri,
            Value::Uuid(_) => DataType::Uuid,
        }
    }

    /// Parses `raw` against `data_type`, the coercion §4.4's control handler performs
    /// before invoking an action and the builder performs for `<defaultValue>`.
    pub fn coerce(data_type: DataType, raw: &str) -> anyhow::Result<Self> {
        Ok(match data_type {
            DataType::Ui1 => Value::UInt(raw.parse::<u8>()? as u64, data_type),
            DataType::Ui2 => Value::UInt(raw.parse::<u16>()? as u64, data_type),
            DataType::Ui4 => Value::UInt(raw.parse::<u32>()? as u64, data_type),
            DataType::Ui8 => Value::UInt(raw.parse::<u64>()?, data_type),
            DataType::I1 => Value::Int(raw.parse::<i8>()? as i64, data_type),
            DataType::I2 => Value::Int(raw.parse::<i16>()? as i64, data_type),
            DataType::I4 | DataType::Int => Value::Int(raw.parse::<i32>()? as i64, data_type),
            DataType::I8 => Value::Int(raw.parse::<i64>()?, data_type),
            DataType::R4 | DataType::Float => Value::Real(raw.parse::<f32>()? as f64, data_type),
            DataType::R8 | DataType::Number | DataType::Fixed14_4 => {
                Value::Real(raw.parse::<f64>()?, data_type)
            }
            DataType::Char => {
                let mut chars = raw.chars();
                let c = chars.next().ok_or_else(|| anyhow::anyhow!("empty char value"))?;
                anyhow::ensure!(chars.next().is_none(), "char value longer than one character");
                Value::Char(c)
            }
            DataType::String => Value::String(raw.to_owned()),
            DataType::Boolean => Value::Boolean(parse_bool(raw)?),
            DataType::BinBase64 => Value::BinBase64(STANDARD.decode(raw.trim())?),
            DataType::BinHex => Value::BinHex(hex_decode(raw)?),
            DataType::Uri => Value::Uri(raw.to_owned()),
            DataType::Uuid => Value::Uuid(raw.parse()?),
            DataType::Date
            | DataType::DateTime
            | DataType::DateTimeTz
            | DataType::Time
            | DataType::TimeTz => {
                anyhow::ensure!(!raw.is_empty(), "empty {data_type} value");
                Value::Temporal(raw.to_owned(), data_type)
            }
        })
    }

    pub fn as_text(&self) -> String {
        match self {
            Value::UInt(v, _) => v.to_string(),
            Value::Int(v, _) => v.to_string(),
            Value::Real(v, _) => v.to_string(),
            Value::Char(c) => c.to_string(),
            Value::String(s) => s.clone(),
            Value::Boolean(b) => if *b { "1".to_owned() } else { "0".to_owned() },
            Value::BinBase64(bytes) => STANDARD.encode(bytes),
            Value::BinHex(bytes) => hex_encode(bytes),
            Value::Uri(s) => s.clone(),
            Value::Uuid(u) => u.to_string(),
            Value::Temporal(s, _) => s.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::UInt(v, _) => Some(*v as f64),
            Value::Int(v, _) => Some(*v as f64),
            Value::Real(v, _) => Some(*v),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

impl IntoXml for Value {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::new(&self.as_text())))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(s.len() % 2 == 0, "odd-length hex string");
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_boolean_variants() {
        assert_eq!(Value::coerce(DataType::Boolean, "1").unwrap(), Value::Boolean(true));
        assert_eq!(Value::coerce(DataType::Boolean, "no").unwrap(), Value::Boolean(false));
        assert!(Value::coerce(DataType::Boolean, "maybe").is_err());
    }

    #[test]
    fn rejects_overflow_for_narrow_integers() {
        assert!(Value::coerce(DataType::Ui1, "256").is_err());
        assert_eq!(Value::coerce(DataType::Ui1, "255").unwrap().as_text(), "255");
    }

    #[test]
    fn base64_roundtrips() {
        let bytes = b"hello upnp";
        let encoded = STANDARD.encode(bytes);
        let value = Value::coerce(DataType::BinBase64, &encoded).unwrap();
        assert_eq!(value, Value::BinBase64(bytes.to_vec()));
        assert_eq!(value.as_text(), encoded);
    }

    #[test]
    fn hex_roundtrips() {
        let bytes = [0xde, 0xad, 0xbe, 0xef];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "deadbeef");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }
}
