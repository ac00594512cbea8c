//! Type-erased, JSON-compatible payload values.
//!
//! [`DynamicValue`] carries payload fields whose shape is not known
//! statically (RPC params, event payloads, session setup extras). Decoding
//! keeps integers and floats apart: `7` decodes to [`DynamicValue::Int`] and
//! `7.0` or `7e0` to [`DynamicValue::Float`], so protocol counters such as
//! sequence numbers never silently widen to floating point.
//!
//! ```
//! use livewire_core::value::{decode, encode, DynamicValue};
//!
//! let v = decode(br#"{"seq": 7, "ratio": 0.5}"#).unwrap();
//! assert_eq!(v.get("seq"), Some(&DynamicValue::Int(7)));
//! assert_eq!(decode(&encode(&v).unwrap()).unwrap(), v);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A string-keyed mapping of dynamic values (params, payloads).
pub type Payload = BTreeMap<String, DynamicValue>;

/// Tagged union over the JSON data model.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DynamicValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<DynamicValue>),
    Object(Payload),
}

impl DynamicValue {
    /// Build a float value, rejecting NaN and infinities which have no JSON
    /// representation.
    pub fn float(value: f64) -> Result<Self> {
        if value.is_finite() {
            Ok(Self::Float(value))
        } else {
            Err(Error::value_encoding(format!(
                "non-finite float {value} cannot be encoded"
            )))
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            DynamicValue::Null => "null",
            DynamicValue::Bool(_) => "bool",
            DynamicValue::Int(_) => "integer",
            DynamicValue::Float(_) => "float",
            DynamicValue::String(_) => "string",
            DynamicValue::Array(_) => "array",
            DynamicValue::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers are converted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynamicValue::Int(n) => Some(*n as f64),
            DynamicValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Payload> {
        match self {
            DynamicValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is an object.
    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.as_object().and_then(|map| map.get(key))
    }
}

// ─────────────────────────────────────────────────────────────────
// Encode / decode
// ─────────────────────────────────────────────────────────────────

/// Serialize a value to JSON bytes.
///
/// Fails with [`Error::ValueEncoding`] when the tree contains a non-finite
/// float.
pub fn encode(value: &DynamicValue) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::value_encoding(e.to_string()))
}

/// Parse JSON bytes into a value.
///
/// Fails with [`Error::MalformedPayload`] on anything that is not valid JSON.
pub fn decode(bytes: &[u8]) -> Result<DynamicValue> {
    serde_json::from_slice(bytes).map_err(|e| Error::malformed(e.to_string()))
}

/// Encode a payload map as a JSON object.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::value_encoding(e.to_string()))
}

impl Serialize for DynamicValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DynamicValue::Null => serializer.serialize_unit(),
            DynamicValue::Bool(b) => serializer.serialize_bool(*b),
            DynamicValue::Int(n) => serializer.serialize_i64(*n),
            DynamicValue::Float(f) => {
                if !f.is_finite() {
                    return Err(ser::Error::custom(format!(
                        "non-finite float {f} cannot be encoded"
                    )));
                }
                serializer.serialize_f64(*f)
            }
            DynamicValue::String(s) => serializer.serialize_str(s),
            DynamicValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            DynamicValue::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
        }
    }
}

struct DynamicValueVisitor;

impl<'de> Visitor<'de> for DynamicValueVisitor {
    type Value = DynamicValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_unit<E>(self) -> std::result::Result<DynamicValue, E> {
        Ok(DynamicValue::Null)
    }

    fn visit_none<E>(self) -> std::result::Result<DynamicValue, E> {
        Ok(DynamicValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<DynamicValue, D::Error> {
        Deserialize::deserialize(deserializer)
    }

    fn visit_bool<E>(self, v: bool) -> std::result::Result<DynamicValue, E> {
        Ok(DynamicValue::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> std::result::Result<DynamicValue, E> {
        Ok(DynamicValue::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> std::result::Result<DynamicValue, E> {
        match i64::try_from(v) {
            Ok(n) => Ok(DynamicValue::Int(n)),
            Err(_) => {
                tracing::debug!("integer {} exceeds i64, decoding as float", v);
                Ok(DynamicValue::Float(v as f64))
            }
        }
    }

    fn visit_f64<E>(self, v: f64) -> std::result::Result<DynamicValue, E> {
        Ok(DynamicValue::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<DynamicValue, E> {
        Ok(DynamicValue::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> std::result::Result<DynamicValue, E> {
        Ok(DynamicValue::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<DynamicValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(DynamicValue::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<DynamicValue, A::Error> {
        let mut out = Payload::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value()?;
            if out.insert(key.clone(), value).is_some() {
                return Err(de::Error::custom(format!("duplicate key '{key}'")));
            }
        }
        Ok(DynamicValue::Object(out))
    }
}

impl<'de> Deserialize<'de> for DynamicValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(DynamicValueVisitor)
    }
}

// ─────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────

impl From<bool> for DynamicValue {
    fn from(v: bool) -> Self {
        DynamicValue::Bool(v)
    }
}

impl From<i32> for DynamicValue {
    fn from(v: i32) -> Self {
        DynamicValue::Int(v.into())
    }
}

impl From<i64> for DynamicValue {
    fn from(v: i64) -> Self {
        DynamicValue::Int(v)
    }
}

impl From<u32> for DynamicValue {
    fn from(v: u32) -> Self {
        DynamicValue::Int(v.into())
    }
}

impl TryFrom<u64> for DynamicValue {
    type Error = Error;

    fn try_from(v: u64) -> Result<Self> {
        i64::try_from(v)
            .map(DynamicValue::Int)
            .map_err(|_| Error::value_encoding(format!("integer {v} exceeds i64")))
    }
}

impl TryFrom<f64> for DynamicValue {
    type Error = Error;

    fn try_from(v: f64) -> Result<Self> {
        DynamicValue::float(v)
    }
}

impl From<&str> for DynamicValue {
    fn from(v: &str) -> Self {
        DynamicValue::String(v.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(v: String) -> Self {
        DynamicValue::String(v)
    }
}

impl From<Vec<DynamicValue>> for DynamicValue {
    fn from(v: Vec<DynamicValue>) -> Self {
        DynamicValue::Array(v)
    }
}

impl From<Payload> for DynamicValue {
    fn from(v: Payload) -> Self {
        DynamicValue::Object(v)
    }
}

impl<T: Into<DynamicValue>> From<Option<T>> for DynamicValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(DynamicValue::Null, Into::into)
    }
}

impl From<serde_json::Value> for DynamicValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => DynamicValue::Null,
            serde_json::Value::Bool(b) => DynamicValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DynamicValue::Int(i)
                } else {
                    // u64 beyond i64 or a float; serde_json numbers are finite.
                    DynamicValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => DynamicValue::String(s),
            serde_json::Value::Array(items) => {
                DynamicValue::Array(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                DynamicValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl TryFrom<&DynamicValue> for serde_json::Value {
    type Error = Error;

    fn try_from(v: &DynamicValue) -> Result<Self> {
        serde_json::to_value(v).map_err(|e| Error::value_encoding(e.to_string()))
    }
}

/// Build a [`Payload`] from `key => value` pairs.
///
/// ```
/// use livewire_core::payload;
///
/// let p = payload! { "text" => "hi", "n" => 3 };
/// assert_eq!(p.len(), 2);
/// ```
#[macro_export]
macro_rules! payload {
    () => { $crate::value::Payload::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::value::Payload::new();
        $( map.insert(($key).to_string(), $crate::value::DynamicValue::from($value)); )+
        map
    }};
}
