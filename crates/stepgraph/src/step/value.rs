//! Typed payloads exchanged between steps
//!
//! Every value routed through a graph carries a runtime type tag alongside
//! its JSON data. Edges and nodes declare type tokens at build time; the
//! engine matches payload tags against those tokens when selecting edges
//! and validating resume values.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Well-known type tags for built-in payload shapes
pub mod tags {
    /// UTF-8 string payload
    pub const STRING: &str = "string";

    /// Signed integer payload
    pub const INTEGER: &str = "integer";

    /// Floating point payload
    pub const FLOAT: &str = "float";

    /// Boolean payload
    pub const BOOLEAN: &str = "boolean";

    /// Absent payload (void-input steps)
    pub const NULL: &str = "null";

    /// Ordered list of typed values (parallel join results)
    pub const LIST: &str = "list";

    /// Untyped JSON object
    pub const OBJECT: &str = "object";

    /// Structured step error payload (try/catch handler input)
    pub const ERROR: &str = "error";

    /// Wildcard: assignable from every other tag
    pub const ANY: &str = "any";
}

/// Error type for payload encoding/decoding
#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    /// The payload's runtime tag did not match the requested type
    #[error("type tag mismatch: expected {expected}, got {actual}")]
    TagMismatch { expected: String, actual: String },

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A payload type with a declared type tag
///
/// Implementing this trait lets a struct flow through the graph with a
/// stable tag the router can match against declared edge tokens.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Selection { choice: String }
///
/// impl Payload for Selection {
///     const TYPE: &'static str = "selection";
/// }
/// ```
pub trait Payload: Serialize + DeserializeOwned {
    /// Type tag used for routing decisions
    const TYPE: &'static str;
}

/// A value with its runtime type tag
///
/// This is the unit of data flow in the engine: trigger inputs, step
/// outputs, suspension prompts and resume values are all `TypedValue`s.
/// The tag survives persistence so type-based routing keeps working after
/// an instance is reloaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypedValue {
    /// Runtime type tag
    pub type_tag: String,

    /// Payload data (JSON)
    pub data: serde_json::Value,
}

impl TypedValue {
    /// Create a value with an explicit tag
    pub fn new(type_tag: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            data,
        }
    }

    /// Encode a [`Payload`] implementor
    pub fn of<P: Payload>(payload: &P) -> Result<Self, ValueError> {
        Ok(Self {
            type_tag: P::TYPE.to_string(),
            data: serde_json::to_value(payload)?,
        })
    }

    /// String payload
    pub fn string(value: impl Into<String>) -> Self {
        Self::new(tags::STRING, serde_json::Value::String(value.into()))
    }

    /// Integer payload
    pub fn integer(value: i64) -> Self {
        Self::new(tags::INTEGER, serde_json::json!(value))
    }

    /// Float payload
    pub fn float(value: f64) -> Self {
        Self::new(tags::FLOAT, serde_json::json!(value))
    }

    /// Boolean payload
    pub fn boolean(value: bool) -> Self {
        Self::new(tags::BOOLEAN, serde_json::Value::Bool(value))
    }

    /// Absent payload
    pub fn null() -> Self {
        Self::new(tags::NULL, serde_json::Value::Null)
    }

    /// Untyped object payload
    pub fn object(data: serde_json::Value) -> Self {
        Self::new(tags::OBJECT, data)
    }

    /// Ordered list of typed values (the shape produced by parallel joins)
    pub fn list(values: Vec<TypedValue>) -> Self {
        let data = serde_json::to_value(&values).unwrap_or(serde_json::Value::Null);
        Self::new(tags::LIST, data)
    }

    /// Decode into a [`Payload`] type, checking the tag first
    pub fn decode<P: Payload>(&self) -> Result<P, ValueError> {
        if self.type_tag != P::TYPE {
            return Err(ValueError::TagMismatch {
                expected: P::TYPE.to_string(),
                actual: self.type_tag.clone(),
            });
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Deserialize the data without a tag check
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Borrow the payload as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        self.data.as_str()
    }

    /// Read the payload as an integer, if it is one
    pub fn as_i64(&self) -> Option<i64> {
        self.data.as_i64()
    }

    /// Read the payload as a boolean, if it is one
    pub fn as_bool(&self) -> Option<bool> {
        self.data.as_bool()
    }

    /// Elements of a list payload, in declared order
    pub fn as_list(&self) -> Option<Vec<TypedValue>> {
        if self.type_tag != tags::LIST {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}
