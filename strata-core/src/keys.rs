//! Canonical cache-key derivation
//!
//! Keys have the shape `{prefix}{namespace}:{identifier}[:{digest}]`. The digest is
//! computed from a canonical rendering of the parameters: map entries are sorted by
//! name at every nesting level before hashing, so the order in which a caller adds
//! parameters never changes the key.

use serde::Serialize;

/// Number of hex characters of the MD5 digest kept in a key.
const DIGEST_LEN: usize = 16;

/// A primitive (or nested) value usable as a cache-key parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    Map(KeyParams),
}

/// Ordered list of named parameters that feed a cache key.
///
/// Inserting a name twice replaces the earlier value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyParams {
    entries: Vec<(String, ParamValue)>,
}

impl KeyParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Build parameters from any serializable value.
    ///
    /// Objects become one parameter per field; any other shape is stored under `value`.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_value(value)?;
        Ok(match ParamValue::from(json) {
            ParamValue::Map(params) => params,
            ParamValue::Null => KeyParams::new(),
            other => KeyParams::new().with("value", other),
        })
    }

    /// Canonical text form: entries sorted by name, recursively.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        write_map(self, &mut out);
        out
    }

    /// Short deterministic digest of the canonical form.
    pub fn digest(&self) -> String {
        let hash = format!("{:x}", md5::compute(self.canonical().as_bytes()));
        hash[..DIGEST_LEN].to_string()
    }
}

fn write_map(params: &KeyParams, out: &mut String) {
    let mut sorted: Vec<&(String, ParamValue)> = params.entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    out.push('{');
    for (i, (name, value)) in sorted.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::Value::String(name.clone()).to_string());
        out.push(':');
        write_value(value, out);
    }
    out.push('}');
}

fn write_value(value: &ParamValue, out: &mut String) {
    match value {
        ParamValue::Null => out.push_str("null"),
        ParamValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        ParamValue::Int(n) => out.push_str(&n.to_string()),
        ParamValue::Float(f) => out.push_str(&format!("{f:?}")),
        ParamValue::Str(s) => out.push_str(&serde_json::Value::String(s.clone()).to_string()),
        ParamValue::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        ParamValue::Map(params) => write_map(params, out),
    }
}

/// Build the full key for `(namespace, identifier, params)`.
pub fn cache_key(
    prefix: &str,
    namespace: &str,
    identifier: &str,
    params: Option<&KeyParams>,
) -> String {
    match params {
        Some(params) if !params.is_empty() => {
            format!("{prefix}{namespace}:{identifier}:{}", params.digest())
        }
        _ => format!("{prefix}{namespace}:{identifier}"),
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ParamValue::Null,
            Value::Bool(b) => ParamValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Int(i),
                None => ParamValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ParamValue::Str(s),
            Value::Array(items) => ParamValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                let mut params = KeyParams::new();
                for (name, value) in map {
                    params.insert(name, ParamValue::from(value));
                }
                ParamValue::Map(params)
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Int(n)
    }
}

impl From<i32> for ParamValue {
    fn from(n: i32) -> Self {
        ParamValue::Int(n.into())
    }
}

impl From<u32> for ParamValue {
    fn from(n: u32) -> Self {
        ParamValue::Int(n.into())
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl From<KeyParams> for ParamValue {
    fn from(params: KeyParams) -> Self {
        ParamValue::Map(params)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(items: Vec<T>) -> Self {
        ParamValue::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_without_params_has_no_digest() {
        assert_eq!(cache_key("strata:", "cards", "42", None), "strata:cards:42");
        let empty = KeyParams::new();
        assert_eq!(
            cache_key("strata:", "cards", "42", Some(&empty)),
            "strata:cards:42"
        );
    }

    #[test]
    fn key_ignores_parameter_order() {
        let a = KeyParams::new().with("a", 1).with("b", 2);
        let b = KeyParams::new().with("b", 2).with("a", 1);

        assert_eq!(
            cache_key("", "cards", "list", Some(&a)),
            cache_key("", "cards", "list", Some(&b))
        );
    }

    #[test]
    fn nested_maps_are_sorted_too() {
        let inner_a = KeyParams::new().with("x", "1").with("y", "2");
        let inner_b = KeyParams::new().with("y", "2").with("x", "1");
        let a = KeyParams::new().with("filter", inner_a).with("page", 1);
        let b = KeyParams::new().with("page", 1).with("filter", inner_b);

        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), r#"{"filter":{"x":"1","y":"2"},"page":1}"#);
    }

    #[test]
    fn different_values_produce_different_digests() {
        let a = KeyParams::new().with("status", "active");
        let b = KeyParams::new().with("status", "frozen");
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), DIGEST_LEN);
    }

    #[test]
    fn insert_replaces_existing_name() {
        let params = KeyParams::new().with("limit", 10).with("limit", 50);
        assert_eq!(params.len(), 1);
        assert_eq!(params.canonical(), r#"{"limit":50}"#);
    }

    #[test]
    fn from_serializable_flattens_objects() {
        let params = KeyParams::from_serializable(&json!({"b": [1, 2], "a": null})).unwrap();
        assert_eq!(params.canonical(), r#"{"a":null,"b":[1,2]}"#);

        let scalar = KeyParams::from_serializable(&"active").unwrap();
        assert_eq!(scalar.canonical(), r#"{"value":"active"}"#);
    }
}
