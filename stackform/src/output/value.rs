//! Literal-or-derived values used as declaration inputs.

use super::Output;
use crate::errors::OutputError;
use crate::resource::ResourceId;
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};

/// A declaration input field.
pub type Input = Value<Json>;

/// Either a value known at declaration time or one produced by another
/// resource.
#[derive(Debug, Clone)]
pub enum Value<T> {
    /// Known now.
    Literal(T),
    /// Known once its owners are created.
    Derived(Output<T>),
}

impl<T> Value<T>
where
    T: Clone + Send + 'static,
{
    /// Returns true for a literal.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Returns the literal, if this is one.
    #[must_use]
    pub fn as_literal(&self) -> Option<&T> {
        match self {
            Self::Literal(value) => Some(value),
            Self::Derived(_) => None,
        }
    }

    /// Resources this value waits on. Empty for literals.
    #[must_use]
    pub fn owners(&self) -> BTreeSet<ResourceId> {
        match self {
            Self::Literal(_) => BTreeSet::new(),
            Self::Derived(output) => output.owners().clone(),
        }
    }

    /// Returns true if the value is a secret output.
    #[must_use]
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Derived(output) if output.is_secret())
    }

    /// Lifts the value into an output; literals become resolved outputs.
    #[must_use]
    pub fn into_output(self) -> Output<T> {
        match self {
            Self::Literal(value) => Output::resolved(value),
            Self::Derived(output) => output,
        }
    }

    /// Waits for the value.
    pub async fn resolve(&self) -> Result<T, OutputError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Derived(output) => output.get().await,
        }
    }

    /// Transforms the value, keeping literals literal.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Value<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Self::Literal(value) => Value::Literal(f(value)),
            Self::Derived(output) => Value::Derived(output.map(f)),
        }
    }
}

impl Input {
    /// Builds a JSON array input from its elements.
    ///
    /// Stays literal when every element is literal.
    #[must_use]
    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Input>,
    {
        let items: Vec<Input> = items.into_iter().collect();
        if items.iter().all(Value::is_literal) {
            let values = items.into_iter().filter_map(|item| match item {
                Value::Literal(value) => Some(value),
                Value::Derived(_) => None,
            });
            return Value::Literal(Json::Array(values.collect()));
        }

        let outputs = items.into_iter().map(Value::into_output);
        Value::Derived(Output::combine(outputs).map(Json::Array))
    }

    /// Builds a JSON object input from named fields.
    ///
    /// Stays literal when every field is literal.
    #[must_use]
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Input)>,
        K: Into<String>,
    {
        let (keys, values): (Vec<String>, Vec<Input>) =
            fields.into_iter().map(|(k, v)| (k.into(), v)).unzip();

        match Self::list(values) {
            Value::Literal(Json::Array(items)) => Value::Literal(object_from(keys, items)),
            Value::Literal(other) => Value::Literal(other),
            Value::Derived(list) => Value::Derived(list.map(move |items| match items {
                Json::Array(items) => object_from(keys, items),
                other => other,
            })),
        }
    }
}

fn object_from(keys: Vec<String>, items: Vec<Json>) -> Json {
    Json::Object(keys.into_iter().zip(items).collect::<Map<String, Json>>())
}

/// Renders a JSON value the way it appears inside interpolated strings.
///
/// Strings are inserted without quotes; everything else uses its JSON text.
#[must_use]
pub fn json_to_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

impl<T> From<Output<T>> for Value<T> {
    fn from(output: Output<T>) -> Self {
        Self::Derived(output)
    }
}

impl<T> From<&Output<T>> for Value<T> {
    fn from(output: &Output<T>) -> Self {
        Self::Derived(output.clone())
    }
}

impl From<Json> for Input {
    fn from(value: Json) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Literal(Json::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Literal(Json::String(value))
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Self::Literal(Json::Bool(value))
    }
}

impl From<i64> for Input {
    fn from(value: i64) -> Self {
        Self::Literal(Json::from(value))
    }
}

impl From<i32> for Input {
    fn from(value: i32) -> Self {
        Self::Literal(Json::from(value))
    }
}

impl From<Vec<String>> for Input {
    fn from(values: Vec<String>) -> Self {
        Self::Literal(Json::from(values))
    }
}

impl From<BTreeMap<String, String>> for Input {
    fn from(values: BTreeMap<String, String>) -> Self {
        Self::Literal(Json::Object(
            values.into_iter().map(|(k, v)| (k, Json::String(v))).collect(),
        ))
    }
}

impl From<Output<String>> for Input {
    fn from(output: Output<String>) -> Self {
        Self::Derived(output.map(Json::String))
    }
}

impl From<&Output<String>> for Input {
    fn from(output: &Output<String>) -> Self {
        Self::Derived(output.map(Json::String))
    }
}

impl From<&str> for Value<String> {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<String> for Value<String> {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

impl From<Output<Json>> for Value<String> {
    fn from(output: Output<Json>) -> Self {
        Self::Derived(output.map(|value| json_to_string(&value)))
    }
}

impl From<&Output<Json>> for Value<String> {
    fn from(output: &Output<Json>) -> Self {
        Self::Derived(output.map(|value| json_to_string(&value)))
    }
}

impl From<Input> for Value<String> {
    fn from(input: Input) -> Self {
        input.map(|value| json_to_string(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_list_stays_literal() {
        let input = Input::list(vec![Input::from("a"), Input::from(2)]);
        assert_eq!(input.as_literal(), Some(&json!(["a", 2])));
    }

    #[test]
    fn test_object_with_derived_field() {
        let port = Output::<Json>::pending();
        let input = Input::object(vec![("name", Input::from("web")), ("port", Input::from(&port))]);
        assert!(!input.is_literal());

        port.resolve(json!(80)).unwrap();
        let Value::Derived(output) = input else {
            panic!("expected a derived value");
        };
        assert_eq!(output.try_get(), Some(Ok(json!({"name": "web", "port": 80}))));
    }

    #[test]
    fn test_json_to_string_unquotes_strings() {
        assert_eq!(json_to_string(&json!("abc")), "abc");
        assert_eq!(json_to_string(&json!(80)), "80");
        assert_eq!(json_to_string(&Json::Null), "");
    }

    #[tokio::test]
    async fn test_resolve_literal_and_derived() {
        let literal: Value<String> = "x".into();
        assert_eq!(literal.resolve().await, Ok("x".to_string()));

        let derived = Value::Derived(Output::resolved("y".to_string()));
        assert_eq!(derived.resolve().await, Ok("y".to_string()));
    }
}
