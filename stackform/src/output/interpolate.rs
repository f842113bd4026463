//! `%s` string interpolation over literal and derived values.

use super::{Output, Value};
use crate::errors::TemplateError;
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%[s%]").expect("placeholder pattern is valid"));

/// Substitutes each `%s` in `template` with the matching value.
///
/// `%%` renders a literal percent sign. The result resolves once every value
/// resolves and fails with the first failure among them. Owners and secrecy
/// are inherited from the values.
///
/// # Errors
///
/// Returns [`TemplateError`] when the number of `%s` placeholders differs
/// from the number of values.
pub fn format(template: &str, values: Vec<Value<String>>) -> Result<Output<String>, TemplateError> {
    let segments = split(template);
    let placeholders = segments.len() - 1;
    if placeholders != values.len() {
        return Err(TemplateError {
            template: template.to_string(),
            placeholders,
            arguments: values.len(),
        });
    }

    let outputs = values.into_iter().map(Value::into_output);
    Ok(Output::combine(outputs).map(move |resolved| render(&segments, &resolved)))
}

/// Splits a template into the literal text around each `%s`.
fn split(template: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut last = 0;
    for found in PLACEHOLDER.find_iter(template) {
        current.push_str(&template[last..found.start()]);
        if found.as_str() == "%%" {
            current.push('%');
        } else {
            segments.push(std::mem::take(&mut current));
        }
        last = found.end();
    }
    current.push_str(&template[last..]);
    segments.push(current);
    segments
}

fn render(segments: &[String], values: &[String]) -> String {
    let mut rendered = String::new();
    for (index, segment) in segments.iter().enumerate() {
        rendered.push_str(segment);
        if let Some(value) = values.get(index) {
            rendered.push_str(value);
        }
    }
    rendered
}

/// Builds an interpolated [`Output<String>`](crate::output::Output).
///
/// Each argument converts into a [`Value<String>`](crate::output::Value):
/// string literals, `Output<String>`, or provider fields (`Output<Json>`).
///
/// ```
/// use stackform::interpolate;
/// use stackform::output::Output;
///
/// let host = Output::resolved("abc".to_string());
/// let arn = interpolate!("arn:%s", host).unwrap();
/// assert_eq!(arn.try_get(), Some(Ok("arn:abc".to_string())));
/// ```
#[macro_export]
macro_rules! interpolate {
    ($template:expr $(, $value:expr)* $(,)?) => {
        $crate::output::format(
            $template,
            ::std::vec![$($crate::output::Value::<::std::string::String>::from($value)),*],
        )
    };
}
