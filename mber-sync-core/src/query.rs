//! Query-string construction compatible with JavaScript's `encodeURIComponent`.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};

/// Everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )` is escaped.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_uri_component(component: &str) -> String {
    utf8_percent_encode(component, URI_COMPONENT).to_string()
}

/// Render `data` as `?k=v&k2=v2`, or an empty string when nothing survives.
///
/// Arrays are joined with commas before encoding; entries with an empty key
/// or an empty rendered value are skipped.
pub fn to_query(data: &Map<String, Value>) -> String {
    let pairs: Vec<String> = data
        .iter()
        .filter(|(key, _)| !key.is_empty())
        .filter_map(|(key, value)| {
            let rendered = render(value);
            (!rendered.is_empty()).then(|| {
                format!(
                    "{}={}",
                    encode_uri_component(key),
                    encode_uri_component(&rendered)
                )
            })
        })
        .collect();
    if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", pairs.join("&"))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
