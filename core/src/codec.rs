//! URL building, body normalization and cache fingerprints.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::http::RequestBody;
use crate::types::{Body, Headers, Params, RequestDescription};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(.*?)\}").expect("placeholder pattern is valid"));

/// Substitute `{name}` placeholders with percent-encoded path variables.
/// Placeholders without a (non-null) value are left verbatim.
pub fn replace_path_variables(template: &str, vars: &Params) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            match vars.get(&caps[1]).and_then(scalar_to_string) {
                Some(value) => encode_component(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Percent-encode a path or query component. Besides alphanumerics and
/// `-_.~`, the marks `!'()*` stay literal.
pub fn encode_component(text: &str) -> String {
    const MARKS: [(&str, &str); 5] = [("%21", "!"), ("%27", "'"), ("%28", "("), ("%29", ")"), ("%2A", "*")];
    let mut out = urlencoding::encode(text).into_owned();
    if out.contains('%') {
        for (escaped, mark) in MARKS {
            out = out.replace(escaped, mark);
        }
    }
    out
}

/// Build a `?`-prefixed query string. Null values are skipped, arrays expand
/// into repeated `key=value` pairs in order. An empty map yields `"?"`.
pub fn to_query_string(params: &Params) -> String {
    let pairs: Vec<String> = params
        .iter()
        .filter_map(|(key, value)| {
            let key = encode_component(key);
            match value {
                Value::Null => None,
                Value::Array(items) if items.is_empty() => None,
                Value::Array(items) => Some(
                    items
                        .iter()
                        .map(|item| format!("{key}={}", encode_component(&display_value(item))))
                        .collect::<Vec<_>>()
                        .join("&"),
                ),
                other => Some(format!("{key}={}", encode_component(&display_value(other)))),
            }
        })
        .collect();
    format!("?{}", pairs.join("&"))
}

/// Resolve the request path: template substitution plus query string. The
/// query string is omitted entirely when no query map was supplied.
pub fn build_url(template: &str, path_variables: Option<&Params>, query: Option<&Params>) -> String {
    let mut url = match path_variables {
        Some(vars) => replace_path_variables(template, vars),
        None => template.to_string(),
    };
    if let Some(query) = query {
        url.push_str(&to_query_string(query));
    }
    url
}

/// Join with exactly one `/` between base and path.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Deterministic JSON: object keys are sorted at every depth. Missing or
/// falsy input serializes to `"{}"`.
pub fn stable_stringify(value: Option<&Value>) -> String {
    match value {
        None => "{}".to_string(),
        Some(v) if !is_truthy(v) => "{}".to_string(),
        Some(v @ (Value::Object(_) | Value::Array(_))) => sorted(v).to_string(),
        Some(v) => v.to_string(),
    }
}

/// Encode the body for the wire and drop headers that would conflict with it.
pub fn normalize_body(body: Option<&Body>, mut headers: Headers) -> (Option<RequestBody>, Headers) {
    match body {
        Some(Body::Multipart(form)) => {
            headers.remove("Content-Type");
            (Some(RequestBody::Multipart(form.clone())), headers)
        }
        Some(Body::Json(Value::Null)) | None => (None, headers),
        Some(Body::Json(value)) => (Some(RequestBody::Text(value.to_string())), headers),
    }
}

/// Cache key: `{cache_name}={METHOD}{url}` followed by the stable forms of
/// query, path variables and body.
pub fn fingerprint(cache_name: &str, request: &RequestDescription) -> String {
    let query = request.query.clone().map(Value::Object);
    let path_variables = request.path_variables.clone().map(Value::Object);
    let body = match &request.body {
        Some(Body::Json(value)) => stable_stringify(Some(value)),
        Some(Body::Multipart(_)) | None => stable_stringify(None),
    };
    format!(
        "{cache_name}={}{}{}{}{}",
        request.method,
        request.url,
        stable_stringify(query.as_ref()),
        stable_stringify(path_variables.as_ref()),
        body
    )
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(display_value(other)),
    }
}

/// Textual form of a value inside a URL: strings unquoted, arrays
/// comma-joined, objects as JSON.
fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => display_value(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}
