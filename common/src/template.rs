use crate::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use handlebars::{Handlebars, handlebars_helper};
use handlebars_misc_helpers::new_hbs;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use tracing::*;

/// Flat variables mapping a template is rendered against
pub type Variables = BTreeMap<String, String>;

/// Host part of a url, or the text before the first `:` when it is not a url
pub fn to_host(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(u) if u.host_str().is_some_and(|h| !h.is_empty()) => {
            u.host_str().unwrap_or_default().trim_matches(['[', ']']).to_string()
        }
        _ => match raw.find(':') {
            Some(idx) => raw[..idx].to_string(),
            None => raw.to_string(),
        },
    }
}

pub fn trunc63(s: &str) -> String {
    s.chars().take(63).collect()
}

pub fn sha1sum(s: &str) -> String {
    hex::encode(Sha1::digest(s.as_bytes()))
}

handlebars_helper!(to_host_helper: |arg: str| to_host(arg));
handlebars_helper!(trunc63_helper: |arg: str| trunc63(arg));
handlebars_helper!(sha1sum_helper: |arg: str| sha1sum(arg));
handlebars_helper!(from_json: |arg: str| serde_json::from_str::<Value>(arg).unwrap_or_else(|e| {
    warn!("handlebars::fromJson could not parse its parameter: {e:?}");
    Value::Object(Default::default())
}));
handlebars_helper!(base64_decode: |arg: Value| String::from_utf8(STANDARD.decode(arg.as_str().unwrap_or_else(|| {
    warn!("handlebars::base64_decode received a non-string parameter: {:?}", arg);
    ""
})).unwrap_or_else(|e| {
    warn!("handlebars::base64_decode failed to decode with: {e:?}");
    vec![]
})).unwrap_or_else(|e| {
    warn!("handlebars::base64_decode failed to convert to string with: {e:?}");
    String::new()
}));
handlebars_helper!(base64_encode: |arg: Value| STANDARD.encode(arg.as_str().unwrap_or_else(|| {
    warn!("handlebars::base64_encode received a non-string parameter: {:?}", arg);
    ""
})));
handlebars_helper!(concat: |a: Value, b: Value| format!("{}{}", a.as_str().unwrap_or_else(|| {
    warn!("handlebars::concat received a non-string parameter: {:?}", a);
    ""
}), b.as_str().unwrap_or_else(|| {
    warn!("handlebars::concat received a non-string parameter: {:?}", b);
    ""
})));

/// Build the variables of one hub row
pub fn build_variables(uid: &str, host_or_url: &str, activate: &str, extra: &BTreeMap<String, String>) -> Variables {
    let mut vars = Variables::new();
    vars.insert("uid".to_string(), uid.to_string());
    vars.insert("hostOrUrl".to_string(), host_or_url.to_string());
    vars.insert("host".to_string(), to_host(host_or_url));
    vars.insert("activate".to_string(), activate.to_string());
    for (k, v) in extra {
        vars.insert(k.clone(), v.clone());
    }
    vars
}

/// Renders a template string against flat variables
pub trait Engine: Send + Sync {
    fn render(&self, template: &str, vars: &Variables) -> Result<String>;

    /// Render every value of a map
    fn render_map(&self, map: &BTreeMap<String, String>, vars: &Variables) -> Result<BTreeMap<String, String>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.render(v, vars)?)))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct HandleBars<'a> {
    engine: Handlebars<'a>,
}

impl Default for HandleBars<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleBars<'_> {
    #[must_use]
    pub fn new() -> HandleBars<'static> {
        let mut engine = new_hbs();
        // manifests are not HTML
        engine.register_escape_fn(handlebars::no_escape);
        engine.register_helper("toHost", Box::new(to_host_helper));
        engine.register_helper("trunc63", Box::new(trunc63_helper));
        engine.register_helper("sha1sum", Box::new(sha1sum_helper));
        engine.register_helper("fromJson", Box::new(from_json));
        engine.register_helper("base64_decode", Box::new(base64_decode));
        engine.register_helper("base64_encode", Box::new(base64_encode));
        engine.register_helper("concat", Box::new(concat));
        HandleBars { engine }
    }
}

impl Engine for HandleBars<'_> {
    fn render(&self, template: &str, vars: &Variables) -> Result<String> {
        if template.is_empty() {
            return Ok(String::new());
        }
        Ok(self.engine.render_template(template, vars)?)
    }
}

/// A string of a manifest that failed to render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub template: String,
    pub message: String,
}

/// Render every string of a JSON tree.
///
/// A failing string keeps its original text and is reported back so the caller
/// can decide whether to go on.
pub fn render_value(engine: &dyn Engine, value: &Value, vars: &Variables) -> (Value, Vec<RenderFailure>) {
    let mut failures = Vec::new();
    let rendered = render_inner(engine, value, vars, &mut failures);
    (rendered, failures)
}

fn render_inner(engine: &dyn Engine, value: &Value, vars: &Variables, failures: &mut Vec<RenderFailure>) -> Value {
    match value {
        Value::String(s) if s.contains("{{") => match engine.render(s, vars) {
            Ok(r) => Value::String(r),
            Err(e) => {
                failures.push(RenderFailure {
                    template: s.clone(),
                    message: e.to_string(),
                });
                value.clone()
            }
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_inner(engine, v, vars, failures))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_inner(engine, v, vars, failures)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        let mut extra = BTreeMap::new();
        extra.insert("plan".to_string(), "gold".to_string());
        build_variables("acme", "https://acme.example.com:8443/app", "true", &extra)
    }

    #[test]
    fn test_variables_include_host_and_extras() {
        let v = vars();
        assert_eq!(v["host"], "acme.example.com");
        assert_eq!(v["plan"], "gold");
        assert_eq!(v["hostOrUrl"], "https://acme.example.com:8443/app");
    }

    #[test]
    fn test_to_host_without_scheme() {
        assert_eq!(to_host("db.local:3306"), "db.local");
        assert_eq!(to_host("plain"), "plain");
        assert_eq!(to_host("http://[::1]:80/"), "::1");
    }

    #[test]
    fn test_render_does_not_escape() {
        let hbs = HandleBars::new();
        assert_eq!(hbs.render("{{uid}}-<{{plan}}>&", &vars()).unwrap(), "acme-<gold>&");
        assert_eq!(hbs.render("", &vars()).unwrap(), "");
    }

    #[test]
    fn test_helpers() {
        let hbs = HandleBars::new();
        let long = "x".repeat(80);
        let mut v = vars();
        v.insert("long".to_string(), long);
        assert_eq!(hbs.render("{{trunc63 long}}", &v).unwrap().len(), 63);
        assert_eq!(hbs.render("{{sha1sum uid}}", &v).unwrap(), sha1sum("acme"));
        assert_eq!(hbs.render("{{toHost hostOrUrl}}", &v).unwrap(), "acme.example.com");
        assert_eq!(hbs.render("{{base64_encode uid}}", &v).unwrap(), "YWNtZQ==");
        assert_eq!(hbs.render("{{concat uid plan}}", &v).unwrap(), "acmegold");
    }

    #[test]
    fn test_sha1sum_is_hex() {
        assert_eq!(sha1sum("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_render_map() {
        let hbs = HandleBars::new();
        let mut labels = BTreeMap::new();
        labels.insert("tenant".to_string(), "{{uid}}".to_string());
        let out = hbs.render_map(&labels, &vars()).unwrap();
        assert_eq!(out["tenant"], "acme");
    }

    #[test]
    fn test_render_value_keeps_failing_strings() {
        let hbs = HandleBars::new();
        let spec = json!({
            "data": {"host": "{{host}}", "broken": "{{#if}}", "count": 3},
            "list": ["{{uid}}", true]
        });
        let (out, failures) = render_value(&hbs, &spec, &vars());
        assert_eq!(out["data"]["host"], "acme.example.com");
        assert_eq!(out["data"]["broken"], "{{#if}}");
        assert_eq!(out["data"]["count"], 3);
        assert_eq!(out["list"], json!(["acme", true]));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].template, "{{#if}}");
    }
}
