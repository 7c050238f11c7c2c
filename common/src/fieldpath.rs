use crate::{Error, Result};
use serde_json::{Map, Value};

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed path such as `$.spec.replicas`, `spec.template.spec.containers[0].image`
/// or `$.data['app.conf']`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<FieldPath> {
        let invalid = |why: &str| Error::InvalidPath(raw.to_string(), why.to_string());
        let mut rest = raw.trim();
        if let Some(r) = rest.strip_prefix('$') {
            rest = r;
            if let Some(r) = rest.strip_prefix('.') {
                rest = r;
            }
        }
        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;
        let mut expect_key = true;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if expect_key {
                        return Err(invalid("empty key"));
                    }
                    expect_key = true;
                    i += 1;
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| invalid("unclosed bracket"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    segments.push(bracket_segment(&inner).ok_or_else(|| invalid("bad bracket"))?);
                    expect_key = false;
                    i = close + 1;
                }
                _ => {
                    if !expect_key {
                        return Err(invalid("missing separator"));
                    }
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    let key: String = chars[start..i].iter().collect();
                    if key == "*" {
                        return Err(invalid("wildcards are not supported"));
                    }
                    segments.push(Segment::Key(key));
                    expect_key = false;
                }
            }
        }
        if segments.is_empty() {
            return Err(invalid("empty path"));
        }
        if expect_key {
            return Err(invalid("trailing separator"));
        }
        Ok(FieldPath {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for seg in &self.segments {
            current = match seg {
                Segment::Key(k) => current.as_object()?.get(k)?,
                Segment::Index(i) => current.as_array()?.get(*i)?,
            };
        }
        Some(current)
    }

    /// Write `new` at the path, creating intermediate objects.
    ///
    /// Array indexes are never created; returns false when the path crosses a
    /// missing element or a scalar.
    pub fn set(&self, value: &mut Value, new: Value) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            return false;
        };
        let mut current = value;
        for seg in parents {
            current = match seg {
                Segment::Key(k) => {
                    if current.is_null() {
                        *current = Value::Object(Map::new());
                    }
                    let Some(obj) = current.as_object_mut() else {
                        return false;
                    };
                    obj.entry(k.clone()).or_insert(Value::Null)
                }
                Segment::Index(i) => match current.as_array_mut().and_then(|a| a.get_mut(*i)) {
                    Some(v) => v,
                    None => return false,
                },
            };
        }
        match last {
            Segment::Key(k) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                match current.as_object_mut() {
                    Some(obj) => {
                        obj.insert(k.clone(), new);
                        true
                    }
                    None => false,
                }
            }
            Segment::Index(i) => match current.as_array_mut().and_then(|a| a.get_mut(*i)) {
                Some(slot) => {
                    *slot = new;
                    true
                }
                None => false,
            },
        }
    }
}

fn bracket_segment(inner: &str) -> Option<Segment> {
    let inner = inner.trim();
    for quote in ['\'', '"'] {
        if let Some(key) = inner.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return Some(Segment::Key(key.to_string()));
        }
    }
    inner.parse::<usize>().ok().map(Segment::Index)
}

/// Copy the live value of every ignored path into the desired object.
///
/// Paths missing from the live object are left as the template rendered them.
pub fn preserve_fields(desired: &mut Value, live: &Value, paths: &[FieldPath]) {
    for path in paths {
        if let Some(v) = path.get(live) {
            if !path.set(desired, v.clone()) {
                tracing::debug!("Could not preserve {} on the desired object", path.as_str());
            }
        }
    }
}

pub fn parse_all(paths: &[String]) -> Result<Vec<FieldPath>> {
    paths.iter().map(|p| FieldPath::parse(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_forms() {
        let p = FieldPath::parse("$.spec.template.spec.containers[0].image").unwrap();
        assert_eq!(p.segments().len(), 6);
        assert_eq!(p.segments()[4], Segment::Index(0));
        let p = FieldPath::parse("data['app.conf']").unwrap();
        assert_eq!(p.segments(), &[Segment::Key("data".into()), Segment::Key("app.conf".into())]);
        let p = FieldPath::parse("$.metadata.annotations[\"a/b\"]").unwrap();
        assert_eq!(p.segments()[2], Segment::Key("a/b".into()));
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        for bad in ["", "$", "spec..replicas", "spec.", "spec[0", "spec[-1]", "spec.*", "spec[0]x"] {
            assert!(FieldPath::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_get_and_set() {
        let mut obj = json!({"spec": {"containers": [{"image": "a"}]}});
        let p = FieldPath::parse("spec.containers[0].image").unwrap();
        assert_eq!(p.get(&obj), Some(&json!("a")));
        assert!(p.set(&mut obj, json!("b")));
        assert_eq!(obj["spec"]["containers"][0]["image"], "b");
        let missing = FieldPath::parse("spec.containers[3].image").unwrap();
        assert!(!missing.set(&mut obj, json!("c")));
        let fresh = FieldPath::parse("$.spec.replicas").unwrap();
        let mut empty = json!({});
        assert!(fresh.set(&mut empty, json!(3)));
        assert_eq!(empty, json!({"spec": {"replicas": 3}}));
    }

    #[test]
    fn test_preserve_fields_copies_live_values() {
        let mut desired = json!({"spec": {"replicas": 1, "paused": false}});
        let live = json!({"spec": {"replicas": 7}});
        let paths = parse_all(&["$.spec.replicas".to_string(), "$.spec.paused".to_string()]).unwrap();
        preserve_fields(&mut desired, &live, &paths);
        assert_eq!(desired, json!({"spec": {"replicas": 7, "paused": false}}));
    }
}
