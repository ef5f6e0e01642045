//! URL templates with `{Path.to.value}` placeholders.
//!
//! Placeholders are resolved against a JSON context, typically
//! `{"Params": .., "Input": .., "Pager": {"page", "skip", "size"}}`.
//! `{{` and `}}` produce literal braces.

use serde_json::Value as JsonValue;

use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Vec<String>),
}

/// A parsed URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    /// Parse a template.
    ///
    /// # Errors
    /// Returns [`HarvestError::Template`] for unbalanced braces or empty
    /// placeholders.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(HarvestError::template(format!(
                                    "unclosed placeholder in {source:?}"
                                )));
                            }
                            Some(c) => name.push(c),
                        }
                    }
                    let path: Vec<String> =
                        name.trim().split('.').map(|p| p.trim().to_string()).collect();
                    if path.iter().any(String::is_empty) {
                        return Err(HarvestError::template(format!(
                            "empty placeholder {{{name}}} in {source:?}"
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(path));
                }
                '}' => {
                    return Err(HarvestError::template(format!(
                        "unmatched '}}' in {source:?}"
                    )));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render against `context`.
    ///
    /// # Errors
    /// Returns [`HarvestError::Template`] when a placeholder resolves to
    /// nothing, to `null`, or to an object or array.
    pub fn render(&self, context: &JsonValue) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(path) => {
                    let value = path
                        .iter()
                        .try_fold(context, |value, key| match value {
                            JsonValue::Object(map) => map.get(key),
                            JsonValue::Array(items) => {
                                key.parse::<usize>().ok().and_then(|i| items.get(i))
                            }
                            _ => None,
                        })
                        .ok_or_else(|| {
                            HarvestError::template(format!(
                                "unknown placeholder {{{}}} in {:?}",
                                path.join("."),
                                self.source
                            ))
                        })?;
                    match value {
                        JsonValue::String(s) => out.push_str(s),
                        JsonValue::Number(n) => out.push_str(&n.to_string()),
                        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => {
                            return Err(HarvestError::template(format!(
                                "placeholder {{{}}} is not a scalar",
                                path.join(".")
                            )));
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}
