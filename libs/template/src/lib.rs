//! Placeholder substitution for configuration strings.
//!
//! Replaces `{name}` tokens with values from a lookup. Everything outside a
//! placeholder is copied through unchanged. There is no escaping: a `{`
//! always opens a placeholder and the first following `}` closes it.
//!
//! ```
//! use std::collections::HashMap;
//!
//! let vars = HashMap::from([("NS".to_string(), "prod".to_string())]);
//! let out = cloudmap_template::render("aws-servicediscovery:{NS}:api:80", &vars).unwrap();
//! assert_eq!(out, "aws-servicediscovery:prod:api:80");
//! ```

use std::collections::HashMap;

use thiserror::Error;

/// Template rendering errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder name has no value.
    #[error("unknown placeholder: {0}")]
    UnknownPlaceholder(String),

    /// The template ends inside a placeholder.
    #[error("unclosed placeholder: {0}")]
    Unclosed(String),
}

/// Render `template`, taking placeholder values from a map.
pub fn render(template: &str, values: &HashMap<String, String>) -> Result<String, TemplateError> {
    render_with(template, |name| values.get(name).cloned())
}

/// Render `template`, resolving each placeholder name through `lookup`.
pub fn render_with<F>(template: &str, mut lookup: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    // Byte offset of the currently open `{`, if any.
    let mut open: Option<usize> = None;
    // Start of the literal run not yet copied.
    let mut literal_start = 0;

    for (i, c) in template.char_indices() {
        match open {
            Some(start) if c == '}' => {
                let name = &template[start + 1..i];
                let value =
                    lookup(name).ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
                out.push_str(&value);
                literal_start = i + 1;
                open = None;
            }
            Some(_) => {}
            None if c == '{' => {
                out.push_str(&template[literal_start..i]);
                open = Some(i);
            }
            None => {}
        }
    }

    if let Some(start) = open {
        return Err(TemplateError::Unclosed(template[start..].to_string()));
    }
    out.push_str(&template[literal_start..]);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case("abc", &[], "abc")]
    #[case("{a}bc", &[("a", "A")], "Abc")]
    #[case("a{b}c", &[("b", "B")], "aBc")]
    #[case("ab{c}", &[("c", "C")], "abC")]
    #[case("{a}{b}", &[("a", "x"), ("b", "y")], "xy")]
    #[case("", &[], "")]
    #[case("}abc", &[], "}abc")]
    fn renders_placeholders(
        #[case] template: &str,
        #[case] pairs: &[(&str, &str)],
        #[case] expected: &str,
    ) {
        assert_eq!(render(template, &vars(pairs)).unwrap(), expected);
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = render("x{missing}y", &HashMap::new()).unwrap_err();
        assert_eq!(err, TemplateError::UnknownPlaceholder("missing".to_string()));
    }

    #[test]
    fn unclosed_placeholder_is_an_error() {
        let err = render("abc{def", &vars(&[("def", "x")])).unwrap_err();
        assert_eq!(err, TemplateError::Unclosed("{def".to_string()));
    }

    #[test]
    fn values_are_not_rescanned() {
        let out = render("{a}", &vars(&[("a", "{b}")])).unwrap();
        assert_eq!(out, "{b}");
    }

    #[test]
    fn render_with_uses_closure() {
        let out = render_with("port={PORT}", |name| {
            (name == "PORT").then(|| "8080".to_string())
        })
        .unwrap();
        assert_eq!(out, "port=8080");
    }
}
