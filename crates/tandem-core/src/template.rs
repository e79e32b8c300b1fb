//! Deploy-time placeholders.
//!
//! Generated programs refer to values that only exist once a deployment is
//! under way (the deployer, the application id, the escrow address, handler
//! addresses) as `{{Name}}`. The generator never bakes these in; a deployer
//! resolves each program exactly once with a complete set of [`Bindings`].
//!
//! Names are ASCII alphanumerics and `_`. Anything else between braces is
//! left untouched by the scanner and rejected by [`resolve`].

use std::collections::{BTreeMap, BTreeSet};

/// Placeholder resolution failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A placeholder in the program has no binding.
    #[error("unbound placeholder {{{{{0}}}}}")]
    Unbound(String),
    /// `{{` without a well-formed `Name}}`.
    #[error("malformed placeholder at byte {0}")]
    Malformed(usize),
}

/// Values substituted for placeholders, already rendered for the target
/// program syntax (decimal ints, `0x…` byte strings, bare hex for bytecode).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(BTreeMap<String, String>);

impl Bindings {
    /// Empty bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to the already-rendered `text`.
    #[must_use]
    pub fn with(mut self, name: &str, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }

    /// Bind in place.
    pub fn insert(&mut self, name: &str, text: impl Into<String>) {
        self.0.insert(name.to_owned(), text.into());
    }

    /// Rendered text for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Parse a placeholder starting at `at` (which points at `{{`).
/// Returns the name and the index just past `}}`.
fn parse_at(text: &str, at: usize) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    let start = at + 2;
    let mut end = start;
    while end < bytes.len() && is_name_byte(bytes[end]) {
        end += 1;
    }
    if end > start && bytes.get(end..end + 2) == Some(b"}}".as_slice()) {
        Some((&text[start..end], end + 2))
    } else {
        None
    }
}

/// Every well-formed placeholder name in `text`.
#[must_use]
pub fn placeholders(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut i = 0;
    while let Some(off) = text[i..].find("{{") {
        let at = i + off;
        match parse_at(text, at) {
            Some((name, next)) => {
                out.insert(name.to_owned());
                i = next;
            }
            None => i = at + 2,
        }
    }
    out
}

/// Substitute every placeholder in `text`.
///
/// # Errors
/// Fails on any unbound or malformed placeholder; the output never contains `{{`.
pub fn resolve(text: &str, bindings: &Bindings) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while let Some(off) = text[i..].find("{{") {
        let at = i + off;
        out.push_str(&text[i..at]);
        let (name, next) = parse_at(text, at).ok_or(TemplateError::Malformed(at))?;
        let value = bindings
            .get(name)
            .ok_or_else(|| TemplateError::Unbound(name.to_owned()))?;
        out.push_str(value);
        i = next;
    }
    out.push_str(&text[i..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_and_resolve() {
        let text = "int {{ApplicationID}}\nbyte {{ContractAddr}}\nint {{ApplicationID}}";
        let names: Vec<_> = placeholders(text).into_iter().collect();
        assert_eq!(names, vec!["ApplicationID", "ContractAddr"]);

        let b = Bindings::new()
            .with("ApplicationID", "7")
            .with("ContractAddr", "0xab");
        assert_eq!(resolve(text, &b).unwrap(), "int 7\nbyte 0xab\nint 7");
    }

    #[test]
    fn unbound_is_an_error() {
        let err = resolve("7f{{Deployer}}33", &Bindings::new()).unwrap_err();
        assert_eq!(err, TemplateError::Unbound("Deployer".into()));
        assert_eq!(err.to_string(), "unbound placeholder {{Deployer}}");
    }

    #[test]
    fn malformed_is_an_error_but_not_a_placeholder() {
        assert!(placeholders("{{ not a name }}").is_empty());
        assert_eq!(
            resolve("x {{ bad }}", &Bindings::new()),
            Err(TemplateError::Malformed(2))
        );
    }

    #[test]
    fn resolved_text_has_no_placeholders() {
        let b = Bindings::new().with("m1", "0x01");
        let out = resolve("byte {{m1}} // {{m1}}", &b).unwrap();
        assert!(placeholders(&out).is_empty());
        assert!(!out.contains("{{"));
    }
}
