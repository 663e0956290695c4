//! URL template helpers.
//!
//! Templates use `{name}` placeholders, e.g.
//! `https://shop.example/fr/search?q={query}`.

/// Form-encodes a value for use in a query string (spaces become `+`).
pub fn encode_query(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.trim().as_bytes()).collect()
}

/// Replaces every `{key}` in `template` with its value. Values are inserted
/// verbatim; encode them first where needed.
pub fn fill_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// True if `template` contains the `{key}` placeholder.
pub fn has_placeholder(template: &str, key: &str) -> bool {
    template.contains(&format!("{{{}}}", key))
}
