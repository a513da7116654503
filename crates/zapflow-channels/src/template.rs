//! `{{key}}` placeholder substitution for message bodies.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid placeholder regex"))
}

/// Substitute `{{key}}` (whitespace inside the braces allowed) with values
/// from `variables`. Unknown keys are left verbatim.
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_substitutes_known_keys() {
        let out = render_template("Olá {{name}}, seu pedido {{ order }} saiu!", &vars(&[("name", "Ana"), ("order", "#42")]));
        assert_eq!(out, "Olá Ana, seu pedido #42 saiu!");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let out = render_template("Hi {{name}}, code {{coupon}}", &vars(&[("name", "Bo")]));
        assert_eq!(out, "Hi Bo, code {{coupon}}");
    }

    #[test]
    fn test_repeated_and_adjacent() {
        let out = render_template("{{a}}{{a}}{{b}}", &vars(&[("a", "x"), ("b", "y")]));
        assert_eq!(out, "xxy");
    }

    #[test]
    fn test_no_placeholders() {
        assert_eq!(render_template("plain text", &HashMap::new()), "plain text");
    }
}
