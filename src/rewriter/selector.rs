//! Minimal CSS selector support for the rewriter: tag, `.class`, `#id`,
//! `[attr]`, `[attr=value]`, and `*`, in any combination.

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    /// (name, required value); `None` means presence only.
    attrs: Vec<(String, Option<String>)>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(anyhow!("empty selector"));
        }
        let mut selector = Selector {
            tag: None,
            id: None,
            classes: Vec::new(),
            attrs: Vec::new(),
        };
        let mut chars = input.chars().peekable();

        // Leading tag name or wildcard.
        if let Some(&c) = chars.peek() {
            if c == '*' {
                chars.next();
            } else if c.is_ascii_alphanumeric() {
                let mut tag = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '-' {
                        tag.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                selector.tag = Some(tag.to_ascii_lowercase());
            }
        }

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    let name = take_name(&mut chars);
                    if name.is_empty() {
                        return Err(anyhow!("invalid class in selector '{input}'"));
                    }
                    selector.classes.push(name);
                }
                '#' => {
                    let name = take_name(&mut chars);
                    if name.is_empty() {
                        return Err(anyhow!("invalid id in selector '{input}'"));
                    }
                    selector.id = Some(name);
                }
                '[' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(anyhow!("unclosed attribute selector in '{input}'"));
                    }
                    match body.split_once('=') {
                        Some((name, value)) => {
                            let value = value.trim().trim_matches('"').trim_matches('\'');
                            selector.attrs.push((
                                name.trim().to_ascii_lowercase(),
                                Some(value.to_string()),
                            ));
                        }
                        None => {
                            selector
                                .attrs
                                .push((body.trim().to_ascii_lowercase(), None));
                        }
                    }
                }
                other => {
                    return Err(anyhow!("unsupported selector syntax '{other}' in '{input}'"));
                }
            }
        }
        Ok(selector)
    }

    /// Test against a start tag's name and attribute list.
    pub fn matches(&self, tag_name: &str, attrs: &[(String, String)]) -> bool {
        if let Some(tag) = &self.tag {
            if !tag.eq_ignore_ascii_case(tag_name) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if attr_value(attrs, "id") != Some(id.as_str()) {
                return false;
            }
        }
        for class in &self.classes {
            let has = attr_value(attrs, "class")
                .map(|list| list.split_ascii_whitespace().any(|c| c == class))
                .unwrap_or(false);
            if !has {
                return false;
            }
        }
        for (name, expected) in &self.attrs {
            match (attr_value(attrs, name), expected) {
                (None, _) => return false,
                (Some(_), None) => {}
                (Some(actual), Some(expected)) => {
                    if actual != expected {
                        return false;
                    }
                }
            }
        }
        true
    }
}

fn attr_value<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn take_name(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn tag_class_id_and_attr() {
        let sel = Selector::parse("div.card#main[data-x=1]").unwrap();
        assert!(sel.matches(
            "div",
            &attrs(&[("class", "card wide"), ("id", "main"), ("data-x", "1")])
        ));
        assert!(!sel.matches(
            "div",
            &attrs(&[("class", "card"), ("id", "other"), ("data-x", "1")])
        ));
        assert!(!sel.matches("span", &attrs(&[("class", "card"), ("id", "main")])));
    }

    #[test]
    fn wildcard_matches_everything() {
        let sel = Selector::parse("*").unwrap();
        assert!(sel.matches("div", &[]));
        assert!(sel.matches("custom-element", &[]));
    }

    #[test]
    fn presence_only_attribute() {
        let sel = Selector::parse("[disabled]").unwrap();
        assert!(sel.matches("input", &attrs(&[("disabled", "")])));
        assert!(!sel.matches("input", &attrs(&[("type", "text")])));
    }

    #[test]
    fn quoted_attribute_values() {
        let sel = Selector::parse("a[href=\"/home\"]").unwrap();
        assert!(sel.matches("a", &attrs(&[("href", "/home")])));
        assert!(!sel.matches("a", &attrs(&[("href", "/away")])));
    }

    #[test]
    fn rejects_unsupported_syntax() {
        assert!(Selector::parse("div > span").is_err());
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("[unclosed").is_err());
    }
}
