//! HTML rewriting: replace custom elements with rendered output.

use tl::{HTMLTag, Node, Parser, ParserOptions};

use super::registry::{AttrMap, ComponentRegistry, SlotMap};

/// Expand every outermost custom element in `html`.
///
/// Returns `None` when the body needs no rewriting: the prefix literal is
/// absent (fast path, no parser call), the parse yields nothing usable, or
/// no element was actually replaced. Callers then reuse the original bytes
/// untouched.
///
/// Expansion is single-pass. An element whose renderer is missing or
/// returns an error is left in place (custom elements nested beneath it
/// are still visited, matching a depth-first walk). An element that is
/// replaced consumes its children -- they were captured as slots.
#[must_use]
pub fn rewrite_html(registry: &ComponentRegistry, html: &str) -> Option<String> {
    let prefix = registry.prefix();
    let needle = format!("<{prefix}");
    if !html.contains(&needle) {
        return None;
    }

    let dom = match tl::parse(html, ParserOptions::default()) {
        Ok(dom) => dom,
        Err(e) => {
            tracing::warn!("component expansion skipped; HTML parse failed: {e}");
            return None;
        }
    };
    let parser = dom.parser();

    // Candidate spans for every custom element, then a sweep keeps the
    // outermost ones whose renderer succeeds.
    let mut candidates: Vec<(usize, usize, String, &HTMLTag)> = Vec::new();
    for node in dom.nodes() {
        let Some(tag) = node.as_tag() else { continue };
        let name = tag.name().as_utf8_str();
        if !name.starts_with(prefix) {
            continue;
        }
        let (start, _) = tag.boundaries(parser);
        let end = start + tag.raw().as_bytes().len();
        candidates.push((start, end, name.into_owned(), tag));
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    let mut last_end = 0usize;
    for (start, end, name, tag) in candidates {
        if start < last_end {
            // Inside an element that was already replaced; its content was
            // captured as slot HTML.
            continue;
        }

        let attrs = attr_map(tag);
        let slots = slot_map(tag, parser);
        match registry.render(&name, &attrs, &slots) {
            Ok(rendered) => {
                replacements.push((start, end, rendered));
                last_end = end;
            }
            Err(crate::error::Error::NotFound(_)) => {
                tracing::debug!(tag = %name, "no renderer registered; element left unchanged");
            }
            Err(e) => {
                tracing::warn!(tag = %name, "renderer failed; element left unchanged: {e}");
            }
        }
    }

    if replacements.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0usize;
    for (start, end, replacement) in replacements {
        out.push_str(&html[cursor..start]);
        out.push_str(&replacement);
        cursor = end;
    }
    out.push_str(&html[cursor..]);
    Some(out)
}

fn attr_map(tag: &HTMLTag) -> AttrMap {
    let mut attrs = AttrMap::new();
    for (name, value) in tag.attributes().iter() {
        attrs.insert(
            name.into_owned(),
            value.map(|v| v.into_owned()).unwrap_or_default(),
        );
    }
    attrs
}

/// Capture child content: `<slot name="x">` children keyed by name, the
/// rest concatenated under `"default"`.
fn slot_map(tag: &HTMLTag, parser: &Parser) -> SlotMap {
    let mut slots = SlotMap::new();
    let mut default = String::new();

    for handle in tag.children().top().iter() {
        let Some(node) = handle.get(parser) else {
            continue;
        };
        if let Some(child) = node.as_tag() {
            if child.name().as_utf8_str() == "slot" {
                let slot_name = child
                    .attributes()
                    .get("name")
                    .flatten()
                    .map(|v| v.as_utf8_str().into_owned());
                if let Some(slot_name) = slot_name {
                    let inner = inner_html(child, parser);
                    slots
                        .entry(slot_name)
                        .and_modify(|existing| existing.push_str(&inner))
                        .or_insert(inner);
                    continue;
                }
            }
        }
        default.push_str(&node_html(node));
    }

    slots.insert("default".to_string(), default);
    slots
}

fn inner_html(tag: &HTMLTag, parser: &Parser) -> String {
    let mut out = String::new();
    for handle in tag.children().top().iter() {
        if let Some(node) = handle.get(parser) {
            out.push_str(&node_html(node));
        }
    }
    out
}

fn node_html(node: &Node) -> String {
    match node {
        Node::Tag(tag) => tag.raw().as_utf8_str().into_owned(),
        Node::Raw(bytes) | Node::Comment(bytes) => bytes.as_utf8_str().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn button_registry() -> ComponentRegistry {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-button", |attrs: &AttrMap, slots: &SlotMap| {
                let variant = attrs.get("variant").map(String::as_str).unwrap_or("default");
                let label = slots.get("default").map(String::as_str).unwrap_or("");
                Ok(format!("<button class=\"btn btn-{variant}\">{label}</button>"))
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_expands_element_with_attrs_and_default_slot() {
        let registry = button_registry();
        let html = r#"<html><body><bk-button variant="primary">Go</bk-button></body></html>"#;
        let out = rewrite_html(&registry, html).unwrap();
        assert!(out.contains(r#"<button class="btn btn-primary">Go</button>"#));
        assert!(!out.contains("<bk-button"));
        assert!(out.starts_with("<html><body>"));
        assert!(out.ends_with("</body></html>"));
    }

    #[test]
    fn test_named_slots() {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-card", |_attrs: &AttrMap, slots: &SlotMap| {
                Ok(format!(
                    "<div class=\"card\"><header>{}</header><div>{}</div></div>",
                    slots.get("title").map(String::as_str).unwrap_or(""),
                    slots.get("default").map(String::as_str).unwrap_or(""),
                ))
            })
            .unwrap();

        let html = "<bk-card><slot name=\"title\"><b>Hi</b></slot><p>body</p></bk-card>";
        let out = rewrite_html(&registry, html).unwrap();
        assert_eq!(
            out,
            "<div class=\"card\"><header><b>Hi</b></header><div><p>body</p></div></div>"
        );
    }

    #[test]
    fn test_fast_path_without_prefix() {
        let registry = button_registry();
        assert!(rewrite_html(&registry, "<html><body>plain</body></html>").is_none());
        // Body shorter than the prefix literal.
        assert!(rewrite_html(&registry, "<b>").is_none());
    }

    #[test]
    fn test_unregistered_tag_left_unchanged() {
        let registry = button_registry();
        let html = "<p><bk-unknown x=\"1\">keep</bk-unknown></p>";
        assert!(rewrite_html(&registry, html).is_none());
    }

    #[test]
    fn test_renderer_error_leaves_element() {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-broken", |_: &AttrMap, _: &SlotMap| {
                Err(Error::Internal("boom".into()))
            })
            .unwrap();
        let html = "<div><bk-broken>x</bk-broken></div>";
        assert!(rewrite_html(&registry, html).is_none());
    }

    #[test]
    fn test_single_pass_does_not_expand_renderer_output() {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-outer", |_: &AttrMap, _: &SlotMap| {
                Ok("<bk-inner></bk-inner>".to_string())
            })
            .unwrap();
        registry
            .register("bk-inner", |_: &AttrMap, _: &SlotMap| {
                Ok("EXPANDED".to_string())
            })
            .unwrap();

        let out = rewrite_html(&registry, "<bk-outer></bk-outer>").unwrap();
        // The emitted custom tag survives: expansion is one pass.
        assert_eq!(out, "<bk-inner></bk-inner>");
    }

    #[test]
    fn test_nested_custom_tag_consumed_by_parent() {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-list", |_: &AttrMap, slots: &SlotMap| {
                Ok(format!("<ul>{}</ul>", slots.get("default").unwrap()))
            })
            .unwrap();
        registry
            .register("bk-item", |_: &AttrMap, _: &SlotMap| {
                Ok("should-not-run".to_string())
            })
            .unwrap();

        let out =
            rewrite_html(&registry, "<bk-list><bk-item>a</bk-item></bk-list>").unwrap();
        // The nested element is slot content of the replaced parent, passed
        // through verbatim in this pass.
        assert_eq!(out, "<ul><bk-item>a</bk-item></ul>");
    }

    #[test]
    fn test_multiple_elements_in_order() {
        let registry = button_registry();
        let html = r#"<bk-button variant="a">1</bk-button><hr><bk-button variant="b">2</bk-button>"#;
        let out = rewrite_html(&registry, html).unwrap();
        assert_eq!(
            out,
            "<button class=\"btn btn-a\">1</button><hr><button class=\"btn btn-b\">2</button>"
        );
    }

    #[test]
    fn test_attribute_without_value() {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-flag", |attrs: &AttrMap, _: &SlotMap| {
                Ok(if attrs.contains_key("disabled") {
                    "<i>off</i>".to_string()
                } else {
                    "<i>on</i>".to_string()
                })
            })
            .unwrap();
        let out = rewrite_html(&registry, "<bk-flag disabled></bk-flag>").unwrap();
        assert_eq!(out, "<i>off</i>");
    }
}
