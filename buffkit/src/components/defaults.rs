//! Built-in component set.
//!
//! A small set of generally useful components registered at wiring time
//! (unless disabled in config). Hosts override any of them by registering
//! the same tag again.

use super::html_escape;
use super::registry::{AttrMap, ComponentRegistry, SlotMap};
use crate::error::Result;

/// Register the built-in components: `bk-button`, `bk-card`, `bk-icon`,
/// and `bk-frame`.
pub fn register_defaults(registry: &ComponentRegistry) -> Result<()> {
    registry.register("bk-button", bk_button)?;
    registry.register("bk-card", bk_card)?;
    registry.register("bk-icon", bk_icon)?;
    registry.register("bk-frame", bk_frame)?;
    Ok(())
}

fn attr<'a>(attrs: &'a AttrMap, name: &str, default: &'a str) -> &'a str {
    attrs.get(name).map(String::as_str).unwrap_or(default)
}

fn slot<'a>(slots: &'a SlotMap, name: &str) -> &'a str {
    slots.get(name).map(String::as_str).unwrap_or("")
}

fn bk_button(attrs: &AttrMap, slots: &SlotMap) -> Result<String> {
    let variant = html_escape(attr(attrs, "variant", "primary"));
    let kind = html_escape(attr(attrs, "type", "button"));
    Ok(format!(
        "<button type=\"{kind}\" class=\"btn btn-{variant}\">{}</button>",
        slot(slots, "default")
    ))
}

fn bk_card(attrs: &AttrMap, slots: &SlotMap) -> Result<String> {
    let class = html_escape(attr(attrs, "class", "card"));
    let title = slot(slots, "title");
    let header = if title.is_empty() {
        String::new()
    } else {
        format!("<header class=\"card-header\">{title}</header>")
    };
    let footer = slot(slots, "footer");
    let footer = if footer.is_empty() {
        String::new()
    } else {
        format!("<footer class=\"card-footer\">{footer}</footer>")
    };
    Ok(format!(
        "<div class=\"{class}\">{header}<div class=\"card-body\">{}</div>{footer}</div>",
        slot(slots, "default")
    ))
}

fn bk_icon(attrs: &AttrMap, _slots: &SlotMap) -> Result<String> {
    let name = html_escape(attr(attrs, "name", "circle"));
    let size = html_escape(attr(attrs, "size", "16"));
    Ok(format!(
        "<svg class=\"icon icon-{name}\" width=\"{size}\" height=\"{size}\" aria-hidden=\"true\"><use href=\"#icon-{name}\"></use></svg>"
    ))
}

/// Server-side include of an SSE-swappable region: the fragment renders
/// its initial content and then follows broadcasts for its event name.
fn bk_frame(attrs: &AttrMap, slots: &SlotMap) -> Result<String> {
    let event = html_escape(attr(attrs, "event", "update"));
    let connect = html_escape(attr(attrs, "connect", "/events"));
    Ok(format!(
        "<div hx-ext=\"sse\" sse-connect=\"{connect}\" sse-swap=\"{event}\">{}</div>",
        slot(slots, "default")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::rewrite_html;

    fn registry() -> ComponentRegistry {
        let registry = ComponentRegistry::new("bk-");
        register_defaults(&registry).unwrap();
        registry
    }

    #[test]
    fn test_defaults_registered() {
        let registry = registry();
        assert_eq!(
            registry.list(),
            vec!["bk-button", "bk-card", "bk-frame", "bk-icon"]
        );
    }

    #[test]
    fn test_button_renders() {
        let out = rewrite_html(
            &registry(),
            "<bk-button variant=\"danger\">Delete</bk-button>",
        )
        .unwrap();
        assert_eq!(
            out,
            "<button type=\"button\" class=\"btn btn-danger\">Delete</button>"
        );
    }

    #[test]
    fn test_card_with_title_slot() {
        let out = rewrite_html(
            &registry(),
            "<bk-card><slot name=\"title\">T</slot>Body</bk-card>",
        )
        .unwrap();
        assert!(out.contains("<header class=\"card-header\">T</header>"));
        assert!(out.contains("<div class=\"card-body\">Body</div>"));
    }

    #[test]
    fn test_frame_wires_sse_swap() {
        let out = rewrite_html(
            &registry(),
            "<bk-frame event=\"ticker\">waiting</bk-frame>",
        )
        .unwrap();
        assert_eq!(
            out,
            "<div hx-ext=\"sse\" sse-connect=\"/events\" sse-swap=\"ticker\">waiting</div>"
        );
    }

    #[test]
    fn test_host_can_override_default() {
        let registry = registry();
        registry
            .register("bk-icon", |_: &AttrMap, _: &SlotMap| Ok("<i></i>".into()))
            .unwrap();
        let out = rewrite_html(&registry, "<bk-icon name=\"x\"></bk-icon>").unwrap();
        assert_eq!(out, "<i></i>");
    }
}
