//! Server-side custom elements: a registry of renderers plus response
//! middleware that expands `<bk-*>` tags in outgoing HTML.
//!
//! Handlers write plain HTML containing custom elements; the expander
//! buffers the response and, for `200 text/html` responses only, replaces
//! each registered element with its renderer's output. Anything else --
//! JSON, errors, redirects, streams of other content types -- passes
//! through byte-identical.
//!
//! # Example
//!
//! ```rust,ignore
//! use buffkit::components::ComponentRegistry;
//!
//! let registry = ComponentRegistry::new("bk-");
//! registry.register("bk-button", |attrs, slots| {
//!     let variant = attrs.get("variant").map(String::as_str).unwrap_or("primary");
//!     let label = slots.get("default").map(String::as_str).unwrap_or("");
//!     Ok(format!("<button class=\"btn btn-{variant}\">{label}</button>"))
//! })?;
//! ```
//!
//! Expansion is single-pass: a renderer that emits further custom tags does
//! not get those expanded in the same response. This keeps the cost of a
//! pass proportional to the DOM and rules out unbounded recursion.

mod defaults;
mod expander;
mod registry;
mod rewrite;

pub use defaults::register_defaults;
pub use expander::{expand_middleware, expand_response};
pub use registry::{AttrMap, ComponentRegistry, Renderer, SlotMap};
pub use rewrite::rewrite_html;

/// Minimal HTML attribute/text escaping for renderer output.
#[must_use]
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
