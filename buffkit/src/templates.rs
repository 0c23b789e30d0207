//! Template sources.
//!
//! Two layers resolve a template name: an optional on-disk directory is
//! checked first, then the read-only set embedded in the binary. Lookup is
//! linear and deterministic, so a host shadows any built-in fragment by
//! dropping a file with the same relative name into its template
//! directory.
//!
//! The framework's own pages (login form, mail preview) are compiled
//! askama templates and live in the modules that render them; this source
//! serves raw fragments -- mail bodies, component partials -- that hosts
//! are expected to replace.

use rust_embed::RustEmbed;
use std::path::PathBuf;

/// Templates compiled into the binary.
#[derive(RustEmbed)]
#[folder = "templates/"]
struct EmbeddedTemplates;

/// Layered template lookup: disk overrides, embedded defaults.
#[derive(Debug, Clone, Default)]
pub struct TemplateSource {
    disk_dir: Option<PathBuf>,
}

impl TemplateSource {
    /// Embedded templates only.
    #[must_use]
    pub fn embedded_only() -> Self {
        Self { disk_dir: None }
    }

    /// Check `dir` before the embedded set.
    #[must_use]
    pub fn with_overrides(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk_dir: Some(dir.into()),
        }
    }

    /// Resolve a template by relative name (e.g. `"mail/welcome.html"`).
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(dir) = &self.disk_dir {
            let path = dir.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                return Some(content);
            }
        }
        EmbeddedTemplates::get(name)
            .map(|file| String::from_utf8_lossy(file.data.as_ref()).into_owned())
    }

    /// Names of every embedded template.
    #[must_use]
    pub fn embedded_names() -> Vec<String> {
        EmbeddedTemplates::iter().map(|name| name.to_string()).collect()
    }
}
