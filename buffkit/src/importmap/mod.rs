//! Import-map management for browser ES modules.
//!
//! Maintains a name-to-URL pin set persisted as JSON, optionally vendors
//! remote modules to local files with subresource-integrity hashes, and
//! renders the `<script type="importmap">` tag (plus `modulepreload`
//! links carrying the integrity values verbatim).
//!
//! There is no bundler anywhere near this: the browser resolves module
//! specifiers through the map.

mod vendor;

pub use vendor::{integrity_hash, vendored_filename};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::config::ImportMapConfig;
use crate::error::{Error, Result};

/// One pinned module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pin {
    /// Remote URL the module was pinned from
    pub url: String,
    /// SRI hash (`sha384-...`), present for vendored pins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Local served path for vendored pins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    #[serde(default)]
    pins: BTreeMap<String, Pin>,
}

/// The pin set plus its persistence and rendering.
pub struct ImportMapManager {
    config: ImportMapConfig,
    pins: Mutex<BTreeMap<String, Pin>>,
}

impl ImportMapManager {
    /// Load the pin file (an absent file is an empty map).
    pub fn load(config: ImportMapConfig) -> Result<Self> {
        let pins = match std::fs::read_to_string(&config.file) {
            Ok(content) => {
                serde_json::from_str::<PinFile>(&content)
                    .map_err(|e| {
                        Error::ImportMap(format!(
                            "failed to parse {}: {e}",
                            config.file.display()
                        ))
                    })?
                    .pins
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Self {
            config,
            pins: Mutex::new(pins),
        })
    }

    fn save(&self, pins: &BTreeMap<String, Pin>) -> Result<()> {
        if let Some(parent) = self.config.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = PinFile { pins: pins.clone() };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::ImportMap(format!("failed to serialize pins: {e}")))?;
        std::fs::write(&self.config.file, json)?;
        Ok(())
    }

    /// Add or replace a pin pointing at a remote URL.
    pub fn pin(&self, name: impl Into<String>, url: impl Into<String>) -> Result<()> {
        let mut pins = self.pins.lock().expect("pin set poisoned");
        pins.insert(
            name.into(),
            Pin {
                url: url.into(),
                integrity: None,
                path: None,
            },
        );
        self.save(&pins)
    }

    /// Add or replace a pin and vendor its content locally.
    pub async fn pin_vendored(
        &self,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<Pin> {
        let name = name.into();
        let url = url.into();
        let pin = self.vendor_one(&name, &url).await?;
        let mut pins = self.pins.lock().expect("pin set poisoned");
        pins.insert(name, pin.clone());
        self.save(&pins)?;
        Ok(pin)
    }

    /// Remove a pin. Returns whether one existed. The vendored file, if
    /// any, is removed best-effort.
    pub fn unpin(&self, name: &str) -> Result<bool> {
        let mut pins = self.pins.lock().expect("pin set poisoned");
        let removed = pins.remove(name);
        if let Some(pin) = &removed {
            self.remove_vendored_file(pin);
        }
        self.save(&pins)?;
        Ok(removed.is_some())
    }

    /// Download every remote (non-vendored) pin.
    pub async fn vendor_all(&self) -> Result<usize> {
        let remote: Vec<(String, String)> = {
            let pins = self.pins.lock().expect("pin set poisoned");
            pins.iter()
                .filter(|(_, pin)| pin.path.is_none())
                .map(|(name, pin)| (name.clone(), pin.url.clone()))
                .collect()
        };
        let mut vendored = 0;
        for (name, url) in remote {
            let pin = self.vendor_one(&name, &url).await?;
            let mut pins = self.pins.lock().expect("pin set poisoned");
            pins.insert(name, pin);
            self.save(&pins)?;
            vendored += 1;
        }
        Ok(vendored)
    }

    /// Re-download every pin, refreshing vendored files and hashes.
    pub async fn update_all(&self) -> Result<usize> {
        let all: Vec<(String, String, Option<Pin>)> = {
            let pins = self.pins.lock().expect("pin set poisoned");
            pins.iter()
                .map(|(name, pin)| (name.clone(), pin.url.clone(), Some(pin.clone())))
                .collect()
        };
        let mut updated = 0;
        for (name, url, old) in all {
            let pin = self.vendor_one(&name, &url).await?;
            if let Some(old) = old {
                if old.path != pin.path {
                    self.remove_vendored_file(&old);
                }
            }
            let mut pins = self.pins.lock().expect("pin set poisoned");
            pins.insert(name, pin);
            self.save(&pins)?;
            updated += 1;
        }
        Ok(updated)
    }

    async fn vendor_one(&self, name: &str, url: &str) -> Result<Pin> {
        let content = vendor::fetch(url).await?;
        let filename = vendored_filename(name, url, &content);
        std::fs::create_dir_all(&self.config.vendor_dir)?;
        let target = self.config.vendor_dir.join(&filename);
        std::fs::write(&target, &content)?;
        tracing::info!(name, file = %target.display(), "module vendored");
        Ok(Pin {
            url: url.to_string(),
            integrity: Some(integrity_hash(&content)),
            path: Some(format!("{}/{}", self.config.vendor_prefix, filename)),
        })
    }

    fn remove_vendored_file(&self, pin: &Pin) {
        let Some(path) = &pin.path else { return };
        let Some(filename) = path.rsplit('/').next() else {
            return;
        };
        let local = self.config.vendor_dir.join(filename);
        if let Err(e) = std::fs::remove_file(&local) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(file = %local.display(), "failed to remove vendored file: {e}");
            }
        }
    }

    /// Current pins, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<(String, Pin)> {
        self.pins
            .lock()
            .expect("pin set poisoned")
            .iter()
            .map(|(name, pin)| (name.clone(), pin.clone()))
            .collect()
    }

    /// Render the import-map script tag plus modulepreload links.
    ///
    /// Vendored pins resolve to their local path; pins with an integrity
    /// hash get a `modulepreload` link carrying it verbatim.
    #[must_use]
    pub fn render_tag(&self) -> String {
        let pins = self.pins.lock().expect("pin set poisoned");

        let imports: BTreeMap<&String, &String> = pins
            .iter()
            .map(|(name, pin)| (name, pin.path.as_ref().unwrap_or(&pin.url)))
            .collect();
        let json = serde_json::to_string(&serde_json::json!({ "imports": imports }))
            .unwrap_or_else(|_| r#"{"imports":{}}"#.to_string());

        let mut out = format!("<script type=\"importmap\">{json}</script>");
        for (_, pin) in pins.iter() {
            if let Some(integrity) = &pin.integrity {
                let href = pin.path.as_ref().unwrap_or(&pin.url);
                out.push_str(&format!(
                    "\n<link rel=\"modulepreload\" integrity=\"{integrity}\" href=\"{href}\">"
                ));
            }
        }
        out
    }
}
