use std::path::Path;

use anyhow::anyhow;
use config::{Config, File};
use serde::Deserialize;
use tower_lsp::lsp_types::ClientCapabilities;

/// Debounce delay applied when the configuration does not override it.
pub const DEFAULT_DEBOUNCE_MS: u64 = 400;

#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// Delay between the last edit and revalidation, in milliseconds
    pub debounce_ms: u64,
    /// Report only syntax-class problems (lightweight/early-stage analysis)
    pub syntax_only: bool,
    /// Attach Deprecated/Unnecessary tags to diagnostics; gated on the
    /// client's diagnostic-tag capability
    pub diagnostic_tags: bool,
    /// Revalidate every open buffer on each publish pass, not just the
    /// edited ones (cross-file problems only show up via a fresh full parse)
    pub validate_all_open_buffers: bool,
}

impl Settings {
    pub fn new(root_dir: &Path, capabilities: &ClientCapabilities) -> anyhow::Result<Settings> {
        let expanded = shellexpand::tilde("~/.config/vigil/settings");
        let settings = Config::builder()
            .add_source(File::with_name(&expanded).required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.vigil",
                    root_dir
                        .to_str()
                        .ok_or(anyhow!("Can't convert root_dir to str"))?
                ))
                .required(false),
            )
            .set_default("debounce_ms", DEFAULT_DEBOUNCE_MS)?
            .set_default("syntax_only", false)?
            .set_default("diagnostic_tags", false)?
            .set_default("validate_all_open_buffers", true)?
            .set_override_option(
                "diagnostic_tags",
                capabilities.text_document.as_ref().and_then(|it| {
                    it.publish_diagnostics
                        .as_ref()
                        .and_then(|pd| pd.tag_support.as_ref())
                        .map(|_| true)
                }),
            )?
            .build()
            .map_err(|err| anyhow!("Build err: {err}"))?;

        let settings = settings.try_deserialize::<Settings>()?;

        anyhow::Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            syntax_only: false,
            diagnostic_tags: false,
            validate_all_open_buffers: true,
        }
    }
}
