//! Hooks that ship with the proxy and can be enabled by name
use clap::ValueEnum;
use std::path::PathBuf;
use tlsplit::RegisteredHook;

pub mod file;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum Plugin {
    /// Append events as JSON lines to --file-path
    File,
}

/// Settings consumed by the built-in plugins
#[derive(Debug, Clone, Default)]
pub struct PluginOptions {
    pub file_path: Option<PathBuf>,
}

impl Plugin {
    pub fn instantiate(self, options: &PluginOptions) -> RegisteredHook {
        match self {
            Self::File => RegisteredHook::observer(file::FileHook::new(options.file_path.clone())),
        }
    }
}

/// Instantiate each named plugin once, in the order given
pub fn load(plugins: &[Plugin], options: &PluginOptions) -> Vec<RegisteredHook> {
    let mut hooks: Vec<RegisteredHook> = vec![];
    let mut seen = vec![];
    for plugin in plugins {
        if seen.contains(plugin) {
            tracing::warn!("plugin {plugin:?} was requested more than once");
            continue;
        }
        seen.push(*plugin);
        hooks.push(plugin.instantiate(options));
    }
    hooks
}
