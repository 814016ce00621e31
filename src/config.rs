//! Configuration management for scriptvisor.
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{MapAccess, Visitor},
};
use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

use crate::constants::{DEFAULT_CONFIG_FILES, DEFAULT_START_DELAY_SECS};
use crate::error::ConfigError;

/// A named external executable managed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    /// Unique key of the script.
    pub name: String,
    /// Location of the executable or script file.
    pub path: String,
    /// Whether the script is started by the autostart sequence.
    #[serde(default)]
    pub autostart: bool,
    /// TCP port the script's real workload listens on. Only used to find
    /// the process to kill on stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ScriptDefinition {
    /// Creates a definition with autostart off and no port.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            autostart: false,
            port: None,
        }
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Directory the script runs in: the directory containing `path`.
    pub fn working_dir(&self) -> PathBuf {
        match Path::new(&self.path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Checks the fields that every definition must carry.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("script name must not be empty".into());
        }
        if self.path.trim().is_empty() {
            return Err(format!("script '{}' has an empty path", self.name));
        }
        Ok(())
    }
}

/// The supervisor's sole configuration input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Script definitions in file order. This order drives sequencing.
    pub scripts: Vec<ScriptDefinition>,
    /// Pause between consecutive starts of autostart/start-all, in seconds.
    pub global_start_delay_seconds: u64,
    /// Whether the autostart sequence runs when the registry is loaded.
    pub autostart_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scripts: Vec::new(),
            global_start_delay_seconds: DEFAULT_START_DELAY_SECS,
            autostart_enabled: true,
        }
    }
}

impl Config {
    pub fn start_delay(&self) -> Duration {
        Duration::from_secs(self.global_start_delay_seconds)
    }
}

/// On-disk representation of a single script entry.
#[derive(Debug, Deserialize)]
struct ScriptEntry {
    path: String,
    #[serde(default)]
    autostart: bool,
    #[serde(default)]
    port: Option<u16>,
}

/// Script mapping that keeps the order of the document.
#[derive(Debug, Default)]
struct OrderedScripts(Vec<(String, ScriptEntry)>);

impl<'de> Deserialize<'de> for OrderedScripts {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedScriptsVisitor;

        impl<'de> Visitor<'de> for OrderedScriptsVisitor {
            type Value = OrderedScripts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of script names to script entries")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(OrderedScripts::default())
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, entry)) =
                    access.next_entry::<String, ScriptEntry>()?
                {
                    entries.push((name, entry));
                }
                Ok(OrderedScripts(entries))
            }
        }

        deserializer.deserialize_any(OrderedScriptsVisitor)
    }
}

fn default_start_delay() -> u64 {
    DEFAULT_START_DELAY_SECS
}

fn default_autostart_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    scripts: OrderedScripts,
    #[serde(default = "default_start_delay")]
    global_start_delay_seconds: u64,
    #[serde(default = "default_autostart_enabled")]
    autostart_enabled: bool,
}

/// Parses a configuration document. JSON documents are accepted as well.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }

    let raw: RawConfig = serde_yaml::from_str(content)?;

    let mut seen = HashSet::new();
    let mut scripts = Vec::with_capacity(raw.scripts.0.len());
    for (name, entry) in raw.scripts.0 {
        if !seen.insert(name.clone()) {
            return Err(ConfigError::Invalid(format!(
                "script '{name}' is defined more than once"
            )));
        }

        let definition = ScriptDefinition {
            name,
            path: entry.path,
            autostart: entry.autostart,
            port: entry.port,
        };
        definition.validate().map_err(ConfigError::Invalid)?;
        scripts.push(definition);
    }

    Ok(Config {
        scripts,
        global_start_delay_seconds: raw.global_start_delay_seconds,
        autostart_enabled: raw.autostart_enabled,
    })
}

/// Resolves the configuration path, probing the default file names when none is given.
pub fn resolve_config_path(config_path: Option<&str>) -> PathBuf {
    if let Some(path) = config_path {
        return PathBuf::from(path);
    }

    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]))
}

/// Loads and parses the configuration file.
///
/// A missing file is not an error: the supervisor runs with an empty managed set.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    let config_path = resolve_config_path(config_path);

    if !config_path.exists() {
        warn!(
            "Config file {} not found; running with no scripts",
            config_path.display()
        );
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&config_path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let config = parse_config(&content)?;
    debug!(
        "Loaded {} script(s) from {}",
        config.scripts.len(),
        config_path.display()
    );
    Ok(config)
}
