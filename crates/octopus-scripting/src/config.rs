//! Script filter configuration
//!
//! Settings are plain serde structs loadable from YAML, TOML or JSON. `${VAR}` and
//! `${VAR:-default}` in string values are expanded from the environment after parsing;
//! inline script `code` is left as written. [`FilterConfig`] and
//! [`FilterConfigPerRoute`] are the compiled forms: every script is loaded once and
//! instantiated once per worker.

use crate::error::{Result as ScriptResult, ScriptError};
use crate::runtime::{CompiledScript, ScriptRuntime, ScriptState};
use crate::slot::{SlotAllocator, ThreadLocalSlot};
use crate::stats::FilterStats;
use octopus_core::{ClusterManager, Error, Result, Struct};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// What to do when a script raises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Drop the script for the rest of the stream and let the request through
    #[default]
    Continue,
    /// Answer with a 500 when the request headers have not been passed on yet
    LocalReply,
}

/// Where a script's source comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptSource {
    /// Inline script code
    Inline {
        /// Script code
        code: String,
        /// Optional name for logs
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// File-based script
    File {
        /// Path to script file
        path: PathBuf,
    },
}

impl ScriptSource {
    /// Inline source
    pub fn inline<S: Into<String>>(code: S) -> Self {
        Self::Inline {
            code: code.into(),
            name: None,
        }
    }

    /// Inline source with a name
    pub fn inline_named<S: Into<String>, N: Into<String>>(code: S, name: N) -> Self {
        Self::Inline {
            code: code.into(),
            name: Some(name.into()),
        }
    }

    /// File-based source
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File { path: path.into() }
    }

    /// Read the source code
    pub fn load(&self) -> ScriptResult<String> {
        match self {
            Self::Inline { code, .. } => Ok(code.clone()),
            Self::File { path } => fs::read_to_string(path).map_err(|e| ScriptError::IoError {
                message: format!("Failed to read script file {:?}: {}", path, e),
            }),
        }
    }

    /// Name used in logs and errors
    pub fn name(&self) -> String {
        match self {
            Self::Inline { name, .. } => name.clone().unwrap_or_else(|| "inline".to_string()),
            Self::File { path } => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Filter-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFilterSettings {
    /// Script run when the route names no other
    #[serde(default)]
    pub default_source_code: Option<ScriptSource>,

    /// Scripts routes can refer to by name
    #[serde(default)]
    pub source_codes: HashMap<String, ScriptSource>,

    /// Clear the route cache when a script modifies request headers (default: true)
    #[serde(default = "default_true")]
    pub clear_route_cache: bool,

    /// Prefix of the filter's stat names
    #[serde(default)]
    pub stat_prefix: String,

    /// Handling of script errors
    #[serde(default)]
    pub on_script_error: ErrorPolicy,
}

impl Default for ScriptFilterSettings {
    fn default() -> Self {
        Self {
            default_source_code: None,
            source_codes: HashMap::new(),
            clear_route_cache: true,
            stat_prefix: String::new(),
            on_script_error: ErrorPolicy::default(),
        }
    }
}

impl ScriptFilterSettings {
    /// Settings running `source` for every route
    pub fn with_default(source: ScriptSource) -> Self {
        Self {
            default_source_code: Some(source),
            ..Self::default()
        }
    }

    /// Add a named script
    pub fn with_named(mut self, name: impl Into<String>, source: ScriptSource) -> Self {
        self.source_codes.insert(name.into(), source);
        self
    }
}

/// Route-level override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptPerRouteSettings {
    /// Disable the filter on this route
    #[serde(default)]
    pub disabled: bool,

    /// Run the named script from the filter-level table
    #[serde(default)]
    pub name: Option<String>,

    /// Run this script
    #[serde(default)]
    pub source_code: Option<ScriptSource>,

    /// Table scripts read through `filterContext()`
    #[serde(default)]
    pub filter_context: Struct,
}

impl ScriptPerRouteSettings {
    /// Exactly one of `disabled`, `name` and `source_code` must be set
    pub fn validate(&self) -> Result<()> {
        let set = [
            self.disabled,
            self.name.is_some(),
            self.source_code.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if set != 1 {
            return Err(Error::Config(
                "per-route script config must set exactly one of disabled, name or source_code"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Supported settings file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Config("Unable to detect config format".to_string()))?;

        match ext {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(Error::Config(format!("Unsupported config format: {}", ext))),
        }
    }
}

/// Key holding inline script code, which is never expanded
const SCRIPT_CODE_KEY: &str = "code";

fn placeholder_regex() -> Result<Regex> {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("Invalid regex: {e}")))
}

/// Expand `${VAR}` and `${VAR:-default}`
fn expand_env_vars(re: &Regex, content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        let value = match (env::var(var_name), cap.get(3)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                return Err(Error::Config(format!(
                    "Environment variable '{var_name}' not set and no default provided"
                )));
            }
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);
    Ok(result)
}

/// Expand every string in `value` except inline script code
///
/// A string that is a single placeholder takes the type of what it expands to, so
/// `${FLAG:-false}` can fill a boolean field.
fn expand_value(re: &Regex, value: &mut serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::String(text) => {
            let expanded = expand_env_vars(re, text)?;
            if expanded == *text {
                return Ok(());
            }
            let whole = re.find(text).is_some_and(|m| m.range() == (0..text.len()));
            *value = match serde_json::from_str(&expanded) {
                Ok(typed @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) if whole => {
                    typed
                }
                _ => serde_json::Value::String(expanded),
            };
        }
        serde_json::Value::Array(items) => {
            for item in items {
                expand_value(re, item)?;
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if key == SCRIPT_CODE_KEY && item.is_string() {
                    continue;
                }
                expand_value(re, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Parse settings from a string
pub fn load_from_str<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> Result<T> {
    let mut raw: serde_json::Value = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(content)?,
    };
    expand_value(&placeholder_regex()?, &mut raw)?;

    serde_json::from_value(raw).map_err(|e| Error::Config(format!("Invalid settings: {e}")))
}

/// Parse settings from a file; the format follows the extension
pub fn load_from_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)?;

    load_from_str(&content, ConfigFormat::from_path(path)?)
}

/// A loaded script and its per-worker state
pub struct PerScriptSetup {
    name: String,
    compiled: Arc<dyn CompiledScript>,
    slot: ThreadLocalSlot<Box<dyn ScriptState>>,
}

impl PerScriptSetup {
    /// Load `source` and instantiate it for every worker
    pub fn new(
        source: &ScriptSource,
        runtime: &dyn ScriptRuntime,
        slots: &SlotAllocator,
    ) -> ScriptResult<Self> {
        let name = source.name();
        let code = source.load()?;
        let compiled = runtime.compile(&name, &code)?;
        let slot = slots.allocate_slot(|_| compiled.instantiate());
        debug!(script = %name, workers = slot.len(), "script loaded");
        Ok(Self {
            name,
            compiled,
            slot,
        })
    }

    /// Name the script was loaded under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loaded script
    pub fn compiled(&self) -> &Arc<dyn CompiledScript> {
        &self.compiled
    }

    /// State owned by `worker`
    pub fn state(&self, worker: usize) -> Option<&dyn ScriptState> {
        self.slot.get(worker).map(|state| state.as_ref())
    }

    /// Memory held by every worker's state
    pub fn runtime_bytes_used(&self) -> usize {
        self.slot.iter().map(|state| state.runtime_bytes_used()).sum()
    }
}

impl fmt::Debug for PerScriptSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerScriptSetup")
            .field("name", &self.name)
            .field("workers", &self.slot.len())
            .finish()
    }
}

/// Compiled filter-level configuration
#[derive(Debug)]
pub struct FilterConfig {
    default_script: Option<Arc<PerScriptSetup>>,
    named_scripts: HashMap<String, Arc<PerScriptSetup>>,
    clear_route_cache: bool,
    error_policy: ErrorPolicy,
    cluster_manager: Arc<dyn ClusterManager>,
    stats: Arc<FilterStats>,
}

impl FilterConfig {
    /// Load every script in `settings`
    pub fn new(
        settings: &ScriptFilterSettings,
        runtime: &dyn ScriptRuntime,
        slots: &SlotAllocator,
        cluster_manager: Arc<dyn ClusterManager>,
    ) -> Result<Self> {
        let default_script = settings
            .default_source_code
            .as_ref()
            .map(|source| PerScriptSetup::new(source, runtime, slots).map(Arc::new))
            .transpose()?;

        let mut named_scripts = HashMap::with_capacity(settings.source_codes.len());
        for (name, source) in &settings.source_codes {
            let setup = PerScriptSetup::new(source, runtime, slots)?;
            named_scripts.insert(name.clone(), Arc::new(setup));
        }

        info!(
            default = default_script.is_some(),
            named = named_scripts.len(),
            workers = slots.worker_count(),
            "script filter configured"
        );

        Ok(Self {
            default_script,
            named_scripts,
            clear_route_cache: settings.clear_route_cache,
            error_policy: settings.on_script_error,
            cluster_manager,
            stats: Arc::new(FilterStats::new(&settings.stat_prefix)),
        })
    }

    /// Script run when the route names no other
    pub fn default_script(&self) -> Option<&Arc<PerScriptSetup>> {
        self.default_script.as_ref()
    }

    /// Script registered under `name`
    pub fn named_script(&self, name: &str) -> Option<&Arc<PerScriptSetup>> {
        self.named_scripts.get(name)
    }

    /// Whether header modifications clear the route cache
    pub fn clear_route_cache(&self) -> bool {
        self.clear_route_cache
    }

    /// Script error handling
    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    /// Cluster manager scripts call through
    pub fn cluster_manager(&self) -> &Arc<dyn ClusterManager> {
        &self.cluster_manager
    }

    /// Filter stats
    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    /// Memory held by every loaded script
    pub fn runtime_bytes_used(&self) -> usize {
        self.default_script
            .iter()
            .chain(self.named_scripts.values())
            .map(|setup| setup.runtime_bytes_used())
            .sum()
    }
}

/// Compiled route-level configuration
#[derive(Debug)]
pub struct FilterConfigPerRoute {
    disabled: bool,
    name: Option<String>,
    setup: Option<Arc<PerScriptSetup>>,
    filter_context: Struct,
}

impl FilterConfigPerRoute {
    /// Validate `settings` and load an inline script if there is one
    pub fn new(
        settings: &ScriptPerRouteSettings,
        runtime: &dyn ScriptRuntime,
        slots: &SlotAllocator,
    ) -> Result<Self> {
        settings.validate()?;
        let setup = settings
            .source_code
            .as_ref()
            .map(|source| PerScriptSetup::new(source, runtime, slots).map(Arc::new))
            .transpose()?;

        Ok(Self {
            disabled: settings.disabled,
            name: settings.name.clone(),
            setup,
            filter_context: settings.filter_context.clone(),
        })
    }

    /// Whether the filter is disabled on the route
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Named script the route refers to
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Inline script of the route
    pub fn setup(&self) -> Option<&Arc<PerScriptSetup>> {
        self.setup.as_ref()
    }

    /// Table scripts read through `filterContext()`
    pub fn filter_context(&self) -> &Struct {
        &self.filter_context
    }
}
