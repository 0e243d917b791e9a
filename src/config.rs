/*!
 * Replication topology and typed options
 *
 * A topology is a set of contexts. Each context names exactly one source
 * tree and zero or more replica trees, plus options that override the
 * global ones. Everything is resolved into [`Settings`] once, at load time.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::checksum::HashParams;
use crate::core::elapsed::parse_duration;
use crate::error::{MirrorError, Result};
use crate::location::Location;

/// Context ids are assigned 1, 2, 3, ... in declaration order. They are
/// stable for the lifetime of one loaded topology only.
pub type ContextId = u32;

/// Well-known option keys (normalized: lowercase, `_` read as space)
pub mod keys {
    pub const CYCLE: &str = "cycle";
    pub const RESCAN: &str = "rescan";
    pub const LAZY_WRITE: &str = "lazy write";
    pub const BLOCKSIZE: &str = "blocksize";
    pub const NBLOCKS: &str = "nblocks";
    pub const TRANSFER_TIMEOUT: &str = "rsync timeout";
    pub const IGNORE_SUFFIX: &str = "ignore suffix";
    pub const TRANSFER_OPTIONS: &str = "rsync options";
    pub const LOGFILE: &str = "logfile";
    pub const PIDFILE: &str = "pidfile";
    pub const VERBOSE: &str = "verbose";
    pub const NESTED: &str = "options";
}

/// An option value: either a single string or a list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Single(String),
    List(Vec<String>),
}

impl OptionValue {
    /// Legacy-format value: `"a, b, c"` is a list, anything else a string
    pub fn from_text(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.contains(", ") {
            OptionValue::List(
                raw.split(", ")
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        } else {
            OptionValue::Single(raw.to_string())
        }
    }

    fn from_toml(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => OptionValue::Single(s),
            toml::Value::Array(items) => OptionValue::List(
                items
                    .into_iter()
                    .map(|item| match item {
                        toml::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => OptionValue::Single(other.to_string()),
        }
    }

    /// The value as a single string; one-element lists qualify
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Single(s) => Some(s),
            OptionValue::List(items) if items.len() == 1 => Some(&items[0]),
            OptionValue::List(_) => None,
        }
    }

    pub fn to_list(&self) -> Vec<String> {
        match self {
            OptionValue::Single(s) if s.is_empty() => Vec::new(),
            OptionValue::Single(s) => vec![s.clone()],
            OptionValue::List(items) => items.clone(),
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(
            self.as_str().map(|s| s.to_ascii_lowercase()).as_deref(),
            Some("true" | "yes" | "on" | "1")
        )
    }
}

pub type Options = BTreeMap<String, OptionValue>;

/// `"LAZY_WRITE"` and `"lazy write"` name the same option
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('_', " ")
}

/// Options resolved to concrete types for one context (or globally)
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Replication cycle; also the staleness threshold
    pub cycle: Duration,
    /// Scan/publish sub-interval while a transfer is running
    pub rescan_interval: Duration,
    /// Lazy-flush interval of fingerprint stores; zero flushes every mutation
    pub lazy_write: Duration,
    pub hashing: HashParams,
    pub transfer_timeout: Duration,
    /// Name suffixes excluded from scans and transfers (global + context)
    pub exclusions: Vec<String>,
    /// Extra transfer flags, without leading dashes
    pub transfer_flags: Vec<String>,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(24 * 3600),
            rescan_interval: Duration::from_secs(300),
            lazy_write: Duration::from_secs(5),
            hashing: HashParams::default(),
            transfer_timeout: Duration::from_secs(180),
            exclusions: Vec::new(),
            transfer_flags: Vec::new(),
            log_file: default_log_file(),
            pid_file: PathBuf::from("/tmp/orbit-mirror.pid"),
            verbose: false,
        }
    }
}

fn default_log_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".orbit-mirror")
        .join("orbit-mirror.log")
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

impl Settings {
    /// Resolve from option layers; later layers override earlier ones,
    /// except exclusions, which accumulate.
    fn resolve(layers: &[&Options]) -> Result<Self> {
        let mut settings = Settings::default();
        let layered = Layers(layers);

        if let Some(cycle) = layered.duration(keys::CYCLE)? {
            settings.cycle = cycle;
        }
        if let Some(rescan) = layered.duration(keys::RESCAN)? {
            settings.rescan_interval = rescan;
        }
        if let Some(lazy) = layered.duration(keys::LAZY_WRITE)? {
            settings.lazy_write = lazy;
        }
        if let Some(timeout) = layered.duration(keys::TRANSFER_TIMEOUT)? {
            settings.transfer_timeout = timeout;
        }
        if let Some(block_size) = layered.integer(keys::BLOCKSIZE)? {
            settings.hashing.block_size = block_size;
        }
        if let Some(block_count) = layered.integer(keys::NBLOCKS)? {
            settings.hashing.block_count = block_count;
        }
        if let Some(log_file) = layered.text(keys::LOGFILE)? {
            settings.log_file = expand_home(log_file);
        }
        if let Some(pid_file) = layered.text(keys::PIDFILE)? {
            settings.pid_file = expand_home(pid_file);
        }
        if let Some(flags) = layered.lookup(keys::TRANSFER_OPTIONS) {
            settings.transfer_flags = flags.to_list();
        }
        settings.verbose = layered
            .lookup(keys::VERBOSE)
            .map(OptionValue::as_bool)
            .unwrap_or(false);

        for layer in layers {
            if let Some(value) = layer.get(keys::IGNORE_SUFFIX) {
                for suffix in value.to_list() {
                    if !settings.exclusions.contains(&suffix) {
                        settings.exclusions.push(suffix);
                    }
                }
            }
        }

        Ok(settings)
    }

    /// True when the transfer flags ask for deletion of files absent at the source
    pub fn deletes_extraneous(&self) -> bool {
        self.transfer_flags.iter().any(|flag| flag == "delete")
    }
}

/// Option layers, searched last to first
struct Layers<'a>(&'a [&'a Options]);

impl<'a> Layers<'a> {
    fn lookup(&self, key: &str) -> Option<&'a OptionValue> {
        self.0.iter().rev().find_map(|layer| layer.get(key))
    }

    fn text(&self, key: &str) -> Result<Option<&'a str>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| {
                MirrorError::Config(format!("option '{}' expects a single value", key))
            }),
        }
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>> {
        self.text(key)?
            .map(|raw| {
                parse_duration(raw)
                    .map_err(|e| MirrorError::Config(format!("option '{}': {}", key, e)))
            })
            .transpose()
    }

    fn integer(&self, key: &str) -> Result<Option<u64>> {
        self.text(key)?
            .map(|raw| {
                raw.trim().parse::<u64>().map_err(|_| {
                    MirrorError::Config(format!(
                        "option '{}': '{}' is not a non-negative integer",
                        key, raw
                    ))
                })
            })
            .transpose()
    }
}

/// One source tree and its replicas
#[derive(Debug, Clone)]
pub struct Context {
    pub id: ContextId,
    pub source: Location,
    pub replicas: Vec<Location>,
    pub options: Options,
    pub settings: Settings,
}

/// Context as written in a file, before validation
#[derive(Debug, Default, Deserialize)]
struct ContextDraft {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    replicas: Vec<String>,
    #[serde(skip)]
    options: Options,
    #[serde(default, rename = "options")]
    raw_options: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlTopology {
    #[serde(default)]
    options: BTreeMap<String, toml::Value>,
    #[serde(default, rename = "context")]
    contexts: Vec<ContextDraft>,
}

/// Immutable, explicitly constructed replication topology
#[derive(Debug, Clone, Default)]
pub struct Topology {
    options: Options,
    contexts: BTreeMap<ContextId, Context>,
    settings: Settings,
}

impl Topology {
    /// Load from disk; `*.toml` files use the TOML layout, anything else the
    /// line-oriented `key: value` layout
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let topology = if is_toml {
            Self::from_toml_str(&text)?
        } else {
            Self::parse_legacy(&text)?
        };
        debug!(
            "Loaded topology from {} ({} contexts)",
            path.display(),
            topology.contexts.len()
        );
        Ok(topology)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: TomlTopology = toml::from_str(text)?;
        let options = convert_toml_options(parsed.options);
        let drafts = parsed
            .contexts
            .into_iter()
            .map(|mut draft| {
                draft.options = convert_toml_options(std::mem::take(&mut draft.raw_options));
                draft
            })
            .collect();
        Self::assemble(options, drafts)
    }

    /// Line format: `source:` opens a context, `replica:` adds to it, any
    /// other `key: value` is an option of the current context (global before
    /// the first `source:`).
    pub fn parse_legacy(text: &str) -> Result<Self> {
        let mut global = Options::new();
        let mut drafts: Vec<ContextDraft> = Vec::new();

        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(": ") else {
                warn!("Ignoring topology line {}: {}", index + 1, line);
                continue;
            };
            let key = normalize_key(key);
            let value = value.trim();

            match key.as_str() {
                "source" => drafts.push(ContextDraft {
                    source: Some(value.to_string()),
                    ..ContextDraft::default()
                }),
                "replica" => match drafts.last_mut() {
                    Some(draft) => draft.replicas.push(value.to_string()),
                    None => {
                        return Err(MirrorError::Config(format!(
                            "line {}: replica declared before any source",
                            index + 1
                        )))
                    }
                },
                _ => {
                    let scope = match drafts.last_mut() {
                        Some(draft) => &mut draft.options,
                        None => &mut global,
                    };
                    if key == keys::NESTED {
                        apply_nested_options(scope, value);
                    } else {
                        scope.insert(key, OptionValue::from_text(value));
                    }
                }
            }
        }

        Self::assemble(global, drafts)
    }

    fn assemble(options: Options, drafts: Vec<ContextDraft>) -> Result<Self> {
        let settings = Settings::resolve(&[&options])?;
        let mut contexts = BTreeMap::new();

        for (index, draft) in drafts.into_iter().enumerate() {
            let id = index as ContextId + 1;
            let source = draft.source.as_deref().ok_or_else(|| {
                MirrorError::Config(format!("context {} has no source location", id))
            })?;
            let source = Location::parse(source)?;
            let replicas = draft
                .replicas
                .iter()
                .map(|r| Location::parse(r))
                .collect::<Result<Vec<_>>>()?;
            let context_settings = Settings::resolve(&[&options, &draft.options])?;

            contexts.insert(
                id,
                Context {
                    id,
                    source,
                    replicas,
                    options: draft.options,
                    settings: context_settings,
                },
            );
        }

        Ok(Self {
            options,
            contexts,
            settings,
        })
    }

    pub fn contexts(&self) -> impl Iterator<Item = &Context> {
        self.contexts.values()
    }

    pub fn context(&self, id: ContextId) -> Result<&Context> {
        self.contexts.get(&id).ok_or(MirrorError::UnknownContext(id))
    }

    /// Source trees hosted on `host`, by context
    pub fn sources_for_host(&self, host: &str) -> BTreeMap<ContextId, &Location> {
        self.contexts
            .values()
            .filter(|ctx| ctx.source.is_on(host))
            .map(|ctx| (ctx.id, &ctx.source))
            .collect()
    }

    /// Replica trees hosted on `host`, by context (first match per context)
    pub fn replicas_for_host(&self, host: &str) -> BTreeMap<ContextId, &Location> {
        self.contexts
            .values()
            .filter_map(|ctx| {
                ctx.replicas
                    .iter()
                    .find(|replica| replica.is_on(host))
                    .map(|replica| (ctx.id, replica))
            })
            .collect()
    }

    pub fn source_for_context(&self, id: ContextId) -> Result<&Location> {
        Ok(&self.context(id)?.source)
    }

    pub fn replicas_for_context(&self, id: ContextId) -> Result<&[Location]> {
        Ok(&self.context(id)?.replicas)
    }

    pub fn exclusions_for_context(&self, id: ContextId) -> Result<&[String]> {
        Ok(&self.context(id)?.settings.exclusions)
    }

    pub fn options_for_context(&self, id: ContextId) -> Result<&[String]> {
        Ok(&self.context(id)?.settings.transfer_flags)
    }

    /// Raw option lookup; a context value wins over the global one
    pub fn option(&self, context: Option<ContextId>, key: &str) -> Option<&OptionValue> {
        let key = normalize_key(key);
        context
            .and_then(|id| self.contexts.get(&id))
            .and_then(|ctx| ctx.options.get(&key))
            .or_else(|| self.options.get(&key))
    }

    /// Global settings (no context overrides)
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_for_context(&self, id: ContextId) -> Result<&Settings> {
        Ok(&self.context(id)?.settings)
    }
}

fn convert_toml_options(raw: BTreeMap<String, toml::Value>) -> Options {
    raw.into_iter()
        .map(|(key, value)| (normalize_key(&key), OptionValue::from_toml(value)))
        .collect()
}

/// `options: LAZY WRITE: 10, cycle: 12h` holds nested `key: value` pairs
fn apply_nested_options(scope: &mut Options, value: &str) {
    for entry in OptionValue::from_text(value).to_list() {
        match entry.split_once(": ") {
            Some((key, nested)) => {
                scope.insert(normalize_key(key), OptionValue::from_text(nested));
            }
            None => warn!("Ignoring malformed nested option '{}'", entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "\
# global section
ignore suffix: .DS_Store, .localized
logfile: /var/log/mirror.log
options: LAZY_WRITE: 10

source: srchost:/path/to/movies
replica: dsthost1:/mnt/movies
replica: dsthost2:/mnt/movies

source: srchost:/path/to/files
replica: dsthost1:/mnt/files
ignore suffix: streams
rsync options: bwlimit=10m, delete
cycle: 12h

source: otherhost:/srv/more
replica: dsthost1:/mnt/morefiles
";

    #[test]
    fn test_legacy_contexts_numbered_in_order() {
        let topo = Topology::parse_legacy(LEGACY).unwrap();
        let ids: Vec<_> = topo.contexts().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(
            topo.source_for_context(2).unwrap().to_string(),
            "srchost:/path/to/files"
        );
        assert_eq!(topo.replicas_for_context(1).unwrap().len(), 2);
    }

    #[test]
    fn test_host_queries() {
        let topo = Topology::parse_legacy(LEGACY).unwrap();

        let sources = topo.sources_for_host("srchost");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[&2].to_string(), "srchost:/path/to/files");

        let replicas = topo.replicas_for_host("dsthost1");
        assert_eq!(replicas.len(), 3);
        assert_eq!(replicas[&3].to_string(), "dsthost1:/mnt/morefiles");

        assert!(topo.sources_for_host("dsthost2").is_empty());
    }

    #[test]
    fn test_exclusions_accumulate() {
        let topo = Topology::parse_legacy(LEGACY).unwrap();
        assert_eq!(
            topo.exclusions_for_context(1).unwrap(),
            &[".DS_Store".to_string(), ".localized".to_string()]
        );
        let second = topo.exclusions_for_context(2).unwrap();
        assert!(second.contains(&".DS_Store".to_string()));
        assert!(second.contains(&"streams".to_string()));
    }

    #[test]
    fn test_context_overrides_global() {
        let topo = Topology::parse_legacy(LEGACY).unwrap();
        assert_eq!(topo.settings().cycle, Duration::from_secs(86400));
        assert_eq!(
            topo.settings_for_context(2).unwrap().cycle,
            Duration::from_secs(12 * 3600)
        );
        assert_eq!(topo.settings().lazy_write, Duration::from_secs(10));
        assert_eq!(
            topo.options_for_context(2).unwrap(),
            &["bwlimit=10m".to_string(), "delete".to_string()]
        );
        assert!(topo.settings_for_context(2).unwrap().deletes_extraneous());
        assert!(!topo.settings_for_context(1).unwrap().deletes_extraneous());
    }

    #[test]
    fn test_raw_option_lookup() {
        let topo = Topology::parse_legacy(LEGACY).unwrap();
        assert_eq!(
            topo.option(None, "logfile").and_then(|v| v.as_str()),
            Some("/var/log/mirror.log")
        );
        assert_eq!(
            topo.option(Some(2), "CYCLE").and_then(|v| v.as_str()),
            Some("12h")
        );
        // falls back to the global value
        assert_eq!(
            topo.option(Some(1), "logfile").and_then(|v| v.as_str()),
            Some("/var/log/mirror.log")
        );
        assert!(topo.option(Some(1), "randomoption").is_none());
    }

    #[test]
    fn test_replica_before_source_is_fatal() {
        let err = Topology::parse_legacy("replica: h:/x\n").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_toml_layout() {
        let text = r#"
[options]
cycle = "6h"
lazy_write = 0
"ignore suffix" = [".tmp"]

[[context]]
source = "srchost:/data"
replicas = ["dsthost:/backup/data"]

[context.options]
nblocks = 10
blocksize = 4096
"#;
        let topo = Topology::from_toml_str(text).unwrap();
        assert_eq!(topo.settings().cycle, Duration::from_secs(6 * 3600));
        assert_eq!(topo.settings().lazy_write, Duration::ZERO);

        let ctx = topo.context(1).unwrap();
        assert_eq!(ctx.settings.hashing.block_count, 10);
        assert_eq!(ctx.settings.hashing.block_size, 4096);
        assert_eq!(ctx.settings.exclusions, vec![".tmp".to_string()]);
        assert_eq!(ctx.replicas[0].host, "dsthost");
    }

    #[test]
    fn test_toml_context_without_source_is_fatal() {
        let text = "[[context]]\nreplicas = [\"h:/x\"]\n";
        let err = Topology::from_toml_str(text).unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[test]
    fn test_bad_option_value_is_reported() {
        let err = Topology::parse_legacy("cycle: soon\n").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_option_value_helpers() {
        assert_eq!(
            OptionValue::from_text("a, b"),
            OptionValue::List(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(OptionValue::from_text("a,b").as_str(), Some("a,b"));
        assert!(OptionValue::Single("True".to_string()).as_bool());
        assert!(!OptionValue::Single("no".to_string()).as_bool());
        assert_eq!(normalize_key("RSYNC_TIMEOUT"), "rsync timeout");
    }

    #[test]
    fn test_unknown_context() {
        let topo = Topology::parse_legacy(LEGACY).unwrap();
        assert!(matches!(
            topo.context(42),
            Err(MirrorError::UnknownContext(42))
        ));
    }
}
