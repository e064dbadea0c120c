//! Plugin identity and discovery glue.
//!
//! The host does not manage plugin installation itself; it consults an
//! injected [`PluginResolver`] to turn a `(kind, name, version)` triple into
//! a filesystem path, with explicit project plugins taking precedence. What
//! the host does own is the interpretation of plugin directories: project
//! manifests (`PulumiPlugin.yaml`, `PulumiPolicy.yaml`) and, failing those,
//! runtime inference from well-known project marker files.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use semver::Version;
use serde::Deserialize;

use crate::error::Error;

/// The manifest describing how to run a resource or converter plugin that
/// ships as source rather than a binary.
pub const PLUGIN_MANIFEST: &str = "PulumiPlugin.yaml";

/// The manifest describing a policy pack.
pub const POLICY_MANIFEST: &str = "PulumiPolicy.yaml";

/// The kind of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Resource,
    Analyzer,
    Language,
    Converter,
    Tool,
}

bitflags::bitflags! {
    /// A set of plugin kinds, used to select which members of a plugin set
    /// to actually load.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PluginKinds: u32 {
        const RESOURCE = 1 << 0;
        const ANALYZER = 1 << 1;
        const LANGUAGE = 1 << 2;
        const CONVERTER = 1 << 3;
        const TOOL = 1 << 4;
    }
}

impl PluginKind {
    pub fn flag(self) -> PluginKinds {
        match self {
            PluginKind::Resource => PluginKinds::RESOURCE,
            PluginKind::Analyzer => PluginKinds::ANALYZER,
            PluginKind::Language => PluginKinds::LANGUAGE,
            PluginKind::Converter => PluginKinds::CONVERTER,
            PluginKind::Tool => PluginKinds::TOOL,
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PluginKind::Resource => "resource",
            PluginKind::Analyzer => "analyzer",
            PluginKind::Language => "language",
            PluginKind::Converter => "converter",
            PluginKind::Tool => "tool",
        })
    }
}

impl FromStr for PluginKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource" => Ok(PluginKind::Resource),
            "analyzer" => Ok(PluginKind::Analyzer),
            "language" => Ok(PluginKind::Language),
            "converter" => Ok(PluginKind::Converter),
            "tool" => Ok(PluginKind::Tool),
            other => Err(format!("unknown plugin kind '{other}'")),
        }
    }
}

/// The identity of a plugin: `(kind, name)` is lookup-unique; the version,
/// download URL, and checksums are advisory.
#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub kind: PluginKind,
    pub name: String,
    pub version: Option<Version>,
    pub download_url: Option<String>,
    pub checksums: BTreeMap<String, Vec<u8>>,
}

impl PluginSpec {
    pub fn new(kind: PluginKind, name: impl Into<String>, version: Option<Version>) -> Self {
        PluginSpec {
            kind,
            name: name.into(),
            version,
            download_url: None,
            checksums: BTreeMap::new(),
        }
    }

    /// The conventional file name of the plugin binary.
    pub fn file_name(&self) -> String {
        format!("pulumi-{}-{}", self.kind, self.name)
    }

    fn not_found(&self) -> Error {
        Error::PluginNotFound {
            kind: self.kind,
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

impl fmt::Display for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}-{}-v{}", self.kind, self.name, v),
            None => write!(f, "{}-{}", self.kind, self.name),
        }
    }
}

/// A plugin declared directly by the project, overriding installed
/// discovery.
#[derive(Debug, Clone)]
pub struct ProjectPlugin {
    pub kind: PluginKind,
    pub name: String,
    pub version: Option<Version>,
    /// The directory holding the plugin binary (or its source tree when the
    /// plugin runs through a language runtime).
    pub path: PathBuf,
}

impl ProjectPlugin {
    pub fn matches(&self, kind: PluginKind, name: &str) -> bool {
        self.kind == kind && self.name == name
    }
}

/// The installed-plugin lookup the workspace provides. Opaque to the host.
pub trait PluginResolver: Send + Sync {
    /// Resolve a plugin to the path of its binary. The resolver picks the
    /// newest installed plugin whose version satisfies the request.
    fn resolve(&self, spec: &PluginSpec) -> Result<PathBuf, Error>;
}

/// A resolver over a single directory of installed plugins laid out as
/// `pulumi-<kind>-<name>-v<version>/pulumi-<kind>-<name>`.
#[derive(Debug, Clone)]
pub struct DirResolver {
    root: PathBuf,
}

impl DirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirResolver { root: root.into() }
    }
}

impl PluginResolver for DirResolver {
    fn resolve(&self, spec: &PluginSpec) -> Result<PathBuf, Error> {
        let prefix = format!("{}-v", spec.file_name());
        let mut best: Option<(Version, PathBuf)> = None;
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Err(spec.not_found()),
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(dir_name) = file_name.to_str() else { continue };
            let Some(version_text) = dir_name.strip_prefix(&prefix) else { continue };
            let Ok(version) = Version::parse(version_text) else { continue };
            if let Some(requested) = &spec.version {
                if version < *requested {
                    continue;
                }
            }
            if best.as_ref().is_none_or(|(v, _)| version > *v) {
                best = Some((version, entry.path().join(spec.file_name())));
            }
        }
        best.map(|(_, path)| path).ok_or_else(|| spec.not_found())
    }
}

/// How to execute a source-form plugin: the language runtime that runs it
/// and its runtime options.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeInfo {
    pub name: String,
    pub options: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuntimeField {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        options: BTreeMap<String, serde_json::Value>,
    },
}

impl From<RuntimeField> for RuntimeInfo {
    fn from(field: RuntimeField) -> Self {
        match field {
            RuntimeField::Name(name) => RuntimeInfo {
                name,
                options: BTreeMap::new(),
            },
            RuntimeField::Full { name, options } => RuntimeInfo { name, options },
        }
    }
}

/// The parsed contents of a `PulumiPlugin.yaml` manifest.
#[derive(Debug, Clone)]
pub struct PluginProjectManifest {
    pub runtime: RuntimeInfo,
}

impl PluginProjectManifest {
    /// Load the manifest from a plugin directory. A missing manifest
    /// resolves to `None`; runtime inference takes over from there.
    pub fn load(dir: &Path) -> Result<Option<Self>, Error> {
        let path = dir.join(PLUGIN_MANIFEST);
        if !path.exists() {
            return Ok(None);
        }
        #[derive(Deserialize)]
        struct Raw {
            runtime: RuntimeField,
        }
        let contents = fs::read_to_string(&path)?;
        let raw: Raw = serde_yaml::from_str(&contents).map_err(|e| Error::Launch {
            plugin: dir.display().to_string(),
            reason: format!("failed to parse {PLUGIN_MANIFEST}: {e}"),
        })?;
        Ok(Some(PluginProjectManifest {
            runtime: raw.runtime.into(),
        }))
    }
}

/// The parsed contents of a `PulumiPolicy.yaml` manifest.
#[derive(Debug, Clone)]
pub struct PolicyPackManifest {
    pub runtime: RuntimeInfo,
    /// The declared policy pack version; overrides whatever the analyzer
    /// reports.
    pub version: Option<String>,
}

impl PolicyPackManifest {
    /// Load the manifest from a policy pack directory. Policy packs must
    /// carry a manifest.
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(POLICY_MANIFEST);
        #[derive(Deserialize)]
        struct Raw {
            runtime: RuntimeField,
            version: Option<String>,
        }
        let contents = fs::read_to_string(&path).map_err(|e| Error::Launch {
            plugin: dir.display().to_string(),
            reason: format!("failed to read {POLICY_MANIFEST}: {e}"),
        })?;
        let raw: Raw = serde_yaml::from_str(&contents).map_err(|e| Error::Launch {
            plugin: dir.display().to_string(),
            reason: format!("failed to parse {POLICY_MANIFEST}: {e}"),
        })?;
        Ok(PolicyPackManifest {
            runtime: raw.runtime.into(),
            version: raw.version,
        })
    }
}

/// Infer the runtime of a manifest-less plugin directory by probing for
/// well-known project marker files. Exactly one runtime must match.
pub fn infer_runtime(dir: &Path) -> Result<RuntimeInfo, Error> {
    const MARKERS: [(&str, &str); 5] = [
        ("package.json", "nodejs"),
        ("requirements.txt", "python"),
        ("go.mod", "go"),
        ("pom.xml", "java"),
        ("build.gradle", "java"),
    ];

    let mut matched: Vec<&str> = Vec::new();
    for (marker, runtime) in MARKERS {
        if dir.join(marker).exists() && !matched.contains(&runtime) {
            matched.push(runtime);
        }
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("csproj") | Some("fsproj")) && !matched.contains(&"dotnet") {
                matched.push("dotnet");
            }
        }
    }

    match matched.as_slice() {
        [runtime] => Ok(RuntimeInfo {
            name: runtime.to_string(),
            options: BTreeMap::new(),
        }),
        [] => Err(Error::Launch {
            plugin: dir.display().to_string(),
            reason: format!(
                "no {PLUGIN_MANIFEST} found, and no project file identifies the plugin's runtime"
            ),
        }),
        many => Err(Error::Launch {
            plugin: dir.display().to_string(),
            reason: format!(
                "no {PLUGIN_MANIFEST} found, and project files for several runtimes are present: {}",
                many.join(", ")
            ),
        }),
    }
}

/// Parse the `PULUMI_DEBUG_PROVIDERS` attach map: comma-separated
/// `<name>:<port>` pairs.
pub fn parse_debug_providers(value: &str) -> BTreeMap<String, u16> {
    let mut map = BTreeMap::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((name, port)) = entry.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                map.insert(name.to_string(), port);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_picks_newest_satisfying_version() {
        let dir = tempfile::tempdir().unwrap();
        for version in ["1.0.0", "1.4.2", "2.1.0"] {
            let plugin_dir = dir.path().join(format!("pulumi-resource-aws-v{version}"));
            fs::create_dir_all(&plugin_dir).unwrap();
            fs::write(plugin_dir.join("pulumi-resource-aws"), b"").unwrap();
        }
        let resolver = DirResolver::new(dir.path());

        let spec = PluginSpec::new(
            PluginKind::Resource,
            "aws",
            Some(Version::parse("1.2.0").unwrap()),
        );
        let path = resolver.resolve(&spec).unwrap();
        assert!(path.to_string_lossy().contains("v2.1.0"));

        let spec = PluginSpec::new(
            PluginKind::Resource,
            "aws",
            Some(Version::parse("3.0.0").unwrap()),
        );
        assert!(matches!(
            resolver.resolve(&spec),
            Err(Error::PluginNotFound { .. })
        ));
    }

    #[test]
    fn plugin_manifest_accepts_both_runtime_shapes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PLUGIN_MANIFEST), "runtime: nodejs\n").unwrap();
        let manifest = PluginProjectManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.runtime.name, "nodejs");
        assert!(manifest.runtime.options.is_empty());

        fs::write(
            dir.path().join(PLUGIN_MANIFEST),
            "runtime:\n  name: python\n  options:\n    virtualenv: venv\n",
        )
        .unwrap();
        let manifest = PluginProjectManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.runtime.name, "python");
        assert_eq!(
            manifest.runtime.options.get("virtualenv"),
            Some(&serde_json::Value::String("venv".into()))
        );
    }

    #[test]
    fn missing_plugin_manifest_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PluginProjectManifest::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn runtime_inference_requires_exactly_one_match() {
        let dir = tempfile::tempdir().unwrap();
        assert!(infer_runtime(dir.path()).is_err());

        fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(infer_runtime(dir.path()).unwrap().name, "nodejs");

        fs::write(dir.path().join("go.mod"), "module m").unwrap();
        assert!(infer_runtime(dir.path()).is_err());
    }

    #[test]
    fn dotnet_is_inferred_from_project_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plugin.csproj"), "<Project/>").unwrap();
        assert_eq!(infer_runtime(dir.path()).unwrap().name, "dotnet");
    }

    #[test]
    fn debug_providers_parsing() {
        let map = parse_debug_providers("aws:50051, gcp:50052,,bad");
        assert_eq!(map.get("aws"), Some(&50051));
        assert_eq!(map.get("gcp"), Some(&50052));
        assert_eq!(map.len(), 2);
    }
}
