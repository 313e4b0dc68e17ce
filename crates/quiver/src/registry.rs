//! Tool declarations and session configuration.
//!
//! A session is described by a list of [`ToolConfig`] declarations plus one
//! [`SessionConfig`]. Declarations are validated as a whole before anything
//! loads: at least one tool, a version unless a URL prefix is given, and no
//! repeated `(tool, program)` identity.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::limits::ResourceLimits;
use crate::probe::{Feature, FeatureProbe};
use crate::runtime::RuntimeError;
use crate::vfs;

/// Default CDN root for tool code and assets.
pub const DEFAULT_URL_CDN: &str = "https://cdn.biowasm.com/v2";

/// When a tool's code is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Loading {
    /// Load during `init()`
    #[default]
    Eager,
    /// Load on first `exec` that references the tool
    Lazy,
}

/// Declaration of one tool.
///
/// Deserializes from either an object or the `"<tool>/<version>[/<program>]"`
/// shorthand string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ToolDeclaration")]
pub struct ToolConfig {
    /// Tool name (e.g. `samtools`)
    pub tool: String,
    /// Tool version (e.g. `1.10`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Program within the tool; defaults to the tool name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Where the tool's code lives; defaults to `<urlCdn>/<tool>/<version>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_prefix: Option<String>,
    /// Eager or lazy loading
    pub loading: Loading,
    /// Rebuild the runtime after every invocation
    pub reinit: bool,
}

impl ToolConfig {
    /// Eagerly loaded tool with the given name and version.
    pub fn new(tool: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            version: Some(version.into()),
            program: None,
            url_prefix: None,
            loading: Loading::Eager,
            reinit: false,
        }
    }

    /// Set the program name.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Set the URL prefix.
    pub fn with_url_prefix(mut self, url_prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(url_prefix.into());
        self
    }

    /// Set the loading mode.
    pub fn with_loading(mut self, loading: Loading) -> Self {
        self.loading = loading;
        self
    }

    /// Set the reinit flag.
    pub fn with_reinit(mut self, reinit: bool) -> Self {
        self.reinit = reinit;
        self
    }

    /// Program name, defaulting to the tool name.
    pub fn program_name(&self) -> &str {
        self.program.as_deref().unwrap_or(&self.tool)
    }

    /// Identity used for duplicate detection.
    pub fn identity(&self) -> (&str, &str) {
        (&self.tool, self.program_name())
    }

    /// Fill in defaults and pick feature variants.
    pub fn resolve(
        &self,
        session: &SessionConfig,
        capabilities: &CapabilityTable,
        probe: &dyn FeatureProbe,
    ) -> ResolvedTool {
        let base_program = self.program_name().to_string();
        let url_prefix = self.url_prefix.clone().unwrap_or_else(|| {
            format!(
                "{}/{}/{}",
                session.url_cdn.trim_end_matches('/'),
                self.tool,
                self.version.as_deref().unwrap_or("latest")
            )
        });
        let features: Vec<Feature> = capabilities
            .features(&base_program)
            .iter()
            .copied()
            .filter(|f| probe.supports(*f))
            .collect();
        let program = features.iter().fold(base_program.clone(), |name, f| {
            format!("{name}-{}", f.suffix())
        });
        ResolvedTool {
            tool: self.tool.clone(),
            version: self.version.clone(),
            program,
            base_program,
            url_prefix,
            features,
        }
    }
}

impl FromStr for ToolConfig {
    type Err = RuntimeError;

    /// Parse `"<tool>/<version>"` or `"<tool>/<version>/<program>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) || parts.len() > 3 {
            return Err(RuntimeError::Configuration(format!(
                "invalid tool shorthand {s:?}, expected <tool>/<version>"
            )));
        }
        let mut config = ToolConfig {
            tool: parts[0].to_string(),
            version: parts.get(1).map(|v| v.to_string()),
            program: None,
            url_prefix: None,
            loading: Loading::Eager,
            reinit: false,
        };
        if let Some(program) = parts.get(2) {
            config.program = Some(program.to_string());
        }
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolDeclaration {
    Shorthand(String),
    Full(RawToolConfig),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolConfig {
    tool: String,
    version: Option<String>,
    program: Option<String>,
    url_prefix: Option<String>,
    #[serde(default)]
    loading: Loading,
    #[serde(default)]
    reinit: bool,
}

impl TryFrom<ToolDeclaration> for ToolConfig {
    type Error = String;

    fn try_from(decl: ToolDeclaration) -> Result<Self, Self::Error> {
        match decl {
            ToolDeclaration::Shorthand(s) => s.parse().map_err(|e: RuntimeError| e.to_string()),
            ToolDeclaration::Full(raw) => Ok(ToolConfig {
                tool: raw.tool,
                version: raw.version,
                program: raw.program,
                url_prefix: raw.url_prefix,
                loading: raw.loading,
                reinit: raw.reinit,
            }),
        }
    }
}

/// A tool declaration with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTool {
    /// Tool name
    pub tool: String,
    /// Tool version, if declared
    pub version: Option<String>,
    /// Program to load, including any feature suffix
    pub program: String,
    /// Program name as declared, without feature suffix
    pub base_program: String,
    /// Location of the tool's code and assets
    pub url_prefix: String,
    /// Features the selected variant uses
    pub features: Vec<Feature>,
}

/// Program names that ship feature-specific variants.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    programs: HashMap<String, Vec<Feature>>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::empty().with_program("ssw", [Feature::Simd])
    }
}

impl CapabilityTable {
    /// Table with no variants.
    pub fn empty() -> Self {
        Self {
            programs: HashMap::new(),
        }
    }

    /// Declare that `program` has variants for `features`.
    pub fn with_program(
        mut self,
        program: impl Into<String>,
        features: impl IntoIterator<Item = Feature>,
    ) -> Self {
        self.programs
            .insert(program.into(), features.into_iter().collect());
        self
    }

    /// Variant features available for `program`.
    pub fn features(&self, program: &str) -> &[Feature] {
        self.programs.get(program).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Session-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// CDN root used when a tool has no URL prefix
    #[serde(alias = "urlCDN")]
    pub url_cdn: String,
    /// Root of the shared namespace
    pub dir_shared: String,
    /// Read-write data directory, relative to the shared root
    pub dir_data: String,
    /// Read-only mounted directory, relative to the shared root
    pub dir_mounted: String,
    /// Merge stderr into stdout
    pub print_interleaved: bool,
    /// Emit output chunks as stream events while a tool runs
    pub print_stream: bool,
    /// Verbose logging
    pub debug: bool,
    /// Per-invocation resource limits
    pub limits: ResourceLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url_cdn: DEFAULT_URL_CDN.to_string(),
            dir_shared: "/shared".to_string(),
            dir_data: "/data".to_string(),
            dir_mounted: "/mnt".to_string(),
            print_interleaved: true,
            print_stream: false,
            debug: false,
            limits: ResourceLimits::default(),
        }
    }
}

impl SessionConfig {
    /// Absolute shared root.
    pub fn shared_dir(&self) -> String {
        vfs::normalize("/", &self.dir_shared)
    }

    /// Absolute data directory.
    pub fn data_dir(&self) -> String {
        vfs::join(&self.shared_dir(), self.dir_data.trim_start_matches('/'))
    }

    /// Absolute mounted directory.
    pub fn mounted_dir(&self) -> String {
        vfs::join(&self.shared_dir(), self.dir_mounted.trim_start_matches('/'))
    }
}

/// A complete session declaration, as loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    /// Tools in declaration order
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    /// Session settings
    #[serde(default)]
    pub config: SessionConfig,
}

/// Check a whole declaration before anything loads.
pub fn validate(tools: &[ToolConfig]) -> Result<(), RuntimeError> {
    if tools.is_empty() {
        return Err(RuntimeError::Configuration(
            "Expecting at least 1 tool.".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for tool in tools {
        if tool.tool.is_empty() {
            return Err(RuntimeError::Configuration(
                "tool name must not be empty".to_string(),
            ));
        }
        if tool.version.is_none() && tool.url_prefix.is_none() {
            return Err(RuntimeError::Configuration(format!(
                "tool {:?} needs a version or a urlPrefix",
                tool.tool
            )));
        }
        let (name, program) = tool.identity();
        if !seen.insert((name, program)) {
            return Err(RuntimeError::Configuration(format!(
                "duplicate tool {name:?} with program {program:?}"
            )));
        }
    }
    Ok(())
}

/// Index of the base module: the first tool that is not reinitialized.
pub fn select_base(tools: &[ToolConfig]) -> Result<usize, RuntimeError> {
    tools.iter().position(|t| !t.reinit).ok_or_else(|| {
        RuntimeError::Configuration(
            "at least one tool must have reinit disabled to act as the base module".to_string(),
        )
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::probe::FixedFeatureProbe;

    #[test]
    fn test_shorthand_parsing() {
        let config: ToolConfig = "samtools/1.10".parse().unwrap();
        assert_eq!(config.tool, "samtools");
        assert_eq!(config.version.as_deref(), Some("1.10"));
        assert_eq!(config.program_name(), "samtools");

        let config: ToolConfig = "seq-align/0.1/smith_waterman".parse().unwrap();
        assert_eq!(config.program_name(), "smith_waterman");

        assert!("samtools//".parse::<ToolConfig>().is_err());
        assert!("".parse::<ToolConfig>().is_err());
    }

    #[test]
    fn test_declaration_accepts_mixed_forms() {
        let decl: Declaration = serde_json::from_str(
            r#"{
                "tools": [
                    "samtools/1.10",
                    {"tool": "seqtk", "version": "1.3", "loading": "lazy"},
                    {"tool": "local", "urlPrefix": "file:///tools/local", "reinit": true}
                ],
                "config": {"printInterleaved": false, "urlCDN": "https://example.org"}
            }"#,
        )
        .unwrap();

        assert_eq!(decl.tools.len(), 3);
        assert_eq!(decl.tools[1].loading, Loading::Lazy);
        assert!(decl.tools[2].reinit);
        assert!(!decl.config.print_interleaved);
        assert_eq!(decl.config.url_cdn, "https://example.org");
        assert_eq!(decl.config.dir_shared, "/shared");
    }

    #[test]
    fn test_validate_rejects_empty() {
        let err = validate(&[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(msg) if msg == "Expecting at least 1 tool."));
    }

    #[test]
    fn test_validate_requires_version_or_prefix() {
        let mut tool = ToolConfig::new("samtools", "1.10");
        tool.version = None;
        assert!(validate(std::slice::from_ref(&tool)).is_err());
        tool.url_prefix = Some("file:///x".to_string());
        assert!(validate(&[tool]).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let tools = [
            ToolConfig::new("seq-align", "1").with_program("lcs"),
            ToolConfig::new("seq-align", "1").with_program("needleman_wunsch"),
        ];
        assert!(validate(&tools).is_ok());

        let tools = [
            ToolConfig::new("samtools", "1.10"),
            ToolConfig::new("samtools", "1.9").with_program("samtools"),
        ];
        assert!(validate(&tools).is_err());
    }

    #[test]
    fn test_select_base_skips_reinit_tools() {
        let tools = [
            ToolConfig::new("a", "1").with_reinit(true),
            ToolConfig::new("b", "1"),
        ];
        assert_eq!(select_base(&tools).unwrap(), 1);

        let tools = [ToolConfig::new("a", "1").with_reinit(true)];
        assert!(matches!(
            select_base(&tools),
            Err(RuntimeError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_defaults() {
        let session = SessionConfig::default();
        let resolved = ToolConfig::new("samtools", "1.10").resolve(
            &session,
            &CapabilityTable::default(),
            &FixedFeatureProbe::default(),
        );
        assert_eq!(resolved.program, "samtools");
        assert_eq!(
            resolved.url_prefix,
            "https://cdn.biowasm.com/v2/samtools/1.10"
        );
        assert!(resolved.features.is_empty());
    }

    #[test]
    fn test_resolve_simd_variant() {
        let session = SessionConfig::default();
        let tool = ToolConfig::new("ssw", "1.2.4");
        let caps = CapabilityTable::default();

        let with = tool.resolve(&session, &caps, &FixedFeatureProbe::new([Feature::Simd]));
        assert_eq!(with.program, "ssw-simd");
        assert_eq!(with.base_program, "ssw");
        assert_eq!(with.features, vec![Feature::Simd]);

        let without = tool.resolve(&session, &caps, &FixedFeatureProbe::default());
        assert_eq!(without.program, "ssw");
    }

    #[test]
    fn test_session_dirs() {
        let session = SessionConfig::default();
        assert_eq!(session.shared_dir(), "/shared");
        assert_eq!(session.data_dir(), "/shared/data");
        assert_eq!(session.mounted_dir(), "/shared/mnt");
    }
}
