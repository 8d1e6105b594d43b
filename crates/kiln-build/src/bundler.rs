//! Bundler contract and the reference flat bundler.
//!
//! The real compiler/bundler is an external collaborator; the core only
//! depends on this trait. Implementations must be deterministic: identical
//! `files` and `options` produce the same `main_module` and `modules`
//! (warnings are advisory and may vary). That determinism is what makes
//! fingerprint-keyed caching safe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiln_core::{Error, FileMap, Result};

/// Options for a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    /// Bundle imports into the output modules.
    pub bundle: bool,
    pub minify: bool,
    pub sourcemap: bool,
    /// Explicit entry module path; overrides `package.json` resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Import specifiers left unresolved.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub externals: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            bundle: true,
            minify: false,
            sourcemap: false,
            entry_point: None,
            externals: Vec::new(),
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    /// Path of the entry module within `modules`.
    pub main_module: String,
    /// Compiled modules: path → content.
    pub modules: FileMap,
    /// Advisory diagnostics; not part of the deterministic output.
    pub warnings: Vec<String>,
}

/// Compiles a multi-file source tree into a module set.
///
/// Syntax and resolution failures surface as `Error::Build`.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn build(&self, files: &FileMap, options: &BuildOptions) -> Result<BuildOutput>;
}

/// Entry candidates tried when neither `entry_point` nor `package.json`
/// designates one.
const DEFAULT_ENTRIES: [&str; 4] = ["src/index.ts", "index.ts", "src/index.js", "index.js"];

/// Reference bundler: resolves the entry module and passes the source tree
/// through unchanged.
///
/// Entry resolution order: `options.entry_point`, then `package.json`
/// `"main"`, then the conventional defaults. Trivially deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatBundler;

impl FlatBundler {
    fn resolve_entry(files: &FileMap, options: &BuildOptions) -> Result<(String, Vec<String>)> {
        if let Some(entry) = &options.entry_point {
            if !files.contains_key(entry) {
                return Err(Error::build(format!("entry point not found: {entry}")));
            }
            return Ok((entry.clone(), Vec::new()));
        }

        if let Some(manifest) = files.get("package.json") {
            let parsed: serde_json::Value = serde_json::from_str(manifest)
                .map_err(|e| Error::build(format!("invalid package.json: {e}")))?;
            if let Some(main) = parsed.get("main").and_then(|m| m.as_str()) {
                if !files.contains_key(main) {
                    return Err(Error::build(format!(
                        "package.json main not found: {main}"
                    )));
                }
                return Ok((main.to_string(), Vec::new()));
            }
        }

        for candidate in DEFAULT_ENTRIES {
            if files.contains_key(candidate) {
                let warning = format!("no entry designated; defaulted to {candidate}");
                return Ok((candidate.to_string(), vec![warning]));
            }
        }

        Err(Error::build("no entry module: set package.json main or an entry point"))
    }
}

#[async_trait]
impl Bundler for FlatBundler {
    async fn build(&self, files: &FileMap, options: &BuildOptions) -> Result<BuildOutput> {
        if files.is_empty() {
            return Err(Error::build("empty source tree"));
        }
        let (main_module, warnings) = Self::resolve_entry(files, options)?;
        Ok(BuildOutput {
            main_module,
            modules: files.clone(),
            warnings,
        })
    }
}
