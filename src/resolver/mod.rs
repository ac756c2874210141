//! Node.js-compatible module resolution using oxc_resolver
//!
//! Handles what worker entries and their imports need:
//! - Relative and absolute paths (e.g., "./utils", "/srv/app/worker.mjs")
//! - `file:` URL specifiers
//! - node_modules resolution and package.json exports/imports
//! - Extension resolution (.js, .mjs, .cjs, .json)

use oxc_resolver::{ResolveOptions, Resolver};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Errors that can occur during module resolution
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Failed to resolve module '{0}': {1}")]
    ResolutionFailed(String, String),

    #[error("Invalid file URL '{0}'")]
    InvalidFileUrl(String),
}

/// Result type for module resolution operations
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Module resolver with separate ESM and CommonJS condition sets
pub struct ModuleResolver {
    resolver: Resolver,
    cjs_resolver: Resolver,
    base_path: PathBuf,
}

impl ModuleResolver {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        let esm_options = ResolveOptions {
            condition_names: vec!["import".into(), "worker".into(), "default".into()],
            extensions: vec![".js".into(), ".mjs".into(), ".cjs".into(), ".json".into()],
            main_fields: vec!["module".into(), "main".into()],
            exports_fields: vec![vec!["exports".into()]],
            imports_fields: vec![vec!["imports".into()]],
            ..ResolveOptions::default()
        };

        // Used when bundling CommonJS - prefer the "require" condition
        let cjs_options = ResolveOptions {
            condition_names: vec!["require".into(), "worker".into(), "default".into()],
            extensions: vec![".js".into(), ".cjs".into(), ".json".into(), ".mjs".into()],
            main_fields: vec!["main".into()],
            exports_fields: vec![vec!["exports".into()]],
            imports_fields: vec![vec!["imports".into()]],
            ..ResolveOptions::default()
        };

        Self {
            resolver: Resolver::new(esm_options),
            cjs_resolver: Resolver::new(cjs_options),
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Resolve an `import` specifier relative to the importing file.
    pub fn resolve(&self, specifier: &str, referrer: &Path) -> ResolverResult<PathBuf> {
        if let Some(path) = file_url_path(specifier)? {
            return Ok(path);
        }
        let context = referrer.parent().unwrap_or(&self.base_path);

        match self.resolver.resolve(context, specifier) {
            Ok(resolution) => Ok(resolution.path().to_path_buf()),
            Err(error) => Err(ResolverError::ResolutionFailed(
                specifier.to_string(),
                error.to_string(),
            )),
        }
    }

    /// Resolve a `require` specifier relative to the requiring file.
    pub fn resolve_cjs(&self, specifier: &str, referrer: &Path) -> ResolverResult<PathBuf> {
        if let Some(path) = file_url_path(specifier)? {
            return Ok(path);
        }
        let context = referrer.parent().unwrap_or(&self.base_path);

        match self.cjs_resolver.resolve(context, specifier) {
            Ok(resolution) => Ok(resolution.path().to_path_buf()),
            Err(error) => Err(ResolverError::ResolutionFailed(
                specifier.to_string(),
                error.to_string(),
            )),
        }
    }
}

/// `file:` specifiers name an exact location and bypass the resolver
fn file_url_path(specifier: &str) -> ResolverResult<Option<PathBuf>> {
    if !specifier.starts_with("file:") {
        return Ok(None);
    }
    Url::parse(specifier)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .map(Some)
        .ok_or_else(|| ResolverError::InvalidFileUrl(specifier.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("webworker-resolver-{}", std::process::id()));
        fs::create_dir_all(dir.join("lib")).unwrap();
        dir
    }

    #[test]
    fn test_relative_path_resolution() {
        let dir = scratch();
        fs::write(dir.join("lib/util.mjs"), "export const x = 1;").unwrap();
        fs::write(dir.join("lib/dep.js"), "module.exports = 1;").unwrap();

        let resolver = ModuleResolver::new(&dir);
        let referrer = dir.join("main.mjs");

        let resolved = resolver.resolve("./lib/util.mjs", &referrer).unwrap();
        assert!(resolved.ends_with("lib/util.mjs"));

        let resolved = resolver.resolve_cjs("./lib/dep", &referrer).unwrap();
        assert!(resolved.ends_with("lib/dep.js"));
    }

    #[test]
    fn test_unresolvable_specifier() {
        let dir = scratch();
        let resolver = ModuleResolver::new(&dir);
        let err = resolver
            .resolve("./definitely-missing.mjs", &dir.join("main.mjs"))
            .unwrap_err();
        assert!(matches!(err, ResolverError::ResolutionFailed(spec, _) if spec == "./definitely-missing.mjs"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_url_specifier() {
        let resolver = ModuleResolver::new("/");
        let resolved = resolver
            .resolve("file:///srv/app/worker.mjs", Path::new("/tmp/data.mjs"))
            .unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/app/worker.mjs"));
    }

    #[test]
    fn test_invalid_file_url() {
        let resolver = ModuleResolver::new(".");
        assert!(matches!(
            resolver.resolve("file://remote-host/share/x.mjs", Path::new("./a.mjs")),
            Err(ResolverError::InvalidFileUrl(_))
        ));
    }
}
