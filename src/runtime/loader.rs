//! Module loading for worker entries and their imports.
//!
//! ES modules go through [`WorkerModuleLoader`]. Classic entries and any
//! CommonJS file imported from a module are bundled into a single source
//! with a small `require` runtime, resolved with the CommonJS condition set.

use boa_engine::{
    Context, JsError, JsResult, JsString, JsValue, Source, js_string,
    module::{Module, ModuleLoader, Referrer},
};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    rc::Rc,
};

use crate::resolver::ModuleResolver;

/// How a CommonJS bundle hands back its entry's `module.exports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleTarget {
    /// Evaluated as a script for its side effects
    Script,
    /// Evaluated as an ES module with `module.exports` as the default export
    Module,
}

/// Module loader backed by oxc_resolver
pub struct WorkerModuleLoader {
    base_path: PathBuf,
    resolver: ModuleResolver,
}

impl WorkerModuleLoader {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        let base = base_path.as_ref().to_path_buf();
        Self {
            resolver: ModuleResolver::new(&base),
            base_path: base,
        }
    }

    /// Check if code is CommonJS (has module.exports or require())
    pub fn is_commonjs(code: &str) -> bool {
        for line in code.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*') {
                continue;
            }
            if trimmed.starts_with("import ") || trimmed.starts_with("export ") {
                return false;
            }
            if trimmed.contains("module.exports")
                || trimmed.contains("exports.")
                || (trimmed.contains("require(") && !trimmed.contains("import"))
            {
                return true;
            }
        }
        false
    }

    /// Bundle a CommonJS file and everything it requires.
    pub fn bundle_commonjs(&self, entry_path: &Path, target: BundleTarget) -> Result<String, String> {
        // module_id -> (code, specifier -> resolved module_id)
        let mut modules: HashMap<String, (String, HashMap<String, String>)> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();

        self.collect_cjs_modules(entry_path, &mut modules, &mut visited)?;

        let entry_id = module_id(entry_path);

        let mut bundle = String::from(
            r#"const __cjs_modules__ = {};
const __cjs_cache__ = {};

function __cjs_require__(id) {
    if (__cjs_cache__[id]) {
        return __cjs_cache__[id].exports;
    }

    const module = { exports: {}, id, filename: id, loaded: false };
    __cjs_cache__[id] = module;

    const moduleFunc = __cjs_modules__[id];
    if (!moduleFunc) {
        throw new Error(`Cannot find module '${id}'`);
    }

    moduleFunc(module.exports, module, __cjs_require__, id);
    module.loaded = true;
    return module.exports;
}

"#,
        );

        for (id, (code, require_map)) in &modules {
            let id_literal = js_literal(id);

            if id.ends_with(".json") {
                bundle.push_str(&format!(
                    "__cjs_modules__[{id_literal}] = function(exports, module) {{\nmodule.exports = {code};\n}};\n\n"
                ));
                continue;
            }

            let mut require_mappings = String::from("const __require_map__ = {\n");
            for (spec, resolved_id) in require_map {
                require_mappings.push_str(&format!(
                    "  {}: {},\n",
                    js_literal(spec),
                    js_literal(resolved_id)
                ));
            }
            require_mappings.push_str("};\n");

            bundle.push_str(&format!(
                r#"__cjs_modules__[{id_literal}] = function(exports, module, __parent_require__, __filename) {{
const __dirname = __filename.substring(0, __filename.lastIndexOf('/'));
{require_mappings}
function require(specifier) {{
    const resolved = __require_map__[specifier];
    if (resolved) {{
        return __parent_require__(resolved);
    }}
    throw new Error(`Cannot find module '${{specifier}}' from '${{__filename}}'`);
}}
{code}
}};

"#
            ));
        }

        let entry_literal = js_literal(&entry_id);
        match target {
            BundleTarget::Script => {
                bundle.push_str(&format!("__cjs_require__({entry_literal});\n"));
                Ok(format!("(function () {{\n{bundle}}})();\n"))
            }
            BundleTarget::Module => {
                bundle.push_str(&format!(
                    "const __entry_exports__ = __cjs_require__({entry_literal});\nexport default __entry_exports__;\n"
                ));
                Ok(bundle)
            }
        }
    }

    /// Recursively collect all CommonJS modules with their require mappings
    fn collect_cjs_modules(
        &self,
        file_path: &Path,
        modules: &mut HashMap<String, (String, HashMap<String, String>)>,
        visited: &mut HashSet<String>,
    ) -> Result<(), String> {
        let file_id = module_id(file_path);

        if !visited.insert(file_id.clone()) {
            return Ok(());
        }

        let code = std::fs::read_to_string(file_path)
            .map_err(|e| format!("Cannot load '{}': {}", file_path.display(), e))?;

        let mut require_map = HashMap::new();
        for req in Self::find_requires(&code) {
            // Unresolvable specifiers throw when required at runtime
            if let Ok(resolved) = self.resolver.resolve_cjs(&req, file_path) {
                require_map.insert(req, module_id(&resolved));
                self.collect_cjs_modules(&resolved, modules, visited)?;
            }
        }

        modules.insert(file_id, (code, require_map));
        Ok(())
    }

    /// Find all `require('...')` / `require("...")` calls with a literal argument
    fn find_requires(code: &str) -> Vec<String> {
        let mut requires = Vec::new();
        let mut rest = code;

        while let Some(pos) = rest.find("require(") {
            let preceded_by_ident = rest[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$' || c == '.');
            rest = &rest[pos + "require(".len()..];
            if preceded_by_ident {
                continue;
            }

            let trimmed = rest.trim_start();
            let Some(quote) = trimmed.chars().next().filter(|c| *c == '\'' || *c == '"') else {
                continue;
            };
            let body = &trimmed[1..];
            if let Some(end) = body.find(quote) {
                let path = &body[..end];
                if !path.is_empty() {
                    requires.push(path.to_string());
                }
            }
        }

        requires
    }

    /// Source text the engine should parse for an imported `path`.
    ///
    /// CommonJS files reached through `import` are bundled into a module.
    fn module_source(&self, path: &Path) -> Result<String, String> {
        let code = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read module '{}': {}", path.display(), e))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match extension {
            "json" => Ok(format!("export default {code};\n")),
            "cjs" => self.bundle_commonjs(path, BundleTarget::Module),
            "mjs" => Ok(code),
            _ if Self::is_commonjs(&code) => self.bundle_commonjs(path, BundleTarget::Module),
            _ => Ok(code),
        }
    }
}

impl ModuleLoader for WorkerModuleLoader {
    fn load_imported_module(
        self: Rc<Self>,
        referrer: Referrer,
        specifier: JsString,
        context: &RefCell<&mut Context>,
    ) -> impl std::future::Future<Output = JsResult<Module>> {
        let specifier_str = specifier.to_std_string_escaped();

        async move {
            let referrer_path = referrer
                .path()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| self.base_path.join("index.js"));

            let resolved_path = self
                .resolver
                .resolve(&specifier_str, &referrer_path)
                .map_err(|e| JsError::from_opaque(JsValue::from(js_string!(e.to_string()))))?;

            let code = self
                .module_source(&resolved_path)
                .map_err(|e| JsError::from_opaque(JsValue::from(js_string!(e))))?;

            let source = Source::from_bytes(code.as_bytes()).with_path(&resolved_path);
            let mut ctx = context.borrow_mut();
            Module::parse(source, None, &mut *ctx)
        }
    }
}

/// Stable id for a module file; forward slashes on every platform
fn module_id(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Quote `s` as a JS string literal
fn js_literal(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
