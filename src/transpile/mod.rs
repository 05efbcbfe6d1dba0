// TypeScript → CommonJS transpilation using OXC

mod exports;

use crate::config::TranspileConfig;
use crate::error::TranspileError;
use oxc_allocator::Allocator;
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};
use std::path::Path;

/// Output of compilation: a self-contained module body ready for `load`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    /// Wrapped CommonJS code; evaluating it yields the `exports` object
    pub code: String,

    /// Export names detected in the source (`default` included)
    pub exports: Vec<String>,
}

/// OXC-based connector transpiler
///
/// Strips TypeScript, lowers syntax to the configured target, rewrites ES
/// module exports into `exports.*` assignments and wraps the result in the
/// CommonJS envelope the sandbox boundary evaluates.
#[derive(Debug, Clone)]
pub struct Transpiler {
    target: String,
    filename: String,
}

impl Default for Transpiler {
    fn default() -> Self {
        Self::from_config(&TranspileConfig::default())
    }
}

impl Transpiler {
    pub fn new(target: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            filename: filename.into(),
        }
    }

    pub fn from_config(config: &TranspileConfig) -> Self {
        Self::new(config.target.clone(), config.filename.clone())
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Compile connector source into a wrapped CommonJS module
    ///
    /// # Arguments
    ///
    /// * `source` - TypeScript or JavaScript connector source
    ///
    /// # Returns
    ///
    /// Returns the wrapped module, or the first failing stage's diagnostics.
    /// No partial output is ever produced.
    pub fn compile(&self, source: &str) -> Result<CompiledModule, TranspileError> {
        let javascript = self.strip_types(source)?;
        let rewritten = exports::rewrite_to_commonjs(&javascript)?;

        tracing::debug!(
            es_target = %self.target,
            exports = ?rewritten.exports,
            "Compiled connector module"
        );

        Ok(CompiledModule {
            code: wrap_commonjs(&rewritten.body),
            exports: rewritten.exports,
        })
    }

    /// Parse, analyse, transform and regenerate plain JavaScript
    fn strip_types(&self, source: &str) -> Result<String, TranspileError> {
        // Detect source type from filename
        let source_type = SourceType::from_path(&self.filename)
            .unwrap_or_else(|_| SourceType::ts())
            .with_module(true);

        let allocator = Allocator::default();

        let parsed = Parser::new(&allocator, source, source_type).parse();
        if !parsed.errors.is_empty() || parsed.panicked {
            let errors: Vec<String> = parsed.errors.iter().map(|e| e.to_string()).collect();
            return Err(TranspileError::Syntax(errors.join("\n")));
        }
        let mut program = parsed.program;

        let scoping = SemanticBuilder::new()
            .build(&program)
            .semantic
            .into_scoping();

        let options = TransformOptions::from_target(&self.target).map_err(|e| {
            TranspileError::Transform(format!("invalid target '{}': {e}", self.target))
        })?;

        let transformed = Transformer::new(&allocator, Path::new(&self.filename), &options)
            .build_with_scoping(scoping, &mut program);
        if !transformed.errors.is_empty() {
            let errors: Vec<String> = transformed.errors.iter().map(|e| e.to_string()).collect();
            return Err(TranspileError::Transform(errors.join("\n")));
        }

        Ok(Codegen::new().build(&program).code)
    }
}

/// Compile with the default target and filename
pub fn compile(source: &str) -> Result<CompiledModule, TranspileError> {
    Transpiler::default().compile(source)
}

/// Wrap a CommonJS body so that evaluating it returns the normalized exports
///
/// A fresh `module` is created per evaluation and nothing is assigned to the
/// global scope. Whichever convention the body used (`exports.default`,
/// `module.exports.default` or `module.exports` itself) ends up as
/// `exports.default`.
pub fn wrap_commonjs(body: &str) -> String {
    format!(
        r#"(function () {{
  var module = {{ exports: {{}} }};
  var exports = module.exports;
  (function (exports, module) {{
{body}
  }})(exports, module);
  var resolved = module.exports;
  if (resolved && resolved.default !== undefined) {{
    exports.default = resolved.default;
  }} else if (exports.default === undefined) {{
    exports.default = resolved;
  }}
  return exports;
}})();
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_strips_type_annotations() {
        let out = compile(
            "const greet = (name: string): string => `Hello, ${name}!`;\nexport default { greet };",
        )
        .expect("Compilation should succeed");

        assert!(out.code.contains("greet"), "Function name should be preserved");
        assert!(!out.code.contains(": string"), "Type annotations should be removed");
        assert!(out.code.contains("exports.default ="));
        assert_eq!(out.exports, vec!["default".to_string()]);
    }

    #[test]
    fn compile_removes_interfaces_and_type_imports() {
        let out = compile(
            r#"import { App } from "./dsl";
interface User { name: string; }
const app: App = { name: "x" } as App;
export default app;"#,
        )
        .expect("Type-only import should be elided");

        assert!(!out.code.contains("interface"));
        assert!(!out.code.contains("./dsl"));
    }

    #[test]
    fn compile_syntax_error() {
        let result = compile("const x = ");
        match result {
            Err(TranspileError::Syntax(_)) => {}
            other => panic!("Expected Syntax error, got {other:?}"),
        }
    }

    #[test]
    fn compile_rejects_unknown_target() {
        let transpiler = Transpiler::new("es1999", "connector.ts");
        let result = transpiler.compile("export default {};");
        assert!(matches!(result, Err(TranspileError::Transform(_))));
    }

    #[test]
    fn compile_preserves_async_functions() {
        let out = compile("export async function fetchData() { return await Promise.resolve(1); }")
            .expect("Compilation should succeed");

        assert!(out.code.contains("async"));
        assert!(out.code.contains("exports.fetchData = fetchData"));
    }

    #[test]
    fn wrapper_never_touches_globals() {
        let wrapped = wrap_commonjs("exports.default = 1;");
        assert!(!wrapped.contains("globalThis"));
        assert!(wrapped.trim_end().ends_with("})();"));
    }
}
