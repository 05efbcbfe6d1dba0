// ES module → CommonJS export rewriting

use crate::error::TranspileError;
use oxc_allocator::Allocator;
use oxc_ast::ast::{Declaration, ExportDefaultDeclarationKind, Statement};
use oxc_ecmascript::BoundNames;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType};

pub(super) struct Rewritten {
    pub body: String,
    pub exports: Vec<String>,
}

/// A replacement of `source[start..end]`
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

/// Rewrite top-level `export` statements into `exports.*` assignments
///
/// Works on generated JavaScript, so type-only syntax is already gone. Spans
/// are spliced from the end of the source so earlier offsets stay valid.
pub(super) fn rewrite_to_commonjs(javascript: &str) -> Result<Rewritten, TranspileError> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, javascript, SourceType::mjs()).parse();
    if !parsed.errors.is_empty() || parsed.panicked {
        let errors: Vec<String> = parsed.errors.iter().map(|e| e.to_string()).collect();
        return Err(TranspileError::Transform(errors.join("\n")));
    }

    let mut edits = Vec::new();
    let mut exports = Vec::new();

    for stmt in &parsed.program.body {
        match stmt {
            Statement::ImportDeclaration(import) => {
                return Err(TranspileError::UnsupportedModuleSyntax(format!(
                    "import from '{}'",
                    import.source.value
                )));
            }
            Statement::ExportAllDeclaration(export_all) => {
                return Err(TranspileError::UnsupportedModuleSyntax(format!(
                    "export * from '{}'",
                    export_all.source.value
                )));
            }
            Statement::ExportDefaultDeclaration(export) => {
                let start = export.span.start as usize;
                let decl_start = export.declaration.span().start as usize;
                let named = match &export.declaration {
                    ExportDefaultDeclarationKind::FunctionDeclaration(func) => {
                        func.id.as_ref().map(|id| id.name.to_string())
                    }
                    ExportDefaultDeclarationKind::ClassDeclaration(class) => {
                        class.id.as_ref().map(|id| id.name.to_string())
                    }
                    _ => None,
                };
                match named {
                    Some(name) => {
                        edits.push(Edit::remove(start, decl_start));
                        edits.push(Edit::insert(
                            export.span.end as usize,
                            format!("\nexports.default = {name};"),
                        ));
                    }
                    None => {
                        edits.push(Edit {
                            start,
                            end: decl_start,
                            text: "exports.default = ".to_string(),
                        });
                        // Anonymous function/class declarations carry no semicolon
                        if matches!(
                            export.declaration,
                            ExportDefaultDeclarationKind::FunctionDeclaration(_)
                                | ExportDefaultDeclarationKind::ClassDeclaration(_)
                        ) {
                            edits.push(Edit::insert(export.span.end as usize, ";".to_string()));
                        }
                    }
                }
                exports.push("default".to_string());
            }
            Statement::ExportNamedDeclaration(export) => {
                if let Some(source) = &export.source {
                    return Err(TranspileError::UnsupportedModuleSyntax(format!(
                        "re-export from '{}'",
                        source.value
                    )));
                }
                let start = export.span.start as usize;
                let end = export.span.end as usize;

                if let Some(decl) = &export.declaration {
                    let names = declared_names(decl);
                    edits.push(Edit::remove(start, decl.span().start as usize));
                    let assignments: String = names
                        .iter()
                        .map(|name| format!("\nexports.{name} = {name};"))
                        .collect();
                    edits.push(Edit::insert(end, assignments));
                    exports.extend(names);
                } else {
                    let mut assignments = Vec::with_capacity(export.specifiers.len());
                    for spec in &export.specifiers {
                        let local = spec.local.name();
                        let exported = spec.exported.name();
                        assignments.push(export_assignment(&exported, &local));
                        exports.push(exported.to_string());
                    }
                    edits.push(Edit {
                        start,
                        end,
                        text: assignments.join(" "),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(Rewritten {
        body: apply_edits(javascript, edits),
        exports,
    })
}

impl Edit {
    fn remove(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            text: String::new(),
        }
    }

    fn insert(at: usize, text: String) -> Self {
        Self {
            start: at,
            end: at,
            text,
        }
    }
}

fn declared_names(decl: &Declaration<'_>) -> Vec<String> {
    match decl {
        Declaration::FunctionDeclaration(func) => {
            func.id.iter().map(|id| id.name.to_string()).collect()
        }
        Declaration::ClassDeclaration(class) => {
            class.id.iter().map(|id| id.name.to_string()).collect()
        }
        Declaration::VariableDeclaration(var) => {
            let mut names = Vec::new();
            var.bound_names(&mut |ident| names.push(ident.name.to_string()));
            names
        }
        _ => Vec::new(),
    }
}

/// `exports.a = a;`, or bracket access for names that aren't identifiers
fn export_assignment(exported: &str, local: &str) -> String {
    let is_identifier = exported
        .chars()
        .enumerate()
        .all(|(i, c)| c == '_' || c == '$' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
    if is_identifier && !exported.is_empty() {
        format!("exports.{exported} = {local};")
    } else {
        format!("exports[{}] = {local};", serde_json::Value::String(exported.to_string()))
    }
}

fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    // Later edits first; inserts at the same offset keep their order.
    edits.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));
    let mut out = source.to_string();
    for edit in edits {
        out.replace_range(edit.start..edit.end, &edit.text);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(src: &str) -> Rewritten {
        rewrite_to_commonjs(src).expect("rewrite should succeed")
    }

    #[test]
    fn default_expression_becomes_assignment() {
        let out = rewrite("export default { connection: {} };\n");
        assert!(out.body.starts_with("exports.default = { connection: {} };"));
        assert_eq!(out.exports, vec!["default"]);
    }

    #[test]
    fn named_default_function_keeps_declaration() {
        let out = rewrite("export default function app() { return 1; }\n");
        assert!(out.body.contains("function app()"));
        assert!(out.body.contains("exports.default = app;"));
        assert!(!out.body.contains("export default"));
    }

    #[test]
    fn named_declarations_export_each_binding() {
        let out = rewrite("export const a = 1, { b, c: d } = obj;\nexport function f() {}\n");
        assert!(out.body.contains("const a = 1"));
        assert!(out.body.contains("exports.a = a;"));
        assert!(out.body.contains("exports.b = b;"));
        assert!(out.body.contains("exports.d = d;"));
        assert!(out.body.contains("exports.f = f;"));
        assert_eq!(out.exports, vec!["a", "b", "d", "f"]);
    }

    #[test]
    fn export_specifiers_become_assignments() {
        let out = rewrite("const x = 1; const y = 2;\nexport { x, y as default };\n");
        assert!(out.body.contains("exports.x = x; exports.default = y;"));
        assert!(!out.body.contains("export {"));
    }

    #[test]
    fn string_export_names_use_bracket_access() {
        assert_eq!(export_assignment("my-name", "v"), r#"exports["my-name"] = v;"#);
        assert_eq!(export_assignment("$ok_1", "v"), "exports.$ok_1 = v;");
    }

    #[test]
    fn imports_are_rejected() {
        let err = rewrite_to_commonjs("import x from 'lodash';\nexport default x;\n")
            .err()
            .expect("imports must fail");
        match err {
            TranspileError::UnsupportedModuleSyntax(msg) => assert!(msg.contains("lodash")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reexports_are_rejected() {
        assert!(rewrite_to_commonjs("export * from './a';").is_err());
        assert!(rewrite_to_commonjs("export { a } from './a';").is_err());
    }
}
