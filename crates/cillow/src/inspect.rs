//! Static dependency discovery for `run_code` requests.
//!
//! Before executing a snippet the worker parses it and collects every
//! absolute import target, stripped to its top-level name. Names that the
//! target environment can already resolve — native/frozen interpreter
//! modules or anything reachable on the module search path — are dropped;
//! whatever remains is handed to the installer verbatim. Translation from
//! import name to distribution name is deliberately best-effort: a wrong
//! guess surfaces as the installer's own failure output and execution
//! proceeds regardless.
//!
//! Syntactically invalid source yields the empty set. The inspector must
//! never keep a legitimate execution error from surfacing through the normal
//! execution path.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use rustpython_parser::{ast, Parse};

/// What the target environment can already resolve.
pub struct ResolveContext {
    /// Modules compiled or frozen into the interpreter itself.
    pub builtin_modules: HashSet<String>,
    /// Filesystem roots searched for `name.py` / `name/` packages.
    pub search_paths: Vec<PathBuf>,
}

impl ResolveContext {
    pub fn new(builtin_modules: HashSet<String>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            builtin_modules,
            search_paths,
        }
    }

    /// `true` if `name` is importable without installing anything.
    pub fn resolves(&self, name: &str) -> bool {
        if self.builtin_modules.contains(name) {
            return true;
        }
        self.search_paths.iter().any(|root| {
            root.join(format!("{name}.py")).is_file() || root.join(name).is_dir()
        })
    }
}

/// Collect the top-level names of absolute imports that `ctx` cannot
/// resolve. Returns an empty set for unparseable source.
pub fn unresolved_imports(source: &str, ctx: &ResolveContext) -> BTreeSet<String> {
    let mut imports = BTreeSet::new();
    let Ok(program) = ast::Suite::parse(source, "<input>") else {
        return imports;
    };
    collect_from_body(&program, &mut imports);
    imports.retain(|name| !ctx.resolves(name));
    imports
}

fn collect_from_body(body: &[ast::Stmt], out: &mut BTreeSet<String>) {
    for stmt in body {
        collect_from_stmt(stmt, out);
    }
}

fn collect_from_stmt(stmt: &ast::Stmt, out: &mut BTreeSet<String>) {
    match stmt {
        ast::Stmt::Import(import) => {
            for alias in &import.names {
                out.insert(top_level_name(alias.name.as_str()));
            }
        }
        ast::Stmt::ImportFrom(import) => {
            // Relative imports (level > 0) resolve inside an existing
            // package; they are never installable.
            let level = import.level.map(|l| l.to_u32()).unwrap_or(0);
            if level == 0 {
                if let Some(module) = &import.module {
                    out.insert(top_level_name(module.as_str()));
                }
            }
        }
        ast::Stmt::FunctionDef(def) => collect_from_body(&def.body, out),
        ast::Stmt::AsyncFunctionDef(def) => collect_from_body(&def.body, out),
        ast::Stmt::ClassDef(def) => collect_from_body(&def.body, out),
        ast::Stmt::If(stmt) => {
            collect_from_body(&stmt.body, out);
            collect_from_body(&stmt.orelse, out);
        }
        ast::Stmt::While(stmt) => {
            collect_from_body(&stmt.body, out);
            collect_from_body(&stmt.orelse, out);
        }
        ast::Stmt::For(stmt) => {
            collect_from_body(&stmt.body, out);
            collect_from_body(&stmt.orelse, out);
        }
        ast::Stmt::AsyncFor(stmt) => {
            collect_from_body(&stmt.body, out);
            collect_from_body(&stmt.orelse, out);
        }
        ast::Stmt::With(stmt) => collect_from_body(&stmt.body, out),
        ast::Stmt::AsyncWith(stmt) => collect_from_body(&stmt.body, out),
        ast::Stmt::Try(stmt) => {
            collect_from_body(&stmt.body, out);
            for handler in &stmt.handlers {
                let ast::ExceptHandler::ExceptHandler(handler) = handler;
                collect_from_body(&handler.body, out);
            }
            collect_from_body(&stmt.orelse, out);
            collect_from_body(&stmt.finalbody, out);
        }
        _ => {}
    }
}

fn top_level_name(dotted: &str) -> String {
    dotted.split('.').next().unwrap_or(dotted).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_ctx() -> ResolveContext {
        ResolveContext::new(HashSet::new(), Vec::new())
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(|s| s.as_str()).collect()
    }

    // (1) Plain and dotted imports collapse to top-level names.
    #[test]
    fn test_collects_top_level_names() {
        let found = unresolved_imports("import numpy\nimport os.path\n", &empty_ctx());
        assert_eq!(names(&found), vec!["numpy", "os"]);
    }

    // (2) `from X import Y` contributes X, not Y.
    #[test]
    fn test_from_import_contributes_module() {
        let found = unresolved_imports("from requests.sessions import Session\n", &empty_ctx());
        assert_eq!(names(&found), vec!["requests"]);
    }

    // (3) Relative imports are skipped entirely.
    #[test]
    fn test_relative_imports_skipped() {
        let found = unresolved_imports("from . import sibling\nfrom ..pkg import thing\n", &empty_ctx());
        assert!(found.is_empty(), "relative imports are not installable: {found:?}");
    }

    // (4) Imports nested in defs and branches are still discovered.
    #[test]
    fn test_nested_imports_discovered() {
        let source = r#"
def load():
    import pandas
    return pandas

if True:
    import httpx
else:
    import flask

try:
    import lxml
except ImportError:
    import html5lib
"#;
        let found = unresolved_imports(source, &empty_ctx());
        assert_eq!(names(&found), vec!["flask", "html5lib", "httpx", "lxml", "pandas"]);
    }

    // (5) Unparseable source must return the empty set, not an error — the
    // syntax error has to surface through normal execution instead.
    #[test]
    fn test_invalid_source_yields_empty_set() {
        let found = unresolved_imports("def broken(:\n", &empty_ctx());
        assert!(found.is_empty());
    }

    // (6) Builtin modules are excluded.
    #[test]
    fn test_builtin_modules_excluded() {
        let ctx = ResolveContext::new(
            ["math".to_string(), "json".to_string()].into_iter().collect(),
            Vec::new(),
        );
        let found = unresolved_imports("import math\nimport json\nimport numpy\n", &ctx);
        assert_eq!(names(&found), vec!["numpy"]);
    }

    // (7) Names resolvable on a search path are excluded, both as modules
    // and as packages.
    #[test]
    fn test_search_path_probe() {
        let site = tempfile::tempdir().expect("tempdir");
        std::fs::write(site.path().join("helpers.py"), "x = 1\n").expect("write module");
        std::fs::create_dir(site.path().join("mypkg")).expect("mkdir package");

        let ctx = ResolveContext::new(HashSet::new(), vec![site.path().to_path_buf()]);
        let found = unresolved_imports("import helpers\nimport mypkg\nimport absent\n", &ctx);
        assert_eq!(names(&found), vec!["absent"]);
    }

    // (8) Duplicate mentions dedupe.
    #[test]
    fn test_duplicates_dedupe() {
        let found = unresolved_imports(
            "import yaml\nfrom yaml import safe_load\nimport yaml.parser\n",
            &empty_ctx(),
        );
        assert_eq!(names(&found), vec!["yaml"]);
    }
}
