//! Text rewrites applied by the improve agent.
//!
//! Each rewrite is a pure function of the file path and contents and returns
//! the contents unchanged when nothing applies.

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::core::plan::OperationKind;

static ASYNC_FN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"async\s+function\s+(\w+)\s*\(([^)]*)\)\s*\{([^{}]+)\}").expect("valid regex")
});
static THEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+\.then\([^)]+\)").expect("valid regex"));
static DEFAULT_COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"export default function (\w+)").expect("valid regex"));
static HEAVY_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"import (\w+) from ['"]([^'"]*(?:Chart|Table|Editor|Map)[^'"]*)['"];?"#)
        .expect("valid regex")
});
static BODY_DESTRUCTURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"const\s*\{\s*([^}]+?)\s*\}\s*=\s*req\.body").expect("valid regex")
});
static INNER_HTML_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"dangerouslySetInnerHTML=\{\{__html:\s*([^}]+?)\s*\}\}").expect("valid regex")
});

fn is_script(path: &str) -> bool {
    matches!(
        Path::new(path).extension().and_then(|ext| ext.to_str()),
        Some("js" | "jsx" | "ts" | "tsx" | "mjs")
    )
}

/// Apply one operation's in-place rewrite. `AddTests` never edits the source.
pub fn apply(kind: OperationKind, path: &str, contents: &str) -> String {
    if !is_script(path) {
        return contents.to_string();
    }
    match kind {
        OperationKind::AddErrorHandling => add_error_handling(contents),
        OperationKind::OptimizePerformance => optimize_performance(path, contents),
        OperationKind::SecurityHardening => harden(path, contents),
        OperationKind::AddTests => contents.to_string(),
    }
}

/// Wrap brace-free async function bodies in try/catch and terminate bare `.then` chains.
pub fn add_error_handling(contents: &str) -> String {
    let wrapped = ASYNC_FN_RE.replace_all(contents, |caps: &Captures| {
        let body = &caps[3];
        if body.contains("try") || body.contains("catch") {
            return caps[0].to_string();
        }
        let name = &caps[1];
        format!(
            "async function {name}({params}) {{\n  try {{{body}}}\n  catch (error) {{\n    console.error('Error in {name}:', error);\n    throw error;\n  }}\n}}",
            params = &caps[2],
        )
    });

    let mut out = String::with_capacity(wrapped.len());
    let mut last = 0;
    for m in THEN_RE.find_iter(&wrapped) {
        out.push_str(&wrapped[last..m.end()]);
        if !wrapped[m.end()..].starts_with(".catch") && !wrapped[m.end()..].starts_with(".then") {
            out.push_str(".catch(error => console.error(\"Unhandled promise rejection:\", error))");
        }
        last = m.end();
    }
    out.push_str(&wrapped[last..]);
    out
}

/// Memoize default-exported components and lazy-load heavy imports.
pub fn optimize_performance(path: &str, contents: &str) -> String {
    let mut out = contents.to_string();
    let is_component = path.ends_with(".jsx") || path.ends_with(".tsx");
    if is_component && !out.contains("React.memo") {
        let name = DEFAULT_COMPONENT_RE
            .captures(&out)
            .map(|caps| caps[1].to_string());
        if let Some(name) = name {
            out = DEFAULT_COMPONENT_RE
                .replace(&out, format!("function {name}").as_str())
                .into_owned();
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!("\nexport default React.memo({name});\n"));
        }
    }
    HEAVY_IMPORT_RE
        .replace_all(&out, "const $1 = React.lazy(() => import('$2'));")
        .into_owned()
}

/// Sanitize destructured request bodies in route files and rendered HTML.
pub fn harden(path: &str, contents: &str) -> String {
    let mut out = contents.to_string();
    let is_route = path.contains("routes") || path.contains("api");
    if is_route && !out.contains("sanitize") && !out.contains("validate") && BODY_DESTRUCTURE_RE.is_match(&out) {
        out = BODY_DESTRUCTURE_RE
            .replace_all(&out, |caps: &Captures| {
                let names: Vec<&str> = caps[1]
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .collect();
                let sanitized: Vec<String> = names
                    .iter()
                    .map(|name| format!("{name}: validator.escape(String(req.body.{name} ?? ''))"))
                    .collect();
                format!("const {{ {} }} = {{ {} }}", names.join(", "), sanitized.join(", "))
            })
            .into_owned();
        out = format!("const validator = require('validator');\n{out}");
    }
    INNER_HTML_RE
        .replace_all(&out, |caps: &Captures| {
            let inner = &caps[1];
            if inner.starts_with("DOMPurify.sanitize(") {
                caps[0].to_string()
            } else {
                format!("dangerouslySetInnerHTML={{{{__html: DOMPurify.sanitize({inner})}}}}")
            }
        })
        .into_owned()
}

/// Minimal test file for a module without tests.
pub fn test_stub(path: &str) -> String {
    let name = Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("module");
    format!(
        "describe('{name}', () => {{\n  it('should exist', () => {{\n    expect(true).toBe(true);\n  }});\n}});\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_async_function_in_try_catch() {
        let src = "async function load(id) {\n  return fetch(id);\n}\n";
        let out = add_error_handling(src);
        assert!(out.contains("async function load(id) {\n  try {"));
        assert!(out.contains("console.error('Error in load:', error);"));
    }

    #[test]
    fn leaves_functions_that_already_catch() {
        let src = "async function load() { try { a(); } catch (e) {} }";
        assert_eq!(add_error_handling(src), src);
    }

    #[test]
    fn adds_catch_only_to_unterminated_then() {
        let src = "api.then(ok);\nother.then(ok).catch(fail);\n";
        let out = add_error_handling(src);
        assert_eq!(out.matches(".catch(").count(), 2);
        assert!(out.starts_with("api.then(ok).catch(error =>"));
    }

    #[test]
    fn memoizes_default_component() {
        let src = "export default function Table() {\n  return null;\n}";
        let out = optimize_performance("src/Table.jsx", src);
        assert!(out.starts_with("function Table() {"));
        assert!(out.ends_with("export default React.memo(Table);\n"));
    }

    #[test]
    fn lazy_loads_heavy_imports() {
        let src = "import SalesChart from './charts/SalesChart';\n";
        let out = optimize_performance("src/page.js", src);
        assert_eq!(
            out,
            "const SalesChart = React.lazy(() => import('./charts/SalesChart'));\n"
        );
    }

    #[test]
    fn sanitizes_request_body_in_routes() {
        let src = "const { name, email } = req.body;\n";
        let out = harden("backend/routes/users.js", src);
        assert!(out.starts_with("const validator = require('validator');\n"));
        assert!(out.contains("email: validator.escape(String(req.body.email ?? ''))"));
    }

    #[test]
    fn wraps_inner_html_once() {
        let src = "<div dangerouslySetInnerHTML={{__html: post.body}} />";
        let once = harden("src/Post.jsx", src);
        assert!(once.contains("DOMPurify.sanitize(post.body)"));
        assert_eq!(harden("src/Post.jsx", &once), once);
    }

    #[test]
    fn non_script_files_are_untouched() {
        let src = "async function x() { y(); }";
        assert_eq!(apply(OperationKind::AddErrorHandling, "notes.md", src), src);
    }

    #[test]
    fn test_stub_names_the_module() {
        assert!(test_stub("src/cart.js").starts_with("describe('cart',"));
    }
}
