//! Static inspection of a package's shipped code.
//!
//! Two passes:
//! - a line-by-line regex denylist over source files shipped alongside the
//!   module, for constructs no sandboxed plugin should need
//! - a structural pass over the compiled entry module's import section,
//!   which is the authoritative list of everything the module can reach

use regex::Regex;
use std::sync::LazyLock;
use wasmtime::{Engine, ExternType, Module};

use bastion_core::{Issue, IssueCode};
use bastion_permissions::catalog::{self, CapabilityClass};

use crate::sandbox::namespace::{self, HOST_MODULE};

/// Extensions of shipped source files that are scanned.
pub const SOURCE_EXTENSIONS: &[&str] = &["rs", "js", "mjs", "ts", "py", "lua", "c", "h", "go"];

struct Rule {
    name: &'static str,
    pattern: Regex,
    /// Requesting a permission of this class makes a hit acceptable.
    class: Option<CapabilityClass>,
}

fn rule(name: &'static str, pattern: &str, class: Option<CapabilityClass>) -> Rule {
    Rule {
        name,
        pattern: Regex::new(pattern).expect("invalid regex"),
        class,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // Dynamic code evaluation
        rule("eval", r"\beval\s*\(", None),
        rule("exec", r"\bexec\s*\(", None),
        rule("function constructor", r"(?:^|[^\w.:])(?:new\s+)?Function\s*\(", None),
        rule("string timer", r"\b(setTimeout|setInterval)\s*\(\s*['\x22`]", None),
        rule("loadstring", r"\bload(string)?\s*\(\s*['\x22]", None),
        rule("compile", r"\bcompile\s*\([^)]*['\x22]exec['\x22]", None),
        // Dynamic import / loading
        rule("dynamic import", r"\bimport\s*\(", None),
        rule("__import__", r"\b__import__\s*\(", None),
        rule("importlib", r"\bimportlib\b", None),
        rule("dlopen", r"\bdlopen\s*\(", None),
        rule("require expression", r"\brequire\s*\(\s*[^'\x22\s)]", None),
        // Reflective double-underscore access
        rule("dunder attribute", r"\.__[a-zA-Z]+__\b", None),
        rule("reflection builtin", r"\b(getattr|setattr|delattr|globals|vars)\s*\(", None),
        rule("builtins table", r"\b__(builtins|globals)__\b", None),
        rule("prototype access", r"\b__proto__\b|\bconstructor\s*\.\s*constructor\b", None),
        // Raw process / OS access
        rule("process spawn", r"\b(subprocess|child_process|Command::new|os\.system|os\.popen|popen|execve?|fork)\b", Some(CapabilityClass::Process)),
        rule("system call", r"(?:^|[^\w.])system\s*\(", Some(CapabilityClass::Process)),
        rule("os import", r"\bfrom\s+os\s+import\b.*\b(system|popen|exec\w*|spawn\w*)\b", Some(CapabilityClass::Process)),
        rule("os.execute", r"\bos\.(execute|exit)\b", Some(CapabilityClass::Process)),
        rule("std::process", r"\bstd::process\b", Some(CapabilityClass::Process)),
        // Raw sockets
        rule("raw socket", r"\b(socket\.socket|net\.createConnection|net\.Socket|TcpStream|UdpSocket|TcpListener|net\.Dial)\b", Some(CapabilityClass::Socket)),
        rule("socket syscall", r"\bsocket\s*\(\s*(AF_INET|AF_INET6|AF_UNIX|PF_INET)", Some(CapabilityClass::Socket)),
    ]
});

/// Whether a file with this extension is scanned as source.
pub fn is_source_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

/// Scan one source file. `label` is the package-relative path used as the
/// issue subject.
pub fn scan_source(label: &str, text: &str, requested: &[String]) -> Vec<Issue> {
    let mut issues = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        for r in RULES.iter() {
            if !r.pattern.is_match(line) {
                continue;
            }
            if r.class.is_some_and(|c| catalog::requests_class(requested, c)) {
                continue;
            }
            let reason = match r.class {
                Some(CapabilityClass::Process) => " (requires 'process.spawn')",
                Some(CapabilityClass::Socket) => " (requires 'network.socket')",
                _ => "",
            };
            issues.push(Issue::with_subject(
                IssueCode::DeniedConstruct,
                format!("{label}:{}", lineno + 1),
                format!("denied construct '{}'{reason}", r.name),
            ));
        }
    }
    issues
}

/// Engine used only to compile modules for inspection.
static INSPECT_ENGINE: LazyLock<Engine> = LazyLock::new(Engine::default);

/// Compile the entry module and check its imports against the host
/// namespace and the manifest's requested permissions.
pub fn inspect_module(label: &str, bytes: &[u8], requested: &[String]) -> Vec<Issue> {
    let module = match Module::new(&INSPECT_ENGINE, bytes) {
        Ok(m) => m,
        Err(e) => {
            return vec![Issue::with_subject(
                IssueCode::InvalidCode,
                label,
                format!("module does not compile: {e:#}"),
            )];
        }
    };

    let mut issues = Vec::new();
    for import in module.imports() {
        let qualified = format!("{}::{}", import.module(), import.name());

        if import.module() != HOST_MODULE {
            let message = if import.module().starts_with("wasi") {
                match wasi_kind(import.name()) {
                    Some(kind) => format!("WASI {kind} import '{qualified}' is not available to plugins"),
                    None => format!("WASI import '{qualified}' is not available to plugins"),
                }
            } else {
                format!("import '{qualified}' is outside the '{HOST_MODULE}' namespace")
            };
            issues.push(Issue::with_subject(IssueCode::DeniedImport, label, message));
            continue;
        }

        if !matches!(import.ty(), ExternType::Func(_)) {
            issues.push(Issue::with_subject(
                IssueCode::DeniedImport,
                label,
                format!("'{qualified}' must be imported as a function"),
            ));
            continue;
        }

        match namespace::required_permission(import.name()) {
            None => issues.push(Issue::with_subject(
                IssueCode::DeniedImport,
                label,
                format!("'{qualified}' is not a host function"),
            )),
            Some(None) => {}
            Some(Some(permission)) => {
                if !requested.iter().any(|p| p == permission) {
                    issues.push(Issue::with_subject(
                        IssueCode::UndeclaredPermission,
                        label,
                        format!("'{qualified}' requires permission '{permission}' which the manifest does not request"),
                    ));
                }
            }
        }
    }
    issues
}

fn wasi_kind(name: &str) -> Option<&'static str> {
    if name.starts_with("sock_") {
        Some("socket")
    } else if name.starts_with("proc_") {
        Some("process")
    } else if name.starts_with("path_") || name.starts_with("fd_") {
        Some("filesystem")
    } else {
        None
    }
}
