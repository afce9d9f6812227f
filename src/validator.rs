//! Static pre-execution scan of submitted code.
//!
//! The scan is advisory. String construction or attribute indirection can
//! reconstruct any denied call, so the isolation backend remains the actual
//! trust boundary. The validator only keeps the obvious cases from ever
//! reaching a backend.

use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ValidatorConfig};

/// Modules associated with filesystem, network, process and reflection access.
const DENIED_MODULES: &[&str] = &[
    // Filesystem
    "os",
    "shutil",
    "pathlib",
    "glob",
    "tempfile",
    "io",
    "fileinput",
    // Process and interpreter
    "sys",
    "subprocess",
    "multiprocessing",
    "threading",
    "_thread",
    "signal",
    "pty",
    "resource",
    "asyncio",
    // Network
    "socket",
    "ssl",
    "requests",
    "urllib",
    "urllib3",
    "http",
    "ftplib",
    "smtplib",
    "telnetlib",
    // Reflection and native code
    "ctypes",
    "cffi",
    "importlib",
    "inspect",
    "builtins",
    "gc",
    "code",
    "codeop",
    "pickle",
    "marshal",
    "shelve",
];

/// Dangerous call shapes, paired with the token reported on a match.
///
/// Builtins use `(?:^|[^.\w])` so method calls such as `re.compile(` or
/// `image.open(` do not match.
const DENIED_PATTERNS: &[(&str, &str)] = &[
    (r"(?:^|[^.\w])eval\s*\(", "eval("),
    (r"(?:^|[^.\w])exec\s*\(", "exec("),
    (r"(?:^|[^.\w])compile\s*\(", "compile("),
    (r"(?:^|[^.\w])open\s*\(", "open("),
    (r"__import__\s*\(", "__import__("),
    (r"(?:^|[^.\w])(?:globals|locals|vars)\s*\(", "globals("),
    (r"(?:^|[^.\w])(?:getattr|setattr|delattr)\s*\(", "getattr("),
    (r"__(?:builtins|subclasses|globals|bases|mro)__", "__builtins__"),
    (
        r"os\.(?:system|popen|fork|kill|remove|unlink|rmdir|exec\w*|spawn\w*)\s*\(",
        "os.system(",
    ),
    (r"subprocess\.\w+\s*\(", "subprocess("),
    (r"socket\.socket\s*\(", "socket.socket("),
    (r"threading\.Thread\s*\(", "threading.Thread("),
    (r"multiprocessing\.Process\s*\(", "multiprocessing.Process("),
];

/// Outcome of validating a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No denied construct was found.
    Accept,
    /// The first denied construct found, as a human-readable reason.
    Reject(String),
}

impl Verdict {
    /// Returns true if the code may proceed to a backend.
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Denylist validator with compiled patterns.
#[derive(Debug)]
pub struct Validator {
    denied_modules: BTreeSet<String>,
    patterns: Vec<(Regex, String)>,
    max_code_bytes: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default(), &EngineConfig::default())
    }
}

impl Validator {
    /// Build a validator from the built-in lists plus operator additions.
    pub fn new(config: &ValidatorConfig, engine: &EngineConfig) -> Self {
        let denied_modules = DENIED_MODULES
            .iter()
            .map(|m| (*m).to_string())
            .chain(config.extra_denied_modules.iter().cloned())
            .collect();

        let mut patterns: Vec<(Regex, String)> = DENIED_PATTERNS
            .iter()
            .filter_map(|(pattern, token)| compile(pattern).map(|re| (re, (*token).to_string())))
            .collect();

        for pattern in &config.extra_patterns {
            if let Some(re) = compile(pattern) {
                patterns.push((re, pattern.clone()));
            }
        }

        Self {
            denied_modules,
            patterns,
            max_code_bytes: engine.max_code_bytes,
        }
    }

    /// Scan `code`, short-circuiting on the first denied construct.
    ///
    /// Import statements are checked line by line first, then the whole text
    /// is matched against the call patterns.
    pub fn validate(&self, code: &str) -> Verdict {
        if code.trim().is_empty() {
            return Verdict::Reject("empty submission".to_string());
        }
        if code.len() > self.max_code_bytes {
            return Verdict::Reject(format!(
                "submission exceeds {} bytes",
                self.max_code_bytes
            ));
        }

        for module in import_statements(code) {
            let top_level = top_level(&module);
            if self.denied_modules.contains(top_level) {
                debug!("Denied import: {}", module);
                return Verdict::Reject(format!("denied import: {top_level}"));
            }
        }

        for (regex, token) in &self.patterns {
            if regex.is_match(code) {
                debug!("Denied pattern: {}", token);
                return Verdict::Reject(format!("denied call: {token}"));
            }
        }

        Verdict::Accept
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Failed to compile validator pattern '{}': {}", pattern, e);
            None
        }
    }
}

/// Top-level names of every module imported by `code`.
///
/// `import numpy.linalg as la` yields `numpy`; relative imports are skipped.
pub fn imported_modules(code: &str) -> BTreeSet<String> {
    import_statements(code)
        .iter()
        .map(|m| top_level(m).to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

fn top_level(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

/// Dotted module paths named by `import`/`from` statements, in source order.
fn import_statements(code: &str) -> Vec<String> {
    let mut modules = Vec::new();

    for line in code.lines() {
        for statement in simple_statements(line) {
            let statement = statement.trim();

            if let Some(rest) = after_keyword(statement, "import") {
                for part in rest.split(',') {
                    let name = part.split_whitespace().next().unwrap_or("");
                    if !name.is_empty() {
                        modules.push(name.to_string());
                    }
                }
            } else if let Some(rest) = after_keyword(statement, "from") {
                let name = rest.split_whitespace().next().unwrap_or("");
                if !name.is_empty() && !name.starts_with('.') {
                    modules.push(name.to_string());
                }
            }
        }
    }

    modules
}

/// Splits a line on `;` and on the `:` closing a compound statement header
/// (`if x: import m`), skipping bracketed text and string literals. Anything
/// after a `#` comment is dropped.
fn simple_statements(line: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '#' => {
                pieces.push(&line[start..i]);
                return pieces;
            }
            ';' | ':' if depth == 0 => {
                pieces.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    pieces.push(&line[start..]);
    pieces
}

/// Text after `keyword` when `statement` starts with it as a whole word.
fn after_keyword<'a>(statement: &'a str, keyword: &str) -> Option<&'a str> {
    statement
        .strip_prefix(keyword)
        .filter(|rest| rest.starts_with(char::is_whitespace))
}
