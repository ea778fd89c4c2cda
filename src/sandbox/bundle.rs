//! Parsers for the two test bundle styles.
//!
//! Script style is line oriented:
//!
//! ```text
//! use tandem
//! test "adds" {
//!     assert.equal 4 4
//! }
//! ```
//!
//! Module style is a JSON document with `imports` and `tests`, each test holding
//! `op`-tagged steps. A bundle whose first significant line starts with `{` is
//! module style; the script parser reports that as [`ScriptError::ModuleStyle`]
//! before looking at anything else.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// A single action inside a test body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    Equal {
        expected: Value,
        actual: Value,
        message: Option<String>,
    },
    IsTrue {
        value: Value,
        message: Option<String>,
    },
    Fail {
        message: String,
    },
    Log {
        message: String,
    },
    Sleep {
        ms: u64,
    },
    Request {
        #[serde(default = "default_method")]
        method: String,
        path: String,
    },
    ExpectStatus {
        status: u16,
    },
    ExpectBody {
        contains: String,
    },
    ExpectJson {
        pointer: String,
        value: Value,
    },
    /// Compare a value in the backend manifest, addressed by JSON pointer.
    ExpectManifest {
        pointer: String,
        value: Value,
    },
    /// Compare one entry of the environment the backend server was launched with.
    ExpectEnv {
        key: String,
        value: String,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl Step {
    /// Steps that may run while the bundle itself is being evaluated.
    pub fn allowed_at_top_level(&self) -> bool {
        matches!(
            self,
            Step::Equal { .. } | Step::IsTrue { .. } | Step::Fail { .. } | Step::Log { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Use { specifier: String, line: usize },
    Test { name: String, steps: Vec<Step> },
    Step { step: Step, line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("bundle is written in module style")]
    ModuleStyle,
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDocument {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub tests: Vec<TestDecl>,
}

#[derive(Debug, Deserialize)]
pub struct TestDecl {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

pub fn parse_module(source: &str) -> Result<ModuleDocument, serde_json::Error> {
    serde_json::from_str(source)
}

pub fn parse_script(source: &str) -> Result<Vec<Statement>, ScriptError> {
    let mut statements = Vec::new();
    // (name, steps, opening line)
    let mut open: Option<(String, Vec<Step>, usize)> = None;
    let mut seen_significant = false;

    for (index, raw) in source.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !seen_significant {
            seen_significant = true;
            if line.starts_with('{') {
                return Err(ScriptError::ModuleStyle);
            }
        }

        let syntax = |message: String| ScriptError::Syntax {
            line: line_no,
            message,
        };
        let tokens = tokenize(line).map_err(syntax)?;

        if let [Token::Bare(brace)] = tokens.as_slice()
            && brace == "}"
        {
            match open.take() {
                Some((name, steps, _)) => statements.push(Statement::Test { name, steps }),
                None => return Err(syntax("unexpected `}`".into())),
            }
            continue;
        }

        let (keyword, args) = match tokens.split_first() {
            Some((keyword, args)) => (keyword.text(), args),
            None => continue,
        };

        match keyword {
            "test" => {
                if open.is_some() {
                    return Err(syntax("tests cannot be nested".into()));
                }
                match args {
                    [name] => statements.push(Statement::Test {
                        name: name.text().to_string(),
                        steps: Vec::new(),
                    }),
                    [name, Token::Bare(brace)] if brace == "{" => {
                        open = Some((name.text().to_string(), Vec::new(), line_no));
                    }
                    _ => return Err(syntax("expected `test <name>` or `test <name> {`".into())),
                }
            }
            "use" => {
                if open.is_some() {
                    return Err(syntax("`use` is only allowed at top level".into()));
                }
                match args {
                    [specifier] => statements.push(Statement::Use {
                        specifier: specifier.text().to_string(),
                        line: line_no,
                    }),
                    _ => return Err(syntax("expected `use <specifier>`".into())),
                }
            }
            _ => {
                let step = parse_step(keyword, args).map_err(syntax)?;
                match open.as_mut() {
                    Some((_, steps, _)) => steps.push(step),
                    None if step.allowed_at_top_level() => statements.push(Statement::Step {
                        step,
                        line: line_no,
                    }),
                    None => {
                        return Err(syntax(format!("`{keyword}` is only allowed inside a test")));
                    }
                }
            }
        }
    }

    if let Some((name, _, line)) = open {
        return Err(ScriptError::Syntax {
            line,
            message: format!("test \"{name}\" is never closed"),
        });
    }

    Ok(statements)
}

fn parse_step(keyword: &str, args: &[Token]) -> Result<Step, String> {
    let step = match (keyword, args) {
        ("assert.equal", [expected, actual]) => Step::Equal {
            expected: expected.value(),
            actual: actual.value(),
            message: None,
        },
        ("assert.equal", [expected, actual, message]) => Step::Equal {
            expected: expected.value(),
            actual: actual.value(),
            message: Some(message.text().to_string()),
        },
        ("assert.true" | "assert.isTrue", [value]) => Step::IsTrue {
            value: value.value(),
            message: None,
        },
        ("assert.true" | "assert.isTrue", [value, message]) => Step::IsTrue {
            value: value.value(),
            message: Some(message.text().to_string()),
        },
        ("assert.fail", []) => Step::Fail {
            message: "Assertion failed".into(),
        },
        ("assert.fail", rest) => Step::Fail {
            message: join_text(rest),
        },
        ("log", rest) => Step::Log {
            message: join_text(rest),
        },
        ("sleep", [ms]) => Step::Sleep {
            ms: ms
                .text()
                .parse()
                .map_err(|_| format!("invalid sleep duration `{}`", ms.text()))?,
        },
        ("request", [path]) => Step::Request {
            method: default_method(),
            path: path.text().to_string(),
        },
        ("request", [method, path]) => Step::Request {
            method: method.text().to_uppercase(),
            path: path.text().to_string(),
        },
        ("expect.status", [status]) => Step::ExpectStatus {
            status: status
                .text()
                .parse()
                .map_err(|_| format!("invalid status code `{}`", status.text()))?,
        },
        ("expect.body", rest) if !rest.is_empty() => Step::ExpectBody {
            contains: join_text(rest),
        },
        ("expect.json", [pointer, value]) => Step::ExpectJson {
            pointer: pointer.text().to_string(),
            value: value.value(),
        },
        ("expect.manifest", [pointer, value]) => Step::ExpectManifest {
            pointer: pointer.text().to_string(),
            value: value.value(),
        },
        ("expect.env", [key, value]) => Step::ExpectEnv {
            key: key.text().to_string(),
            value: value.text().to_string(),
        },
        (
            "assert.equal" | "assert.true" | "assert.isTrue" | "sleep" | "request"
            | "expect.status" | "expect.body" | "expect.json" | "expect.manifest"
            | "expect.env",
            _,
        ) => return Err(format!("wrong number of arguments for `{keyword}`")),
        _ => return Err(format!("unknown statement `{keyword}`")),
    };
    Ok(step)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Bare(String),
    Quoted(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::Bare(s) | Token::Quoted(s) => s,
        }
    }

    /// Quoted tokens are strings; bare tokens are JSON when they parse, strings otherwise.
    fn value(&self) -> Value {
        match self {
            Token::Quoted(s) => Value::String(s.clone()),
            Token::Bare(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        }
    }
}

fn join_text(tokens: &[Token]) -> String {
    tokens.iter().map(Token::text).collect::<Vec<_>>().join(" ")
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some(other) => value.push(other),
                        None => break,
                    },
                    other => value.push(other),
                }
            }
            if !closed {
                return Err("unterminated string".into());
            }
            tokens.push(Token::Quoted(value));
        } else {
            let mut value = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
            tokens.push(Token::Bare(value));
        }
    }

    Ok(tokens)
}
