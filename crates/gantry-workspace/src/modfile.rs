//! Parsers for module (`go.mod`) and workspace (`go.work`) manifests.
//!
//! Only the directives the workspace engine needs are interpreted; anything else is accepted and
//! ignored so that newer manifest syntax does not break loading.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ModFileError {
    pub line: usize,
    pub message: String,
}

impl ModFileError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Require {
    pub path: String,
    pub version: String,
    pub indirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replace {
    pub old_path: String,
    pub old_version: Option<String>,
    pub new_path: String,
    pub new_version: Option<String>,
}

impl Replace {
    /// Whether the replacement points at a directory rather than a module version.
    pub fn is_local(&self) -> bool {
        self.new_version.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModFile {
    pub module: Option<String>,
    pub go: Option<String>,
    pub toolchain: Option<String>,
    pub requires: Vec<Require>,
    pub replaces: Vec<Replace>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkFile {
    pub go: Option<String>,
    pub toolchain: Option<String>,
    /// Module directories, relative to the `go.work` directory unless absolute.
    pub uses: Vec<String>,
    pub replaces: Vec<Replace>,
}

struct Directive<'a> {
    line: usize,
    verb: &'a str,
    args: Vec<&'a str>,
    comment: &'a str,
}

pub fn parse_mod(text: &str) -> Result<ModFile, ModFileError> {
    let mut file = ModFile::default();
    for directive in directives(text)? {
        match directive.verb {
            "module" => {
                let [path] = directive.args[..] else {
                    return Err(ModFileError::new(directive.line, "usage: module module/path"));
                };
                if file.module.is_some() {
                    return Err(ModFileError::new(directive.line, "repeated module statement"));
                }
                file.module = Some(path.to_owned());
            }
            "go" => file.go = Some(single_arg(&directive)?.to_owned()),
            "toolchain" => file.toolchain = Some(single_arg(&directive)?.to_owned()),
            "require" => {
                let [path, version] = directive.args[..] else {
                    return Err(ModFileError::new(directive.line, "usage: require module/path v1.2.3"));
                };
                file.requires.push(Require {
                    path: path.to_owned(),
                    version: version.to_owned(),
                    indirect: directive.comment.split_whitespace().next() == Some("indirect"),
                });
            }
            "replace" => file.replaces.push(replace(&directive)?),
            _ => {}
        }
    }
    Ok(file)
}

pub fn parse_work(text: &str) -> Result<WorkFile, ModFileError> {
    let mut file = WorkFile::default();
    for directive in directives(text)? {
        match directive.verb {
            "go" => file.go = Some(single_arg(&directive)?.to_owned()),
            "toolchain" => file.toolchain = Some(single_arg(&directive)?.to_owned()),
            "use" => file.uses.push(single_arg(&directive)?.to_owned()),
            "replace" => file.replaces.push(replace(&directive)?),
            _ => {}
        }
    }
    Ok(file)
}

fn single_arg<'a>(directive: &Directive<'a>) -> Result<&'a str, ModFileError> {
    match directive.args[..] {
        [arg] => Ok(arg),
        _ => Err(ModFileError::new(
            directive.line,
            format!("{} expects exactly one argument", directive.verb),
        )),
    }
}

fn replace(directive: &Directive<'_>) -> Result<Replace, ModFileError> {
    let arrow = directive
        .args
        .iter()
        .position(|arg| *arg == "=>")
        .ok_or_else(|| ModFileError::new(directive.line, "replace is missing =>"))?;
    let (old, new) = (&directive.args[..arrow], &directive.args[arrow + 1..]);
    let (old_path, old_version) = match old {
        [path] => (*path, None),
        [path, version] => (*path, Some((*version).to_owned())),
        _ => return Err(ModFileError::new(directive.line, "invalid replace source")),
    };
    let (new_path, new_version) = match new {
        [path] => (*path, None),
        [path, version] => (*path, Some((*version).to_owned())),
        _ => return Err(ModFileError::new(directive.line, "invalid replace target")),
    };
    Ok(Replace {
        old_path: old_path.to_owned(),
        old_version,
        new_path: new_path.to_owned(),
        new_version,
    })
}

/// Splits `text` into directives, flattening `verb ( ... )` blocks into one directive per line.
fn directives(text: &str) -> Result<Vec<Directive<'_>>, ModFileError> {
    let mut out = Vec::new();
    let mut block: Option<(&str, usize)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let (code, comment) = match raw.find("//") {
            Some(pos) => (&raw[..pos], raw[pos + 2..].trim()),
            None => (raw, ""),
        };
        let mut tokens: Vec<&str> = code.split_whitespace().map(unquote).collect();
        if tokens.is_empty() {
            continue;
        }

        if let Some((verb, _)) = block {
            if tokens == [")"] {
                block = None;
                continue;
            }
            out.push(Directive {
                line,
                verb,
                args: tokens,
                comment,
            });
            continue;
        }

        let verb = tokens.remove(0);
        if tokens == ["("] {
            block = Some((verb, line));
            continue;
        }
        out.push(Directive {
            line,
            verb,
            args: tokens,
            comment,
        });
    }

    match block {
        Some((verb, line)) => Err(ModFileError::new(line, format!("unterminated {verb} block"))),
        None => Ok(out),
    }
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| token.strip_prefix('`').and_then(|rest| rest.strip_suffix('`')))
        .unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn parses_module_files() {
        let file = parse_mod(
            r#"
// A module.
module example.com/app

go 1.22
toolchain go1.22.1

require (
    example.com/lib v1.2.3
    example.com/other v0.1.0 // indirect
)
require "example.com/quoted" v2.0.0

replace example.com/lib => ../lib
replace example.com/other v0.1.0 => example.com/fork v0.1.1
exclude example.com/bad v1.0.0
"#,
        )
        .unwrap();

        assert_eq!(file.module.as_deref(), Some("example.com/app"));
        assert_eq!(file.go.as_deref(), Some("1.22"));
        assert_eq!(file.toolchain.as_deref(), Some("go1.22.1"));
        assert_eq!(
            file.requires,
            vec![
                Require {
                    path: "example.com/lib".into(),
                    version: "v1.2.3".into(),
                    indirect: false,
                },
                Require {
                    path: "example.com/other".into(),
                    version: "v0.1.0".into(),
                    indirect: true,
                },
                Require {
                    path: "example.com/quoted".into(),
                    version: "v2.0.0".into(),
                    indirect: false,
                },
            ]
        );
        assert_eq!(file.replaces.len(), 2);
        assert!(file.replaces[0].is_local());
        assert_eq!(file.replaces[1].old_version.as_deref(), Some("v0.1.0"));
        assert_eq!(file.replaces[1].new_path, "example.com/fork");
    }

    #[test]
    fn parses_workspace_files() {
        let file = parse_work("go 1.22\n\nuse (\n\t./a\n\t./b // tools\n)\nuse ./c\n").unwrap();
        assert_eq!(file.uses, vec!["./a", "./b", "./c"]);
        assert_eq!(file.go.as_deref(), Some("1.22"));
    }

    #[test]
    fn reports_malformed_manifests() {
        assert_eq!(
            parse_mod("module a\nmodule b\n").unwrap_err(),
            ModFileError::new(2, "repeated module statement")
        );
        assert_eq!(parse_mod("require (\n a v1\n").unwrap_err().line, 1);
        assert!(parse_mod("replace a b\n").is_err());
        assert!(parse_work("use a b\n").is_err());
    }
}
