use gantry_core::{FileUri, Position, Range};
use gantry_workspace::{ParseError, ParseMode, ParsedFile, Parser, Symbol, SymbolKind};

/// A line-oriented parser that understands just enough Go to drive the workspace engine:
/// the package clause, imports, build and embed directives, and top-level declarations.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeParser;

impl Parser for FakeParser {
    fn parse(&self, uri: &FileUri, src: &[u8], mode: ParseMode) -> Result<ParsedFile, ParseError> {
        let text = std::str::from_utf8(src).map_err(|_| ParseError::InvalidUtf8 { uri: uri.clone() })?;
        let mut parsed = ParsedFile::new(uri.clone(), mode);
        let mut in_import_block = false;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();

            if let Some(constraint) = line.strip_prefix("//go:build") {
                parsed.build_constraints.push(format!("//go:build{constraint}"));
                continue;
            }
            if line.starts_with("//go:embed") {
                if mode == ParseMode::Full {
                    parsed.embeds.push(line.to_owned());
                }
                continue;
            }
            if line.is_empty() || line.starts_with("//") {
                continue;
            }

            if in_import_block {
                if line == ")" {
                    in_import_block = false;
                } else if let Some(path) = import_spec(line) {
                    parsed.imports.push(path);
                }
                continue;
            }

            if let Some(name) = line.strip_prefix("package ") {
                if parsed.package_name.is_none() {
                    parsed.package_name = name.split_whitespace().next().map(str::to_owned);
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("import") {
                let rest = rest.trim();
                if rest == "(" {
                    in_import_block = true;
                } else if let Some(path) = import_spec(rest) {
                    parsed.imports.push(path);
                }
                continue;
            }

            if mode == ParseMode::Full && !raw.starts_with(char::is_whitespace) {
                if let Some(symbol) = declaration(line, line_no) {
                    parsed.symbols.push(symbol);
                }
            }
        }

        if parsed.package_name.is_none() {
            parsed.parse_error = Some("expected 'package', found EOF".to_owned());
        } else if in_import_block {
            parsed.parse_error = Some("unterminated import block".to_owned());
        }
        Ok(parsed)
    }
}

/// `"path"` or `alias "path"`.
fn import_spec(spec: &str) -> Option<String> {
    let start = spec.find('"')?;
    let rest = &spec[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_owned())
}

fn declaration(line: &str, line_no: usize) -> Option<Symbol> {
    let (keyword, rest) = line.split_once(char::is_whitespace)?;
    let (kind, name) = match keyword {
        "func" => {
            let rest = rest.trim_start();
            if let Some(receiver) = rest.strip_prefix('(') {
                let (recv, after) = receiver.split_once(')')?;
                let recv_type = recv.split_whitespace().last()?.trim_start_matches('*');
                let method = identifier(after.trim_start())?;
                (SymbolKind::Method, format!("{recv_type}.{method}"))
            } else {
                (SymbolKind::Func, identifier(rest)?.to_owned())
            }
        }
        "type" => (SymbolKind::Type, identifier(rest.trim_start())?.to_owned()),
        "var" => (SymbolKind::Var, identifier(rest.trim_start())?.to_owned()),
        "const" => (SymbolKind::Const, identifier(rest.trim_start())?.to_owned()),
        _ => return None,
    };
    let line = u32::try_from(line_no).unwrap_or(u32::MAX);
    let width = u32::try_from(name.len()).unwrap_or(u32::MAX);
    Some(Symbol {
        name,
        kind,
        range: Range::new(Position::new(line, 0), Position::new(line, width)),
    })
}

fn identifier(text: &str) -> Option<&str> {
    let end = text
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    (end > 0).then(|| &text[..end])
}
