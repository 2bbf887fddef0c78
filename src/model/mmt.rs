//! Loader for `.mmt`-style model descriptions.
//!
//! A description has a `[[model]]` header (metadata and initial state
//! values), any number of `[component]` sections, an optional `[[protocol]]`
//! table and an optional `[[script]]` block that is kept verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::expr::Expr;
use super::{Binding, Declaration, Model};
use crate::error::{Error, Result};
use crate::protocol::Protocol;

/// Free-form `[[script]]` text accompanying a model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Script(pub String);

impl Script {
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// Reads a model description from disk.
pub fn load(path: impl AsRef<Path>) -> Result<(Model, Protocol, Script)> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::from_io(path, e))?;
    parse(&text, path)
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Model,
    Component,
    Protocol,
    Script,
}

struct Reader<'a> {
    path: &'a Path,
    model_name: String,
    model_meta: BTreeMap<String, String>,
    initial: Vec<(usize, String, f64)>,
    decls: Vec<Declaration>,
    component: String,
    /// Declarations that may own indented lines: (indent, declaration index).
    scope: Vec<(usize, usize)>,
    protocol: Protocol,
    script: Vec<&'a str>,
}

/// Parses description text; `path` is only used for error messages.
pub fn parse(text: &str, path: &Path) -> Result<(Model, Protocol, Script)> {
    let mut reader = Reader {
        path,
        model_name: String::new(),
        model_meta: BTreeMap::new(),
        initial: Vec::new(),
        decls: Vec::new(),
        component: String::new(),
        scope: Vec::new(),
        protocol: Protocol::new(),
        script: Vec::new(),
    };
    let mut section = Section::Preamble;
    let mut seen_model = false;

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        if section == Section::Script && raw.trim() != "[[script]]" && !is_section_header(raw) {
            reader.script.push(raw);
            continue;
        }
        let line = strip_comment(raw);
        if line.trim().is_empty() {
            continue;
        }
        if is_section_header(line) {
            let header = line.trim();
            reader.scope.clear();
            section = match header {
                "[[model]]" => {
                    if seen_model {
                        return Err(reader.err(line_no, "duplicate [[model]] section"));
                    }
                    seen_model = true;
                    Section::Model
                }
                "[[protocol]]" => Section::Protocol,
                "[[script]]" => Section::Script,
                _ if header.starts_with("[[") => {
                    return Err(reader.err(line_no, format!("unknown section {header}")));
                }
                _ => {
                    let name = header[1..header.len() - 1].trim();
                    if !is_identifier(name) {
                        return Err(reader.err(line_no, format!("invalid component name {name:?}")));
                    }
                    if !seen_model {
                        return Err(reader.err(line_no, "component before [[model]] section"));
                    }
                    if reader.decls.iter().any(|d| d.component == name) {
                        return Err(reader.err(line_no, format!("duplicate component [{name}]")));
                    }
                    reader.component = name.to_string();
                    Section::Component
                }
            };
            continue;
        }
        match section {
            Section::Preamble => {
                return Err(reader.err(line_no, "expected [[model]] section"));
            }
            Section::Model => reader.model_line(line_no, line)?,
            Section::Component => reader.component_line(line_no, line)?,
            Section::Protocol => reader.protocol_line(line_no, line)?,
            Section::Script => unreachable!(),
        }
    }

    if !seen_model {
        return Err(reader.err(1, "missing [[model]] section"));
    }
    let Reader {
        path,
        model_name,
        model_meta,
        initial,
        decls,
        protocol,
        script,
        ..
    } = reader;
    let model = Model::build(model_name, model_meta, path, decls, &initial).map_err(|e| {
        Error::ModelDescription {
            path: path.to_path_buf(),
            line: e.line,
            message: e.message,
        }
    })?;
    debug!(
        model = model.name(),
        variables = model.slot_count(),
        states = model.state().len(),
        events = protocol.events().len(),
        "loaded model description"
    );
    Ok((model, protocol, Script(script.join("\n"))))
}

impl Reader<'_> {
    fn err(&self, line: usize, message: impl Into<String>) -> Error {
        Error::ModelDescription {
            path: PathBuf::from(self.path),
            line,
            message: message.into(),
        }
    }

    fn model_line(&mut self, line_no: usize, line: &str) -> Result<()> {
        if let Some((key, value)) = split_meta(line) {
            if key == "name" {
                self.model_name = value.to_string();
            } else {
                self.model_meta.insert(key.to_string(), value.to_string());
            }
            return Ok(());
        }
        let Some((lhs, rhs)) = split_assignment(line) else {
            return Err(self.err(line_no, format!("expected `name: value` or an initial value, found {:?}", line.trim())));
        };
        let value = Expr::parse(rhs)
            .ok()
            .and_then(|e| e.as_number())
            .ok_or_else(|| self.err(line_no, format!("initial value of {lhs} must be a number")))?;
        self.initial.push((line_no, lhs.to_string(), value));
        Ok(())
    }

    fn component_line(&mut self, line_no: usize, line: &str) -> Result<()> {
        let indent = line.len() - line.trim_start().len();
        let body = line.trim();
        while matches!(self.scope.last(), Some(&(ind, _)) if ind >= indent) {
            self.scope.pop();
        }
        let owner = self.scope.last().map(|&(_, i)| i);

        if let Some(owner) = owner {
            if let Some(rest) = body.strip_prefix("in ") {
                self.decls[owner].unit = Some(rest.trim().trim_matches(['[', ']']).to_string());
                return Ok(());
            }
            if let Some(rest) = body.strip_prefix("bind ") {
                let binding = Binding::from_name(rest.trim())
                    .ok_or_else(|| self.err(line_no, format!("unknown binding {:?}", rest.trim())))?;
                if self.decls.iter().any(|d| d.binding == Some(binding)) {
                    return Err(self.err(line_no, format!("binding {:?} used twice", rest.trim())));
                }
                self.decls[owner].binding = Some(binding);
                return Ok(());
            }
            if let Some(rest) = body.strip_prefix("label ") {
                self.decls[owner].label = Some(rest.trim().to_string());
                return Ok(());
            }
            if let Some((key, value)) = split_meta(body) {
                self.decls[owner].meta.insert(key.to_string(), value.to_string());
                return Ok(());
            }
        } else if indent > 0 {
            return Err(self.err(line_no, "indented line without an owning variable"));
        } else if let Some((key, _)) = split_meta(body) {
            debug!(component = %self.component, key, "ignoring component annotation");
            return Ok(());
        }

        let Some((lhs, rhs)) = split_assignment(body) else {
            return Err(self.err(line_no, format!("cannot parse {body:?}")));
        };
        let (name, is_state) = match lhs
            .strip_prefix("dot(")
            .and_then(|r| r.strip_suffix(')'))
        {
            Some(inner) => (inner.trim(), true),
            None => (lhs, false),
        };
        if !is_identifier(name) || name.contains('.') {
            return Err(self.err(line_no, format!("invalid variable name {name:?}")));
        }
        if is_state && owner.is_some() {
            return Err(self.err(line_no, format!("nested variable {name} cannot be a state")));
        }
        let rhs = Expr::parse(rhs).map_err(|m| self.err(line_no, m))?;
        self.decls.push(Declaration {
            line: line_no,
            component: self.component.clone(),
            name: name.to_string(),
            parent: owner,
            is_state,
            rhs,
            binding: None,
            unit: None,
            label: None,
            meta: BTreeMap::new(),
        });
        self.scope.push((indent, self.decls.len() - 1));
        Ok(())
    }

    fn protocol_line(&mut self, line_no: usize, line: &str) -> Result<()> {
        let fields: Vec<f64> = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| self.err(line_no, format!("non-numeric protocol row {:?}", line.trim())))?;
        let (level, start, duration, period, multiplier) = match fields.as_slice() {
            [l, s, d, p] => (*l, *s, *d, *p, 0.0),
            [l, s, d, p, m] => (*l, *s, *d, *p, *m),
            _ => {
                return Err(self.err(
                    line_no,
                    "protocol rows need: level start duration period [multiplier]",
                ));
            }
        };
        if multiplier < 0.0 || multiplier.fract() != 0.0 {
            return Err(self.err(line_no, "protocol multiplier must be a non-negative integer"));
        }
        self.protocol
            .schedule(level, start, duration, period, multiplier as u32)
            .map_err(|e| self.err(line_no, e.to_string()))
    }
}

fn is_section_header(line: &str) -> bool {
    let t = line.trim_end();
    !t.starts_with(char::is_whitespace) && t.starts_with('[') && t.ends_with(']')
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

/// `key: value`, where the key is a plain identifier.
fn split_meta(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    (is_identifier(key) && !key.contains('.')).then(|| (key, value.trim()))
}

/// `lhs = rhs` on the first `=` that is not part of a comparison operator.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'=' {
            continue;
        }
        let prev = i.checked_sub(1).map(|j| bytes[j]);
        let next = bytes.get(i + 1).copied();
        if matches!(prev, Some(b'<' | b'>' | b'!' | b'=')) || next == Some(b'=') {
            continue;
        }
        let lhs = line[..i].trim();
        return (!lhs.is_empty()).then(|| (lhs, line[i + 1..].trim()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
[[model]]
name: toy
author: nobody
# initial values
cell.V = -80
cell.h = 1

[engine]
time = 0 [ms]
    in [ms]
    bind time
pace = 0
    bind pace

[cell]
dot(V) = -(V - E) / tau + stim
    in [mV]
    oxmeta: membrane_voltage
    E = -80
    stim = engine.pace * 10
tau = 5 [ms]
    oxmeta: time_constant
dot(h) = if(V > -60, -h, 1 - h)  # inline comment
g = 0.5
    scale = 1
        oxmeta: nested_tag

[[protocol]]
# level start duration period multiplier
1 10 2 1000 0

[[script]]
import myokit
# kept verbatim
";

    #[test]
    fn parses_components_nesting_and_metadata() {
        let (model, protocol, script) = parse(SOURCE, Path::new("toy.mmt")).unwrap();
        assert_eq!(model.name(), "toy");
        assert_eq!(model.meta("author"), Some("nobody"));
        assert_eq!(model.state(), &[-80.0, 1.0]);
        assert_eq!(model.state_names().collect::<Vec<_>>(), vec!["cell.V", "cell.h"]);
        assert_eq!(model.get("cell.V").unwrap().unit(), Some("mV"));
        assert!(model.get("cell.V.E").unwrap().is_nested());
        assert!(model.get("cell.g.scale").is_some());
        assert_eq!(model.find_by_tag("membrane_voltage", false).unwrap(), "cell.V");
        assert!(model.find_by_tag("nested_tag", false).is_err());
        assert_eq!(model.find_by_tag("nested_tag", true).unwrap(), "cell.g.scale");
        assert_eq!(model.bound_variable(Binding::Time).unwrap().qname(), "engine.time");
        assert_eq!(model.eval("cell.tau").unwrap(), 5.0);

        assert_eq!(protocol.events().len(), 1);
        assert_eq!(protocol.head().unwrap().start, 10.0);
        assert!(script.0.contains("# kept verbatim"));
    }

    #[test]
    fn derivative_uses_nested_and_bound_values() {
        let (model, _, _) = parse(SOURCE, Path::new("toy.mmt")).unwrap();
        let mut values = model.slots();
        model.evaluate(0.0, 1.0, &[-80.0, 1.0], &mut values);
        let mut dy = [0.0; 2];
        model.derivatives(&values, &mut dy);
        assert_eq!(dy[0], 10.0);
        assert_eq!(dy[1], 0.0);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let src = "[[model]]\ncell.x = 1\n[cell]\ndot(x) = -y\n";
        match parse(src, Path::new("bad.mmt")) {
            Err(Error::ModelDescription { line, message, .. }) => {
                assert_eq!(line, 4);
                assert!(message.contains("unknown variable y"), "{message}");
            }
            other => panic!("expected description error, got {other:?}"),
        }

        let src = "[[model]]\n[cell]\nx = 1 +\n";
        assert!(matches!(
            parse(src, Path::new("bad.mmt")),
            Err(Error::ModelDescription { line: 3, .. })
        ));

        let src = "[cell]\nx = 1\n";
        assert!(parse(src, Path::new("bad.mmt")).is_err());
    }

    #[test]
    fn missing_file_is_resource_not_found() {
        let err = load("/definitely/not/here.mmt").unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound { .. }));
    }

    #[test]
    fn assignment_split_ignores_comparisons() {
        assert_eq!(split_assignment("a = if(b >= 1, 2, 3)"), Some(("a", "if(b >= 1, 2, 3)")));
        assert_eq!(split_assignment("dot(x) = x == 1"), Some(("dot(x)", "x == 1")));
        assert_eq!(split_assignment("no assignment"), None);
    }
}
