//! Line-oriented seed script grammar.
//!
//! Shared by hand-written migration scripts and generated snapshot
//! artifacts. One statement per line:
//!
//! ```text
//! # comment
//! register User exclude password_digest, token
//! unregister AuditLog
//! transaction do | up do | down do
//!   User.create({"id":1,"username":"bob"})
//!   User.create!({"id":2,"username":"amy"})
//!   User.delete({"username":"bob"})
//!   reset_sequence("users")
//! end
//! bootstrap("20240101120000") | bootstrap(null)
//! ```
//!
//! JSON arguments must fit on one line. Blocks do not nest.

use anyhow::{anyhow, bail, Context, Result};
use seedline_db::{Record, Version};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Transaction,
    Up,
    Down,
}

impl BlockKind {
    pub fn keyword(self) -> &'static str {
        match self {
            BlockKind::Transaction => "transaction",
            BlockKind::Up => "up",
            BlockKind::Down => "down",
        }
    }

    fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "transaction" => Some(BlockKind::Transaction),
            "up" => Some(BlockKind::Up),
            "down" => Some(BlockKind::Down),
            _ => None,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Register {
        entity: String,
        exclude: Vec<String>,
    },
    Unregister {
        entity: String,
    },
    Create {
        entity: String,
        record: Record,
        /// `create!`: fail instead of skipping an existing key.
        strict: bool,
    },
    Delete {
        entity: String,
        filter: Record,
    },
    ResetSequence {
        table: String,
    },
    Bootstrap {
        version: Option<Version>,
    },
    Open(BlockKind),
    End,
}

/// A statement with its 1-based source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub line: usize,
    pub stmt: Statement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptBlock {
    pub kind: BlockKind,
    pub line: usize,
    pub body: Vec<Spanned>,
}

/// A parsed script: statements outside any block, plus the blocks in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub top_level: Vec<Spanned>,
    pub blocks: Vec<ScriptBlock>,
}

impl Script {
    pub fn block(&self, kind: BlockKind) -> Option<&ScriptBlock> {
        self.blocks.iter().find(|b| b.kind == kind)
    }
}

/// Parse a whole script strictly: any malformed line is an error.
pub fn parse_script(text: &str) -> Result<Script> {
    let mut script = Script::default();
    let mut open: Option<ScriptBlock> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let Some(stmt) = parse_line(raw).with_context(|| format!("line {line}"))? else {
            continue;
        };

        match stmt {
            Statement::Open(kind) => {
                if let Some(outer) = &open {
                    bail!(
                        "line {line}: `{kind} do` inside `{} do` (opened at line {}); blocks do not nest",
                        outer.kind,
                        outer.line
                    );
                }
                if script.block(kind).is_some() {
                    bail!("line {line}: duplicate `{kind}` block");
                }
                open = Some(ScriptBlock {
                    kind,
                    line,
                    body: Vec::new(),
                });
            }
            Statement::End => match open.take() {
                Some(block) => script.blocks.push(block),
                None => bail!("line {line}: `end` without an open block"),
            },
            stmt => {
                let spanned = Spanned { line, stmt };
                match open.as_mut() {
                    Some(block) => block.body.push(spanned),
                    None => script.top_level.push(spanned),
                }
            }
        }
    }

    if let Some(block) = open {
        bail!("`{} do` opened at line {} is never closed", block.kind, block.line);
    }
    Ok(script)
}

/// Parse one line. `Ok(None)` for blank lines and comments.
pub fn parse_line(raw: &str) -> Result<Option<Statement>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if line == "end" {
        return Ok(Some(Statement::End));
    }
    if let Some(head) = line.strip_suffix(" do") {
        let kind = BlockKind::from_keyword(head.trim())
            .ok_or_else(|| anyhow!("unknown block `{}`", head.trim()))?;
        return Ok(Some(Statement::Open(kind)));
    }
    if let Some(rest) = line.strip_prefix("unregister ") {
        return Ok(Some(Statement::Unregister {
            entity: entity_name(rest.trim())?,
        }));
    }
    if let Some(rest) = line.strip_prefix("register ") {
        return parse_register(rest).map(Some);
    }
    if let Some(arg) = call_argument(line, "reset_sequence") {
        let table = match serde_json::from_str::<Value>(arg)
            .with_context(|| format!("reset_sequence argument is not JSON: {arg}"))?
        {
            Value::String(s) if !s.is_empty() => s,
            other => bail!("reset_sequence expects a table name string, got {other}"),
        };
        return Ok(Some(Statement::ResetSequence { table }));
    }
    if let Some(arg) = call_argument(line, "bootstrap") {
        let version = match serde_json::from_str::<Value>(arg)
            .with_context(|| format!("bootstrap argument is not JSON: {arg}"))?
        {
            Value::Null => None,
            Value::String(s) => Some(Version::parse(&s)?),
            other => bail!("bootstrap expects a version string or null, got {other}"),
        };
        return Ok(Some(Statement::Bootstrap { version }));
    }

    parse_entity_call(line).map(Some)
}

fn parse_register(rest: &str) -> Result<Statement> {
    let rest = rest.trim();
    let (entity, exclude) = match rest.split_once(" exclude ") {
        Some((entity, fields)) => {
            let fields = fields
                .split(',')
                .map(|f| f.trim())
                .filter(|f| !f.is_empty())
                .map(|f| field_name(f))
                .collect::<Result<Vec<_>>>()?;
            (entity, fields)
        }
        None => (rest, Vec::new()),
    };
    Ok(Statement::Register {
        entity: entity_name(entity.trim())?,
        exclude,
    })
}

/// `Entity.create(..)`, `Entity.create!(..)`, `Entity.delete(..)`.
fn parse_entity_call(line: &str) -> Result<Statement> {
    let (entity, call) = line
        .split_once('.')
        .ok_or_else(|| anyhow!("unrecognized statement: {line}"))?;
    let entity = entity_name(entity)?;

    let open = call
        .find('(')
        .ok_or_else(|| anyhow!("missing `(` in: {line}"))?;
    let method = &call[..open];
    let arg = call[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| anyhow!("missing closing `)` in: {line}"))?;
    let record = object_argument(arg).with_context(|| format!("{entity}.{method}"))?;

    match method {
        "create" => Ok(Statement::Create {
            entity,
            record,
            strict: false,
        }),
        "create!" => Ok(Statement::Create {
            entity,
            record,
            strict: true,
        }),
        "delete" => Ok(Statement::Delete {
            entity,
            filter: record,
        }),
        other => bail!("unknown method `{other}` on {entity}"),
    }
}

fn call_argument<'a>(line: &'a str, func: &str) -> Option<&'a str> {
    line.strip_prefix(func)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn object_argument(arg: &str) -> Result<Record> {
    let v: Value = serde_json::from_str(arg.trim()).context("argument is not valid JSON")?;
    match v {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => bail!("expected a JSON object, got {other}"),
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn entity_name(s: &str) -> Result<String> {
    if !is_ident(s) {
        bail!("invalid entity name `{s}`");
    }
    Ok(s.to_string())
}

fn field_name(s: &str) -> Result<String> {
    if !is_ident(s) || s.contains(':') {
        bail!("invalid field name `{s}`");
    }
    Ok(s.to_string())
}
