//! Branch descriptor parsing
//!
//! The mount argument names exactly two branches:
//!
//! ```text
//! BRANCH1[=RW|RO]:BRANCH2[=RW|RO]
//! ```
//!
//! Paths must be absolute. A backslash escapes the following character so a
//! path may contain `:` or `=`. When a branch carries no type it is derived
//! from the other one; a mount always ends up with one read-write and one
//! read-only branch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Separates the two branches
pub const BRANCH_SEPARATOR: char = ':';

/// Separates a branch path from its type tag
pub const TYPE_SEPARATOR: char = '=';

const ESCAPE: char = '\\';

/// Role of a branch in the union
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchRole {
    /// Receives every modification
    ReadWrite,
    /// Never modified through the union
    ReadOnly,
}

impl BranchRole {
    /// Tag used in the mount argument
    pub fn tag(self) -> &'static str {
        match self {
            BranchRole::ReadWrite => "RW",
            BranchRole::ReadOnly => "RO",
        }
    }

    /// Parse a type tag. Tags are case-sensitive and exactly two characters.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "RW" => Some(BranchRole::ReadWrite),
            "RO" => Some(BranchRole::ReadOnly),
            _ => None,
        }
    }

    /// The other role
    pub fn opposite(self) -> Self {
        match self {
            BranchRole::ReadWrite => BranchRole::ReadOnly,
            BranchRole::ReadOnly => BranchRole::ReadWrite,
        }
    }
}

impl fmt::Display for BranchRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchRole::ReadWrite => f.write_str("read-write"),
            BranchRole::ReadOnly => f.write_str("read-only"),
        }
    }
}

/// Position of a clause in the mount argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    First,
    Second,
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::First => f.write_str("first branch"),
            Clause::Second => f.write_str("second branch"),
        }
    }
}

/// Errors produced while parsing the mount argument
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BranchError {
    #[error("missing second branch (no ':' separator)")]
    MissingSecondBranch,

    #[error("only two branches are supported")]
    TooManyBranches,

    #[error("{clause}: relative path '{path}' is forbidden")]
    RelativePath { clause: Clause, path: String },

    #[error("{clause}: empty path")]
    EmptyPath { clause: Clause },

    #[error("{clause}: unrecognized branch type '{tag}'")]
    UnknownBranchType { clause: Clause, tag: String },

    #[error("attempted to provide two {0} branches")]
    DuplicateRole(BranchRole),

    #[error("no read-write branch provided")]
    NoReadWriteBranch,

    #[error("{0} branch missing")]
    BranchMissing(BranchRole),
}

/// One resolved branch of the mount argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub role: BranchRole,
    /// Absolute path without trailing separator
    pub path: PathBuf,
}

impl BranchSpec {
    pub fn new(role: BranchRole, path: impl Into<PathBuf>) -> Self {
        Self {
            role,
            path: path.into(),
        }
    }
}

/// The two-branch configuration of one mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    pub rw: BranchSpec,
    pub ro: BranchSpec,
}

impl MountDescriptor {
    /// Parse a raw mount argument
    pub fn parse(raw: &str) -> Result<Self, BranchError> {
        let [first, second] = scan(raw)?;

        let path1 = make_path(Clause::First, &first.path)?;
        let tag1 = parse_tag(Clause::First, first.tag.as_deref())?;
        let path2 = make_path(Clause::Second, &second.path)?;
        let tag2 = parse_tag(Clause::Second, second.tag.as_deref())?;

        let (role1, role2) = assign_roles(tag1, tag2)?;

        let mut rw = None;
        let mut ro = None;
        for spec in [BranchSpec::new(role1, path1), BranchSpec::new(role2, path2)] {
            let slot = match spec.role {
                BranchRole::ReadWrite => &mut rw,
                BranchRole::ReadOnly => &mut ro,
            };
            if slot.is_some() {
                return Err(BranchError::DuplicateRole(spec.role));
            }
            *slot = Some(spec);
        }

        Ok(Self {
            rw: rw.ok_or(BranchError::BranchMissing(BranchRole::ReadWrite))?,
            ro: ro.ok_or(BranchError::BranchMissing(BranchRole::ReadOnly))?,
        })
    }

    /// Branch playing the given role
    pub fn branch(&self, role: BranchRole) -> &BranchSpec {
        match role {
            BranchRole::ReadWrite => &self.rw,
            BranchRole::ReadOnly => &self.ro,
        }
    }
}

impl FromStr for MountDescriptor {
    type Err = BranchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MountDescriptor {
    /// Canonical, fully tagged form (`rw=RW:ro=RO`)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}:{}={}",
            escape(&self.rw.path),
            self.rw.role.tag(),
            escape(&self.ro.path),
            self.ro.role.tag()
        )
    }
}

/// Scanner state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Branch1,
    Type1,
    Branch2,
    Type2,
}

impl State {
    fn clause(self) -> usize {
        match self {
            State::Branch1 | State::Type1 => 0,
            State::Branch2 | State::Type2 => 1,
        }
    }
}

/// A clause as written, before validation
#[derive(Debug, Default)]
struct RawClause {
    path: String,
    tag: Option<String>,
}

fn scan(raw: &str) -> Result<[RawClause; 2], BranchError> {
    let mut clauses = [RawClause::default(), RawClause::default()];
    let mut state = State::Branch1;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        let clause = &mut clauses[state.clause()];
        state = match (state, c) {
            (State::Branch1 | State::Branch2, ESCAPE) => {
                // A trailing backslash is kept literally
                clause.path.push(chars.next().unwrap_or(ESCAPE));
                state
            }
            (State::Branch1 | State::Type1, BRANCH_SEPARATOR) => State::Branch2,
            (State::Branch2 | State::Type2, BRANCH_SEPARATOR) => {
                return Err(BranchError::TooManyBranches)
            }
            (State::Branch1, TYPE_SEPARATOR) => {
                clause.tag = Some(String::new());
                State::Type1
            }
            (State::Branch2, TYPE_SEPARATOR) => {
                clause.tag = Some(String::new());
                State::Type2
            }
            (State::Branch1 | State::Branch2, c) => {
                clause.path.push(c);
                state
            }
            (State::Type1 | State::Type2, c) => {
                clause.tag.get_or_insert_with(String::new).push(c);
                state
            }
        };
    }

    if state.clause() == 0 {
        return Err(BranchError::MissingSecondBranch);
    }

    Ok(clauses)
}

fn make_path(clause: Clause, raw: &str) -> Result<PathBuf, BranchError> {
    if raw.is_empty() {
        return Err(BranchError::EmptyPath { clause });
    }

    if !raw.starts_with('/') {
        return Err(BranchError::RelativePath {
            clause,
            path: raw.to_string(),
        });
    }

    // Strip one trailing separator, but keep "/" itself
    let trimmed = match raw.strip_suffix('/') {
        Some(rest) if !rest.is_empty() => rest,
        _ => raw,
    };

    Ok(PathBuf::from(trimmed))
}

fn parse_tag(clause: Clause, tag: Option<&str>) -> Result<Option<BranchRole>, BranchError> {
    match tag {
        None => Ok(None),
        Some(tag) => BranchRole::from_tag(tag)
            .map(Some)
            .ok_or_else(|| BranchError::UnknownBranchType {
                clause,
                tag: tag.to_string(),
            }),
    }
}

/// Role truth table for (first tag, second tag).
///
/// An untyped first branch is read-only; an untyped second branch takes the
/// role the first one left free. A read-only branch can never yield the
/// read-write one, so any combination with no RW branch is rejected before
/// a role is assigned.
fn assign_roles(
    first: Option<BranchRole>,
    second: Option<BranchRole>,
) -> Result<(BranchRole, BranchRole), BranchError> {
    use BranchRole::{ReadOnly, ReadWrite};

    match (first, second) {
        (None, None) | (None, Some(ReadWrite)) => Ok((ReadOnly, ReadWrite)),
        (Some(ReadWrite), None) | (Some(ReadWrite), Some(ReadOnly)) => Ok((ReadWrite, ReadOnly)),
        (Some(ReadOnly), Some(ReadWrite)) => Ok((ReadOnly, ReadWrite)),
        (Some(ReadWrite), Some(ReadWrite)) => Err(BranchError::DuplicateRole(ReadWrite)),
        (Some(ReadOnly), None) | (None, Some(ReadOnly)) | (Some(ReadOnly), Some(ReadOnly)) => {
            Err(BranchError::NoReadWriteBranch)
        }
    }
}

fn escape(path: &Path) -> String {
    let mut out = String::new();
    for c in path.to_string_lossy().chars() {
        if matches!(c, BRANCH_SEPARATOR | TYPE_SEPARATOR | ESCAPE) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}
