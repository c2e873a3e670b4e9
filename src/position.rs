//! JSON-Pointer-like addressing into a parsed workflow document.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single path segment: a reserved structural token, an integer index, or
/// a free-form task name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Token(&'static str),
    Index(usize),
    Name(String),
}

impl Segment {
    fn as_str(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Segment::Token(t) => std::borrow::Cow::Borrowed(t),
            Segment::Index(i) => std::borrow::Cow::Owned(i.to_string()),
            Segment::Name(n) => std::borrow::Cow::Borrowed(n),
        }
    }
}

/// Structural tokens that a name segment must never collide with.
pub const TOKENS: &[&str] = &[
    "do",
    "try",
    "catch",
    "fork",
    "branches",
    "with",
    "subscription",
    "foreach",
];

fn token(s: &str) -> Option<&'static str> {
    TOKENS.iter().find(|t| **t == s).copied()
}

/// An ordered sequence of [`Segment`]s addressing a node in the workflow AST.
///
/// `Position::root()` is the empty sequence, serializing to the empty
/// string `""` as its JSON Pointer form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Position(Vec<Segment>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("name segment '{0}' collides with a reserved token")]
    ReservedToken(String),
    #[error("name segment '{0}' must not contain '/'")]
    ContainsSlash(String),
    #[error("name segment '{0}' must not parse as an integer")]
    LooksLikeIndex(String),
}

impl Position {
    pub fn root() -> Self {
        Position(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child_token(&self, tok: &'static str) -> Self {
        let mut segs = self.0.clone();
        segs.push(Segment::Token(tok));
        Position(segs)
    }

    pub fn child_index(&self, idx: usize) -> Self {
        let mut segs = self.0.clone();
        segs.push(Segment::Index(idx));
        Position(segs)
    }

    pub fn child_name(&self, name: impl Into<String>) -> Result<Self, PositionError> {
        let name = name.into();
        if let Some(t) = token(&name) {
            return Err(PositionError::ReservedToken(t.to_string()));
        }
        if name.contains('/') {
            return Err(PositionError::ContainsSlash(name));
        }
        if name.parse::<i64>().is_ok() {
            return Err(PositionError::LooksLikeIndex(name));
        }
        let mut segs = self.0.clone();
        segs.push(Segment::Name(name));
        Ok(Position(segs))
    }

    pub fn parent(&self) -> Option<Position> {
        if self.0.is_empty() {
            None
        } else {
            Some(Position(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Parse a canonical JSON Pointer string back into a Position.
    ///
    /// Integer-looking segments become [`Segment::Index`], reserved tokens
    /// become [`Segment::Token`], everything else becomes [`Segment::Name`].
    pub fn parse(pointer: &str) -> Self {
        if pointer.is_empty() {
            return Position::root();
        }
        let segs = pointer
            .trim_start_matches('/')
            .split('/')
            .map(unescape)
            .map(|s| {
                if let Some(t) = token(&s) {
                    Segment::Token(t)
                } else if let Ok(i) = s.parse::<usize>() {
                    Segment::Index(i)
                } else {
                    Segment::Name(s)
                }
            })
            .collect();
        Position(segs)
    }
}

fn unescape(s: &str) -> String {
    s.replace("~1", "/").replace("~0", "~")
}

fn escape(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.0 {
            write!(f, "/{}", escape(&seg.as_str()))?;
        }
        Ok(())
    }
}

impl Serialize for Position {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Position::parse(&s))
    }
}
