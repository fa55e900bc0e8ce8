//! Ordered size-class ladder
//!
//! The ladder lists the size classes an instance may move between, smallest
//! first. Upsizing moves one rung up; downsizing moves one rung down but
//! never below the configured floor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when building a ladder from configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LadderError {
    #[error("size ladder must contain at least one class")]
    Empty,

    #[error("size class {0} appears more than once in the ladder")]
    Duplicate(String),

    #[error("floor size class {0} is not on the ladder")]
    FloorNotOnLadder(String),
}

/// Raw ladder as it appears in configuration
#[derive(Debug, Clone, Deserialize)]
struct LadderSpec {
    classes: Vec<String>,
    #[serde(default)]
    floor: Option<String>,
}

/// Ordered list of size classes with an optional floor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LadderSpec")]
pub struct SizeLadder {
    classes: Vec<String>,
    floor: Option<String>,
}

impl TryFrom<LadderSpec> for SizeLadder {
    type Error = LadderError;

    fn try_from(spec: LadderSpec) -> Result<Self, Self::Error> {
        SizeLadder::new(spec.classes, spec.floor)
    }
}

impl SizeLadder {
    /// Build a ladder from classes ordered smallest to largest
    pub fn new<I, S>(classes: I, floor: Option<String>) -> Result<Self, LadderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let classes: Vec<String> = classes.into_iter().map(Into::into).collect();
        if classes.is_empty() {
            return Err(LadderError::Empty);
        }

        for (i, class) in classes.iter().enumerate() {
            if classes[..i].contains(class) {
                return Err(LadderError::Duplicate(class.clone()));
            }
        }

        if let Some(ref f) = floor {
            if !classes.contains(f) {
                return Err(LadderError::FloorNotOnLadder(f.clone()));
            }
        }

        Ok(Self { classes, floor })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn floor(&self) -> Option<&str> {
        self.floor.as_deref()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.position(class).is_some()
    }

    fn position(&self, class: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == class)
    }

    /// Lowest rung a downsize may land on
    fn floor_position(&self) -> usize {
        self.floor
            .as_deref()
            .and_then(|f| self.position(f))
            .unwrap_or(0)
    }

    /// The class one rung above `current`, or `None` at the top
    pub fn next_larger(&self, current: &str) -> Option<&str> {
        let pos = self.position(current)?;
        self.classes.get(pos + 1).map(String::as_str)
    }

    /// The class one rung below `current`, or `None` at or below the floor
    pub fn next_smaller(&self, current: &str) -> Option<&str> {
        let pos = self.position(current)?;
        if pos <= self.floor_position() {
            return None;
        }
        self.classes.get(pos - 1).map(String::as_str)
    }

    /// True when `current` cannot be downsized any further
    pub fn at_floor(&self, current: &str) -> bool {
        self.position(current)
            .map(|pos| pos <= self.floor_position())
            .unwrap_or(false)
    }
}
