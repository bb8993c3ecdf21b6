// src/step/condition.rs

//! Step preconditions
//!
//! No predicate kinds exist yet. `Condition` is an uninhabited enum so any
//! condition list that deserializes is empty and every step runs; adding a
//! predicate means adding a variant and its arm in `is_satisfied`.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a condition may inspect
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub snapshot: &'a Path,
    pub root: &'a Path,
}

/// A predicate guarding a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {}

impl Condition {
    pub fn is_satisfied(&self, _context: &ConditionContext<'_>) -> bool {
        match *self {}
    }
}

/// Whether every condition holds; an empty list always does
pub fn all_satisfied(conditions: &[Condition], context: &ConditionContext<'_>) -> bool {
    conditions.iter().all(|c| c.is_satisfied(context))
}
