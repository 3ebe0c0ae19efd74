//! Sanity check for a diagnosis's matcher regex.
//!
//! A matcher is only useful if it recognises the failure it was written for. The check
//! compiles the pattern and runs it against the diagnosis's own examples. Problems are
//! advisory: they are shown next to the diagnosis and never stop a remediation.

use crate::diagnosis::Diagnosis;
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherProblem {
    Empty,
    Invalid(String),
    MissedPositive(String),
    MatchedNegative(String),
}

impl fmt::Display for MatcherProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatcherProblem::Empty => write!(f, "matcher is empty"),
            MatcherProblem::Invalid(err) => write!(f, "matcher is not a valid regex: {}", err),
            MatcherProblem::MissedPositive(example) => {
                write!(f, "matcher does not match example {:?}", example)
            }
            MatcherProblem::MatchedNegative(example) => {
                write!(f, "matcher unexpectedly matches {:?}", example)
            }
        }
    }
}

/// Outcome of checking one diagnosis's matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatcherCheck {
    pub problems: Vec<MatcherProblem>,
}

impl MatcherCheck {
    pub fn run(diagnosis: &Diagnosis) -> Self {
        let pattern = diagnosis.matcher.trim();
        if pattern.is_empty() {
            return Self {
                problems: vec![MatcherProblem::Empty],
            };
        }

        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(err) => {
                return Self {
                    problems: vec![MatcherProblem::Invalid(err.to_string())],
                }
            }
        };

        let missed = diagnosis
            .positive_examples
            .iter()
            .filter(|example| !regex.is_match(example))
            .map(|example| MatcherProblem::MissedPositive(example.clone()));
        let matched = diagnosis
            .negative_examples
            .iter()
            .filter(|example| regex.is_match(example))
            .map(|example| MatcherProblem::MatchedNegative(example.clone()));

        Self {
            problems: missed.chain(matched).collect(),
        }
    }

    pub fn passed(&self) -> bool {
        self.problems.is_empty()
    }
}
