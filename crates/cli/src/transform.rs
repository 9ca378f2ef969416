// Built-in line transforms

use clap::ValueEnum;
use rowflow_engine::{compute_fn, ComputeFn, TaskContext};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransformKind {
    /// SHA-256 of the line, hex encoded
    Fingerprint,
    /// Length of the line in characters
    Length,
    /// Line in upper case
    Uppercase,
    /// Line with its characters reversed
    Reverse,
}

impl TransformKind {
    pub fn apply(self, line: &str) -> String {
        match self {
            TransformKind::Fingerprint => hex::encode(Sha256::digest(line.as_bytes())),
            TransformKind::Length => line.chars().count().to_string(),
            TransformKind::Uppercase => line.to_uppercase(),
            TransformKind::Reverse => line.chars().rev().collect(),
        }
    }

    pub fn compute_fn(self) -> ComputeFn<String, String> {
        compute_fn(move |_: &TaskContext, line: String| Ok(self.apply(&line)))
    }
}
