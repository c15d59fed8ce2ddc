//! Error types for taskpile.

use std::path::PathBuf;

/// Top-level error type for the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Spec error: {0}")]
    Spec(#[from] SpecError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Command-template formatting errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("No value for template key {key:?}")]
    UnresolvedKey { key: String },

    #[error("Template syntax error: {0}")]
    Syntax(String),

    #[error("Unknown conversion {conversion:?}, expected 'r' or 't'")]
    UnknownConversion { conversion: char },

    #[error("Failed to read template file {}: {source}", path.display())]
    TemplateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write instance file {}: {source}", path.display())]
    InstanceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Task-group spec errors.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Task group {group:?} has no __cmd__ entry")]
    MissingCommand { group: String },

    #[error("Key {key:?} holds a list but is not marked as a parameter list")]
    UnexpectedList { key: String },

    #[error("Unsupported value for key {key:?}: {detail}")]
    UnsupportedValue { key: String, detail: String },

    #[error("Start repeat {start} is not below total repeats {total}")]
    RepeatRange { start: usize, total: usize },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job command is empty")]
    EmptyCommand,

    #[error("Niceness {niceness} outside -20..=19")]
    NicenessOutOfRange { niceness: i32 },

    #[error("Job has no process to signal")]
    NotStarted,

    #[error("Failed to spawn job process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Failed to send {signal} to process {pid}: {source}")]
    Signal {
        signal: String,
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to collect exit status: {0}")]
    Wait(String),
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
