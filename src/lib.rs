//! taskpile, a single-host queue for piles of shell jobs.

pub mod config;
pub mod error;
pub mod job;
pub mod pile;
pub mod quote;
pub mod signals;
pub mod spec;
pub mod template;
