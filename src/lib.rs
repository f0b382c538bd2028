//! Supervised execution of interactive update scripts.
//!
//! A [`supervisor::Supervisor`] runs one external command at a time with its
//! output merged into a single line stream, narrates every line to a set of
//! [`sink::Sink`]s, and pauses at confirmation prompts until an answer is
//! relayed back through [`relay::AnswerRelay`] or a timer runs out.

pub mod catalog;
pub mod config;
pub mod events;
pub mod log;
pub mod paths;
pub mod prompt;
pub mod reader;
pub mod relay;
pub mod sink;
pub mod supervisor;
pub mod web;
