//! The event decoder seam.
//!
//! A decoder owns a signature table and turns `(topics, data)` into an
//! [`EventKind`]. It must be pure: no I/O, no clocks, no shared state.

use thiserror::Error;

use crate::event::EventKind;

/// Errors for logs whose signature is known but whose payload is not.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{event}: expected {expected} topics, got {got}")]
    TopicCount {
        event: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{event}: ABI decode failed: {reason}")]
    AbiDecodeFailed { event: &'static str, reason: String },

    #[error("invalid topic hex: {0}")]
    InvalidTopic(String),

    #[error("{event}: field '{field}' has unexpected type")]
    TypeMismatch {
        event: &'static str,
        field: &'static str,
    },
}

/// Maps a raw log onto a typed event.
///
/// `Ok(None)` means "unrecognized signature" and is not an error.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, topics: &[String], data: &[u8]) -> Result<Option<EventKind>, DecodeError>;

    /// topic0 values of every signature this decoder recognizes.
    fn known_topics(&self) -> Vec<String>;
}

impl<D: EventDecoder + ?Sized> EventDecoder for std::sync::Arc<D> {
    fn decode(&self, topics: &[String], data: &[u8]) -> Result<Option<EventKind>, DecodeError> {
        (**self).decode(topics, data)
    }

    fn known_topics(&self) -> Vec<String> {
        (**self).known_topics()
    }
}
