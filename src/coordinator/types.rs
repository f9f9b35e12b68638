// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the banner engine coordinator.

use thiserror::Error;

use crate::storage::traits::{ErrorKind, StorageError};

/// Engine lifecycle state.
///
/// Use [`super::BannerEngine::state()`] to check the current state or
/// [`super::BannerEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Backends not wired yet
    Created,
    /// Serving reads, writes and deletions
    Ready,
    /// Draining background deletions
    ShuttingDown,
    /// Drain finished; every call is refused
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Ready => write!(f, "Ready"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A failed engine operation, tagged with the operation name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed: {source}")]
pub struct EngineError {
    pub op: &'static str,
    #[source]
    pub source: StorageError,
}

impl EngineError {
    pub fn new(op: &'static str, source: StorageError) -> Self {
        Self { op, source }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}
