// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict detection and resolution.
//!
//! Conflicts are only ever discovered on the upstream path: `masterWrite`
//! returns the real master state of every row it refused. For each one the
//! upstream asks a [`ConflictHandler`]:
//!
//! ```text
//! ConflictInput { new_document_state: fork, assumed_master_state, real_master_state }
//!        │
//!        ├─► Equal              fork already matches master, only meta is updated
//!        └─► Resolved(doc)      doc is written into the fork with a new revision
//!                               (fork height + 1) and pushed again on the next cycle
//! ```
//!
//! The default handler compares content (`_deleted` + payload, never
//! `_rev`/`_meta`) and lets master win when they differ. Any
//! `Fn(&ConflictInput) -> ConflictOutput` can be used as a custom handler.

use crate::document::{DocumentState, StoredDocument};
use crate::revision::Revision;
use serde::Serialize;

/// What the upstream knows about one refused row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictInput {
    /// The fork state that was pushed.
    pub new_document_state: DocumentState,
    /// What the fork believed master held when it pushed.
    pub assumed_master_state: Option<DocumentState>,
    /// What master actually holds.
    pub real_master_state: DocumentState,
}

/// Decision of a conflict handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutput {
    /// Fork and master already agree.
    Equal,
    /// Replace the fork state with this document.
    Resolved(DocumentState),
}

/// Pluggable conflict policy.
///
/// Must be deterministic: the same input always gives the same output.
pub trait ConflictHandler: Send + Sync + 'static {
    /// True if two states carry the same content.
    fn is_equal(&self, a: &DocumentState, b: &DocumentState) -> bool {
        a.content_eq(b)
    }

    fn resolve(&self, input: &ConflictInput) -> ConflictOutput;
}

/// Content equality, master wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictHandler;

impl ConflictHandler for DefaultConflictHandler {
    fn resolve(&self, input: &ConflictInput) -> ConflictOutput {
        if self.is_equal(&input.new_document_state, &input.real_master_state) {
            ConflictOutput::Equal
        } else {
            ConflictOutput::Resolved(input.real_master_state.clone())
        }
    }
}

impl<F> ConflictHandler for F
where
    F: Fn(&ConflictInput) -> ConflictOutput + Send + Sync + 'static,
{
    fn resolve(&self, input: &ConflictInput) -> ConflictOutput {
        self(input)
    }
}

/// One resolution, as published on the `resolved_conflicts` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub input: ConflictInput,
    pub output: DocumentState,
}

/// Fork document for a resolved state that replaces `fork_state`.
///
/// The revision continues the fork's chain so the write wins over the
/// current fork state and is seen as a new change by the upstream.
pub fn resolved_fork_document(resolved: &DocumentState, fork_state: Option<&StoredDocument>) -> StoredDocument {
    let resolved = DocumentState {
        id: fork_state.map(|f| f.id.clone()).unwrap_or_else(|| resolved.id.clone()),
        ..resolved.clone()
    };
    StoredDocument::with_revision(
        &resolved,
        Revision::next(fork_state.map(|f| &f.rev), &resolved.content()),
    )
}
