//! Editing side of Toolflow.
//!
//! Tool documents change only through the [`patch`] engine. Agent-facing calls that edit a
//! tool (or otherwise need a human decision) are tracked by the [`confirmation`] state
//! machine, whose behavior per tool type comes from a [`policy`]. An [`session::EditSession`]
//! ties both to a store of drafts.

pub mod confirmation;
pub mod patch;
pub mod policy;
pub mod session;

pub use confirmation::{CallKind, ConfirmationError, ConfirmationRecord, ConfirmationRegistry, Resolution};
pub use patch::{PatchError, PatchOutcome, apply_patches, parse_patches, validate_batch};
pub use policy::{AUTHENTICATE_OAUTH, ConfirmationPolicy, EDIT_TOOL, RUN_TOOL};
pub use session::{DraftStore, EditSession, SessionError};
