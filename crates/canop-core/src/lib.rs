//! # canop-core
//!
//! Operation model and rebase engine for Canop, a centrally sequenced
//! collaborative text synchronizer.
//!
//! This crate provides:
//! - [`Mark`]: the (base, origin, sequence) identity of every atomic edit
//! - [`AtomicOperation`]: one indivisible edit (set, insert run, delete run)
//! - [`PosChange`]: the positional side-effect of an insert or delete
//! - [`OperationLog`]: an ordered transaction of atomic operations
//! - The rebase engine: [`change_position`], [`anchor_position`] and
//!   [`rebase_pending`], which remap operations across concurrent history
//!
//! ## Rebasing
//!
//! Pending operations are mapped backwards to the common root, then
//! forward to the tip of the canon:
//!
//! ```text
//! ─┬────→ canon ───→ (sent - canon) ──→ local →
//!  └─── sent ←── local ←
//! ```
//!
//! ## Example
//!
//! ```rust
//! use canop_core::{AtomicOperation, Mark, OperationLog};
//!
//! let mut log = OperationLog::new();
//! log.push(AtomicOperation::insert(Mark::new(0, 1, 0), 0, "A D"));
//! log.push(AtomicOperation::insert(Mark::new(0, 1, 1), 2, "B "));
//!
//! assert_eq!(log.render(), "A B D");
//! ```

pub mod log;
pub mod mark;
pub mod operation;
pub mod pos_change;
pub mod rebase;
pub mod text;

pub use log::{apply_action, OperationLog};
pub use mark::{Base, Mark, OriginId, Sequence};
pub use operation::{Action, AtomicOperation, Original};
pub use pos_change::PosChange;
pub use rebase::{anchor_position, change_position, rebase_pending, Rebased};
pub use text::{char_len, minimal_diff};
