//! The wsbox engine.
//!
//! A sandbox is an ephemeral writable layer over a subtree of a host
//! project. Agents run commands and edit files inside it through the
//! [`Executor`]; approved changes are promoted back into the host tree as a
//! single VCS commit.
//!
//! Components, leaves first:
//! - [`profiles::ProfileStore`]: named isolation profiles.
//! - [`overlay::OverlayLayer`]: lower/upper/work/merged directories.
//! - [`registry::SandboxRegistry`]: persisted records and the state machine.
//! - [`process::ProcessRuntime`]: synchronous and tracked processes.
//! - [`diff::DiffEngine`]: change detection, approval, rejection, discard.
//! - [`executor::Executor`]: the tool surface.

pub mod clock;
pub mod diff;
pub mod error;
pub mod events;
pub mod executor;
pub mod files;
pub mod overlay;
pub mod process;
pub mod profiles;
pub mod registry;
pub mod sandbox;
pub mod textdiff;
pub mod vcs;

pub use clock::{Clock, FixedClock, IdSource, RandomIds, SequentialIds, SystemClock};
pub use error::{EngineError, EngineResult, ErrorCode};
pub use events::EngineEvent;
pub use executor::{Dependencies, ExecutionResult, Executor, ToolName};
pub use sandbox::{OwnerType, Sandbox, SandboxStatus};
