//! Shared helpers reused across the wsbox crates: lexical path containment
//! (`PathGuard`), tree copy/removal helpers used by the overlay layer, and
//! small reporting traits so the engine never depends on a concrete
//! observability backend.

pub mod errors;
pub mod fs;
pub mod paths;
pub mod telemetry;

pub use errors::{ErrorReporter, MemoryErrorReporter, NoopErrorReporter, TracingErrorReporter};
pub use paths::{PathError, PathGuard, canonicalize_root, is_within, resolve};
pub use telemetry::{MemoryTelemetry, NoopTelemetry, TelemetrySink, TracingTelemetry};
