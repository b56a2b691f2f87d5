//! Coded diagnostics.
//!
//! Every recoverable anomaly on the allocation and transfer paths is reported
//! through a stable code instead of an ad-hoc log string, so applications can
//! filter or escalate specific conditions.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                                |
//! |-------|----------------------------------------|
//! | GS1xx | Device memory / memory-type selection  |
//! | GS2xx | Staging ring                           |
//! | GS3xx | Transfers and resource lifetime        |
//! | GS9xx | Fatal precondition violations          |

pub mod emit;
pub mod kind;
pub mod macros;

pub use emit::{emit, emit_with_context};
pub use kind::{Diagnostic, DiagnosticKind};
pub use kind::{
    GS101, GS102, GS103, GS104, GS105, GS201, GS202, GS203, GS204, GS301, GS302, GS303, GS304,
    GS901,
};
