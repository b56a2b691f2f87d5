//! Diagnostic kinds and predefined codes.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - something is definitely wrong.
    Error,
    /// A warning - something is probably wrong or suboptimal.
    Warning,
    /// Informational - expected but worth knowing.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `GS1xx` - Device memory and memory-type selection
/// - `GS2xx` - Staging ring
/// - `GS3xx` - Transfers and resource lifetime
/// - `GS9xx` - Fatal precondition violations
#[derive(Debug, Clone, Copy)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "GS101").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new informational diagnostic.
    pub const fn note(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Note,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// GS1xx - Device memory
// =============================================================================

/// GS101: Device heap usage crossed the pressure threshold.
pub const GS101: Diagnostic = Diagnostic::warning(
    "GS101",
    "device memory pressure detected before allocation"
).with_note("a heap's tracked usage exceeds the configured pressure threshold")
 .with_help("free unused resources or lower per-frame allocation volume");

/// GS102: Memory recovery hook has nothing to reclaim.
pub const GS102: Diagnostic = Diagnostic::warning(
    "GS102",
    "memory recovery unavailable, continuing with allocation"
).with_note("no defragmentation backend is available for device memory");

/// GS103: Memory type found only through the superset fallback.
pub const GS103: Diagnostic = Diagnostic::warning(
    "GS103",
    "no exact memory type match, using a type with extra property flags"
);

/// GS104: Memory type found only through the filter-mask fallback.
pub const GS104: Diagnostic = Diagnostic::warning(
    "GS104",
    "no memory type carries the requested properties, using any allowed type"
).with_note("the resource may not be host-visible or device-local as requested");

/// GS105: Device reported out-of-memory; retrying once.
pub const GS105: Diagnostic = Diagnostic::warning(
    "GS105",
    "device allocation failed with out-of-memory, retrying after recovery"
);

// =============================================================================
// GS2xx - Staging ring
// =============================================================================

/// GS201: Staging request larger than the whole ring.
pub const GS201: Diagnostic = Diagnostic::warning(
    "GS201",
    "staging request exceeds ring capacity"
).with_note("no amount of wrapping or resetting can place a request larger than the ring")
 .with_help("increase staging_pool_size in ResourceConfig or split the upload");

/// GS202: Ring reset while staging scopes were still alive.
pub const GS202: Diagnostic = Diagnostic::warning(
    "GS202",
    "staging ring reset while regions are still in use"
).with_note("outstanding regions now alias memory that will be reused")
 .with_help("consume every StagingScope before resetting the ring");

/// GS203: Fragmentation crossed the critical threshold.
pub const GS203: Diagnostic = Diagnostic::note(
    "GS203",
    "staging fragmentation critical, ring reset"
);

/// GS204: A pending staged span was overwritten before it was flushed.
pub const GS204: Diagnostic = Diagnostic::error(
    "GS204",
    "pending staged data was invalidated before flush"
).with_note("the ring wrapped past or reset over this buffer's staged bytes")
 .with_help("flush GpuBuffers before staging more than the ring capacity");

// =============================================================================
// GS3xx - Transfers and lifetimes
// =============================================================================

/// GS301: A resource handle was dropped without being destroyed.
pub const GS301: Diagnostic = Diagnostic::warning(
    "GS301",
    "resource handle dropped without destroy, device objects leaked"
).with_help("pass handles to ResourceCoordinator::destroy_resource");

/// GS302: An async transfer token was dropped without being freed.
pub const GS302: Diagnostic = Diagnostic::note(
    "GS302",
    "async transfer dropped without free, deferring release"
).with_note("the command buffer and fence are reclaimed by collect_retired()");

/// GS303: Explicit flush offset disagrees with a wrap-anchored batch.
pub const GS303: Diagnostic = Diagnostic::warning(
    "GS303",
    "flush offset rejected for a batch split by a staging wrap"
).with_note("part of the batch was already uploaded when the ring wrapped")
 .with_help("flush at GpuBuffer::upload_target()");

/// GS304: Batch finished with failed entries.
pub const GS304: Diagnostic = Diagnostic::warning(
    "GS304",
    "transfer batch completed with failures"
);

// =============================================================================
// GS9xx - Fatal
// =============================================================================

/// GS901: No memory type at all satisfies the resource requirements.
pub const GS901: Diagnostic = Diagnostic::error(
    "GS901",
    "no memory type satisfies the resource requirements"
).with_note("the requirements are incompatible with this device")
 .with_help("check the buffer usage flags against the device's memory types");
