//! Diagnostic emission backend.
//!
//! Diagnostics are forwarded to the `log` facade; the embedding application
//! decides where they end up.

use super::kind::{Diagnostic, DiagnosticKind};

/// Emit a diagnostic.
pub fn emit(diag: &Diagnostic) {
    emit_line(diag, None);
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    emit_line(diag, Some(context));
}

fn emit_line(diag: &Diagnostic, context: Option<&str>) {
    let level = match diag.kind {
        DiagnosticKind::Error => log::Level::Error,
        DiagnosticKind::Warning => log::Level::Warn,
        DiagnosticKind::Note => log::Level::Info,
    };

    match context {
        Some(ctx) => log::log!(level, "[{}] {}: {} ({})", diag.code, diag.kind.prefix(), diag.message, ctx),
        None => log::log!(level, "[{}] {}: {}", diag.code, diag.kind.prefix(), diag.message),
    }

    #[cfg(any(debug_assertions, feature = "diagnostics"))]
    {
        if let Some(note) = diag.note {
            log::log!(level, "  note: {}", note);
        }
        if let Some(help) = diag.help {
            log::log!(level, "  help: {}", help);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::kind::{GS103, GS901};

    #[test]
    fn test_emit_without_logger_is_silent() {
        // No logger installed: must not panic.
        emit(&GS901);
        emit_with_context(&GS103, "type 2");
    }
}
