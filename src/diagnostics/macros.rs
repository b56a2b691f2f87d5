//! Diagnostic macros.

/// Emit a predefined diagnostic by code, optionally with formatted context.
///
/// # Example
///
/// ```rust,ignore
/// gs_emit!(GS201);
/// gs_emit!(GS103, "memory type {} selected", index);
/// ```
#[macro_export]
macro_rules! gs_emit {
    ($code:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$code);
    }};
    ($code:ident, $($arg:tt)+) => {{
        let ctx = format!($($arg)+);
        $crate::diagnostics::emit::emit_with_context(&$crate::diagnostics::$code, &ctx);
    }};
}
