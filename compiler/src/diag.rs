// diag.rs — Unified diagnostics model
//
// Shared diagnostic types used across all compiler phases.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0200`, `W0300`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable code constants, one per error kind.
pub mod codes {
    use super::DiagCode;

    /// Syntax error surfaced from the lexer or parser.
    pub const E0001: DiagCode = DiagCode("E0001"); // ParseError
    pub const E0100: DiagCode = DiagCode("E0100"); // UndeclaredName
    pub const E0101: DiagCode = DiagCode("E0101"); // Redefinition
    pub const E0200: DiagCode = DiagCode("E0200"); // TypeMismatch
    pub const E0201: DiagCode = DiagCode("E0201"); // NotAnLValue
    pub const E0202: DiagCode = DiagCode("E0202"); // ArityMismatch
    pub const E0203: DiagCode = DiagCode("E0203"); // Ambiguous
    pub const E0204: DiagCode = DiagCode("E0204"); // NonConstantArraySize
    pub const E0300: DiagCode = DiagCode("E0300"); // RateMismatch
    pub const E0400: DiagCode = DiagCode("E0400"); // PipelineTypeMismatch
    pub const E0401: DiagCode = DiagCode("E0401"); // UnschedulableGraph
    pub const E0500: DiagCode = DiagCode("E0500"); // UnsupportedForHardware
    pub const E0900: DiagCode = DiagCode("E0900"); // Internal

    pub const W0100: DiagCode = DiagCode("W0100"); // unused stream declaration
    pub const W0300: DiagCode = DiagCode("W0300"); // unbounded pop/push count
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or related spans.
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
        }
    }

    /// Shorthand for an error-level diagnostic with a stable code.
    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message).with_code(code)
    }

    /// Shorthand for a warning-level diagnostic with a stable code.
    pub fn warning(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related span.
    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is error-level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_span() -> Span {
        use chumsky::span::Span as _;
        Span::new((), 0..1)
    }

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, dummy_span(), "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_hint() {
        let d = Diagnostic::error(codes::E0200, dummy_span(), "type mismatch")
            .with_hint("insert an explicit cast");
        assert_eq!(
            format!("{d}"),
            "error[E0200]: type mismatch\n  hint: insert an explicit cast"
        );
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let w = Diagnostic::warning(codes::W0300, dummy_span(), "unbounded pop count");
        assert!(!has_errors(&[w.clone()]));
        let e = Diagnostic::error(codes::E0300, dummy_span(), "rate mismatch");
        assert!(has_errors(&[w, e]));
    }
}
