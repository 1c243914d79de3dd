//! Problem classification: severity mapping, mode-dependent reportability,
//! advisory tags, and offset-to-range resolution.
//!
//! Two orthogonal decisions are made per problem: what severity the client
//! sees, and whether the client sees it at all. In syntax-only mode only the
//! syntax category passes; in full mode type- and import-resolution problems
//! and a curated denylist of noisy semantic kinds are suppressed. A kind the
//! filter has no opinion about is reported and logged once for triage.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use ropey::Rope;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, DiagnosticTag, NumberOrString, Position, Range,
};

use crate::engine::{Problem, ProblemCategory, ProblemKind, ProblemSeverity};

/// Source tag attached to every diagnostic this core publishes.
pub const SERVER_SOURCE_ID: &str = "vigil";

/// Advisory rendering tags, keyed by kind. Consumed by the client for
/// strikethrough (Deprecated) and fade (Unnecessary) rendering.
static KIND_TAGS: Lazy<HashMap<ProblemKind, DiagnosticTag>> = Lazy::new(|| {
    use ProblemKind::*;
    HashMap::from([
        (UsingDeprecatedType, DiagnosticTag::DEPRECATED),
        (UsingDeprecatedField, DiagnosticTag::DEPRECATED),
        (UsingDeprecatedMethod, DiagnosticTag::DEPRECATED),
        (UsingDeprecatedConstructor, DiagnosticTag::DEPRECATED),
        (OverridingDeprecatedMethod, DiagnosticTag::DEPRECATED),
        (UnnecessaryCast, DiagnosticTag::UNNECESSARY),
        (UnnecessaryInstanceof, DiagnosticTag::UNNECESSARY),
        (UnnecessaryElse, DiagnosticTag::UNNECESSARY),
        (UnusedImport, DiagnosticTag::UNNECESSARY),
        (UnusedPrivateType, DiagnosticTag::UNNECESSARY),
        (UnusedPrivateField, DiagnosticTag::UNNECESSARY),
        (UnusedPrivateMethod, DiagnosticTag::UNNECESSARY),
        (UnusedLabel, DiagnosticTag::UNNECESSARY),
        (LocalVariableNeverUsed, DiagnosticTag::UNNECESSARY),
        (ArgumentNeverUsed, DiagnosticTag::UNNECESSARY),
    ])
});

/// Kinds already logged as unmatched; each is reported at most once per
/// process to keep triage logging from flooding.
static LOGGED_KINDS: Lazy<Mutex<HashSet<ProblemKind>>> = Lazy::new(|| Mutex::new(HashSet::new()));

pub fn diagnostic_tags(kind: ProblemKind) -> Option<Vec<DiagnosticTag>> {
    KIND_TAGS.get(&kind).map(|tag| vec![tag.clone()])
}

pub fn convert_severity(problem: &Problem) -> DiagnosticSeverity {
    match problem.severity {
        ProblemSeverity::Error => DiagnosticSeverity::ERROR,
        // Task markers are low-value; never escalate them past Information.
        ProblemSeverity::Warning if problem.kind != ProblemKind::Task => {
            DiagnosticSeverity::WARNING
        }
        _ => DiagnosticSeverity::INFORMATION,
    }
}

/// Records `kind` as unmatched and returns whether this was the first
/// sighting (i.e. whether it should be logged).
fn first_unmatched_sighting(kind: ProblemKind) -> bool {
    let mut logged = LOGGED_KINDS.lock().expect("kind log poisoned");
    logged.insert(kind)
}

pub fn is_reportable(problem: &Problem, syntax_only: bool) -> bool {
    let category = problem.kind.category();
    // Syntax issues are always reported; in syntax-only mode they are the
    // only thing reported.
    if category == ProblemCategory::Syntax {
        return true;
    }
    if syntax_only {
        return false;
    }
    // Type and import resolution is too unreliable at this layer.
    if matches!(
        category,
        ProblemCategory::TypeRelated | ProblemCategory::ImportRelated
    ) {
        return false;
    }
    use ProblemKind::*;
    match problem.kind {
        // Cherry-picked semantic kinds that drown the user in noise while
        // the workspace is still resolving.
        AbstractMethodMustBeImplemented
        | AmbiguousMethod
        | DanglingReference
        | MethodMustOverrideOrImplement
        | MissingReturnType
        | MissingTypeInConstructor
        | MissingTypeInLambda
        | MissingTypeInMethod
        | UndefinedConstructor
        | UndefinedField
        | UndefinedMethod
        | UndefinedName
        | UnresolvedVariable
        | ParameterMismatch => false,
        Task
        | UsingDeprecatedField
        | UsingDeprecatedMethod
        | UsingDeprecatedConstructor
        | OverridingDeprecatedMethod
        | UnnecessaryCast
        | UnnecessaryInstanceof
        | UnnecessaryElse
        | UnusedPrivateType
        | UnusedPrivateField
        | UnusedPrivateMethod
        | UnusedLabel
        | LocalVariableNeverUsed
        | ArgumentNeverUsed => true,
        kind => {
            if first_unmatched_sighting(kind) {
                tracing::info!(
                    kind = kind.name(),
                    message = %problem.message,
                    "problem kind has no filter entry, reporting it"
                );
            }
            true
        }
    }
}

fn char_to_position(rope: &Rope, offset: usize) -> Position {
    let line = rope.char_to_line(offset);
    let character = offset - rope.line_to_char(line);
    Position {
        line: line as u32,
        character: character as u32,
    }
}

/// Walk backward from `start` over whitespace; if the first non-whitespace
/// char is an annotation marker, anchor the range there. The annotation is
/// the useful quick-fix target for an undefined type, not the bare name.
fn annotation_anchor(rope: &Rope, start: usize) -> Option<usize> {
    let mut idx = start.checked_sub(1)?;
    if idx >= rope.len_chars() {
        return None;
    }
    loop {
        let ch = rope.char(idx);
        if ch == '@' {
            return Some(idx);
        }
        if !ch.is_whitespace() {
            return None;
        }
        idx = idx.checked_sub(1)?;
    }
}

fn precise_range(rope: &Rope, problem: &Problem) -> Option<Range> {
    let mut start = problem.start;
    if problem.kind == ProblemKind::UndefinedType {
        if let Some(anchor) = annotation_anchor(rope, problem.start) {
            start = anchor;
        }
    }
    if start > problem.end || problem.end > rope.len_chars() {
        return None;
    }
    Some(Range {
        start: char_to_position(rope, start),
        end: char_to_position(rope, problem.end),
    })
}

/// Coarse range built from the problem's own reported line/column, used when
/// the buffer is unavailable or the offsets don't fit it.
fn fallback_range(problem: &Problem) -> Range {
    let line = problem.line.saturating_sub(1); // the protocol is 0-based
    let character = problem.column.saturating_sub(1);
    // A width too large for the protocol means the offsets are garbage;
    // collapse to a zero-width range instead of truncating.
    let width = u32::try_from(problem.end.saturating_sub(problem.start)).unwrap_or(0);
    Range {
        start: Position { line, character },
        end: Position {
            line,
            character: character + width,
        },
    }
}

pub fn convert_range(rope: Option<&Rope>, problem: &Problem) -> Range {
    rope.and_then(|rope| precise_range(rope, problem))
        .unwrap_or_else(|| fallback_range(problem))
}

pub fn to_diagnostic(rope: Option<&Rope>, problem: &Problem, tags_supported: bool) -> Diagnostic {
    use ProblemKind::*;
    let data = match problem.kind {
        UndefinedName | UndefinedType | UninitializedField if !problem.arguments.is_empty() => {
            Some(serde_json::json!({ "arguments": problem.arguments }))
        }
        _ => None,
    };
    Diagnostic {
        range: convert_range(rope, problem),
        severity: Some(convert_severity(problem)),
        code: Some(NumberOrString::String(problem.kind.code().to_string())),
        source: Some(SERVER_SOURCE_ID.into()),
        message: problem.message.clone(),
        tags: tags_supported
            .then(|| diagnostic_tags(problem.kind))
            .flatten(),
        data,
        ..Default::default()
    }
}

/// Filter and convert one reconciliation pass worth of problems.
pub fn to_diagnostics(
    rope: Option<&Rope>,
    problems: &[Problem],
    syntax_only: bool,
    tags_supported: bool,
) -> Vec<Diagnostic> {
    problems
        .iter()
        .filter(|problem| is_reportable(problem, syntax_only))
        .map(|problem| to_diagnostic(rope, problem, tags_supported))
        .collect()
}
