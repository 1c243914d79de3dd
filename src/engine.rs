//! External collaborator seams.
//!
//! The sync core does not parse anything itself. It drives an
//! [`AnalysisEngine`] (the parser/type-checker), consults a
//! [`ResourceLayer`] (the on-disk view of documents), and reports through a
//! [`DiagnosticsSink`] (the protocol connection). All three are traits so
//! the whole pipeline can be exercised with fakes in tests.

use std::fs;
use std::path::PathBuf;

use tower_lsp::lsp_types::{Diagnostic, Url};

/// Coarse category of a [`ProblemKind`], used by the reportability filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemCategory {
    Syntax,
    TypeRelated,
    ImportRelated,
    Other,
}

/// The analyzer-side problem kinds the classifier knows about.
///
/// These mirror the kinds a typical front end reports; anything the engine
/// emits that is not in this list should be mapped to the closest match or
/// added here together with its classifier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    // Syntax category
    ParseError,
    MissingToken,
    UnexpectedToken,
    // Low-value "task" comments (TODO/FIXME scanning)
    Task,
    // Type resolution
    UndefinedType,
    TypeMismatch,
    UsingDeprecatedType,
    // Import resolution
    ImportNotFound,
    DuplicateImport,
    UnusedImport,
    // Suppressed semantic kinds (too noisy at this layer)
    AbstractMethodMustBeImplemented,
    AmbiguousMethod,
    DanglingReference,
    MethodMustOverrideOrImplement,
    MissingReturnType,
    MissingTypeInConstructor,
    MissingTypeInLambda,
    MissingTypeInMethod,
    UndefinedConstructor,
    UndefinedField,
    UndefinedMethod,
    UndefinedName,
    UnresolvedVariable,
    ParameterMismatch,
    // Deprecated-use kinds
    UsingDeprecatedField,
    UsingDeprecatedMethod,
    UsingDeprecatedConstructor,
    OverridingDeprecatedMethod,
    // Unnecessary/unused kinds
    UnnecessaryCast,
    UnnecessaryInstanceof,
    UnnecessaryElse,
    UnusedPrivateType,
    UnusedPrivateField,
    UnusedPrivateMethod,
    UnusedLabel,
    LocalVariableNeverUsed,
    ArgumentNeverUsed,
    // Other reportable kinds
    UninitializedField,
}

impl ProblemKind {
    pub fn category(&self) -> ProblemCategory {
        use ProblemKind::*;
        match self {
            ParseError | MissingToken | UnexpectedToken => ProblemCategory::Syntax,
            UndefinedType | TypeMismatch | UsingDeprecatedType => ProblemCategory::TypeRelated,
            ImportNotFound | DuplicateImport | UnusedImport => ProblemCategory::ImportRelated,
            _ => ProblemCategory::Other,
        }
    }

    /// Stable numeric code carried on the published diagnostic.
    pub fn code(&self) -> u32 {
        use ProblemKind::*;
        match self {
            ParseError => 100,
            MissingToken => 101,
            UnexpectedToken => 102,
            Task => 200,
            UndefinedType => 300,
            TypeMismatch => 301,
            UsingDeprecatedType => 302,
            ImportNotFound => 400,
            DuplicateImport => 401,
            UnusedImport => 402,
            AbstractMethodMustBeImplemented => 500,
            AmbiguousMethod => 501,
            DanglingReference => 502,
            MethodMustOverrideOrImplement => 503,
            MissingReturnType => 504,
            MissingTypeInConstructor => 505,
            MissingTypeInLambda => 506,
            MissingTypeInMethod => 507,
            UndefinedConstructor => 508,
            UndefinedField => 509,
            UndefinedMethod => 510,
            UndefinedName => 511,
            UnresolvedVariable => 512,
            ParameterMismatch => 513,
            UsingDeprecatedField => 600,
            UsingDeprecatedMethod => 601,
            UsingDeprecatedConstructor => 602,
            OverridingDeprecatedMethod => 603,
            UnnecessaryCast => 700,
            UnnecessaryInstanceof => 701,
            UnnecessaryElse => 702,
            UnusedPrivateType => 703,
            UnusedPrivateField => 704,
            UnusedPrivateMethod => 705,
            UnusedLabel => 706,
            LocalVariableNeverUsed => 707,
            ArgumentNeverUsed => 708,
            UninitializedField => 800,
        }
    }

    /// Static kind name, used when logging kinds the filter has no opinion
    /// about.
    pub fn name(&self) -> &'static str {
        use ProblemKind::*;
        match self {
            ParseError => "ParseError",
            MissingToken => "MissingToken",
            UnexpectedToken => "UnexpectedToken",
            Task => "Task",
            UndefinedType => "UndefinedType",
            TypeMismatch => "TypeMismatch",
            UsingDeprecatedType => "UsingDeprecatedType",
            ImportNotFound => "ImportNotFound",
            DuplicateImport => "DuplicateImport",
            UnusedImport => "UnusedImport",
            AbstractMethodMustBeImplemented => "AbstractMethodMustBeImplemented",
            AmbiguousMethod => "AmbiguousMethod",
            DanglingReference => "DanglingReference",
            MethodMustOverrideOrImplement => "MethodMustOverrideOrImplement",
            MissingReturnType => "MissingReturnType",
            MissingTypeInConstructor => "MissingTypeInConstructor",
            MissingTypeInLambda => "MissingTypeInLambda",
            MissingTypeInMethod => "MissingTypeInMethod",
            UndefinedConstructor => "UndefinedConstructor",
            UndefinedField => "UndefinedField",
            UndefinedMethod => "UndefinedMethod",
            UndefinedName => "UndefinedName",
            UnresolvedVariable => "UnresolvedVariable",
            ParameterMismatch => "ParameterMismatch",
            UsingDeprecatedField => "UsingDeprecatedField",
            UsingDeprecatedMethod => "UsingDeprecatedMethod",
            UsingDeprecatedConstructor => "UsingDeprecatedConstructor",
            OverridingDeprecatedMethod => "OverridingDeprecatedMethod",
            UnnecessaryCast => "UnnecessaryCast",
            UnnecessaryInstanceof => "UnnecessaryInstanceof",
            UnnecessaryElse => "UnnecessaryElse",
            UnusedPrivateType => "UnusedPrivateType",
            UnusedPrivateField => "UnusedPrivateField",
            UnusedPrivateMethod => "UnusedPrivateMethod",
            UnusedLabel => "UnusedLabel",
            LocalVariableNeverUsed => "LocalVariableNeverUsed",
            ArgumentNeverUsed => "ArgumentNeverUsed",
            UninitializedField => "UninitializedField",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemSeverity {
    Error,
    Warning,
    Info,
}

/// A raw analyzer problem, before classification.
///
/// Offsets are char offsets into the analyzed text; `end` is exclusive.
/// `line`/`column` are the engine's own 1-based coordinates and are only
/// used as a fallback when offset-to-position conversion fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub kind: ProblemKind,
    pub severity: ProblemSeverity,
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
    pub message: String,
    /// Problem arguments (e.g. the undefined identifier), carried into the
    /// diagnostic's structured data for quick-fix consumers.
    pub arguments: Vec<String>,
}

impl Problem {
    pub fn new(kind: ProblemKind, severity: ProblemSeverity, start: usize, end: usize) -> Problem {
        Problem {
            kind,
            severity,
            start,
            end,
            line: 1,
            column: 1,
            message: String::new(),
            arguments: Vec::new(),
        }
    }
}

/// The parser/type-checker this core schedules. Implementations are expected
/// to be cheap to call for `reconcile` and potentially expensive for
/// `analyze`; both are invoked from background tasks, never from the
/// lifecycle entry points directly.
pub trait AnalysisEngine: Send + Sync {
    /// Bring the unit's parsed representation back in sync with `text`.
    /// Structural consistency only; no full problem detection.
    fn reconcile(&self, uri: &Url, text: &str) -> anyhow::Result<()>;

    /// Fresh full analysis of `text`, ignoring any incremental caches.
    fn analyze(&self, uri: &Url, text: &str) -> anyhow::Result<Vec<Problem>>;

    /// Drop any cached parse for the unit. Called when edit focus moves to a
    /// different document and the cached parse would otherwise go stale.
    fn invalidate(&self, uri: &Url);
}

/// The workspace/resource layer: the on-disk view of documents plus any
/// non-analyzer markers attached to them.
pub trait ResourceLayer: Send + Sync {
    fn exists(&self, uri: &Url) -> bool;

    /// Best-effort resync with the filesystem, covering a just-created file
    /// not yet visible to the resource layer.
    fn refresh(&self, uri: &Url);

    /// Authoritative on-disk content.
    fn read(&self, uri: &Url) -> anyhow::Result<String>;

    /// Generated/derived documents are never made working copies.
    fn is_derived(&self, uri: &Url) -> bool;

    /// Resource-level markers unrelated to source analysis, already in
    /// diagnostic form. Merged into each publish for the same document.
    fn markers(&self, uri: &Url) -> Vec<Diagnostic>;
}

/// Outbound diagnostics channel. An empty `diagnostics` vec clears all
/// diagnostics for the document on the client side.
#[tower_lsp::async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>);
}

#[tower_lsp::async_trait]
impl DiagnosticsSink for tower_lsp::Client {
    async fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        tower_lsp::Client::publish_diagnostics(self, uri, diagnostics, version).await;
    }
}

/// Plain-filesystem [`ResourceLayer`]. The filesystem has no staleness of
/// its own, so `refresh` is a lookup and derived detection is constant.
pub struct FsResources;

impl FsResources {
    fn to_path(uri: &Url) -> Option<PathBuf> {
        uri.to_file_path().ok()
    }
}

impl ResourceLayer for FsResources {
    fn exists(&self, uri: &Url) -> bool {
        Self::to_path(uri).map(|p| p.exists()).unwrap_or(false)
    }

    fn refresh(&self, uri: &Url) {
        if let Some(path) = Self::to_path(uri) {
            tracing::debug!(path = %path.display(), exists = path.exists(), "refreshed resource");
        }
    }

    fn read(&self, uri: &Url) -> anyhow::Result<String> {
        let path =
            Self::to_path(uri).ok_or_else(|| anyhow::anyhow!("not a file uri: {uri}"))?;
        Ok(fs::read_to_string(path)?)
    }

    fn is_derived(&self, _uri: &Url) -> bool {
        false
    }

    fn markers(&self, _uri: &Url) -> Vec<Diagnostic> {
        Vec::new()
    }
}
