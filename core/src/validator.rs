//! Artifact validation: deliverable mapping, substance scoring, and
//! context-aware contract checks.
//!
//! Produced files are mapped to contract deliverables by case-insensitive
//! glob or substring patterns, each mapped file is scored for substance
//! (stub markers, completeness, minimum length), and the combined report
//! feeds the phase exit gate. Deliverables that do not apply to the inferred
//! project type are dropped from validation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contracts::{Deliverable, PhaseContract};
use crate::snapshot::FsSnapshot;

/// Severity of stub markers found in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Stub phrase table. Each match deducts from the substance score; critical
/// markers additionally cap the score at 0.2.
const STUB_RULES: &[(&str, StubSeverity, f64)] = &[
    ("not implemented", StubSeverity::Critical, 0.5),
    ("coming soon", StubSeverity::Critical, 0.5),
    ("placeholder", StubSeverity::Critical, 0.5),
    ("todo", StubSeverity::High, 0.15),
    ("fixme", StubSeverity::High, 0.15),
    ("# @app.route", StubSeverity::Medium, 0.10),
    ("// app.get(", StubSeverity::Medium, 0.10),
    ("// app.post(", StubSeverity::Medium, 0.10),
    ("// router.", StubSeverity::Medium, 0.10),
];

const CRITICAL_CAP: f64 = 0.2;
const SHORT_FILE_CAP: f64 = 0.4;

/// Substance assessment of a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstanceReport {
    pub quality: f64,
    pub completeness: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<StubSeverity>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Broad shape of the produced project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    BackendOnly,
    FrontendOnly,
    FullStack,
    Library,
    DocsOnly,
}

/// Validation status of one deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableStatus {
    Satisfied,
    BelowThreshold,
    Missing,
}

/// Per-deliverable validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableReport {
    pub name: String,
    pub status: DeliverableStatus,
    pub score: f64,
    pub files_matched: Vec<PathBuf>,
    #[serde(default)]
    pub issues: Vec<String>,
    pub optional: bool,
    pub min_quality: f64,
}

/// Outcome of validating a contract against an output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub deliverables: Vec<DeliverableReport>,
    /// `mean(required deliverable scores) × completeness_ratio`.
    pub quality_score: f64,
    /// Satisfied required deliverables / total required deliverables.
    pub completeness_ratio: f64,
    pub project_type: ProjectType,
}

/// Validator configuration.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Files with fewer whitespace-separated tokens than this are capped at
    /// quality 0.4.
    pub min_tokens: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { min_tokens: 40 }
    }
}

const TEXT_EXTENSIONS: &[&str] = &[
    "md", "txt", "rst", "py", "rs", "ts", "tsx", "js", "jsx", "go", "java", "rb", "php", "html",
    "css", "scss", "json", "yaml", "yml", "toml", "xml", "sql", "sh", "vue", "svelte", "cfg",
    "ini", "env",
];

/// Default mapping from deliverable name to match patterns, used when a
/// contract deliverable carries no patterns of its own.
pub fn default_rules() -> BTreeMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        ("requirements_doc", &["*requirements*.md", "*user_stories*.md"]),
        ("acceptance_criteria", &["*acceptance*.md"]),
        ("design_doc", &["*design*.md", "*architecture*.md"]),
        (
            "api_spec",
            &["*api*.md", "*openapi*.yaml", "*openapi*.yml", "*openapi*.json"],
        ),
        (
            "source_code",
            &["*.py", "*.rs", "*.ts", "*.tsx", "*.js", "*.jsx", "*.go", "*.java"],
        ),
        ("tests", &["*test*", "*spec*"]),
        ("test_report", &["*test_report*", "*test-results*"]),
        (
            "deployment_config",
            &["Dockerfile", "*docker-compose*", "k8s/*", "*deploy*.yaml", "*deploy*.yml"],
        ),
        ("user_docs", &["*.md", "docs/*"]),
    ];
    table
        .iter()
        .map(|(name, patterns)| {
            (
                name.to_string(),
                patterns.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect()
}

/// A compiled deliverable pattern: case-insensitive glob when the pattern
/// contains glob metacharacters, case-insensitive substring otherwise.
enum CompiledPattern {
    Glob(GlobMatcher),
    Substring(String),
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Self {
        let has_meta = pattern.contains(['*', '?', '[']);
        if has_meta {
            if let Ok(glob) = GlobBuilder::new(pattern).case_insensitive(true).build() {
                return CompiledPattern::Glob(glob.compile_matcher());
            }
        }
        CompiledPattern::Substring(pattern.to_lowercase())
    }

    fn matches(&self, relative: &Path) -> bool {
        match self {
            CompiledPattern::Glob(matcher) => {
                matcher.is_match(relative)
                    || relative
                        .file_name()
                        .map(|name| matcher.is_match(Path::new(name)))
                        .unwrap_or(false)
            }
            CompiledPattern::Substring(needle) => relative
                .to_string_lossy()
                .to_lowercase()
                .contains(needle.as_str()),
        }
    }
}

/// Validates produced artifacts against a phase contract.
pub struct ArtifactValidator {
    rules: BTreeMap<String, Vec<String>>,
    config: ValidatorConfig,
}

impl Default for ArtifactValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactValidator {
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
            config: ValidatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Score the substance of a single file.
    pub fn score_file(&self, path: &Path) -> std::io::Result<SubstanceReport> {
        let bytes = std::fs::read(path)?;

        if !is_text_file(path) {
            let quality = if bytes.is_empty() { 0.0 } else { 1.0 };
            return Ok(SubstanceReport {
                quality,
                completeness: 1.0,
                severity: None,
                issues: if bytes.is_empty() {
                    vec!["file is empty".to_string()]
                } else {
                    Vec::new()
                },
            });
        }

        let content = String::from_utf8_lossy(&bytes);
        Ok(self.score_text(&content))
    }

    /// Score text content directly.
    pub fn score_text(&self, content: &str) -> SubstanceReport {
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return SubstanceReport {
                quality: 0.0,
                completeness: 0.0,
                severity: None,
                issues: vec!["file is empty".to_string()],
            };
        }

        let substantive = lines
            .iter()
            .filter(|line| {
                let trimmed = line.trim();
                !trimmed.is_empty() && !is_comment_line(trimmed)
            })
            .count();
        let completeness = substantive as f64 / lines.len() as f64;

        let mut deduction = 0.0;
        let mut severity: Option<StubSeverity> = None;
        let mut issues = Vec::new();
        let mut stub_lines = HashSet::new();
        for (line_no, line) in lines.iter().enumerate() {
            let lower = line.to_lowercase();
            for (phrase, marker_severity, amount) in STUB_RULES {
                if lower.contains(phrase) {
                    deduction += amount;
                    severity = Some(severity.map_or(*marker_severity, |s| s.max(*marker_severity)));
                    stub_lines.insert(line_no);
                    issues.push(format!("stub marker '{}' at line {}", phrase, line_no + 1));
                }
            }
        }

        // A file whose substantive content is nothing but stub markers is a
        // placeholder regardless of which marker triggered.
        if substantive > 0 && stub_lines.len() >= substantive {
            severity = Some(StubSeverity::Critical);
        }

        let mut quality = ((1.0 - deduction).max(0.0)) * completeness;
        if severity == Some(StubSeverity::Critical) {
            quality = quality.min(CRITICAL_CAP);
        }
        let tokens = content.split_whitespace().count();
        if tokens < self.config.min_tokens {
            quality = quality.min(SHORT_FILE_CAP);
            issues.push(format!(
                "file is short ({} tokens < {})",
                tokens, self.config.min_tokens
            ));
        }

        SubstanceReport {
            quality,
            completeness,
            severity,
            issues,
        }
    }

    /// Infer the project type from the files under the output root.
    pub fn infer_project_type(&self, snapshot: &FsSnapshot) -> ProjectType {
        let files: Vec<String> = snapshot
            .files()
            .map(|p| p.to_string_lossy().to_lowercase())
            .collect();

        if files.is_empty() {
            return ProjectType::DocsOnly;
        }

        let doc_only = files
            .iter()
            .all(|f| f.ends_with(".md") || f.ends_with(".txt") || f.ends_with(".rst"));
        if doc_only {
            return ProjectType::DocsOnly;
        }

        let frontend_exts = [".tsx", ".jsx", ".vue", ".svelte", ".html", ".css", ".scss"];
        let backend_exts = [".py", ".go", ".java", ".rb", ".php", ".rs", ".sql"];
        let has_frontend = files.iter().any(|f| {
            frontend_exts.iter().any(|ext| f.ends_with(ext))
                || f.ends_with("package.json")
                || f.contains("components/")
        });
        let has_backend = files
            .iter()
            .any(|f| backend_exts.iter().any(|ext| f.ends_with(ext)));

        let entry_markers = ["main.", "app.", "server.", "index.", "manage.py"];
        let has_entry = files.iter().any(|f| {
            let basename = f.rsplit('/').next().unwrap_or(f);
            entry_markers.iter().any(|m| basename.starts_with(m)) || f.contains("api/")
        });

        match (has_frontend, has_backend) {
            (true, true) => ProjectType::FullStack,
            (true, false) => ProjectType::FrontendOnly,
            (false, true) if has_entry => ProjectType::BackendOnly,
            (false, true) => ProjectType::Library,
            (false, false) => ProjectType::Library,
        }
    }

    /// Whether a deliverable is meaningful for the given project type.
    pub fn deliverable_applies(&self, name: &str, project_type: ProjectType) -> bool {
        let lower = name.to_lowercase();
        let frontend_like = ["frontend", "ui", "component", "stylesheet"]
            .iter()
            .any(|k| lower.contains(k));
        let backend_like = ["backend", "database", "migration", "api_impl"]
            .iter()
            .any(|k| lower.contains(k));
        let code_like = ["source_code", "tests", "test_report", "deployment"]
            .iter()
            .any(|k| lower.contains(k));

        match project_type {
            ProjectType::FrontendOnly => !backend_like,
            ProjectType::BackendOnly | ProjectType::Library => !frontend_like,
            ProjectType::DocsOnly => !frontend_like && !backend_like && !code_like,
            ProjectType::FullStack => true,
        }
    }

    /// Validate a contract against an output directory.
    ///
    /// When `added` is given, only those files are considered (snapshot-diff
    /// validation); otherwise the whole directory is scanned. The same
    /// directory and contract always yield the same report.
    pub fn validate(
        &self,
        contract: &PhaseContract,
        root: &Path,
        added: Option<&[PathBuf]>,
    ) -> std::io::Result<ValidationReport> {
        let snapshot = FsSnapshot::capture(root)?;
        let project_type = self.infer_project_type(&snapshot);

        let candidates: Vec<PathBuf> = match added {
            Some(files) => files.to_vec(),
            None => snapshot.files().cloned().collect(),
        };

        let mut reports = Vec::new();
        for deliverable in &contract.deliverables {
            if !self.deliverable_applies(&deliverable.name, project_type) {
                debug!(
                    deliverable = %deliverable.name,
                    project_type = ?project_type,
                    "deliverable not applicable, dropped from validation"
                );
                continue;
            }
            reports.push(self.validate_deliverable(deliverable, root, &candidates)?);
        }

        let required: Vec<&DeliverableReport> =
            reports.iter().filter(|r| !r.optional).collect();
        let satisfied = required
            .iter()
            .filter(|r| r.status == DeliverableStatus::Satisfied)
            .count();
        let completeness_ratio = if required.is_empty() {
            1.0
        } else {
            satisfied as f64 / required.len() as f64
        };
        let mean_score = if required.is_empty() {
            1.0
        } else {
            required.iter().map(|r| r.score).sum::<f64>() / required.len() as f64
        };

        Ok(ValidationReport {
            deliverables: reports,
            quality_score: mean_score * completeness_ratio,
            completeness_ratio,
            project_type,
        })
    }

    fn validate_deliverable(
        &self,
        deliverable: &Deliverable,
        root: &Path,
        candidates: &[PathBuf],
    ) -> std::io::Result<DeliverableReport> {
        let patterns: Vec<CompiledPattern> = self
            .patterns_for(deliverable)
            .iter()
            .map(|p| CompiledPattern::compile(p))
            .collect();

        let matched: Vec<PathBuf> = candidates
            .iter()
            .filter(|path| patterns.iter().any(|p| p.matches(path)))
            .cloned()
            .collect();

        if matched.is_empty() {
            return Ok(DeliverableReport {
                name: deliverable.name.clone(),
                status: DeliverableStatus::Missing,
                score: 0.0,
                files_matched: Vec::new(),
                issues: vec![format!(
                    "no files matched patterns {:?}",
                    self.patterns_for(deliverable)
                )],
                optional: deliverable.optional,
                min_quality: deliverable.min_quality,
            });
        }

        let mut total = 0.0;
        let mut issues = Vec::new();
        for path in &matched {
            let report = self.score_file(&root.join(path))?;
            total += report.quality;
            for issue in report.issues {
                issues.push(format!("{}: {}", path.display(), issue));
            }
        }
        let score = total / matched.len() as f64;
        let status = if score >= deliverable.min_quality {
            DeliverableStatus::Satisfied
        } else {
            DeliverableStatus::BelowThreshold
        };

        Ok(DeliverableReport {
            name: deliverable.name.clone(),
            status,
            score,
            files_matched: matched,
            issues,
            optional: deliverable.optional,
            min_quality: deliverable.min_quality,
        })
    }

    fn patterns_for<'a>(&'a self, deliverable: &'a Deliverable) -> &'a [String] {
        if !deliverable.patterns.is_empty() {
            &deliverable.patterns
        } else {
            self.rules
                .get(&deliverable.name)
                .map(|p| p.as_slice())
                .unwrap_or(&[])
        }
    }
}

fn is_text_file(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        // Extensionless files (Dockerfile, Makefile) are treated as text.
        None => true,
    }
}

fn is_comment_line(trimmed: &str) -> bool {
    trimmed.starts_with("//")
        || trimmed.starts_with('#')
        || trimmed.starts_with("/*")
        || trimmed.starts_with("* ")
        || trimmed == "*"
        || trimmed.starts_with("<!--")
}
