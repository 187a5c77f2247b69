//! Input materialization: compute the transitive closure of files a stage
//! needs, copy them into the worktree, and record a manifest.
//!
//! Three steps feed the closure:
//! 1. Deterministic: configured include globs (plus defaults) expanded
//!    against the source root.
//! 2. Reference following: markdown `[text](path)` links and inline-code
//!    path tokens in copied files, resolved to a fixed point.
//! 3. Optional LLM inference behind [`InputReferenceInferer`], with a
//!    content-hash cache so re-running the same inputs never re-invokes the
//!    model. Inference failure is a warning, not a fatal error.
//!
//! Copied files are also preserved under
//! `<logs_root>/inputs/snapshot/files/...` so resume works even when the
//! original source is gone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kilroy_types::{KilroyError, Result};

pub const INPUTS_MANIFEST_ENV: &str = "KILROY_INPUTS_MANIFEST_PATH";
pub const INPUT_MANIFEST_FILE: &str = "manifest.json";

/// Fixed preamble prepended to stage prompts when materialization is on.
const INPUT_CONTRACT_PREAMBLE: &str = "Input materialization contract: the files listed in the \
manifest at $KILROY_INPUTS_MANIFEST_PATH have been copied into your working directory. Work \
against those copies; do not assume paths outside the working directory exist.";

/// Patterns always included in the deterministic step.
const DEFAULT_INCLUDES: &[&str] = &["README*", "*.md", "docs/**"];

const MAX_INFERENCE_DOCS: usize = 8;
const MAX_INFERENCE_DOC_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Options and manifest types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputMaterializationOptions {
    pub enabled: bool,
    pub include: Vec<String>,
    pub infer_with_llm: bool,
    pub inference_provider: String,
    pub inference_model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InclusionSource {
    Glob,
    Reference,
    Inferred,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub content_hash: String,
    pub inclusion: InclusionSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputManifest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub files: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Inference contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct InputDoc {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredReference {
    pub pattern: String,
    pub rationale: String,
    pub confidence: String,
}

#[async_trait]
pub trait InputReferenceInferer: Send + Sync {
    async fn infer(&self, docs: &[InputDoc]) -> Result<Vec<InferredReference>>;
}

/// LLM-backed inferer: strict JSON schema over `complete`.
pub struct LlmInputReferenceInferer {
    client: Arc<kilroy_llm::Client>,
    provider: String,
    model: String,
}

impl LlmInputReferenceInferer {
    pub fn new(client: Arc<kilroy_llm::Client>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            provider: provider.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl InputReferenceInferer for LlmInputReferenceInferer {
    async fn infer(&self, docs: &[InputDoc]) -> Result<Vec<InferredReference>> {
        if self.provider.trim().is_empty() || self.model.trim().is_empty() {
            return Err(KilroyError::ConfigError(
                "input inference requires provider and model".into(),
            ));
        }
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "references": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "pattern": {"type": "string"},
                            "rationale": {"type": "string"},
                            "confidence": {"type": "string"}
                        },
                        "required": ["pattern", "rationale", "confidence"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["references"],
            "additionalProperties": false
        });

        let mut prompt = String::from(
            "Given these documents, infer additional file path or glob references needed to \
             satisfy requirements.\nReturn conservative over-inclusive patterns when uncertain.\n\n",
        );
        for doc in docs {
            prompt.push_str(&format!("### Document: {}\n{}\n\n", doc.path, doc.content));
        }

        let mut request = kilroy_llm::Request::new(self.provider.clone(), self.model.clone());
        request.messages.push(kilroy_llm::Message::system(
            "Return strictly valid JSON matching the schema. Infer input file path/glob \
             references required by the docs. Prefer broad inclusion when uncertain.",
        ));
        request.messages.push(kilroy_llm::Message::user(prompt));
        request.response_format = Some(kilroy_llm::ResponseFormat {
            format_type: "json_schema".into(),
            strict: true,
            json_schema: Some(schema),
        });

        let response = self.client.complete(request).await?;
        parse_inferred_payload(&response.text)
    }
}

/// Accept both `{"references": [...]}` and a bare array.
pub fn parse_inferred_payload(raw: &str) -> Result<Vec<InferredReference>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    #[derive(Deserialize)]
    struct Wrapped {
        references: Vec<InferredReference>,
    }
    if let Ok(wrapped) = serde_json::from_str::<Wrapped>(raw) {
        return Ok(normalize_inferred(wrapped.references));
    }
    if let Ok(direct) = serde_json::from_str::<Vec<InferredReference>>(raw) {
        return Ok(normalize_inferred(direct));
    }
    Err(KilroyError::Other("invalid inferred reference payload".into()))
}

/// Normalize inference output: trim, drop tokens that do not look like a
/// path or glob, drop case-insensitive duplicates, sort by pattern.
pub fn normalize_inferred(refs: Vec<InferredReference>) -> Vec<InferredReference> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<InferredReference> = Vec::new();
    for r in refs {
        let pattern = r.pattern.trim().to_string();
        if pattern.is_empty() || !looks_like_reference_token(&pattern) {
            continue;
        }
        if !seen.insert(pattern.to_lowercase()) {
            continue;
        }
        out.push(InferredReference {
            pattern,
            rationale: r.rationale.trim().to_string(),
            confidence: r.confidence.trim().to_string(),
        });
    }
    out.sort_by(|a, b| a.pattern.cmp(&b.pattern));
    out
}

/// A token counts as a path/glob reference when it has path texture (a
/// separator, a glob star, or a file extension) and no whitespace.
pub fn looks_like_reference_token(token: &str) -> bool {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return false;
    }
    if token.starts_with("http://") || token.starts_with("https://") {
        return false;
    }
    token.contains('/')
        || token.contains('*')
        || Path::new(token)
            .extension()
            .is_some_and(|ext| !ext.is_empty())
}

// ---------------------------------------------------------------------------
// Materializer
// ---------------------------------------------------------------------------

pub struct InputMaterializer {
    source_root: PathBuf,
    logs_root: PathBuf,
    run_id: String,
    options: InputMaterializationOptions,
    inferer: Option<Arc<dyn InputReferenceInferer>>,
    /// content-hash -> inferred references, so identical inputs never
    /// re-invoke the model.
    inference_cache: std::sync::Mutex<HashMap<String, Vec<InferredReference>>>,
}

impl InputMaterializer {
    pub fn new(
        source_root: impl Into<PathBuf>,
        logs_root: impl Into<PathBuf>,
        run_id: impl Into<String>,
        options: InputMaterializationOptions,
        inferer: Option<Arc<dyn InputReferenceInferer>>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            logs_root: logs_root.into(),
            run_id: run_id.into(),
            options,
            inferer,
            inference_cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn prompt_preamble(&self) -> &'static str {
        INPUT_CONTRACT_PREAMBLE
    }

    pub fn run_manifest_path(&self) -> PathBuf {
        self.logs_root.join("inputs").join(INPUT_MANIFEST_FILE)
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.logs_root.join("inputs").join("snapshot").join("files")
    }

    /// Environment the worker process receives for this stage.
    pub fn worker_env(&self, stage_manifest: &Path) -> Vec<(String, String)> {
        vec![(
            INPUTS_MANIFEST_ENV.to_string(),
            stage_manifest.to_string_lossy().into_owned(),
        )]
    }

    /// Materialize the closure into `worktree`. The per-run manifest is
    /// written under the logs root, the per-stage copy into
    /// `stage_logs_dir` when given.
    pub async fn materialize_into(
        &self,
        worktree: &Path,
        stage: Option<(&str, &Path)>,
    ) -> Result<InputManifest> {
        let mut warnings: Vec<String> = Vec::new();
        // BTreeMap keeps the manifest deterministic.
        let mut included: BTreeMap<PathBuf, InclusionSource> = BTreeMap::new();

        // Step 1: deterministic glob expansion.
        let glob_set = build_glob_set(&self.options.include)?;
        let source_exists = self.source_root.is_dir();
        if source_exists {
            for rel in walk_files(&self.source_root) {
                if glob_set.is_match(&rel) {
                    included.insert(rel, InclusionSource::Glob);
                }
            }
        } else {
            // Resume with the original source gone: hydrate from snapshot.
            warnings.push(format!(
                "source root missing ({}); hydrating from snapshot",
                self.source_root.display()
            ));
            for rel in walk_files(&self.snapshot_dir()) {
                included.insert(rel, InclusionSource::Snapshot);
            }
        }

        // Step 2: reference following to a fixed point.
        let read_root = if source_exists {
            self.source_root.clone()
        } else {
            self.snapshot_dir()
        };
        let mut frontier: Vec<PathBuf> = included.keys().cloned().collect();
        while let Some(rel) = frontier.pop() {
            let Ok(content) = std::fs::read_to_string(read_root.join(&rel)) else {
                continue;
            };
            for reference in extract_references(&content) {
                let resolved = resolve_reference(&rel, &reference);
                if included.contains_key(&resolved) {
                    continue;
                }
                if read_root.join(&resolved).is_file() {
                    included.insert(resolved.clone(), InclusionSource::Reference);
                    frontier.push(resolved);
                }
            }
        }

        // Step 3: LLM-inferred patterns (cached by content hash).
        if self.options.infer_with_llm {
            match self.infer_patterns(&read_root, &included).await {
                Ok(patterns) if !patterns.is_empty() => {
                    let inferred_set =
                        build_glob_set(&patterns.iter().map(|r| r.pattern.clone()).collect::<Vec<_>>())?;
                    for rel in walk_files(&read_root) {
                        if inferred_set.is_match(&rel) {
                            included.entry(rel).or_insert(InclusionSource::Inferred);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Inference is best-effort; the deterministic closure
                    // stands on its own.
                    warnings.push(format!("input inference failed: {e}"));
                    tracing::warn!(error = %e, "input inference failed; using deterministic closure");
                }
            }
        }

        // Copy into the worktree and the snapshot directory.
        let snapshot_dir = self.snapshot_dir();
        let mut entries: Vec<ManifestEntry> = Vec::with_capacity(included.len());
        for (rel, inclusion) in &included {
            let src = read_root.join(rel);
            let dest = worktree.join(rel);
            let mut file_warnings = Vec::new();

            let bytes = match std::fs::read(&src) {
                Ok(b) => b,
                Err(e) => {
                    file_warnings.push(format!("read failed: {e}"));
                    warnings.push(format!("{}: read failed: {e}", rel.display()));
                    continue;
                }
            };
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, &bytes)?;

            let snap = snapshot_dir.join(rel);
            if let Some(parent) = snap.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&snap, &bytes)?;

            entries.push(ManifestEntry {
                source_path: src,
                dest_path: dest,
                content_hash: format!("sha256:{:x}", Sha256::digest(&bytes)),
                inclusion: *inclusion,
                warnings: file_warnings,
            });
        }

        let manifest = InputManifest {
            run_id: self.run_id.clone(),
            stage: stage.map(|(name, _)| name.to_string()),
            files: entries,
            warnings,
        };

        let run_manifest = self.run_manifest_path();
        if let Some(parent) = run_manifest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&run_manifest, serde_json::to_vec_pretty(&manifest)?)?;
        if let Some((_, stage_dir)) = stage {
            std::fs::create_dir_all(stage_dir)?;
            std::fs::write(
                stage_dir.join(INPUT_MANIFEST_FILE),
                serde_json::to_vec_pretty(&manifest)?,
            )?;
        }

        Ok(manifest)
    }

    async fn infer_patterns(
        &self,
        read_root: &Path,
        included: &BTreeMap<PathBuf, InclusionSource>,
    ) -> Result<Vec<InferredReference>> {
        let Some(inferer) = &self.inferer else {
            return Err(KilroyError::ConfigError(
                "infer_with_llm is enabled but no inferer is configured".into(),
            ));
        };

        let mut docs: Vec<InputDoc> = Vec::new();
        let mut hasher = Sha256::new();
        for rel in included.keys().take(MAX_INFERENCE_DOCS) {
            let Ok(mut content) = std::fs::read_to_string(read_root.join(rel)) else {
                continue;
            };
            content.truncate(MAX_INFERENCE_DOC_BYTES);
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(content.as_bytes());
            docs.push(InputDoc {
                path: rel.to_string_lossy().into_owned(),
                content,
            });
        }
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let cache_key = format!("{:x}", hasher.finalize());
        {
            let cache = self
                .inference_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&cache_key) {
                tracing::debug!(key = %cache_key, "input inference cache hit");
                return Ok(cached.clone());
            }
        }

        let refs = normalize_inferred(inferer.infer(&docs).await?);
        self.inference_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key, refs.clone());
        Ok(refs)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in DEFAULT_INCLUDES.iter().map(|s| s.to_string()).chain(patterns.iter().cloned()) {
        match Glob::new(&pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "skipping invalid include glob");
            }
        }
    }
    builder
        .build()
        .map_err(|e| KilroyError::ConfigError(format!("include globs: {e}")))
}

/// All regular files under `root`, as paths relative to it. `.git` and the
/// logs-side snapshot structure are never inputs.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            if name == ".git" {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
    }
    out.sort();
    out
}

fn reference_regexes() -> &'static (Regex, Regex) {
    static RE: std::sync::OnceLock<(Regex, Regex)> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        (
            // Markdown link targets: [text](path)
            Regex::new(r"\[[^\]]*\]\(([^)\s]+)\)").unwrap(),
            // Inline-code path tokens: `path/to/file.ext`
            Regex::new(r"`([A-Za-z0-9_./\-]+)`").unwrap(),
        )
    })
}

/// Extract `[text](path)` targets and structured inline-code tokens.
pub fn extract_references(content: &str) -> Vec<String> {
    let (md_link, code_token) = reference_regexes();
    let mut out = Vec::new();
    for caps in md_link.captures_iter(content) {
        let target = caps[1].trim();
        if looks_like_reference_token(target) && !target.contains('*') {
            out.push(target.to_string());
        }
    }
    for caps in code_token.captures_iter(content) {
        let token = caps[1].trim();
        if token.contains('/') && looks_like_reference_token(token) {
            out.push(token.to_string());
        }
    }
    out
}

/// Resolve a reference relative to the directory of the file containing it,
/// normalizing `./` and `../` segments within the source root.
fn resolve_reference(containing_file: &Path, reference: &str) -> PathBuf {
    let base = containing_file.parent().unwrap_or(Path::new(""));
    let mut parts: Vec<std::ffi::OsString> =
        base.components().map(|c| c.as_os_str().to_owned()).collect();
    for comp in Path::new(reference).components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                parts.pop();
            }
            std::path::Component::Normal(p) => parts.push(p.to_owned()),
            _ => {}
        }
    }
    parts.iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn materializer(
        source: &Path,
        logs: &Path,
        options: InputMaterializationOptions,
        inferer: Option<Arc<dyn InputReferenceInferer>>,
    ) -> InputMaterializer {
        InputMaterializer::new(source, logs, "r1", options, inferer)
    }

    #[tokio::test]
    async fn deterministic_glob_closure_copies_and_snapshots() {
        let source = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        write(source.path(), "README.md", "# readme");
        write(source.path(), "docs/guide.md", "guide");
        write(source.path(), "src/main.rs", "fn main() {}");
        write(source.path(), "spec/design.txt", "design");

        let m = materializer(
            source.path(),
            logs.path(),
            InputMaterializationOptions {
                enabled: true,
                include: vec!["spec/**".into()],
                ..Default::default()
            },
            None,
        );
        let manifest = m.materialize_into(worktree.path(), None).await.unwrap();

        assert!(worktree.path().join("README.md").exists());
        assert!(worktree.path().join("docs/guide.md").exists());
        assert!(worktree.path().join("spec/design.txt").exists());
        // Not matched by defaults nor configured includes.
        assert!(!worktree.path().join("src/main.rs").exists());

        // Snapshot mirrors every copied file.
        assert!(logs
            .path()
            .join("inputs/snapshot/files/README.md")
            .exists());
        assert!(m.run_manifest_path().exists());

        let readme = manifest
            .files
            .iter()
            .find(|f| f.dest_path.ends_with("README.md"))
            .unwrap();
        assert_eq!(readme.inclusion, InclusionSource::Glob);
        assert!(readme.content_hash.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn reference_following_reaches_fixed_point() {
        let source = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        write(
            source.path(),
            "README.md",
            "See [the plan](refs/plan.txt) for details.",
        );
        write(
            source.path(),
            "refs/plan.txt",
            "Also read `refs/deep/notes.txt` before starting.",
        );
        write(source.path(), "refs/deep/notes.txt", "the end");
        write(source.path(), "refs/unrelated.bin", "not referenced");

        let m = materializer(
            source.path(),
            logs.path(),
            InputMaterializationOptions {
                enabled: true,
                ..Default::default()
            },
            None,
        );
        let manifest = m.materialize_into(worktree.path(), None).await.unwrap();

        assert!(worktree.path().join("refs/plan.txt").exists());
        assert!(worktree.path().join("refs/deep/notes.txt").exists());
        assert!(!worktree.path().join("refs/unrelated.bin").exists());
        let plan = manifest
            .files
            .iter()
            .find(|f| f.dest_path.ends_with("plan.txt"))
            .unwrap();
        assert_eq!(plan.inclusion, InclusionSource::Reference);
    }

    #[tokio::test]
    async fn stage_manifest_written_alongside_run_manifest() {
        let source = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        write(source.path(), "README.md", "hi");

        let m = materializer(
            source.path(),
            logs.path(),
            InputMaterializationOptions {
                enabled: true,
                ..Default::default()
            },
            None,
        );
        let stage_dir = logs.path().join("build");
        let manifest = m
            .materialize_into(worktree.path(), Some(("build", &stage_dir)))
            .await
            .unwrap();
        assert_eq!(manifest.stage.as_deref(), Some("build"));
        assert!(stage_dir.join(INPUT_MANIFEST_FILE).exists());

        let env = m.worker_env(&stage_dir.join(INPUT_MANIFEST_FILE));
        assert_eq!(env[0].0, INPUTS_MANIFEST_ENV);
    }

    #[tokio::test]
    async fn missing_source_hydrates_from_snapshot() {
        let source = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let worktree1 = tempfile::tempdir().unwrap();
        write(source.path(), "README.md", "survives");

        let options = InputMaterializationOptions {
            enabled: true,
            ..Default::default()
        };
        let m = materializer(source.path(), logs.path(), options.clone(), None);
        m.materialize_into(worktree1.path(), None).await.unwrap();

        // Source disappears; a resume must still materialize.
        drop(source);
        let worktree2 = tempfile::tempdir().unwrap();
        let manifest = m.materialize_into(worktree2.path(), None).await.unwrap();
        assert!(worktree2.path().join("README.md").exists());
        assert!(manifest
            .warnings
            .iter()
            .any(|w| w.contains("hydrating from snapshot")));
        assert_eq!(
            std::fs::read_to_string(worktree2.path().join("README.md")).unwrap(),
            "survives"
        );
    }

    struct CountingInferer {
        calls: std::sync::atomic::AtomicUsize,
        refs: Vec<InferredReference>,
    }

    #[async_trait]
    impl InputReferenceInferer for CountingInferer {
        async fn infer(&self, _docs: &[InputDoc]) -> Result<Vec<InferredReference>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.refs.clone())
        }
    }

    #[tokio::test]
    async fn inference_expands_patterns_and_caches_by_content() {
        let source = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        write(source.path(), "README.md", "uses the fixtures");
        write(source.path(), "fixtures/data.csv", "a,b");

        let inferer = Arc::new(CountingInferer {
            calls: std::sync::atomic::AtomicUsize::new(0),
            refs: vec![InferredReference {
                pattern: "fixtures/**".into(),
                rationale: "fixtures mentioned".into(),
                confidence: "high".into(),
            }],
        });
        let m = materializer(
            source.path(),
            logs.path(),
            InputMaterializationOptions {
                enabled: true,
                infer_with_llm: true,
                ..Default::default()
            },
            Some(inferer.clone()),
        );

        let worktree1 = tempfile::tempdir().unwrap();
        let manifest = m.materialize_into(worktree1.path(), None).await.unwrap();
        assert!(worktree1.path().join("fixtures/data.csv").exists());
        let csv = manifest
            .files
            .iter()
            .find(|f| f.dest_path.ends_with("data.csv"))
            .unwrap();
        assert_eq!(csv.inclusion, InclusionSource::Inferred);

        // Same inputs again: the cache answers, the model is not re-invoked.
        let worktree2 = tempfile::tempdir().unwrap();
        m.materialize_into(worktree2.path(), None).await.unwrap();
        assert_eq!(inferer.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    struct FailingInferer;

    #[async_trait]
    impl InputReferenceInferer for FailingInferer {
        async fn infer(&self, _docs: &[InputDoc]) -> Result<Vec<InferredReference>> {
            Err(KilroyError::Other("model unavailable".into()))
        }
    }

    #[tokio::test]
    async fn inference_failure_is_warning_not_fatal() {
        let source = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        write(source.path(), "README.md", "hello");

        let m = materializer(
            source.path(),
            logs.path(),
            InputMaterializationOptions {
                enabled: true,
                infer_with_llm: true,
                ..Default::default()
            },
            Some(Arc::new(FailingInferer)),
        );
        let manifest = m.materialize_into(worktree.path(), None).await.unwrap();
        assert!(worktree.path().join("README.md").exists());
        assert!(manifest
            .warnings
            .iter()
            .any(|w| w.contains("input inference failed")));
    }

    // --- pure helpers ---

    #[test]
    fn normalize_inferred_trims_dedups_sorts() {
        let refs = vec![
            InferredReference {
                pattern: "  src/**  ".into(),
                rationale: "r".into(),
                confidence: "high".into(),
            },
            InferredReference {
                pattern: "SRC/**".into(),
                rationale: "dup".into(),
                confidence: "low".into(),
            },
            InferredReference {
                pattern: "not a path".into(),
                rationale: "junk".into(),
                confidence: "low".into(),
            },
            InferredReference {
                pattern: "docs/guide.md".into(),
                rationale: "doc".into(),
                confidence: "med".into(),
            },
        ];
        let out = normalize_inferred(refs);
        let patterns: Vec<_> = out.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["docs/guide.md", "src/**"]);
    }

    #[test]
    fn looks_like_reference_token_filters() {
        assert!(looks_like_reference_token("src/lib.rs"));
        assert!(looks_like_reference_token("*.toml"));
        assert!(looks_like_reference_token("notes.txt"));
        assert!(!looks_like_reference_token("plain words"));
        assert!(!looks_like_reference_token("https://example.com/x.md"));
        assert!(!looks_like_reference_token(""));
        assert!(!looks_like_reference_token("word"));
    }

    #[test]
    fn extract_references_finds_links_and_code_tokens() {
        let content = "Read [spec](docs/spec.md) and `src/config/default.toml`.\n\
                       Ignore `word` and [site](https://example.com).";
        let refs = extract_references(content);
        assert!(refs.contains(&"docs/spec.md".to_string()));
        assert!(refs.contains(&"src/config/default.toml".to_string()));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn resolve_reference_handles_relative_segments() {
        assert_eq!(
            resolve_reference(Path::new("docs/plan.md"), "./notes.txt"),
            PathBuf::from("docs/notes.txt")
        );
        assert_eq!(
            resolve_reference(Path::new("docs/deep/plan.md"), "../other.txt"),
            PathBuf::from("docs/other.txt")
        );
        assert_eq!(
            resolve_reference(Path::new("README.md"), "docs/x.txt"),
            PathBuf::from("docs/x.txt")
        );
    }

    #[test]
    fn parse_inferred_payload_accepts_both_shapes() {
        let wrapped = r#"{"references":[{"pattern":"a/b.txt","rationale":"r","confidence":"c"}]}"#;
        assert_eq!(parse_inferred_payload(wrapped).unwrap().len(), 1);
        let bare = r#"[{"pattern":"a/b.txt","rationale":"r","confidence":"c"}]"#;
        assert_eq!(parse_inferred_payload(bare).unwrap().len(), 1);
        assert!(parse_inferred_payload("garbage").is_err());
        assert!(parse_inferred_payload("").unwrap().is_empty());
    }
}
