//! Plain-text corpus loading and the extractive stand-in generator.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use kbqa_core::{AnswerGenerator, Chunk, DocumentId, Result};
use kbqa_store::InMemoryDocumentStore;

/// Load every `.txt` / `.md` file under `root` as a document, one chunk per
/// paragraph. Returns the number of documents loaded.
pub async fn load_corpus(store: &InMemoryDocumentStore, root: &Path) -> Result<usize> {
    let files = collect_files(root)?;
    let mut loaded = 0;

    for path in files {
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        let passages = paragraphs(&content);
        if passages.is_empty() {
            debug!("Skipping empty file {}", path.display());
            continue;
        }

        let document_id = document_id(root, &path);
        store.upsert_document(&document_id, passages.as_slice()).await?;
        loaded += 1;
    }

    Ok(loaded)
}

fn collect_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if path.is_file() {
        if is_supported_file(path) {
            files.push(path.to_path_buf());
        }
    } else if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry_path = entry?.path();
            if entry_path.is_dir() {
                files.extend(collect_files(&entry_path)?);
            } else if is_supported_file(&entry_path) {
                files.push(entry_path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn is_supported_file(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(ext, "txt" | "md")
}

/// Path relative to the corpus root, `/`-separated.
fn document_id(root: &Path, path: &Path) -> DocumentId {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let relative = if relative.as_os_str().is_empty() {
        path.file_name().map(Path::new).unwrap_or(path)
    } else {
        relative
    };
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    DocumentId::new(parts.join("/"))
}

/// Split text into blank-line separated paragraphs, each folded onto one line.
pub fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }

    out
}

/// Answers by quoting the leading sentence of the best passages.
#[derive(Debug, Clone)]
pub struct ExtractiveGenerator {
    max_sentences: usize,
}

impl ExtractiveGenerator {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
        }
    }
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl AnswerGenerator for ExtractiveGenerator {
    fn model(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, _query: &str, context: &[Chunk]) -> Result<String> {
        let sentences: Vec<String> = context
            .iter()
            .take(self.max_sentences)
            .map(|chunk| format!("{} [{}]", first_sentence(&chunk.text), chunk.document_id))
            .collect();
        Ok(sentences.join(" "))
    }
}

fn first_sentence(text: &str) -> &str {
    match text.find(|c: char| matches!(c, '.' | '!' | '?' | '。')) {
        Some(i) => {
            let end = i + text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            text[..end].trim()
        }
        None => text.trim(),
    }
}
