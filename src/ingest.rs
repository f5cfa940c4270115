//! Loading tasks from files.
//!
//! Task files are either structured documents (JSON, YAML, TOML) or markdown
//! files that carry the task as frontmatter (`---` YAML or `+++` TOML) or in
//! the first fenced ```json / ```yaml / ```toml / ```task block.

use std::path::Path;

use tracing::{debug, info};

use crate::{ProcessorError, Task, TaskDocument, TaskProcessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
    Toml,
    Markdown,
}

impl DocumentFormat {
    /// Picks the format from the file extension, falling back to sniffing the
    /// content.
    pub fn detect(path: &Path, content: &str) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("json") => DocumentFormat::Json,
            Some("yaml" | "yml") => DocumentFormat::Yaml,
            Some("toml") => DocumentFormat::Toml,
            Some("md" | "markdown") => DocumentFormat::Markdown,
            _ => Self::sniff(content),
        }
    }

    fn sniff(content: &str) -> Self {
        let trimmed = content.trim_start();
        if trimmed.starts_with('{') {
            DocumentFormat::Json
        } else if trimmed.starts_with("---") || trimmed.starts_with("+++") || trimmed.starts_with('#')
        {
            DocumentFormat::Markdown
        } else {
            DocumentFormat::Yaml
        }
    }
}

/// Parses `content` into an unvalidated [`TaskDocument`].
pub fn parse_task_document(
    content: &str,
    format: DocumentFormat,
) -> Result<TaskDocument, ProcessorError> {
    match format {
        DocumentFormat::Json => {
            serde_json::from_str(content).map_err(|e| ProcessorError::Parse(format!("json: {}", e)))
        }
        DocumentFormat::Yaml => parse_yaml(content),
        DocumentFormat::Toml => parse_toml(content),
        DocumentFormat::Markdown => parse_markdown(content),
    }
}

fn parse_yaml(content: &str) -> Result<TaskDocument, ProcessorError> {
    serde_yaml::from_str(content).map_err(|e| ProcessorError::Parse(format!("yaml: {}", e)))
}

fn parse_toml(content: &str) -> Result<TaskDocument, ProcessorError> {
    toml::from_str(content).map_err(|e| ProcessorError::Parse(format!("toml: {}", e)))
}

fn parse_markdown(content: &str) -> Result<TaskDocument, ProcessorError> {
    let content = content.trim_start();

    let frontmatter = match split_frontmatter(content, "---") {
        Some((front, body)) => Some((parse_yaml(front)?, body)),
        None => match split_frontmatter(content, "+++") {
            Some((front, body)) => Some((parse_toml(front)?, body)),
            None => None,
        },
    };
    if let Some((mut doc, body)) = frontmatter {
        let body = body.trim();
        if doc.description.is_none() && !body.is_empty() {
            doc.description = Some(body.to_string());
        }
        return Ok(doc);
    }

    if let Some((lang, block)) = first_task_block(content) {
        debug!(lang, "task definition found in fenced block");
        return match lang {
            "json" => serde_json::from_str(block)
                .map_err(|e| ProcessorError::Parse(format!("json block: {}", e))),
            "toml" => parse_toml(block),
            _ => parse_yaml(block),
        };
    }

    Err(ProcessorError::Parse(
        "markdown has no frontmatter or task code block".to_string(),
    ))
}

/// Splits `---\n<front>\n---\n<body>` into front and body.
fn split_frontmatter<'a>(content: &'a str, delimiter: &str) -> Option<(&'a str, &'a str)> {
    let rest = content.strip_prefix(delimiter)?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;

    let closing = format!("\n{}", delimiter);
    let (front, after) = if rest.starts_with(delimiter) {
        ("", &rest[delimiter.len()..])
    } else {
        let end = rest.find(&closing)?;
        (&rest[..end], &rest[end + closing.len()..])
    };
    Some((front, after))
}

fn first_task_block(content: &str) -> Option<(&str, &str)> {
    let mut lines = content.split_inclusive('\n');
    let mut offset = 0;

    while let Some(line) = lines.next() {
        let start = offset;
        offset += line.len();

        let Some(info) = line.trim().strip_prefix("```") else {
            continue;
        };
        let lang = match info.trim().to_ascii_lowercase().as_str() {
            "json" => "json",
            "yaml" | "yml" | "task" => "yaml",
            "toml" => "toml",
            _ => {
                // skip over the unrelated block
                for inner in lines.by_ref() {
                    offset += inner.len();
                    if inner.trim().starts_with("```") {
                        break;
                    }
                }
                continue;
            }
        };

        let body_start = offset;
        for inner in lines.by_ref() {
            if inner.trim().starts_with("```") {
                return Some((lang, &content[body_start..offset]));
            }
            offset += inner.len();
        }
        debug!(start, "unterminated fenced block");
        return None;
    }

    None
}

/// Reads, parses and validates a task file. Tool tasks loaded from files must
/// declare `args`.
pub async fn load_task_file(path: impl AsRef<Path>) -> Result<Task, ProcessorError> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProcessorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let format = DocumentFormat::detect(path, &content);
    debug!(path = %path.display(), ?format, "parsing task file");
    parse_task_document(&content, format)?.into_task(true)
}

impl TaskProcessor {
    /// Loads a task file and hands the task to [`TaskProcessor::process_task`].
    pub async fn process_task_file(&self, path: impl AsRef<Path>) -> Result<Task, ProcessorError> {
        let path = path.as_ref();
        let task = load_task_file(path).await?;
        info!(path = %path.display(), task_id = %task.id, "task file loaded");
        self.process_task(task).await
    }
}
