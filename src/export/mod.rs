//! Output artifacts for completed runs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::Message;

const HTML_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Channel Export</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .message { margin-bottom: 15px; padding: 10px; border-bottom: 1px solid #eee; }
        .author { font-weight: bold; color: #7289da; }
        .timestamp { color: #999; font-size: 0.9em; }
        .content { margin-top: 5px; }
        .attachment { color: #555; font-size: 0.9em; }
    </style>
</head>
<body>
<h1>Channel Export</h1>
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Txt,
    Html,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Txt => "txt",
            ExportFormat::Html => "html",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "txt" | "text" => Ok(ExportFormat::Txt),
            "html" => Ok(ExportFormat::Html),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unknown export format '{0}'")]
    UnknownFormat(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("csv buffer error: {0}")]
    CsvBuffer(String),
}

/// `{target_id}_{YYYYmmdd_HHMMSS}.{ext}`
pub fn artifact_name(target_id: &str, at: DateTime<Utc>, format: ExportFormat) -> String {
    format!("{target_id}_{}.{}", at.format("%Y%m%d_%H%M%S"), format.extension())
}

pub fn render(format: ExportFormat, messages: &[Message]) -> Result<Vec<u8>, ExportError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(messages)?),
        ExportFormat::Csv => render_csv(messages),
        ExportFormat::Txt => Ok(render_txt(messages).into_bytes()),
        ExportFormat::Html => Ok(render_html(messages).into_bytes()),
    }
}

fn render_csv(messages: &[Message]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "timestamp",
        "author_id",
        "author_name",
        "content",
        "attachments",
        "embeds",
    ])?;
    for message in messages {
        let attachments = if message.attachments.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&message.attachments)?
        };
        let embeds = if message.embeds.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&message.embeds)?
        };
        writer.write_record([
            message.timestamp.to_rfc3339().as_str(),
            message.author.id.as_str(),
            message.author.name.as_str(),
            message.content.as_str(),
            attachments.as_str(),
            embeds.as_str(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| ExportError::CsvBuffer(err.to_string()))
}

fn render_txt(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let _ = writeln!(
            out,
            "[{}] {}: {}",
            message.timestamp.to_rfc3339(),
            message.author.name,
            message.content
        );
        for attachment in &message.attachments {
            let _ = writeln!(out, "  Attachment: {} ({})", attachment.filename, attachment.url);
        }
        for embed in &message.embeds {
            let _ = writeln!(out, "  Embed: {}", embed.title.as_deref().unwrap_or("No title"));
        }
        out.push('\n');
    }
    out
}

fn render_html(messages: &[Message]) -> String {
    let mut out = String::from(HTML_HEAD);
    for message in messages {
        let author = html_escape::encode_text(&message.author.name);
        let content = html_escape::encode_text(&message.content).replace('\n', "<br>");
        let _ = writeln!(out, "<div class=\"message\">");
        let _ = writeln!(out, "    <span class=\"author\">{author}</span>");
        let _ = writeln!(
            out,
            "    <span class=\"timestamp\">{}</span>",
            message.timestamp.to_rfc3339()
        );
        let _ = writeln!(out, "    <div class=\"content\">{content}</div>");
        for attachment in &message.attachments {
            let _ = writeln!(
                out,
                "    <div class=\"attachment\"><a href=\"{}\">{}</a></div>",
                html_escape::encode_double_quoted_attribute(&attachment.url),
                html_escape::encode_text(&attachment.filename)
            );
        }
        let _ = writeln!(out, "</div>");
    }
    out.push_str("</body></html>");
    out
}

/// Render and write one artifact under `dir`, returning its path.
pub async fn write_artifact(
    dir: &Path,
    target_id: &str,
    format: ExportFormat,
    messages: &[Message],
) -> Result<PathBuf, ExportError> {
    let rendered = render(format, messages)?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(artifact_name(target_id, Utc::now(), format));
    tokio::fs::write(&path, rendered).await?;
    log::info!("wrote {} messages to {}", messages.len(), path.display());
    Ok(path)
}
