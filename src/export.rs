//! Message source and media fetcher backed by a desktop chat export.
//!
//! The export directory holds a `result.json` with either a `chats.list` array
//! (full account export) or a single chat object, plus media files referenced
//! by relative path from each message.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::ingest::{MessageSource, SourceChannel, SourceMessage};
use crate::media::MediaFetcher;
use crate::model::{Media, MediaDescriptor, Message, User};

pub const EXPORT_FILE: &str = "result.json";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportRoot {
    Account { chats: ChatList },
    Single(ExportChat),
}

#[derive(Debug, Deserialize)]
struct ChatList {
    list: Vec<ExportChat>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExportChat {
    id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExportMessage {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    date_unixtime: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    from_id: Option<String>,
    #[serde(default)]
    text: ExportText,
    #[serde(default)]
    photo: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExportText {
    Plain(String),
    Rich(Vec<TextPart>),
}

impl Default for ExportText {
    fn default() -> Self {
        ExportText::Plain(String::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TextPart {
    Plain(String),
    Entity { text: String },
}

impl ExportText {
    fn flatten(&self) -> String {
        match self {
            ExportText::Plain(s) => s.clone(),
            ExportText::Rich(parts) => parts
                .iter()
                .map(|p| match p {
                    TextPart::Plain(s) => s.as_str(),
                    TextPart::Entity { text } => text.as_str(),
                })
                .collect(),
        }
    }
}

impl ExportMessage {
    /// The export's `date` field is local wall time with no offset; only
    /// `date_unixtime` is trusted.
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = self.date_unixtime.as_deref()?.parse().ok()?;
        DateTime::from_timestamp(secs, 0)
    }

    fn sender(&self) -> Option<User> {
        let user_id: i64 = self.from_id.as_deref()?.strip_prefix("user")?.parse().ok()?;
        let mut user = User::new(user_id);
        if let Some(name) = self.from.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            match name.split_once(' ') {
                Some((first, last)) => {
                    user.first_name = Some(first.to_string());
                    user.last_name = Some(last.trim().to_string());
                }
                None => user.first_name = Some(name.to_string()),
            }
        }
        Some(user)
    }

    fn media(&self) -> Vec<MediaDescriptor> {
        let photo = self.photo.as_deref().map(|p| ("photo", p));
        let file = self
            .file
            .as_deref()
            .map(|p| (self.media_type.as_deref().unwrap_or("file"), p));
        photo
            .into_iter()
            .chain(file)
            // Files skipped at export time are recorded as "(File not included...)".
            .filter(|(_, path)| !path.starts_with('('))
            .map(|(kind, path)| MediaDescriptor {
                message_id: self.id,
                kind: kind.to_string(),
                path: path.to_string(),
            })
            .collect()
    }

    fn to_source(&self, channel_id: i64) -> SourceMessage {
        let text = self.text.flatten();
        let sender = self.sender();
        let body = (!text.is_empty()).then_some(text.as_str());
        let mut message = Message::new(channel_id, self.id, body);
        message.message_utc = self.timestamp();
        message.sender_id = sender.as_ref().map(|u| u.user_id);
        SourceMessage {
            message,
            sender,
            media: self.media(),
        }
    }
}

/// Chats parsed from a `result.json`.
#[derive(Debug)]
pub struct ExportSource {
    chats: Vec<ExportChat>,
}

impl ExportSource {
    /// Read `result.json` from an export directory.
    pub async fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(EXPORT_FILE);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let source = Self::from_json(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        info!(path = %path.display(), chats = source.chats.len(), "loaded chat export");
        Ok(source)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let chats = match serde_json::from_str::<ExportRoot>(raw)? {
            ExportRoot::Account { chats } => chats.list,
            ExportRoot::Single(chat) => vec![chat],
        };
        Ok(Self { chats })
    }

    fn chat(&self, channel_id: i64) -> Result<&ExportChat> {
        self.chats
            .iter()
            .find(|c| c.id == channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} not in export"))
    }
}

#[async_trait]
impl MessageSource for ExportSource {
    async fn channels(&self) -> Result<Vec<SourceChannel>> {
        Ok(self
            .chats
            .iter()
            .map(|c| SourceChannel {
                channel_id: c.id,
                name: c.name.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn participants(&self, channel_id: i64) -> Result<Vec<User>> {
        // Exports carry no member list; everyone who posted is a participant.
        let mut seen = HashSet::new();
        Ok(self
            .chat(channel_id)?
            .messages
            .iter()
            .filter_map(ExportMessage::sender)
            .filter(|u| seen.insert(u.user_id))
            .collect())
    }

    async fn messages_after(
        &self,
        channel_id: i64,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        let mut picked: Vec<&ExportMessage> = self
            .chat(channel_id)?
            .messages
            .iter()
            .filter(|m| m.kind == "message")
            .filter(|m| after.map_or(true, |a| m.id > a))
            .collect();
        picked.sort_by_key(|m| m.id);
        picked.truncate(limit);
        debug!(channel_id, ?after, count = picked.len(), "read export messages");
        Ok(picked.into_iter().map(|m| m.to_source(channel_id)).collect())
    }
}

/// Copies media files out of an export directory into the archive's media dir.
#[derive(Debug, Clone)]
pub struct ExportFetcher {
    export_dir: PathBuf,
    media_dir: PathBuf,
}

impl ExportFetcher {
    pub fn new(export_dir: impl Into<PathBuf>, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
            media_dir: media_dir.into(),
        }
    }
}

#[async_trait]
impl MediaFetcher for ExportFetcher {
    async fn fetch(&self, channel_id: i64, descriptor: &MediaDescriptor) -> Result<Media> {
        let rel = Path::new(&descriptor.path);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
            bail!("media path escapes the export dir: {}", descriptor.path);
        }
        let file_name = rel
            .file_name()
            .ok_or_else(|| anyhow!("media path has no file name: {}", descriptor.path))?;

        let src = self.export_dir.join(rel);
        let dest_dir = self.media_dir.join(channel_id.to_string());
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
        let dest = dest_dir.join(format!(
            "{}_{}",
            descriptor.message_id,
            file_name.to_string_lossy()
        ));
        tokio::fs::copy(&src, &dest)
            .await
            .with_context(|| format!("failed to copy {}", src.display()))?;

        Ok(Media {
            channel_id,
            message_id: descriptor.message_id,
            kind: descriptor.kind.clone(),
            path: dest.to_string_lossy().into_owned(),
        })
    }
}
