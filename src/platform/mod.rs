//! The remote platform's paginated message API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::Method;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::transport::{TransportClient, TransportError, TransportRequest, TransportResult};

/// Milliseconds between the Unix epoch and the platform's id epoch.
pub const ID_EPOCH_MS: i64 = 1_420_070_400_000;

pub const MAX_PAGE_SIZE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    #[serde(alias = "username")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    #[serde(deserialize_with = "emoji_name")]
    pub emoji: String,
    pub count: u32,
}

/// One retrievable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, alias = "edited_timestamp")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

fn emoji_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Emoji {
        Plain(String),
        Object { name: Option<String> },
    }

    Ok(match Emoji::deserialize(deserializer)? {
        Emoji::Plain(name) => name,
        Emoji::Object { name } => name.unwrap_or_default(),
    })
}

/// Ids are decimal snowflakes of at most 20 digits.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 20
        && id.bytes().all(|byte| byte.is_ascii_digit())
        && id.parse::<u64>().is_ok()
}

/// Numeric order for ids.
pub fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Smallest id that could have been issued at `at`.
pub fn id_at(at: DateTime<Utc>) -> String {
    let offset = (at.timestamp_millis() - ID_EPOCH_MS).max(0) as u64;
    (offset << 22).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub channel_id: String,
    /// Return units strictly newer than this id.
    pub after: Option<String>,
    pub limit: u8,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Units newer than `query.after`, oldest first.
    async fn fetch_page(&self, query: &PageQuery) -> TransportResult<Vec<Message>>;

    /// Release the underlying session.
    async fn close(&self) {}
}

/// Builds a source for a job's credential. One per job.
pub trait MessageSourceFactory: Send + Sync {
    fn open(&self, session_id: &str, credential: &str) -> TransportResult<Arc<dyn MessageSource>>;

    /// Tear down whatever `open` set up for `session_id`, for jobs that ended
    /// without closing their source.
    fn release(&self, _session_id: &str) {}
}

/// REST source reached through a [`TransportClient`].
#[derive(Debug)]
pub struct RestMessageSource {
    transport: Arc<TransportClient>,
    base: Url,
    credential: String,
}

impl RestMessageSource {
    pub fn new(transport: Arc<TransportClient>, base: Url, credential: impl Into<String>) -> Self {
        Self {
            transport,
            base,
            credential: credential.into(),
        }
    }

    pub fn page_url(&self, query: &PageQuery) -> TransportResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["channels", query.channel_id.as_str(), "messages"]);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("limit", &query.limit.clamp(1, MAX_PAGE_SIZE).to_string());
            pairs.append_pair("after", query.after.as_deref().unwrap_or("0"));
        }
        Ok(url)
    }
}

#[async_trait]
impl MessageSource for RestMessageSource {
    async fn fetch_page(&self, query: &PageQuery) -> TransportResult<Vec<Message>> {
        let url = self.page_url(query)?;
        let request = TransportRequest::new(Method::GET, url)
            .header("Authorization", self.credential.clone())
            .header("Accept", "*/*")
            .header("X-Discord-Locale", "en-US");

        let response = self.transport.send(request).await?;
        let mut page: Vec<Message> = response.json().map_err(|err| TransportError::Status {
            status: response.status(),
            body: format!("unparseable message page: {err}"),
        })?;
        page.sort_by(|a, b| compare_ids(&a.id, &b.id));
        log::debug!(
            "fetched {} messages from channel {} after {:?}",
            page.len(),
            query.channel_id,
            query.after
        );
        Ok(page)
    }

    async fn close(&self) {
        self.transport.close();
    }
}

/// Opens [`RestMessageSource`]s on clients from a shared registry.
#[derive(Debug, Clone)]
pub struct RestSourceFactory {
    registry: crate::transport::TransportRegistry,
    base: Url,
}

impl RestSourceFactory {
    pub fn new(registry: crate::transport::TransportRegistry, base: Url) -> Self {
        Self { registry, base }
    }
}

impl MessageSourceFactory for RestSourceFactory {
    fn open(&self, session_id: &str, credential: &str) -> TransportResult<Arc<dyn MessageSource>> {
        let transport = self.registry.get_or_create(session_id)?;
        Ok(Arc::new(RestMessageSource::new(transport, self.base.clone(), credential)))
    }

    fn release(&self, session_id: &str) {
        if self.registry.remove(session_id) {
            log::info!("released transport session {session_id}");
        }
    }
}
