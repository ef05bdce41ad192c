//! Remote thread source contract + live (Discord HTTP) and fixture-backed
//! implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forumsnap_core::{ChannelInfo, GuildMember, RawThread};
use forumsnap_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "forumsnap-adapters";

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("permission denied (http {status}) on {route}")]
    PermissionDenied { route: String, status: u16 },
    #[error("{route}: {source}")]
    Fetch {
        route: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding {route} response: {source}")]
    Decode {
        route: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} not found")]
    NotFound(String),
}

impl SourceError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    fn from_fetch(route: &str, err: FetchError) -> Self {
        match err.status() {
            Some(status @ (401 | 403)) => Self::PermissionDenied {
                route: route.to_string(),
                status,
            },
            Some(404) => Self::NotFound(route.to_string()),
            _ => Self::Fetch {
                route: route.to_string(),
                source: err,
            },
        }
    }
}

/// Upstream thread API. Every call is a single attempt.
#[async_trait]
pub trait ThreadSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_active_threads(&self, guild_id: &str) -> Result<Vec<RawThread>, SourceError>;

    /// Threads of one channel as the channel-level listing reports them, all
    /// pages. The sync driver prefers the guild-wide active listing and only
    /// falls back to this when no guild id is known.
    async fn list_channel_threads(&self, channel_id: &str) -> Result<Vec<RawThread>, SourceError>;

    /// One page of guild members with user ids strictly greater than `after`.
    async fn list_guild_members(
        &self,
        guild_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<GuildMember>, SourceError>;

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo, SourceError>;
}

#[derive(Debug, Deserialize)]
struct ThreadListing {
    #[serde(default)]
    threads: Vec<JsonValue>,
    #[serde(default)]
    has_more: bool,
}

/// Page size for the per-channel public thread listing (upstream maximum).
const CHANNEL_THREAD_PAGE_SIZE: usize = 100;

/// Paging cursor of the per-channel listing: the archive timestamp of the
/// last entry on the page.
fn archive_timestamp(entry: &JsonValue) -> Option<String> {
    entry
        .get("thread_metadata")?
        .get("archive_timestamp")?
        .as_str()
        .map(ToString::to_string)
}

/// Decode thread entries one by one so a single malformed entry does not sink
/// the whole listing.
fn decode_threads(route: &str, entries: Vec<JsonValue>) -> Vec<RawThread> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<RawThread>(entry) {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!(route, error = %err, "skipping malformed thread entry");
                None
            }
        })
        .collect()
}

pub struct DiscordThreadSource {
    api_base: String,
    http: HttpFetcher,
}

impl DiscordThreadSource {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: &str,
        mut http: HttpClientConfig,
    ) -> Result<Self> {
        http.authorization = Some(format!("Bot {bot_token}"));
        let http = HttpFetcher::new(http).context("building discord http client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        route: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.api_base, path);
        let resp = self
            .http
            .fetch_bytes(route, &url, query)
            .await
            .map_err(|err| SourceError::from_fetch(route, err))?;
        serde_json::from_slice(&resp.body).map_err(|source| SourceError::Decode {
            route: route.to_string(),
            source,
        })
    }
}

#[async_trait]
impl ThreadSource for DiscordThreadSource {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn list_active_threads(&self, guild_id: &str) -> Result<Vec<RawThread>, SourceError> {
        let route = "guild_active_threads";
        let listing: ThreadListing = self
            .get_json(route, &format!("/guilds/{guild_id}/threads/active"), &[])
            .await?;
        Ok(decode_threads(route, listing.threads))
    }

    async fn list_channel_threads(&self, channel_id: &str) -> Result<Vec<RawThread>, SourceError> {
        let route = "channel_public_threads";
        let path = format!("/channels/{channel_id}/threads/archived/public");
        let mut threads = Vec::new();
        let mut before: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut query = vec![("limit", CHANNEL_THREAD_PAGE_SIZE.to_string())];
            if let Some(before) = &before {
                query.push(("before", before.clone()));
            }
            let listing: ThreadListing = self.get_json(route, &path, &query).await?;
            pages += 1;

            let cursor = listing.threads.last().and_then(archive_timestamp);
            threads.extend(decode_threads(route, listing.threads));
            if !listing.has_more {
                break;
            }
            match cursor {
                Some(next) if before.as_deref() != Some(next.as_str()) => before = Some(next),
                _ => {
                    warn!(channel_id, pages, "listing reports more pages but gave no new cursor");
                    break;
                }
            }
        }

        debug!(channel_id, pages, threads = threads.len(), "channel threads listed");
        Ok(threads)
    }

    async fn list_guild_members(
        &self,
        guild_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<GuildMember>, SourceError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        self.get_json("guild_members", &format!("/guilds/{guild_id}/members"), &query)
            .await
    }

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo, SourceError> {
        self.get_json("channel", &format!("/channels/{channel_id}"), &[])
            .await
    }
}

/// Captured upstream state, replayable without network access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub threads: Vec<JsonValue>,
    #[serde(default)]
    pub members: Vec<GuildMember>,
    /// Listing members answers with a privilege error when set.
    #[serde(default)]
    pub members_denied: bool,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelInfo>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub struct FixtureThreadSource {
    bundle: FixtureBundle,
    threads: Vec<RawThread>,
}

impl FixtureThreadSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        let threads = decode_threads("fixture_threads", bundle.threads.clone());
        Self { bundle, threads }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }

    fn check_guild(&self, route: &str, guild_id: &str) -> Result<(), SourceError> {
        match &self.bundle.guild_id {
            Some(known) if known != guild_id => {
                Err(SourceError::NotFound(format!("{route} {guild_id}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ThreadSource for FixtureThreadSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn list_active_threads(&self, guild_id: &str) -> Result<Vec<RawThread>, SourceError> {
        self.check_guild("guild_active_threads", guild_id)?;
        Ok(self.threads.clone())
    }

    async fn list_channel_threads(&self, channel_id: &str) -> Result<Vec<RawThread>, SourceError> {
        if !self.bundle.channels.contains_key(channel_id) {
            return Err(SourceError::NotFound(format!("channel {channel_id}")));
        }
        Ok(self
            .threads
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(channel_id))
            .cloned()
            .collect())
    }

    async fn list_guild_members(
        &self,
        guild_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<GuildMember>, SourceError> {
        self.check_guild("guild_members", guild_id)?;
        if self.bundle.members_denied {
            return Err(SourceError::PermissionDenied {
                route: "guild_members".into(),
                status: 403,
            });
        }
        let mut members = self
            .bundle
            .members
            .iter()
            .filter(|m| match (m.user_id(), after) {
                (Some(id), Some(after)) => snowflake_after(id, after),
                _ => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        members.sort_by(|a, b| {
            snowflake_key(a.user_id().unwrap_or_default())
                .cmp(&snowflake_key(b.user_id().unwrap_or_default()))
        });
        members.truncate(limit);
        Ok(members)
    }

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo, SourceError> {
        self.bundle
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("channel {channel_id}")))
    }
}

/// Snowflakes compare numerically; shorter ids sort first.
fn snowflake_key(id: &str) -> (usize, &str) {
    (id.len(), id)
}

fn snowflake_after(id: &str, after: &str) -> bool {
    snowflake_key(id) > snowflake_key(after)
}
