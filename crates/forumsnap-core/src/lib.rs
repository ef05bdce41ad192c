//! Core domain model for forumsnap: raw upstream shapes, persisted row shapes,
//! and the pure mapping between them.

use std::collections::HashMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "forumsnap-core";

/// Thread object as returned by the upstream thread listings.
///
/// Every field except `id` is optional; the upstream omits fields freely and
/// nothing here substitutes defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawThread {
    pub id: String,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub owner_id: Option<String>,
    pub parent_id: Option<String>,
    pub member_count: Option<i64>,
    pub message_count: Option<i64>,
    pub available_tags: Option<JsonValue>,
    pub applied_tags: Option<JsonValue>,
    pub thread_metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: Option<String>,
}

/// One entry of a guild member listing page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuildMember {
    pub user: Option<DiscordUser>,
    pub nick: Option<String>,
}

impl GuildMember {
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Guild nickname when set, otherwise the account username.
    pub fn display_name(&self) -> Option<&str> {
        self.nick
            .as_deref()
            .filter(|nick| !nick.is_empty())
            .or_else(|| self.user.as_ref().and_then(|u| u.username.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForumTag {
    pub id: String,
    pub name: String,
    pub emoji_id: Option<String>,
    pub emoji_name: Option<String>,
    #[serde(default)]
    pub moderated: bool,
}

impl ForumTag {
    pub fn emoji(&self) -> Option<&str> {
        self.emoji_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.emoji_id.as_deref())
    }
}

/// Channel metadata subset needed for tag taxonomy sync.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    /// Owning guild; lets a channel-scoped run use the guild-wide listing.
    pub guild_id: Option<String>,
    pub name: Option<String>,
    pub available_tags: Option<Vec<ForumTag>>,
}

impl ChannelInfo {
    pub fn tags(&self) -> &[ForumTag] {
        self.available_tags.as_deref().unwrap_or_default()
    }
}

/// Run-scoped user id -> display name lookup. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberMap {
    names: HashMap<String, String>,
}

impl MemberMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user_id: impl Into<String>, display_name: impl Into<String>) {
        self.names.insert(user_id.into(), display_name.into());
    }

    pub fn display_name(&self, user_id: &str) -> Option<&str> {
        self.names.get(user_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MemberMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Persisted thread row shape (`discord_threads`), minus `last_updated` which
/// the store stamps at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub thread_name: Option<String>,
    pub topic: Option<String>,
    pub owner_id: Option<String>,
    pub owner_nickname: Option<String>,
    pub parent_id: Option<String>,
    pub member_count: Option<i64>,
    pub message_count: Option<i64>,
    pub available_tags: Option<String>,
    pub applied_tags: Option<String>,
    pub thread_metadata: Option<String>,
    pub created_timestamp: Option<i64>,
}

/// Persisted tag row shape (`discord_channel_tags`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTag {
    pub parent_id: String,
    pub tag_id: String,
    pub tag_name: String,
    pub tag_emoji: Option<String>,
}

/// Map a raw thread into its row shape. Infallible: malformed input is carried
/// through as-is and left for the store to accept or reject.
pub fn normalize_thread(raw: &RawThread, members: &MemberMap) -> ThreadRecord {
    let owner_nickname = raw
        .owner_id
        .as_deref()
        .and_then(|owner| members.display_name(owner))
        .map(ToString::to_string);

    ThreadRecord {
        thread_id: raw.id.clone(),
        thread_name: raw.name.clone(),
        topic: raw.topic.clone(),
        owner_id: raw.owner_id.clone(),
        owner_nickname,
        parent_id: raw.parent_id.clone(),
        member_count: raw.member_count,
        message_count: raw.message_count,
        available_tags: raw.available_tags.as_ref().map(JsonValue::to_string),
        applied_tags: raw.applied_tags.as_ref().map(JsonValue::to_string),
        thread_metadata: raw.thread_metadata.as_ref().map(JsonValue::to_string),
        created_timestamp: raw.thread_metadata.as_ref().and_then(create_timestamp_millis),
    }
}

fn create_timestamp_millis(metadata: &JsonValue) -> Option<i64> {
    let text = metadata.get("create_timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.timestamp_millis())
}

/// Tag rows for one parent channel. Empty when the channel has no taxonomy.
pub fn channel_tags(parent_id: &str, info: &ChannelInfo) -> Vec<ChannelTag> {
    info.tags()
        .iter()
        .map(|tag| ChannelTag {
            parent_id: parent_id.to_string(),
            tag_id: tag.id.clone(),
            tag_name: tag.name.clone(),
            tag_emoji: tag.emoji().map(ToString::to_string),
        })
        .collect()
}
