//! Snapshot reconciliation: member resolution, tag taxonomy sync, and the run
//! driver with its single-flight guard, deadline and cron trigger.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forumsnap_adapters::{
    DiscordThreadSource, FixtureThreadSource, ThreadSource, DEFAULT_API_BASE,
};
use forumsnap_core::{
    channel_tags, normalize_thread, ChannelTag, MemberMap, RawThread, ThreadRecord,
};
use forumsnap_storage::{HttpClientConfig, StoreError, ThreadStore, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "forumsnap-sync";

/// Guild member listing page size; also the upstream maximum.
pub const MEMBER_PAGE_SIZE: usize = 1000;

/// Error entries kept per run; the rest are only counted.
pub const MAX_RECORDED_ERRORS: usize = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("neither DISCORD_CHANNEL_IDS nor DISCORD_GUILD_ID is set")]
    MissingScope,
    #[error("DISCORD_BOT_TOKEN is required unless FORUMSNAP_FIXTURE is set")]
    MissingToken,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub bot_token: Option<String>,
    pub guild_id: Option<String>,
    pub channel_ids: Vec<String>,
    pub api_base: String,
    pub fixture_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub rate_limit_per_sec: Option<u32>,
    pub run_deadline_secs: u64,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://forumsnap.db?mode=rwc".to_string(),
            bot_token: None,
            guild_id: None,
            channel_ids: Vec::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            fixture_path: None,
            scheduler_enabled: false,
            sync_cron: "0 */10 * * * *".to_string(),
            user_agent: "forumsnap-bot/0.1".to_string(),
            http_timeout_secs: 20,
            rate_limit_per_sec: None,
            run_deadline_secs: 300,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            bot_token: env_non_empty("DISCORD_BOT_TOKEN"),
            guild_id: env_non_empty("DISCORD_GUILD_ID"),
            channel_ids: std::env::var("DISCORD_CHANNEL_IDS")
                .map(|v| parse_channel_list(&v))
                .unwrap_or_default(),
            api_base: std::env::var("DISCORD_API_BASE").unwrap_or(defaults.api_base),
            fixture_path: env_non_empty("FORUMSNAP_FIXTURE").map(PathBuf::from),
            scheduler_enabled: std::env::var("FORUMSNAP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("FORUMSNAP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FORUMSNAP_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            rate_limit_per_sec: env_parse("FORUMSNAP_RATE_LIMIT_PER_SEC").filter(|n| *n > 0),
            run_deadline_secs: env_parse("FORUMSNAP_RUN_DEADLINE_SECS")
                .unwrap_or(defaults.run_deadline_secs),
            web_port: env_parse("FORUMSNAP_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    /// Channel list wins over guild-wide listing when both are configured.
    pub fn scope(&self) -> Result<ThreadScope, ConfigError> {
        if !self.channel_ids.is_empty() {
            return Ok(ThreadScope::Channels(self.channel_ids.clone()));
        }
        match &self.guild_id {
            Some(guild) => Ok(ThreadScope::Guild(guild.clone())),
            None => Err(ConfigError::MissingScope),
        }
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self.rate_limit_per_sec.map(|per_sec| TokenBucketConfig {
                capacity: per_sec,
                refill_every: Duration::from_secs(1) / per_sec,
            }),
            ..Default::default()
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Split a comma-separated id list: trimmed, empties dropped, first
/// occurrence kept.
pub fn parse_channel_list(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(ToString::to_string)
        .collect()
}

/// Which threads count as current for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadScope {
    Guild(String),
    Channels(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub scope: ThreadScope,
    /// Guild whose members back owner nickname resolution; `None` skips it.
    pub member_guild: Option<String>,
    pub run_deadline: Duration,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let scope = config.scope()?;
        let member_guild = match &scope {
            ThreadScope::Guild(guild) => Some(guild.clone()),
            ThreadScope::Channels(_) => config.guild_id.clone(),
        };
        Ok(Self {
            scope,
            member_guild,
            run_deadline: Duration::from_secs(config.run_deadline_secs.max(1)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub context: String,
    pub message: String,
}

/// Aggregate outcome handed back to the trigger layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub threads_processed: usize,
    pub tags_written: usize,
    pub errors: Vec<RunError>,
    pub suppressed_errors: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("snapshot store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug)]
struct RunState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    success: bool,
    committed: bool,
    threads_processed: usize,
    tags_written: usize,
    errors: Vec<RunError>,
    suppressed_errors: usize,
}

impl RunState {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            success: true,
            committed: false,
            threads_processed: 0,
            tags_written: 0,
            errors: Vec::new(),
            suppressed_errors: 0,
        }
    }

    fn record(&mut self, context: impl Into<String>, message: impl Into<String>) {
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(RunError {
                context: context.into(),
                message: message.into(),
            });
        } else {
            self.suppressed_errors += 1;
        }
    }

    fn fail(&mut self, context: impl Into<String>, message: impl Into<String>) {
        self.success = false;
        self.record(context, message);
    }

    fn expire(&mut self, deadline: Duration) {
        if !self.committed {
            // The uncommitted transaction was dropped with the run future.
            self.threads_processed = 0;
            self.tags_written = 0;
        }
        self.fail(
            "deadline",
            format!("run exceeded its {}s deadline", deadline.as_secs_f64()),
        );
    }

    fn finish(self) -> SyncRunResult {
        SyncRunResult {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            success: self.success,
            threads_processed: self.threads_processed,
            tags_written: self.tags_written,
            errors: self.errors,
            suppressed_errors: self.suppressed_errors,
        }
    }
}

/// Build the user id -> display name map for a whole guild.
///
/// Best effort: pagination stops at the first short or empty page, or at the
/// first failure, and whatever was accumulated is returned. A privilege error
/// is the expected outcome for bots without member access and is not logged as
/// a problem.
pub async fn resolve_members(source: &dyn ThreadSource, guild_id: &str) -> MemberMap {
    let mut members = MemberMap::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = match source
            .list_guild_members(guild_id, MEMBER_PAGE_SIZE, cursor.as_deref())
            .await
        {
            Ok(page) => page,
            Err(err) if err.is_permission_denied() => {
                info!(
                    guild_id,
                    resolved = members.len(),
                    "member listing not permitted; owner nicknames left unresolved"
                );
                break;
            }
            Err(err) => {
                warn!(
                    guild_id,
                    pages,
                    resolved = members.len(),
                    error = %err,
                    "member listing failed; keeping partial map"
                );
                break;
            }
        };
        pages += 1;

        let page_len = page.len();
        for member in &page {
            if let (Some(id), Some(name)) = (member.user_id(), member.display_name()) {
                members.insert(id, name);
            }
        }

        if page_len < MEMBER_PAGE_SIZE {
            break;
        }
        match page.last().and_then(|m| m.user_id()) {
            Some(last) => cursor = Some(last.to_string()),
            None => {
                warn!(guild_id, pages, "full member page ended without a user id; stopping");
                break;
            }
        }
    }

    debug!(guild_id, pages, resolved = members.len(), "member resolution finished");
    members
}

/// Fetch the tag taxonomy of every parent channel. Channels that fail to fetch
/// are skipped and reported back as error entries.
pub async fn collect_channel_tags(
    source: &dyn ThreadSource,
    parent_ids: &BTreeSet<String>,
) -> (Vec<ChannelTag>, Vec<RunError>) {
    let mut rows = Vec::new();
    let mut failures = Vec::new();

    for parent_id in parent_ids {
        match source.get_channel_info(parent_id).await {
            Ok(info) => {
                let tags = channel_tags(parent_id, &info);
                debug!(parent_id = %parent_id, tags = tags.len(), "channel taxonomy fetched");
                rows.extend(tags);
            }
            Err(err) => {
                warn!(parent_id = %parent_id, error = %err, "skipping channel taxonomy");
                failures.push(RunError {
                    context: format!("channel:{parent_id}"),
                    message: err.to_string(),
                });
            }
        }
    }

    (rows, failures)
}

pub struct SyncService {
    source: Arc<dyn ThreadSource>,
    store: ThreadStore,
    options: SyncOptions,
    run_guard: Mutex<()>,
}

impl SyncService {
    pub fn new(source: Arc<dyn ThreadSource>, store: ThreadStore, options: SyncOptions) -> Self {
        Self {
            source,
            store,
            options,
            run_guard: Mutex::new(()),
        }
    }

    /// Wire the configured source and store; migrations run here so the first
    /// trigger finds the tables.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let (source, fixture_guild): (Arc<dyn ThreadSource>, Option<String>) =
            match &config.fixture_path {
                Some(path) => {
                    let fixture = FixtureThreadSource::from_path(path)
                        .with_context(|| format!("loading fixture source {}", path.display()))?;
                    let guild = fixture.bundle().guild_id.clone();
                    (Arc::new(fixture), guild)
                }
                None => {
                    let token = config.bot_token.as_deref().ok_or(ConfigError::MissingToken)?;
                    let live = DiscordThreadSource::new(
                        &config.api_base,
                        token,
                        config.http_client_config(),
                    )?;
                    (Arc::new(live), None)
                }
            };

        // A replayed bundle names its own guild when nothing else scopes the run.
        let mut scoped = config.clone();
        if scoped.channel_ids.is_empty() && scoped.guild_id.is_none() {
            scoped.guild_id = fixture_guild;
        }
        let options = SyncOptions::from_config(&scoped)?;

        let store = ThreadStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("running snapshot migrations")?;
        Ok(Self::new(source, store, options))
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    /// Run now, waiting for any in-flight run to finish first.
    pub async fn run_once(&self) -> Result<SyncRunResult, SyncError> {
        let _guard = self.run_guard.lock().await;
        self.run_guarded().await
    }

    /// Run now unless a run is already in flight, in which case this trigger
    /// is dropped and `None` is returned.
    pub async fn run_exclusive(&self) -> Result<Option<SyncRunResult>, SyncError> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            info!("sync run already in flight; trigger skipped");
            return Ok(None);
        };
        self.run_guarded().await.map(Some)
    }

    async fn run_guarded(&self) -> Result<SyncRunResult, SyncError> {
        let mut run = RunState::new();
        let run_id = run.run_id;
        let deadline = self.options.run_deadline;
        let span = info_span!("sync_run", %run_id, source = self.source.name());

        let outcome = tokio::time::timeout(deadline, self.reconcile(&mut run))
            .instrument(span)
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(%run_id, error = %err, "sync run aborted");
                return Err(err);
            }
            Err(_elapsed) => {
                warn!(
                    %run_id,
                    deadline_secs = deadline.as_secs_f64(),
                    committed = run.committed,
                    "sync run hit its deadline"
                );
                run.expire(deadline);
            }
        }

        let result = run.finish();
        info!(
            %run_id,
            success = result.success,
            threads_processed = result.threads_processed,
            tags_written = result.tags_written,
            errors = result.errors.len(),
            "sync run finished"
        );
        Ok(result)
    }

    async fn reconcile(&self, run: &mut RunState) -> Result<(), SyncError> {
        let members = match &self.options.member_guild {
            Some(guild) => resolve_members(self.source.as_ref(), guild).await,
            None => MemberMap::new(),
        };

        let Some(threads) = self.fetch_threads(run).await else {
            return Ok(());
        };

        let records: Vec<ThreadRecord> = threads
            .iter()
            .map(|thread| normalize_thread(thread, &members))
            .collect();
        let parent_ids: BTreeSet<String> =
            records.iter().filter_map(|r| r.parent_id.clone()).collect();
        let (tags, tag_failures) = collect_channel_tags(self.source.as_ref(), &parent_ids).await;
        for failure in tag_failures {
            run.record(failure.context, failure.message);
        }

        let mut writer = self.store.begin_snapshot().await?;
        let (cleared_threads, cleared_tags) = writer.clear().await?;
        debug!(cleared_threads, cleared_tags, "replacing snapshot");

        for record in &records {
            match writer.upsert_thread(record).await {
                Ok(()) => run.threads_processed += 1,
                Err(err) => {
                    warn!(thread_id = %record.thread_id, error = %err, "thread upsert failed");
                    run.record(format!("thread:{}", record.thread_id), err.to_string());
                }
            }
        }
        for tag in &tags {
            match writer.upsert_channel_tag(tag).await {
                Ok(()) => run.tags_written += 1,
                Err(err) => {
                    warn!(
                        parent_id = %tag.parent_id,
                        tag_id = %tag.tag_id,
                        error = %err,
                        "tag upsert failed"
                    );
                    run.record(format!("tag:{}/{}", tag.parent_id, tag.tag_id), err.to_string());
                }
            }
        }

        writer.commit().await?;
        run.committed = true;
        Ok(())
    }

    /// `None` means the candidate set could not be fetched at all; the run is
    /// already marked failed.
    async fn fetch_threads(&self, run: &mut RunState) -> Option<Vec<RawThread>> {
        let threads = match &self.options.scope {
            ThreadScope::Guild(guild) => self.list_guild_threads(guild, run).await?,
            ThreadScope::Channels(channels) => match self.channel_scope_guild(channels).await {
                Some(guild) => {
                    let wanted: HashSet<&str> = channels.iter().map(String::as_str).collect();
                    let mut threads = self.list_guild_threads(&guild, run).await?;
                    threads.retain(|t| t.parent_id.as_deref().is_some_and(|p| wanted.contains(p)));
                    debug!(
                        guild_id = %guild,
                        kept = threads.len(),
                        "filtered active threads to channels"
                    );
                    threads
                }
                None => self.list_threads_per_channel(channels, run).await?,
            },
        };

        let mut seen = HashSet::new();
        let before = threads.len();
        let threads: Vec<RawThread> =
            threads.into_iter().filter(|t| seen.insert(t.id.clone())).collect();
        if threads.len() < before {
            debug!(duplicates = before - threads.len(), "dropped duplicate thread ids");
        }
        Some(threads)
    }

    async fn list_guild_threads(&self, guild: &str, run: &mut RunState) -> Option<Vec<RawThread>> {
        match self.source.list_active_threads(guild).await {
            Ok(threads) => Some(threads),
            Err(err) => {
                warn!(guild_id = %guild, error = %err, "active thread listing failed");
                run.fail("threads", err.to_string());
                None
            }
        }
    }

    /// Guild that owns the configured channels: the configured guild id, else
    /// the first channel whose metadata names one.
    async fn channel_scope_guild(&self, channels: &[String]) -> Option<String> {
        if let Some(guild) = &self.options.member_guild {
            return Some(guild.clone());
        }
        for channel in channels {
            match self.source.get_channel_info(channel).await {
                Ok(info) => {
                    if let Some(guild) = info.guild_id {
                        debug!(
                            channel_id = %channel,
                            guild_id = %guild,
                            "guild discovered from channel"
                        );
                        return Some(guild);
                    }
                }
                Err(err) => {
                    debug!(
                        channel_id = %channel,
                        error = %err,
                        "channel lookup failed during guild discovery"
                    );
                }
            }
        }
        None
    }

    /// Fallback when no guild is known: each channel's own listing. A failing
    /// channel is recorded and skipped; the run fails only if none listed.
    async fn list_threads_per_channel(
        &self,
        channels: &[String],
        run: &mut RunState,
    ) -> Option<Vec<RawThread>> {
        warn!(channels = channels.len(), "no guild id known; using per-channel thread listings");
        let mut threads = Vec::new();
        let mut listed = 0usize;
        for channel in channels {
            match self.source.list_channel_threads(channel).await {
                Ok(mut batch) => {
                    listed += 1;
                    threads.append(&mut batch);
                }
                Err(err) => {
                    warn!(channel_id = %channel, error = %err, "channel thread listing failed");
                    run.record(format!("channel:{channel}"), err.to_string());
                }
            }
        }
        if listed == 0 {
            run.fail(
                "threads",
                format!("none of the {} configured channels could be listed", channels.len()),
            );
            return None;
        }
        Some(threads)
    }
}

/// Build the cron trigger when enabled. Each firing runs in the scheduler's own
/// task and is skipped if the previous run has not finished.
pub async fn maybe_build_scheduler(
    service: Arc<SyncService>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(service, &config.sync_cron).await.map(Some)
}

pub async fn build_scheduler(service: Arc<SyncService>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let schedule = cron.to_string();
    let job = Job::new_async(cron, move |job_id, _sched| {
        let service = service.clone();
        let schedule = schedule.clone();
        Box::pin(async move {
            info!(%job_id, schedule = %schedule, "scheduled sync triggered");
            match service.run_exclusive().await {
                Ok(Some(result)) if !result.success => {
                    warn!(
                        %job_id,
                        run_id = %result.run_id,
                        errors = result.errors.len(),
                        "scheduled sync finished unsuccessfully"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(%job_id, error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use forumsnap_adapters::SourceError;
    use forumsnap_core::{ChannelInfo, DiscordUser, ForumTag, GuildMember};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum MemberFailure {
        DeniedOnFirstPage,
        ErrorOnPage(usize),
    }

    #[derive(Default)]
    struct StubSource {
        threads: Vec<RawThread>,
        threads_fail: bool,
        channel_threads: HashMap<String, Vec<RawThread>>,
        members: Vec<GuildMember>,
        member_failure: Option<MemberFailure>,
        channels: HashMap<String, ChannelInfo>,
        delay: Option<Duration>,
        member_cursors: StdMutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ThreadSource for StubSource {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn list_active_threads(
            &self,
            _guild_id: &str,
        ) -> Result<Vec<RawThread>, SourceError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.threads_fail {
                return Err(SourceError::NotFound("guild".into()));
            }
            Ok(self.threads.clone())
        }

        async fn list_channel_threads(
            &self,
            channel_id: &str,
        ) -> Result<Vec<RawThread>, SourceError> {
            self.channel_threads
                .get(channel_id)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(format!("channel {channel_id}")))
        }

        async fn list_guild_members(
            &self,
            _guild_id: &str,
            limit: usize,
            after: Option<&str>,
        ) -> Result<Vec<GuildMember>, SourceError> {
            let page_index = {
                let mut cursors = self.member_cursors.lock().unwrap();
                cursors.push(after.map(ToString::to_string));
                cursors.len() - 1
            };
            match self.member_failure {
                Some(MemberFailure::DeniedOnFirstPage) if page_index == 0 => {
                    return Err(SourceError::PermissionDenied {
                        route: "guild_members".into(),
                        status: 403,
                    });
                }
                Some(MemberFailure::ErrorOnPage(n)) if page_index == n => {
                    return Err(SourceError::NotFound("members page".into()));
                }
                _ => {}
            }
            let start = match after {
                Some(after) => self
                    .members
                    .iter()
                    .position(|m| m.user_id() == Some(after))
                    .map(|i| i + 1)
                    .unwrap_or(self.members.len()),
                None => 0,
            };
            Ok(self.members.iter().skip(start).take(limit).cloned().collect())
        }

        async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo, SourceError> {
            self.channels
                .get(channel_id)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(format!("channel {channel_id}")))
        }
    }

    fn thread(id: &str, parent: &str, owner: &str) -> RawThread {
        RawThread {
            id: id.to_string(),
            name: Some(format!("thread {id}")),
            owner_id: Some(owner.to_string()),
            parent_id: Some(parent.to_string()),
            member_count: Some(1),
            message_count: Some(1),
            ..Default::default()
        }
    }

    fn member(id: &str, nick: Option<&str>) -> GuildMember {
        GuildMember {
            user: Some(DiscordUser {
                id: id.to_string(),
                username: Some(format!("user-{id}")),
            }),
            nick: nick.map(ToString::to_string),
        }
    }

    fn numbered_members(count: usize) -> Vec<GuildMember> {
        (0..count).map(|i| member(&format!("{:06}", i + 1), None)).collect()
    }

    fn channel(id: &str, tags: &[(&str, &str)]) -> ChannelInfo {
        ChannelInfo {
            id: id.to_string(),
            guild_id: None,
            name: None,
            available_tags: Some(
                tags.iter()
                    .map(|(tag_id, name)| ForumTag {
                        id: tag_id.to_string(),
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }

    fn guild_options() -> SyncOptions {
        SyncOptions {
            scope: ThreadScope::Guild("G1".into()),
            member_guild: Some("G1".into()),
            run_deadline: Duration::from_secs(30),
        }
    }

    async fn migrated_store() -> ThreadStore {
        let store = ThreadStore::in_memory().await.expect("store");
        store.migrate().await.expect("migrate");
        store
    }

    async fn service_with(source: StubSource, options: SyncOptions) -> SyncService {
        SyncService::new(Arc::new(source), migrated_store().await, options)
    }

    fn sample_fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/discord/sample/bundle.json")
    }

    #[tokio::test]
    async fn member_resolution_follows_cursor_until_short_page() {
        let source = StubSource {
            members: numbered_members(2500),
            ..Default::default()
        };
        let map = resolve_members(&source, "G1").await;
        assert_eq!(map.len(), 2500);

        let cursors = source.member_cursors.lock().unwrap().clone();
        assert_eq!(
            cursors,
            vec![None, Some("001000".to_string()), Some("002000".to_string())]
        );
    }

    #[tokio::test]
    async fn member_resolution_stops_on_empty_page() {
        let source = StubSource {
            members: numbered_members(2000),
            ..Default::default()
        };
        let map = resolve_members(&source, "G1").await;
        assert_eq!(map.len(), 2000);
        assert_eq!(source.member_cursors.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn member_resolution_privilege_error_yields_empty_map() {
        let source = StubSource {
            members: numbered_members(10),
            member_failure: Some(MemberFailure::DeniedOnFirstPage),
            ..Default::default()
        };
        assert!(resolve_members(&source, "G1").await.is_empty());
    }

    #[tokio::test]
    async fn member_resolution_keeps_partial_map_on_mid_pagination_failure() {
        let source = StubSource {
            members: numbered_members(2500),
            member_failure: Some(MemberFailure::ErrorOnPage(1)),
            ..Default::default()
        };
        assert_eq!(resolve_members(&source, "G1").await.len(), MEMBER_PAGE_SIZE);
    }

    #[tokio::test]
    async fn member_resolution_prefers_nick() {
        let source = StubSource {
            members: vec![member("u1", Some("Nick")), member("u2", None)],
            ..Default::default()
        };
        let map = resolve_members(&source, "G1").await;
        assert_eq!(map.display_name("u1"), Some("Nick"));
        assert_eq!(map.display_name("u2"), Some("user-u2"));
    }

    #[tokio::test]
    async fn tag_collection_skips_empty_and_failing_channels() {
        let source = StubSource {
            channels: HashMap::from([
                ("C1".to_string(), channel("C1", &[])),
                ("C2".to_string(), channel("C2", &[("t1", "bug"), ("t2", "idea")])),
            ]),
            ..Default::default()
        };
        let parents = BTreeSet::from(["C1".to_string(), "C2".to_string(), "gone".to_string()]);
        let (rows, failures) = collect_channel_tags(&source, &parents).await;

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.parent_id == "C2"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].context, "channel:gone");
    }

    #[tokio::test]
    async fn end_to_end_fixture_run_writes_threads_and_tags() {
        let source = FixtureThreadSource::from_path(sample_fixture_path()).unwrap();
        let service = SyncService::new(Arc::new(source), migrated_store().await, guild_options());

        let result = service.run_once().await.unwrap();
        assert!(result.success);
        assert_eq!(result.threads_processed, 2);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(result.tags_written, 1);

        let store = service.store();
        assert_eq!(store.count_threads().await.unwrap(), 2);
        assert_eq!(
            store.list_channel_tags("C2").await.unwrap(),
            vec![ChannelTag {
                parent_id: "C2".into(),
                tag_id: "t1".into(),
                tag_name: "bug".into(),
                tag_emoji: None,
            }]
        );
        assert!(store.list_channel_tags("C1").await.unwrap().is_empty());

        let welcome = store.get_thread("1001").await.unwrap().unwrap();
        assert_eq!(welcome.owner_nickname.as_deref(), Some("Nick"));
        assert!(welcome.created_timestamp.is_some());
        let crash = store.get_thread("1002").await.unwrap().unwrap();
        assert_eq!(crash.owner_id.as_deref(), Some("u2"));
        assert_eq!(crash.owner_nickname, None);
        assert_eq!(crash.applied_tags.as_deref(), Some(r#"["t1"]"#));

        let body = serde_json::to_value(&result).unwrap();
        assert_eq!(body["success"], serde_json::json!(true));
        assert_eq!(body["threadsProcessed"], serde_json::json!(2));
        assert_eq!(body["errors"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn failing_thread_write_does_not_stop_the_batch() {
        let mut nameless = thread("2", "C1", "u1");
        nameless.name = None;
        let source = StubSource {
            threads: vec![thread("1", "C1", "u1"), nameless, thread("3", "C1", "u1")],
            channels: HashMap::from([("C1".to_string(), channel("C1", &[]))]),
            ..Default::default()
        };
        let service = service_with(source, guild_options()).await;

        let result = service.run_once().await.unwrap();
        assert!(result.success);
        assert_eq!(result.threads_processed, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].context, "thread:2");
        assert!(!result.errors[0].message.is_empty());

        let store = service.store();
        assert!(store.get_thread("1").await.unwrap().is_some());
        assert!(store.get_thread("2").await.unwrap().is_none());
        assert!(store.get_thread("3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn privilege_error_on_members_leaves_nicknames_null_without_errors() {
        let source = StubSource {
            threads: vec![thread("1", "C1", "u1")],
            members: vec![member("u1", Some("Nick"))],
            member_failure: Some(MemberFailure::DeniedOnFirstPage),
            channels: HashMap::from([("C1".to_string(), channel("C1", &[]))]),
            ..Default::default()
        };
        let service = service_with(source, guild_options()).await;

        let result = service.run_once().await.unwrap();
        assert!(result.success);
        assert!(result.errors.is_empty());
        let row = service.store().get_thread("1").await.unwrap().unwrap();
        assert_eq!(row.owner_nickname, None);
    }

    #[tokio::test]
    async fn failed_primary_fetch_keeps_previous_snapshot() {
        let store = migrated_store().await;
        let ok = SyncService::new(
            Arc::new(StubSource {
                threads: vec![thread("1", "C1", "u1")],
                ..Default::default()
            }),
            store.clone(),
            guild_options(),
        );
        assert!(ok.run_once().await.unwrap().success);

        let broken = SyncService::new(
            Arc::new(StubSource {
                threads_fail: true,
                ..Default::default()
            }),
            store.clone(),
            guild_options(),
        );
        let result = broken.run_once().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.threads_processed, 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].context, "threads");
        assert_eq!(store.count_threads().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn each_run_replaces_the_previous_snapshot() {
        let store = migrated_store().await;
        let first = SyncService::new(
            Arc::new(StubSource {
                threads: vec![thread("1", "C2", "u1"), thread("2", "C2", "u1")],
                channels: HashMap::from([(
                    "C2".to_string(),
                    channel("C2", &[("t1", "bug"), ("t2", "old")]),
                )]),
                ..Default::default()
            }),
            store.clone(),
            guild_options(),
        );
        first.run_once().await.unwrap();

        let second = SyncService::new(
            Arc::new(StubSource {
                threads: vec![thread("2", "C2", "u1")],
                channels: HashMap::from([("C2".to_string(), channel("C2", &[("t1", "bug")]))]),
                ..Default::default()
            }),
            store.clone(),
            guild_options(),
        );
        let result = second.run_once().await.unwrap();
        assert_eq!(result.threads_processed, 1);

        let ids = store
            .list_threads(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.thread_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["2".to_string()]);
        assert_eq!(store.list_channel_tags("C2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn channel_scope_skips_failing_channel() {
        let source = StubSource {
            channel_threads: HashMap::from([(
                "C1".to_string(),
                vec![thread("1", "C1", "u1"), thread("2", "C1", "u1")],
            )]),
            channels: HashMap::from([("C1".to_string(), channel("C1", &[]))]),
            ..Default::default()
        };
        let options = SyncOptions {
            scope: ThreadScope::Channels(vec!["C1".into(), "C404".into(), "C1".into()]),
            member_guild: None,
            run_deadline: Duration::from_secs(30),
        };
        let service = service_with(source, options).await;

        let result = service.run_once().await.unwrap();
        assert!(result.success);
        assert_eq!(result.threads_processed, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].context, "channel:C404");
    }

    #[tokio::test]
    async fn channel_scope_with_no_listable_channel_fails_run() {
        let options = SyncOptions {
            scope: ThreadScope::Channels(vec!["C404".into()]),
            member_guild: None,
            run_deadline: Duration::from_secs(30),
        };
        let service = service_with(StubSource::default(), options).await;
        let result = service.run_once().await.unwrap();
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.context == "threads"));
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let source = StubSource {
            threads: vec![thread("1", "C1", "u1")],
            delay: Some(Duration::from_millis(400)),
            ..Default::default()
        };
        let service = Arc::new(service_with(source, guild_options()).await);

        let in_flight = {
            let service = service.clone();
            tokio::spawn(async move { service.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(service.run_exclusive().await.unwrap().is_none());
        let first = in_flight.await.unwrap().unwrap();
        assert!(first.success);
        assert!(service.run_exclusive().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deadline_expiry_reports_partial_failure() {
        let source = StubSource {
            threads: vec![thread("1", "C1", "u1")],
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let options = SyncOptions {
            run_deadline: Duration::from_millis(100),
            ..guild_options()
        };
        let service = service_with(source, options).await;

        let result = service.run_once().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.threads_processed, 0);
        assert_eq!(result.errors.last().map(|e| e.context.as_str()), Some("deadline"));
        assert_eq!(service.store().count_threads().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_store_raises_instead_of_reporting() {
        let source = StubSource {
            threads: vec![thread("1", "C1", "u1")],
            ..Default::default()
        };
        let service = service_with(source, guild_options()).await;
        service.store().close().await;
        assert!(matches!(service.run_once().await, Err(SyncError::Store(_))));
    }

    #[test]
    fn error_list_is_capped() {
        let mut run = RunState::new();
        for i in 0..(MAX_RECORDED_ERRORS + 7) {
            run.record(format!("thread:{i}"), "boom");
        }
        let result = run.finish();
        assert_eq!(result.errors.len(), MAX_RECORDED_ERRORS);
        assert_eq!(result.suppressed_errors, 7);
        assert!(result.success);
    }

    #[test]
    fn channel_list_parsing_trims_and_dedupes() {
        assert_eq!(
            parse_channel_list(" C1, C2,,C1 ,C3 "),
            vec!["C1".to_string(), "C2".to_string(), "C3".to_string()]
        );
        assert!(parse_channel_list(" , ").is_empty());
    }

    #[test]
    fn scope_prefers_channel_list_and_requires_something() {
        let both = SyncConfig {
            guild_id: Some("G1".into()),
            channel_ids: vec!["C1".into()],
            ..Default::default()
        };
        assert_eq!(both.scope().unwrap(), ThreadScope::Channels(vec!["C1".into()]));
        let options = SyncOptions::from_config(&both).unwrap();
        assert_eq!(options.member_guild.as_deref(), Some("G1"));

        let guild_only = SyncConfig {
            guild_id: Some("G1".into()),
            ..Default::default()
        };
        assert_eq!(guild_only.scope().unwrap(), ThreadScope::Guild("G1".into()));

        assert!(matches!(
            SyncConfig::default().scope(),
            Err(ConfigError::MissingScope)
        ));
    }

    #[tokio::test]
    async fn channel_scope_with_known_guild_keeps_active_threads_of_listed_channels() {
        let source = StubSource {
            threads: vec![
                thread("1", "C1", "u1"),
                thread("2", "C2", "u1"),
                thread("3", "C3", "u1"),
            ],
            channels: HashMap::from([
                ("C1".to_string(), channel("C1", &[])),
                ("C2".to_string(), channel("C2", &[])),
            ]),
            ..Default::default()
        };
        let options = SyncOptions {
            scope: ThreadScope::Channels(vec!["C1".into(), "C2".into()]),
            member_guild: Some("G1".into()),
            run_deadline: Duration::from_secs(30),
        };
        let service = service_with(source, options).await;

        let result = service.run_once().await.unwrap();
        assert!(result.success);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(result.threads_processed, 2);
        assert!(service.store().get_thread("3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn channel_scope_discovers_guild_from_channel_metadata() {
        let mut c1 = channel("C1", &[]);
        c1.guild_id = Some("G1".into());
        let source = StubSource {
            threads: vec![thread("1", "C1", "u1"), thread("2", "C9", "u1")],
            channels: HashMap::from([("C1".to_string(), c1)]),
            ..Default::default()
        };
        let options = SyncOptions {
            scope: ThreadScope::Channels(vec!["C1".into()]),
            member_guild: None,
            run_deadline: Duration::from_secs(30),
        };
        let service = service_with(source, options).await;

        let result = service.run_once().await.unwrap();
        assert!(result.success);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(result.threads_processed, 1);
        assert!(service.store().get_thread("1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fixture_without_configured_scope_uses_bundle_guild() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SyncConfig {
            database_url: format!("sqlite://{}", dir.path().join("snap.db").display()),
            fixture_path: Some(sample_fixture_path()),
            ..Default::default()
        };
        let service = SyncService::from_config(&config).await.unwrap();

        let result = service.run_once().await.unwrap();
        assert!(result.success);
        assert_eq!(result.threads_processed, 2);
        let welcome = service.store().get_thread("1001").await.unwrap().unwrap();
        assert_eq!(welcome.owner_nickname.as_deref(), Some("Nick"));
        service.store().close().await;
    }

    #[tokio::test]
    async fn live_source_requires_token() {
        let config = SyncConfig {
            guild_id: Some("G1".into()),
            database_url: "sqlite::memory:".into(),
            ..Default::default()
        };
        let err = SyncService::from_config(&config).await.err().expect("missing token");
        assert!(err.to_string().contains("DISCORD_BOT_TOKEN"));
    }

    #[tokio::test]
    async fn scheduler_is_optional_and_validates_cron() {
        let service = Arc::new(service_with(StubSource::default(), guild_options()).await);
        let disabled = SyncConfig::default();
        assert!(maybe_build_scheduler(service.clone(), &disabled).await.unwrap().is_none());

        assert!(build_scheduler(service.clone(), "0 */5 * * * *").await.is_ok());
        assert!(build_scheduler(service, "every now and then").await.is_err());
    }
}
