//! Relay orchestration: novelty filter, message formatting, the poll/replay cycle and its scheduler.

use std::borrow::Cow;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use relay_adapters::AnnouncementSource;
use relay_core::{CanonicalItem, StatusSnapshot, WatermarkState};
use relay_storage::{FetchError, StateStore};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod sink;

pub use sink::{ChatSink, DiscordSink, DiscordSinkConfig, SinkError, DEFAULT_DISCORD_API_BASE};

pub const CRATE_NAME: &str = "relay-sync";

/// Chat payload budget in characters.
pub const MAX_PAYLOAD_CHARS: usize = 2000;
pub const ELLIPSIS: char = '…';
pub const UNKNOWN_TIME: &str = "unknown time";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub canvas_base_url: String,
    pub canvas_token: String,
    pub canvas_course_id: String,
    pub discord_token: String,
    pub discord_channel_id: String,
    pub discord_api_base: String,
    pub poll_interval: Duration,
    pub start_from: Option<DateTime<Utc>>,
    pub health_port: Option<u16>,
    pub replay_count: Option<usize>,
    pub state_path: Option<PathBuf>,
    pub page_size: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let poll_secs: u64 = parse_optional(&get, "POLL_INTERVAL_SECONDS")?.unwrap_or(600);
        if poll_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "POLL_INTERVAL_SECONDS",
                value: "0".to_string(),
                reason: "interval must be positive".to_string(),
            });
        }

        let start_from = match get("START_FROM") {
            Some(text) => Some(
                DateTime::parse_from_rfc3339(&text)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ConfigError::Invalid {
                        name: "START_FROM",
                        value: text.clone(),
                        reason: e.to_string(),
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            canvas_base_url: required("CANVAS_BASE_URL")?,
            canvas_token: required("CANVAS_TOKEN")?,
            canvas_course_id: required("CANVAS_COURSE_ID")?,
            discord_token: required("DISCORD_TOKEN")?,
            discord_channel_id: required("DISCORD_CHANNEL_ID")?,
            discord_api_base: get("DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_DISCORD_API_BASE.to_string()),
            poll_interval: Duration::from_secs(poll_secs),
            start_from,
            health_port: parse_optional(&get, "PORT")?,
            replay_count: parse_optional(&get, "REPLAY_COUNT")?,
            state_path: get("STATE_PATH").map(PathBuf::from),
            page_size: parse_optional(&get, "PAGE_SIZE")?.unwrap_or(50),
            user_agent: get("RELAY_USER_AGENT").unwrap_or_else(|| "announcement-relay/0.1".to_string()),
            http_timeout_secs: parse_optional(&get, "RELAY_HTTP_TIMEOUT_SECS")?.unwrap_or(20),
        })
    }
}

fn parse_optional<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(text) => text.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: text.clone(),
            reason: e.to_string(),
        }),
        None => Ok(None),
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("fetching announcements: {0}")]
    Fetch(#[from] FetchError),
    #[error("sending to chat: {0}")]
    Send(#[from] SinkError),
}

/// Items that still need delivery, in input order.
///
/// An item qualifies when there is no watermark yet, when its timestamp is strictly newer
/// than the watermark, or when its id is not in the seen-set. Because the id check is an OR,
/// an item sitting exactly on the watermark is re-selected once its id has been evicted
/// from the bounded seen-set.
pub fn select_new<'a>(items: &'a [CanonicalItem], state: &WatermarkState) -> Vec<&'a CanonicalItem> {
    items
        .iter()
        .filter(|item| {
            let newer = match (state.last_timestamp, item.timestamp) {
                (None, _) => true,
                (Some(mark), Some(ts)) => ts > mark,
                (Some(_), None) => false,
            };
            newer || !state.has_seen(&item.id)
        })
        .collect()
}

/// Renders one item as a single chat payload of at most [`MAX_PAYLOAD_CHARS`] characters.
///
/// Layout is header (title, posted line, blank line), body, footer (blank line, `<url>`).
/// Only the body is shortened; a cut body ends in [`ELLIPSIS`].
pub fn format_payload(item: &CanonicalItem) -> String {
    let posted = item
        .timestamp
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| UNKNOWN_TIME.to_string());
    let header = format!("**{}**\nPosted: {} by {}\n\n", item.title, posted, item.author);
    let footer = if item.url.is_empty() {
        String::new()
    } else {
        format!("\n\n<{}>", item.url)
    };

    let fixed = header.chars().count() + footer.chars().count();
    let body: Cow<'_, str> = match MAX_PAYLOAD_CHARS.checked_sub(fixed) {
        Some(available) if item.body.chars().count() <= available => Cow::Borrowed(item.body.as_str()),
        Some(available) if available > 0 => {
            let mut cut: String = item.body.chars().take(available - 1).collect();
            cut.push(ELLIPSIS);
            Cow::Owned(cut)
        }
        _ => Cow::Borrowed(""),
    };

    let payload = format!("{header}{body}{footer}");
    if fixed > MAX_PAYLOAD_CHARS {
        payload.chars().take(MAX_PAYLOAD_CHARS).collect()
    } else {
        payload
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleOptions {
    pub page_size: u32,
    /// How far back the first poll looks when no watermark exists.
    pub lookback: chrono::Duration,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            lookback: chrono::Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub since: DateTime<Utc>,
    pub fetched: usize,
    /// Delivered ids, oldest first.
    pub delivered: Vec<String>,
    /// State to commit; `None` when nothing was delivered.
    pub next_state: Option<WatermarkState>,
}

/// Sends the batch oldest first. `batch` is newest first, as the source returns it.
async fn deliver(sink: &dyn ChatSink, batch: &[&CanonicalItem]) -> Result<(), SinkError> {
    for item in batch.iter().rev() {
        sink.send(&format_payload(item)).await?;
        debug!(id = %item.id, "announcement posted");
    }
    Ok(())
}

/// One poll cycle over a borrowed state. The caller commits `next_state` only on success;
/// a failed send leaves the whole batch to be redelivered.
pub async fn run_cycle(
    source: &dyn AnnouncementSource,
    sink: &dyn ChatSink,
    state: &WatermarkState,
    now: DateTime<Utc>,
    options: CycleOptions,
) -> Result<CycleReport, RelayError> {
    let since = state.last_timestamp.unwrap_or(now - options.lookback);
    let fetched = source.fetch_since(Some(since), options.page_size).await?;
    let selected = select_new(&fetched, state);

    if selected.is_empty() {
        return Ok(CycleReport {
            since,
            fetched: fetched.len(),
            delivered: Vec::new(),
            next_state: None,
        });
    }

    deliver(sink, &selected).await?;

    let newest = fetched.iter().filter_map(|item| item.timestamp).max();
    let delivered: Vec<String> = selected.iter().rev().map(|item| item.id.clone()).collect();
    let next_state = state.committed(newest, delivered.iter().map(String::as_str));

    Ok(CycleReport {
        since,
        fetched: fetched.len(),
        delivered,
        next_state: Some(next_state),
    })
}

/// Delivers the `count` newest items oldest first without consulting or touching any state.
pub async fn run_replay(
    source: &dyn AnnouncementSource,
    sink: &dyn ChatSink,
    count: usize,
    options: CycleOptions,
) -> Result<usize, RelayError> {
    // pages at least as large as the replay window
    let page_size = u32::try_from(count)
        .unwrap_or(u32::MAX)
        .max(options.page_size);
    let fetched = source.fetch_since(None, page_size).await?;
    let newest: Vec<&CanonicalItem> = fetched.iter().take(count).collect();
    deliver(sink, &newest).await?;
    Ok(newest.len())
}

/// Long-lived relay service. Owns the watermark and serializes every cycle through one lock.
pub struct Relay {
    source: Box<dyn AnnouncementSource>,
    sink: Box<dyn ChatSink>,
    store: StateStore,
    options: CycleOptions,
    state: Mutex<WatermarkState>,
    status: watch::Sender<StatusSnapshot>,
}

impl Relay {
    pub fn new(
        source: Box<dyn AnnouncementSource>,
        sink: Box<dyn ChatSink>,
        store: StateStore,
        initial_state: WatermarkState,
        options: CycleOptions,
    ) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::from_state(&initial_state));
        Self {
            source,
            sink,
            store,
            options,
            state: Mutex::new(initial_state),
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub async fn state(&self) -> WatermarkState {
        self.state.lock().await.clone()
    }

    /// Runs one poll cycle, commits and persists on success. Persistence failures are logged
    /// and the in-memory state stays authoritative.
    pub async fn poll_once(&self) -> Result<CycleReport, RelayError> {
        let mut state = self.state.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %run_id, source = self.source.source_id());

        async {
            let started_at = Utc::now();
            let result =
                run_cycle(&*self.source, &*self.sink, &state, started_at, self.options).await;

            match &result {
                Ok(report) => {
                    if let Some(next) = &report.next_state {
                        *state = next.clone();
                        if let Err(err) = self.store.save(&state).await {
                            warn!(error = %err, "state not persisted; continuing with in-memory state");
                        }
                    }
                    info!(
                        since = %report.since,
                        fetched = report.fetched,
                        delivered = report.delivered.len(),
                        watermark = ?state.last_timestamp,
                        seen = state.seen_count(),
                        "poll cycle complete"
                    );
                }
                Err(err) => {
                    error!(error = %err, "poll cycle aborted; batch will be retried next tick");
                }
            }

            self.status.send_replace(
                StatusSnapshot::from_state(&state).with_cycle(started_at, result.is_ok()),
            );
            result
        }
        .instrument(span)
        .await
    }

    /// One-shot replay of the `count` newest items. Waits for any running cycle and leaves
    /// the watermark untouched.
    pub async fn replay(&self, count: usize) -> Result<usize, RelayError> {
        let _cycle = self.state.lock().await;
        let span = info_span!("replay", count, source = self.source.source_id());
        let delivered = run_replay(&*self.source, &*self.sink, count, self.options)
            .instrument(span)
            .await?;
        info!(delivered, "replay complete");
        Ok(delivered)
    }
}

/// Receiving end of the poll schedule. Ticks that arrive while a cycle runs coalesce into one.
#[derive(Debug)]
pub struct Ticker {
    rx: mpsc::Receiver<()>,
}

impl Ticker {
    /// Waits for the next tick; `None` once every trigger is gone.
    pub async fn tick(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Hand-driven tick source.
#[derive(Debug, Clone)]
pub struct ManualTrigger {
    tx: mpsc::Sender<()>,
}

impl ManualTrigger {
    /// Requests a cycle. Returns `false` when one is already pending.
    pub fn fire(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

pub fn manual_ticker() -> (ManualTrigger, Ticker) {
    let (tx, rx) = mpsc::channel(1);
    (ManualTrigger { tx }, Ticker { rx })
}

/// Fixed-interval schedule backed by a repeated scheduler job.
pub async fn interval_ticker(period: Duration) -> anyhow::Result<(JobScheduler, Ticker)> {
    let (trigger, ticker) = manual_ticker();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(period, move |_uuid, _l| {
        let trigger = trigger.clone();
        Box::pin(async move {
            if !trigger.fire() {
                debug!("previous tick still pending; coalescing");
            }
        })
    })
    .with_context(|| format!("creating poll job every {period:?}"))?;
    sched.add(job).await.context("adding poll job")?;
    sched.start().await.context("starting scheduler")?;
    Ok((sched, ticker))
}

/// Runs a cycle per tick until `shutdown` resolves or the ticker closes. A cycle already in
/// progress always finishes before the loop exits.
pub async fn run_until<F>(relay: &Relay, mut ticker: Ticker, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested; stopping poll loop");
                break;
            }
            tick = ticker.tick() => match tick {
                Some(()) => {
                    // outcome is logged and published inside poll_once
                    let _ = relay.poll_once().await;
                }
                None => {
                    info!("poll schedule closed");
                    break;
                }
            },
        }
    }
}
