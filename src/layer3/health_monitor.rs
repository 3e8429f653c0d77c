// Connection Health Monitor - quote-stream health and uptime derivation
// Combines terminal state with price-update freshness on periodic ticks

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc, Weekday};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::core::types::{ConnectionHealthStatus, TerminalState};
use crate::layer2::dispatcher::{ListenerResult, SyncListener};
use crate::layer3::reservoir::Reservoir;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const BROKER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// Uptime is tracked over a week in one-hour sub-windows
const UPTIME_SUB_WINDOWS: usize = 168;
const UPTIME_SPAN: Duration = Duration::from_secs(7 * 24 * 3600);

/// Derives connection health and uptime for one account.
///
/// Registered as a synchronization listener so price updates feed the broker
/// clock offset and quote freshness; connection, broker-link and
/// synchronization flags come from the terminal state collaborator.
pub struct HealthMonitor {
    account_id: String,
    terminal: Arc<dyn TerminalState>,
    min_quote_interval_ms: i64,

    broker_offset_ms: Arc<RwLock<Option<i64>>>,
    last_quote_at_ms: Arc<RwLock<Option<i64>>>,
    quotes_healthy: Arc<RwLock<bool>>,
    uptime: Arc<RwLock<Reservoir>>,

    quote_task: Arc<RwLock<Option<JoinHandle<()>>>>,
    uptime_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl HealthMonitor {
    pub fn new(
        account_id: &str,
        terminal: Arc<dyn TerminalState>,
        min_quote_interval: Duration,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            terminal,
            min_quote_interval_ms: min_quote_interval.as_millis() as i64,
            broker_offset_ms: Arc::new(RwLock::new(None)),
            last_quote_at_ms: Arc::new(RwLock::new(None)),
            quotes_healthy: Arc::new(RwLock::new(true)),
            uptime: Arc::new(RwLock::new(Reservoir::new(UPTIME_SUB_WINDOWS, UPTIME_SPAN))),
            quote_task: Arc::new(RwLock::new(None)),
            uptime_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Arm the two periodic ticks
    pub fn start(&self) {
        {
            let mut task = self.quote_task.write();
            if task.is_none() {
                let account_id = self.account_id.clone();
                let terminal = self.terminal.clone();
                let broker_offset_ms = self.broker_offset_ms.clone();
                let last_quote_at_ms = self.last_quote_at_ms.clone();
                let quotes_healthy = self.quotes_healthy.clone();
                let min_quote_interval_ms = self.min_quote_interval_ms;

                *task = Some(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(TICK_INTERVAL);
                    loop {
                        interval.tick().await;
                        let result = compute_quotes_healthy(
                            terminal.as_ref(),
                            *broker_offset_ms.read(),
                            *last_quote_at_ms.read(),
                            min_quote_interval_ms,
                            Utc::now().timestamp_millis(),
                        );
                        match result {
                            Ok(healthy) => *quotes_healthy.write() = healthy,
                            Err(err) => error!(
                                account_id = %account_id,
                                at = %Utc::now(),
                                error = %err,
                                "Quote health tick failed"
                            ),
                        }
                    }
                }));
            }
        }
        {
            let mut task = self.uptime_task.write();
            if task.is_none() {
                let terminal = self.terminal.clone();
                let quotes_healthy = self.quotes_healthy.clone();
                let uptime = self.uptime.clone();

                *task = Some(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(TICK_INTERVAL);
                    loop {
                        interval.tick().await;
                        let healthy = terminal.connected()
                            && terminal.connected_to_broker()
                            && terminal.synchronized()
                            && *quotes_healthy.read();
                        uptime.write().record(if healthy { 100.0 } else { 0.0 });
                    }
                }));
            }
        }
        debug!(account_id = %self.account_id, "Health monitor started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.quote_task.write().take() {
            handle.abort();
        }
        if let Some(handle) = self.uptime_task.write().take() {
            handle.abort();
        }
        debug!(account_id = %self.account_id, "Health monitor stopped");
    }

    /// Current health snapshot; `healthy` is the conjunction of the four
    /// component booleans and `message` enumerates the failing ones
    pub fn health_status(&self) -> ConnectionHealthStatus {
        let connected = self.terminal.connected();
        let connected_to_broker = self.terminal.connected_to_broker();
        let synchronized = self.terminal.synchronized();
        let quote_streaming_healthy = *self.quotes_healthy.read();
        let healthy = connected && connected_to_broker && quote_streaming_healthy && synchronized;

        let message = if healthy {
            "Connection is healthy.".to_string()
        } else {
            let mut reasons = Vec::new();
            if !connected {
                reasons.push("connection to API server is not established or lost");
            }
            if !connected_to_broker {
                reasons.push("connection to broker is not established or lost");
            }
            if !quote_streaming_healthy {
                reasons.push("quotes are not streaming due to broker being offline or market being closed");
            }
            if !synchronized {
                reasons.push("local terminal state is not synchronized to broker");
            }
            format!("Connection is not healthy because {}.", reasons.join(" and "))
        };

        ConnectionHealthStatus {
            connected,
            connected_to_broker,
            quote_streaming_healthy,
            synchronized,
            healthy,
            message,
        }
    }

    /// Uptime percentage over the tracked week, in [0, 100]
    pub fn uptime(&self) -> f64 {
        self.uptime.write().statistics().average
    }
}

#[async_trait]
impl SyncListener for HealthMonitor {
    async fn on_symbol_price_updated(&self, price: &Value) -> ListenerResult {
        if let Some(broker_time) = price.get("brokerTime").and_then(Value::as_str) {
            let parsed = NaiveDateTime::parse_from_str(broker_time, BROKER_TIME_FORMAT)?;
            let broker_ms = parsed.and_utc().timestamp_millis();
            let now_ms = Utc::now().timestamp_millis();
            *self.broker_offset_ms.write() = Some(now_ms - broker_ms);
            *self.last_quote_at_ms.write() = Some(now_ms);
        }
        Ok(())
    }
}

/// Quote streaming is healthy when nothing is subscribed, when the broker
/// clock says we are outside every quote session, or when the last price
/// update is fresh enough
fn compute_quotes_healthy(
    terminal: &dyn TerminalState,
    broker_offset_ms: Option<i64>,
    last_quote_at_ms: Option<i64>,
    min_quote_interval_ms: i64,
    now_ms: i64,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let symbols = terminal.subscribed_symbols();
    if symbols.is_empty() {
        return Ok(true);
    }

    let server_ms = now_ms - broker_offset_ms.unwrap_or(0);
    let server = DateTime::from_timestamp_millis(server_ms)
        .ok_or("broker-local time out of representable range")?;
    // Fixed-width HH:mm:ss.SSS compares correctly as a string
    let server_time = server.format("%H:%M:%S%.3f").to_string();
    let weekday = weekday_name(server.weekday());

    let mut in_quote_session = false;
    for symbol in &symbols {
        let specification = match terminal.specification(symbol) {
            Some(specification) => specification,
            None => continue,
        };
        if let Some(sessions) = specification.quote_sessions.get(weekday) {
            for session in sessions {
                if session.from.as_str() <= server_time.as_str()
                    && server_time.as_str() <= session.to.as_str()
                {
                    in_quote_session = true;
                }
            }
        }
    }

    let quotes_fresh = last_quote_at_ms
        .map(|at| now_ms - at < min_quote_interval_ms)
        .unwrap_or(false);
    Ok(!in_quote_session || quotes_fresh)
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Sun => "SUNDAY",
        Weekday::Mon => "MONDAY",
        Weekday::Tue => "TUESDAY",
        Weekday::Wed => "WEDNESDAY",
        Weekday::Thu => "THURSDAY",
        Weekday::Fri => "FRIDAY",
        Weekday::Sat => "SATURDAY",
    }
}
