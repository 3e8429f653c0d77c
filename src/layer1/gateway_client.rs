// Gateway Client - connection lifecycle and request/response multiplexing
// Single shared socket carrying RPCs and synchronization streams for many accounts

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::{ConfigError, GatewayConfig};
use crate::core::errors::GatewayError;
use crate::core::types::{is_trade_success, ConnectionStatus};
use crate::layer1::transport::{SocketEvent, Transport, WsTransport};
use crate::layer2::dispatcher::{ListenerResult, SyncDispatcher, SyncListener};
use crate::layer2::packet_orderer::{OutOfOrderReport, PacketOrderer};
use crate::layer2::time_normalizer::normalize_times;

const REQUEST_ID_LENGTH: usize = 32;

type Resolver = oneshot::Sender<Result<Value, GatewayError>>;

/// Notified sequentially after every re-established connection
#[async_trait]
pub trait ReconnectListener: Send + Sync {
    async fn on_reconnected(&self) -> ListenerResult;
}

/// Client statistics
#[derive(Debug, Clone)]
pub struct GatewayClientStats {
    pub status: ConnectionStatus,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub requests_timed_out: u64,
    pub request_failures: u64,
    pub reconnects: u64,
    pub subscribe_failures: u64,
}

impl fmt::Display for GatewayClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GatewayClientStats(status={}, sent={}, ok={}, timeouts={}, failures={}, reconnects={})",
            self.status,
            self.requests_sent,
            self.responses_received,
            self.requests_timed_out,
            self.request_failures,
            self.reconnects
        )
    }
}

/// Client for the MetaTrader gateway socket.
///
/// Owns the connection lifecycle (initial connect, infinite reconnection
/// with bounded backoff, cooperative close), correlates request/response
/// pairs by request id, and feeds inbound synchronization packets through
/// time normalization and sequence reordering into per-account listeners.
#[derive(Clone)]
pub struct GatewayClient {
    config: GatewayConfig,
    client_id: String,
    transport: Arc<dyn Transport>,

    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    desired_connected: Arc<RwLock<bool>>,
    request_table: Arc<Mutex<HashMap<String, Resolver>>>,
    outbound_tx: Arc<RwLock<Option<mpsc::UnboundedSender<SocketEvent>>>>,
    reconnect_listeners: Arc<RwLock<Vec<Arc<dyn ReconnectListener>>>>,

    dispatcher: Arc<SyncDispatcher>,
    orderer: Arc<PacketOrderer>,
    report_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<OutOfOrderReport>>>>,

    socket_task: Arc<RwLock<Option<JoinHandle<()>>>>,
    dispatch_task: Arc<RwLock<Option<JoinHandle<()>>>>,
    resubscribe_task: Arc<RwLock<Option<JoinHandle<()>>>>,

    requests_sent: Arc<RwLock<u64>>,
    responses_received: Arc<RwLock<u64>>,
    requests_timed_out: Arc<RwLock<u64>>,
    request_failures: Arc<RwLock<u64>>,
    reconnects: Arc<RwLock<u64>>,
    subscribe_failures: Arc<RwLock<u64>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (orderer, report_rx) = PacketOrderer::new(config.sequence_gap_timeout());
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        info!(domain = %config.domain, application = %config.application, "Gateway client created");

        Ok(Self {
            config,
            client_id: Uuid::new_v4().to_string(),
            transport,
            status_tx: Arc::new(status_tx),
            desired_connected: Arc::new(RwLock::new(false)),
            request_table: Arc::new(Mutex::new(HashMap::new())),
            outbound_tx: Arc::new(RwLock::new(None)),
            reconnect_listeners: Arc::new(RwLock::new(Vec::new())),
            dispatcher: Arc::new(SyncDispatcher::new()),
            orderer: Arc::new(orderer),
            report_rx: Arc::new(Mutex::new(Some(report_rx))),
            socket_task: Arc::new(RwLock::new(None)),
            dispatch_task: Arc::new(RwLock::new(None)),
            resubscribe_task: Arc::new(RwLock::new(None)),
            requests_sent: Arc::new(RwLock::new(0)),
            responses_received: Arc::new(RwLock::new(0)),
            requests_timed_out: Arc::new(RwLock::new(0)),
            request_failures: Arc::new(RwLock::new(0)),
            reconnects: Arc::new(RwLock::new(0)),
            subscribe_failures: Arc::new(RwLock::new(0)),
        })
    }

    /// Create a client backed by the production websocket transport
    pub fn with_default_transport(config: GatewayConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(WsTransport))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the gateway connection.
    ///
    /// Idempotent: redundant calls await the in-progress attempt. Resolves on
    /// the first established connection and rejects on the first failed
    /// attempt; reconnection keeps running in the background either way.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let mut status_rx = self.status_tx.subscribe();
        {
            let mut desired = self.desired_connected.write();
            if !*desired {
                *desired = true;
                drop(desired);
                self.spawn_tasks();
            }
        }

        let wait = async move {
            loop {
                let status = *status_rx.borrow_and_update();
                match status {
                    ConnectionStatus::Connected => return Ok(()),
                    ConnectionStatus::Failed => {
                        return Err(GatewayError::not_connected(
                            "failed to connect to the gateway",
                        ))
                    }
                    _ => {}
                }
                if status_rx.changed().await.is_err() {
                    return Err(GatewayError::not_connected("connection task terminated"));
                }
            }
        };
        match tokio::time::timeout(self.config.connect_timeout(), wait).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout("timed out waiting for gateway connection")),
        }
    }

    /// Close the connection cooperatively: stop reconnecting, drop the
    /// socket, reject every in-flight request, clear listener sets and
    /// ordering state
    pub fn close(&self) {
        {
            let mut desired = self.desired_connected.write();
            if !*desired {
                return;
            }
            *desired = false;
        }
        info!("Closing gateway connection");

        if let Some(handle) = self.socket_task.write().take() {
            handle.abort();
        }
        *self.outbound_tx.write() = None;
        self.set_status(ConnectionStatus::Disconnected);

        let pending: Vec<Resolver> = {
            let mut table = self.request_table.lock();
            table.drain().map(|(_, resolver)| resolver).collect()
        };
        for resolver in pending {
            let _ = resolver.send(Err(GatewayError::not_connected("connection to server closed")));
        }

        self.reconnect_listeners.write().clear();
        self.dispatcher.clear();
        self.orderer.stop();
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn stats(&self) -> GatewayClientStats {
        GatewayClientStats {
            status: self.status(),
            requests_sent: *self.requests_sent.read(),
            responses_received: *self.responses_received.read(),
            requests_timed_out: *self.requests_timed_out.read(),
            request_failures: *self.request_failures.read(),
            reconnects: *self.reconnects.read(),
            subscribe_failures: *self.subscribe_failures.read(),
        }
    }

    // ========================================================================
    // Listener registration
    // ========================================================================

    /// Register a synchronization listener for an account
    pub fn add_sync_listener(&self, account_id: &str, listener: Arc<dyn SyncListener>) {
        self.dispatcher.add_listener(account_id, listener);
    }

    /// Drop all synchronization listeners of an account
    pub fn remove_sync_listeners(&self, account_id: &str) {
        self.dispatcher.remove_listeners(account_id);
    }

    pub fn add_reconnect_listener(&self, listener: Arc<dyn ReconnectListener>) {
        self.reconnect_listeners.write().push(listener);
    }

    // ========================================================================
    // RPC
    // ========================================================================

    /// Issue one request and await its correlated response.
    ///
    /// The request is stamped with `accountId`, `application` and a
    /// `requestId` (generated unless the caller supplied one). A deadline of
    /// `timeout_override` or the configured request timeout applies; a late
    /// response after the deadline is silently discarded.
    pub async fn rpc(
        &self,
        account_id: &str,
        mut request: Value,
        timeout_override: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        if !request.is_object() {
            return Err(GatewayError::internal("request body must be a JSON object"));
        }
        self.connect().await?;

        let request_type = request
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let supplied_id = request
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let request_id = match supplied_id {
            Some(id) => id,
            None => {
                let id = random_request_id();
                request["requestId"] = Value::from(id.clone());
                id
            }
        };
        request["accountId"] = Value::from(account_id);
        request["application"] = Value::from(self.config.application.as_str());

        let (resolver, receiver) = oneshot::channel();
        {
            let mut table = self.request_table.lock();
            if table.contains_key(&request_id) {
                return Err(GatewayError::internal(format!(
                    "request id {} is already in flight",
                    request_id
                )));
            }
            table.insert(request_id.clone(), resolver);
        }
        *self.requests_sent.write() += 1;

        if let Err(error) = self.emit(SocketEvent::new("request", request)) {
            self.request_table.lock().remove(&request_id);
            return Err(error);
        }

        let deadline = timeout_override.unwrap_or_else(|| self.config.request_timeout());
        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::not_connected("connection to server closed")),
            Err(_) => {
                self.request_table.lock().remove(&request_id);
                *self.requests_timed_out.write() += 1;
                Err(GatewayError::timeout(format!(
                    "request {} of type {} timed out after {:?}",
                    request_id, request_type, deadline
                )))
            }
        }
    }

    // ========================================================================
    // Typed request API
    // ========================================================================

    pub async fn get_account_information(&self, account_id: &str) -> Result<Value, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "getAccountInformation"}), None)
            .await?;
        Ok(field(response, "accountInformation"))
    }

    pub async fn get_positions(&self, account_id: &str) -> Result<Value, GatewayError> {
        let response = self.rpc(account_id, json!({"type": "getPositions"}), None).await?;
        Ok(field(response, "positions"))
    }

    pub async fn get_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getPosition", "positionId": position_id}),
                None,
            )
            .await?;
        Ok(field(response, "position"))
    }

    pub async fn get_orders(&self, account_id: &str) -> Result<Value, GatewayError> {
        let response = self.rpc(account_id, json!({"type": "getOrders"}), None).await?;
        Ok(field(response, "orders"))
    }

    pub async fn get_order(&self, account_id: &str, order_id: &str) -> Result<Value, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "getOrder", "orderId": order_id}), None)
            .await?;
        Ok(field(response, "order"))
    }

    /// History responses keep their envelope (`historyOrders` plus the
    /// `synchronizing` flag), so the whole payload is returned
    pub async fn get_history_orders_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<Value, GatewayError> {
        self.rpc(
            account_id,
            json!({"type": "getHistoryOrdersByTicket", "ticket": ticket}),
            None,
        )
        .await
    }

    pub async fn get_history_orders_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<Value, GatewayError> {
        self.rpc(
            account_id,
            json!({"type": "getHistoryOrdersByPosition", "positionId": position_id}),
            None,
        )
        .await
    }

    pub async fn get_history_orders_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Value, GatewayError> {
        self.rpc(
            account_id,
            json!({
                "type": "getHistoryOrdersByTimeRange",
                "startTime": iso(start_time),
                "endTime": iso(end_time),
                "offset": offset,
                "limit": limit
            }),
            None,
        )
        .await
    }

    pub async fn get_deals_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<Value, GatewayError> {
        self.rpc(account_id, json!({"type": "getDealsByTicket", "ticket": ticket}), None)
            .await
    }

    pub async fn get_deals_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<Value, GatewayError> {
        self.rpc(
            account_id,
            json!({"type": "getDealsByPosition", "positionId": position_id}),
            None,
        )
        .await
    }

    pub async fn get_deals_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Value, GatewayError> {
        self.rpc(
            account_id,
            json!({
                "type": "getDealsByTimeRange",
                "startTime": iso(start_time),
                "endTime": iso(end_time),
                "offset": offset,
                "limit": limit
            }),
            None,
        )
        .await
    }

    pub async fn remove_history(&self, account_id: &str) -> Result<(), GatewayError> {
        self.rpc(account_id, json!({"type": "removeHistory"}), None)
            .await
            .map(|_| ())
    }

    pub async fn remove_application(&self, account_id: &str) -> Result<(), GatewayError> {
        self.rpc(account_id, json!({"type": "removeApplication"}), None)
            .await
            .map(|_| ())
    }

    /// Execute a trade and check the broker return codes; anything outside
    /// the success set raises a trade error carrying both codes
    pub async fn trade(&self, account_id: &str, trade: Value) -> Result<Value, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "trade", "trade": trade}), None)
            .await?;
        let result = field(response, "response");

        // The legacy field names `description`/`error` alias `stringCode`/`numericCode`
        let string_code = result
            .get("stringCode")
            .or_else(|| result.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if is_trade_success(&string_code) {
            return Ok(result);
        }
        let numeric_code = result
            .get("numericCode")
            .or_else(|| result.get("error"))
            .and_then(Value::as_i64);
        let message = result
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Trade failed")
            .to_string();
        Err(GatewayError::Trade {
            message,
            numeric_code,
            string_code: Some(string_code).filter(|code| !code.is_empty()),
        })
    }

    /// Request server-side synchronization packets for an account.
    ///
    /// Fire-and-forget: the acknowledgement timing out is fine because the
    /// server pushes synchronization packets regardless; any other failure is
    /// logged and counted in `subscribe_failures`.
    pub fn subscribe(&self, account_id: &str) {
        let client = self.clone();
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            match client.rpc(&account_id, json!({"type": "subscribe"}), None).await {
                Ok(_) => debug!(account_id = %account_id, "Subscribe acknowledged"),
                Err(GatewayError::Timeout { .. }) => {
                    debug!(account_id = %account_id, "Subscribe acknowledgement timed out")
                }
                Err(error) => {
                    *client.subscribe_failures.write() += 1;
                    warn!(account_id = %account_id, error = %error, "Subscribe failed");
                }
            }
        });
    }

    /// Ask the server to reconnect the terminal of an account to its broker
    pub async fn reconnect_account(&self, account_id: &str) -> Result<(), GatewayError> {
        self.rpc(account_id, json!({"type": "reconnect"}), None)
            .await
            .map(|_| ())
    }

    /// Start a history synchronization. The synchronization id doubles as the
    /// request id so server-side correlation survives client restarts.
    pub async fn synchronize(
        &self,
        account_id: &str,
        synchronization_id: &str,
        starting_history_order_time: Option<DateTime<Utc>>,
        starting_deal_time: Option<DateTime<Utc>>,
    ) -> Result<(), GatewayError> {
        let mut request = json!({
            "type": "synchronize",
            "requestId": synchronization_id
        });
        if let Some(time) = starting_history_order_time {
            request["startingHistoryOrderTime"] = Value::from(iso(time));
        }
        if let Some(time) = starting_deal_time {
            request["startingDealTime"] = Value::from(iso(time));
        }
        self.rpc(account_id, request, None).await.map(|_| ())
    }

    /// Wait until the server reports the terminal synchronized. The client
    /// deadline runs one second past the server-side wait so the server
    /// reply always wins the race.
    pub async fn wait_synchronized(
        &self,
        account_id: &str,
        application_pattern: Option<&str>,
        timeout_in_seconds: u64,
    ) -> Result<(), GatewayError> {
        let mut request = json!({
            "type": "waitSynchronized",
            "timeoutInSeconds": timeout_in_seconds
        });
        if let Some(pattern) = application_pattern {
            request["applicationPattern"] = Value::from(pattern);
        }
        self.rpc(
            account_id,
            request,
            Some(Duration::from_secs(timeout_in_seconds + 1)),
        )
        .await
        .map(|_| ())
    }

    pub async fn subscribe_to_market_data(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<(), GatewayError> {
        self.rpc(
            account_id,
            json!({"type": "subscribeToMarketData", "symbol": symbol}),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn get_symbol_specification(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .rpc(
                account_id,
                json!({"type": "getSymbolSpecification", "symbol": symbol}),
                None,
            )
            .await?;
        Ok(field(response, "specification"))
    }

    pub async fn get_symbol_price(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .rpc(account_id, json!({"type": "getSymbolPrice", "symbol": symbol}), None)
            .await?;
        Ok(field(response, "price"))
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    fn spawn_tasks(&self) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let client = self.clone();
        *self.socket_task.write() = Some(tokio::spawn(async move {
            client.run_socket(inbound_tx).await;
        }));

        let client = self.clone();
        *self.dispatch_task.write() = Some(tokio::spawn(async move {
            client.run_dispatch(inbound_rx).await;
        }));

        // The report channel outlives individual connections; the consumer
        // task is spawned once per client
        if let Some(mut report_rx) = self.report_rx.lock().take() {
            let client = self.clone();
            *self.resubscribe_task.write() = Some(tokio::spawn(async move {
                while let Some(report) = report_rx.recv().await {
                    if !*client.desired_connected.read() {
                        continue;
                    }
                    warn!(
                        account_id = %report.account_id,
                        expected = report.expected_sequence,
                        observed = report.buffered_head,
                        "Synchronization stream out of order, re-subscribing"
                    );
                    client.subscribe(&report.account_id);
                }
            }));
        }

        self.orderer.start();
    }

    /// Connection run loop: connect, pump the session, reconnect forever
    /// with bounded backoff while the client stays desired-connected
    async fn run_socket(&self, inbound_tx: mpsc::UnboundedSender<SocketEvent>) {
        let url = self.config.url();
        let mut attempt: u32 = 0;
        let mut first_connect = true;

        loop {
            if !*self.desired_connected.read() {
                break;
            }
            self.set_status(if first_connect {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            });

            match self.transport.connect(&url, &self.client_id).await {
                Ok((mut sink, mut stream)) => {
                    attempt = 0;
                    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
                    *self.outbound_tx.write() = Some(outbound_tx);
                    self.set_status(ConnectionStatus::Connected);

                    if first_connect {
                        info!(client_id = %self.client_id, "Connected to gateway");
                        first_connect = false;
                    } else {
                        info!(client_id = %self.client_id, "Reconnected to gateway");
                        *self.reconnects.write() += 1;
                        self.notify_reconnect_listeners().await;
                    }

                    loop {
                        tokio::select! {
                            inbound = stream.next_event() => match inbound {
                                Some(Ok(event)) => {
                                    let _ = inbound_tx.send(event);
                                }
                                Some(Err(error)) => {
                                    warn!(error = %error, "Transport error");
                                    break;
                                }
                                None => {
                                    info!("Connection closed by server");
                                    break;
                                }
                            },
                            outbound = outbound_rx.recv() => match outbound {
                                Some(event) => {
                                    if let Err(error) = sink.emit(event).await {
                                        warn!(error = %error, "Emit failed");
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }

                    *self.outbound_tx.write() = None;
                    sink.close().await;
                    if !*self.desired_connected.read() {
                        break;
                    }
                    self.set_status(ConnectionStatus::Disconnected);
                }
                Err(error) => {
                    warn!(error = %error, attempt = attempt, "Connect attempt failed");
                    self.set_status(ConnectionStatus::Failed);
                }
            }

            if !*self.desired_connected.read() {
                break;
            }
            let delay = self.backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_secs = delay.as_secs(), "Reconnecting after delay");
            tokio::time::sleep(delay).await;
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Dispatch loop: consumes inbound events so listener work never blocks
    /// the socket read loop
    async fn run_dispatch(&self, mut inbound_rx: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = inbound_rx.recv().await {
            self.handle_event(event).await;
        }
        debug!("Dispatch loop ended");
    }

    async fn handle_event(&self, event: SocketEvent) {
        let SocketEvent { event, mut data } = event;
        match event.as_str() {
            "response" => {
                normalize_times(&mut data);
                let request_id = data
                    .get("requestId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let pending = self.request_table.lock().remove(&request_id);
                match pending {
                    Some(resolver) => {
                        *self.responses_received.write() += 1;
                        let _ = resolver.send(Ok(data));
                    }
                    None => {
                        debug!(request_id = %request_id, "Response without a waiting request discarded")
                    }
                }
            }
            "processingError" => self.handle_processing_error(data),
            "synchronization" => {
                normalize_times(&mut data);
                for packet in self.orderer.restore_order(data) {
                    self.dispatcher.dispatch(&packet).await;
                }
            }
            other => debug!(event = %other, "Unhandled socket event"),
        }
    }

    fn handle_processing_error(&self, data: Value) {
        let request_id = data
            .get("requestId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("InternalError")
            .to_string();
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error")
            .to_string();
        let details = data.get("details").cloned().filter(|d| !d.is_null());
        let numeric_code = data.get("numericCode").and_then(Value::as_i64);
        let string_code = data
            .get("stringCode")
            .and_then(Value::as_str)
            .map(str::to_string);

        let error = GatewayError::from_wire(&name, message, details, numeric_code, string_code);
        *self.request_failures.write() += 1;

        // Pull this request's resolver out before a fatal close drains the
        // table, so the caller sees the original error rather than the
        // generic closed-connection one
        let pending = self.request_table.lock().remove(&request_id);
        if error.is_fatal() {
            warn!(request_id = %request_id, "Server rejected credentials, closing connection");
            self.close();
        }
        match pending {
            Some(resolver) => {
                let _ = resolver.send(Err(error));
            }
            None => {
                debug!(request_id = %request_id, error = %error, "Processing error without a waiting request")
            }
        }
    }

    async fn notify_reconnect_listeners(&self) {
        let snapshot = self.reconnect_listeners.read().clone();
        for listener in snapshot {
            if let Err(error) = listener.on_reconnected().await {
                warn!(error = %error, "Reconnect listener failed");
            }
        }
    }

    fn emit(&self, event: SocketEvent) -> Result<(), GatewayError> {
        let outbound = self.outbound_tx.read();
        if let Some(tx) = outbound.as_ref() {
            if tx.send(event).is_ok() {
                return Ok(());
            }
        }
        Err(GatewayError::not_connected("socket is not connected"))
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let floor = self.config.reconnect_floor_secs;
        let ceiling = self.config.reconnect_ceiling_secs;
        let exponent = attempt.min(6);
        Duration::from_secs((floor << exponent).min(ceiling))
    }
}

fn random_request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LENGTH)
        .map(char::from)
        .collect()
}

fn iso(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn field(mut response: Value, name: &str) -> Value {
    response.get_mut(name).map(Value::take).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_request_id_shape() {
        let id = random_request_id();
        assert_eq!(id.len(), REQUEST_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, random_request_id());
    }

    #[test]
    fn test_backoff_progression_floor_to_ceiling() {
        let client = GatewayClient::new(
            GatewayConfig::new("token"),
            Arc::new(WsTransport),
        )
        .unwrap();
        let delays: Vec<u64> = (0..5).map(|a| client.backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = GatewayConfig::default(); // empty token
        assert!(GatewayClient::new(config, Arc::new(WsTransport)).is_err());
    }

    #[test]
    fn test_field_extraction() {
        let response = json!({"requestId": "r1", "positions": [1, 2]});
        assert_eq!(field(response.clone(), "positions"), json!([1, 2]));
        assert_eq!(field(response, "orders"), Value::Null);
    }

    #[test]
    fn test_iso_formatting() {
        let time = DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(iso(time), "2021-01-01T00:00:00.000Z");
    }
}
