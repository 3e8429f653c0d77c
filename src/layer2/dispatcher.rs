// Synchronization Dispatcher - packet classification and listener fan-out
// Maps packet types to listener capability calls, per account

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Capability set for per-account synchronization events.
///
/// Every method defaults to a no-op; consumers override the events they care
/// about. Failures are logged by the dispatcher and never propagate.
#[async_trait]
pub trait SyncListener: Send + Sync {
    async fn on_connected(&self) -> ListenerResult {
        Ok(())
    }
    async fn on_disconnected(&self) -> ListenerResult {
        Ok(())
    }
    async fn on_synchronization_started(&self) -> ListenerResult {
        Ok(())
    }
    async fn on_account_information_updated(&self, _info: &Value) -> ListenerResult {
        Ok(())
    }
    async fn on_positions_replaced(&self, _positions: &[Value]) -> ListenerResult {
        Ok(())
    }
    async fn on_position_updated(&self, _position: &Value) -> ListenerResult {
        Ok(())
    }
    async fn on_position_removed(&self, _position_id: &str) -> ListenerResult {
        Ok(())
    }
    async fn on_orders_replaced(&self, _orders: &[Value]) -> ListenerResult {
        Ok(())
    }
    async fn on_order_updated(&self, _order: &Value) -> ListenerResult {
        Ok(())
    }
    async fn on_order_completed(&self, _order_id: &str) -> ListenerResult {
        Ok(())
    }
    async fn on_history_order_added(&self, _order: &Value) -> ListenerResult {
        Ok(())
    }
    async fn on_deal_added(&self, _deal: &Value) -> ListenerResult {
        Ok(())
    }
    async fn on_deal_synchronization_finished(&self, _synchronization_id: &str) -> ListenerResult {
        Ok(())
    }
    async fn on_order_synchronization_finished(&self, _synchronization_id: &str) -> ListenerResult {
        Ok(())
    }
    async fn on_broker_connection_status_changed(&self, _connected: bool) -> ListenerResult {
        Ok(())
    }
    async fn on_symbol_specification_updated(&self, _specification: &Value) -> ListenerResult {
        Ok(())
    }
    async fn on_symbol_price_updated(&self, _price: &Value) -> ListenerResult {
        Ok(())
    }
}

/// Dispatcher statistics
#[derive(Debug, Clone)]
pub struct SyncDispatcherStats {
    pub packets_dispatched: u64,
    pub listener_errors: u64,
}

impl fmt::Display for SyncDispatcherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncDispatcherStats(dispatched={}, listener_errors={})",
            self.packets_dispatched, self.listener_errors
        )
    }
}

/// Fans reordered synchronization packets out to per-account listener sets.
///
/// Dispatch is sequential within a packet and across packets of one account;
/// the listener set is snapshotted before iteration so concurrent add/remove
/// cannot shift or invalidate it mid-packet.
pub struct SyncDispatcher {
    listeners: Arc<RwLock<HashMap<String, Vec<Arc<dyn SyncListener>>>>>,
    packets_dispatched: Arc<RwLock<u64>>,
    listener_errors: Arc<RwLock<u64>>,
}

impl Default for SyncDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDispatcher {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            packets_dispatched: Arc::new(RwLock::new(0)),
            listener_errors: Arc::new(RwLock::new(0)),
        }
    }

    /// Register a listener for an account; listeners fire in insertion order
    pub fn add_listener(&self, account_id: &str, listener: Arc<dyn SyncListener>) {
        self.listeners
            .write()
            .entry(account_id.to_string())
            .or_default()
            .push(listener);
    }

    /// Drop every listener registered for an account
    pub fn remove_listeners(&self, account_id: &str) {
        self.listeners.write().remove(account_id);
    }

    /// Drop all listener registrations
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn stats(&self) -> SyncDispatcherStats {
        SyncDispatcherStats {
            packets_dispatched: *self.packets_dispatched.read(),
            listener_errors: *self.listener_errors.read(),
        }
    }

    /// Dispatch one reordered packet to the listeners of its account
    pub async fn dispatch(&self, packet: &Value) {
        let account_id = packet
            .get("accountId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let packet_type = packet
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        *self.packets_dispatched.write() += 1;

        let snapshot: Vec<Arc<dyn SyncListener>> = self
            .listeners
            .read()
            .get(account_id)
            .cloned()
            .unwrap_or_default();
        if snapshot.is_empty() {
            debug!(account_id = %account_id, packet_type = %packet_type, "No listeners for packet");
            return;
        }

        match packet_type {
            "authenticated" => {
                for listener in &snapshot {
                    self.guard(account_id, "authenticated", listener.on_connected().await);
                }
            }
            "disconnected" => {
                for listener in &snapshot {
                    self.guard(account_id, "disconnected", listener.on_disconnected().await);
                }
            }
            "synchronizationStarted" => {
                for listener in &snapshot {
                    self.guard(
                        account_id,
                        "synchronizationStarted",
                        listener.on_synchronization_started().await,
                    );
                }
            }
            "accountInformation" => {
                if let Some(info) = present(packet.get("accountInformation")) {
                    for listener in &snapshot {
                        self.guard(
                            account_id,
                            "accountInformation",
                            listener.on_account_information_updated(info).await,
                        );
                    }
                }
            }
            "deals" => {
                for deal in items(packet.get("deals")) {
                    for listener in &snapshot {
                        self.guard(account_id, "deals", listener.on_deal_added(deal).await);
                    }
                }
            }
            "orders" => {
                let orders = items(packet.get("orders"));
                for listener in &snapshot {
                    self.guard(account_id, "orders", listener.on_orders_replaced(orders).await);
                }
            }
            "historyOrders" => {
                for order in items(packet.get("historyOrders")) {
                    for listener in &snapshot {
                        self.guard(
                            account_id,
                            "historyOrders",
                            listener.on_history_order_added(order).await,
                        );
                    }
                }
            }
            "positions" => {
                let positions = items(packet.get("positions"));
                for listener in &snapshot {
                    self.guard(
                        account_id,
                        "positions",
                        listener.on_positions_replaced(positions).await,
                    );
                }
            }
            "update" => self.dispatch_update(account_id, packet, &snapshot).await,
            "dealSynchronizationFinished" => {
                let synchronization_id = packet
                    .get("synchronizationId")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                for listener in &snapshot {
                    self.guard(
                        account_id,
                        "dealSynchronizationFinished",
                        listener
                            .on_deal_synchronization_finished(synchronization_id)
                            .await,
                    );
                }
            }
            "orderSynchronizationFinished" => {
                let synchronization_id = packet
                    .get("synchronizationId")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                for listener in &snapshot {
                    self.guard(
                        account_id,
                        "orderSynchronizationFinished",
                        listener
                            .on_order_synchronization_finished(synchronization_id)
                            .await,
                    );
                }
            }
            "status" => {
                let connected = packet.get("connected").and_then(Value::as_bool).unwrap_or(false);
                for listener in &snapshot {
                    self.guard(
                        account_id,
                        "status",
                        listener.on_broker_connection_status_changed(connected).await,
                    );
                }
            }
            "specifications" => {
                for specification in items(packet.get("specifications")) {
                    for listener in &snapshot {
                        self.guard(
                            account_id,
                            "specifications",
                            listener.on_symbol_specification_updated(specification).await,
                        );
                    }
                }
            }
            "prices" => {
                for price in items(packet.get("prices")) {
                    for listener in &snapshot {
                        self.guard(account_id, "prices", listener.on_symbol_price_updated(price).await);
                    }
                }
            }
            other => {
                debug!(account_id = %account_id, packet_type = %other, "Unknown packet type");
            }
        }
    }

    /// The `update` packet fans out to several capabilities in a fixed order
    async fn dispatch_update(
        &self,
        account_id: &str,
        packet: &Value,
        snapshot: &[Arc<dyn SyncListener>],
    ) {
        if let Some(info) = present(packet.get("accountInformation")) {
            for listener in snapshot {
                self.guard(
                    account_id,
                    "update",
                    listener.on_account_information_updated(info).await,
                );
            }
        }
        for position in items(packet.get("updatedPositions")) {
            for listener in snapshot {
                self.guard(account_id, "update", listener.on_position_updated(position).await);
            }
        }
        for position_id in strings(packet.get("removedPositionIds")) {
            for listener in snapshot {
                self.guard(account_id, "update", listener.on_position_removed(position_id).await);
            }
        }
        for order in items(packet.get("updatedOrders")) {
            for listener in snapshot {
                self.guard(account_id, "update", listener.on_order_updated(order).await);
            }
        }
        for order_id in strings(packet.get("completedOrderIds")) {
            for listener in snapshot {
                self.guard(account_id, "update", listener.on_order_completed(order_id).await);
            }
        }
        for order in items(packet.get("historyOrders")) {
            for listener in snapshot {
                self.guard(account_id, "update", listener.on_history_order_added(order).await);
            }
        }
        for deal in items(packet.get("deals")) {
            for listener in snapshot {
                self.guard(account_id, "update", listener.on_deal_added(deal).await);
            }
        }
    }

    fn guard(&self, account_id: &str, event: &str, result: ListenerResult) {
        if let Err(error) = result {
            *self.listener_errors.write() += 1;
            warn!(
                account_id = %account_id,
                event = %event,
                error = %error,
                "Listener failed, continuing dispatch"
            );
        }
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn items(value: Option<&Value>) -> &[Value] {
    value.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

fn strings(value: Option<&Value>) -> impl Iterator<Item = &str> {
    items(value).iter().filter_map(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records every call it receives, in order
    struct RecordingListener {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingListener {
        fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (Arc::new(Self { calls: calls.clone() }), calls)
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    #[async_trait]
    impl SyncListener for RecordingListener {
        async fn on_connected(&self) -> ListenerResult {
            self.record("connected");
            Ok(())
        }
        async fn on_account_information_updated(&self, info: &Value) -> ListenerResult {
            self.record(format!("account_information:{}", info["balance"]));
            Ok(())
        }
        async fn on_position_updated(&self, position: &Value) -> ListenerResult {
            self.record(format!("position_updated:{}", position["id"].as_str().unwrap()));
            Ok(())
        }
        async fn on_position_removed(&self, position_id: &str) -> ListenerResult {
            self.record(format!("position_removed:{}", position_id));
            Ok(())
        }
        async fn on_order_updated(&self, order: &Value) -> ListenerResult {
            self.record(format!("order_updated:{}", order["id"].as_str().unwrap()));
            Ok(())
        }
        async fn on_order_completed(&self, order_id: &str) -> ListenerResult {
            self.record(format!("order_completed:{}", order_id));
            Ok(())
        }
        async fn on_history_order_added(&self, order: &Value) -> ListenerResult {
            self.record(format!("history_order:{}", order["id"].as_str().unwrap()));
            Ok(())
        }
        async fn on_deal_added(&self, deal: &Value) -> ListenerResult {
            self.record(format!("deal:{}", deal["id"].as_str().unwrap()));
            Ok(())
        }
        async fn on_orders_replaced(&self, orders: &[Value]) -> ListenerResult {
            self.record(format!("orders_replaced:{}", orders.len()));
            Ok(())
        }
        async fn on_broker_connection_status_changed(&self, connected: bool) -> ListenerResult {
            self.record(format!("status:{}", connected));
            Ok(())
        }
    }

    /// Fails on every call
    struct FailingListener;

    #[async_trait]
    impl SyncListener for FailingListener {
        async fn on_connected(&self) -> ListenerResult {
            Err("listener exploded".into())
        }
    }

    #[tokio::test]
    async fn test_authenticated_dispatches_on_connected() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({"type": "authenticated", "accountId": "a"}))
            .await;
        assert_eq!(*calls.lock(), vec!["connected"]);
    }

    #[tokio::test]
    async fn test_dispatch_scoped_to_account() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({"type": "authenticated", "accountId": "b"}))
            .await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_deals_fan_out_per_item() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({
                "type": "deals",
                "accountId": "a",
                "deals": [{"id": "d1"}, {"id": "d2"}]
            }))
            .await;
        assert_eq!(*calls.lock(), vec!["deal:d1", "deal:d2"]);
    }

    #[tokio::test]
    async fn test_orders_replaced_called_once_with_empty_list() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({"type": "orders", "accountId": "a", "orders": []}))
            .await;
        assert_eq!(*calls.lock(), vec!["orders_replaced:0"]);
    }

    #[tokio::test]
    async fn test_update_packet_ordering() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({
                "type": "update",
                "accountId": "a",
                "accountInformation": {"balance": 100},
                "updatedPositions": [{"id": "p1"}],
                "removedPositionIds": ["p2"],
                "updatedOrders": [{"id": "o1"}],
                "completedOrderIds": ["o2"],
                "historyOrders": [{"id": "h1"}],
                "deals": [{"id": "d1"}]
            }))
            .await;

        assert_eq!(
            *calls.lock(),
            vec![
                "account_information:100",
                "position_updated:p1",
                "position_removed:p2",
                "order_updated:o1",
                "order_completed:o2",
                "history_order:h1",
                "deal:d1",
            ]
        );
    }

    #[tokio::test]
    async fn test_status_packet_carries_connected_flag() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({"type": "status", "accountId": "a", "connected": true}))
            .await;
        assert_eq!(*calls.lock(), vec!["status:true"]);
    }

    #[tokio::test]
    async fn test_listener_failure_does_not_stall_others() {
        let dispatcher = SyncDispatcher::new();
        dispatcher.add_listener("a", Arc::new(FailingListener));
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({"type": "authenticated", "accountId": "a"}))
            .await;
        assert_eq!(*calls.lock(), vec!["connected"]);
        assert_eq!(dispatcher.stats().listener_errors, 1);
    }

    #[tokio::test]
    async fn test_remove_listeners() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);
        dispatcher.remove_listeners("a");

        dispatcher
            .dispatch(&json!({"type": "authenticated", "accountId": "a"}))
            .await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_null_account_information_skipped() {
        let dispatcher = SyncDispatcher::new();
        let (listener, calls) = RecordingListener::new();
        dispatcher.add_listener("a", listener);

        dispatcher
            .dispatch(&json!({
                "type": "accountInformation",
                "accountId": "a",
                "accountInformation": null
            }))
            .await;
        assert!(calls.lock().is_empty());
    }
}
