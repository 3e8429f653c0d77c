// Packet Orderer - per-account sequence-number reordering
// Buffers ahead-of-sequence packets and escalates unrecoverable gaps

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Notification that an account's sequence gap could not be recovered
/// within the wait deadline. The host reacts by re-subscribing the account.
#[derive(Debug, Clone)]
pub struct OutOfOrderReport {
    pub account_id: String,
    pub expected_sequence: u64,
    pub buffered_head: u64,
}

#[derive(Default)]
struct AccountSequenceState {
    expected: Option<u64>,
    wait_buffer: BTreeMap<u64, Value>,
    wait_deadline: Option<Instant>,
}

/// Orderer statistics
#[derive(Debug, Clone)]
pub struct PacketOrdererStats {
    pub packets_passed: u64,
    pub packets_buffered: u64,
    pub duplicates_dropped: u64,
    pub gaps_expired: u64,
    pub accounts_tracked: usize,
}

impl fmt::Display for PacketOrdererStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PacketOrdererStats(passed={}, buffered={}, dupes={}, gaps={}, accounts={})",
            self.packets_passed,
            self.packets_buffered,
            self.duplicates_dropped,
            self.gaps_expired,
            self.accounts_tracked
        )
    }
}

/// Restores per-account sequence order over synchronization packets.
///
/// Packets without a `sequenceNumber` pass through unchanged. Ahead-of-
/// sequence packets wait in a per-account buffer until the gap fills or the
/// wait deadline expires; an expired gap is reported to the host and the
/// account re-baselines on the next observed sequence.
pub struct PacketOrderer {
    gap_timeout: Duration,
    states: Arc<RwLock<HashMap<String, AccountSequenceState>>>,
    report_tx: mpsc::UnboundedSender<OutOfOrderReport>,
    tick_task: Arc<RwLock<Option<JoinHandle<()>>>>,

    packets_passed: Arc<RwLock<u64>>,
    packets_buffered: Arc<RwLock<u64>>,
    duplicates_dropped: Arc<RwLock<u64>>,
    gaps_expired: Arc<RwLock<u64>>,
}

impl PacketOrderer {
    /// Create an orderer and the receiving end of its out-of-order reports
    pub fn new(gap_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<OutOfOrderReport>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let orderer = Self {
            gap_timeout,
            states: Arc::new(RwLock::new(HashMap::new())),
            report_tx,
            tick_task: Arc::new(RwLock::new(None)),
            packets_passed: Arc::new(RwLock::new(0)),
            packets_buffered: Arc::new(RwLock::new(0)),
            duplicates_dropped: Arc::new(RwLock::new(0)),
            gaps_expired: Arc::new(RwLock::new(0)),
        };

        (orderer, report_rx)
    }

    /// Arm the background deadline tick
    pub fn start(&self) {
        let mut task = self.tick_task.write();
        if task.is_some() {
            return;
        }

        let states = self.states.clone();
        let report_tx = self.report_tx.clone();
        let gaps_expired = self.gaps_expired.clone();

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                Self::expire_gaps(&states, &report_tx, &gaps_expired);
            }
        }));

        debug!("Packet orderer started");
    }

    /// Disarm the tick and clear all per-account state
    pub fn stop(&self) {
        if let Some(handle) = self.tick_task.write().take() {
            handle.abort();
        }
        self.states.write().clear();
        debug!("Packet orderer stopped");
    }

    /// Restore order for one inbound packet, returning zero or more packets
    /// in ascending sequence order
    pub fn restore_order(&self, packet: Value) -> Vec<Value> {
        let sequence = match packet.get("sequenceNumber").and_then(Value::as_u64) {
            Some(sequence) => sequence,
            None => return vec![packet],
        };
        let account_id = packet
            .get("accountId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut states = self.states.write();
        let state = states.entry(account_id.clone()).or_default();

        match state.expected {
            // First observed sequence becomes the baseline
            None => {
                state.expected = Some(sequence + 1);
                *self.packets_passed.write() += 1;
                vec![packet]
            }

            Some(expected) if sequence == expected => {
                let mut emitted = vec![packet];
                let mut next = sequence + 1;
                while let Some(buffered) = state.wait_buffer.remove(&next) {
                    emitted.push(buffered);
                    next += 1;
                }
                state.expected = Some(next);
                if state.wait_buffer.is_empty() {
                    state.wait_deadline = None;
                }
                *self.packets_passed.write() += emitted.len() as u64;
                emitted
            }

            Some(expected) if sequence > expected => {
                if state.wait_buffer.is_empty() {
                    state.wait_deadline = Some(Instant::now() + self.gap_timeout);
                }
                state.wait_buffer.insert(sequence, packet);
                *self.packets_buffered.write() += 1;
                debug!(
                    account_id = %account_id,
                    sequence = sequence,
                    expected = expected,
                    "Buffered ahead-of-sequence packet"
                );
                vec![]
            }

            // sequence < expected: duplicate of something already consumed
            Some(expected) => {
                *self.duplicates_dropped.write() += 1;
                debug!(
                    account_id = %account_id,
                    sequence = sequence,
                    expected = expected,
                    "Dropped duplicate packet"
                );
                vec![]
            }
        }
    }

    pub fn stats(&self) -> PacketOrdererStats {
        PacketOrdererStats {
            packets_passed: *self.packets_passed.read(),
            packets_buffered: *self.packets_buffered.read(),
            duplicates_dropped: *self.duplicates_dropped.read(),
            gaps_expired: *self.gaps_expired.read(),
            accounts_tracked: self.states.read().len(),
        }
    }

    /// Declare expired gaps unrecoverable: report them and reset the account
    /// so the next observed sequence re-baselines
    fn expire_gaps(
        states: &RwLock<HashMap<String, AccountSequenceState>>,
        report_tx: &mpsc::UnboundedSender<OutOfOrderReport>,
        gaps_expired: &RwLock<u64>,
    ) {
        let now = Instant::now();
        let expired: Vec<String> = states
            .read()
            .iter()
            .filter(|(_, state)| {
                !state.wait_buffer.is_empty()
                    && state.wait_deadline.map(|deadline| now > deadline).unwrap_or(false)
            })
            .map(|(account_id, _)| account_id.clone())
            .collect();

        for account_id in expired {
            let state = match states.write().remove(&account_id) {
                Some(state) => state,
                None => continue,
            };
            let expected_sequence = state.expected.unwrap_or(0);
            let buffered_head = state
                .wait_buffer
                .keys()
                .next()
                .copied()
                .unwrap_or(expected_sequence);

            warn!(
                account_id = %account_id,
                expected = expected_sequence,
                buffered_head = buffered_head,
                buffered = state.wait_buffer.len(),
                "Sequence gap unrecoverable, resetting account ordering state"
            );
            *gaps_expired.write() += 1;

            let report = OutOfOrderReport {
                account_id,
                expected_sequence,
                buffered_head,
            };
            if report_tx.send(report).is_err() {
                info!("Out-of-order report receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sync_packet(account: &str, sequence: u64) -> Value {
        json!({
            "type": "prices",
            "accountId": account,
            "sequenceNumber": sequence,
            "prices": []
        })
    }

    fn orderer() -> (PacketOrderer, mpsc::UnboundedReceiver<OutOfOrderReport>) {
        PacketOrderer::new(Duration::from_secs(10))
    }

    #[test]
    fn test_packet_without_sequence_passes_through() {
        let (orderer, _rx) = orderer();
        let packet = json!({"type": "authenticated", "accountId": "a"});
        let out = orderer.restore_order(packet.clone());
        assert_eq!(out, vec![packet]);
    }

    #[test]
    fn test_first_sequence_adopted_as_baseline() {
        let (orderer, _rx) = orderer();
        assert_eq!(orderer.restore_order(sync_packet("a", 5)).len(), 1);
        assert_eq!(orderer.restore_order(sync_packet("a", 6)).len(), 1);
        assert_eq!(orderer.restore_order(sync_packet("a", 7)).len(), 1);
    }

    #[test]
    fn test_out_of_order_packets_reordered() {
        let (orderer, _rx) = orderer();
        assert_eq!(orderer.restore_order(sync_packet("a", 5)).len(), 1);

        // 7 arrives before 6
        assert!(orderer.restore_order(sync_packet("a", 7)).is_empty());
        let drained = orderer.restore_order(sync_packet("a", 6));
        let sequences: Vec<u64> = drained
            .iter()
            .map(|p| p["sequenceNumber"].as_u64().unwrap())
            .collect();
        assert_eq!(sequences, vec![6, 7]);
    }

    #[test]
    fn test_duplicate_below_expected_dropped() {
        let (orderer, _rx) = orderer();
        orderer.restore_order(sync_packet("a", 5));
        orderer.restore_order(sync_packet("a", 6));
        assert!(orderer.restore_order(sync_packet("a", 5)).is_empty());
        assert_eq!(orderer.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_accounts_are_independent() {
        let (orderer, _rx) = orderer();
        orderer.restore_order(sync_packet("a", 5));
        // Account b starts its own baseline regardless of a's state
        assert_eq!(orderer.restore_order(sync_packet("b", 1)).len(), 1);
        assert!(orderer.restore_order(sync_packet("a", 7)).is_empty());
        assert_eq!(orderer.restore_order(sync_packet("b", 2)).len(), 1);
    }

    #[test]
    fn test_expired_gap_reports_and_resets() {
        let (orderer, mut rx) = PacketOrderer::new(Duration::ZERO);
        orderer.restore_order(sync_packet("a", 10));
        assert!(orderer.restore_order(sync_packet("a", 15)).is_empty());

        // Zero wait deadline: the next tick declares the gap unrecoverable
        std::thread::sleep(Duration::from_millis(5));
        PacketOrderer::expire_gaps(&orderer.states, &orderer.report_tx, &orderer.gaps_expired);

        let report = rx.try_recv().expect("expected out-of-order report");
        assert_eq!(report.account_id, "a");
        assert_eq!(report.expected_sequence, 11);
        assert_eq!(report.buffered_head, 15);
        assert_eq!(orderer.stats().gaps_expired, 1);

        // Next observed sequence becomes the new baseline
        assert_eq!(orderer.restore_order(sync_packet("a", 3)).len(), 1);
        assert_eq!(orderer.restore_order(sync_packet("a", 4)).len(), 1);
    }

    #[test]
    fn test_unexpired_gap_not_reported() {
        let (orderer, mut rx) = orderer();
        orderer.restore_order(sync_packet("a", 10));
        orderer.restore_order(sync_packet("a", 15));

        PacketOrderer::expire_gaps(&orderer.states, &orderer.report_tx, &orderer.gaps_expired);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_clears_state() {
        let (orderer, _rx) = orderer();
        orderer.restore_order(sync_packet("a", 10));
        orderer.stop();
        assert_eq!(orderer.stats().accounts_tracked, 0);
        // Baseline was discarded: sequence 1 is adopted fresh
        assert_eq!(orderer.restore_order(sync_packet("a", 1)).len(), 1);
    }
}
