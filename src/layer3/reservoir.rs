// Reservoir - rolling-window summary statistics
// Fixed number of sub-windows over a total span, lazy age-based eviction

use chrono::Utc;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Summary over the live sub-windows
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReservoirStatistics {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

impl fmt::Display for ReservoirStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReservoirStatistics(count={}, avg={:.2}, min={:.2}, max={:.2})",
            self.count, self.average, self.min, self.max
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct SubWindow {
    index: i64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl SubWindow {
    fn new(index: i64, value: f64) -> Self {
        Self {
            index,
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Bounded time-windowed sample buffer.
///
/// Measurements land in one of `sub_windows` aggregate buckets covering the
/// total `span`; buckets older than the span are evicted lazily on the next
/// record or read. Memory is O(sub_windows), record is O(1) amortized.
pub struct Reservoir {
    interval_ms: i64,
    window_count: i64,
    windows: VecDeque<SubWindow>,
}

impl Reservoir {
    pub fn new(sub_windows: usize, span: Duration) -> Self {
        let window_count = sub_windows.max(1) as i64;
        let interval_ms = (span.as_millis() as i64 / window_count).max(1);
        Self {
            interval_ms,
            window_count,
            windows: VecDeque::with_capacity(sub_windows),
        }
    }

    pub fn record(&mut self, value: f64) {
        self.record_at(value, Utc::now().timestamp_millis());
    }

    pub fn record_at(&mut self, value: f64, at_ms: i64) {
        let index = at_ms.div_euclid(self.interval_ms);
        self.evict(index);

        // Measurements arrive in roughly increasing time order, so the
        // matching bucket is almost always at the back
        if let Some(position) = self.windows.iter().rposition(|w| w.index == index) {
            self.windows[position].record(value);
            return;
        }
        let belongs_at_back = self.windows.back().map(|w| w.index < index).unwrap_or(true);
        if belongs_at_back {
            self.windows.push_back(SubWindow::new(index, value));
        } else {
            let position = self.windows.partition_point(|w| w.index < index);
            self.windows.insert(position, SubWindow::new(index, value));
        }
    }

    pub fn statistics(&mut self) -> ReservoirStatistics {
        self.statistics_at(Utc::now().timestamp_millis())
    }

    pub fn statistics_at(&mut self, at_ms: i64) -> ReservoirStatistics {
        self.evict(at_ms.div_euclid(self.interval_ms));

        let mut statistics = ReservoirStatistics::default();
        for window in &self.windows {
            if statistics.count == 0 {
                statistics.min = window.min;
                statistics.max = window.max;
            } else {
                statistics.min = statistics.min.min(window.min);
                statistics.max = statistics.max.max(window.max);
            }
            statistics.count += window.count;
            statistics.sum += window.sum;
        }
        if statistics.count > 0 {
            statistics.average = statistics.sum / statistics.count as f64;
        }
        statistics
    }

    fn evict(&mut self, current_index: i64) {
        let cutoff = current_index - self.window_count;
        while let Some(front) = self.windows.front() {
            if front.index <= cutoff {
                self.windows.pop_front();
            } else {
                break;
            }
        }
    }
}
