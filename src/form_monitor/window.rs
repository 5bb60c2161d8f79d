use crate::config::FrequencyConfig;
use std::collections::{HashMap, VecDeque};

/// (form_origin, action_origin)
pub type OriginPair = (String, String);

/// Recent submission timestamps per origin pair, in milliseconds.
///
/// Each pair keeps at most `max_timestamps` entries, and entries more than
/// `window_seconds` older than the newest one are dropped. A pair whose newest
/// entry falls out of the window relative to the latest submission seen on
/// any pair is forgotten.
#[derive(Debug)]
pub struct SubmissionWindow {
    max_timestamps: usize,
    window_ms: i64,
    latest_ms: i64,
    entries: HashMap<OriginPair, VecDeque<i64>>,
}

impl SubmissionWindow {
    pub fn new(config: &FrequencyConfig) -> Self {
        Self {
            max_timestamps: config.max_timestamps.max(1),
            window_ms: i64::try_from(config.window_seconds.saturating_mul(1000)).unwrap_or(i64::MAX),
            latest_ms: i64::MIN,
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, pair: &OriginPair, timestamp_ms: i64) {
        let timestamps = self.entries.entry(pair.clone()).or_default();
        // Out-of-order events are slotted in so intervals stay non-negative.
        let pos = timestamps.partition_point(|&t| t <= timestamp_ms);
        timestamps.insert(pos, timestamp_ms);

        let newest = timestamps.back().copied().unwrap_or(timestamp_ms);
        while timestamps.len() > self.max_timestamps {
            timestamps.pop_front();
        }
        while timestamps
            .front()
            .map(|&t| newest.saturating_sub(t) > self.window_ms)
            .unwrap_or(false)
        {
            timestamps.pop_front();
        }

        if timestamp_ms > self.latest_ms {
            self.latest_ms = timestamp_ms;
            self.evict_idle();
        }
    }

    fn evict_idle(&mut self) {
        let (latest, window) = (self.latest_ms, self.window_ms);
        self.entries.retain(|_, timestamps| {
            timestamps
                .back()
                .map(|&newest| latest.saturating_sub(newest) <= window)
                .unwrap_or(false)
        });
    }

    pub fn pair_count(&self) -> usize {
        self.entries.len()
    }

    pub fn timestamps(&self, pair: &OriginPair) -> Vec<i64> {
        self.entries
            .get(pair)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, pair: &OriginPair) -> usize {
        self.entries.get(pair).map(VecDeque::len).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Mean gap between the last `sample_size` timestamps, or `None` with fewer
/// than three of them.
pub fn average_interval_ms(timestamps: &[i64], sample_size: usize) -> Option<f64> {
    let take = sample_size.min(timestamps.len());
    if take < 3 {
        return None;
    }
    let recent = &timestamps[timestamps.len() - take..];
    let span = recent[take - 1] - recent[0];
    Some(span as f64 / (take - 1) as f64)
}
