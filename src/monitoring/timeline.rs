//! Execution Timeline
//!
//! Tracks when each device job of a run starts and ends, for the
//! per-context durations stored with the run state and the CLI chart.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::{Map, Value};

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Execution context, `<path>><device>`
    pub key: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: u128,
    end: u128,
    failed: bool,
}

impl Span {
    fn duration(&self) -> u128 {
        self.end - self.start
    }
}

/// Start and end times of the device jobs of one run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, key: String, event_type: EventType) {
        self.events.push(TimelineEvent {
            key,
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Offsets in milliseconds of each finished context. Contexts that
    /// never finished are left out.
    fn spans(&self) -> HashMap<String, Span> {
        let mut opened: HashMap<&str, u128> = HashMap::new();
        let mut spans = HashMap::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type == EventType::Started {
                opened.insert(&event.key, offset);
                continue;
            }
            if let Some(&start) = opened.get(event.key.as_str()) {
                let span = Span {
                    start,
                    end: offset,
                    failed: event.event_type == EventType::Failed,
                };
                spans.insert(event.key.clone(), span);
            }
        }
        spans
    }

    /// Text chart of every finished context over 50 columns; failed
    /// device jobs are drawn with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut chart = String::from("Device jobs:\n");
        let run_ms = self.start_time.elapsed().as_millis();
        if run_ms == 0 {
            return chart;
        }
        let columns_per_ms = 50.0 / run_ms as f64;

        let mut rows: Vec<(String, Span)> = self.spans().into_iter().collect();
        rows.sort_by(|a, b| a.1.start.cmp(&b.1.start).then_with(|| a.0.cmp(&b.0)));

        for (key, span) in rows {
            let offset = (span.start as f64 * columns_per_ms) as usize;
            let length = (span.duration() as f64 * columns_per_ms).max(1.0) as usize;
            let mark = if span.failed { "x" } else { "#" };
            chart.push_str(&format!(
                "{} |{}{}| {} ms\n",
                truncate(&key, 20),
                " ".repeat(offset),
                mark.repeat(length),
                span.duration()
            ));
        }
        chart.push_str(&format!("Run: {} ms\n", run_ms));
        chart
    }

    /// Context durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(key, span)| (key, span.duration()))
            .collect()
    }

    /// Durations as a JSON object, stored in the run's state snapshot.
    pub fn durations_value(&self) -> Value {
        let map: Map<String, Value> = self
            .get_durations()
            .into_iter()
            .map(|(key, ms)| (key, Value::from(ms as u64)))
            .collect();
        Value::Object(map)
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or cuts a label to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_durations_by_context() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("1>r1".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("1>r1".to_string(), EventType::Completed);

        let durations = timeline.get_durations();
        assert!(*durations.get("1>r1").unwrap() >= 30);
    }

    #[test]
    fn test_unfinished_context_left_out() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("1>r1".to_string(), EventType::Started);
        timeline.add_event("1>r2".to_string(), EventType::Started);
        timeline.add_event("1>r2".to_string(), EventType::Failed);

        let durations = timeline.get_durations();
        assert!(!durations.contains_key("1>r1"));
        assert!(durations.contains_key("1>r2"));
        assert!(timeline.durations_value().get("1>r2").is_some());
    }

    #[test]
    fn test_gantt_chart() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("1>r1".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("1>r1".to_string(), EventType::Completed);
        timeline.add_event("1>2>a-very-long-device-name".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("1>2>a-very-long-device-name".to_string(), EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("1>r1"));
        assert!(chart.contains("..."));
        assert!(chart.contains("#|"));
        assert!(chart.contains("x|"));
        assert!(chart.contains("Run:"));
    }

    #[test]
    fn test_truncate_pads_short_labels() {
        assert_eq!(truncate("ab", 4), "ab  ");
        assert_eq!(truncate("abcdefgh", 6), "abc...");
    }
}
