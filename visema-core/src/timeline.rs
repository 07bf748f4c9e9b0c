//! Viseme timelines and the mouth openness table

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Category reported before the first event and for empty timelines.
pub const SILENCE: &str = "SIL";

/// Alternate spelling of silence emitted by some phoneme extractors.
pub const SILENCE_ALIAS: &str = "rest";

/// Upper bound on events accepted in one timeline.
pub const MAX_TIMELINE_EVENTS: usize = 10_000;

/// Upper bound on a category label length.
const MAX_CATEGORY_LEN: usize = 32;

/// One viseme event, anchored to session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viseme {
    #[serde(rename = "timeOffsetMs", alias = "timeMs", alias = "time_offset_ms")]
    pub time_offset_ms: u64,
    #[serde(alias = "type")]
    pub category: String,
}

impl Viseme {
    pub fn new(time_offset_ms: u64, category: impl Into<String>) -> Self {
        Self {
            time_offset_ms,
            category: category.into(),
        }
    }
}

/// Ordered viseme events, non-decreasing in offset.
///
/// Lookup relies on the ordering, so construction rejects unordered input
/// instead of re-sorting it. Cloning is cheap: events are shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Viseme>", into = "Vec<Viseme>")]
pub struct Timeline {
    events: Arc<Vec<Viseme>>,
}

impl Timeline {
    pub fn new(events: Vec<Viseme>) -> Result<Self> {
        if events.len() > MAX_TIMELINE_EVENTS {
            return Err(Error::Validation(format!(
                "Timeline has {} events (max {})",
                events.len(),
                MAX_TIMELINE_EVENTS
            )));
        }

        for (idx, event) in events.iter().enumerate() {
            if event.category.is_empty() || event.category.len() > MAX_CATEGORY_LEN {
                return Err(Error::Validation(format!(
                    "Viseme {} has an invalid category label",
                    idx
                )));
            }
            if event.category.chars().any(|c| c.is_control()) {
                return Err(Error::Validation(format!(
                    "Viseme {} category contains control characters",
                    idx
                )));
            }
        }

        if let Some(idx) = events
            .windows(2)
            .position(|pair| pair[1].time_offset_ms < pair[0].time_offset_ms)
        {
            return Err(Error::Validation(format!(
                "Timeline is not ordered: event {} at {}ms precedes event {} at {}ms",
                idx + 1,
                events[idx + 1].time_offset_ms,
                idx,
                events[idx].time_offset_ms
            )));
        }

        Ok(Self {
            events: Arc::new(events),
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Viseme] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Offset of the final event, if any.
    pub fn last_offset_ms(&self) -> Option<u64> {
        self.events.last().map(|v| v.time_offset_ms)
    }

    /// Category of the last event with `time_offset_ms <= elapsed_ms`.
    ///
    /// Equal offsets resolve to the later event. Past the final event the last
    /// category is held rather than reset to silence.
    pub fn category_at(&self, elapsed_ms: u64) -> &str {
        let idx = self
            .events
            .partition_point(|v| v.time_offset_ms <= elapsed_ms);
        if idx == 0 {
            SILENCE
        } else {
            &self.events[idx - 1].category
        }
    }
}

impl TryFrom<Vec<Viseme>> for Timeline {
    type Error = Error;

    fn try_from(events: Vec<Viseme>) -> Result<Self> {
        Timeline::new(events)
    }
}

impl From<Timeline> for Vec<Viseme> {
    fn from(timeline: Timeline) -> Self {
        timeline.events.as_ref().clone()
    }
}

/// Free-function form of [`Timeline::category_at`].
pub fn current_category(timeline: &Timeline, elapsed_ms: u64) -> &str {
    timeline.category_at(elapsed_ms)
}

/// Mouth-open fraction for a viseme category.
///
/// This table is the only place visual tuning lives. Unknown categories map
/// to a neutral half-open mouth.
pub fn category_to_openness(category: &str) -> f32 {
    match category {
        "aa" | "ae" | "ah" => 1.0,
        "ao" | "ow" => 0.8,
        "uw" | "uh" => 0.6,
        "iy" | "ih" => 0.4,
        "t" | "d" | "s" | "z" => 0.25,
        "p" | "b" | "m" => 0.1,
        SILENCE | SILENCE_ALIAS => 0.05,
        // Amazon Polly viseme codes (the dialogue service's speech marks)
        "a" => 1.0,
        "o" | "O" => 0.8,
        "E" => 0.7,
        "@" | "e" | "u" => 0.6,
        "i" | "r" => 0.4,
        "k" => 0.3,
        "T" | "S" => 0.25,
        "f" => 0.2,
        "sil" => 0.05,
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Timeline {
        Timeline::new(vec![
            Viseme::new(0, "SIL"),
            Viseme::new(300, "aa"),
            Viseme::new(300, "ow"),
            Viseme::new(900, "m"),
        ])
        .unwrap()
    }

    #[test]
    fn test_empty_timeline_is_silent() {
        let timeline = Timeline::empty();
        assert_eq!(timeline.category_at(0), SILENCE);
        assert_eq!(timeline.category_at(u64::MAX), SILENCE);
    }

    #[test]
    fn test_before_first_event_is_silent() {
        let timeline = Timeline::new(vec![Viseme::new(100, "aa")]).unwrap();
        assert_eq!(timeline.category_at(99), SILENCE);
        assert_eq!(timeline.category_at(100), "aa");
    }

    #[test]
    fn test_equal_offsets_later_event_wins() {
        let timeline = sample();
        assert_eq!(timeline.category_at(299), "SIL");
        assert_eq!(timeline.category_at(300), "ow");
        assert_eq!(timeline.category_at(899), "ow");
    }

    #[test]
    fn test_last_category_is_held() {
        let timeline = sample();
        assert_eq!(timeline.category_at(900), "m");
        assert_eq!(timeline.category_at(60_000), "m");
    }

    #[test]
    fn test_unordered_timeline_rejected() {
        let err = Timeline::new(vec![Viseme::new(500, "aa"), Viseme::new(100, "m")]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_oversized_timeline_rejected() {
        let events = (0..=MAX_TIMELINE_EVENTS as u64)
            .map(|i| Viseme::new(i, "aa"))
            .collect();
        assert!(Timeline::new(events).is_err());
    }

    #[test]
    fn test_empty_category_rejected() {
        assert!(Timeline::new(vec![Viseme::new(0, "")]).is_err());
    }

    #[test]
    fn test_openness_table() {
        assert_eq!(category_to_openness("aa"), 1.0);
        assert_eq!(category_to_openness("ow"), 0.8);
        assert_eq!(category_to_openness("uh"), 0.6);
        assert_eq!(category_to_openness("ih"), 0.4);
        assert_eq!(category_to_openness("z"), 0.25);
        assert_eq!(category_to_openness("b"), 0.1);
        assert_eq!(category_to_openness("SIL"), 0.05);
        assert_eq!(category_to_openness("rest"), 0.05);
        assert_eq!(category_to_openness("sil"), 0.05);
        assert_eq!(category_to_openness("O"), 0.8);
        assert_eq!(category_to_openness("zh"), 0.5);
        assert_eq!(category_to_openness(""), 0.5);
    }

    #[test]
    fn test_deserializes_both_field_spellings() {
        let json = r#"[{"timeOffsetMs":0,"category":"SIL"},{"timeMs":300,"type":"aa"}]"#;
        let timeline: Timeline = serde_json::from_str(json).unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.category_at(350), "aa");
    }

    #[test]
    fn test_deserialize_rejects_unordered() {
        let json = r#"[{"timeMs":300,"type":"aa"},{"timeMs":0,"type":"SIL"}]"#;
        assert!(serde_json::from_str::<Timeline>(json).is_err());
    }

    #[test]
    fn test_deserialize_rejects_negative_offset() {
        let json = r#"[{"timeMs":-5,"type":"aa"}]"#;
        assert!(serde_json::from_str::<Timeline>(json).is_err());
    }
}
