//! Engagement scoring.
//!
//! Score = preview engagement + message engagement + outbound recency +
//! conversion intent, each capped at 25. The scorer is a pure function of
//! the timeline and `now`; the cached copy on the lead is maintained by
//! [`refresh::ScoreRefresher`].

pub mod refresh;

use serde::Serialize;

use leadflow_core::events::{Event, EventType};
use leadflow_core::types::{EngagementScore, Temperature, Timestamp, Trend};

pub use refresh::ScoreRefresher;

/// Ceiling for each of the four components.
pub const COMPONENT_CAP: u32 = 25;

const SECS_PER_DAY: i64 = 86_400;

/// Outbound recency table: (max whole days since last touch, points).
/// Points never increase as days grow.
const RECENCY_STEPS: [(u32, u8); 4] = [(2, 25), (7, 18), (14, 10), (30, 5)];

/// Points for outbound recency given whole days since the last touch.
pub fn recency_points(days: u32) -> u8 {
    RECENCY_STEPS
        .iter()
        .find(|(max_days, _)| days <= *max_days)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

/// Per-component points, each already capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScoreBreakdown {
    pub preview: u8,
    pub message: u8,
    pub recency: u8,
    pub intent: u8,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u8 {
        self.preview + self.message + self.recency + self.intent
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngagementScorer {
    trend_period_secs: i64,
}

impl EngagementScorer {
    pub fn new(trend_period_days: u32) -> Self {
        Self {
            trend_period_secs: i64::from(trend_period_days.max(1)) * SECS_PER_DAY,
        }
    }

    pub fn score(&self, events: &[Event], now: Timestamp) -> EngagementScore {
        let total = self.components(events, now).total();
        EngagementScore {
            score: total,
            temperature: Temperature::from_score(total),
            trend: self.trend(events, now),
            computed_at: now,
        }
    }

    /// Component breakdown. Events after `now` are ignored.
    pub fn components(&self, events: &[Event], now: Timestamp) -> ScoreBreakdown {
        let past = || events.iter().filter(move |e| e.timestamp <= now);

        let mut views = 0u32;
        let mut clicks = 0u32;
        let mut opens = 0u32;
        let mut replies = 0u32;
        let mut calls = 0u32;
        let mut positive = 0u32;
        let mut pricing = 0u32;
        let mut link_opens = 0u32;
        let mut payments = 0u32;
        let mut last_outbound: Option<Timestamp> = None;
        let mut first_view_day: Option<i64> = None;

        for event in past() {
            match event.event_type {
                EventType::PreviewViewed => {
                    views += 1;
                    let day = utc_day(event.timestamp);
                    first_view_day = Some(first_view_day.map_or(day, |d| d.min(day)));
                }
                EventType::PreviewCtaClicked => clicks += 1,
                EventType::MessageOpened => opens += 1,
                EventType::MessageReplied => replies += 1,
                EventType::CallConnected => calls += 1,
                EventType::PositiveReply => positive += 1,
                EventType::PricingViewed => pricing += 1,
                EventType::PaymentLinkOpened => link_opens += 1,
                EventType::PaymentCompleted => payments += 1,
                _ => {}
            }
            if event.event_type.is_outbound_touch() {
                last_outbound = Some(last_outbound.map_or(event.timestamp, |t| t.max(event.timestamp)));
            }
        }

        let return_visits = match first_view_day {
            Some(first) => past()
                .filter(|e| e.event_type == EventType::PreviewViewed)
                .filter(|e| utc_day(e.timestamp) > first)
                .count() as u32,
            None => 0,
        };

        ScoreBreakdown {
            preview: capped(views * 4 + return_visits * 3 + clicks * 6),
            message: capped(opens * 3 + replies * 8 + calls * 6),
            recency: last_outbound
                .map(|t| recency_points(t.days_until(now)))
                .unwrap_or(0),
            intent: capped(positive * 15 + pricing * 8 + link_opens * 10 + payments * 25),
        }
    }

    /// Event volume in `(now - P, now]` against `(now - 2P, now - P]`.
    pub fn trend(&self, events: &[Event], now: Timestamp) -> Trend {
        let period = self.trend_period_secs;
        let current_start = now.0.saturating_sub(period);
        let previous_start = current_start.saturating_sub(period);

        let (mut current, mut previous) = (0usize, 0usize);
        for event in events {
            let t = event.timestamp.0;
            if t > current_start && t <= now.0 {
                current += 1;
            } else if t > previous_start && t <= current_start {
                previous += 1;
            }
        }
        match current.cmp(&previous) {
            std::cmp::Ordering::Greater => Trend::Up,
            std::cmp::Ordering::Less => Trend::Down,
            std::cmp::Ordering::Equal => Trend::Flat,
        }
    }
}

impl Default for EngagementScorer {
    fn default() -> Self {
        Self::new(7)
    }
}

fn capped(points: u32) -> u8 {
    points.min(COMPONENT_CAP) as u8
}

fn utc_day(t: Timestamp) -> i64 {
    t.0.div_euclid(SECS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const DAY: i64 = 86_400;
    // 2026-03-02T12:00:00Z, midday so same-day offsets stay on one UTC day.
    const NOW: Timestamp = Timestamp(1_772_452_800);

    fn event(event_type: EventType, secs_ago: i64) -> Event {
        Event::new(Uuid::nil(), event_type, Timestamp(NOW.0 - secs_ago))
    }

    fn scorer() -> EngagementScorer {
        EngagementScorer::default()
    }

    #[test]
    fn test_empty_timeline_is_cold_and_flat() {
        let score = scorer().score(&[], NOW);
        assert_eq!(score.score, 0);
        assert_eq!(score.temperature, Temperature::Cold);
        assert_eq!(score.trend, Trend::Flat);
        assert_eq!(score.computed_at, NOW);
    }

    #[test]
    fn test_preview_component_counts_return_visits() {
        let events = vec![
            event(EventType::PreviewViewed, 3 * DAY),
            event(EventType::PreviewViewed, 3 * DAY - 60),
            event(EventType::PreviewViewed, DAY),
        ];
        // 3 views * 4 + 1 return visit * 3
        assert_eq!(scorer().components(&events, NOW).preview, 15);
    }

    #[test]
    fn test_components_are_capped() {
        let events: Vec<Event> = (0..20)
            .flat_map(|i| {
                vec![
                    event(EventType::PreviewCtaClicked, i * 60),
                    event(EventType::MessageReplied, i * 60),
                    event(EventType::PaymentCompleted, i * 60),
                    event(EventType::MessageSent, i * 60),
                ]
            })
            .collect();
        let breakdown = scorer().components(&events, NOW);
        assert_eq!(
            breakdown,
            ScoreBreakdown {
                preview: 25,
                message: 25,
                recency: 25,
                intent: 25,
            }
        );
        let score = scorer().score(&events, NOW);
        assert_eq!(score.score, 100);
        assert_eq!(score.temperature, Temperature::Hot);
    }

    #[test]
    fn test_message_and_intent_weights() {
        let events = vec![
            event(EventType::MessageOpened, DAY),
            event(EventType::CallConnected, DAY),
            event(EventType::PricingViewed, DAY),
            event(EventType::PaymentLinkOpened, DAY),
        ];
        let breakdown = scorer().components(&events, NOW);
        assert_eq!(breakdown.message, 9);
        assert_eq!(breakdown.intent, 18);
        assert_eq!(breakdown.recency, 0);
    }

    #[test]
    fn test_recency_uses_latest_outbound_touch() {
        let events = vec![
            event(EventType::MessageSent, 40 * DAY),
            event(EventType::CallPlaced, 5 * DAY),
        ];
        assert_eq!(scorer().components(&events, NOW).recency, 18);
    }

    #[test]
    fn test_recency_table_boundaries() {
        assert_eq!(recency_points(0), 25);
        assert_eq!(recency_points(2), 25);
        assert_eq!(recency_points(3), 18);
        assert_eq!(recency_points(7), 18);
        assert_eq!(recency_points(8), 10);
        assert_eq!(recency_points(14), 10);
        assert_eq!(recency_points(15), 5);
        assert_eq!(recency_points(30), 5);
        assert_eq!(recency_points(31), 0);
    }

    #[test]
    fn test_recency_is_non_increasing() {
        for days in 0..400 {
            assert!(recency_points(days) >= recency_points(days + 1), "day {}", days);
        }
    }

    #[test]
    fn test_future_events_ignored() {
        let events = vec![Event::new(
            Uuid::nil(),
            EventType::PaymentCompleted,
            Timestamp(NOW.0 + DAY),
        )];
        assert_eq!(scorer().score(&events, NOW).score, 0);
    }

    #[test]
    fn test_trend_windows() {
        let up = vec![
            event(EventType::MessageOpened, DAY),
            event(EventType::MessageOpened, 2 * DAY),
            event(EventType::MessageOpened, 8 * DAY),
        ];
        assert_eq!(scorer().trend(&up, NOW), Trend::Up);

        let down = vec![
            event(EventType::MessageOpened, DAY),
            event(EventType::MessageOpened, 9 * DAY),
            event(EventType::MessageOpened, 10 * DAY),
        ];
        assert_eq!(scorer().trend(&down, NOW), Trend::Down);

        // Exactly P ago belongs to the previous window; older than 2P to none.
        let flat = vec![
            event(EventType::MessageOpened, 0),
            event(EventType::MessageOpened, 7 * DAY),
            event(EventType::MessageOpened, 30 * DAY),
        ];
        assert_eq!(scorer().trend(&flat, NOW), Trend::Flat);
    }

    #[test]
    fn test_score_is_deterministic_and_order_independent() {
        let mut events = vec![
            event(EventType::PreviewViewed, 4 * DAY),
            event(EventType::MessageSent, 3 * DAY),
            event(EventType::PositiveReply, DAY),
            event(EventType::PreviewViewed, 60),
        ];
        let first = scorer().score(&events, NOW);
        events.reverse();
        assert_eq!(scorer().score(&events, NOW), first);
    }

    #[test]
    fn test_temperature_boundaries_through_scorer() {
        // 2 positive replies = 25 (capped), 1 open = 3, 1 call = 6 -> 34
        let events = vec![
            event(EventType::PositiveReply, DAY),
            event(EventType::PositiveReply, DAY),
            event(EventType::MessageOpened, DAY),
            event(EventType::CallConnected, DAY),
        ];
        let score = scorer().score(&events, NOW);
        assert_eq!(score.score, 34);
        assert_eq!(score.temperature, Temperature::Warm);

        assert_eq!(Temperature::from_score(30), Temperature::Cold);
        assert_eq!(Temperature::from_score(31), Temperature::Warm);
        assert_eq!(Temperature::from_score(70), Temperature::Warm);
        assert_eq!(Temperature::from_score(71), Temperature::Hot);
    }
}
