//! Correlation pass: group raw events into fused composites.
//!
//! Rules are applied in declaration order over one working set. Each event
//! joins at most one fused event per pass; matched events leave the working
//! set before the next rule runs.

use chrono::{DateTime, Duration, Utc};

use super::types::{FusedEvent, FusionRule, RawEvent};
use crate::types::{FusedEventId, GeoPoint, Priority, ThreatLevel};

/// Confidence grows with corroboration: `min(100, 50 + 10 * members)`.
pub fn confidence_score(member_count: usize) -> u8 {
    (50 + 10 * member_count).min(100) as u8
}

/// Run every rule over `events`. Returns fused events and the events no
/// rule consumed, in their original order.
pub fn correlate(
    rules: &[FusionRule],
    events: Vec<RawEvent>,
    now: DateTime<Utc>,
) -> (Vec<FusedEvent>, Vec<RawEvent>) {
    let mut consumed = vec![false; events.len()];
    let mut fused = Vec::new();

    for rule in rules {
        let mut candidates: Vec<usize> = (0..events.len())
            .filter(|&i| !consumed[i] && rule.matches_type(&events[i].event_type))
            .collect();
        if candidates.len() < rule.min_events {
            continue;
        }
        candidates.sort_by_key(|&i| events[i].timestamp);

        if let Some(members) = find_cluster(rule, &events, &candidates) {
            for &i in &members {
                consumed[i] = true;
            }
            let refs: Vec<&RawEvent> = members.iter().map(|&i| &events[i]).collect();
            let event = build_fused(rule, &refs, now);
            tracing::debug!(
                "fusion_rule_matched: rule={}, members={}, confidence={}",
                rule.name,
                event.source_events.len(),
                event.confidence
            );
            fused.push(event);
        }
    }

    let unfused = events
        .into_iter()
        .zip(consumed)
        .filter_map(|(event, used)| (!used).then_some(event))
        .collect();
    (fused, unfused)
}

/// First anchor (in time order) whose window and radius hold enough members.
fn find_cluster(rule: &FusionRule, events: &[RawEvent], candidates: &[usize]) -> Option<Vec<usize>> {
    let window = Duration::from_std(rule.time_window).unwrap_or_else(|_| Duration::MAX);

    for (pos, &anchor_idx) in candidates.iter().enumerate() {
        let anchor = &events[anchor_idx];
        if rule.geo_radius_m.is_some() && anchor.geolocation.is_none() {
            continue;
        }
        if candidates.len() - pos < rule.min_events {
            break;
        }

        let members: Vec<usize> = candidates[pos..]
            .iter()
            .copied()
            .filter(|&i| {
                let event = &events[i];
                event.timestamp - anchor.timestamp <= window && within_radius(rule, anchor, event)
            })
            .collect();

        if members.len() >= rule.min_events {
            return Some(members);
        }
    }
    None
}

fn within_radius(rule: &FusionRule, anchor: &RawEvent, event: &RawEvent) -> bool {
    match (rule.geo_radius_m, anchor.geolocation, event.geolocation) {
        (None, _, _) => true,
        (Some(radius), Some(a), Some(b)) => a.haversine_m(&b) <= radius,
        _ => false,
    }
}

fn build_fused(rule: &FusionRule, members: &[&RawEvent], now: DateTime<Utc>) -> FusedEvent {
    let window_start = members.iter().map(|e| e.timestamp).min().unwrap_or(now);
    let window_end = members.iter().map(|e| e.timestamp).max().unwrap_or(now);
    let points: Vec<GeoPoint> = members.iter().filter_map(|e| e.geolocation).collect();
    let priority = members
        .iter()
        .map(|e| e.priority)
        .min()
        .unwrap_or(Priority::Medium);
    let threat_level = members
        .iter()
        .map(|e| e.effective_threat())
        .max()
        .unwrap_or(ThreatLevel::Low);

    let mut sources: Vec<String> = Vec::new();
    let mut event_types: Vec<String> = Vec::new();
    let mut entity_ids: Vec<String> = Vec::new();
    for event in members {
        push_unique(&mut sources, &event.source);
        push_unique(&mut event_types, &event.event_type);
        if let Some(entity) = &event.entity_id {
            push_unique(&mut entity_ids, entity);
        }
    }

    FusedEvent {
        id: FusedEventId::new(),
        rule_name: rule.name.clone(),
        source_events: members.iter().map(|e| e.id.clone()).collect(),
        source_count: sources.len(),
        sources,
        event_types,
        window_start,
        window_end,
        geolocation: GeoPoint::centroid(&points),
        entity_ids,
        priority,
        threat_level,
        confidence: confidence_score(members.len()),
        recommended_actions: rule.recommended_actions.clone(),
        requires_action: priority.requires_action(),
        created_at: now,
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventId;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration as StdDuration;

    fn gunshot(source: &str, offset_secs: i64, point: GeoPoint, base: DateTime<Utc>) -> RawEvent {
        RawEvent::new(source, "gunshot_detected")
            .with_priority(Priority::High)
            .with_geolocation(point)
            .with_timestamp(base + Duration::seconds(offset_secs))
    }

    fn gunshot_rule() -> FusionRule {
        FusionRule::new("gunshot_cluster", &["gunshot_detected"], 2)
            .with_time_window(StdDuration::from_secs(30))
            .with_geo_radius(500.0)
            .with_actions(&["dispatch_nearest_units"])
    }

    #[test]
    fn test_fuses_cluster_within_window_and_radius() {
        let base = Utc::now();
        let events = vec![
            gunshot("a", 0, GeoPoint::new(40.7000, -74.0000), base),
            gunshot("b", 4, GeoPoint::new(40.7010, -74.0000), base),
            gunshot("c", 9, GeoPoint::new(40.7000, -74.0010), base),
        ];
        let (fused, unfused) = correlate(&[gunshot_rule()], events, base);

        assert_eq!(fused.len(), 1);
        assert!(unfused.is_empty());
        let f = &fused[0];
        assert_eq!(f.source_count, 3);
        assert_eq!(f.confidence, 80);
        assert!(f.requires_action);
        assert_eq!(f.window_start, base);
        assert_eq!(f.window_end, base + Duration::seconds(9));
        assert_eq!(f.recommended_actions, vec!["dispatch_nearest_units"]);
        let centroid = f.geolocation.unwrap();
        assert!((centroid.lat - 40.70033).abs() < 1e-4);
    }

    #[test]
    fn test_outliers_stay_unfused() {
        let base = Utc::now();
        let events = vec![
            gunshot("a", 0, GeoPoint::new(40.70, -74.0), base),
            gunshot("b", 5, GeoPoint::new(40.70, -74.0), base),
            // too late
            gunshot("c", 120, GeoPoint::new(40.70, -74.0), base),
            // too far (~11km)
            gunshot("d", 6, GeoPoint::new(40.80, -74.0), base),
            RawEvent::new("e", "door_open").with_timestamp(base),
        ];
        let (fused, unfused) = correlate(&[gunshot_rule()], events, base);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].source_events.len(), 2);
        let left: Vec<&str> = unfused.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(left, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_later_rules_cannot_reuse_events() {
        let base = Utc::now();
        let events = vec![
            gunshot("a", 0, GeoPoint::new(1.0, 1.0), base),
            gunshot("b", 1, GeoPoint::new(1.0, 1.0), base),
        ];
        let broad = FusionRule::new("any_gunshot", &["gunshot_detected"], 1);
        let (fused, _) = correlate(&[gunshot_rule(), broad], events, base);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].rule_name, "gunshot_cluster");
    }

    #[test]
    fn test_threat_and_priority_aggregation() {
        let base = Utc::now();
        let events = vec![
            RawEvent::new("a", "crowd_surge")
                .with_priority(Priority::Low)
                .with_threat_level(ThreatLevel::Medium)
                .with_timestamp(base),
            RawEvent::new("b", "crowd_surge")
                .with_priority(Priority::Medium)
                .with_threat_level(ThreatLevel::Critical)
                .with_timestamp(base),
        ];
        let rule = FusionRule::new("crowd", &["crowd_surge"], 2);
        let (fused, _) = correlate(&[rule], events, base);
        assert_eq!(fused[0].priority, Priority::Medium);
        assert_eq!(fused[0].threat_level, ThreatLevel::Critical);
        assert!(!fused[0].requires_action);
        assert!(fused[0].geolocation.is_none());
    }

    #[test]
    fn test_confidence_caps_at_100() {
        assert_eq!(confidence_score(1), 60);
        assert_eq!(confidence_score(5), 100);
        assert_eq!(confidence_score(50), 100);
    }

    proptest! {
        #[test]
        fn each_event_fused_at_most_once(
            members in prop::collection::vec((0usize..3, 0i64..60), 0..40),
            mins in prop::collection::vec(1usize..4, 1..4),
        ) {
            let base = Utc::now();
            let types = ["alpha", "beta", "gamma"];
            let events: Vec<RawEvent> = members
                .iter()
                .map(|(t, offset)| {
                    RawEvent::new("src", types[*t]).with_timestamp(base + Duration::seconds(*offset))
                })
                .collect();
            let total = events.len();
            let rules: Vec<FusionRule> = mins
                .iter()
                .enumerate()
                .map(|(i, min)| {
                    FusionRule::new(format!("r{i}"), &types[..=(i % 3)], *min)
                        .with_time_window(StdDuration::from_secs(20))
                })
                .collect();

            let (fused, unfused) = correlate(&rules, events, base);
            let mut seen: HashSet<EventId> = HashSet::new();
            for f in &fused {
                for id in &f.source_events {
                    prop_assert!(seen.insert(id.clone()), "event fused twice");
                }
            }
            prop_assert_eq!(seen.len() + unfused.len(), total);
        }
    }
}
