//! Calendar column layout.
//!
//! Greedy interval partitioning: items sorted by start take the first lane
//! that is free again by their start. Widths are derived from the lanes
//! actually used, so quiet columns render wider cards.

use ulid::Ulid;

use crate::model::Span;

/// Share of the column reserved for event blocks when appointments overlap them.
pub const EVENT_SHARE_PCT: f64 = 35.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneItem {
    pub id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub id: Ulid,
    pub lane: usize,
    pub lanes_used: usize,
    pub left_pct: f64,
    pub width_pct: f64,
    pub is_event: bool,
}

/// Assign each item a lane index in `0..max_lanes`. Items that find no
/// free lane are clamped onto the last lane and will visibly overlap.
/// Returned in start order.
pub fn assign_lanes(items: &[LaneItem], max_lanes: usize) -> Vec<(LaneItem, usize)> {
    let max_lanes = max_lanes.max(1);
    let mut sorted = items.to_vec();
    sorted.sort_by_key(|i| (i.span.start, i.span.end));

    let mut lane_end = vec![0; max_lanes];
    let mut out = Vec::with_capacity(sorted.len());
    for item in sorted {
        let lane = lane_end
            .iter()
            .position(|end| *end <= item.span.start)
            .unwrap_or(max_lanes - 1);
        lane_end[lane] = lane_end[lane].max(item.span.end);
        out.push((item, lane));
    }
    out
}

/// Largest number of items covering any single instant.
pub fn peak_overlap(items: &[LaneItem]) -> usize {
    let mut points: Vec<(i32, i32)> = Vec::with_capacity(items.len() * 2);
    for i in items {
        points.push((i.span.start, 1));
        points.push((i.span.end, -1));
    }
    // Ends sort before starts at the same instant (half-open spans).
    points.sort();
    let (mut cur, mut best) = (0i32, 0i32);
    for (_, d) in points {
        cur += d;
        best = best.max(cur);
    }
    best as usize
}

pub fn lanes_used(assigned: &[(LaneItem, usize)]) -> usize {
    assigned.iter().map(|(_, lane)| lane + 1).max().unwrap_or(0)
}

/// Lay out one day column. Events stack in the left 35% and any
/// appointment overlapping an event is confined to the right 65%;
/// everything else uses the full width.
pub fn layout(appointments: &[LaneItem], events: &[LaneItem], max_lanes: usize) -> Vec<Placement> {
    let mut placements = Vec::with_capacity(appointments.len() + events.len());

    let event_lanes = assign_lanes(events, events.len());
    let used = lanes_used(&event_lanes);
    for (item, lane) in &event_lanes {
        let width = EVENT_SHARE_PCT / used as f64;
        placements.push(Placement {
            id: item.id,
            lane: *lane,
            lanes_used: used,
            left_pct: width * *lane as f64,
            width_pct: width,
            is_event: true,
        });
    }

    let assigned = assign_lanes(appointments, max_lanes);
    let used = lanes_used(&assigned);
    for (item, lane) in &assigned {
        let beside_event = events.iter().any(|e| e.span.overlaps(&item.span));
        let (region_left, region_width) = if beside_event {
            (EVENT_SHARE_PCT, 100.0 - EVENT_SHARE_PCT)
        } else {
            (0.0, 100.0)
        };
        let width = region_width / used as f64;
        placements.push(Placement {
            id: item.id,
            lane: *lane,
            lanes_used: used,
            left_pct: region_left + width * *lane as f64,
            width_pct: width,
            is_event: false,
        });
    }
    placements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(start: i32, end: i32) -> LaneItem {
        LaneItem {
            id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    #[test]
    fn same_lane_never_overlaps() {
        let items = vec![
            item(540, 600),
            item(540, 570),
            item(570, 630),
            item(600, 660),
            item(615, 645),
            item(660, 720),
        ];
        let assigned = assign_lanes(&items, 4);
        for (i, (a, la)) in assigned.iter().enumerate() {
            for (b, lb) in &assigned[i + 1..] {
                if la == lb {
                    assert!(!a.span.overlaps(&b.span), "{a:?} and {b:?} share lane {la}");
                }
            }
        }
        assert!(lanes_used(&assigned) <= 4);
        assert_eq!(lanes_used(&assigned), peak_overlap(&items));
    }

    #[test]
    fn sequential_items_share_one_lane() {
        let items = vec![item(540, 600), item(600, 660), item(660, 720)];
        let assigned = assign_lanes(&items, 3);
        assert!(assigned.iter().all(|(_, lane)| *lane == 0));

        let placed = layout(&items, &[], 3);
        assert!(placed.iter().all(|p| p.width_pct == 100.0 && p.left_pct == 0.0));
    }

    #[test]
    fn width_follows_lanes_used_not_max() {
        let items = vec![item(540, 600), item(540, 600)];
        let placed = layout(&items, &[], 6);
        assert!(placed.iter().all(|p| p.lanes_used == 2 && p.width_pct == 50.0));
        let lefts: Vec<f64> = placed.iter().map(|p| p.left_pct).collect();
        assert_eq!(lefts, vec![0.0, 50.0]);
    }

    #[test]
    fn overflow_clamps_to_last_lane() {
        let items = vec![item(540, 600), item(540, 600), item(540, 600)];
        let assigned = assign_lanes(&items, 2);
        let lanes: Vec<usize> = assigned.iter().map(|(_, l)| *l).collect();
        assert_eq!(lanes, vec![0, 1, 1]);
        assert_eq!(lanes_used(&assigned), 2);
    }

    #[test]
    fn peak_overlap_treats_spans_as_half_open() {
        assert_eq!(peak_overlap(&[]), 0);
        assert_eq!(peak_overlap(&[item(540, 600), item(600, 660)]), 1);
        assert_eq!(peak_overlap(&[item(540, 600), item(570, 630), item(590, 700)]), 3);
    }

    #[test]
    fn zero_max_lanes_still_places_items() {
        let assigned = assign_lanes(&[item(540, 600)], 0);
        assert_eq!(assigned[0].1, 0);
    }

    #[test]
    fn appointments_beside_events_use_right_share() {
        let event = item(540, 600);
        let beside = item(570, 630);
        let clear = item(660, 720);
        let placed = layout(&[beside, clear], &[event], 2);

        let e = placed.iter().find(|p| p.id == event.id).unwrap();
        assert!(e.is_event);
        assert_eq!((e.left_pct, e.width_pct), (0.0, 35.0));

        let b = placed.iter().find(|p| p.id == beside.id).unwrap();
        assert_eq!((b.left_pct, b.width_pct), (35.0, 65.0));

        let c = placed.iter().find(|p| p.id == clear.id).unwrap();
        assert_eq!((c.left_pct, c.width_pct), (0.0, 100.0));
    }

    #[test]
    fn overlapping_events_stack_in_their_share() {
        let events = vec![item(540, 600), item(560, 620)];
        let placed = layout(&[], &events, 2);
        let widths: Vec<f64> = placed.iter().map(|p| p.width_pct).collect();
        assert_eq!(widths, vec![17.5, 17.5]);
        assert_eq!(placed[1].left_pct, 17.5);
    }

    #[test]
    fn greedy_matches_optimal_on_varied_days() {
        let days = vec![
            vec![item(0, 30), item(0, 60), item(30, 90), item(60, 90), item(90, 120)],
            vec![item(540, 660), item(570, 600), item(600, 630), item(630, 690), item(660, 690)],
            vec![item(10, 20), item(15, 25), item(20, 30), item(25, 35), item(5, 40)],
        ];
        for items in days {
            let assigned = assign_lanes(&items, 10);
            assert_eq!(lanes_used(&assigned), peak_overlap(&items));
        }
    }
}
