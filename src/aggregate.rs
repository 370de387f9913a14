//! Aggregator: exact metrics and keywords for every node of the hierarchy.
//!
//! Everything here is computed from the raw ticket fields. Labels are
//! attached later by [`crate::label`] and never touch these numbers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rayon::prelude::*;

use crate::algo::tfidf::Corpus;
use crate::algo::tokenizer::tokenize;
use crate::hierarchy::{Group, Hierarchy, LeafGroup};
use crate::model::{
    ClusterNode, Concentration, ConcentrationKind, Count, LabelStatus, Members, Metrics,
    MonthCount, NormalizedText, Ticket, Trend, TrendKind, WeekdayCount,
};

/// Keywords kept per node.
pub const KEYWORDS_PER_NODE: usize = 15;

const TREND_THRESHOLD_PCT: f64 = 30.0;
const CONCENTRATED_BELOW: f64 = 0.2;
const CONCENTRATED_MIN_VOLUME: usize = 5;
const WIDESPREAD_ABOVE: f64 = 0.9;
const MISSING: &str = "N/A";

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Exact metrics of a ticket set.
pub fn compute_metrics(tickets: &[&Ticket]) -> Metrics {
    let dates: Vec<NaiveDate> = tickets.iter().map(|t| t.opened_at.date_naive()).collect();
    let requesters: BTreeSet<&str> = tickets.iter().map(|t| t.requester.as_str()).collect();

    Metrics {
        volume: tickets.len(),
        by_service: breakdown(tickets.iter().map(|t| t.service.as_str())),
        by_subarea: breakdown(
            tickets
                .iter()
                .map(|t| t.subarea.as_deref().unwrap_or(MISSING)),
        ),
        by_requester: breakdown(tickets.iter().map(|t| t.requester.as_str())),
        by_status: breakdown(tickets.iter().map(|t| t.status.as_str())),
        timeline: monthly(&dates),
        weekdays: weekdays(&dates),
        trend: trend(&dates),
        concentration: concentration(requesters.len(), tickets.len()),
    }
}

/// Metrics of an empty ticket set.
pub fn empty_metrics() -> Metrics {
    compute_metrics(&[])
}

/// Counts per key, largest first, ties by key.
fn breakdown<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<Count> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for key in keys {
        *counts.entry(key).or_insert(0) += 1;
    }
    let mut out: Vec<Count> = counts
        .into_iter()
        .map(|(key, count)| Count {
            key: key.to_string(),
            count,
        })
        .collect();
    // stable sort keeps key order within equal counts
    out.sort_by(|a, b| b.count.cmp(&a.count));
    out
}

/// One bucket per calendar month from the first to the last ticket, gaps included.
fn monthly(dates: &[NaiveDate]) -> Vec<MonthCount> {
    let mut counts: BTreeMap<(i32, u32), usize> = BTreeMap::new();
    for d in dates {
        *counts.entry((d.year(), d.month())).or_insert(0) += 1;
    }
    let (Some(&first), Some(&last)) = (counts.keys().next(), counts.keys().next_back()) else {
        return vec![];
    };

    let mut out = Vec::new();
    let (mut year, mut month) = first;
    while (year, month) <= last {
        out.push(MonthCount {
            month: format!("{year:04}-{month:02}"),
            count: counts.get(&(year, month)).copied().unwrap_or(0),
        });
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    out
}

/// Counts for every day of the week, Monday first.
fn weekdays(dates: &[NaiveDate]) -> Vec<WeekdayCount> {
    let mut counts = [0usize; 7];
    for d in dates {
        counts[d.weekday().num_days_from_monday() as usize] += 1;
    }
    WEEKDAYS
        .iter()
        .zip(counts)
        .map(|(day, count)| WeekdayCount {
            day: day.to_string(),
            count,
        })
        .collect()
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Last week with tickets against the calendar week before it. A set that
/// spans a single week is stable.
fn trend(dates: &[NaiveDate]) -> Trend {
    let weeks: BTreeSet<NaiveDate> = dates.iter().map(|d| week_start(*d)).collect();
    let (Some(&first), Some(&last)) = (weeks.first(), weeks.last()) else {
        return Trend {
            kind: TrendKind::Stable,
            change_pct: 0.0,
            last_week: 0,
            previous_week: 0,
        };
    };
    let previous = last - Duration::days(7);
    let in_week = |w: NaiveDate| dates.iter().filter(|d| week_start(**d) == w).count();
    let last_week = in_week(last);
    let previous_week = in_week(previous);

    if first == last {
        return Trend {
            kind: TrendKind::Stable,
            change_pct: 0.0,
            last_week,
            previous_week,
        };
    }

    let change_pct = if previous_week == 0 {
        100.0
    } else {
        (last_week as f64 - previous_week as f64) / previous_week as f64 * 100.0
    };
    let kind = if change_pct > TREND_THRESHOLD_PCT {
        TrendKind::Rising
    } else if change_pct < -TREND_THRESHOLD_PCT {
        TrendKind::Falling
    } else {
        TrendKind::Stable
    };
    Trend {
        kind,
        change_pct,
        last_week,
        previous_week,
    }
}

fn concentration(unique_requesters: usize, volume: usize) -> Concentration {
    let ratio = if volume == 0 {
        0.0
    } else {
        unique_requesters as f64 / volume as f64
    };
    let kind = if volume == 0 {
        ConcentrationKind::Normal
    } else if ratio < CONCENTRATED_BELOW && volume > CONCENTRATED_MIN_VOLUME {
        ConcentrationKind::Concentrated
    } else if ratio > WIDESPREAD_ABOVE {
        ConcentrationKind::Widespread
    } else {
        ConcentrationKind::Normal
    };
    Concentration {
        kind,
        ratio,
        unique_requesters,
    }
}

/// Turns a membership [`Hierarchy`] into unlabeled [`ClusterNode`]s.
pub struct Aggregator<'a> {
    tickets: HashMap<&'a str, &'a Ticket>,
    tokens: HashMap<&'a str, Vec<String>>,
    corpus: Corpus,
    leaf_docs: HashMap<String, usize>,
}

impl<'a> Aggregator<'a> {
    /// Index tickets and build the keyword corpus, one document per
    /// non-noise leaf.
    pub fn new(hierarchy: &Hierarchy, tickets: &'a [Ticket], texts: &'a [NormalizedText]) -> Self {
        let tokens: HashMap<&str, Vec<String>> = texts
            .par_iter()
            .filter(|t| !t.empty)
            .map(|t| (t.ticket_id.as_str(), tokenize(&t.text)))
            .collect();

        let mut corpus = Corpus::new();
        let mut leaf_docs = HashMap::new();
        for group in &hierarchy.groups {
            let leaves: Vec<&LeafGroup> = match group {
                Group::Leaf(leaf) => vec![leaf],
                Group::Parent { children, .. } => children.iter().collect(),
            };
            for leaf in leaves {
                let doc = leaf_tokens(&tokens, leaf.ticket_ids.iter().map(String::as_str));
                leaf_docs.insert(leaf.id.clone(), corpus.add_document(&doc));
            }
        }

        Self {
            tickets: tickets.iter().map(|t| (t.id.as_str(), t)).collect(),
            tokens,
            corpus,
            leaf_docs,
        }
    }

    /// Nodes in hierarchy order, noise last. Labels are left pending.
    pub fn build(&self, hierarchy: &Hierarchy) -> Vec<ClusterNode> {
        hierarchy
            .top_level()
            .map(|group| match group {
                Group::Leaf(leaf) => self.leaf_node(&leaf),
                Group::Parent { id, children } => {
                    let children: Vec<ClusterNode> =
                        children.iter().map(|c| self.leaf_node(c)).collect();
                    let owned: Vec<String> = children
                        .iter()
                        .flat_map(|c| c.ticket_ids())
                        .map(String::from)
                        .collect();
                    let ids: Vec<&str> = owned.iter().map(String::as_str).collect();
                    let tokens = leaf_tokens(&self.tokens, ids.iter().copied());
                    let keywords = self.corpus.top_terms_for(&tokens, KEYWORDS_PER_NODE);
                    self.node(id, &ids, keywords, Members::Parent { children })
                }
            })
            .collect()
    }

    fn leaf_node(&self, leaf: &LeafGroup) -> ClusterNode {
        let ids: Vec<&str> = leaf.ticket_ids.iter().map(String::as_str).collect();
        let keywords = match self.leaf_docs.get(&leaf.id) {
            Some(&doc) => self.corpus.top_terms(doc, KEYWORDS_PER_NODE),
            None => {
                let tokens = leaf_tokens(&self.tokens, ids.iter().copied());
                self.corpus.top_terms_for(&tokens, KEYWORDS_PER_NODE)
            }
        };
        self.node(
            leaf.id.clone(),
            &ids,
            keywords,
            Members::Leaf {
                ticket_ids: leaf.ticket_ids.clone(),
            },
        )
    }

    fn node(
        &self,
        id: String,
        ids: &[&str],
        keywords: Vec<(String, f64)>,
        members: Members,
    ) -> ClusterNode {
        let tickets: Vec<&Ticket> = ids
            .iter()
            .filter_map(|id| self.tickets.get(id).copied())
            .collect();
        ClusterNode {
            title: id.clone(),
            id,
            description: String::new(),
            tags: Vec::new(),
            keywords: keywords.into_iter().map(|(term, _)| term).collect(),
            label_status: LabelStatus::Pending,
            label_error: None,
            metrics: compute_metrics(&tickets),
            members,
        }
    }
}

fn leaf_tokens<'a>(
    tokens: &HashMap<&str, Vec<String>>,
    ids: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    ids.filter_map(|id| tokens.get(id))
        .flat_map(|t| t.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use chrono::{TimeZone, Utc};

    fn ticket(id: &str, service: &str, requester: &str, y: i32, m: u32, d: u32) -> Ticket {
        Ticket {
            id: id.into(),
            system: "ERP".into(),
            requester: requester.into(),
            requester_email: None,
            service: service.into(),
            subarea: None,
            status: "open".into(),
            opened_at: Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap(),
            title: format!("{service} problem"),
            description: "details".into(),
        }
    }

    #[test]
    fn breakdown_sorted_by_count_then_key() {
        let b = breakdown(["b", "a", "c", "c", "b"].into_iter());
        let keys: Vec<(&str, usize)> = b.iter().map(|c| (c.key.as_str(), c.count)).collect();
        assert_eq!(keys, vec![("b", 2), ("c", 2), ("a", 1)]);
    }

    #[test]
    fn timeline_fills_month_gaps() {
        let tickets = [
            ticket("1", "a", "x", 2023, 11, 3),
            ticket("2", "a", "x", 2024, 1, 9),
            ticket("3", "a", "x", 2024, 1, 10),
        ];
        let refs: Vec<&Ticket> = tickets.iter().collect();
        let m = compute_metrics(&refs);
        let months: Vec<(&str, usize)> = m.timeline.iter().map(|c| (c.month.as_str(), c.count)).collect();
        assert_eq!(months, vec![("2023-11", 1), ("2023-12", 0), ("2024-01", 2)]);
    }

    #[test]
    fn weekdays_start_monday() {
        // 2024-05-06 is a Monday, 2024-05-12 a Sunday
        let tickets = [
            ticket("1", "a", "x", 2024, 5, 6),
            ticket("2", "a", "x", 2024, 5, 12),
            ticket("3", "a", "x", 2024, 5, 12),
        ];
        let refs: Vec<&Ticket> = tickets.iter().collect();
        let w = compute_metrics(&refs).weekdays;
        assert_eq!(w.len(), 7);
        assert_eq!((w[0].day.as_str(), w[0].count), ("Mon", 1));
        assert_eq!((w[6].day.as_str(), w[6].count), ("Sun", 2));
        assert_eq!(w[3].count, 0);
    }

    #[test]
    fn trend_compares_last_two_weeks() {
        let rising = [
            date(2024, 5, 6),
            date(2024, 5, 13),
            date(2024, 5, 14),
        ];
        let t = trend(&rising);
        assert_eq!(t.kind, TrendKind::Rising);
        assert_eq!((t.last_week, t.previous_week), (2, 1));
        assert!((t.change_pct - 100.0).abs() < 1e-9);

        let falling = [date(2024, 5, 6), date(2024, 5, 7), date(2024, 5, 13)];
        assert_eq!(trend(&falling).kind, TrendKind::Falling);

        let single_week = [date(2024, 5, 6), date(2024, 5, 8)];
        assert_eq!(trend(&single_week).kind, TrendKind::Stable);

        // a gap week counts as zero
        let gap = [date(2024, 4, 1), date(2024, 5, 13)];
        let t = trend(&gap);
        assert_eq!((t.kind, t.previous_week), (TrendKind::Rising, 0));
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn concentration_kinds() {
        assert_eq!(concentration(1, 10).kind, ConcentrationKind::Concentrated);
        assert_eq!(concentration(1, 4).kind, ConcentrationKind::Normal);
        assert_eq!(concentration(10, 10).kind, ConcentrationKind::Widespread);
        assert_eq!(concentration(5, 10).kind, ConcentrationKind::Normal);
        assert_eq!(concentration(0, 0).kind, ConcentrationKind::Normal);
    }

    #[test]
    fn empty_metrics_are_zero() {
        let m = empty_metrics();
        assert_eq!(m.volume, 0);
        assert!(m.timeline.is_empty());
        assert_eq!(m.weekdays.iter().map(|w| w.count).sum::<usize>(), 0);
    }

    #[test]
    fn parent_metrics_union_children() {
        let tickets = vec![
            ticket("1", "db", "ana", 2024, 5, 6),
            ticket("2", "db", "bob", 2024, 5, 7),
            ticket("3", "query", "ana", 2024, 5, 8),
            ticket("4", "printer", "eve", 2024, 5, 8),
        ];
        let texts = Normalizer::default().normalize_batch(&tickets);
        let hierarchy = Hierarchy {
            groups: vec![Group::Parent {
                id: "macro-0".into(),
                children: vec![
                    LeafGroup {
                        id: "micro-0".into(),
                        ticket_ids: vec!["1".into(), "2".into()],
                    },
                    LeafGroup {
                        id: "micro-1".into(),
                        ticket_ids: vec!["3".into()],
                    },
                ],
            }],
            noise: Some(LeafGroup {
                id: "noise".into(),
                ticket_ids: vec!["4".into()],
            }),
        };
        let nodes = Aggregator::new(&hierarchy, &tickets, &texts).build(&hierarchy);
        assert_eq!(nodes.len(), 2);
        let parent = &nodes[0];
        assert_eq!(parent.metrics.volume, 3);
        assert_eq!(
            parent.children().iter().map(|c| c.metrics.volume).sum::<usize>(),
            3
        );
        assert_eq!(parent.metrics.by_service[0].key, "db");
        assert_eq!(parent.metrics.by_requester[0].count, 2);
        assert!(parent.keywords.contains(&"query".to_string()));
        assert_eq!(parent.label_status, LabelStatus::Pending);
        assert!(nodes[1].is_noise());
        assert_eq!(nodes[1].metrics.volume, 1);
    }
}
