use crate::analysis::round_to;
use crate::domain::market::Snapshot;
use crate::domain::summary::{GroupStats, MarketSummary, Mover};
use crate::ingest::universe::UniverseEntry;
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const TOP_MOVERS: usize = 5;

/// Symbol -> every index it belongs to.
pub type IndexMembership = BTreeMap<String, Vec<String>>;

pub fn index_membership(entries: &[UniverseEntry]) -> IndexMembership {
    let mut out: IndexMembership = BTreeMap::new();
    for e in entries {
        let indices = out.entry(e.symbol.clone()).or_default();
        if !indices.contains(&e.index_name) {
            indices.push(e.index_name.clone());
        }
    }
    out
}

/// Market-wide statistics. Pure; a zero move counts as neither gainer nor loser.
pub fn analyze(snapshots: &[Snapshot], membership: &IndexMembership, date: NaiveDate) -> MarketSummary {
    let total = snapshots.len();
    let gainers_count = snapshots.iter().filter(|s| s.change_percent > 0.0).count();
    let losers_count = snapshots.iter().filter(|s| s.change_percent < 0.0).count();

    let changes: Vec<f64> = snapshots.iter().map(|s| s.change_percent).collect();
    let (average, max, min) = if changes.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (
            changes.iter().sum::<f64>() / changes.len() as f64,
            changes.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            changes.iter().copied().fold(f64::INFINITY, f64::min),
        )
    };

    let mut by_change: Vec<&Snapshot> = snapshots.iter().collect();
    by_change.sort_by(|a, b| cmp_desc(a.change_percent, b.change_percent).then_with(|| a.symbol.cmp(&b.symbol)));

    let top_gainers = by_change
        .iter()
        .filter(|s| s.change_percent > 0.0)
        .take(TOP_MOVERS)
        .map(|s| mover(s))
        .collect();
    let top_losers = by_change
        .iter()
        .rev()
        .filter(|s| s.change_percent < 0.0)
        .take(TOP_MOVERS)
        .map(|s| mover(s))
        .collect();

    let mut by_volume: Vec<&Snapshot> = snapshots.iter().collect();
    by_volume.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.symbol.cmp(&b.symbol)));
    let top_volume = by_volume.iter().take(TOP_MOVERS).map(|s| mover(s)).collect();

    let exchange_breakdown = group_stats(snapshots.iter().map(|s| (s.exchange.clone(), s)));
    let index_breakdown = group_stats(snapshots.iter().flat_map(|s| {
        membership
            .get(&s.symbol)
            .into_iter()
            .flatten()
            .map(move |index| (index.clone(), s))
    }));

    MarketSummary {
        date,
        total,
        gainers_count,
        losers_count,
        unchanged_count: total - gainers_count - losers_count,
        average_change_percent: round_to(average, 2),
        max_change_percent: round_to(max, 2),
        min_change_percent: round_to(min, 2),
        top_gainers,
        top_losers,
        top_volume,
        exchange_breakdown,
        index_breakdown,
    }
}

fn mover(s: &Snapshot) -> Mover {
    Mover {
        symbol: s.symbol.clone(),
        name: s.name.clone(),
        change_percent: round_to(s.change_percent, 2),
        close: s.close,
        volume: s.volume,
    }
}

fn group_stats<'a>(
    items: impl Iterator<Item = (String, &'a Snapshot)>,
) -> BTreeMap<String, GroupStats> {
    let mut sums: BTreeMap<String, (f64, GroupStats)> = BTreeMap::new();
    for (key, s) in items {
        let (sum, stats) = sums.entry(key).or_insert_with(|| {
            (
                0.0,
                GroupStats {
                    stock_count: 0,
                    average_change_percent: 0.0,
                    total_volume: 0,
                    gainers: 0,
                    losers: 0,
                },
            )
        });
        *sum += s.change_percent;
        stats.stock_count += 1;
        stats.total_volume = stats.total_volume.saturating_add(s.volume);
        if s.change_percent > 0.0 {
            stats.gainers += 1;
        } else if s.change_percent < 0.0 {
            stats.losers += 1;
        }
    }
    sums.into_iter()
        .map(|(key, (sum, mut stats))| {
            stats.average_change_percent = round_to(sum / stats.stock_count as f64, 2);
            (key, stats)
        })
        .collect()
}

fn cmp_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::fixtures::snapshot;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 27).unwrap()
    }

    fn sample() -> Vec<Snapshot> {
        vec![
            snapshot("AAA", 4.0, 1_000_000),
            snapshot("BBB", -2.0, 5_000_000),
            snapshot("CCC", 0.0, 2_000_000),
            snapshot("DDD", 1.0, 3_000_000),
            snapshot("EEE", -6.0, 4_000_000),
        ]
    }

    #[test]
    fn counts_and_extremes() {
        let s = analyze(&sample(), &IndexMembership::new(), date());
        assert_eq!(s.total, 5);
        assert_eq!(s.gainers_count, 2);
        assert_eq!(s.losers_count, 2);
        assert_eq!(s.unchanged_count, 1);
        assert!(s.gainers_count + s.losers_count <= s.total);
        assert_eq!(s.max_change_percent, 4.0);
        assert_eq!(s.min_change_percent, -6.0);
        assert_eq!(s.average_change_percent, -0.6);
    }

    #[test]
    fn movers_exclude_flat_and_wrong_sign() {
        let s = analyze(&sample(), &IndexMembership::new(), date());
        let gainers: Vec<_> = s.top_gainers.iter().map(|m| m.symbol.as_str()).collect();
        let losers: Vec<_> = s.top_losers.iter().map(|m| m.symbol.as_str()).collect();
        assert_eq!(gainers, vec!["AAA", "DDD"]);
        assert_eq!(losers, vec!["EEE", "BBB"]);
        assert_eq!(s.top_volume[0].symbol, "BBB");
    }

    #[test]
    fn index_breakdown_counts_multi_membership() {
        let membership = index_membership(&[
            UniverseEntry { symbol: "AAA".into(), index_name: "S&P 500".into() },
            UniverseEntry { symbol: "AAA".into(), index_name: "NASDAQ-100".into() },
            UniverseEntry { symbol: "BBB".into(), index_name: "S&P 500".into() },
            UniverseEntry { symbol: "BBB".into(), index_name: "S&P 500".into() },
        ]);
        let s = analyze(&sample(), &membership, date());

        let sp = &s.index_breakdown["S&P 500"];
        assert_eq!(sp.stock_count, 2);
        assert_eq!(sp.average_change_percent, 1.0);
        assert_eq!(sp.gainers, 1);
        assert_eq!(sp.losers, 1);
        assert_eq!(s.index_breakdown["NASDAQ-100"].stock_count, 1);

        let ex = &s.exchange_breakdown["NASDAQ NMS - GLOBAL MARKET"];
        assert_eq!(ex.stock_count, 5);
        assert_eq!(ex.total_volume, 15_000_000);
    }

    #[test]
    fn empty_input_is_all_zero() {
        let s = analyze(&[], &IndexMembership::new(), date());
        assert_eq!(s.total, 0);
        assert!(s.top_gainers.is_empty());
        assert_eq!(s.average_change_percent, 0.0);
    }

    #[test]
    fn deterministic_for_shuffled_input() {
        let mut reversed = sample();
        reversed.reverse();
        assert_eq!(
            analyze(&sample(), &IndexMembership::new(), date()),
            analyze(&reversed, &IndexMembership::new(), date())
        );
    }
}
