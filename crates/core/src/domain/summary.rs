use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mover {
    pub symbol: String,
    pub name: String,
    pub change_percent: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub stock_count: usize,
    pub average_change_percent: f64,
    pub total_volume: u64,
    pub gainers: usize,
    pub losers: usize,
}

/// Market-wide statistics over one snapshot set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub date: NaiveDate,
    pub total: usize,
    pub gainers_count: usize,
    pub losers_count: usize,
    pub unchanged_count: usize,
    pub average_change_percent: f64,
    pub max_change_percent: f64,
    pub min_change_percent: f64,
    pub top_gainers: Vec<Mover>,
    pub top_losers: Vec<Mover>,
    pub top_volume: Vec<Mover>,
    pub exchange_breakdown: BTreeMap<String, GroupStats>,
    pub index_breakdown: BTreeMap<String, GroupStats>,
}
