//! Retention / pruning policy over snapshots.
//!
//! Selects which snapshots survive a keep-last/daily/weekly/monthly/
//! yearly policy. Snapshots always commit atomically, so there is no
//! "unfinished backup" case to handle - every snapshot in
//! `list_snapshots()` is complete by construction.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Local, TimeZone, Utc};

use crate::metadata_store::Snapshot;

/// Each `keep_*` bucket is independently optional; a snapshot survives
/// if any configured bucket selects it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneOptions {
    pub keep_last: Option<u64>,
    pub keep_daily: Option<u64>,
    pub keep_weekly: Option<u64>,
    pub keep_monthly: Option<u64>,
    pub keep_yearly: Option<u64>,
}

impl PruneOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keep_last(mut self, value: Option<u64>) -> Self {
        self.keep_last = value;
        self
    }

    pub fn keep_daily(mut self, value: Option<u64>) -> Self {
        self.keep_daily = value;
        self
    }

    pub fn keep_weekly(mut self, value: Option<u64>) -> Self {
        self.keep_weekly = value;
        self
    }

    pub fn keep_monthly(mut self, value: Option<u64>) -> Self {
        self.keep_monthly = value;
        self
    }

    pub fn keep_yearly(mut self, value: Option<u64>) -> Self {
        self.keep_yearly = value;
        self
    }
}

fn local_time(snapshot: &Snapshot) -> DateTime<Local> {
    Utc.timestamp_opt(snapshot.created_at, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
        .with_timezone(&Local)
}

fn mark_selections<F: Fn(DateTime<Local>, &Snapshot) -> String>(
    keep: &mut HashSet<i64>,
    list: &[Snapshot],
    limit: usize,
    select_id: F,
) {
    let mut already_included = HashSet::new();
    for snapshot in list {
        if keep.contains(&snapshot.id) {
            already_included.insert(select_id(local_time(snapshot), snapshot));
        }
    }

    let mut included = HashSet::new();
    for snapshot in list {
        if keep.contains(&snapshot.id) {
            continue;
        }
        let sel_id = select_id(local_time(snapshot), snapshot);
        if already_included.contains(&sel_id) {
            continue;
        }
        if included.contains(&sel_id) {
            continue;
        }
        if included.len() >= limit {
            break;
        }
        included.insert(sel_id);
        keep.insert(snapshot.id);
    }
}

/// Decide which snapshots survive a retention policy. `list` should
/// already be sorted newest-first (see `MetadataStore::list_snapshots`,
/// which returns oldest-first; reverse before calling). Returns
/// `(snapshot, keep)` pairs for every input snapshot.
pub fn compute_retention(mut list: Vec<Snapshot>, options: &PruneOptions) -> Vec<(Snapshot, bool)> {
    list.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut keep: HashMap<i64, ()> = HashMap::new();
    let mut keep_set = HashSet::new();

    if let Some(n) = options.keep_last {
        mark_selections(&mut keep_set, &list, n as usize, |_t, s| s.created_at.to_string());
    }
    if let Some(n) = options.keep_daily {
        mark_selections(&mut keep_set, &list, n as usize, |t, _s| {
            format!("{}-{}-{}", t.year(), t.month(), t.day())
        });
    }
    if let Some(n) = options.keep_weekly {
        mark_selections(&mut keep_set, &list, n as usize, |t, _s| {
            format!("{}-w{}", t.year(), t.iso_week().week())
        });
    }
    if let Some(n) = options.keep_monthly {
        mark_selections(&mut keep_set, &list, n as usize, |t, _s| format!("{}-{}", t.year(), t.month()));
    }
    if let Some(n) = options.keep_yearly {
        mark_selections(&mut keep_set, &list, n as usize, |t, _s| t.year().to_string());
    }

    for id in &keep_set {
        keep.insert(*id, ());
    }

    list.into_iter().map(|s| { let k = keep.contains_key(&s.id); (s, k) }).collect()
}
