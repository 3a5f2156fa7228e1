//! Merge rules for combining staged ACH files into bank-ready output files.
//!
//! Merging is a pure function of its ordered inputs: callers that want
//! reproducible output (the transfer store does) must pass files in a stable
//! order. The rules:
//!
//! 1. Files are grouped by `(immediate destination, immediate origin)`; each
//!    group produces its own output file(s) whose header is taken from the
//!    group's first file.
//! 2. With [`MergeOptions::flatten_batches`], a batch whose header matches an
//!    existing output batch (ignoring batch numbers) is folded into it and
//!    entries repeating a trace number already present are dropped.
//! 3. When adding a batch would exceed [`MergeOptions::max_lines`] or
//!    [`MergeOptions::max_amount_cents`], a new output file is started. A single
//!    batch that is larger than the limits on its own is still emitted.
//! 4. Every output file has its entries ordered by trace number and its batches
//!    renumbered ascending from 1.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ach::{AchFile, Batch};

/// Options controlling how files are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeOptions {
    /// Fold batches with identical headers together.
    #[serde(default)]
    pub flatten_batches: bool,
    /// Maximum fixed-width records per output file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<usize>,
    /// Maximum total amount (debits plus credits, in cents) per output file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount_cents: Option<u64>,
}

/// Merges `files` into as few output files as the options allow.
///
/// Empty inputs and inputs without entries produce no output.
#[must_use]
pub fn merge_files(files: Vec<AchFile>, options: &MergeOptions) -> Vec<AchFile> {
    let mut groups: BTreeMap<(String, String), Vec<AchFile>> = BTreeMap::new();
    for file in files {
        if file.is_empty() {
            continue;
        }
        let key = (
            file.header.immediate_destination.clone(),
            file.header.immediate_origin.clone(),
        );
        groups.entry(key).or_default().push(file);
    }

    let mut outputs = Vec::new();
    for (_, group) in groups {
        outputs.extend(merge_group(group, options));
    }
    outputs.into_iter().map(finalize).collect()
}

fn merge_group(group: Vec<AchFile>, options: &MergeOptions) -> Vec<AchFile> {
    let mut iter = group.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let header = first.header.clone();
    let mut done = Vec::new();
    let mut current = AchFile {
        header: header.clone(),
        batches: Vec::new(),
    };

    for file in std::iter::once(first).chain(iter) {
        for batch in file.batches {
            if batch.entries.is_empty() {
                continue;
            }
            if options.flatten_batches && fold_into_existing(&mut current, &batch, options) {
                continue;
            }
            if !current.batches.is_empty() && exceeds_limits(&current, &batch, options) {
                done.push(std::mem::replace(
                    &mut current,
                    AchFile {
                        header: header.clone(),
                        batches: Vec::new(),
                    },
                ));
            }
            current.batches.push(batch);
        }
    }

    if !current.batches.is_empty() {
        done.push(current);
    }
    done
}

/// Tries to fold `batch` into a matching batch of `file`. Returns false when no
/// batch matches or when folding would break the file's limits.
fn fold_into_existing(file: &mut AchFile, batch: &Batch, options: &MergeOptions) -> bool {
    let Some(index) = file
        .batches
        .iter()
        .position(|existing| existing.header.same_batch_as(&batch.header))
    else {
        return false;
    };

    let seen: HashSet<&str> = file.batches[index]
        .entries
        .iter()
        .map(|e| e.trace_number.as_str())
        .collect();
    let fresh: Vec<_> = batch
        .entries
        .iter()
        .filter(|e| !seen.contains(e.trace_number.as_str()))
        .cloned()
        .collect();

    let added_lines = fresh.len();
    let added_amount = fresh
        .iter()
        .fold(0_u64, |total, e| total.saturating_add(e.amount));
    if options
        .max_lines
        .is_some_and(|max| file.line_count() + added_lines > max)
        || options
            .max_amount_cents
            .is_some_and(|max| file.total_amount().saturating_add(added_amount) > max)
    {
        return false;
    }

    file.batches[index].entries.extend(fresh);
    true
}

fn exceeds_limits(file: &AchFile, batch: &Batch, options: &MergeOptions) -> bool {
    options
        .max_lines
        .is_some_and(|max| file.line_count() + batch.line_count() > max)
        || options
            .max_amount_cents
            .is_some_and(|max| file.total_amount().saturating_add(batch.total_amount()) > max)
}

fn finalize(mut file: AchFile) -> AchFile {
    for (number, batch) in (1_u32..).zip(file.batches.iter_mut()) {
        batch.header.batch_number = number;
        batch
            .entries
            .sort_by(|a, b| a.trace_number.cmp(&b.trace_number));
    }
    file
}
