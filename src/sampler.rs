//! Adaptive sampling of noisy log lines.
//!
//! Lines matching a sample key are thinned so that every key converges on an
//! equal share of `total / target_ratio` output lines, no matter how chatty
//! its source is. Lines matching no key always pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use regex::Regex;

use crate::metrics::Metrics;

/// A class of log lines sharing one sampling ratio.
///
/// `label` may refer to capture groups of `pattern` as `\1` to `\9`, so one
/// key can fan out into several (`rc:(\d{3})` with label `http_\1` yields
/// `http_200`, `http_404`, ...). A group that did not participate expands to
/// nothing, and `\\1` is left alone.
///
/// Every distinct expanded label keeps a counter and a `sample_ratio` gauge
/// for the life of the process, and each sampled line recomputes the ratio
/// of every label seen so far. Capture groups should therefore match a
/// small closed set (status codes, levels), never IDs or free text.
#[derive(Debug, Clone)]
pub struct SampleKey {
    pattern: Regex,
    label: String,
}

impl SampleKey {
    pub fn new(pattern: &str, label: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            label: label.into(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn matching_label(&self, message: &str) -> Option<String> {
        let captures = self.pattern.captures(message)?;
        let mut out = String::with_capacity(self.label.len());
        let mut chars = self.label.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some('\\') => {
                    chars.next();
                    out.push_str("\\\\");
                }
                Some(d @ '1'..='9') => {
                    chars.next();
                    let group = d as usize - '0' as usize;
                    if let Some(m) = captures.get(group) {
                        out.push_str(m.as_str());
                    }
                }
                _ => out.push('\\'),
            }
        }
        Some(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleMetadata {
    pub sample_key: String,
    pub sample_ratio: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// No key matched.
    Unsampled,
    Accepted(SampleMetadata),
    Dropped,
}

impl Sample {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct KeyCounts {
    sent: u64,
    dropped: u64,
}

#[derive(Debug, Default)]
struct State {
    counts: HashMap<String, KeyCounts>,
    ratios: HashMap<String, f64>,
}

pub struct Sampler {
    keys: Vec<SampleKey>,
    target_ratio: f64,
    metrics: Arc<Metrics>,
    state: Mutex<State>,
    draw: fn() -> f64,
}

impl Sampler {
    /// Builds a sampler whose keys are tried in a random order, fixed for
    /// the lifetime of the sampler. When a line matches several keys, which
    /// one claims it is deliberately unspecified: keys are meant to describe
    /// disjoint classes of lines.
    pub fn new(mut keys: Vec<SampleKey>, target_ratio: f64, metrics: Arc<Metrics>) -> Self {
        keys.shuffle(&mut rand::thread_rng());
        Self::in_order(keys, target_ratio, metrics)
    }

    /// Like [`Sampler::new`], but keys are tried in the order given.
    pub fn in_order(keys: Vec<SampleKey>, target_ratio: f64, metrics: Arc<Metrics>) -> Self {
        Self {
            keys,
            target_ratio,
            metrics,
            state: Mutex::new(State::default()),
            draw: rand::random::<f64>,
        }
    }

    pub fn sample(&self, message: &str) -> Sample {
        let Some(key) = self.keys.iter().find_map(|k| k.matching_label(message)) else {
            self.metrics.unsampled_entries.inc();
            return Sample::Unsampled;
        };

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let ratio = state.ratios.get(&key).copied().unwrap_or(1.0);
        let accepted = ratio <= 1.0 || (self.draw)() * ratio < 1.0;
        let counts = state.counts.entry(key.clone()).or_default();

        if !accepted {
            counts.dropped += 1;
            self.metrics
                .sampled_entries_dropped
                .with_label_values(&[key.as_str()])
                .inc();
            return Sample::Dropped;
        }

        counts.sent += 1;
        self.metrics
            .sampled_entries_sent
            .with_label_values(&[key.as_str()])
            .inc();

        let totals: HashMap<&str, u64> = state
            .counts
            .iter()
            .map(|(k, c)| (k.as_str(), c.sent + c.dropped))
            .collect();
        let ratios = calculate_ratios(&totals, self.target_ratio);
        for (k, r) in &ratios {
            self.metrics
                .sample_ratio
                .with_label_values(&[k.as_str()])
                .set(*r);
        }
        state.ratios = ratios;

        Sample::Accepted(SampleMetadata {
            sample_key: key,
            sample_ratio: ratio.max(1.0),
        })
    }
}

/// New per-key ratios from the total (sent + dropped) lines seen per key.
/// Keys without any activity are left out, and no ratio is ever below 1.
fn calculate_ratios(totals: &HashMap<&str, u64>, target_ratio: f64) -> HashMap<String, f64> {
    let active: Vec<(&str, u64)> = totals
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(k, n)| (*k, *n))
        .collect();
    if active.is_empty() {
        return HashMap::new();
    }

    let total: u64 = active.iter().map(|(_, n)| n).sum();
    let nominal_total = total as f64 / target_ratio;
    let nominal_per_key = nominal_total / active.len() as f64;

    active
        .into_iter()
        .map(|(k, n)| {
            let ratio = n as f64 / nominal_per_key;
            let ratio = if ratio.is_finite() { ratio.max(1.0) } else { 1.0 };
            (k.to_string(), ratio)
        })
        .collect()
}
