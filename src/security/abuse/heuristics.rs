//! Detection strategies.
//!
//! The detector runs these in order and stops at the first positive, so the
//! order of [`default_cascade`] is the precedence of the signals: burst is
//! checked before volume because it is the more precise of the two.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;

use serde::Serialize;

use crate::clock::{elapsed_secs, MILLIS_PER_SEC};
use crate::config::AbuseConfig;
use crate::security::abuse::similarity::similarity;

/// One request as seen by the classifier.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub timestamp: u64,
    pub message: String,
    pub source_ip: String,
}

/// Named anomaly patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbusePattern {
    Burst,
    Volume,
    Repetitive,
    BotTiming,
    SuspiciousContent,
}

impl AbusePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbusePattern::Burst => "burst",
            AbusePattern::Volume => "volume",
            AbusePattern::Repetitive => "repetitive",
            AbusePattern::BotTiming => "bot_timing",
            AbusePattern::SuspiciousContent => "suspicious_content",
        }
    }
}

/// A positive result from one heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub pattern: AbusePattern,
    pub confidence: f64,
    pub details: String,
}

/// A single detection strategy over an identity's history.
///
/// `history` is ordered oldest first and already contains the current request.
pub trait Heuristic: Send + Sync + Debug {
    fn evaluate(&self, history: &VecDeque<RequestRecord>, now: u64) -> Option<Detection>;
}

fn count_within(history: &VecDeque<RequestRecord>, now: u64, window_millis: u64) -> usize {
    history
        .iter()
        .rev()
        .take_while(|r| now.saturating_sub(r.timestamp) < window_millis)
        .count()
}

/// Too many requests in a short window.
#[derive(Debug, Clone)]
pub struct BurstHeuristic {
    pub threshold: usize,
    pub window_secs: u64,
}

impl Heuristic for BurstHeuristic {
    fn evaluate(&self, history: &VecDeque<RequestRecord>, now: u64) -> Option<Detection> {
        let count = count_within(history, now, self.window_secs * MILLIS_PER_SEC);
        (count >= self.threshold).then(|| Detection {
            pattern: AbusePattern::Burst,
            confidence: (count as f64 / self.threshold as f64).min(1.0),
            details: format!("{} requests in {}s", count, self.window_secs),
        })
    }
}

/// Too many requests in a longer window.
#[derive(Debug, Clone)]
pub struct VolumeHeuristic {
    pub threshold: usize,
    pub window_secs: u64,
}

impl Heuristic for VolumeHeuristic {
    fn evaluate(&self, history: &VecDeque<RequestRecord>, now: u64) -> Option<Detection> {
        let count = count_within(history, now, self.window_secs * MILLIS_PER_SEC);
        (count >= self.threshold).then(|| Detection {
            pattern: AbusePattern::Volume,
            confidence: (count as f64 / self.threshold as f64).min(1.0),
            details: format!("{} requests in {}s", count, self.window_secs),
        })
    }
}

/// The same or nearly the same message sent over and over.
#[derive(Debug, Clone)]
pub struct RepetitionHeuristic {
    pub window: usize,
    pub threshold: usize,
    pub similarity_threshold: f64,
}

impl Heuristic for RepetitionHeuristic {
    fn evaluate(&self, history: &VecDeque<RequestRecord>, _now: u64) -> Option<Detection> {
        let recent: Vec<&str> = history
            .iter()
            .rev()
            .take(self.window)
            .map(|r| r.message.as_str())
            .filter(|m| !m.trim().is_empty())
            .collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for message in &recent {
            *counts.entry(*message).or_insert(0) += 1;
        }
        let max_duplicates = counts.values().copied().max().unwrap_or(0);
        if max_duplicates >= self.threshold {
            return Some(Detection {
                pattern: AbusePattern::Repetitive,
                confidence: 1.0,
                details: format!("{} identical messages in last {}", max_duplicates, recent.len()),
            });
        }

        let mut similar_pairs = 0;
        for (i, a) in recent.iter().enumerate() {
            for b in &recent[i + 1..] {
                if similarity(a, b) >= self.similarity_threshold {
                    similar_pairs += 1;
                }
            }
        }
        (similar_pairs >= self.threshold).then(|| Detection {
            pattern: AbusePattern::Repetitive,
            confidence: 0.8,
            details: format!("{} similar message pairs in last {}", similar_pairs, recent.len()),
        })
    }
}

/// Scripted timing: metronomic intervals or impossible typing speed.
#[derive(Debug, Clone)]
pub struct BotTimingHeuristic {
    pub min_samples: usize,
    pub variance_samples: usize,
    pub variance_threshold: f64,
    pub max_chars_per_sec: f64,
}

impl Heuristic for BotTimingHeuristic {
    fn evaluate(&self, history: &VecDeque<RequestRecord>, _now: u64) -> Option<Detection> {
        if history.len() < self.min_samples {
            return None;
        }

        let skip = history.len().saturating_sub(self.variance_samples + 1);
        let recent: Vec<&RequestRecord> = history.iter().skip(skip).collect();
        let intervals: Vec<f64> = recent
            .windows(2)
            .map(|pair| elapsed_secs(pair[0].timestamp, pair[1].timestamp))
            .collect();

        if intervals.len() >= self.variance_samples {
            let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
            let variance = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                / intervals.len() as f64;
            if variance < self.variance_threshold {
                return Some(Detection {
                    pattern: AbusePattern::BotTiming,
                    confidence: 0.9,
                    details: format!(
                        "interval variance {:.3}s² over {} samples",
                        variance,
                        intervals.len()
                    ),
                });
            }
        }

        // Zero intervals carry no typing-speed information.
        recent
            .windows(2)
            .zip(&intervals)
            .filter(|(_, interval)| **interval > 0.0)
            .map(|(pair, interval)| pair[1].message.chars().count() as f64 / interval)
            .find(|speed| *speed > self.max_chars_per_sec)
            .map(|speed| Detection {
                pattern: AbusePattern::BotTiming,
                confidence: 0.85,
                details: format!("typing speed {:.1} chars/s", speed),
            })
    }
}

/// The built-in cascade, in precedence order.
pub fn default_cascade(config: &AbuseConfig) -> Vec<Box<dyn Heuristic>> {
    vec![
        Box::new(BurstHeuristic {
            threshold: config.burst_threshold,
            window_secs: config.burst_window_secs,
        }),
        Box::new(VolumeHeuristic {
            threshold: config.volume_threshold,
            window_secs: config.volume_window_secs,
        }),
        Box::new(RepetitionHeuristic {
            window: config.repetition_window,
            threshold: config.repetition_threshold,
            similarity_threshold: config.similarity_threshold,
        }),
        Box::new(BotTimingHeuristic {
            min_samples: config.bot_min_samples,
            variance_samples: config.bot_variance_samples,
            variance_threshold: config.bot_variance_threshold,
            max_chars_per_sec: config.max_chars_per_sec,
        }),
    ]
}
