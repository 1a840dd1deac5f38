//! Offline complexity scoring for step content.
//!
//! A step that bundles several units of work tends to betray itself in its
//! wording: joined clauses, hedging, research language, long enumerations.
//! [`inspect_step`] collects those signals into [`Indicators`], and the
//! heuristic generator turns them into a per-agent [`ComplexityAssessment`]
//! that later gets reconciled with the other agent's opinion.
//!
//! ```
//! use duet::models::complexity::inspect_step;
//!
//! let found = inspect_step(
//!     "Wire up payments and rebuild the catalog",
//!     Some("Possibly research several providers first"),
//! );
//! assert!(found.normalized() > 0.3);
//! ```

use serde::{Deserialize, Serialize};

use crate::models::{Agent, ComplexityLevel};

/// Title length past which a step name reads like a task name.
pub const TITLE_LIMIT: usize = 80;
/// Content length past which a step probably covers more than one concern.
pub const CONTENT_LIMIT: usize = 600;
/// Content length past which a step is almost certainly a task.
pub const CONTENT_HARD_LIMIT: usize = 1500;
/// Points at which [`Indicators::normalized`] reaches 1.0.
pub const FULL_SCALE: u8 = 10;

/// A family of phrases that each count toward one indicator.
struct PhraseRule {
    points: u8,
    label: &'static str,
    phrases: &'static [&'static str],
}

/// Rules matched against the step title only.
const TITLE_RULES: &[PhraseRule] = &[PhraseRule {
    points: 2,
    label: "joined clauses in title",
    phrases: &[" and ", " plus ", " also ", " & ", " as well as ", " then "],
}];

/// Rules matched against title and content together.
const TEXT_RULES: &[PhraseRule] = &[
    PhraseRule {
        points: 2,
        label: "hedging",
        phrases: &["maybe", "might", "perhaps", "possibly", "probably", "not sure"],
    },
    PhraseRule {
        points: 2,
        label: "open research",
        phrases: &[
            "investigate",
            "research",
            "explore",
            "spike",
            "figure out",
            "look into",
            "evaluate options",
            "prototype",
            "experiment",
        ],
    },
    PhraseRule {
        points: 1,
        label: "unbounded scope",
        phrases: &["several", "various", "numerous", "everything", "all the", "a bunch of"],
    },
];

/// Rules matched against content only.
const CONTENT_RULES: &[PhraseRule] = &[PhraseRule {
    points: 1,
    label: "trailing enumeration",
    phrases: &["etc.", "and so on", "and more", "..."],
}];

/// Verbs that each name a separate piece of work when they share a title.
const WORK_VERBS: &[&str] = &[
    "add", "build", "create", "configure", "delete", "deploy", "design", "fix", "implement",
    "integrate", "migrate", "refactor", "remove", "rewrite", "test", "update", "write",
];

/// Signals found in a step, with the points they carry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Indicators {
    pub points: u8,
    pub reasons: Vec<String>,
}

impl Indicators {
    /// Record one signal.
    pub fn add(&mut self, points: u8, reason: impl Into<String>) {
        self.points = self.points.saturating_add(points);
        self.reasons.push(reason.into());
    }

    /// Points mapped onto [0,1].
    pub fn normalized(&self) -> f64 {
        (f64::from(self.points) / f64::from(FULL_SCALE)).min(1.0)
    }

    pub fn summary(&self) -> String {
        if self.reasons.is_empty() {
            return "no complexity signals".to_string();
        }
        format!("{} point(s): {}", self.points, self.reasons.join("; "))
    }

    fn apply(&mut self, rules: &[PhraseRule], haystack: &str) {
        for rule in rules {
            let hits: Vec<&str> = rule
                .phrases
                .iter()
                .copied()
                .filter(|phrase| haystack.contains(phrase))
                .collect();
            if !hits.is_empty() {
                self.add(rule.points, format!("{} ({})", rule.label, hits.join(", ")));
            }
        }
    }
}

/// One agent's independent opinion on a step's complexity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    pub agent: Agent,
    pub level: ComplexityLevel,
    /// In [0,1]
    pub score: f64,
    pub should_promote: bool,
    /// In [0,1]
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl ComplexityAssessment {
    /// Turn collected signals into an opinion against a project threshold.
    pub fn from_score(agent: Agent, found: &Indicators, threshold: f64) -> Self {
        let score = found.normalized();
        // Each independent signal firms up the opinion, capped below certainty.
        let confidence = (0.5 + 0.1 * found.reasons.len() as f64).min(0.95);
        Self {
            agent,
            level: ComplexityLevel::from_score(score),
            score,
            should_promote: score > threshold,
            confidence,
            reasons: found.reasons.clone(),
        }
    }

    /// Reject out-of-range numbers coming back from a generator.
    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.score) || !(0.0..=1.0).contains(&self.confidence) {
            return Err(crate::Error::Validation(format!(
                "{} assessment out of range (score {}, confidence {})",
                self.agent, self.score, self.confidence
            )));
        }
        Ok(())
    }
}

/// Collect complexity signals from a step title and its content.
pub fn inspect_step(title: &str, content: Option<&str>) -> Indicators {
    let mut found = Indicators::default();
    let title_lower = title.to_lowercase();
    let body = content.unwrap_or_default();
    let body_lower = body.to_lowercase();

    if title.chars().count() > TITLE_LIMIT {
        found.add(1, format!("title longer than {} chars", TITLE_LIMIT));
    }
    let body_len = body.chars().count();
    if body_len > CONTENT_HARD_LIMIT {
        found.add(3, format!("content runs {} chars", body_len));
    } else if body_len > CONTENT_LIMIT {
        found.add(1, format!("content runs {} chars", body_len));
    }

    found.apply(TITLE_RULES, &title_lower);
    let verbs = title_lower
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| WORK_VERBS.contains(word))
        .count();
    if verbs > 1 {
        found.add(1, format!("{} work verbs in title", verbs));
    }

    found.apply(TEXT_RULES, &format!("{} {}", title_lower, body_lower));
    found.apply(CONTENT_RULES, &body_lower);

    match list_items(body).len() {
        n if n >= 6 => found.add(3, format!("{} list items", n)),
        n if n >= 3 => found.add(2, format!("{} list items", n)),
        _ => {}
    }

    found
}

/// Numbered or bulleted lines of `text`, markers stripped.
pub fn list_items(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if let Some(rest) = ["- ", "* ", "• "]
                .iter()
                .find_map(|bullet| line.strip_prefix(bullet))
            {
                return Some(rest);
            }
            let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
            if rest.len() == line.len() {
                return None;
            }
            rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
        })
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}
