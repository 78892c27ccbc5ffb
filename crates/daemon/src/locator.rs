//! Alternative selector search
//!
//! Ranks elements of a page snapshot by how well they match a selector
//! that no longer resolves. Used both by the heuristic advisor and by the
//! alternative-selector recovery strategy.

use adaptest_common::{PageElement, PageSnapshot, StepAction};
use std::collections::HashSet;

/// Attributes that usually carry stable, human-meaningful names
const NAMING_ATTRIBUTES: &[&str] = &[
    "id",
    "name",
    "data-testid",
    "data-test",
    "aria-label",
    "placeholder",
    "title",
    "type",
    "value",
];

/// A ranked replacement selector
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub selector: String,
    /// In [0, 1]
    pub score: f64,
}

/// Lowercase alphanumeric words of a selector or label.
/// `button[data-testid="login-submit"]` -> {button, data, testid, login, submit}
fn tokens(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

/// Leading tag of a selector, if it has one
fn leading_tag(selector: &str) -> Option<String> {
    let tag: String = selector
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_ascii_lowercase())
    }
}

fn element_tokens(element: &PageElement) -> HashSet<String> {
    let mut all = tokens(&element.selector);
    all.extend(tokens(&element.text));
    if let Some(role) = &element.role {
        all.extend(tokens(role));
    }
    for attr in NAMING_ATTRIBUTES {
        if let Some(v) = element.attributes.get(*attr) {
            all.extend(tokens(v));
        }
    }
    all
}

fn score(wanted: &HashSet<String>, tag: Option<&str>, element: &PageElement) -> f64 {
    if wanted.is_empty() {
        return 0.0;
    }
    let have = element_tokens(element);
    let overlap = wanted.intersection(&have).count() as f64 / wanted.len() as f64;
    if overlap == 0.0 {
        return 0.0;
    }
    let tag_bonus = match tag {
        Some(t) if element.tag.eq_ignore_ascii_case(t) => 0.15,
        _ => 0.0,
    };
    (overlap * 0.85 + tag_bonus).min(1.0)
}

/// Rank replacement selectors for `action` in `snapshot`, best first.
///
/// Only visible elements are considered, and only interactable ones when
/// the action needs to interact. The original selector is never returned.
pub fn alternative_selectors(
    snapshot: &PageSnapshot,
    action: &StepAction,
    limit: usize,
) -> Vec<Candidate> {
    if action.action.targets_url() {
        return Vec::new();
    }

    let wanted = tokens(&action.target);
    let tag = leading_tag(&action.target);

    let mut candidates: Vec<Candidate> = snapshot
        .elements
        .iter()
        .filter(|e| e.selector != action.target && e.visible)
        .filter(|e| !action.action.needs_interaction() || e.interactable)
        .map(|e| Candidate {
            selector: e.selector.clone(),
            score: score(&wanted, tag.as_deref(), e),
        })
        .filter(|c| c.score > 0.0)
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.selector.cmp(&b.selector))
    });
    candidates.truncate(limit);
    candidates
}
