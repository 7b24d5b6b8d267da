//! Rule matching for inbound leads.
//!
//! [`find_candidates`] filters a rule snapshot down to the rules eligible for a
//! lead and orders them best-first:
//!
//! 1. `priority` ascending,
//! 2. ZIP specificity descending (exact, then longer prefix, then shorter prefix,
//!    then any-ZIP),
//! 3. exact funnel before the `*` funnel,
//! 4. earlier `created_at`, then `rule_id` so that the order never depends on the
//!    order of the input slice.
//!
//! Everything here is pure and synchronous. [`explain`] produces the same ordering
//! plus a per-rule verdict for the admin test-match tooling.

use std::cmp::{Ordering, Reverse};

use serde::{Deserialize, Serialize};

use crate::domain::rule::{AssignmentRule, RuleId, ZipPattern};

/// How precisely a rule's best pattern matched the lead's ZIP. Later variants win.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "prefix_len", rename_all = "snake_case")]
pub enum ZipSpecificity {
    Any,
    Prefix(usize),
    Exact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelMatch {
    Exact,
    Wildcard,
}

/// An eligible rule together with the facts its rank was computed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub rule: &'a AssignmentRule,
    pub specificity: ZipSpecificity,
    pub funnel: FunnelMatch,
}

impl Candidate<'_> {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        let key = |candidate: &Self| {
            (
                candidate.rule.priority,
                Reverse(candidate.specificity),
                candidate.funnel == FunnelMatch::Wildcard,
                candidate.rule.created_at,
            )
        };
        key(self).cmp(&key(other)).then_with(|| self.rule.id.cmp(&other.rule.id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict<'a> {
    Eligible(Candidate<'a>),
    Inactive,
    FunnelMismatch,
    ZipMismatch,
}

/// Returns every eligible rule for `(funnel_id, zip)`, best candidate first.
///
/// An empty `zip` only matches rules with no patterns or an any-ZIP pattern.
pub fn find_candidates<'a>(
    funnel_id: &str,
    zip: &str,
    rules: &'a [AssignmentRule],
) -> Vec<&'a AssignmentRule> {
    ranked(funnel_id, zip, rules).into_iter().map(|candidate| candidate.rule).collect()
}

/// Same as [`find_candidates`] but keeps the specificity and funnel match of each rule.
pub fn ranked<'a>(funnel_id: &str, zip: &str, rules: &'a [AssignmentRule]) -> Vec<Candidate<'a>> {
    let mut candidates: Vec<Candidate<'a>> = rules
        .iter()
        .filter_map(|rule| match evaluate(funnel_id, zip, rule) {
            Verdict::Eligible(candidate) => Some(candidate),
            _ => None,
        })
        .collect();
    candidates.sort_by(Candidate::rank_cmp);
    candidates
}

fn evaluate<'a>(funnel_id: &str, zip: &str, rule: &'a AssignmentRule) -> Verdict<'a> {
    if !rule.is_active {
        return Verdict::Inactive;
    }

    let funnel = if rule.funnel_id == funnel_id {
        FunnelMatch::Exact
    } else if rule.applies_to_all_funnels() {
        FunnelMatch::Wildcard
    } else {
        return Verdict::FunnelMismatch;
    };

    match zip_specificity(&rule.zip_patterns, zip) {
        Some(specificity) => Verdict::Eligible(Candidate { rule, specificity, funnel }),
        None => Verdict::ZipMismatch,
    }
}

/// Best specificity among the patterns that match `zip`, or `None` if none match.
pub fn zip_specificity(patterns: &[String], zip: &str) -> Option<ZipSpecificity> {
    if patterns.is_empty() {
        return Some(ZipSpecificity::Any);
    }

    patterns
        .iter()
        .map(|raw| ZipPattern::from_raw(raw))
        .filter(|pattern| pattern.matches(zip))
        .map(|pattern| match pattern {
            ZipPattern::Any => ZipSpecificity::Any,
            ZipPattern::Prefix(prefix) => ZipSpecificity::Prefix(prefix.len()),
            ZipPattern::Exact(_) => ZipSpecificity::Exact,
        })
        .max()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchReason {
    Matched { zip: ZipSpecificity, funnel: FunnelMatch },
    Inactive,
    FunnelMismatch,
    ZipMismatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_id: RuleId,
    pub priority: i32,
    pub matched: bool,
    /// Zero-based position in the candidate list when matched.
    pub rank: Option<usize>,
    pub reason: MatchReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReport {
    pub funnel_id: String,
    pub zip: String,
    pub selected: Option<RuleId>,
    pub candidates: Vec<RuleId>,
    /// Candidates in rank order, followed by the rejected rules in input order.
    pub evaluations: Vec<RuleEvaluation>,
}

/// Evaluates every rule (inactive ones included) and reports why each did or did not match.
pub fn explain(funnel_id: &str, zip: &str, rules: &[AssignmentRule]) -> MatchReport {
    let candidates = ranked(funnel_id, zip, rules);

    let mut evaluations: Vec<RuleEvaluation> = candidates
        .iter()
        .enumerate()
        .map(|(rank, candidate)| RuleEvaluation {
            rule_id: candidate.rule.id.clone(),
            priority: candidate.rule.priority,
            matched: true,
            rank: Some(rank),
            reason: MatchReason::Matched {
                zip: candidate.specificity,
                funnel: candidate.funnel,
            },
        })
        .collect();

    for rule in rules {
        let reason = match evaluate(funnel_id, zip, rule) {
            Verdict::Eligible(_) => continue,
            Verdict::Inactive => MatchReason::Inactive,
            Verdict::FunnelMismatch => MatchReason::FunnelMismatch,
            Verdict::ZipMismatch => MatchReason::ZipMismatch,
        };
        evaluations.push(RuleEvaluation {
            rule_id: rule.id.clone(),
            priority: rule.priority,
            matched: false,
            rank: None,
            reason,
        });
    }

    MatchReport {
        funnel_id: funnel_id.to_string(),
        zip: zip.to_string(),
        selected: candidates.first().map(|candidate| candidate.rule.id.clone()),
        candidates: candidates.iter().map(|candidate| candidate.rule.id.clone()).collect(),
        evaluations,
    }
}
