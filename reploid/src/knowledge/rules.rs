//! Forward-chaining rule engine over the triple store.
//!
//! Bounded: rule application iterates in priority-descending order (ties by
//! rule id) until a fixed point or the iteration cap. A derivation is added
//! only when its `(s, p, o)` is new; derived confidence is
//! `rule.confidence × min(premise confidences) × 0.9`. Builtins `=` and `!=`
//! compare ground terms; negation-as-failure applies only to atoms that are
//! ground after binding.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::graph::{Bindings, KnowledgeGraph, Term, TripleMeta, TriplePattern};

/// Per-step confidence decay applied to each derivation.
pub const DERIVATION_DECAY: f64 = 0.9;
/// Default iteration cap for [`infer`].
pub const DEFAULT_MAX_ITER: usize = 10;

/// One atom in a rule: `predicate(subject, object)`, possibly negated.
/// The builtin predicates `=` and `!=` compare subject and object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Atom {
    pub predicate: String,
    pub subject: Term,
    pub object: Term,
    #[serde(default)]
    pub negated: bool,
}

impl Atom {
    /// Parse form: `Atom::parse("knows", "?x", "?y")`.
    pub fn parse(predicate: &str, subject: &str, object: &str) -> Self {
        Self {
            predicate: predicate.to_string(),
            subject: Term::parse(subject),
            object: Term::parse(object),
            negated: false,
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = true;
        self
    }

    pub fn is_builtin(&self) -> bool {
        self.predicate == "=" || self.predicate == "!="
    }

    fn substituted(&self, bindings: &Bindings) -> Atom {
        Atom {
            predicate: self.predicate.clone(),
            subject: substitute(&self.subject, bindings),
            object: substitute(&self.object, bindings),
            negated: self.negated,
        }
    }

    fn is_ground(&self) -> bool {
        !self.subject.is_var() && !self.object.is_var()
    }
}

fn substitute(term: &Term, bindings: &Bindings) -> Term {
    match term {
        Term::Var(name) => bindings
            .get(name)
            .map(|v| Term::Const(v.clone()))
            .unwrap_or_else(|| term.clone()),
        Term::Const(_) => term.clone(),
    }
}

/// A Horn-style rule. Constraints reuse the body shape with no head.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub head: Atom,
    pub body: Vec<Atom>,
    pub priority: i32,
    pub confidence: f64,
    /// Marks rules shipped with the system (not induced, not user-authored).
    #[serde(default)]
    pub builtin: bool,
}

/// Outcome of one [`infer`] run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InferenceReport {
    pub derived: usize,
    pub iterations: usize,
    pub fixed_point: bool,
}

/// One solution of a rule body: the bindings plus the weakest premise
/// confidence seen on the way.
#[derive(Clone, Debug)]
pub struct BodyMatch {
    pub bindings: Bindings,
    pub min_confidence: f64,
}

/// All solutions of `body` against `graph`, deterministically ordered.
///
/// Positive atoms join left to right; builtins and negated atoms are
/// evaluated at the first point they are ground. A builtin or negated atom
/// still open at the end of the body yields no solutions (free variables
/// under negation are not allowed).
pub fn match_body(graph: &KnowledgeGraph, body: &[Atom]) -> Vec<BodyMatch> {
    let mut solutions = vec![BodyMatch {
        bindings: Bindings::new(),
        min_confidence: 1.0,
    }];

    let mut deferred: Vec<&Atom> = Vec::new();
    for atom in body {
        if atom.is_builtin() || atom.negated {
            let mut still_open = false;
            solutions.retain(|s| match check_ground_test(graph, atom, &s.bindings) {
                Some(pass) => pass,
                None => {
                    still_open = true;
                    true
                }
            });
            if still_open {
                deferred.push(atom);
            }
        } else {
            let mut next = Vec::new();
            for solution in &solutions {
                extend(graph, atom, solution, &mut next);
            }
            solutions = next;
            // New variables may have bound; re-check any open tests.
            deferred.retain(|test| {
                let mut still_open = false;
                solutions.retain(|s| match check_ground_test(graph, test, &s.bindings) {
                    Some(pass) => pass,
                    None => {
                        still_open = true;
                        true
                    }
                });
                still_open
            });
        }
        if solutions.is_empty() {
            return solutions;
        }
    }

    // Anything still deferred has free variables; drop those solutions.
    for test in deferred {
        solutions.retain(|s| check_ground_test(graph, test, &s.bindings) == Some(true));
    }
    solutions
}

fn extend(graph: &KnowledgeGraph, atom: &Atom, current: &BodyMatch, out: &mut Vec<BodyMatch>) {
    let bound = atom.substituted(&current.bindings);

    let pattern = TriplePattern {
        subject: bound.subject.clone(),
        predicate: Term::Const(bound.predicate.clone()),
        object: bound.object.clone(),
    };
    for (triple, new_bindings) in graph.matches(&pattern) {
        let mut merged = current.bindings.clone();
        let mut ok = true;
        for (k, v) in new_bindings {
            match merged.get(&k) {
                Some(existing) if existing != &v => {
                    ok = false;
                    break;
                }
                Some(_) => {}
                None => {
                    merged.insert(k, v);
                }
            }
        }
        if ok {
            out.push(BodyMatch {
                bindings: merged,
                min_confidence: current.min_confidence.min(triple.meta.confidence),
            });
        }
    }
}

/// Evaluates a builtin or negated atom once ground. `None` = not ground yet.
fn check_ground_test(graph: &KnowledgeGraph, atom: &Atom, extra: &Bindings) -> Option<bool> {
    let bound = atom.substituted(extra);
    if !bound.is_ground() {
        return None;
    }
    let s = bound.subject.as_const().unwrap_or_default();
    let o = bound.object.as_const().unwrap_or_default();
    let result = match bound.predicate.as_str() {
        "=" => s == o,
        "!=" => s != o,
        predicate => {
            let present = graph.contains(s, predicate, o);
            if bound.negated {
                // Negation-as-failure on a ground atom.
                return Some(!present);
            }
            present
        }
    };
    Some(if bound.negated { !result } else { result })
}

/// Runs forward chaining to a fixed point or `max_iter`, mutating `graph`.
pub fn infer(graph: &mut KnowledgeGraph, rules: &[Rule], max_iter: usize) -> InferenceReport {
    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut report = InferenceReport::default();
    for _ in 0..max_iter {
        report.iterations += 1;
        let mut added_this_round = 0;

        for rule in &ordered {
            // Solutions are computed against the graph as of this pass.
            let matches = match_body(graph, &rule.body);
            for m in matches {
                let head = rule.head.substituted(&m.bindings);
                let (Some(s), Some(o)) = (head.subject.as_const(), head.object.as_const()) else {
                    debug!(rule = %rule.id, "head not ground; skipping derivation");
                    continue;
                };
                if graph.contains(s, &head.predicate, o) {
                    continue;
                }
                let confidence = rule.confidence * m.min_confidence * DERIVATION_DECAY;
                graph.add_triple(
                    s,
                    &head.predicate,
                    o,
                    TripleMeta {
                        confidence,
                        source: "inference".to_string(),
                        provenance: vec![rule.id.clone()],
                    },
                );
                added_this_round += 1;
            }
        }

        report.derived += added_this_round;
        if added_this_round == 0 {
            report.fixed_point = true;
            break;
        }
    }
    report
}
