//! Rule induction from positive examples.
//!
//! Examples are grouped by their output predicate. Once three or more share a
//! common set of body predicates, a candidate rule is generalized from them:
//! positions that always coincide with the output's subject/object become the
//! head variables, positions constant across examples stay constant, and
//! anything else gets a fresh variable. Induced rules sit below explicit
//! rules (priority 30) and their confidence grows with the example count.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::graph::Term;
use super::rules::{Atom, Rule};

/// Minimum examples before a rule is proposed.
pub const MIN_EXAMPLES: usize = 3;
/// Priority assigned to induced rules, below explicit ones.
pub const INDUCED_PRIORITY: i32 = 30;

/// A ground fact used as example input or output: `(subject, predicate, object)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Fact {
    pub fn new(s: &str, p: &str, o: &str) -> Self {
        Self {
            subject: s.to_string(),
            predicate: p.to_string(),
            object: o.to_string(),
        }
    }
}

/// One positive example: the inputs that held and the output that followed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Example {
    pub inputs: Vec<Fact>,
    pub output: Fact,
}

/// Induces candidate rules from `examples`. Deterministic: groups are
/// processed in predicate order and bodies are emitted in predicate order.
pub fn induce(examples: &[Example]) -> Vec<Rule> {
    let mut groups: BTreeMap<&str, Vec<&Example>> = BTreeMap::new();
    for example in examples {
        groups
            .entry(example.output.predicate.as_str())
            .or_default()
            .push(example);
    }

    let mut rules = Vec::new();
    for (out_predicate, group) in groups {
        if group.len() < MIN_EXAMPLES {
            continue;
        }

        // Predicates present in every example's inputs.
        let mut common: Vec<&str> = group[0]
            .inputs
            .iter()
            .map(|f| f.predicate.as_str())
            .collect();
        common.sort_unstable();
        common.dedup();
        common.retain(|p| {
            group
                .iter()
                .all(|e| e.inputs.iter().any(|f| f.predicate == *p))
        });
        if common.is_empty() {
            continue;
        }

        let mut body = Vec::new();
        let mut fresh = 0;
        for predicate in common {
            // The first input with this predicate in each example stands for it.
            let picks: Vec<&Fact> = group
                .iter()
                .map(|e| {
                    e.inputs
                        .iter()
                        .find(|f| f.predicate == predicate)
                        .unwrap_or(&e.output)
                })
                .collect();
            let subject = generalize(
                picks.iter().map(|f| f.subject.as_str()),
                group.iter().map(|e| e.output.subject.as_str()),
                group.iter().map(|e| e.output.object.as_str()),
                &mut fresh,
            );
            let object = generalize(
                picks.iter().map(|f| f.object.as_str()),
                group.iter().map(|e| e.output.subject.as_str()),
                group.iter().map(|e| e.output.object.as_str()),
                &mut fresh,
            );
            body.push(Atom {
                predicate: predicate.to_string(),
                subject,
                object,
                negated: false,
            });
        }

        let count = group.len();
        rules.push(Rule {
            id: format!("induced-{out_predicate}-{count}"),
            head: Atom {
                predicate: out_predicate.to_string(),
                subject: Term::Var("x".to_string()),
                object: Term::Var("y".to_string()),
                negated: false,
            },
            body,
            priority: INDUCED_PRIORITY,
            confidence: (0.5 + 0.1 * count as f64).min(0.95),
            builtin: false,
        });
    }
    rules
}

/// Maps one body position to a term: `?x`/`?y` when it always tracks the
/// output's subject/object, a constant when identical across examples, a
/// fresh variable otherwise.
fn generalize<'a>(
    values: impl Iterator<Item = &'a str>,
    out_subjects: impl Iterator<Item = &'a str>,
    out_objects: impl Iterator<Item = &'a str>,
    fresh: &mut usize,
) -> Term {
    let values: Vec<&str> = values.collect();
    let subjects: Vec<&str> = out_subjects.collect();
    let objects: Vec<&str> = out_objects.collect();

    if values.iter().zip(&subjects).all(|(v, s)| v == s) {
        return Term::Var("x".to_string());
    }
    if values.iter().zip(&objects).all(|(v, o)| v == o) {
        return Term::Var("y".to_string());
    }
    if values.windows(2).all(|w| w[0] == w[1]) {
        return Term::Const(values[0].to_string());
    }
    *fresh += 1;
    Term::Var(format!("v{fresh}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(subject: &str, object: &str) -> Example {
        Example {
            inputs: vec![
                Fact::new(subject, "parent", object),
                Fact::new(subject, "alive", "true"),
            ],
            output: Fact::new(subject, "guardian", object),
        }
    }

    #[test]
    fn three_examples_with_shared_body_induce_a_rule() {
        let examples = vec![
            example("a", "b"),
            example("c", "d"),
            example("e", "f"),
        ];
        let rules = induce(&examples);
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.head.predicate, "guardian");
        assert_eq!(rule.priority, INDUCED_PRIORITY);
        assert!((rule.confidence - 0.8).abs() < 1e-9);

        let parent = rule.body.iter().find(|a| a.predicate == "parent").unwrap();
        assert_eq!(parent.subject, Term::Var("x".to_string()));
        assert_eq!(parent.object, Term::Var("y".to_string()));
        let alive = rule.body.iter().find(|a| a.predicate == "alive").unwrap();
        assert_eq!(alive.object, Term::Const("true".to_string()));
    }

    #[test]
    fn fewer_than_three_examples_induce_nothing() {
        assert!(induce(&[example("a", "b"), example("c", "d")]).is_empty());
    }

    #[test]
    fn confidence_is_capped() {
        let examples: Vec<Example> = (0..6)
            .map(|i| example(&format!("s{i}"), &format!("o{i}")))
            .collect();
        let rules = induce(&examples);
        assert!((rules[0].confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn disjoint_bodies_induce_nothing() {
        let mut examples = vec![example("a", "b"), example("c", "d")];
        examples.push(Example {
            inputs: vec![Fact::new("e", "unrelated", "f")],
            output: Fact::new("e", "guardian", "f"),
        });
        assert!(induce(&examples).is_empty());
    }
}
