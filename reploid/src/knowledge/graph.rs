//! Triple store with variable-pattern queries.
//!
//! Facts are `(subject, predicate, object)` with metadata. Insertion is
//! idempotent by the triple key: re-adding aggregates confidence by max and
//! merges provenance. Query results come back in `(s, p, o)` order so equal
//! inputs always produce equal outputs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A term: constant or variable. Variables are a distinguished sort, written
/// `?name` in the parse form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Const(String),
    Var(String),
}

impl Term {
    /// `?x` parses as a variable, anything else as a constant.
    pub fn parse(s: &str) -> Term {
        match s.strip_prefix('?') {
            Some(name) => Term::Var(name.to_string()),
            None => Term::Const(s.to_string()),
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Term::Var(_))
    }

    pub fn as_const(&self) -> Option<&str> {
        match self {
            Term::Const(c) => Some(c),
            Term::Var(_) => None,
        }
    }
}

/// Metadata carried by each fact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TripleMeta {
    /// In `[0, 1]`.
    pub confidence: f64,
    pub source: String,
    #[serde(default)]
    pub provenance: Vec<String>,
}

impl Default for TripleMeta {
    fn default() -> Self {
        Self {
            confidence: 1.0,
            source: "assertion".to_string(),
            provenance: Vec::new(),
        }
    }
}

impl TripleMeta {
    pub fn from_source(source: &str, confidence: f64) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            source: source.to_string(),
            provenance: Vec::new(),
        }
    }
}

/// One fact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub meta: TripleMeta,
}

impl Triple {
    pub fn key(&self) -> (String, String, String) {
        (
            self.subject.clone(),
            self.predicate.clone(),
            self.object.clone(),
        )
    }
}

/// Query pattern: each position is a constant or a variable.
#[derive(Clone, Debug)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl TriplePattern {
    /// Parse form: `?x`, `likes`, `?y`.
    pub fn parse(subject: &str, predicate: &str, object: &str) -> Self {
        Self {
            subject: Term::parse(subject),
            predicate: Term::parse(predicate),
            object: Term::parse(object),
        }
    }
}

/// Variable bindings from one match. BTreeMap keeps display and comparison
/// deterministic.
pub type Bindings = BTreeMap<String, String>;

/// The triple store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    triples: Vec<Triple>,
    #[serde(skip)]
    index: HashMap<(String, String, String), usize>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the key index; needed after deserialization.
    pub fn reindex(&mut self) {
        self.index = self
            .triples
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key(), i))
            .collect();
    }

    /// Adds a fact. Returns `true` when the triple is new; an existing triple
    /// takes the max of the confidences and the union of provenance.
    pub fn add_triple(&mut self, s: &str, p: &str, o: &str, meta: TripleMeta) -> bool {
        let key = (s.to_string(), p.to_string(), o.to_string());
        if let Some(&i) = self.index.get(&key) {
            let existing = &mut self.triples[i].meta;
            existing.confidence = existing.confidence.max(meta.confidence);
            for prov in meta.provenance {
                if !existing.provenance.contains(&prov) {
                    existing.provenance.push(prov);
                }
            }
            return false;
        }
        self.triples.push(Triple {
            subject: s.to_string(),
            predicate: p.to_string(),
            object: o.to_string(),
            meta,
        });
        self.index.insert(key, self.triples.len() - 1);
        true
    }

    pub fn contains(&self, s: &str, p: &str, o: &str) -> bool {
        self.index
            .contains_key(&(s.to_string(), p.to_string(), o.to_string()))
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    /// Triples matching the pattern, in `(s, p, o)` order, with the bindings
    /// each match produces.
    pub fn matches(&self, pattern: &TriplePattern) -> Vec<(&Triple, Bindings)> {
        let mut hits: Vec<&Triple> = self
            .triples
            .iter()
            .filter(|t| {
                position_matches(&pattern.subject, &t.subject)
                    && position_matches(&pattern.predicate, &t.predicate)
                    && position_matches(&pattern.object, &t.object)
            })
            .collect();
        hits.sort_by(|a, b| {
            (&a.subject, &a.predicate, &a.object).cmp(&(&b.subject, &b.predicate, &b.object))
        });
        hits.into_iter()
            .filter_map(|t| bind(pattern, t).map(|b| (t, b)))
            .collect()
    }

    /// Binding sets for the pattern, deterministically ordered.
    pub fn query(&self, pattern: &TriplePattern) -> Vec<Bindings> {
        self.matches(pattern).into_iter().map(|(_, b)| b).collect()
    }
}

fn position_matches(term: &Term, value: &str) -> bool {
    match term {
        Term::Const(c) => c == value,
        Term::Var(_) => true,
    }
}

/// Builds bindings for one triple; `None` when one variable would need two
/// different values.
fn bind(pattern: &TriplePattern, triple: &Triple) -> Option<Bindings> {
    let mut bindings = Bindings::new();
    for (term, value) in [
        (&pattern.subject, &triple.subject),
        (&pattern.predicate, &triple.predicate),
        (&pattern.object, &triple.object),
    ] {
        if let Term::Var(name) = term {
            match bindings.get(name) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => {
                    bindings.insert(name.clone(), value.clone());
                }
            }
        }
    }
    Some(bindings)
}
