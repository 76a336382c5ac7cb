//! Rule matcher: decides which rules fire for a message.
//!
//! Structural predicates are evaluated locally. Semantic predicates go to the
//! classifier. A classifier failure makes that predicate *unknown*, and the
//! tree is evaluated in three-valued logic: `Any` with a true branch is true
//! and `All` with a false branch is false whatever the unknown is, while
//! `Not` of an unknown stays unknown. A rule whose result is unknown does not
//! fire, so an outage can never turn a negated predicate into a match.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::llm::{Classification, ClassifyQuery, ExtractedParams, SemanticClassifier};
use crate::mailbox::Message;
use crate::rules::model::{Field, Operator, Predicate, Rule};

/// A rule that matched, with the semantic label that selected it (if any).
#[derive(Debug, Clone)]
pub struct MatchedRule<'a> {
    pub rule: &'a Rule,
    /// Position in the rule list.
    pub index: usize,
    pub label: Option<String>,
    /// Parameters extracted by the semantic predicates that selected it.
    pub params: ExtractedParams,
}

type QueryKey = (Vec<String>, Option<String>, BTreeMap<String, String>);

/// Per-message evaluation state.
#[derive(Default)]
struct EvalContext {
    /// Classifier answers keyed by (labels, instructions, extract). `None` = failed.
    memo: HashMap<QueryKey, Option<Classification>>,
    classifier_calls: usize,
    /// Label of the last semantic predicate that evaluated true.
    label: Option<String>,
    params: ExtractedParams,
}

/// `None` when the result depends on a failed classifier call.
type Truth = Option<bool>;

type BoxedEval<'a> = Pin<Box<dyn Future<Output = Truth> + Send + 'a>>;

/// Evaluates rules against messages.
pub struct RuleMatcher {
    classifier: Option<Arc<dyn SemanticClassifier>>,
}

impl RuleMatcher {
    pub fn new(classifier: Arc<dyn SemanticClassifier>) -> Self {
        Self {
            classifier: Some(classifier),
        }
    }

    /// A matcher with no classifier; every semantic predicate is false.
    pub fn structural_only() -> Self {
        Self { classifier: None }
    }

    /// Rules matching `message`, in declaration order.
    pub async fn evaluate<'r>(&self, message: &Message, rules: &'r [Rule]) -> Vec<MatchedRule<'r>> {
        let mut ctx = EvalContext::default();
        let mut matched = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            ctx.label = None;
            ctx.params.clear();
            match self.eval(&rule.when, message, &mut ctx).await {
                Some(true) => {}
                Some(false) => continue,
                None => {
                    warn!(rule = %rule.id, message = %message.id, "Classifier unavailable, rule not fired");
                    continue;
                }
            }
            debug!(rule = %rule.id, message = %message.id, "Rule matched");
            matched.push(MatchedRule {
                rule,
                index,
                label: ctx.label.take(),
                params: std::mem::take(&mut ctx.params),
            });
            if rule.stop_after_match {
                debug!(rule = %rule.id, "stop_after_match set, skipping remaining rules");
                break;
            }
        }

        if ctx.classifier_calls > 0 {
            debug!(
                message = %message.id,
                calls = ctx.classifier_calls,
                "Classifier consulted"
            );
        }
        log_shared_action_kinds(&matched);
        matched
    }

    fn eval<'a>(
        &'a self,
        predicate: &'a Predicate,
        message: &'a Message,
        ctx: &'a mut EvalContext,
    ) -> BoxedEval<'a> {
        Box::pin(async move {
            match predicate {
                Predicate::All { of } => {
                    let mut truth = Some(true);
                    for p in of {
                        match self.eval(p, message, ctx).await {
                            Some(false) => return Some(false),
                            Some(true) => {}
                            None => truth = None,
                        }
                    }
                    truth
                }
                Predicate::Any { of } => {
                    let mut truth = Some(false);
                    for p in of {
                        match self.eval(p, message, ctx).await {
                            Some(true) => return Some(true),
                            Some(false) => {}
                            None => truth = None,
                        }
                    }
                    truth
                }
                Predicate::Not { predicate } => self.eval(predicate, message, ctx).await.map(|t| !t),
                Predicate::Structural {
                    field,
                    op,
                    value,
                    case_sensitive,
                    compiled,
                } => Some(eval_structural(
                    message,
                    field,
                    *op,
                    value,
                    *case_sensitive,
                    compiled.as_ref(),
                )),
                Predicate::Semantic {
                    labels,
                    expect,
                    threshold,
                    instructions,
                    extract,
                } => {
                    let query = ClassifyQuery {
                        labels,
                        threshold: *threshold,
                        instructions: instructions.as_deref(),
                        extract,
                    };
                    let result = self.classify(message, &query, ctx).await?;
                    let hit = result.selects(expect, *threshold);
                    if hit {
                        ctx.label = Some(result.label);
                        ctx.params.extend(result.params);
                    }
                    Some(hit)
                }
            }
        })
    }

    /// Memoised classifier call. `None` on failure.
    async fn classify(
        &self,
        message: &Message,
        query: &ClassifyQuery<'_>,
        ctx: &mut EvalContext,
    ) -> Option<Classification> {
        let key = (
            query.labels.to_vec(),
            query.instructions.map(str::to_string),
            query.extract.clone(),
        );
        if let Some(cached) = ctx.memo.get(&key) {
            return cached.clone();
        }

        let result = match &self.classifier {
            None => {
                warn!(message = %message.id, "Semantic predicate without a classifier, treating as no match");
                None
            }
            Some(classifier) => {
                ctx.classifier_calls += 1;
                match classifier.classify(&message.display(), query).await {
                    Ok(c) => Some(c),
                    Err(e) => {
                        warn!(
                            message = %message.id,
                            error = %e,
                            "Classifier unavailable, semantic predicate is unknown"
                        );
                        None
                    }
                }
            }
        };
        ctx.memo.insert(key, result.clone());
        result
    }
}

fn field_value<'m>(message: &'m Message, field: &Field) -> Option<&'m str> {
    match field {
        Field::Sender => Some(message.sender.as_str()),
        Field::Subject => Some(message.subject.as_str()),
        Field::Body => Some(message.body.as_str()),
        Field::Header(name) => message.header(name),
    }
}

fn eval_structural(
    message: &Message,
    field: &Field,
    op: Operator,
    value: &str,
    case_sensitive: bool,
    compiled: Option<&regex::Regex>,
) -> bool {
    let Some(actual) = field_value(message, field) else {
        return false;
    };
    if op == Operator::Exists {
        return match field {
            Field::Header(_) => true,
            _ => !actual.trim().is_empty(),
        };
    }
    if op == Operator::Regex {
        return compiled.is_some_and(|re| re.is_match(actual));
    }

    let (actual, value) = if case_sensitive {
        (actual.to_string(), value.to_string())
    } else {
        (actual.to_lowercase(), value.to_lowercase())
    };
    match op {
        Operator::Contains => actual.contains(&value),
        Operator::Equals => actual.trim() == value.trim(),
        Operator::StartsWith => actual.starts_with(&value),
        Operator::EndsWith => actual.ends_with(&value),
        Operator::Regex | Operator::Exists => false,
    }
}

/// When several matched rules share an action kind, name the lowest-index
/// rule as canonical. All of them still dispatch.
fn log_shared_action_kinds(matched: &[MatchedRule<'_>]) {
    let mut by_kind: BTreeMap<&'static str, Vec<&str>> = BTreeMap::new();
    for m in matched {
        let mut kinds: Vec<&'static str> = m.rule.actions.iter().map(|a| a.kind()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        for kind in kinds {
            by_kind.entry(kind).or_default().push(&m.rule.id);
        }
    }
    for (kind, rules) in by_kind {
        if let [canonical, others @ ..] = rules.as_slice()
            && !others.is_empty()
        {
            info!(
                action = kind,
                canonical = %canonical,
                also = ?others,
                "Several matched rules share an action kind"
            );
        }
    }
}
