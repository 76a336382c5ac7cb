//! Trigger rules: the model loaded from the rule file and the matcher that
//! evaluates it against messages.

pub mod matcher;
pub mod model;

pub use matcher::{MatchedRule, RuleMatcher};
pub use model::{Field, Operator, Predicate, Rule, RuleSet};
