pub mod apply;
pub mod library;
pub mod types;

pub use apply::apply_rule;
pub use library::RuleLibrary;
pub use types::{
    ApplyOutcome, CodingRule, LabelCount, RuleDraft, RuleFilter, RulePage, RulePatch, RuleStats,
};
