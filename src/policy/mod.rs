pub mod evaluator;
pub mod opa;

pub use evaluator::{
    classify, scan_status, try_rule, RuleEvaluator, RuleOutcome, RuleTest, Violation,
};
pub use opa::OpaEvaluator;
