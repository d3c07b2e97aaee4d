// Exit decision: independent predicates combined with OR semantics
pub mod chain;
pub mod conditions;

pub use chain::ExitConditionChain;
pub use conditions::{ExitCondition, ExitContext, ExitPredicate, ExitReason, IndicatorRule};
