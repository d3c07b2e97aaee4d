use super::conditions::{ExitCondition, ExitContext, ExitPredicate, ExitReason};

/// Ordered exit conditions combined with short-circuit OR
///
/// Order only changes which reason gets reported and how much work is done;
/// every condition is a pure predicate.
#[derive(Debug, Clone, Default)]
pub struct ExitConditionChain {
    conditions: Vec<ExitCondition>,
}

impl ExitConditionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: ExitCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn push(&mut self, condition: ExitCondition) {
        self.conditions.push(condition);
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[ExitCondition] {
        &self.conditions
    }

    /// True if any condition says exit
    pub fn evaluate(&self, ctx: &ExitContext<'_>) -> bool {
        self.first_triggered(ctx).is_some()
    }

    /// Reason of the first condition (in chain order) that fires
    pub fn first_triggered(&self, ctx: &ExitContext<'_>) -> Option<ExitReason> {
        let reason = self
            .conditions
            .iter()
            .find(|condition| condition.should_exit(ctx))
            .map(|condition| condition.reason());

        if let Some(ref reason) = reason {
            tracing::debug!(
                symbol = %ctx.position.symbol,
                direction = %ctx.position.direction,
                price = ctx.current_price,
                reason = %reason,
                "Exit condition triggered"
            );
        }

        reason
    }
}
