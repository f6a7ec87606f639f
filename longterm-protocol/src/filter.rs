use serde::{Deserialize, Serialize};

use crate::goal::Goal;

/// Goal fields that can take part in an equality predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalField {
    Id,
    OwnerId,
    PeriodId,
}

/// `field == value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    pub field: GoalField,
    pub value: String,
}

/// Conjunction of equality predicates over goals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalFilter {
    pub predicates: Vec<Predicate>,
}

impl GoalFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: GoalField, value: impl Into<String>) -> Self {
        self.predicates.push(Predicate {
            field,
            value: value.into(),
        });
        self
    }

    pub fn owner(self, owner_id: impl Into<String>) -> Self {
        self.eq(GoalField::OwnerId, owner_id)
    }

    pub fn period(self, period_id: impl Into<String>) -> Self {
        self.eq(GoalField::PeriodId, period_id)
    }

    /// Goals of `owner_id` within `period_id`.
    pub fn owned_in_period(owner_id: impl Into<String>, period_id: impl Into<String>) -> Self {
        Self::new().owner(owner_id).period(period_id)
    }

    /// An empty filter matches every goal.
    pub fn matches(&self, goal: &Goal) -> bool {
        self.predicates.iter().all(|predicate| {
            let actual = match predicate.field {
                GoalField::Id => &goal.id,
                GoalField::OwnerId => &goal.owner_id,
                GoalField::PeriodId => &goal.period_id,
            };
            actual == &predicate.value
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_predicates_must_hold() {
        let goal = Goal::builder("g1").owner("alice").period("100").build();

        assert!(GoalFilter::new().matches(&goal));
        assert!(GoalFilter::owned_in_period("alice", "100").matches(&goal));
        assert!(!GoalFilter::owned_in_period("alice", "200").matches(&goal));
        assert!(!GoalFilter::owned_in_period("bob", "100").matches(&goal));
    }
}
