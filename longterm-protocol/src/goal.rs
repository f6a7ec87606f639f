use serde::{Deserialize, Serialize};

/// One quarter window. `end_time` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    /// Decimal form of `start_time`.
    pub id: String,
    pub start_time: i64,
    pub end_time: i64,
}

impl Period {
    /// Builds a period whose id is derived from its start.
    pub fn for_window(start_time: i64, end_time: i64) -> Self {
        debug_assert!(start_time < end_time, "period window must not be empty");
        Self {
            id: Self::id_for(start_time),
            start_time,
            end_time,
        }
    }

    /// Canonical id for a period starting at `start_time`.
    pub fn id_for(start_time: i64) -> String {
        start_time.to_string()
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start_time <= timestamp && timestamp < self.end_time
    }
}

/// A single long-term goal of one user within one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub owner_id: String,
    pub period_id: String,
    pub text: String,
    #[serde(default)]
    pub year: String,
    /// 1-based position among the owner's goals for the period.
    pub order: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub one_year: String,
    #[serde(default)]
    pub five_year: String,
}

impl Goal {
    pub fn builder(id: impl Into<String>) -> GoalBuilder {
        GoalBuilder {
            id: id.into(),
            owner_id: String::new(),
            period_id: String::new(),
            text: String::new(),
            order: 1,
            completed: false,
        }
    }

    /// Applies a partial update in place.
    pub fn apply(&mut self, changes: &GoalChanges) {
        if let Some(text) = &changes.text {
            self.text = text.clone();
        }
        if let Some(order) = changes.order {
            self.order = order;
        }
        if let Some(completed) = changes.completed {
            self.completed = completed;
        }
    }
}

pub struct GoalBuilder {
    id: String,
    owner_id: String,
    period_id: String,
    text: String,
    order: u32,
    completed: bool,
}

impl GoalBuilder {
    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn period(mut self, period_id: impl Into<String>) -> Self {
        self.period_id = period_id.into();
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    pub fn build(self) -> Goal {
        Goal {
            id: self.id,
            owner_id: self.owner_id,
            period_id: self.period_id,
            text: self.text,
            year: String::new(),
            order: self.order,
            completed: self.completed,
            one_year: String::new(),
            five_year: String::new(),
        }
    }
}

/// Partial update for a goal. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

/// An edited goal as submitted by the edit form.
///
/// Its position in the submitted list becomes its new `order`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalInForm {
    pub id: String,
    pub text: String,
    pub year: String,
}

impl From<&Goal> for GoalInForm {
    fn from(goal: &Goal) -> Self {
        Self {
            id: goal.id.clone(),
            text: goal.text.clone(),
            year: goal.year.clone(),
        }
    }
}

/// Period together with its goals, sorted by `order`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermData {
    pub period: Period,
    pub goals: Vec<Goal>,
}

impl LongTermData {
    /// Merges a period with its goals, sorting them by `order`.
    ///
    /// The sort is stable: goals sharing an `order` keep their arrival order.
    pub fn compose(period: Period, mut goals: Vec<Goal>) -> Self {
        goals.sort_by_key(|goal| goal.order);
        Self { period, goals }
    }

    pub fn form_rows(&self) -> Vec<GoalInForm> {
        self.goals.iter().map(GoalInForm::from).collect()
    }
}
