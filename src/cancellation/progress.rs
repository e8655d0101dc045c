/// Operation lifecycle states and progress records
use super::token::CancellationToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Operation lifecycle state
///
/// `queued → initializing → running → {agent_coordination | data_processing |
/// document_updating} → cancelling → {cancelled | completed | error | timeout}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Queued,
    Initializing,
    Running,
    AgentCoordination,
    DataProcessing,
    DocumentUpdating,
    Cancelling,
    Cancelled,
    Completed,
    Error,
    Timeout,
}

impl OperationState {
    pub const ALL: [OperationState; 11] = [
        OperationState::Queued,
        OperationState::Initializing,
        OperationState::Running,
        OperationState::AgentCoordination,
        OperationState::DataProcessing,
        OperationState::DocumentUpdating,
        OperationState::Cancelling,
        OperationState::Cancelled,
        OperationState::Completed,
        OperationState::Error,
        OperationState::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Queued => "queued",
            OperationState::Initializing => "initializing",
            OperationState::Running => "running",
            OperationState::AgentCoordination => "agent_coordination",
            OperationState::DataProcessing => "data_processing",
            OperationState::DocumentUpdating => "document_updating",
            OperationState::Cancelling => "cancelling",
            OperationState::Cancelled => "cancelled",
            OperationState::Completed => "completed",
            OperationState::Error => "error",
            OperationState::Timeout => "timeout",
        }
    }

    /// Position in the lifecycle; the working phases share a rank
    pub fn rank(&self) -> u8 {
        match self {
            OperationState::Queued => 0,
            OperationState::Initializing => 1,
            OperationState::Running => 2,
            OperationState::AgentCoordination
            | OperationState::DataProcessing
            | OperationState::DocumentUpdating => 3,
            OperationState::Cancelling => 4,
            OperationState::Cancelled
            | OperationState::Completed
            | OperationState::Error
            | OperationState::Timeout => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 5
    }

    /// Whether the operation is still doing work
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != OperationState::Cancelling
    }

    /// Whether a progress update may move from `self` to `next`
    ///
    /// Moves never go backwards; the working phases may switch between each
    /// other. Terminal states are only reached through the orchestrator's
    /// complete/fail/cancel paths.
    pub fn allows_update_to(&self, next: OperationState) -> bool {
        if self.is_terminal() || next.is_terminal() {
            return false;
        }
        if *self == OperationState::Cancelling {
            return next == OperationState::Cancelling;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial progress update; unset fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub state: Option<OperationState>,
    pub percentage: Option<f64>,
    pub current_step: Option<String>,
    pub step_number: Option<u32>,
    pub active_agents: Option<Vec<String>>,
    pub completed_agents: Vec<String>,
    pub failed_agents: Vec<String>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: OperationState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn percentage(mut self, percentage: f64) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn step(mut self, description: impl Into<String>) -> Self {
        self.current_step = Some(description.into());
        self
    }

    pub fn step_number(mut self, number: u32) -> Self {
        self.step_number = Some(number);
        self
    }

    pub fn active_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_agents = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    pub fn agent_completed(mut self, agent: impl Into<String>) -> Self {
        self.completed_agents.push(agent.into());
        self
    }

    pub fn agent_failed(mut self, agent: impl Into<String>) -> Self {
        self.failed_agents.push(agent.into());
        self
    }
}

/// Progress record of one operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationProgress {
    pub operation_id: String,
    pub request_id: String,
    pub parent_id: Option<String>,
    pub state: OperationState,

    /// 0..=100, never decreases
    pub percentage: f64,

    pub current_step: String,
    pub step_number: u32,
    pub total_steps: Option<u32>,

    /// Every agent that ever took part
    pub involved_agents: BTreeSet<String>,
    pub active_agents: BTreeSet<String>,
    pub completed_agents: BTreeSet<String>,
    pub failed_agents: BTreeSet<String>,

    pub retry_count: u32,
    pub error_count: u32,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,

    /// Final error or cancellation message
    pub message: Option<String>,

    #[serde(skip)]
    pub token: CancellationToken,
}

impl OperationProgress {
    pub fn new(
        operation_id: impl Into<String>,
        request_id: impl Into<String>,
        total_steps: Option<u32>,
    ) -> Self {
        let operation_id = operation_id.into();
        let now = Utc::now();
        Self {
            token: CancellationToken::new(operation_id.clone()),
            operation_id,
            request_id: request_id.into(),
            parent_id: None,
            state: OperationState::Queued,
            percentage: 0.0,
            current_step: String::new(),
            step_number: 0,
            total_steps,
            involved_agents: BTreeSet::new(),
            active_agents: BTreeSet::new(),
            completed_agents: BTreeSet::new(),
            failed_agents: BTreeSet::new(),
            retry_count: 0,
            error_count: 0,
            started_at: now,
            updated_at: now,
            finished_at: None,
            estimated_completion: None,
            message: None,
        }
    }

    /// Merge `update` into the record
    ///
    /// Percentage is clamped to 0..=100 and never decreases; a state that
    /// would move backwards is ignored. Applying the same update twice has
    /// the same effect as applying it once.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if let Some(next) = update.state {
            if self.state.allows_update_to(next) {
                self.state = next;
            } else if next != self.state {
                tracing::trace!(
                    operation_id = %self.operation_id,
                    from = %self.state,
                    to = %next,
                    "Ignoring backward state change"
                );
            }
        }

        if let Some(step) = &update.current_step {
            self.current_step = step.clone();
        }

        if let Some(number) = update.step_number {
            self.step_number = self.step_number.max(number);
            if let Some(total) = self.total_steps.filter(|t| *t > 0) {
                let derived = f64::from(self.step_number.min(total)) / f64::from(total) * 100.0;
                self.raise_percentage(derived);
            }
        }

        if let Some(percentage) = update.percentage {
            self.raise_percentage(percentage);
        }

        if let Some(agents) = &update.active_agents {
            self.active_agents = agents.iter().cloned().collect();
            self.involved_agents.extend(agents.iter().cloned());
        }
        for agent in &update.completed_agents {
            self.active_agents.remove(agent);
            self.failed_agents.remove(agent);
            self.involved_agents.insert(agent.clone());
            self.completed_agents.insert(agent.clone());
        }
        for agent in &update.failed_agents {
            self.active_agents.remove(agent);
            self.involved_agents.insert(agent.clone());
            self.failed_agents.insert(agent.clone());
        }

        self.updated_at = Utc::now();
        self.estimated_completion = self.estimate_completion();
    }

    /// Move to a terminal state
    pub(crate) fn finish(&mut self, state: OperationState, message: Option<String>) {
        self.state = state;
        if state == OperationState::Completed {
            self.percentage = 100.0;
            self.completed_agents.extend(std::mem::take(&mut self.active_agents));
        }
        self.message = message;
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
        self.estimated_completion = None;
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    fn raise_percentage(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.percentage = self.percentage.max(value.clamp(0.0, 100.0));
    }

    /// Projected finish time: total = elapsed ÷ fraction done
    fn estimate_completion(&self) -> Option<DateTime<Utc>> {
        if self.percentage <= 0.0 || self.state.is_terminal() {
            return None;
        }
        let elapsed = (Utc::now() - self.started_at).to_std().ok()?;
        let total = elapsed.as_secs_f64() / (self.percentage / 100.0);
        let remaining = (total - elapsed.as_secs_f64()).max(0.0);
        let remaining = chrono::Duration::from_std(Duration::from_secs_f64(remaining)).ok()?;
        Some(Utc::now() + remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_percentage_is_monotone_and_clamped() {
        let mut progress = OperationProgress::new("op", "req", None);
        progress.apply(&ProgressUpdate::new().percentage(40.0));
        progress.apply(&ProgressUpdate::new().percentage(10.0));
        assert_eq!(progress.percentage, 40.0);

        progress.apply(&ProgressUpdate::new().percentage(250.0));
        assert_eq!(progress.percentage, 100.0);

        progress.apply(&ProgressUpdate::new().percentage(f64::NAN));
        assert_eq!(progress.percentage, 100.0);
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let mut progress = OperationProgress::new("op", "req", None);
        progress.apply(&ProgressUpdate::new().state(OperationState::DataProcessing));
        progress.apply(&ProgressUpdate::new().state(OperationState::Initializing));
        assert_eq!(progress.state, OperationState::DataProcessing);

        // Working phases can switch between each other
        progress.apply(&ProgressUpdate::new().state(OperationState::DocumentUpdating));
        assert_eq!(progress.state, OperationState::DocumentUpdating);
    }

    #[test]
    fn test_updates_cannot_reach_terminal_states() {
        let mut progress = OperationProgress::new("op", "req", None);
        progress.apply(&ProgressUpdate::new().state(OperationState::Completed));
        assert_eq!(progress.state, OperationState::Queued);
    }

    #[test]
    fn test_update_is_idempotent() {
        let update = ProgressUpdate::new()
            .state(OperationState::Running)
            .percentage(30.0)
            .step("fetching data")
            .active_agents(["researcher", "writer"])
            .agent_completed("researcher");

        let mut once = OperationProgress::new("op", "req", None);
        once.apply(&update);
        let mut twice = once.clone();
        twice.apply(&update);

        assert_eq!(once.state, twice.state);
        assert_eq!(once.percentage, twice.percentage);
        assert_eq!(once.current_step, twice.current_step);
        assert_eq!(once.active_agents, twice.active_agents);
        assert_eq!(once.completed_agents, twice.completed_agents);
    }

    #[test]
    fn test_step_number_derives_percentage() {
        let mut progress = OperationProgress::new("op", "req", Some(4));
        progress.apply(&ProgressUpdate::new().step_number(1).step("outline"));
        assert_eq!(progress.percentage, 25.0);
        progress.apply(&ProgressUpdate::new().step_number(3));
        assert_eq!(progress.percentage, 75.0);
        assert!(progress.estimated_completion.is_some());
    }

    #[test]
    fn test_agent_bookkeeping() {
        let mut progress = OperationProgress::new("op", "req", None);
        progress.apply(&ProgressUpdate::new().active_agents(["a", "b", "c"]));
        progress.apply(&ProgressUpdate::new().agent_completed("a").agent_failed("b"));

        assert_eq!(progress.involved_agents.len(), 3);
        assert!(progress.active_agents.contains("c"));
        assert!(progress.completed_agents.contains("a"));
        assert!(progress.failed_agents.contains("b"));
    }

    #[test]
    fn test_finish_completed() {
        let mut progress = OperationProgress::new("op", "req", None);
        progress.apply(&ProgressUpdate::new().active_agents(["writer"]).percentage(60.0));
        progress.finish(OperationState::Completed, None);
        assert_eq!(progress.percentage, 100.0);
        assert!(progress.completed_agents.contains("writer"));
        assert!(progress.finished_at.is_some());
    }

    fn any_state() -> impl Strategy<Value = OperationState> {
        prop::sample::select(OperationState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_updates_never_decrease_percentage(
            updates in prop::collection::vec(
                (prop::option::of(any_state()), prop::option::of(-50.0f64..200.0)),
                1..30,
            )
        ) {
            let mut progress = OperationProgress::new("op", "req", None);
            let mut last = progress.percentage;
            for (state, percentage) in updates {
                let mut update = ProgressUpdate::new();
                update.state = state;
                update.percentage = percentage;
                progress.apply(&update);

                prop_assert!(progress.percentage >= last);
                prop_assert!((0.0..=100.0).contains(&progress.percentage));
                prop_assert!(!progress.state.is_terminal());
                last = progress.percentage;
            }
        }
    }
}
