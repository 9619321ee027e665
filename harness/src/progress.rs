//! Coordinator progress, inferred from its log output.
//!
//! Decoding is split from tracking: a [`SignalDecoder`] turns a log line into
//! typed [`ProgressSignal`]s, and the [`ProgressTracker`] state machine only
//! ever sees signals. [`LogMarkers`] is the substring-matching decoder used
//! for workers whose only progress channel is free text.

use serde::{Deserialize, Serialize};

/// Lifecycle of a trial, as seen from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    #[default]
    NotStarted,
    Registering,
    Training,
    RoundComplete,
    Finished,
    Errored,
}

impl ProgressState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// The coordinator is up and accepting registrations.
    CoordinatorReady,
    TrainingStarted,
    /// A participant, by index, showed up in the coordinator's output.
    ParticipantResponded(usize),
    RoundCompleted,
    TrainingFinished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSignal {
    pub kind: SignalKind,
    /// The log line the signal was decoded from.
    pub payload: String,
}

/// Turns one complete log line into zero or more signals, in order.
pub trait SignalDecoder: Send + Sync {
    fn decode(&self, line: &str) -> Vec<ProgressSignal>;
}

/// Marker substrings emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSettings {
    pub ready: Option<String>,
    pub training_started: String,
    pub round_completed: String,
    pub training_finished: String,
}

impl Default for MarkerSettings {
    fn default() -> Self {
        Self {
            ready: Some("Aggregator start successful".to_string()),
            training_started: "Initiating Global Training".to_string(),
            round_completed: "Model update".to_string(),
            training_finished: "Finished Global Training".to_string(),
        }
    }
}

/// Case-sensitive substring decoder.
///
/// Rules are checked in a fixed order (training started, participant
/// addresses, round completed, training finished, ready) and every matching
/// rule yields a signal, so one line can both name a participant and close a
/// round.
#[derive(Debug, Clone)]
pub struct LogMarkers {
    markers: MarkerSettings,
    participants: Vec<String>,
}

impl LogMarkers {
    /// `participants[i]` is the address participant `i` appears under.
    #[must_use]
    pub fn new(markers: MarkerSettings, participants: Vec<String>) -> Self {
        Self {
            markers,
            participants,
        }
    }
}

impl SignalDecoder for LogMarkers {
    fn decode(&self, line: &str) -> Vec<ProgressSignal> {
        let mut kinds = Vec::new();
        if line.contains(&self.markers.training_started) {
            kinds.push(SignalKind::TrainingStarted);
        }
        if let Some(index) = self
            .participants
            .iter()
            .position(|address| !address.is_empty() && line.contains(address.as_str()))
        {
            kinds.push(SignalKind::ParticipantResponded(index));
        }
        if line.contains(&self.markers.round_completed) {
            kinds.push(SignalKind::RoundCompleted);
        }
        if line.contains(&self.markers.training_finished) {
            kinds.push(SignalKind::TrainingFinished);
        }
        if let Some(ready) = &self.markers.ready
            && line.contains(ready.as_str())
        {
            kinds.push(SignalKind::CoordinatorReady);
        }
        kinds
            .into_iter()
            .map(|kind| ProgressSignal {
                kind,
                payload: line.to_string(),
            })
            .collect()
    }
}

/// Snapshot published to progress displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub state: ProgressState,
    pub round: usize,
    /// Participant responses seen in the current round.
    pub party_responses: usize,
}

/// State machine over coordinator signals.
pub struct ProgressTracker {
    decoder: Box<dyn SignalDecoder>,
    state: ProgressState,
    round: usize,
    responses: Vec<usize>,
    history: Vec<ProgressState>,
    partial: String,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(decoder: Box<dyn SignalDecoder>) -> Self {
        Self {
            decoder,
            state: ProgressState::NotStarted,
            round: 0,
            responses: Vec::new(),
            history: vec![ProgressState::NotStarted],
            partial: String::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProgressState {
        self.state
    }

    /// Completed rounds.
    #[must_use]
    pub fn round(&self) -> usize {
        self.round
    }

    /// Participant indices that responded in the current round, in order.
    #[must_use]
    pub fn responses(&self) -> &[usize] {
        &self.responses
    }

    /// Every state entered so far, starting with `NotStarted`.
    #[must_use]
    pub fn history(&self) -> &[ProgressState] {
        &self.history
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressUpdate {
        ProgressUpdate {
            state: self.state,
            round: self.round,
            party_responses: self.responses.len(),
        }
    }

    /// Feed raw output that may end mid-line. Only complete lines are
    /// decoded; the remainder is kept for the next chunk.
    pub fn feed(&mut self, chunk: &str) {
        self.partial.push_str(chunk);
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            self.observe_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    /// Decode and apply one complete line.
    pub fn observe_line(&mut self, line: &str) {
        for signal in self.decoder.decode(line) {
            self.apply(&signal);
        }
    }

    pub fn apply(&mut self, signal: &ProgressSignal) {
        if self.state.is_terminal() {
            return;
        }
        match (self.state, signal.kind) {
            (ProgressState::NotStarted, SignalKind::CoordinatorReady) => {
                self.enter(ProgressState::Registering);
            }
            (
                ProgressState::NotStarted | ProgressState::Registering,
                SignalKind::TrainingStarted,
            ) => {
                self.responses.clear();
                self.enter(ProgressState::Training);
            }
            (ProgressState::Training, SignalKind::ParticipantResponded(index)) => {
                self.responses.push(index);
            }
            (ProgressState::Training, SignalKind::RoundCompleted) => {
                self.round += 1;
                self.responses.clear();
                self.enter(ProgressState::RoundComplete);
                self.enter(ProgressState::Training);
            }
            (ProgressState::Training, SignalKind::TrainingFinished) => {
                self.enter(ProgressState::Finished);
            }
            _ => {}
        }
    }

    /// The coordinator exited. Anything but a clean exit after the finished
    /// marker is an error.
    pub fn process_exited(&mut self, code: i32) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!("Coordinator exited with {code} in state {:?}", self.state);
        self.enter(ProgressState::Errored);
    }

    /// Mark the trial as errored for a reason outside the log stream.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.enter(ProgressState::Errored);
        }
    }

    fn enter(&mut self, state: ProgressState) {
        self.state = state;
        self.history.push(state);
    }
}
