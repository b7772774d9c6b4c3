//! Table-driven finite state machines.
//!
//! A [`Table`] is an immutable, validated set of [`Node`]s, one per state.
//! Every node lists, for each event code the machine knows, exactly one of:
//! a [`Transition`], a drop (silently ignored here) or an invalid marker
//! (the event is impossible here and its arrival is a defect).
//!
//! A [`StateMachine`] instance owns a current state, a FIFO queue and a
//! context value, and shares its table through an `Arc`. Posting an event
//! while an action is running only enqueues it; the outer drain loop picks
//! it up once the action returns, so actions never nest.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

/// State code.
pub type StateId = u32;

/// Event code.
pub type EventId = u32;

/// States and events every machine has.
pub mod base {
    use super::{EventId, StateId};

    /// Initial state.
    pub const START: StateId = 0;
    /// Terminal state. Events posted here are discarded.
    pub const STOP: StateId = 1;
    /// First state code free for machine-specific states.
    pub const FIRST_FREE_STATE: StateId = 2;

    /// Kicks a machine off.
    pub const LAUNCH: EventId = 0;
    /// Work finished successfully.
    pub const SUCCESS: EventId = 1;
    /// Work failed permanently.
    pub const HARD_FAIL: EventId = 2;
    /// Work failed but may succeed on retry.
    pub const TEMP_FAIL: EventId = 3;
    /// First event code free for machine-specific events.
    pub const FIRST_FREE_EVENT: EventId = 4;
}

/// Result type for state machine operations.
pub type FsmResult<T> = Result<T, FsmError>;

/// Errors raised by tables and machines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    /// The table is inconsistent.
    #[error("{machine}: state {state}, event {event}: {problem}")]
    Configuration {
        /// Machine name.
        machine: String,
        /// Offending state.
        state: String,
        /// Offending event.
        event: String,
        /// What is wrong.
        problem: String,
    },

    /// A node or transition names a state the table does not declare.
    #[error("{machine}: unknown state code {state}")]
    UnknownState {
        /// Machine name.
        machine: String,
        /// State code.
        state: StateId,
    },

    /// An event arrived where the table declares it impossible.
    #[error("invalid event {event} in state {state} of {machine}")]
    InvalidEvent {
        /// Machine name.
        machine: String,
        /// State name.
        state: String,
        /// Event name.
        event: String,
    },
}

/// An event with its optional argument and diagnostics.
pub struct Event {
    /// Event code.
    pub code: EventId,
    /// Short tag naming the site that raised the event.
    pub mnemonic: &'static str,
    /// Free-form diagnostic message.
    pub message: Option<String>,
    /// Discard quietly if the machine has already stopped.
    pub drop_if_stopped: bool,
    arg: Option<Box<dyn Any + Send>>,
}

impl Event {
    /// Creates an event with no argument.
    pub fn new(code: EventId, mnemonic: &'static str) -> Self {
        Self {
            code,
            mnemonic,
            message: None,
            drop_if_stopped: false,
            arg: None,
        }
    }

    /// Attaches an argument.
    pub fn with_arg<T: Any + Send>(mut self, arg: T) -> Self {
        self.arg = Some(Box::new(arg));
        self
    }

    /// Attaches a diagnostic message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Marks the event as quietly droppable once the machine has stopped.
    pub fn drop_if_stopped(mut self) -> Self {
        self.drop_if_stopped = true;
        self
    }

    /// Borrows the argument if it has type `T`.
    pub fn arg<T: Any>(&self) -> Option<&T> {
        self.arg.as_ref().and_then(|a| a.downcast_ref::<T>())
    }

    /// Takes the argument if it has type `T`.
    pub fn take_arg<T: Any>(&mut self) -> Option<T> {
        match self.arg.take() {
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Some(*value),
                Err(other) => {
                    self.arg = Some(other);
                    None
                }
            },
            None => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("code", &self.code)
            .field("mnemonic", &self.mnemonic)
            .field("message", &self.message)
            .field("has_arg", &self.arg.is_some())
            .finish()
    }
}

/// Side-effecting step run on a transition.
pub type Action<C> = fn(&mut StateMachine<C>);

/// Where a transition leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Move to this state after the action.
    State(StateId),
    /// The action sets the state itself (or leaves it unchanged).
    ActionSets,
}

/// One entry of a node's transition list.
pub struct Transition<C> {
    /// Triggering event.
    pub event: EventId,
    /// Action to run.
    pub action: Action<C>,
    /// Resulting state.
    pub target: Target,
}

/// Per-state entry of a table.
pub struct Node<C> {
    state: StateId,
    on: Vec<Transition<C>>,
    drop: Vec<EventId>,
    invalid: Vec<EventId>,
}

impl<C> Node<C> {
    /// Creates an empty node for `state`.
    pub fn new(state: StateId) -> Self {
        Self {
            state,
            on: Vec::new(),
            drop: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Adds a transition to `target`.
    pub fn on(mut self, event: EventId, action: Action<C>, target: StateId) -> Self {
        self.on.push(Transition {
            event,
            action,
            target: Target::State(target),
        });
        self
    }

    /// Adds a transition whose action sets the state.
    pub fn on_self_set(mut self, event: EventId, action: Action<C>) -> Self {
        self.on.push(Transition {
            event,
            action,
            target: Target::ActionSets,
        });
        self
    }

    /// Declares events that are silently ignored in this state.
    pub fn drop(mut self, events: &[EventId]) -> Self {
        self.drop.extend_from_slice(events);
        self
    }

    /// Declares events that must never arrive in this state.
    pub fn invalid(mut self, events: &[EventId]) -> Self {
        self.invalid.extend_from_slice(events);
        self
    }

    /// State this node describes.
    pub fn state(&self) -> StateId {
        self.state
    }

    /// Transition list.
    pub fn transitions(&self) -> &[Transition<C>] {
        &self.on
    }

    /// Dropped events.
    pub fn dropped(&self) -> &[EventId] {
        &self.drop
    }

    /// Invalid events.
    pub fn invalid_events(&self) -> &[EventId] {
        &self.invalid
    }

    fn coverage(&self, event: EventId) -> usize {
        self.on.iter().filter(|t| t.event == event).count()
            + self.drop.iter().filter(|e| **e == event).count()
            + self.invalid.iter().filter(|e| **e == event).count()
    }
}

/// Immutable, validated transition table.
pub struct Table<C> {
    name: &'static str,
    nodes: Vec<Node<C>>,
    index: HashMap<StateId, usize>,
    state_names: BTreeMap<StateId, &'static str>,
    event_names: BTreeMap<EventId, &'static str>,
}

impl<C> Table<C> {
    /// Builds and validates a table.
    ///
    /// `states` and `events` register the machine-specific codes and their
    /// names; the base codes in [`base`] are registered automatically.
    pub fn new(
        name: &'static str,
        states: &[(StateId, &'static str)],
        events: &[(EventId, &'static str)],
        nodes: Vec<Node<C>>,
    ) -> FsmResult<Self> {
        let mut state_names = BTreeMap::from([(base::START, "Start"), (base::STOP, "Stop")]);
        state_names.extend(states.iter().copied());
        let mut event_names = BTreeMap::from([
            (base::LAUNCH, "Launch"),
            (base::SUCCESS, "Success"),
            (base::HARD_FAIL, "HardFail"),
            (base::TEMP_FAIL, "TempFail"),
        ]);
        event_names.extend(events.iter().copied());

        let mut index = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if !state_names.contains_key(&node.state) {
                return Err(FsmError::UnknownState {
                    machine: name.to_string(),
                    state: node.state,
                });
            }
            if index.insert(node.state, i).is_some() {
                return Err(FsmError::Configuration {
                    machine: name.to_string(),
                    state: state_names[&node.state].to_string(),
                    event: "-".to_string(),
                    problem: "state has more than one node".to_string(),
                });
            }
        }

        let table = Self {
            name,
            nodes,
            index,
            state_names,
            event_names,
        };
        table.validate()?;
        Ok(table)
    }

    /// Checks that every event is covered exactly once per node and that
    /// every transition leads somewhere real.
    pub fn validate(&self) -> FsmResult<()> {
        let config_err = |state: StateId, event: EventId, problem: String| FsmError::Configuration {
            machine: self.name.to_string(),
            state: self.state_name(state).to_string(),
            event: self.event_name(event).to_string(),
            problem,
        };

        for &state in self.state_names.keys() {
            if state != base::STOP && !self.index.contains_key(&state) {
                return Err(FsmError::Configuration {
                    machine: self.name.to_string(),
                    state: self.state_name(state).to_string(),
                    event: "-".to_string(),
                    problem: "state has no node".to_string(),
                });
            }
        }

        for node in &self.nodes {
            let listed = node
                .on
                .iter()
                .map(|t| t.event)
                .chain(node.drop.iter().copied())
                .chain(node.invalid.iter().copied());
            for event in listed {
                if !self.event_names.contains_key(&event) {
                    return Err(config_err(node.state, event, "event is not registered".into()));
                }
            }

            for &event in self.event_names.keys() {
                match node.coverage(event) {
                    1 => {}
                    0 => {
                        return Err(config_err(
                            node.state,
                            event,
                            "exists in none of transitions, drop nor invalid".into(),
                        ))
                    }
                    n => {
                        return Err(config_err(
                            node.state,
                            event,
                            format!("covered {n} times across transitions, drop and invalid"),
                        ))
                    }
                }
            }

            for t in &node.on {
                if let Target::State(target) = t.target {
                    if !self.state_names.contains_key(&target) {
                        return Err(FsmError::UnknownState {
                            machine: self.name.to_string(),
                            state: target,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Machine name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Name of a state code.
    pub fn state_name(&self, state: StateId) -> &'static str {
        self.state_names.get(&state).copied().unwrap_or("?")
    }

    /// Name of an event code.
    pub fn event_name(&self, event: EventId) -> &'static str {
        self.event_names.get(&event).copied().unwrap_or("?")
    }

    /// Registered states in code order.
    pub fn states(&self) -> impl Iterator<Item = (StateId, &'static str)> + '_ {
        self.state_names.iter().map(|(k, v)| (*k, *v))
    }

    /// Registered events in code order.
    pub fn events(&self) -> impl Iterator<Item = (EventId, &'static str)> + '_ {
        self.event_names.iter().map(|(k, v)| (*k, *v))
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node<C>] {
        &self.nodes
    }

    fn node(&self, state: StateId) -> Option<&Node<C>> {
        self.index.get(&state).map(|i| &self.nodes[*i])
    }
}

/// Callback invoked after every transition with `(from, to, event)`.
pub type Observer = Box<dyn FnMut(StateId, StateId, EventId) + Send>;

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// A running machine: current state, FIFO queue and context.
pub struct StateMachine<C> {
    table: Arc<Table<C>>,
    id: u64,
    state: StateId,
    queue: VecDeque<Event>,
    draining: bool,
    current: Option<Event>,
    context: C,
    observer: Option<Observer>,
}

impl<C> StateMachine<C> {
    /// Creates a machine in [`base::START`].
    pub fn new(table: Arc<Table<C>>, context: C) -> Self {
        Self {
            table,
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed),
            state: base::START,
            queue: VecDeque::new(),
            draining: false,
            current: None,
            context,
            observer: None,
        }
    }

    /// Installs a state-change observer.
    pub fn set_observer(&mut self, observer: Observer) {
        self.observer = Some(observer);
    }

    /// Instance id, unique per process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Machine name.
    pub fn name(&self) -> &'static str {
        self.table.name()
    }

    /// Current state.
    pub fn state(&self) -> StateId {
        self.state
    }

    /// Name of the current state.
    pub fn state_name(&self) -> &'static str {
        self.table.state_name(self.state)
    }

    /// Returns true once the machine reached [`base::STOP`].
    pub fn is_stopped(&self) -> bool {
        self.state == base::STOP
    }

    /// Number of queued events.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Shared table.
    pub fn table(&self) -> &Arc<Table<C>> {
        &self.table
    }

    /// Context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Mutable context.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Sets the state from inside an action whose transition targets
    /// [`Target::ActionSets`].
    pub fn set_state(&mut self, state: StateId) {
        self.state = state;
    }

    /// Borrows the argument of the event being processed.
    pub fn arg<T: Any>(&self) -> Option<&T> {
        self.current.as_ref().and_then(|e| e.arg::<T>())
    }

    /// Takes the argument of the event being processed.
    pub fn take_arg<T: Any>(&mut self) -> Option<T> {
        self.current.as_mut().and_then(|e| e.take_arg::<T>())
    }

    /// Diagnostic message of the event being processed.
    pub fn event_message(&self) -> Option<&str> {
        self.current.as_ref().and_then(|e| e.message.as_deref())
    }

    /// Mnemonic of the event being processed.
    pub fn event_mnemonic(&self) -> &'static str {
        self.current.as_ref().map(|e| e.mnemonic).unwrap_or("")
    }

    /// Posts [`base::LAUNCH`].
    pub fn start(&mut self) -> FsmResult<()> {
        self.post_event(Event::new(base::LAUNCH, "LAUNCH"))
    }

    /// Appends an event to the queue without draining it.
    pub fn enqueue(&mut self, event: Event) {
        if self.is_stopped() {
            if event.drop_if_stopped {
                trace!(machine = self.name(), id = self.id, mnemonic = event.mnemonic, "discarded after stop");
            } else {
                debug!(
                    machine = self.name(),
                    id = self.id,
                    event = self.table.event_name(event.code),
                    mnemonic = event.mnemonic,
                    "event posted to stopped machine discarded"
                );
            }
            return;
        }
        self.queue.push_back(event);
    }

    /// Enqueues `event` unless an event with the same code is already queued.
    pub fn enqueue_at_most_one(&mut self, event: Event) {
        if self.queue.iter().any(|e| e.code == event.code) {
            trace!(
                machine = self.name(),
                id = self.id,
                event = self.table.event_name(event.code),
                "coalesced with queued event"
            );
            return;
        }
        self.enqueue(event);
    }

    /// Posts an event and drains the queue unless a drain is already running.
    pub fn post_event(&mut self, event: Event) -> FsmResult<()> {
        self.enqueue(event);
        self.drain()
    }

    /// Like [`post_event`](Self::post_event), coalescing with a queued event
    /// of the same code.
    pub fn post_at_most_one_event(&mut self, event: Event) -> FsmResult<()> {
        self.enqueue_at_most_one(event);
        self.drain()
    }

    /// Processes queued events until the queue is empty.
    pub fn drain(&mut self) -> FsmResult<()> {
        if self.draining {
            return Ok(());
        }
        self.draining = true;
        let result = self.drain_queue();
        self.draining = false;
        if result.is_err() {
            self.queue.clear();
        }
        result
    }

    fn drain_queue(&mut self) -> FsmResult<()> {
        let table = Arc::clone(&self.table);
        while let Some(event) = self.queue.pop_front() {
            if self.is_stopped() {
                trace!(machine = table.name(), id = self.id, mnemonic = event.mnemonic, "discarded after stop");
                continue;
            }

            let node = table.node(self.state).ok_or_else(|| FsmError::UnknownState {
                machine: table.name().to_string(),
                state: self.state,
            })?;
            let code = event.code;

            if node.drop.contains(&code) {
                debug!(
                    machine = table.name(),
                    id = self.id,
                    state = table.state_name(self.state),
                    event = table.event_name(code),
                    mnemonic = event.mnemonic,
                    "dropped"
                );
                continue;
            }

            let transition = node.on.iter().find(|t| t.event == code);
            let transition = match transition {
                Some(t) if !node.invalid.contains(&code) => t,
                _ => {
                    error!(
                        machine = table.name(),
                        id = self.id,
                        state = table.state_name(self.state),
                        event = table.event_name(code),
                        mnemonic = event.mnemonic,
                        message = event.message.as_deref().unwrap_or(""),
                        "invalid event"
                    );
                    return Err(FsmError::InvalidEvent {
                        machine: table.name().to_string(),
                        state: table.state_name(self.state).to_string(),
                        event: table.event_name(code).to_string(),
                    });
                }
            };

            let from = self.state;
            debug!(
                machine = table.name(),
                id = self.id,
                state = table.state_name(from),
                event = table.event_name(code),
                mnemonic = event.mnemonic,
                "transition"
            );

            self.current = Some(event);
            (transition.action)(self);
            self.current = None;

            if let Target::State(target) = transition.target {
                self.state = target;
            }
            if let Some(observer) = self.observer.as_mut() {
                observer(from, self.state, code);
            }
        }
        Ok(())
    }
}

/// Action that does nothing.
pub fn noop<C>(_: &mut StateMachine<C>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const S_A: StateId = base::FIRST_FREE_STATE;
    const S_B: StateId = base::FIRST_FREE_STATE + 1;
    const E_A: EventId = base::FIRST_FREE_EVENT;
    const E_B: EventId = base::FIRST_FREE_EVENT + 1;
    const E_C: EventId = base::FIRST_FREE_EVENT + 2;

    #[derive(Default)]
    struct Log {
        seen: Vec<&'static str>,
        chain: Vec<EventId>,
    }

    fn record(sm: &mut StateMachine<Log>) {
        let tag = sm.event_mnemonic();
        sm.context_mut().seen.push(tag);
    }

    fn record_and_post_chain(sm: &mut StateMachine<Log>) {
        record(sm);
        let chain = std::mem::take(&mut sm.context_mut().chain);
        for code in chain {
            sm.enqueue(Event::new(code, "chained"));
        }
    }

    fn go_b_or_stay(sm: &mut StateMachine<Log>) {
        record(sm);
        if sm.arg::<bool>().copied().unwrap_or(false) {
            sm.set_state(S_B);
        }
    }

    fn stop(sm: &mut StateMachine<Log>) {
        record(sm);
    }

    const EVENTS: &[(EventId, &str)] = &[(E_A, "A"), (E_B, "B"), (E_C, "C")];
    const STATES: &[(StateId, &str)] = &[(S_A, "StateA"), (S_B, "StateB")];

    fn table() -> Arc<Table<Log>> {
        let nodes = vec![
            Node::new(base::START)
                .on(base::LAUNCH, record, S_A)
                .drop(&[base::SUCCESS, base::TEMP_FAIL, E_A, E_B, E_C])
                .invalid(&[base::HARD_FAIL]),
            Node::new(S_A)
                .on(E_A, record_and_post_chain, S_A)
                .on(E_B, record, S_A)
                .on(E_C, record, S_A)
                .on_self_set(base::SUCCESS, go_b_or_stay)
                .drop(&[base::TEMP_FAIL])
                .invalid(&[base::LAUNCH, base::HARD_FAIL]),
            Node::new(S_B)
                .on(base::HARD_FAIL, stop, base::STOP)
                .drop(&[base::SUCCESS, base::TEMP_FAIL, E_A, E_B, E_C])
                .invalid(&[base::LAUNCH]),
        ];
        Arc::new(Table::new("test", STATES, EVENTS, nodes).unwrap())
    }

    #[test]
    fn valid_table_builds() {
        let t = table();
        assert_eq!(t.state_name(S_A), "StateA");
        assert_eq!(t.event_name(base::TEMP_FAIL), "TempFail");
        assert_eq!(t.states().count(), 4);
        assert_eq!(t.events().count(), 7);
    }

    #[test]
    fn missing_coverage_names_state_and_event() {
        let nodes: Vec<Node<Log>> = vec![
            Node::new(base::START)
                .on(base::LAUNCH, noop, S_A)
                .drop(&[base::SUCCESS, base::HARD_FAIL, base::TEMP_FAIL, E_A, E_B, E_C]),
            Node::new(S_A)
                .drop(&[base::LAUNCH, base::SUCCESS, base::HARD_FAIL, base::TEMP_FAIL, E_A, E_C]),
            Node::new(S_B).drop(&[
                base::LAUNCH,
                base::SUCCESS,
                base::HARD_FAIL,
                base::TEMP_FAIL,
                E_A,
                E_B,
                E_C,
            ]),
        ];
        let err = Table::new("test", STATES, EVENTS, nodes).err().unwrap();
        match &err {
            FsmError::Configuration { state, event, .. } => {
                assert_eq!(state, "StateA");
                assert_eq!(event, "B");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("none of"));
    }

    #[test]
    fn duplicate_coverage_is_rejected() {
        let all = [base::LAUNCH, base::SUCCESS, base::HARD_FAIL, base::TEMP_FAIL, E_A, E_B, E_C];
        let nodes: Vec<Node<Log>> = vec![
            Node::new(base::START).drop(&all).invalid(&[E_C]),
            Node::new(S_A).drop(&all),
            Node::new(S_B).drop(&all),
        ];
        let err = Table::new("test", STATES, EVENTS, nodes).err().unwrap();
        assert!(err.to_string().contains("covered 2 times"));
        assert!(err.to_string().contains("Start"));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let rest = [base::SUCCESS, base::HARD_FAIL, base::TEMP_FAIL, E_A, E_B, E_C];
        let all = [base::LAUNCH, base::SUCCESS, base::HARD_FAIL, base::TEMP_FAIL, E_A, E_B, E_C];
        let nodes: Vec<Node<Log>> = vec![
            Node::new(base::START).on(base::LAUNCH, noop, 42).drop(&rest),
            Node::new(S_A).drop(&all),
            Node::new(S_B).drop(&all),
        ];
        let err = Table::new("test", STATES, EVENTS, nodes).err().unwrap();
        assert_eq!(
            err,
            FsmError::UnknownState {
                machine: "test".into(),
                state: 42
            }
        );
    }

    #[test]
    fn missing_node_is_rejected() {
        let all = [base::LAUNCH, base::SUCCESS, base::HARD_FAIL, base::TEMP_FAIL, E_A, E_B, E_C];
        let nodes: Vec<Node<Log>> = vec![Node::new(base::START).drop(&all), Node::new(S_A).drop(&all)];
        let err = Table::new("test", STATES, EVENTS, nodes).err().unwrap();
        assert!(err.to_string().contains("StateB"));
    }

    #[test]
    fn events_posted_during_action_run_in_fifo_order() {
        let mut sm = StateMachine::new(table(), Log::default());
        sm.start().unwrap();
        sm.context_mut().chain = vec![E_B, E_C];
        sm.post_event(Event::new(E_A, "A")).unwrap();
        assert_eq!(sm.context().seen, vec!["LAUNCH", "A", "chained", "chained"]);
        assert_eq!(sm.queue_len(), 0);
    }

    #[test]
    fn dropped_events_do_not_move_state() {
        let mut sm = StateMachine::new(table(), Log::default());
        sm.post_event(Event::new(E_B, "early")).unwrap();
        assert_eq!(sm.state(), base::START);
        assert!(sm.context().seen.is_empty());
    }

    #[test]
    fn invalid_event_fails_loudly() {
        let mut sm = StateMachine::new(table(), Log::default());
        sm.start().unwrap();
        let err = sm.post_event(Event::new(base::LAUNCH, "again")).unwrap_err();
        assert_eq!(
            err,
            FsmError::InvalidEvent {
                machine: "test".into(),
                state: "StateA".into(),
                event: "Launch".into()
            }
        );
    }

    #[test]
    fn action_sets_state() {
        let mut sm = StateMachine::new(table(), Log::default());
        sm.start().unwrap();
        sm.post_event(Event::new(base::SUCCESS, "stay").with_arg(false)).unwrap();
        assert_eq!(sm.state(), S_A);
        sm.post_event(Event::new(base::SUCCESS, "go").with_arg(true)).unwrap();
        assert_eq!(sm.state(), S_B);
        assert_eq!(sm.state_name(), "StateB");
    }

    #[test]
    fn stopped_machine_discards_events() {
        let mut sm = StateMachine::new(table(), Log::default());
        sm.start().unwrap();
        sm.post_event(Event::new(base::SUCCESS, "go").with_arg(true)).unwrap();
        sm.post_event(Event::new(base::HARD_FAIL, "stop")).unwrap();
        assert!(sm.is_stopped());
        let before = sm.context().seen.len();
        sm.post_event(Event::new(base::LAUNCH, "late")).unwrap();
        sm.post_event(Event::new(E_A, "late").drop_if_stopped()).unwrap();
        assert_eq!(sm.context().seen.len(), before);
    }

    #[test]
    fn at_most_one_coalesces_queued_duplicates() {
        let mut sm = StateMachine::new(table(), Log::default());
        sm.start().unwrap();
        sm.enqueue_at_most_one(Event::new(E_B, "first"));
        sm.enqueue_at_most_one(Event::new(E_B, "second"));
        sm.enqueue_at_most_one(Event::new(E_C, "third"));
        assert_eq!(sm.queue_len(), 2);
        sm.drain().unwrap();
        assert_eq!(sm.context().seen, vec!["LAUNCH", "first", "third"]);
    }

    #[test]
    fn observer_sees_every_transition() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut sm = StateMachine::new(table(), Log::default());
        sm.set_observer(Box::new(move |from, to, event| sink.lock().push((from, to, event))));
        sm.start().unwrap();
        sm.post_event(Event::new(base::SUCCESS, "go").with_arg(true)).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![(base::START, S_A, base::LAUNCH), (S_A, S_B, base::SUCCESS)]
        );
    }

    #[test]
    fn event_args_downcast() {
        let mut ev = Event::new(E_A, "x").with_arg(7u32);
        assert_eq!(ev.arg::<u32>(), Some(&7));
        assert_eq!(ev.take_arg::<String>(), None);
        assert_eq!(ev.take_arg::<u32>(), Some(7));
        assert_eq!(ev.take_arg::<u32>(), None);
    }

    proptest! {
        // Each (state, event) cell is covered 0, 1 or 2 times; the table
        // must validate exactly when every cell is covered once.
        #[test]
        fn validate_iff_exact_coverage(cells in proptest::collection::vec(0usize..3, 21)) {
            let states = [base::START, S_A, S_B];
            let events = [base::LAUNCH, base::SUCCESS, base::HARD_FAIL, base::TEMP_FAIL, E_A, E_B, E_C];
            let mut nodes: Vec<Node<Log>> = Vec::new();
            for (si, state) in states.iter().enumerate() {
                let mut node = Node::new(*state);
                for (ei, event) in events.iter().enumerate() {
                    match cells[si * events.len() + ei] {
                        0 => {}
                        1 => node = node.drop(&[*event]),
                        _ => node = node.on(*event, noop, S_A).invalid(&[*event]),
                    }
                }
                nodes.push(node);
            }
            let ok = Table::new("prop", STATES, EVENTS, nodes).is_ok();
            prop_assert_eq!(ok, cells.iter().all(|c| *c == 1));
        }

        #[test]
        fn chained_events_keep_posting_order(chain in proptest::collection::vec(prop_oneof![Just(E_B), Just(E_C)], 0..12)) {
            let mut sm = StateMachine::new(table(), Log::default());
            sm.start().unwrap();
            sm.context_mut().chain = chain.clone();
            sm.post_event(Event::new(E_A, "A")).unwrap();
            prop_assert_eq!(sm.context().seen.len(), chain.len() + 2);
            prop_assert_eq!(sm.context().seen[1], "A");
        }
    }
}
