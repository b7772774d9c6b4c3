//! Top-level protocol control: one machine per account.
//!
//! The control picks the next command, runs it on a transport machine and
//! reacts to how the round trip ended. Picking order:
//!
//! 1. FolderSync while the hierarchy is uninitialised or a scrub is due
//! 2. the oldest dispatchable non-sync pending row
//! 3. Sync while any folder needs it or has rows to push
//! 4. otherwise Idle
//!
//! Outcomes that need the user park the machine until
//! [`ControlHandle::resolved`] is called.

use crate::command::{Command, Outcome};
use crate::config::SyncConfig;
use crate::dispatch::{next_dispatchable, PendingCommand};
use crate::error::{SyncError, SyncResult};
use crate::folder_sync::{begin_full_refresh, FolderSyncCommand};
use crate::fsm::{base, Event, EventId, FsmResult, Node, StateId, StateMachine, Table};
use crate::http::{Session, Transport, TransportHandle, TransportReport};
use crate::mailbox::{mailbox, Poster};
use crate::store::{ItemStore, ItemStoreExt};
use crate::sync::{folder_wants_sync, SyncCommand};
use crate::timer::Timer;
use crate::transport::HttpClient;
use groupsync_protocol::DocumentCodec;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Running FolderSync.
pub const ST_FOLDER_SYNC_WAIT: StateId = base::FIRST_FREE_STATE;
/// Running Sync.
pub const ST_SYNC_WAIT: StateId = base::FIRST_FREE_STATE + 1;
/// Running a single pending row.
pub const ST_COMMAND_WAIT: StateId = base::FIRST_FREE_STATE + 2;
/// Nothing to do.
pub const ST_IDLE: StateId = base::FIRST_FREE_STATE + 3;
/// Waiting for the user.
pub const ST_PARKED: StateId = base::FIRST_FREE_STATE + 4;

/// A local edit queued a pending row.
pub const EV_PEND_Q: EventId = base::FIRST_FREE_EVENT;
/// The command asked to run again.
pub const EV_SYNC_AGAIN: EventId = base::FIRST_FREE_EVENT + 1;
/// The folder hierarchy must be re-derived.
pub const EV_FOLDER_RESYNC: EventId = base::FIRST_FREE_EVENT + 2;
/// Credentials were rejected.
pub const EV_AUTH_FAIL: EventId = base::FIRST_FREE_EVENT + 3;
/// Device policy flow required.
pub const EV_RE_PROVISION: EventId = base::FIRST_FREE_EVENT + 4;
/// Endpoint must be rediscovered.
pub const EV_REDISCOVER: EventId = base::FIRST_FREE_EVENT + 5;
/// The user dealt with a parked request.
pub const EV_USER_RESOLVED: EventId = base::FIRST_FREE_EVENT + 6;
/// Poll now.
pub const EV_TICK: EventId = base::FIRST_FREE_EVENT + 7;
/// Stop the account.
pub const EV_SHUTDOWN: EventId = base::FIRST_FREE_EVENT + 8;

const STATES: &[(StateId, &str)] = &[
    (ST_FOLDER_SYNC_WAIT, "FolderSyncWait"),
    (ST_SYNC_WAIT, "SyncWait"),
    (ST_COMMAND_WAIT, "CommandWait"),
    (ST_IDLE, "Idle"),
    (ST_PARKED, "Parked"),
];

const EVENTS: &[(EventId, &str)] = &[
    (EV_PEND_Q, "PendQ"),
    (EV_SYNC_AGAIN, "SyncAgain"),
    (EV_FOLDER_RESYNC, "FolderResync"),
    (EV_AUTH_FAIL, "AuthFail"),
    (EV_RE_PROVISION, "ReProvision"),
    (EV_REDISCOVER, "Rediscover"),
    (EV_USER_RESOLVED, "UserResolved"),
    (EV_TICK, "Tick"),
    (EV_SHUTDOWN, "Shutdown"),
];

const OUTCOME_EVENTS: [EventId; 8] = [
    base::SUCCESS,
    base::HARD_FAIL,
    base::TEMP_FAIL,
    EV_SYNC_AGAIN,
    EV_FOLDER_RESYNC,
    EV_AUTH_FAIL,
    EV_RE_PROVISION,
    EV_REDISCOVER,
];

/// Coarse phase published on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not launched yet.
    Starting,
    /// Syncing the folder hierarchy.
    FolderSync,
    /// Syncing items.
    Sync,
    /// Sending a pending row.
    Command,
    /// Caught up.
    Idle,
    /// Waiting for the user.
    NeedsUser,
    /// Shut down.
    Stopped,
}

/// Snapshot of the control published through a `watch` channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlStatus {
    /// Current phase.
    pub phase: Phase,
    /// Round trips completed.
    pub round_trips: u64,
    /// Last error, cleared by the next successful round trip.
    pub last_error: Option<SyncError>,
    /// What the user has to do while parked.
    pub user_action: Option<SyncError>,
}

impl Default for ControlStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Starting,
            round_trips: 0,
            last_error: None,
            user_action: None,
        }
    }
}

struct Completion {
    serial: u64,
    report: TransportReport,
}

fn completion_event(serial: u64, report: TransportReport) -> Event {
    let code = match &report.outcome {
        Outcome::Success => base::SUCCESS,
        Outcome::SyncAgain => EV_SYNC_AGAIN,
        Outcome::Resync(_) => EV_FOLDER_RESYNC,
        Outcome::HardFail(_) if report.exhausted => base::TEMP_FAIL,
        Outcome::HardFail(_) | Outcome::OutOfSpace => base::HARD_FAIL,
        Outcome::AuthFail(_) => EV_AUTH_FAIL,
        Outcome::ReProvision => EV_RE_PROVISION,
        Outcome::Rediscover(_) => EV_REDISCOVER,
    };
    Event::new(code, "transport")
        .with_arg(Completion { serial, report })
        .drop_if_stopped()
}

/// Context of the control machine.
pub struct Control {
    config: SyncConfig,
    store: Arc<dyn ItemStore>,
    transport: Transport,
    poster: Poster,
    status: watch::Sender<ControlStatus>,
    serial: u64,
    in_flight: Option<TransportHandle>,
    tick: Option<Timer>,
}

impl Control {
    fn publish(&self, change: impl FnOnce(&mut ControlStatus)) {
        self.status.send_modify(change);
    }

    fn session(&self) -> SyncResult<Session> {
        let state = self.store.read(|txn| txn.protocol_state())?;
        let endpoint = match state.endpoint.as_deref().map(Url::parse) {
            Some(Ok(url)) => url,
            Some(Err(err)) => {
                warn!(%err, "stored endpoint unusable, using configured one");
                self.config.account.endpoint.clone()
            }
            None => self.config.account.endpoint.clone(),
        };
        let mut session = Session::new(endpoint, self.config.account.protocol_version.clone());
        session.policy_key = state.policy_key;
        Ok(session)
    }

    fn next_command(&self) -> SyncResult<Option<(Box<dyn Command>, StateId, Phase)>> {
        let store = Arc::clone(&self.store);
        let (hierarchy_due, row, sync_due) = self.store.read(|txn| {
            let state = txn.protocol_state();
            let pending = txn.pending();
            (
                state.hierarchy_cursor.is_initial() || state.scrub_needed,
                next_dispatchable(txn),
                txn.folders().iter().any(|f| folder_wants_sync(f, &pending)),
            )
        })?;
        if hierarchy_due {
            return Ok(Some((Box::new(FolderSyncCommand::new(store)), ST_FOLDER_SYNC_WAIT, Phase::FolderSync)));
        }
        if let Some(op) = row {
            return Ok(Some((Box::new(PendingCommand::new(store, op)), ST_COMMAND_WAIT, Phase::Command)));
        }
        if sync_due {
            return Ok(Some((Box::new(SyncCommand::new(store, &self.config)), ST_SYNC_WAIT, Phase::Sync)));
        }
        Ok(None)
    }

    fn enter_idle(&mut self) {
        if let Some(interval) = self.config.idle_interval {
            let poster = self.poster.clone();
            self.tick = Some(Timer::schedule("idle-tick", interval, move || {
                poster.post(Event::new(EV_TICK, "idle-timer").drop_if_stopped());
            }));
        }
        self.publish(|s| s.phase = Phase::Idle);
        info!("account idle");
    }

    fn record_endpoint(&self, report: &TransportReport) {
        let Some(endpoint) = &report.endpoint else {
            return;
        };
        let url = endpoint.to_string();
        let saved = self.store.transaction(|txn| {
            let mut state = txn.protocol_state();
            state.endpoint = Some(url.clone());
            txn.set_protocol_state(state);
            Ok(())
        });
        match saved {
            Ok(()) => info!(endpoint = %url, "endpoint moved"),
            Err(err) => error!(%err, "could not persist new endpoint"),
        }
    }
}

fn take_current(sm: &mut StateMachine<Control>) -> Option<TransportReport> {
    let completion = sm.take_arg::<Completion>()?;
    let ctl = sm.context_mut();
    if completion.serial != ctl.serial || ctl.in_flight.is_none() {
        debug!(serial = completion.serial, current = ctl.serial, "stale completion ignored");
        return None;
    }
    ctl.in_flight = None;
    ctl.record_endpoint(&completion.report);
    ctl.publish(|s| s.round_trips += 1);
    Some(completion.report)
}

fn do_pick(sm: &mut StateMachine<Control>) {
    let ctl = sm.context_mut();
    ctl.tick = None;
    let next = ctl.next_command().and_then(|next| match next {
        Some(next) => Ok(Some((next, ctl.session()?))),
        None => Ok(None),
    });
    match next {
        Ok(Some(((command, state, phase), session))) => {
            ctl.serial += 1;
            let serial = ctl.serial;
            let poster = ctl.poster.clone();
            info!(command = command.name(), serial, "starting round trip");
            let handle = ctl.transport.start(
                session,
                command,
                Box::new(move |report| {
                    poster.post(completion_event(serial, report));
                }),
            );
            ctl.in_flight = Some(handle);
            ctl.publish(|s| s.phase = phase);
            sm.set_state(state);
        }
        Ok(None) => {
            ctl.enter_idle();
            sm.set_state(ST_IDLE);
        }
        Err(err) => {
            error!(%err, "could not pick next command");
            ctl.publish(|s| s.last_error = Some(err));
            ctl.enter_idle();
            sm.set_state(ST_IDLE);
        }
    }
}

fn do_completed(sm: &mut StateMachine<Control>) {
    if take_current(sm).is_none() {
        return;
    }
    sm.context_mut().publish(|s| s.last_error = None);
    do_pick(sm);
}

fn do_resync(sm: &mut StateMachine<Control>) {
    let Some(report) = take_current(sm) else {
        return;
    };
    warn!(outcome = %report.outcome, "server asked for a hierarchy resync");
    let ctl = sm.context_mut();
    if let Err(err) = ctl.store.transaction(|txn| Ok(begin_full_refresh(txn))) {
        error!(%err, "could not schedule hierarchy refresh");
        ctl.publish(|s| s.last_error = Some(err));
    }
    do_pick(sm);
}

fn do_failed(sm: &mut StateMachine<Control>) {
    let Some(report) = take_current(sm) else {
        return;
    };
    let err = match report.outcome {
        Outcome::HardFail(why) if report.exhausted => SyncError::transport_retryable(format!("server unreachable: {why}")),
        Outcome::OutOfSpace => SyncError::HardFail("server mailbox out of space".into()),
        Outcome::HardFail(why) => SyncError::HardFail(why),
        other => SyncError::HardFail(other.to_string()),
    };
    error!(%err, attempts = report.attempts, "round trip failed");
    let ctl = sm.context_mut();
    ctl.publish(|s| s.last_error = Some(err));
    ctl.enter_idle();
    sm.set_state(ST_IDLE);
}

fn do_park(sm: &mut StateMachine<Control>) {
    let Some(report) = take_current(sm) else {
        return;
    };
    let action = match report.outcome {
        Outcome::AuthFail(why) => SyncError::AuthFail(why),
        Outcome::ReProvision => SyncError::ReProvision,
        Outcome::Rediscover(why) => SyncError::Rediscover(why),
        other => SyncError::HardFail(other.to_string()),
    };
    warn!(%action, "waiting for the user");
    sm.context_mut().publish(|s| {
        s.phase = Phase::NeedsUser;
        s.user_action = Some(action);
    });
    sm.set_state(ST_PARKED);
}

fn do_resolved(sm: &mut StateMachine<Control>) {
    info!("user resolved the parked request");
    sm.context_mut().publish(|s| s.user_action = None);
    do_pick(sm);
}

fn do_tick(sm: &mut StateMachine<Control>) {
    let ctl = sm.context_mut();
    let marked = ctl.store.transaction(|txn| {
        let mut marked = 0;
        for mut folder in txn.folders().into_iter().filter(|f| f.is_syncable() && !f.sync_required) {
            folder.sync_required = true;
            txn.put_folder(folder);
            marked += 1;
        }
        Ok(marked)
    });
    match marked {
        Ok(marked) => debug!(marked, "poll"),
        Err(err) => error!(%err, "could not mark folders for poll"),
    }
    do_pick(sm);
}

fn do_shutdown(sm: &mut StateMachine<Control>) {
    let ctl = sm.context_mut();
    if let Some(handle) = ctl.in_flight.take() {
        handle.cancel();
    }
    ctl.tick = None;
    ctl.publish(|s| s.phase = Phase::Stopped);
    info!("account stopped");
}

fn wait_node(state: StateId) -> Node<Control> {
    use base::{HARD_FAIL, LAUNCH, STOP, SUCCESS, TEMP_FAIL};
    Node::new(state)
        .on_self_set(SUCCESS, do_completed)
        .on_self_set(EV_SYNC_AGAIN, do_completed)
        .on_self_set(EV_FOLDER_RESYNC, do_resync)
        .on_self_set(HARD_FAIL, do_failed)
        .on_self_set(TEMP_FAIL, do_failed)
        .on_self_set(EV_AUTH_FAIL, do_park)
        .on_self_set(EV_RE_PROVISION, do_park)
        .on_self_set(EV_REDISCOVER, do_park)
        .on(EV_SHUTDOWN, do_shutdown, STOP)
        .drop(&[EV_PEND_Q, EV_TICK, EV_USER_RESOLVED])
        .invalid(&[LAUNCH])
}

/// Builds and validates the control machine's table.
pub fn control_table() -> FsmResult<Table<Control>> {
    use base::{LAUNCH, START, STOP};
    let nodes = vec![
        Node::new(START)
            .on_self_set(LAUNCH, do_pick)
            .on(EV_SHUTDOWN, do_shutdown, STOP)
            .drop(&[EV_PEND_Q, EV_TICK, EV_USER_RESOLVED])
            .invalid(&OUTCOME_EVENTS),
        wait_node(ST_FOLDER_SYNC_WAIT),
        wait_node(ST_SYNC_WAIT),
        wait_node(ST_COMMAND_WAIT),
        Node::new(ST_IDLE)
            .on_self_set(EV_PEND_Q, do_pick)
            .on_self_set(EV_TICK, do_tick)
            .on_self_set(EV_USER_RESOLVED, do_pick)
            .on(EV_SHUTDOWN, do_shutdown, STOP)
            .drop(&OUTCOME_EVENTS)
            .invalid(&[LAUNCH]),
        Node::new(ST_PARKED)
            .on_self_set(EV_USER_RESOLVED, do_resolved)
            .on(EV_SHUTDOWN, do_shutdown, STOP)
            .drop(&[EV_PEND_Q, EV_TICK])
            .drop(&OUTCOME_EVENTS)
            .invalid(&[LAUNCH]),
    ];
    Table::new("protocol_control", STATES, EVENTS, nodes)
}

/// Handle on a running account.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    poster: Poster,
    status: watch::Receiver<ControlStatus>,
}

impl ControlHandle {
    /// Polls every folder now.
    pub fn sync_now(&self) {
        self.poster.post(Event::new(EV_TICK, "user"));
    }

    /// Tells the control a pending row was queued. Coalesced.
    pub fn pending_queued(&self) {
        self.poster.post_at_most_one(Event::new(EV_PEND_Q, "edit"));
    }

    /// Resumes a parked account.
    pub fn resolved(&self) {
        self.poster.post(Event::new(EV_USER_RESOLVED, "user"));
    }

    /// Stops the account, cancelling any round trip in flight.
    pub fn shutdown(&self) {
        self.poster
            .post(Event::new(EV_SHUTDOWN, "user").drop_if_stopped());
    }

    /// Latest status.
    pub fn status(&self) -> ControlStatus {
        self.status.borrow().clone()
    }

    /// A receiver for status changes.
    pub fn subscribe(&self) -> watch::Receiver<ControlStatus> {
        self.status.clone()
    }

    /// Waits until the status satisfies `predicate`. Returns `None` if the
    /// control went away first.
    pub async fn wait_for(&self, predicate: impl FnMut(&ControlStatus) -> bool) -> Option<ControlStatus> {
        let mut rx = self.status.clone();
        let status = rx.wait_for(predicate).await.ok()?;
        Some(status.clone())
    }
}

/// Builder for an account's control task.
pub struct ProtocolControl {
    config: SyncConfig,
    store: Arc<dyn ItemStore>,
    client: Arc<dyn HttpClient>,
    codec: Option<Arc<dyn DocumentCodec>>,
}

impl ProtocolControl {
    /// Creates a control for one account.
    pub fn new(config: SyncConfig, store: Arc<dyn ItemStore>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            config,
            store,
            client,
            codec: None,
        }
    }

    /// Registers a binary codec for the transport.
    pub fn with_binary_codec(mut self, codec: Arc<dyn DocumentCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Validates the tables and starts the control on its own task.
    pub fn start(self) -> SyncResult<(ControlHandle, JoinHandle<SyncResult<()>>)> {
        let mut transport = Transport::new(
            self.client,
            self.config.account.clone(),
            self.config.transport.clone(),
        )?;
        if let Some(codec) = self.codec {
            transport = transport.with_binary_codec(codec);
        }
        let table = Arc::new(control_table()?);
        let (poster, mut inbox) = mailbox("protocol_control");
        let (status_tx, status_rx) = watch::channel(ControlStatus::default());

        let control = Control {
            config: self.config,
            store: self.store,
            transport,
            poster: poster.clone(),
            status: status_tx,
            serial: 0,
            in_flight: None,
            tick: None,
        };
        let mut sm = StateMachine::new(table, control);
        info!(
            account = %sm.context().config.account.username,
            id = sm.id(),
            "starting account control"
        );

        let join = tokio::spawn(async move {
            let result = match sm.start() {
                Ok(()) => inbox.drive(&mut sm).await,
                Err(err) => Err(err),
            };
            if let Err(err) = &result {
                error!(%err, "account control failed");
                let ctl = sm.context_mut();
                if let Some(handle) = ctl.in_flight.take() {
                    handle.cancel();
                }
                ctl.publish(|s| {
                    s.phase = Phase::Stopped;
                    s.last_error = Some(SyncError::from(err.clone()));
                });
            }
            result.map_err(SyncError::from)
        });

        Ok((
            ControlHandle {
                poster,
                status: status_rx,
            },
            join,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, TransportConfig};
    use crate::store::MemoryStore;
    use crate::transport::{HttpResponse, MockHttpClient};
    use groupsync_protocol::messages::FolderSyncResponse;
    use groupsync_protocol::{DeltaKind, FolderType, ServerDelta, SyncCursor, XmlCodec, XML_CONTENT_TYPE};

    fn config() -> SyncConfig {
        SyncConfig::new(
            AccountConfig::new(Url::parse("https://mail.example.com/eas").unwrap(), "alice", "dev1")
                .with_password("pw"),
        )
        .with_transport(TransportConfig::new(1))
    }

    fn xml(doc: &groupsync_protocol::Element) -> HttpResponse {
        let body = XmlCodec::new().encode(doc).unwrap();
        HttpResponse::new(200).with_body(XML_CONTENT_TYPE, body)
    }

    #[test]
    fn table_validates() {
        let table = control_table().unwrap();
        assert_eq!(table.state_name(ST_PARKED), "Parked");
        assert_eq!(table.event_name(EV_PEND_Q), "PendQ");
        assert_eq!(table.nodes().len(), 6);
    }

    #[test]
    fn outcome_events() {
        let report = |outcome, exhausted| TransportReport {
            outcome,
            attempts: 1,
            retries_left: 0,
            delays: 0,
            endpoint: None,
            exhausted,
        };
        assert_eq!(completion_event(1, report(Outcome::Success, false)).code, base::SUCCESS);
        assert_eq!(completion_event(1, report(Outcome::HardFail("x".into()), true)).code, base::TEMP_FAIL);
        assert_eq!(completion_event(1, report(Outcome::OutOfSpace, false)).code, base::HARD_FAIL);
        assert_eq!(completion_event(1, report(Outcome::ReProvision, false)).code, EV_RE_PROVISION);
    }

    #[tokio::test(start_paused = true)]
    async fn parks_on_auth_failure_and_resumes() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_response(HttpResponse::new(401));
        let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
        let (handle, join) = ProtocolControl::new(config(), Arc::clone(&store), Arc::clone(&mock) as Arc<dyn HttpClient>)
            .start()
            .unwrap();

        let parked = handle.wait_for(|s| s.phase == Phase::NeedsUser).await.unwrap();
        assert!(matches!(parked.user_action, Some(SyncError::AuthFail(_))));

        mock.push_response(xml(&FolderSyncResponse::success(
            SyncCursor::new("1"),
            vec![ServerDelta::folder(DeltaKind::Add, "2", "0", Some("Notes".into()), Some(FolderType(10)))],
        )
        .to_element()));
        handle.resolved();
        let idle = handle.wait_for(|s| s.phase == Phase::Idle).await.unwrap();
        assert_eq!(idle.user_action, None);
        assert_eq!(idle.round_trips, 2);

        handle.shutdown();
        join.await.unwrap().unwrap();
        assert_eq!(handle.status().phase, Phase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_surfaces_connectivity_error() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_response(HttpResponse::new(502));
        mock.push_response(HttpResponse::new(502));
        let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
        let (handle, join) = ProtocolControl::new(config(), store, Arc::clone(&mock) as Arc<dyn HttpClient>)
            .start()
            .unwrap();

        let idle = handle.wait_for(|s| s.phase == Phase::Idle).await.unwrap();
        let err = idle.last_error.unwrap();
        assert!(err.is_retryable());
        assert_eq!(mock.request_count(), 2);

        handle.shutdown();
        join.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_round_trip() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_hang();
        let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
        let (handle, join) = ProtocolControl::new(config(), store, Arc::clone(&mock) as Arc<dyn HttpClient>)
            .start()
            .unwrap();
        handle.wait_for(|s| s.phase == Phase::FolderSync).await.unwrap();
        handle.shutdown();
        join.await.unwrap().unwrap();
        assert_eq!(handle.status().phase, Phase::Stopped);
        assert_eq!(handle.status().round_trips, 0);
    }
}
