//! HTTP transport sub-machine.
//!
//! One machine per in-flight command. It builds the request once, then
//! sends it until the response classifies as final, racing every attempt
//! against a timeout. Attempts carry a serial; completions and timeouts of
//! superseded attempts are ignored.
//!
//! ```text
//! Start --Launch--> Sending --Final/Cancel--> Stop
//!                    |   ^
//!          TempFail  |   | Resume
//!                    v   |
//!             TempFailRetry / DelayWait
//! ```

use crate::classify::{classify, Disposition, X_MS_CREDENTIALS_EXPIRE};
use crate::command::{Command, Outcome};
use crate::config::{AccountConfig, TransportConfig};
use crate::error::{SyncError, SyncResult};
use crate::fsm::{base, Event, EventId, Node, StateId, StateMachine, Table};
use crate::mailbox::{mailbox, Mailbox, Poster};
use crate::timer::Timer;
use crate::transport::{HttpClient, HttpRequest, HttpResponse, TransportFault};
use bytes::Bytes;
use groupsync_protocol::{DocumentCodec, XmlCodec, WBXML_CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Attempt in flight.
pub const ST_SENDING: StateId = base::FIRST_FREE_STATE;
/// Backing off after a temporary failure.
pub const ST_TEMP_FAIL_RETRY: StateId = base::FIRST_FREE_STATE + 1;
/// Waiting as the server directed.
pub const ST_DELAY_WAIT: StateId = base::FIRST_FREE_STATE + 2;

/// Abandon the request.
pub const EV_CANCEL: EventId = base::FIRST_FREE_EVENT;
/// An attempt completed.
pub const EV_RESPONSE: EventId = base::FIRST_FREE_EVENT + 1;
/// An attempt timed out.
pub const EV_TIMEOUT: EventId = base::FIRST_FREE_EVENT + 2;
/// The server asked for a delay.
pub const EV_DELAY: EventId = base::FIRST_FREE_EVENT + 3;
/// The server moved the mailbox.
pub const EV_REDIRECT: EventId = base::FIRST_FREE_EVENT + 4;
/// A backoff or delay elapsed.
pub const EV_RESUME: EventId = base::FIRST_FREE_EVENT + 5;
/// The round trip is over.
pub const EV_FINAL: EventId = base::FIRST_FREE_EVENT + 6;

const STATES: &[(StateId, &str)] = &[
    (ST_SENDING, "Sending"),
    (ST_TEMP_FAIL_RETRY, "TempFailRetry"),
    (ST_DELAY_WAIT, "DelayWait"),
];

const EVENTS: &[(EventId, &str)] = &[
    (EV_CANCEL, "Cancel"),
    (EV_RESPONSE, "Response"),
    (EV_TIMEOUT, "Timeout"),
    (EV_DELAY, "Delay"),
    (EV_REDIRECT, "Redirect"),
    (EV_RESUME, "Resume"),
    (EV_FINAL, "Final"),
];

const MAX_REDIRECTS: u32 = 3;

/// Where and how to talk to the server for one command.
#[derive(Debug, Clone)]
pub struct Session {
    /// Endpoint.
    pub endpoint: Url,
    /// Device policy key.
    pub policy_key: Option<String>,
    /// Protocol version header.
    pub protocol_version: String,
}

impl Session {
    /// Creates a session for `endpoint`.
    pub fn new(endpoint: Url, protocol_version: impl Into<String>) -> Self {
        Self {
            endpoint,
            policy_key: None,
            protocol_version: protocol_version.into(),
        }
    }

    /// Sets the policy key.
    pub fn with_policy_key(mut self, key: impl Into<String>) -> Self {
        self.policy_key = Some(key.into());
        self
    }
}

/// Result of a finished round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportReport {
    /// How it ended.
    pub outcome: Outcome,
    /// Requests sent.
    pub attempts: u32,
    /// Retry budget left.
    pub retries_left: u32,
    /// Server-directed delays honoured.
    pub delays: u32,
    /// New endpoint, if a relocation was followed and the server there
    /// answered.
    pub endpoint: Option<Url>,
    /// The retry budget ran out.
    pub exhausted: bool,
}

/// Callback receiving the report. Never called on cancel.
pub type ReportSink = Box<dyn FnOnce(TransportReport) + Send>;

struct AttemptResult {
    serial: u64,
    result: Result<HttpResponse, TransportFault>,
}

/// Context of one transport machine.
pub struct HttpOp {
    client: Arc<dyn HttpClient>,
    account: AccountConfig,
    config: TransportConfig,
    xml: XmlCodec,
    wbxml: Option<Arc<dyn DocumentCodec>>,
    session: Session,
    command: Box<dyn Command>,
    body: Bytes,
    content_type: Option<&'static str>,
    poster: Poster,
    serial: u64,
    attempts: u32,
    retries_left: u32,
    delays: u32,
    timeouts: u32,
    redirects: u32,
    relocated: bool,
    confirmed_endpoint: Option<Url>,
    processed: bool,
    exhausted: bool,
    in_flight: Option<CancellationToken>,
    timeout_timer: Option<Timer>,
    wait_timer: Option<Timer>,
    on_done: Option<ReportSink>,
}

impl HttpOp {
    fn request_codec(&self) -> &dyn DocumentCodec {
        match &self.wbxml {
            Some(codec) if self.account.prefer_wbxml => codec.as_ref(),
            _ => &self.xml,
        }
    }

    fn prepare_body(&mut self) -> SyncResult<()> {
        if let Some(doc) = self.command.build_request()? {
            let codec = self.request_codec();
            let content_type = codec.content_type();
            let body = codec.encode(&doc)?;
            self.body = body;
            self.content_type = Some(content_type);
        }
        Ok(())
    }

    fn build_http_request(&self) -> HttpRequest {
        let mut url = self.session.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("Cmd", self.command.name())
            .append_pair("User", &self.account.username)
            .append_pair("DeviceId", &self.account.device_id)
            .append_pair("DeviceType", &self.account.device_type);

        let mut request = HttpRequest::post(url, self.body.clone());
        request.headers.insert("User-Agent", &self.account.user_agent);
        request
            .headers
            .insert("MS-ASProtocolVersion", &self.session.protocol_version);
        if let Some(key) = &self.session.policy_key {
            request.headers.insert("X-MS-PolicyKey", key);
        }
        if let Some(content_type) = self.content_type {
            request.headers.insert("Content-Type", content_type);
        }
        // Credentials only ever travel over TLS.
        if self.session.endpoint.scheme() == "https" {
            request.basic_auth = Some((self.account.username.clone(), self.account.password.clone()));
        }
        request
    }

    fn abort_attempt(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
        self.timeout_timer = None;
    }

    fn confirm_endpoint(&mut self) {
        if self.relocated {
            self.confirmed_endpoint = Some(self.session.endpoint.clone());
        }
    }

    fn handle_response(&mut self, response: HttpResponse) -> Event {
        if let Some(days) = response.headers.get(X_MS_CREDENTIALS_EXPIRE) {
            warn!(command = self.command.name(), days, "password expires soon");
        }
        info!(
            command = self.command.name(),
            attempt = self.attempts,
            status = response.status,
            "response"
        );
        match classify(response.status, &response.headers, &self.config) {
            Disposition::Parse => {
                self.confirm_endpoint();
                self.parse(response)
            }
            Disposition::Finish(outcome) => {
                if matches!(
                    outcome,
                    Outcome::Resync(_) | Outcome::ReProvision | Outcome::OutOfSpace
                ) {
                    self.confirm_endpoint();
                }
                final_event(outcome, "status")
            }
            Disposition::Redirect(url) => Event::new(EV_REDIRECT, "relocate").with_arg(url),
            Disposition::TempFail { backoff, reason } => Event::new(base::TEMP_FAIL, "status")
                .with_arg(backoff)
                .with_message(reason),
            Disposition::Delay { delay, throttled } => {
                Event::new(EV_DELAY, "status").with_arg((delay, throttled))
            }
        }
    }

    fn parse(&mut self, response: HttpResponse) -> Event {
        if response.body.is_empty() {
            return self.process(None);
        }
        let decoded = match response.content_type() {
            Some(WBXML_CONTENT_TYPE) => match &self.wbxml {
                Some(codec) => codec.decode(&response.body),
                None => Err(groupsync_protocol::ProtocolError::codec(
                    "binary response but no binary codec registered",
                )),
            },
            _ => self.xml.decode(&response.body),
        };
        let doc = match decoded {
            Ok(doc) => doc,
            Err(err) => {
                return Event::new(base::TEMP_FAIL, "decode")
                    .with_arg(self.config.temp_fail_backoff)
                    .with_message(err.to_string())
            }
        };

        if let Ok(Some(status)) = doc.parse_child::<u32>("Status") {
            if let Some(outcome) = self.command.process_top_level_status(status) {
                debug!(command = self.command.name(), status, %outcome, "top-level status");
                return final_event(outcome, "top-level-status");
            }
        }
        self.process(Some(&doc))
    }

    fn process(&mut self, doc: Option<&groupsync_protocol::Element>) -> Event {
        self.processed = true;
        let outcome = match self.command.process_response(doc) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(command = self.command.name(), %err, "response processing failed");
                Outcome::HardFail(err.to_string())
            }
        };
        final_event(outcome, "processed")
    }

    fn finish(&mut self, outcome: Outcome) {
        self.abort_attempt();
        self.wait_timer = None;
        if !self.processed {
            self.command.on_abandon();
        }
        let report = TransportReport {
            outcome,
            attempts: self.attempts,
            retries_left: self.retries_left,
            delays: self.delays,
            endpoint: self.confirmed_endpoint.clone(),
            exhausted: self.exhausted,
        };
        info!(
            command = self.command.name(),
            attempts = report.attempts,
            retries_left = report.retries_left,
            outcome = %report.outcome,
            "round trip finished"
        );
        if let Some(done) = self.on_done.take() {
            done(report);
        }
    }

    fn schedule_resume(&mut self, name: &'static str, after: Duration) {
        let poster = self.poster.clone();
        self.wait_timer = Some(Timer::schedule(name, after, move || {
            poster.post(Event::new(EV_RESUME, name).drop_if_stopped());
        }));
    }
}

fn final_event(outcome: Outcome, mnemonic: &'static str) -> Event {
    Event::new(EV_FINAL, mnemonic).with_arg(outcome)
}

fn send_attempt(sm: &mut StateMachine<HttpOp>) {
    let op = sm.context_mut();
    op.abort_attempt();
    op.serial += 1;
    op.attempts += 1;
    let serial = op.serial;
    let request = op.build_http_request();
    let timeout = op.config.timeout_after(op.timeouts);
    info!(
        command = op.command.name(),
        attempt = op.attempts,
        url = %request.url,
        timeout_ms = timeout.as_millis() as u64,
        "sending"
    );

    let token = CancellationToken::new();
    let cancelled = token.child_token();
    op.in_flight = Some(token);
    let client = Arc::clone(&op.client);
    let poster = op.poster.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            result = client.send(request) => {
                poster.post(
                    Event::new(EV_RESPONSE, "network")
                        .with_arg(AttemptResult { serial, result })
                        .drop_if_stopped(),
                );
            }
        }
    });

    let poster = op.poster.clone();
    op.timeout_timer = Some(Timer::schedule("http-timeout", timeout, move || {
        poster.post(Event::new(EV_TIMEOUT, "timer").with_arg(serial).drop_if_stopped());
    }));
}

fn do_launch(sm: &mut StateMachine<HttpOp>) {
    let op = sm.context_mut();
    match op.prepare_body() {
        Ok(()) => send_attempt(sm),
        Err(err) => {
            let name = op.command.name();
            sm.enqueue(final_event(
                Outcome::HardFail(format!("building {name} request: {err}")),
                "build",
            ));
        }
    }
}

fn do_response(sm: &mut StateMachine<HttpOp>) {
    let Some(attempt) = sm.take_arg::<AttemptResult>() else {
        error!("response event without result");
        return;
    };
    let op = sm.context_mut();
    if attempt.serial != op.serial {
        debug!(serial = attempt.serial, current = op.serial, "stale response ignored");
        return;
    }
    op.in_flight = None;
    op.timeout_timer = None;

    let next = match attempt.result {
        Ok(response) => op.handle_response(response),
        Err(fault) if fault.is_retryable() => {
            warn!(command = op.command.name(), attempt = op.attempts, %fault, "transport fault");
            Event::new(base::TEMP_FAIL, "fault")
                .with_arg(op.config.temp_fail_backoff)
                .with_message(fault.to_string())
        }
        Err(fault) => final_event(Outcome::HardFail(fault.to_string()), "fault"),
    };
    sm.enqueue(next);
}

fn do_timeout(sm: &mut StateMachine<HttpOp>) {
    let serial = sm.arg::<u64>().copied().unwrap_or_default();
    let op = sm.context_mut();
    if serial != op.serial {
        debug!(serial, current = op.serial, "stale timeout ignored");
        return;
    }
    op.abort_attempt();
    op.timeouts += 1;
    warn!(command = op.command.name(), attempt = op.attempts, "attempt timed out");
    sm.enqueue(
        Event::new(base::TEMP_FAIL, "timeout")
            .with_arg(Duration::ZERO)
            .with_message("timeout"),
    );
}

fn do_temp_fail(sm: &mut StateMachine<HttpOp>) {
    let backoff = sm.take_arg::<Duration>().unwrap_or_default();
    let reason = sm.event_message().unwrap_or("temporary failure").to_string();
    let op = sm.context_mut();
    if op.retries_left == 0 {
        warn!(command = op.command.name(), attempts = op.attempts, %reason, "retry budget exhausted");
        op.exhausted = true;
        op.finish(Outcome::HardFail(format!("retry budget exhausted: {reason}")));
        sm.set_state(base::STOP);
        return;
    }
    op.retries_left -= 1;
    warn!(
        command = op.command.name(),
        attempt = op.attempts,
        retries_left = op.retries_left,
        delay_ms = backoff.as_millis() as u64,
        %reason,
        "temporary failure"
    );
    if backoff.is_zero() {
        send_attempt(sm);
    } else {
        op.schedule_resume("http-backoff", backoff);
        sm.set_state(ST_TEMP_FAIL_RETRY);
    }
}

fn do_delay(sm: &mut StateMachine<HttpOp>) {
    let (delay, throttled) = sm.take_arg::<(Duration, bool)>().unwrap_or_default();
    let op = sm.context_mut();
    if op.delays >= op.config.max_delays {
        op.exhausted = true;
        op.finish(Outcome::HardFail(format!(
            "server asked to wait {} times",
            op.delays + 1
        )));
        sm.set_state(base::STOP);
        return;
    }
    op.delays += 1;
    info!(
        command = op.command.name(),
        delay_ms = delay.as_millis() as u64,
        throttled,
        "server-directed delay"
    );
    op.schedule_resume("http-delay", delay);
    sm.set_state(ST_DELAY_WAIT);
}

fn do_redirect(sm: &mut StateMachine<HttpOp>) {
    let Some(url) = sm.take_arg::<Url>() else {
        error!("redirect event without location");
        return;
    };
    let op = sm.context_mut();
    if op.redirects >= MAX_REDIRECTS {
        sm.enqueue(final_event(
            Outcome::Rediscover(format!("more than {MAX_REDIRECTS} relocations")),
            "relocate",
        ));
        return;
    }
    op.redirects += 1;
    info!(from = %op.session.endpoint, to = %url, "following relocation");
    op.session.endpoint = url;
    op.relocated = true;
    send_attempt(sm);
}

fn do_resume(sm: &mut StateMachine<HttpOp>) {
    sm.context_mut().wait_timer = None;
    send_attempt(sm);
}

fn do_final(sm: &mut StateMachine<HttpOp>) {
    let outcome = sm
        .take_arg::<Outcome>()
        .unwrap_or_else(|| Outcome::HardFail("final event without outcome".into()));
    sm.context_mut().finish(outcome);
}

fn do_cancel(sm: &mut StateMachine<HttpOp>) {
    let op = sm.context_mut();
    info!(command = op.command.name(), attempts = op.attempts, "cancelled");
    op.abort_attempt();
    op.wait_timer = None;
    op.on_done = None;
    op.command.on_abandon();
}

/// Builds and validates the transport machine's table.
pub fn http_table() -> crate::fsm::FsmResult<Table<HttpOp>> {
    use base::{HARD_FAIL, LAUNCH, STOP, SUCCESS, TEMP_FAIL};
    let nodes = vec![
        Node::new(base::START)
            .on(LAUNCH, do_launch, ST_SENDING)
            .on(EV_CANCEL, do_cancel, STOP)
            .invalid(&[
                SUCCESS,
                HARD_FAIL,
                TEMP_FAIL,
                EV_RESPONSE,
                EV_TIMEOUT,
                EV_DELAY,
                EV_REDIRECT,
                EV_RESUME,
                EV_FINAL,
            ]),
        Node::new(ST_SENDING)
            .on_self_set(EV_RESPONSE, do_response)
            .on_self_set(EV_TIMEOUT, do_timeout)
            .on_self_set(TEMP_FAIL, do_temp_fail)
            .on_self_set(EV_DELAY, do_delay)
            .on(EV_REDIRECT, do_redirect, ST_SENDING)
            .on(EV_FINAL, do_final, STOP)
            .on(EV_CANCEL, do_cancel, STOP)
            .drop(&[EV_RESUME])
            .invalid(&[LAUNCH, SUCCESS, HARD_FAIL]),
        Node::new(ST_TEMP_FAIL_RETRY)
            .on(EV_RESUME, do_resume, ST_SENDING)
            .on(EV_CANCEL, do_cancel, STOP)
            .drop(&[EV_RESPONSE, EV_TIMEOUT])
            .invalid(&[LAUNCH, SUCCESS, HARD_FAIL, TEMP_FAIL, EV_DELAY, EV_REDIRECT, EV_FINAL]),
        Node::new(ST_DELAY_WAIT)
            .on(EV_RESUME, do_resume, ST_SENDING)
            .on(EV_CANCEL, do_cancel, STOP)
            .drop(&[EV_RESPONSE, EV_TIMEOUT])
            .invalid(&[LAUNCH, SUCCESS, HARD_FAIL, TEMP_FAIL, EV_DELAY, EV_REDIRECT, EV_FINAL]),
    ];
    Table::new("http_op", STATES, EVENTS, nodes)
}

/// Handle on a running transport machine.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    poster: Poster,
    machine_id: u64,
}

impl TransportHandle {
    /// Cancels the round trip. The report callback is not called.
    pub fn cancel(&self) {
        self.poster
            .post(Event::new(EV_CANCEL, "owner").drop_if_stopped());
    }

    /// Returns true once the machine has stopped.
    pub fn is_finished(&self) -> bool {
        self.poster.is_closed()
    }

    /// Machine instance id.
    pub fn machine_id(&self) -> u64 {
        self.machine_id
    }
}

/// Factory for transport machines sharing one client and table.
pub struct Transport {
    client: Arc<dyn HttpClient>,
    account: AccountConfig,
    config: TransportConfig,
    wbxml: Option<Arc<dyn DocumentCodec>>,
    table: Arc<Table<HttpOp>>,
}

impl Transport {
    /// Creates a transport. Fails if the machine table does not validate.
    pub fn new(
        client: Arc<dyn HttpClient>,
        account: AccountConfig,
        config: TransportConfig,
    ) -> SyncResult<Self> {
        Ok(Self {
            client,
            account,
            config,
            wbxml: None,
            table: Arc::new(http_table()?),
        })
    }

    /// Registers a binary codec, used for requests when the account
    /// prefers it and for responses that declare it.
    pub fn with_binary_codec(mut self, codec: Arc<dyn DocumentCodec>) -> Self {
        self.wbxml = Some(codec);
        self
    }

    /// Account this transport talks for.
    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    fn machine(
        &self,
        session: Session,
        command: Box<dyn Command>,
        on_done: ReportSink,
    ) -> (StateMachine<HttpOp>, Mailbox, Poster) {
        let (poster, inbox) = mailbox("http_op");
        let op = HttpOp {
            client: Arc::clone(&self.client),
            account: self.account.clone(),
            config: self.config.clone(),
            xml: XmlCodec::new(),
            wbxml: self.wbxml.clone(),
            session,
            command,
            body: Bytes::new(),
            content_type: None,
            poster: poster.clone(),
            serial: 0,
            attempts: 0,
            retries_left: self.config.max_retries,
            delays: 0,
            timeouts: 0,
            redirects: 0,
            relocated: false,
            confirmed_endpoint: None,
            processed: false,
            exhausted: false,
            in_flight: None,
            timeout_timer: None,
            wait_timer: None,
            on_done: Some(on_done),
        };
        (StateMachine::new(Arc::clone(&self.table), op), inbox, poster)
    }

    /// Starts a round trip on its own task. `on_done` receives the report
    /// unless the round trip is cancelled.
    pub fn start(&self, session: Session, command: Box<dyn Command>, on_done: ReportSink) -> TransportHandle {
        let (mut sm, mut inbox, poster) = self.machine(session, command, on_done);
        let handle = TransportHandle {
            poster,
            machine_id: sm.id(),
        };

        tokio::spawn(async move {
            let result = match sm.start() {
                Ok(()) => inbox.drive(&mut sm).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                error!(%err, "transport machine failed");
                let err = SyncError::from(err);
                sm.context_mut().finish(Outcome::HardFail(err.to_string()));
            }
        });
        handle
    }

    /// Runs a round trip to completion.
    pub async fn run(&self, session: Session, command: Box<dyn Command>) -> Option<TransportReport> {
        let (tx, rx) = oneshot::channel();
        self.start(
            session,
            command,
            Box::new(move |report| {
                let _ = tx.send(report);
            }),
        );
        rx.await.ok()
    }
}
