//! Sans-IO connection state machine.
//!
//! Every input carries the caller's monotonic `now`; every output is a
//! [`Command`] for the driver to execute. Timers live here as one slot per
//! [`TimerKind`], so starting a timer replaces any earlier one of the same
//! kind and there are never two competing reconnect timers.
//!
//! Two guards keep late callbacks harmless:
//! - transport events are matched against the current [`SessionId`]
//! - timers are stamped with the epoch they were started in; `connect`,
//!   every new attempt and `disconnect` bump the epoch

use std::collections::BTreeMap;
use std::time::Duration;

use fleetview_env::{Channel, Credential, SessionId, SnapshotRequest, TransportEvent};

use super::{ConfigError, ConnectionState, ConnectionStatus, ConnectionTarget, TerminalError};
use crate::config::ConnectionConfig;

/// The timers the machine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Fixed delay before the next attempt
    Reconnect,
    /// One-shot re-send of the snapshot request
    SnapshotRetry,
    /// Clears the UI "connecting" flag
    ConnectingSoftTimeout,
    /// Pause between teardown and reconnect on a manual reconnect
    ManualReconnectGrace,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Duration,
    epoch: u64,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a handshake; report back through `on_opened` / `on_open_failed`
    Open { epoch: u64, credential: Credential },
    Subscribe(Channel),
    Unsubscribe(Channel),
    RequestSnapshot(SnapshotRequest),
    /// Close the current transport session
    Close,
    /// A frame arrived on the active channel; merge it
    Deliver(Vec<u8>),
    /// Publish a new status
    Status(ConnectionStatus),
}

/// Connection lifecycle for one client.
pub struct ConnectionMachine {
    config: ConnectionConfig,
    target: Option<ConnectionTarget>,
    credential: Option<Credential>,

    state: ConnectionState,
    connecting: bool,
    attempts: u32,
    epoch: u64,
    session: Option<SessionId>,
    channel: Option<Channel>,

    snapshot_received: bool,
    snapshot_retried: bool,

    timers: BTreeMap<TimerKind, Timer>,
    last_error: Option<String>,
    terminal: Option<TerminalError>,
    published: ConnectionStatus,
}

impl ConnectionMachine {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            target: None,
            credential: None,
            state: ConnectionState::Disconnected,
            connecting: false,
            attempts: 0,
            epoch: 0,
            session: None,
            channel: None,
            snapshot_received: false,
            snapshot_retried: false,
            timers: BTreeMap::new(),
            last_error: None,
            terminal: None,
            published: ConnectionStatus::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn target(&self) -> Option<&ConnectionTarget> {
        self.target.as_ref()
    }

    pub fn terminal_error(&self) -> Option<&TerminalError> {
        self.terminal.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            connecting: self.connecting,
            attempts: self.attempts,
            channel: self.channel.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Deadline of one pending timer.
    pub fn timer_deadline(&self, kind: TimerKind) -> Option<Duration> {
        self.timers.get(&kind).map(|t| t.deadline)
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.values().map(|t| t.deadline).min()
    }

    /// Starts watching a target.
    ///
    /// Validates synchronously; on error nothing changes and no attempt is
    /// made. A live connection is torn down first.
    pub fn connect(
        &mut self,
        target: ConnectionTarget,
        credential: Option<Credential>,
        now: Duration,
    ) -> Result<Vec<Command>, ConfigError> {
        let credential = credential.ok_or(ConfigError::MissingCredential)?;
        target.validate()?;

        let mut commands = Vec::new();
        self.teardown(&mut commands);
        self.target = Some(target);
        self.credential = Some(credential);
        self.attempts = 0;
        self.last_error = None;
        self.terminal = None;
        self.begin_attempt(now, &mut commands);
        Ok(commands)
    }

    /// Intentional teardown.
    ///
    /// Pins the attempt counter at the maximum and bumps the epoch, so a
    /// reconnect timer that is somehow still in flight can never start an
    /// attempt. Cached locations are untouched.
    pub fn disconnect(&mut self, _now: Duration) -> Vec<Command> {
        let mut commands = Vec::new();
        self.shutdown(&mut commands);
        self.push_status(&mut commands);
        commands
    }

    /// Resets the budget, tears down, and reconnects after the grace delay.
    ///
    /// `new_target` replaces the current target; this is how a client
    /// switches which vehicle or order it watches. Also clears `Failed`.
    pub fn reconnect(
        &mut self,
        new_target: Option<ConnectionTarget>,
        now: Duration,
    ) -> Result<Vec<Command>, ConfigError> {
        if self.credential.is_none() {
            return Err(ConfigError::MissingCredential);
        }
        match new_target {
            Some(target) => {
                target.validate()?;
                self.target = Some(target);
            }
            None => {
                self.target.as_ref().ok_or(ConfigError::MissingTarget)?.validate()?;
            }
        }

        let mut commands = Vec::new();
        self.shutdown(&mut commands);
        self.attempts = 0;
        self.last_error = None;
        self.terminal = None;
        self.start_timer(TimerKind::ManualReconnectGrace, self.config.manual_reconnect_grace, now);
        tracing::info!(
            epoch = self.epoch,
            grace_ms = self.config.manual_reconnect_grace.as_millis() as u64,
            "Manual reconnect requested"
        );
        self.push_status(&mut commands);
        Ok(commands)
    }

    /// The driver's `open()` for attempt `epoch` returned a session.
    pub fn on_opened(&mut self, epoch: u64, session: SessionId) -> Vec<Command> {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            tracing::debug!(epoch, current = self.epoch, %session, "Ignoring session from superseded attempt");
            return Vec::new();
        }
        self.session = Some(session);
        Vec::new()
    }

    /// The driver's `open()` for attempt `epoch` failed outright.
    pub fn on_open_failed(&mut self, epoch: u64, reason: &str, now: Duration) -> Vec<Command> {
        if epoch != self.epoch {
            return Vec::new();
        }
        self.fail(reason.to_string(), now)
    }

    /// Local send/subscribe failure on the live session.
    pub fn on_transport_error(&mut self, reason: &str, now: Duration) -> Vec<Command> {
        self.fail(reason.to_string(), now)
    }

    /// Handles one transport event.
    pub fn on_event(&mut self, event: TransportEvent, now: Duration) -> Vec<Command> {
        if self.session != Some(event.session()) {
            tracing::debug!(
                session = %event.session(),
                epoch = self.epoch,
                "Ignoring event from superseded session"
            );
            return Vec::new();
        }

        match event {
            TransportEvent::Connected { session } => self.on_connected(session, now),
            TransportEvent::Message { channel, payload, .. } => self.on_message(channel, payload),
            TransportEvent::ErrorFrame { message, .. } => self.fail(format!("server error: {message}"), now),
            TransportEvent::Failed { reason, .. } => self.fail(reason, now),
            TransportEvent::Closed { graceful: true, .. } => self.on_graceful_close(),
            TransportEvent::Closed { graceful: false, .. } => self.fail("connection lost".to_string(), now),
        }
    }

    /// Fires every timer due at `now`.
    pub fn on_timers(&mut self, now: Duration) -> Vec<Command> {
        let due: Vec<(TimerKind, Timer)> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(kind, timer)| (*kind, *timer))
            .collect();

        let mut commands = Vec::new();
        for (kind, timer) in due {
            self.timers.remove(&kind);
            if timer.epoch != self.epoch {
                tracing::debug!(?kind, epoch = timer.epoch, current = self.epoch, "Dropping stale timer");
                continue;
            }

            match kind {
                TimerKind::Reconnect => {
                    if self.state == ConnectionState::Reconnecting
                        && self.attempts < self.config.max_reconnect_attempts
                    {
                        tracing::info!(attempt = self.attempts + 1, "Reconnecting");
                        self.begin_attempt(now, &mut commands);
                    }
                }
                TimerKind::SnapshotRetry => {
                    if self.state == ConnectionState::Connected && !self.snapshot_received && !self.snapshot_retried {
                        self.snapshot_retried = true;
                        if let Some(channel) = &self.channel {
                            tracing::debug!(channel = %channel, "No snapshot yet, requesting again");
                            commands.push(Command::RequestSnapshot(channel.snapshot_request()));
                        }
                    }
                }
                TimerKind::ConnectingSoftTimeout => {
                    if self.connecting {
                        self.connecting = false;
                        tracing::debug!(epoch = self.epoch, "Handshake slow, showing cached data");
                        self.push_status(&mut commands);
                    }
                }
                TimerKind::ManualReconnectGrace => {
                    if self.state == ConnectionState::Disconnected && self.target.is_some() {
                        self.begin_attempt(now, &mut commands);
                    }
                }
            }
        }
        commands
    }

    fn on_connected(&mut self, session: SessionId, now: Duration) -> Vec<Command> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        let mut commands = Vec::new();
        let Some(channel) = self.target.as_ref().and_then(ConnectionTarget::channel) else {
            return self.fail("no target to subscribe to".to_string(), now);
        };

        self.state = ConnectionState::Connected;
        self.connecting = false;
        self.attempts = 0;
        self.last_error = None;
        self.timers.remove(&TimerKind::ConnectingSoftTimeout);
        self.snapshot_received = false;
        self.snapshot_retried = false;
        self.channel = Some(channel.clone());

        tracing::info!(%session, channel = %channel, "Connected, subscribing");
        commands.push(Command::Subscribe(channel.clone()));
        commands.push(Command::RequestSnapshot(channel.snapshot_request()));
        self.start_timer(TimerKind::SnapshotRetry, self.config.snapshot_retry_after, now);
        self.push_status(&mut commands);
        commands
    }

    fn on_message(&mut self, channel: Channel, payload: Vec<u8>) -> Vec<Command> {
        if self.state != ConnectionState::Connected || self.channel.as_ref() != Some(&channel) {
            tracing::debug!(channel = %channel, "Ignoring frame for inactive channel");
            return Vec::new();
        }
        if !self.snapshot_received {
            self.snapshot_received = true;
            self.timers.remove(&TimerKind::SnapshotRetry);
        }
        vec![Command::Deliver(payload)]
    }

    fn on_graceful_close(&mut self) -> Vec<Command> {
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Vec::new();
        }
        self.session = None;
        self.channel = None;
        self.connecting = false;
        self.timers.clear();
        self.state = ConnectionState::Disconnected;
        tracing::info!(epoch = self.epoch, "Server closed the connection");

        let mut commands = Vec::new();
        self.push_status(&mut commands);
        commands
    }

    /// Transport or protocol failure on the live attempt.
    fn fail(&mut self, reason: String, now: Duration) -> Vec<Command> {
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Vec::new();
        }

        let mut commands = Vec::new();
        self.teardown(&mut commands);
        self.attempts += 1;

        if self.attempts >= self.config.max_reconnect_attempts {
            let terminal = TerminalError {
                attempts: self.attempts,
                reason,
            };
            tracing::error!(attempts = self.attempts, error = %terminal, "Giving up on live connection");
            self.last_error = Some(terminal.to_string());
            self.terminal = Some(terminal);
            self.state = ConnectionState::Failed;
        } else {
            tracing::info!(
                attempt = self.attempts,
                max = self.config.max_reconnect_attempts,
                delay_ms = self.config.reconnect_interval.as_millis() as u64,
                reason = %reason,
                "Connection failed, scheduling reconnect"
            );
            self.last_error = Some(reason);
            self.state = ConnectionState::Reconnecting;
            self.start_timer(TimerKind::Reconnect, self.config.reconnect_interval, now);
        }

        self.push_status(&mut commands);
        commands
    }

    fn begin_attempt(&mut self, now: Duration, commands: &mut Vec<Command>) {
        self.epoch += 1;
        self.session = None;
        self.timers.remove(&TimerKind::Reconnect);
        self.timers.remove(&TimerKind::ManualReconnectGrace);

        let Some(credential) = self.credential.clone() else {
            self.state = ConnectionState::Disconnected;
            self.push_status(commands);
            return;
        };

        self.state = ConnectionState::Connecting;
        self.connecting = true;
        commands.push(Command::Open {
            epoch: self.epoch,
            credential,
        });
        self.start_timer(TimerKind::ConnectingSoftTimeout, self.config.connecting_soft_timeout, now);
        self.push_status(commands);
    }

    /// Drops subscription and session; cancels the per-session timers.
    fn teardown(&mut self, commands: &mut Vec<Command>) {
        if let Some(channel) = self.channel.take() {
            commands.push(Command::Unsubscribe(channel));
        }
        if self.session.take().is_some() {
            commands.push(Command::Close);
        }
        self.connecting = false;
        self.snapshot_received = false;
        self.snapshot_retried = false;
        self.timers.remove(&TimerKind::SnapshotRetry);
        self.timers.remove(&TimerKind::ConnectingSoftTimeout);
    }

    fn shutdown(&mut self, commands: &mut Vec<Command>) {
        self.teardown(commands);
        self.attempts = self.config.max_reconnect_attempts;
        self.epoch += 1;
        self.timers.clear();
        self.state = ConnectionState::Disconnected;
        tracing::info!(epoch = self.epoch, "Disconnected");
    }

    fn start_timer(&mut self, kind: TimerKind, after: Duration, now: Duration) {
        self.timers.insert(
            kind,
            Timer {
                deadline: now + after,
                epoch: self.epoch,
            },
        );
    }

    fn push_status(&mut self, commands: &mut Vec<Command>) {
        let status = self.status();
        if status != self.published {
            self.published = status.clone();
            commands.push(Command::Status(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn cred() -> Option<Credential> {
        Credential::new("token")
    }

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ConnectionConfig::default())
    }

    /// Runs the `Open` command in `commands` the way the driver would.
    fn open(m: &mut ConnectionMachine, commands: &[Command], session: u64) -> SessionId {
        let epoch = commands
            .iter()
            .find_map(|c| match c {
                Command::Open { epoch, .. } => Some(*epoch),
                _ => None,
            })
            .expect("expected an Open command");
        let session = SessionId(session);
        m.on_opened(epoch, session);
        session
    }

    fn has_open(commands: &[Command]) -> bool {
        commands.iter().any(|c| matches!(c, Command::Open { .. }))
    }

    fn connected(m: &mut ConnectionMachine, target: ConnectionTarget, now: Duration) -> (SessionId, Vec<Command>) {
        let commands = m.connect(target, cred(), now).unwrap();
        let session = open(m, &commands, 1);
        let commands = m.on_event(TransportEvent::Connected { session }, now);
        (session, commands)
    }

    #[test]
    fn test_connect_requires_credential() {
        let mut m = machine();
        let err = m.connect(ConnectionTarget::vehicle("v1"), None, secs(0)).unwrap_err();
        assert_eq!(err, ConfigError::MissingCredential);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.epoch(), 0);
    }

    #[test]
    fn test_connect_requires_target() {
        let mut m = machine();
        let err = m.connect(ConnectionTarget::default(), cred(), secs(0)).unwrap_err();
        assert_eq!(err, ConfigError::MissingTarget);
        assert!(m.next_deadline().is_none());
    }

    #[test]
    fn test_handshake_subscribes_one_channel_and_requests_snapshot() {
        let mut m = machine();
        let target = ConnectionTarget::new(Some("v1".into()), Some("o1".into()));
        let (_, commands) = connected(&mut m, target, secs(0));

        let subscriptions: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                Command::Subscribe(ch) => Some(ch.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(subscriptions, vec![Channel::Vehicle("v1".into())]);
        assert!(commands.contains(&Command::RequestSnapshot(SnapshotRequest::Vehicle {
            vehicle_id: "v1".into()
        })));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.timer_deadline(TimerKind::SnapshotRetry), Some(secs(3)));
        assert!(m.timer_deadline(TimerKind::ConnectingSoftTimeout).is_none());
    }

    #[test]
    fn test_snapshot_retried_exactly_once() {
        let mut m = machine();
        connected(&mut m, ConnectionTarget::order("o1"), secs(0));

        let commands = m.on_timers(secs(3));
        assert_eq!(
            commands,
            vec![Command::RequestSnapshot(SnapshotRequest::Order { order_id: "o1".into() })]
        );
        assert!(m.timer_deadline(TimerKind::SnapshotRetry).is_none());
        assert!(m.on_timers(secs(60)).is_empty());
    }

    #[test]
    fn test_snapshot_not_retried_after_data() {
        let mut m = machine();
        let (session, _) = connected(&mut m, ConnectionTarget::vehicle("v1"), secs(0));

        let commands = m.on_event(
            TransportEvent::Message {
                session,
                channel: Channel::Vehicle("v1".into()),
                payload: b"[]".to_vec(),
            },
            secs(1),
        );
        assert_eq!(commands, vec![Command::Deliver(b"[]".to_vec())]);
        assert!(m.on_timers(secs(3)).is_empty());
    }

    #[test]
    fn test_frames_for_other_channels_ignored() {
        let mut m = machine();
        let (session, _) = connected(&mut m, ConnectionTarget::vehicle("v1"), secs(0));
        let commands = m.on_event(
            TransportEvent::Message {
                session,
                channel: Channel::Vehicle("v2".into()),
                payload: b"[]".to_vec(),
            },
            secs(1),
        );
        assert!(commands.is_empty());
    }

    #[test]
    fn test_reconnect_budget_exhausts_into_failed() {
        let mut m = machine();
        let max = ConnectionConfig::default().max_reconnect_attempts;
        let mut now = secs(0);
        let mut commands = m.connect(ConnectionTarget::vehicle("v1"), cred(), now).unwrap();

        for attempt in 1..=max {
            let session = open(&mut m, &commands, attempt as u64);
            m.on_event(
                TransportEvent::Failed {
                    session,
                    reason: "connection refused".into(),
                },
                now,
            );
            assert_eq!(m.attempts(), attempt);

            if attempt < max {
                assert_eq!(m.state(), ConnectionState::Reconnecting);
                let deadline = m.timer_deadline(TimerKind::Reconnect).unwrap();
                assert_eq!(deadline, now + secs(5));
                now = deadline;
                commands = m.on_timers(now);
                assert!(has_open(&commands));
            }
        }

        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(m.timer_deadline(TimerKind::Reconnect).is_none());
        let terminal = m.terminal_error().unwrap();
        assert_eq!(terminal.attempts, max);
        assert!(m.status().last_error.unwrap().contains("connection refused"));
        assert!(!has_open(&m.on_timers(now + secs(3600))));
    }

    #[test]
    fn test_successful_handshake_resets_attempts() {
        let mut m = machine();
        let commands = m.connect(ConnectionTarget::vehicle("v1"), cred(), secs(0)).unwrap();
        let session = open(&mut m, &commands, 1);
        m.on_event(TransportEvent::Closed { session, graceful: false }, secs(0));
        assert_eq!(m.attempts(), 1);

        let commands = m.on_timers(secs(5));
        let session = open(&mut m, &commands, 2);
        m.on_event(TransportEvent::Connected { session }, secs(5));
        assert_eq!(m.attempts(), 0);
        assert!(m.status().last_error.is_none());
    }

    #[test]
    fn test_disconnect_cancels_pending_reconnect() {
        let mut m = machine();
        let (session, _) = connected(&mut m, ConnectionTarget::vehicle("v1"), secs(0));
        m.on_event(
            TransportEvent::ErrorFrame {
                session,
                message: "broker restarting".into(),
            },
            secs(1),
        );
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert!(m.timer_deadline(TimerKind::Reconnect).is_some());

        let commands = m.disconnect(secs(2));
        assert!(!commands.contains(&Command::Close));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.attempts(), ConnectionConfig::default().max_reconnect_attempts);
        assert!(m.next_deadline().is_none());

        assert!(m.on_timers(secs(100)).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_tears_down_live_session() {
        let mut m = machine();
        connected(&mut m, ConnectionTarget::vehicle("v1"), secs(0));
        let commands = m.disconnect(secs(1));
        assert!(commands.contains(&Command::Unsubscribe(Channel::Vehicle("v1".into()))));
        assert!(commands.contains(&Command::Close));

        // Second call has nothing left to do.
        assert!(m.disconnect(secs(2)).is_empty());
    }

    #[test]
    fn test_stale_session_events_ignored() {
        let mut m = machine();
        let commands = m.connect(ConnectionTarget::vehicle("v1"), cred(), secs(0)).unwrap();
        let old = open(&mut m, &commands, 1);
        m.on_event(TransportEvent::Failed { session: old, reason: "reset".into() }, secs(0));

        let commands = m.on_timers(secs(5));
        let current = open(&mut m, &commands, 2);
        assert_eq!(m.state(), ConnectionState::Connecting);

        // Late callbacks from the first attempt
        assert!(m.on_event(TransportEvent::Connected { session: old }, secs(5)).is_empty());
        assert!(m
            .on_event(TransportEvent::Failed { session: old, reason: "late".into() }, secs(5))
            .is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.attempts(), 1);

        m.on_event(TransportEvent::Connected { session: current }, secs(6));
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_soft_timeout_clears_flag_only() {
        let mut m = machine();
        let commands = m.connect(ConnectionTarget::vehicle("v1"), cred(), secs(0)).unwrap();
        let session = open(&mut m, &commands, 1);
        assert!(m.status().connecting);

        let commands = m.on_timers(secs(3));
        assert_eq!(commands.len(), 1);
        let status = m.status();
        assert!(!status.connecting);
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(!has_open(&commands));

        m.on_event(TransportEvent::Connected { session }, secs(4));
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_graceful_close_does_not_retry() {
        let mut m = machine();
        let (session, _) = connected(&mut m, ConnectionTarget::vehicle("v1"), secs(0));
        m.on_event(TransportEvent::Closed { session, graceful: true }, secs(1));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.next_deadline().is_none());
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn test_manual_reconnect_switches_target_after_grace() {
        let mut m = machine();
        let max = ConnectionConfig::default().max_reconnect_attempts;
        let mut now = secs(0);
        let mut commands = m.connect(ConnectionTarget::vehicle("v1"), cred(), now).unwrap();
        for attempt in 1..=max {
            let session = open(&mut m, &commands, attempt as u64);
            m.on_event(TransportEvent::Failed { session, reason: "down".into() }, now);
            now += secs(5);
            commands = m.on_timers(now);
        }
        assert_eq!(m.state(), ConnectionState::Failed);

        let commands = m.reconnect(Some(ConnectionTarget::order("o7")), now).unwrap();
        assert!(!has_open(&commands));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.attempts(), 0);
        assert!(m.terminal_error().is_none());
        assert_eq!(m.timer_deadline(TimerKind::ManualReconnectGrace), Some(now + secs(1)));

        assert!(m.on_timers(now + Duration::from_millis(999)).is_empty());
        let commands = m.on_timers(now + secs(1));
        let session = open(&mut m, &commands, 99);
        let commands = m.on_event(TransportEvent::Connected { session }, now + secs(1));
        assert!(commands.contains(&Command::Subscribe(Channel::Order("o7".into()))));
    }

    #[test]
    fn test_reconnect_rejects_bad_target_without_side_effects() {
        let mut m = machine();
        connected(&mut m, ConnectionTarget::vehicle("v1"), secs(0));
        let err = m.reconnect(Some(ConnectionTarget::default()), secs(1)).unwrap_err();
        assert_eq!(err, ConfigError::MissingTarget);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_then_connect_starts_fresh_budget() {
        let mut m = machine();
        connected(&mut m, ConnectionTarget::vehicle("v1"), secs(0));
        m.disconnect(secs(1));
        let commands = m.connect(ConnectionTarget::vehicle("v1"), cred(), secs(2)).unwrap();
        assert!(has_open(&commands));
        assert_eq!(m.attempts(), 0);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }
}
