// Test support — scriptable in-memory transport and a recording delegate
//
// Shared by unit tests and the integration suites under `tests/`.

use crate::delivery::DeliveryDelegate;
use crate::identity::{Contact, KeyPrefix, PublicKey, FLOOD_PATH_LEN};
use crate::message::{IncomingMessage, MessageId, TextType};
use crate::session::{PermissionLevel, SessionDelegate, SessionId, SessionState};
use crate::transport::{
    ChannelInfo, ReceivedText, RemoteStatus, SentInfo, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;

/// How the mock answers one `send_message` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendScript {
    /// Accept and publish the acknowledgement right away
    Ack,
    /// Accept and publish the acknowledgement after a delay
    AckAfter(Duration),
    /// Accept; no acknowledgement ever arrives
    NoAck,
    Fail(TransportError),
}

/// How a node answers logins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginBehavior {
    Accept { is_admin: bool, acl: Option<u8> },
    Reject,
    /// The request is sent but no result comes back
    Silent,
    Error(TransportError),
}

/// How a node answers a CLI command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Published as soon as the command is sent
    Push(String),
    /// Held on the device until fetched with `sync_next_message`
    Buffered(String),
}

/// A request the mock received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    SendMessage {
        recipient: PublicKey,
        text: String,
        attempt: u8,
    },
    SendChannelMessage {
        slot: u8,
        text: String,
    },
    Login(PublicKey),
    Logout(PublicKey),
    Command {
        destination: PublicKey,
        command: String,
    },
    KeepAlive {
        destination: PublicKey,
        sync_since: u32,
    },
    RequestStatus(PublicKey),
    GetChannel(u8),
    SetChannel(ChannelInfo),
    ResetPath(PublicKey),
    GetContact(PublicKey),
    SyncNextMessage,
}

struct MockState {
    calls: Vec<TransportCall>,
    next_ack: u32,
    suggested_timeout_ms: u32,
    send_scripts: VecDeque<SendScript>,
    default_send: SendScript,
    send_failure: Option<TransportError>,
    contacts: HashMap<PublicKey, Contact>,
    logins: HashMap<PublicKey, LoginBehavior>,
    login_passwords: Vec<String>,
    replies: HashMap<(PublicKey, String), CommandReply>,
    buffered: VecDeque<TransportEvent>,
    statuses: HashMap<PublicKey, RemoteStatus>,
    channels: HashMap<u8, ChannelInfo>,
    channel_scripts: HashMap<u8, VecDeque<TransportError>>,
    channel_failure: Option<TransportError>,
    keep_alive_failure: Option<TransportError>,
}

/// In-memory [`Transport`] driven by test scripts
pub struct MockTransport {
    state: Mutex<MockState>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                next_ack: 1,
                suggested_timeout_ms: 1000,
                send_scripts: VecDeque::new(),
                default_send: SendScript::NoAck,
                send_failure: None,
                contacts: HashMap::new(),
                logins: HashMap::new(),
                login_passwords: Vec::new(),
                replies: HashMap::new(),
                buffered: VecDeque::new(),
                statuses: HashMap::new(),
                channels: HashMap::new(),
                channel_scripts: HashMap::new(),
                channel_failure: None,
                keep_alive_failure: None,
            }),
            events,
        }
    }

    /// Publish an event as if the device pushed it
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a CLI reply from `from`
    pub fn emit_cli_reply(&self, from: &PublicKey, text: &str) {
        self.emit(cli_reply(from, text));
    }

    pub fn emit_ack(&self, token: u32) {
        self.emit(TransportEvent::Acknowledgement {
            code: token.to_le_bytes().to_vec(),
        });
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Attempt numbers of every direct send, in order
    pub fn sent_attempts(&self) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::SendMessage { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect()
    }

    pub fn count_calls(&self, matches: impl Fn(&TransportCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn add_contact(&self, contact: Contact) {
        self.state
            .lock()
            .contacts
            .insert(contact.public_key, contact);
    }

    pub fn contact(&self, key: &PublicKey) -> Option<Contact> {
        self.state.lock().contacts.get(key).cloned()
    }

    /// Token used for the next send; each send takes the next value
    pub fn set_next_ack_value(&self, value: u32) {
        self.state.lock().next_ack = value;
    }

    pub fn set_suggested_timeout_ms(&self, ms: u32) {
        self.state.lock().suggested_timeout_ms = ms;
    }

    /// Answer the next sends from `scripts`, then fall back to the default
    pub fn script_sends(&self, scripts: Vec<SendScript>) {
        self.state.lock().send_scripts.extend(scripts);
    }

    pub fn set_default_send(&self, script: SendScript) {
        self.state.lock().default_send = script;
    }

    /// Fail every message send from now on
    pub fn fail_sends(&self, error: TransportError) {
        self.state.lock().send_failure = Some(error);
    }

    pub fn set_login_behavior(&self, key: PublicKey, behavior: LoginBehavior) {
        self.state.lock().logins.insert(key, behavior);
    }

    pub fn login_passwords(&self) -> Vec<String> {
        self.state.lock().login_passwords.clone()
    }

    pub fn reply_to_command(&self, key: PublicKey, command: &str, reply: CommandReply) {
        self.state
            .lock()
            .replies
            .insert((key, command.to_string()), reply);
    }

    pub fn set_status(&self, key: PublicKey, status: RemoteStatus) {
        self.state.lock().statuses.insert(key, status);
    }

    /// Configure a slot on the simulated device
    pub fn set_device_channel(&self, channel: ChannelInfo) {
        self.state.lock().channels.insert(channel.index, channel);
    }

    pub fn device_channel(&self, index: u8) -> Option<ChannelInfo> {
        self.state.lock().channels.get(&index).cloned()
    }

    /// Fail the next reads of `index` with these errors, in order
    pub fn script_channel_reads(&self, index: u8, errors: Vec<TransportError>) {
        self.state
            .lock()
            .channel_scripts
            .entry(index)
            .or_default()
            .extend(errors);
    }

    /// Fail every channel read until cleared with `None`
    pub fn fail_channel_reads(&self, error: Option<TransportError>) {
        self.state.lock().channel_failure = error;
    }

    pub fn fail_keep_alives(&self, error: Option<TransportError>) {
        self.state.lock().keep_alive_failure = error;
    }

    fn record(&self, call: TransportCall) {
        self.state.lock().calls.push(call);
    }

    fn next_sent_info(&self, flood: bool) -> (SentInfo, u32) {
        let mut state = self.state.lock();
        let token = state.next_ack;
        state.next_ack = state.next_ack.wrapping_add(1);
        let info = SentInfo {
            ack_code: token.to_le_bytes().to_vec(),
            suggested_timeout_ms: state.suggested_timeout_ms,
            flood,
        };
        (info, token)
    }

    fn schedule_ack(&self, token: u32, delay: Duration) {
        let events = self.events.clone();
        let code = token.to_le_bytes().to_vec();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            let _ = events.send(TransportEvent::Acknowledgement { code });
        });
    }
}

fn cli_reply(from: &PublicKey, text: &str) -> TransportEvent {
    TransportEvent::ContactMessage(ReceivedText {
        sender_prefix: from.prefix(),
        text_type: TextType::CliData,
        text: text.to_string(),
        sender_timestamp: 0,
        path_len: 0,
    })
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(
        &self,
        recipient: &PublicKey,
        text: &str,
        attempt: u8,
        _timestamp: u32,
    ) -> Result<SentInfo, TransportError> {
        self.record(TransportCall::SendMessage {
            recipient: *recipient,
            text: text.to_string(),
            attempt,
        });
        let (script, flood) = {
            let mut state = self.state.lock();
            if let Some(error) = state.send_failure.clone() {
                return Err(error);
            }
            let script = state
                .send_scripts
                .pop_front()
                .unwrap_or_else(|| state.default_send.clone());
            let flood = state
                .contacts
                .get(recipient)
                .map_or(true, Contact::is_flood);
            (script, flood)
        };

        if let SendScript::Fail(error) = script {
            return Err(error);
        }
        let (info, token) = self.next_sent_info(flood);
        match script {
            SendScript::Ack => self.schedule_ack(token, Duration::ZERO),
            SendScript::AckAfter(delay) => self.schedule_ack(token, delay),
            _ => {}
        }
        Ok(info)
    }

    async fn send_channel_message(
        &self,
        slot: u8,
        text: &str,
        _timestamp: u32,
    ) -> Result<SentInfo, TransportError> {
        self.record(TransportCall::SendChannelMessage {
            slot,
            text: text.to_string(),
        });
        if let Some(error) = self.state.lock().send_failure.clone() {
            return Err(error);
        }
        Ok(self.next_sent_info(true).0)
    }

    async fn send_login(
        &self,
        destination: &PublicKey,
        password: &str,
    ) -> Result<SentInfo, TransportError> {
        self.record(TransportCall::Login(*destination));
        let behavior = {
            let mut state = self.state.lock();
            state.login_passwords.push(password.to_string());
            state
                .logins
                .get(destination)
                .cloned()
                .unwrap_or(LoginBehavior::Silent)
        };
        let prefix = destination.prefix();
        match behavior {
            LoginBehavior::Accept { is_admin, acl } => self.emit(TransportEvent::LoginSuccess {
                prefix,
                is_admin,
                acl,
            }),
            LoginBehavior::Reject => self.emit(TransportEvent::LoginFailed { prefix }),
            LoginBehavior::Silent => {}
            LoginBehavior::Error(error) => return Err(error),
        }
        Ok(self.next_sent_info(false).0)
    }

    async fn send_logout(&self, destination: &PublicKey) -> Result<(), TransportError> {
        self.record(TransportCall::Logout(*destination));
        Ok(())
    }

    async fn send_command(
        &self,
        destination: &PublicKey,
        command: &str,
        _timestamp: u32,
    ) -> Result<SentInfo, TransportError> {
        self.record(TransportCall::Command {
            destination: *destination,
            command: command.to_string(),
        });
        let reply = {
            let mut state = self.state.lock();
            if let Some(error) = state.send_failure.clone() {
                return Err(error);
            }
            let reply = state
                .replies
                .get(&(*destination, command.to_string()))
                .cloned();
            if let Some(CommandReply::Buffered(text)) = &reply {
                state.buffered.push_back(cli_reply(destination, text));
            }
            reply
        };
        if let Some(CommandReply::Push(text)) = reply {
            self.emit_cli_reply(destination, &text);
        }
        Ok(self.next_sent_info(false).0)
    }

    async fn send_keep_alive(
        &self,
        destination: &PublicKey,
        sync_since: u32,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::KeepAlive {
            destination: *destination,
            sync_since,
        });
        match self.state.lock().keep_alive_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn request_status(&self, destination: &PublicKey) -> Result<SentInfo, TransportError> {
        self.record(TransportCall::RequestStatus(*destination));
        let status = self.state.lock().statuses.get(destination).cloned();
        if let Some(status) = status {
            self.emit(TransportEvent::StatusResponse {
                prefix: destination.prefix(),
                status,
            });
        }
        Ok(self.next_sent_info(false).0)
    }

    async fn get_channel(&self, index: u8) -> Result<Option<ChannelInfo>, TransportError> {
        self.record(TransportCall::GetChannel(index));
        let mut state = self.state.lock();
        if let Some(error) = state
            .channel_scripts
            .get_mut(&index)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = state.channel_failure.clone() {
            return Err(error);
        }
        Ok(state.channels.get(&index).cloned())
    }

    async fn set_channel(&self, channel: &ChannelInfo) -> Result<(), TransportError> {
        self.record(TransportCall::SetChannel(channel.clone()));
        self.state
            .lock()
            .channels
            .insert(channel.index, channel.clone());
        Ok(())
    }

    async fn reset_path(&self, destination: &PublicKey) -> Result<(), TransportError> {
        self.record(TransportCall::ResetPath(*destination));
        if let Some(contact) = self.state.lock().contacts.get_mut(destination) {
            contact.out_path_len = FLOOD_PATH_LEN;
            contact.out_path.clear();
        }
        Ok(())
    }

    async fn get_contact(&self, key: &PublicKey) -> Result<Option<Contact>, TransportError> {
        self.record(TransportCall::GetContact(*key));
        Ok(self.state.lock().contacts.get(key).cloned())
    }

    async fn sync_next_message(&self) -> Result<bool, TransportError> {
        self.record(TransportCall::SyncNextMessage);
        let next = self.state.lock().buffered.pop_front();
        match next {
            Some(event) => {
                self.emit(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Delegate that records every callback it receives
#[derive(Default)]
pub struct RecordingDelegate {
    created: Mutex<Vec<MessageId>>,
    retry_statuses: Mutex<Vec<(MessageId, u8, u8)>>,
    routing_changes: Mutex<Vec<(PublicKey, bool)>>,
    delivered: Mutex<Vec<MessageId>>,
    heard_repeats: Mutex<Vec<(MessageId, u32)>>,
    failed: Mutex<Vec<MessageId>>,
    received: Mutex<Vec<IncomingMessage>>,
    state_changes: Mutex<Vec<(SessionId, SessionState)>>,
    unmatched_cli: Mutex<Vec<(KeyPrefix, String)>>,
    downgrades: Mutex<Vec<(SessionId, PermissionLevel, PermissionLevel)>>,
}

impl RecordingDelegate {
    pub fn created(&self) -> Vec<MessageId> {
        self.created.lock().clone()
    }

    pub fn retry_statuses(&self) -> Vec<(MessageId, u8, u8)> {
        self.retry_statuses.lock().clone()
    }

    pub fn routing_changes(&self) -> Vec<(PublicKey, bool)> {
        self.routing_changes.lock().clone()
    }

    pub fn delivered(&self) -> Vec<MessageId> {
        self.delivered.lock().clone()
    }

    pub fn heard_repeats(&self) -> Vec<(MessageId, u32)> {
        self.heard_repeats.lock().clone()
    }

    pub fn failed(&self) -> Vec<MessageId> {
        self.failed.lock().clone()
    }

    pub fn received(&self) -> Vec<IncomingMessage> {
        self.received.lock().clone()
    }

    pub fn state_changes(&self) -> Vec<(SessionId, SessionState)> {
        self.state_changes.lock().clone()
    }

    pub fn unmatched_cli(&self) -> Vec<(KeyPrefix, String)> {
        self.unmatched_cli.lock().clone()
    }

    pub fn downgrades(&self) -> Vec<(SessionId, PermissionLevel, PermissionLevel)> {
        self.downgrades.lock().clone()
    }
}

impl DeliveryDelegate for RecordingDelegate {
    fn on_message_created(&self, message_id: MessageId) {
        self.created.lock().push(message_id);
    }

    fn on_retry_status(&self, message_id: MessageId, attempt: u8, max_attempts: u8) {
        self.retry_statuses
            .lock()
            .push((message_id, attempt, max_attempts));
    }

    fn on_routing_changed(&self, contact: PublicKey, flood: bool) {
        self.routing_changes.lock().push((contact, flood));
    }

    fn on_delivered(&self, message_id: MessageId, _round_trip: Duration) {
        self.delivered.lock().push(message_id);
    }

    fn on_heard_repeat(&self, message_id: MessageId, count: u32) {
        self.heard_repeats.lock().push((message_id, count));
    }

    fn on_delivery_failed(&self, message_id: MessageId) {
        self.failed.lock().push(message_id);
    }

    fn on_message_received(&self, message: IncomingMessage) {
        self.received.lock().push(message);
    }
}

impl SessionDelegate for RecordingDelegate {
    fn on_session_state_changed(&self, session_id: SessionId, state: SessionState) {
        self.state_changes.lock().push((session_id, state));
    }

    fn on_unmatched_cli_response(&self, prefix: KeyPrefix, text: String) {
        self.unmatched_cli.lock().push((prefix, text));
    }

    fn on_permission_downgraded(
        &self,
        session_id: SessionId,
        before: PermissionLevel,
        after: PermissionLevel,
    ) {
        self.downgrades.lock().push((session_id, before, after));
    }
}
