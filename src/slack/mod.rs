//! The Slack side of the bridge: Web API calls over the pooled HTTP
//! transport, the RTM websocket event stream, entity caches, history replay
//! and the persisted session status.

pub mod types;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant, SystemTime};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::http::{Field, HttpClient, TransportError};
use types::*;

const API_BASE: &str = "https://slack.com/api/";

/// Entries older than this are swept from the sent-by-self set.
const SENT_BY_SELF_TTL: Duration = Duration::from_secs(10);

/// History replay never reaches further back than this.
const REPLAY_WINDOW_SECS: f64 = 4.0 * 24.0 * 3600.0;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum SlackError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed api response: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote replied `ok: false`; carries the `error` field.
    #[error("slack api error: {0}")]
    Response(String),

    #[error("connection to slack failed: {0}")]
    Connection(String),

    #[error("no such entry")]
    NotFound,
}

fn not_found(err: SlackError) -> SlackError {
    match err {
        SlackError::Response(e) if e.ends_with("_not_found") => SlackError::NotFound,
        other => other,
    }
}

/// State that survives restarts, written to the status file at shutdown.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStatus {
    #[serde(default)]
    last_timestamp: f64,
    #[serde(default)]
    autoreactions: HashMap<String, Vec<Autoreaction>>,
    #[serde(default)]
    annoy: HashMap<String, f64>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn field(k: &str, v: impl Into<String>) -> (String, Field) {
    (k.to_string(), Field::Text(v.into()))
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One Slack session. All mutation happens through `&mut self` from the
/// single session loop, so there is no interior locking anywhere.
pub struct SlackClient {
    token: String,
    cookie: Option<String>,
    http: HttpClient,
    ws: Option<WsStream>,
    wsid: u64,
    login_info: Option<LoginInfo>,
    reconnect_delay: Duration,

    users: HashMap<String, User>,
    users_by_name: HashMap<String, String>,
    users_prefetched: bool,
    channels: HashMap<String, Channel>,
    channels_loaded: bool,
    members: HashMap<String, HashSet<String>>,
    ims: HashMap<String, Im>,

    internal_events: VecDeque<SlackEvent>,
    sent_by_self: HashMap<String, Instant>,
    status: PersistedStatus,
}

impl SlackClient {
    pub fn new(
        token: String,
        cookie: Option<String>,
        previous_status: Option<&str>,
    ) -> Result<SlackClient, SlackError> {
        let status = match previous_status {
            Some(blob) => serde_json::from_str(blob).unwrap_or_else(|e| {
                warn!("discarding unreadable status blob: {e}");
                PersistedStatus::default()
            }),
            None => PersistedStatus::default(),
        };

        Ok(SlackClient {
            token,
            cookie,
            http: HttpClient::new(API_BASE)?,
            ws: None,
            wsid: 0,
            login_info: None,
            reconnect_delay: Duration::from_secs(1),
            users: HashMap::new(),
            users_by_name: HashMap::new(),
            users_prefetched: false,
            channels: HashMap::new(),
            channels_loaded: false,
            members: HashMap::new(),
            ims: HashMap::new(),
            internal_events: VecDeque::new(),
            sent_by_self: HashMap::new(),
            status,
        })
    }

    /// Serialized status blob for the status file.
    pub fn get_status(&self) -> String {
        serde_json::to_string(&self.status).unwrap_or_else(|_| "{}".to_string())
    }

    // ------------------------------------------------------------------
    // Web API plumbing
    // ------------------------------------------------------------------

    async fn api(
        &mut self,
        method: &str,
        fields: Vec<(String, Field)>,
    ) -> Result<Value, SlackError> {
        let mut headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.token),
        )];
        if let Some(cookie) = &self.cookie {
            headers.push(("Cookie".to_string(), cookie.clone()));
        }
        let response = self.http.post(method, &headers, &fields).await?;
        if response.status == 429 {
            let retry = response
                .headers
                .get("retry-after")
                .cloned()
                .unwrap_or_default();
            return Err(SlackError::Response(format!(
                "ratelimited, retry-after {retry}"
            )));
        }
        if response.status != 200 {
            return Err(SlackError::Response(format!(
                "http status {}",
                response.status
            )));
        }
        let v: Value = serde_json::from_slice(&response.body)?;
        if v.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = v
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(SlackError::Response(error.to_string()));
        }
        Ok(v)
    }

    fn page_cursor(v: &Value) -> String {
        v.pointer("/response_metadata/next_cursor")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }

    // ------------------------------------------------------------------
    // Login and RTM connection
    // ------------------------------------------------------------------

    pub async fn login(&mut self) -> Result<LoginInfo, SlackError> {
        let v = self
            .api("rtm.connect", vec![])
            .await
            .map_err(|e| SlackError::Connection(e.to_string()))?;
        let info: LoginInfo = serde_json::from_value(v)?;
        self.login_info = Some(info.clone());
        Ok(info)
    }

    /// Log in, open the RTM websocket and replay the history gap. Returns
    /// the (refreshed) login info.
    pub async fn connect(&mut self) -> Result<LoginInfo, SlackError> {
        let info = self.login().await?;
        let (ws, _) = connect_async(info.url.as_str())
            .await
            .map_err(|e| SlackError::Connection(e.to_string()))?;
        self.ws = Some(ws);
        self.reconnect_delay = Duration::from_secs(1);
        info!("connected to the {} workspace rtm stream", info.team.name);
        self.history_replay().await;
        Ok(info)
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Double the delay before the next reconnection attempt, capped.
    pub fn bump_backoff(&mut self) {
        self.reconnect_delay = (self.reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }

    // ------------------------------------------------------------------
    // Event stream
    // ------------------------------------------------------------------

    /// Next queued internal event (history replay, synthetic joins).
    /// Drained before the websocket is read.
    pub fn pop_internal_event(&mut self) -> Option<SlackEvent> {
        self.internal_events.pop_front()
    }

    /// Await the next text frame from the websocket. Cancel-safe: the only
    /// await point is the socket read itself. Returns `None` when the
    /// socket died; the caller schedules a reconnect.
    pub async fn next_ws_frame(&mut self) -> Option<String> {
        loop {
            let msg = match self.ws.as_mut() {
                Some(ws) => ws.next().await,
                None => return None,
            };
            match msg {
                Some(Ok(WsMessage::Text(t))) => return Some(t.to_string()),
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("rtm websocket closed");
                    self.ws = None;
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("rtm websocket error: {e}");
                    self.ws = None;
                    return None;
                }
            }
        }
    }

    /// Process one raw frame into bridge-facing events, applying the
    /// useless-event filter, self-echo suppression, cache maintenance and
    /// the annoy/autoreaction side tables.
    pub async fn process_frame(&mut self, raw: &str) -> Vec<SlackEvent> {
        self.sweep_sent_by_self();

        let mut out = Vec::new();
        for line in raw.split('\n') {
            if line.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!("undecodable rtm frame: {e}");
                    continue;
                }
            };
            if let Some(ev) = self.process_value(value).await {
                out.push(ev);
            }
        }
        out
    }

    async fn process_value(&mut self, value: Value) -> Option<SlackEvent> {
        if let Some(ts) = value.get("ts").and_then(Value::as_str) {
            self.advance_timestamp(ts);
        }

        // Our own messages come back over RTM; drop the echo exactly once.
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        let subtype = value.get("subtype").and_then(Value::as_str);
        if event_type == "message" && matches!(subtype, None | Some("me_message")) {
            if let Some(ts) = value.get("ts").and_then(Value::as_str) {
                if self.sent_by_self.remove(ts).is_some() {
                    debug!("suppressed self-echo for ts {ts}");
                    return None;
                }
            }
        }

        match decode_event(&value)? {
            SlackEvent::UserChange { user } => {
                self.invalidate_user(&user);
                None
            }
            SlackEvent::Typing(t) => {
                self.handle_typing(t).await;
                None
            }
            SlackEvent::Join(m) => {
                self.members
                    .entry(m.channel.clone())
                    .or_default()
                    .insert(m.user.clone());
                Some(SlackEvent::Join(m))
            }
            SlackEvent::Leave(m) => {
                if let Some(set) = self.members.get_mut(&m.channel) {
                    set.remove(&m.user);
                }
                Some(SlackEvent::Leave(m))
            }
            SlackEvent::Message(mut msg) => {
                self.fire_autoreactions(&msg).await;
                // An IM message whose sender is not the peer is one of our
                // own, sent from some other client; surface it as a reply.
                if let Some(im) = self.get_im(&msg.channel).await {
                    if im.user != msg.user {
                        msg.user = im.user;
                        msg.text = format!("I say: {}", msg.text);
                    }
                }
                Some(SlackEvent::Message(msg))
            }
            other => Some(other),
        }
    }

    fn advance_timestamp(&mut self, ts: &str) {
        let parsed = parse_ts(ts);
        if parsed >= self.status.last_timestamp {
            self.status.last_timestamp = parsed;
        }
    }

    fn sweep_sent_by_self(&mut self) {
        self.sent_by_self
            .retain(|_, inserted| inserted.elapsed() < SENT_BY_SELF_TTL);
    }

    async fn handle_typing(&mut self, t: UserTyping) {
        match self.status.annoy.get(&t.user).copied() {
            None => {}
            Some(expiration) if now_unix() > expiration => {
                self.status.annoy.remove(&t.user);
            }
            Some(_) => {
                if let Err(e) = self.typing(&t.channel).await {
                    debug!("unable to return typing event: {e}");
                }
            }
        }
    }

    async fn fire_autoreactions(&mut self, msg: &Message) {
        let Some(entries) = self.status.autoreactions.get(&msg.user).cloned() else {
            return;
        };
        let now = now_unix();
        let mut kept = Vec::new();
        for entry in entries {
            if entry.expiration < now {
                continue;
            }
            if rand::random::<f64>() >= entry.probability {
                kept.push(entry);
                continue;
            }
            let fields = vec![
                field("channel", &msg.channel),
                field("timestamp", &msg.ts),
                field("name", &entry.reaction),
            ];
            match self.api("reactions.add", fields).await {
                Ok(_) => kept.push(entry),
                Err(e) => debug!("dropping failing autoreaction {}: {e}", entry.reaction),
            }
        }
        if kept.is_empty() {
            self.status.autoreactions.remove(&msg.user);
        } else {
            self.status.autoreactions.insert(msg.user.clone(), kept);
        }
    }

    /// Register a user in the annoy table for `minutes`.
    pub fn annoy_user(&mut self, user_id: &str, minutes: u64) {
        self.status
            .annoy
            .insert(user_id.to_string(), now_unix() + (minutes * 60) as f64);
    }

    /// Outbound typing notification on the RTM socket.
    pub async fn typing(&mut self, channel: &str) -> Result<(), SlackError> {
        let id = self.wsid;
        self.wsid += 1;
        let frame = serde_json::json!({"id": id, "type": "typing", "channel": channel}).to_string();
        match self.ws.as_mut() {
            Some(ws) => ws
                .send(WsMessage::Text(frame.into()))
                .await
                .map_err(|e| SlackError::Connection(e.to_string())),
            None => Err(SlackError::Connection("not connected".to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Outgoing messages and files
    // ------------------------------------------------------------------

    /// Post a message. With `re_send_to_irc` false the returned timestamp
    /// goes into the sent-by-self set so the RTM echo gets dropped; with
    /// true the echo flows back to IRC (used by the control socket).
    pub async fn send_message(
        &mut self,
        channel_id: &str,
        text: &str,
        action: bool,
        re_send_to_irc: bool,
        thread_ts: Option<&str>,
    ) -> Result<(), SlackError> {
        let method = if action {
            "chat.meMessage"
        } else {
            "chat.postMessage"
        };
        let mut fields = vec![field("channel", channel_id), field("text", text)];
        if let Some(ts) = thread_ts {
            fields.push(field("thread_ts", ts));
        }
        let v = self.api(method, fields).await?;
        if !re_send_to_irc {
            if let Some(ts) = v.get("ts").and_then(Value::as_str) {
                self.sent_by_self.insert(ts.to_string(), Instant::now());
            }
        }
        Ok(())
    }

    /// Message a user directly, opening the IM channel on first use.
    pub async fn send_message_to_user(
        &mut self,
        user_id: &str,
        text: &str,
        action: bool,
        re_send_to_irc: bool,
    ) -> Result<(), SlackError> {
        let im_id = match self.ims.values().find(|im| im.user == user_id) {
            Some(im) => im.id.clone(),
            None => self.open_im(user_id).await?,
        };
        self.send_message(&im_id, text, action, re_send_to_irc, None)
            .await
    }

    async fn open_im(&mut self, user_id: &str) -> Result<String, SlackError> {
        let v = self
            .api("conversations.open", vec![field("users", user_id)])
            .await
            .map_err(not_found)?;
        let id = v
            .pointer("/channel/id")
            .and_then(Value::as_str)
            .ok_or(SlackError::NotFound)?
            .to_string();
        self.ims.insert(
            id.clone(),
            Im {
                id: id.clone(),
                user: user_id.to_string(),
            },
        );
        Ok(id)
    }

    /// Upload a file to a user, through their IM channel.
    pub async fn send_file_to_user(
        &mut self,
        user_id: &str,
        content: Vec<u8>,
        filename: &str,
    ) -> Result<(), SlackError> {
        let im_id = match self.ims.values().find(|im| im.user == user_id) {
            Some(im) => im.id.clone(),
            None => self.open_im(user_id).await?,
        };
        self.send_file(&im_id, content, filename, None).await
    }

    pub async fn send_file(
        &mut self,
        channel_id: &str,
        content: Vec<u8>,
        filename: &str,
        thread_ts: Option<&str>,
    ) -> Result<(), SlackError> {
        let mut fields = vec![
            field("channels", channel_id),
            (
                "file".to_string(),
                Field::File {
                    filename: filename.to_string(),
                    bytes: content,
                },
            ),
            field("filename", filename),
        ];
        if let Some(ts) = thread_ts {
            fields.push(field("thread_ts", ts));
        }
        self.api("files.upload", fields).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity caches
    // ------------------------------------------------------------------

    /// All known channels, listing from the API on first use or when
    /// `refresh` is set. Listing is best-effort: a failing page returns
    /// whatever was gathered so far.
    pub async fn channels(&mut self, refresh: bool) -> Vec<Channel> {
        if !self.channels_loaded || refresh {
            self.refresh_channels().await;
        }
        self.channels.values().cloned().collect()
    }

    async fn refresh_channels(&mut self) {
        let mut cursor = String::new();
        loop {
            let mut fields = vec![
                field("types", "public_channel,private_channel,mpim"),
                field("exclude_archived", "true"),
                field("limit", "1000"),
            ];
            if !cursor.is_empty() {
                fields.push(field("cursor", &cursor));
            }
            let v = match self.api("conversations.list", fields).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("channel listing interrupted, keeping partial list: {e}");
                    break;
                }
            };
            if let Some(list) = v.get("channels").and_then(Value::as_array) {
                for entry in list {
                    if let Ok(channel) = serde_json::from_value::<Channel>(entry.clone()) {
                        self.channels.insert(channel.id.clone(), channel);
                    }
                }
            }
            let next = Self::page_cursor(&v);
            if next.is_empty() || next == cursor {
                break;
            }
            cursor = next;
        }
        self.channels_loaded = true;
    }

    /// Channel ids the logged-in user is a member of, via the user-scoped
    /// listing endpoint.
    pub async fn joined_channels(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut fields = vec![
                field("types", "public_channel,private_channel,mpim"),
                field("limit", "1000"),
            ];
            if !cursor.is_empty() {
                fields.push(field("cursor", &cursor));
            }
            let v = match self.api("users.conversations", fields).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("joined-channel listing interrupted: {e}");
                    break;
                }
            };
            if let Some(list) = v.get("channels").and_then(Value::as_array) {
                for entry in list {
                    if let Some(id) = entry.get("id").and_then(Value::as_str) {
                        out.push(id.to_string());
                    }
                }
            }
            let next = Self::page_cursor(&v);
            if next.is_empty() || next == cursor {
                break;
            }
            cursor = next;
        }
        out
    }

    pub async fn get_channel(&mut self, id: &str) -> Result<Channel, SlackError> {
        if let Some(c) = self.channels.get(id) {
            return Ok(c.clone());
        }
        // IMs never appear in the channel listing
        if id.starts_with('D') {
            return Err(SlackError::NotFound);
        }
        self.refresh_channels().await;
        self.channels.get(id).cloned().ok_or(SlackError::NotFound)
    }

    /// Like `get_channel` but always refreshing first; used when an event
    /// signals the entity changed remotely.
    pub async fn get_channel_refresh(&mut self, id: &str) -> Result<Channel, SlackError> {
        self.refresh_channels().await;
        self.channels.get(id).cloned().ok_or(SlackError::NotFound)
    }

    pub async fn get_channel_by_name(&mut self, name: &str) -> Result<Channel, SlackError> {
        if !self.channels_loaded {
            self.refresh_channels().await;
        }
        self.channels
            .values()
            .find(|c| c.name_normalized == name)
            .cloned()
            .ok_or(SlackError::NotFound)
    }

    /// Member ids for a channel, paginated and unioned with previous
    /// fetches. A refetch that discovers new ids pushes synthetic Join
    /// events so downstream consumers see the membership change.
    pub async fn get_members(&mut self, channel_id: &str) -> Result<HashSet<String>, SlackError> {
        let previous = self.members.get(channel_id).cloned();
        let mut gathered = previous.clone().unwrap_or_default();

        let mut cursor = String::new();
        loop {
            let mut fields = vec![field("channel", channel_id), field("limit", "1000")];
            if !cursor.is_empty() {
                fields.push(field("cursor", &cursor));
            }
            let v = self
                .api("conversations.members", fields)
                .await
                .map_err(not_found)?;
            if let Some(list) = v.get("members").and_then(Value::as_array) {
                gathered.extend(
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string),
                );
            }
            let next = Self::page_cursor(&v);
            if next.is_empty() || next == cursor {
                break;
            }
            cursor = next;
        }

        if let Some(previous) = previous {
            for id in gathered.difference(&previous) {
                self.internal_events
                    .push_back(SlackEvent::Join(MembershipChange {
                        user: id.clone(),
                        channel: channel_id.to_string(),
                    }));
            }
        }
        self.members.insert(channel_id.to_string(), gathered.clone());
        Ok(gathered)
    }

    /// The member set as last fetched, without touching the network.
    pub fn cached_members(&self, channel_id: &str) -> Option<&HashSet<String>> {
        self.members.get(channel_id)
    }

    pub async fn get_user(&mut self, id: &str) -> Result<User, SlackError> {
        if let Some(u) = self.users.get(id) {
            return Ok(u.clone());
        }
        let v = self
            .api("users.info", vec![field("user", id)])
            .await
            .map_err(not_found)?;
        let user: User =
            serde_json::from_value(v.get("user").cloned().ok_or(SlackError::NotFound)?)?;
        self.cache_user(user.clone());
        Ok(user)
    }

    pub async fn get_user_by_name(&mut self, name: &str) -> Result<User, SlackError> {
        if let Some(id) = self.users_by_name.get(name).cloned() {
            return self.get_user(&id).await;
        }
        if !self.users_prefetched {
            self.prefetch_users().await;
            if let Some(id) = self.users_by_name.get(name).cloned() {
                return self.get_user(&id).await;
            }
        }
        Err(SlackError::NotFound)
    }

    fn cache_user(&mut self, user: User) {
        self.users_by_name.insert(user.name.clone(), user.id.clone());
        self.users.insert(user.id.clone(), user);
    }

    pub fn invalidate_user(&mut self, id: &str) {
        if let Some(user) = self.users.remove(id) {
            self.users_by_name.remove(&user.name);
        }
    }

    /// Batch-load the whole user directory; much cheaper than one
    /// `users.info` per member when joining many channels.
    pub async fn prefetch_users(&mut self) {
        let mut cursor = String::new();
        loop {
            let mut fields = vec![field("limit", "1000")];
            if !cursor.is_empty() {
                fields.push(field("cursor", &cursor));
            }
            let v = match self.api("users.list", fields).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("user prefetch interrupted: {e}");
                    return;
                }
            };
            if let Some(list) = v.get("members").and_then(Value::as_array) {
                for entry in list {
                    if let Ok(user) = serde_json::from_value::<User>(entry.clone()) {
                        self.cache_user(user);
                    }
                }
            }
            let next = Self::page_cursor(&v);
            if next.is_empty() || next == cursor {
                break;
            }
            cursor = next;
        }
        self.users_prefetched = true;
    }

    /// Cached user count for the LUSERS line; meaningful after a prefetch.
    pub fn known_user_count(&self) -> usize {
        self.users.values().filter(|u| !u.deleted).count()
    }

    /// IM lookup by channel id. Non-IM ids return `None` without touching
    /// the network.
    pub async fn get_im(&mut self, im_id: &str) -> Option<Im> {
        if !im_id.starts_with('D') {
            return None;
        }
        if let Some(im) = self.ims.get(im_id) {
            return Some(im.clone());
        }
        self.refresh_ims().await;
        self.ims.get(im_id).cloned()
    }

    async fn refresh_ims(&mut self) {
        let mut cursor = String::new();
        loop {
            let mut fields = vec![field("types", "im"), field("limit", "1000")];
            if !cursor.is_empty() {
                fields.push(field("cursor", &cursor));
            }
            let v = match self.api("conversations.list", fields).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("im listing interrupted: {e}");
                    return;
                }
            };
            if let Some(list) = v.get("channels").and_then(Value::as_array) {
                for entry in list {
                    if let Ok(im) = serde_json::from_value::<Im>(entry.clone()) {
                        self.ims.insert(im.id.clone(), im);
                    }
                }
            }
            let next = Self::page_cursor(&v);
            if next.is_empty() || next == cursor {
                break;
            }
            cursor = next;
        }
    }

    /// Build the synthetic channel for a thread, titled after the root
    /// message.
    pub async fn get_thread(
        &mut self,
        thread_ts: &str,
        channel_id: &str,
    ) -> Result<MessageThread, SlackError> {
        let v = self
            .api(
                "conversations.history",
                vec![
                    field("channel", channel_id),
                    field("latest", thread_ts),
                    field("inclusive", "true"),
                    field("limit", "1"),
                ],
            )
            .await
            .map_err(not_found)?;
        let root = v
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .cloned()
            .unwrap_or(Value::Null);

        let root_text = root.get("text").and_then(Value::as_str).unwrap_or("");
        let first_line = root_text.lines().next().unwrap_or("");
        let source = match root.get("user").and_then(Value::as_str) {
            Some(user_id) => self
                .get_user(user_id)
                .await
                .map(|u| u.name)
                .unwrap_or_else(|_| user_id.to_string()),
            None => root
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or("bot")
                .to_string(),
        };

        let channel_name = self.get_channel(channel_id).await?.name_normalized;
        Ok(MessageThread {
            channel_id: channel_id.to_string(),
            thread_ts: thread_ts.to_string(),
            name: format!("t-{channel_name}-{thread_ts}"),
            topic: format!("{source} in #{channel_name}: {first_line}"),
        })
    }

    // ------------------------------------------------------------------
    // Presence, topics, membership management
    // ------------------------------------------------------------------

    pub async fn away(&mut self, away: bool) -> Result<(), SlackError> {
        let presence = if away { "away" } else { "auto" };
        self.api("users.setPresence", vec![field("presence", presence)])
            .await?;
        Ok(())
    }

    pub async fn is_user_away(&mut self, user_id: &str) -> Result<bool, SlackError> {
        let v = self
            .api("users.getPresence", vec![field("user", user_id)])
            .await
            .map_err(not_found)?;
        Ok(v.get("presence").and_then(Value::as_str) == Some("away"))
    }

    pub async fn set_topic(&mut self, channel_id: &str, topic: &str) -> Result<(), SlackError> {
        self.api(
            "conversations.setTopic",
            vec![field("channel", channel_id), field("topic", topic)],
        )
        .await?;
        Ok(())
    }

    pub async fn kick(&mut self, channel_id: &str, user_id: &str) -> Result<(), SlackError> {
        self.api(
            "conversations.kick",
            vec![field("channel", channel_id), field("user", user_id)],
        )
        .await?;
        Ok(())
    }

    pub async fn invite(&mut self, channel_id: &str, user_id: &str) -> Result<(), SlackError> {
        self.api(
            "conversations.invite",
            vec![field("channel", channel_id), field("users", user_id)],
        )
        .await?;
        Ok(())
    }

    pub async fn join(&mut self, channel_id: &str) -> Result<(), SlackError> {
        self.api("conversations.join", vec![field("channel", channel_id)])
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // History replay
    // ------------------------------------------------------------------

    /// Replay messages missed while the bridge was down, bounded to the
    /// last four days, into the internal event queue. Threads are spliced
    /// in so replies come out in chronological order. Best-effort.
    async fn history_replay(&mut self) {
        if self.status.last_timestamp <= 0.0 {
            return;
        }
        let oldest = self
            .status
            .last_timestamp
            .max(now_unix() - REPLAY_WINDOW_SECS);

        let mut conversations = self.joined_channels().await;
        self.refresh_ims().await;
        conversations.extend(self.ims.keys().cloned());

        info!(
            "replaying history for {} conversations since {oldest}",
            conversations.len()
        );
        for conversation in conversations {
            self.replay_conversation(&conversation, oldest).await;
        }
    }

    async fn replay_conversation(&mut self, conversation: &str, oldest: f64) {
        let mut cursor = String::new();
        loop {
            let mut fields = vec![
                field("channel", conversation),
                field("oldest", format!("{oldest:.6}")),
                field("limit", "1000"),
            ];
            if !cursor.is_empty() {
                fields.push(field("cursor", &cursor));
            }
            let v = match self.api("conversations.history", fields).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("history replay interrupted for {conversation}: {e}");
                    return;
                }
            };

            // The API returns newest first; popping from the end walks
            // chronologically. Thread roots push their replies (reversed)
            // back onto the stack so they replay in order too.
            let mut pending: Vec<Value> = v
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            while let Some(message) = pending.pop() {
                let ts = message
                    .get("ts")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let parsed = parse_ts(&ts);
                if parsed == self.status.last_timestamp {
                    continue;
                }
                if parsed > self.status.last_timestamp {
                    self.status.last_timestamp = parsed;
                }

                let is_thread_root =
                    message.get("thread_ts").and_then(Value::as_str) == Some(ts.as_str());
                if is_thread_root {
                    match self
                        .api(
                            "conversations.replies",
                            vec![
                                field("channel", conversation),
                                field("ts", &ts),
                                field("limit", "1000"),
                            ],
                        )
                        .await
                    {
                        Ok(r) => {
                            if let Some(replies) = r.get("messages").and_then(Value::as_array) {
                                for reply in replies.iter().skip(1).rev() {
                                    pending.push(reply.clone());
                                }
                            }
                        }
                        Err(e) => warn!("thread replay failed for {conversation}/{ts}: {e}"),
                    }
                }

                let mut message = message;
                if message.get("channel").is_none() {
                    message["channel"] = Value::String(conversation.to_string());
                }
                if message.get("type").is_none() {
                    message["type"] = Value::String("message".to_string());
                }
                match decode_event(&message) {
                    Some(SlackEvent::Message(mut m)) => {
                        // Same own-message rewrite the live path applies
                        if let Some(im) = self.ims.get(&m.channel) {
                            if im.user != m.user {
                                m.user = im.user.clone();
                                m.text = format!("I say: {}", m.text);
                            }
                        }
                        self.internal_events.push_back(SlackEvent::Message(m));
                    }
                    Some(ev @ SlackEvent::Bot(_)) => {
                        self.internal_events.push_back(ev);
                    }
                    _ => {}
                }
            }

            let next = Self::page_cursor(&v);
            if next.is_empty() || next == cursor {
                break;
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
impl SlackClient {
    pub(crate) fn test_client() -> SlackClient {
        SlackClient::new("xoxb-test".to_string(), None, None).expect("client")
    }

    pub(crate) fn seed_user(&mut self, id: &str, name: &str) {
        self.cache_user(User {
            id: id.to_string(),
            name: name.to_string(),
            profile: Profile::default(),
            is_admin: false,
            deleted: false,
        });
        self.users_prefetched = true;
    }

    pub(crate) fn seed_channel(&mut self, id: &str, name: &str) {
        self.channels.insert(
            id.to_string(),
            serde_json::from_value(serde_json::json!({
                "id": id,
                "name_normalized": name,
                "is_channel": true,
                "is_member": true,
            }))
            .expect("channel"),
        );
        self.channels_loaded = true;
    }

    pub(crate) fn seed_members(&mut self, channel: &str, users: &[&str]) {
        self.members.insert(
            channel.to_string(),
            users.iter().map(|u| u.to_string()).collect(),
        );
    }

    pub(crate) fn record_sent(&mut self, ts: &str) {
        self.sent_by_self.insert(ts.to_string(), Instant::now());
    }

    pub(crate) fn record_sent_at(&mut self, ts: &str, at: Instant) {
        self.sent_by_self.insert(ts.to_string(), at);
    }

    pub(crate) fn sent_by_self_len(&self) -> usize {
        self.sent_by_self.len()
    }

    pub(crate) fn has_cached_user(&self, id: &str) -> bool {
        self.users.contains_key(id)
    }

    pub(crate) fn last_timestamp(&self) -> f64 {
        self.status.last_timestamp
    }

    pub(crate) fn annoy_expiration(&self, user: &str) -> Option<f64> {
        self.status.annoy.get(user).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_suppression() {
        let mut client = SlackClient::test_client();
        client.record_sent("1000.0001");

        let frame = r#"{"type":"message","channel":"C1","user":"U1","text":"hi","ts":"1000.0001"}"#;
        let events = client.process_frame(frame).await;
        assert!(events.is_empty(), "own echo must be dropped");
        assert_eq!(client.sent_by_self_len(), 0, "entry is removed on match");

        // The same ts arriving again is a genuine message
        let events = client.process_frame(frame).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_echo_suppression_spares_edits() {
        let mut client = SlackClient::test_client();
        client.record_sent("1000.0002");

        let frame = r#"{"type":"message","subtype":"message_changed","channel":"C1",
            "message":{"user":"U1","text":"b","ts":"1000.0002"},
            "previous_message":{"user":"U1","text":"a","ts":"1000.0002"},
            "ts":"1000.0002"}"#
            .replace('\n', "");
        let events = client.process_frame(&frame).await;
        assert_eq!(events.len(), 1, "edits are never suppressed");
        assert_eq!(client.sent_by_self_len(), 1);
    }

    #[tokio::test]
    async fn test_sent_by_self_sweep() {
        let mut client = SlackClient::test_client();
        client.record_sent_at(
            "1.0",
            Instant::now() - Duration::from_secs(11),
        );
        client.record_sent("2.0");
        let _ = client.process_frame(r#"{"type":"hello"}"#).await;
        assert_eq!(client.sent_by_self_len(), 1, "stale entry swept");
    }

    #[tokio::test]
    async fn test_last_timestamp_monotone() {
        let mut client = SlackClient::test_client();
        let _ = client
            .process_frame(r#"{"type":"message","channel":"C1","user":"U1","text":"a","ts":"100.5"}"#)
            .await;
        assert_eq!(client.last_timestamp(), 100.5);
        let _ = client
            .process_frame(r#"{"type":"message","channel":"C1","user":"U1","text":"b","ts":"90.1"}"#)
            .await;
        assert_eq!(client.last_timestamp(), 100.5, "never goes backwards");
    }

    #[tokio::test]
    async fn test_user_change_invalidates_cache() {
        let mut client = SlackClient::test_client();
        client.seed_user("U1", "alice");
        assert!(client.has_cached_user("U1"));

        let frame = r#"{"type":"user_change","user":{"id":"U1","name":"alice2"}}"#;
        let events = client.process_frame(frame).await;
        assert!(events.is_empty());
        assert!(!client.has_cached_user("U1"), "entry invalidated");
    }

    #[tokio::test]
    async fn test_membership_events_mutate_cache() {
        let mut client = SlackClient::test_client();
        client.seed_members("C1", &["U1"]);

        let _ = client
            .process_frame(r#"{"type":"member_joined_channel","user":"U2","channel":"C1"}"#)
            .await;
        assert!(client.members["C1"].contains("U2"));

        let _ = client
            .process_frame(r#"{"type":"member_left_channel","user":"U1","channel":"C1"}"#)
            .await;
        assert!(!client.members["C1"].contains("U1"));
    }

    #[test]
    fn test_status_roundtrip() {
        let mut client = SlackClient::test_client();
        client.annoy_user("U7", 10);
        client
            .status
            .autoreactions
            .insert(
                "U3".to_string(),
                vec![Autoreaction {
                    reaction: "eyes".to_string(),
                    probability: 0.5,
                    expiration: 2e9,
                }],
            );
        client.status.last_timestamp = 1234.5;

        let blob = client.get_status();
        let restored =
            SlackClient::new("xoxb-test".to_string(), None, Some(&blob)).expect("client");
        assert_eq!(restored.status.last_timestamp, 1234.5);
        assert_eq!(restored.status.autoreactions["U3"][0].reaction, "eyes");
        assert!(restored.status.annoy.contains_key("U7"));
    }

    #[test]
    fn test_backoff_caps_at_two_minutes() {
        let mut client = SlackClient::test_client();
        for _ in 0..20 {
            client.bump_backoff();
        }
        assert_eq!(client.reconnect_delay(), Duration::from_secs(120));
    }
}
