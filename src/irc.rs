//! The IRC side of the bridge: a single-client IRC server translating
//! between the RFC 1459 vocabulary and the Slack client.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use anyhow::Result;
use regex_lite::Regex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::ControlRequest;
use crate::diff::seddiff;
use crate::msgparsing::{self, ItemKind, Token};
use crate::slack::types::{
    LoginInfo, MembershipChange, MessageThread, SlackEvent, TopicChange, parse_ts,
};
use crate::slack::{SlackClient, SlackError};

/// MPIMs idle for longer than this are not autojoined.
const MPIM_HIDE_DAYS: i64 = 50;

/// Events arriving before the IRC client registers are held here; the gate
/// bounds the queue so production never blocks.
const HELD_EVENTS_MAX: usize = 1024;

/// The client closed the link or sent QUIT; the supervisor restarts the
/// listener when it sees this.
#[derive(Debug, thiserror::Error)]
#[error("irc client disconnected")]
pub struct IrcDisconnect;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub nouserlist: bool,
    pub autojoin: bool,
    pub rejoin_on_mention: bool,
    pub ignored_channels: HashSet<String>,
    pub silenced_yellers: HashSet<String>,
    pub downloads_directory: PathBuf,
    pub formatted_max_lines: usize,
}

#[derive(Debug, Clone, Copy)]
#[repr(u16)]
enum Reply {
    Welcome = 1,
    YourHost = 2,
    UModeIs = 221,
    LuserClient = 251,
    Away = 301,
    Userhost = 302,
    Unaway = 305,
    NowAway = 306,
    WhoisUser = 311,
    WhoisServer = 312,
    WhoisOperator = 313,
    EndOfWho = 315,
    EndOfWhois = 318,
    WhoisChannels = 319,
    List = 322,
    ListEnd = 323,
    ChannelModeIs = 324,
    WhoisAccount = 330,
    NoTopic = 331,
    Topic = 332,
    WhoReply = 352,
    NamReply = 353,
    EndOfNames = 366,
    EndOfBanList = 368,
    ErrUnknownError = 400,
    ErrNoSuchNick = 401,
    ErrNoSuchChannel = 403,
    ErrInvalidCapCmd = 410,
    ErrNoTextToSend = 412,
    ErrUnknownCommand = 421,
    ErrFileError = 424,
    ErrErroneusNickname = 432,
    ErrNotRegistered = 451,
    ErrNeedMoreParams = 461,
    ErrUnknownMode = 472,
    ErrUModeUnknownFlag = 501,
}

impl Reply {
    fn code(self) -> u16 {
        self as u16
    }
}

/// The accepted IRC commands, dispatch keyed on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Nick,
    User,
    Ping,
    Quit,
    Cap,
    Join,
    Part,
    Privmsg,
    List,
    Who,
    Whois,
    Mode,
    Topic,
    Kick,
    Invite,
    Away,
    Sendfile,
    Annoy,
    Userhost,
}

const COMMAND_TABLE: &[(&str, Command)] = &[
    ("NICK", Command::Nick),
    ("USER", Command::User),
    ("PING", Command::Ping),
    ("QUIT", Command::Quit),
    ("CAP", Command::Cap),
    ("JOIN", Command::Join),
    ("PART", Command::Part),
    ("PRIVMSG", Command::Privmsg),
    ("LIST", Command::List),
    ("WHO", Command::Who),
    ("WHOIS", Command::Whois),
    ("MODE", Command::Mode),
    ("TOPIC", Command::Topic),
    ("KICK", Command::Kick),
    ("INVITE", Command::Invite),
    ("AWAY", Command::Away),
    ("SENDFILE", Command::Sendfile),
    ("ANNOY", Command::Annoy),
    ("USERHOST", Command::Userhost),
];

impl Command {
    fn lookup(name: &str) -> Option<Command> {
        COMMAND_TABLE
            .iter()
            .find(|(n, _)| name.eq_ignore_ascii_case(n))
            .map(|&(_, c)| c)
    }

    fn allowed_before_registration(self) -> bool {
        matches!(
            self,
            Command::Nick | Command::User | Command::Ping | Command::Quit | Command::Cap
        )
    }
}

/// Split an IRC line into command and arguments; a trailing `:arg` swallows
/// the rest of the line, spaces included.
fn parse_line(line: &str) -> (&str, Vec<String>) {
    let (cmd, mut text) = match line.split_once(' ') {
        Some((c, t)) => (c, t),
        None => (line, ""),
    };
    let mut args = Vec::new();
    while !text.is_empty() && !text.starts_with(':') {
        match text.split_once(' ') {
            Some((a, rest)) => {
                if !a.is_empty() {
                    args.push(a.to_string());
                }
                text = rest;
            }
            None => {
                args.push(text.to_string());
                text = "";
            }
        }
    }
    if let Some(rest) = text.strip_prefix(':') {
        args.push(rest.to_string());
    }
    (cmd, args)
}

enum Sender<'a> {
    Server,
    Client,
    Nick(&'a str),
}

/// Where an outgoing message or file is headed.
enum DestTarget {
    /// Channel id plus thread timestamp when the name is a known thread.
    Channel(String, Option<String>),
    User(String),
}

/// A normalized view over the message-like events, so rendering has one
/// shape to work with.
struct MsgView {
    channel: String,
    user: String,
    username: Option<String>,
    text: String,
    thread_ts: Option<String>,
    files: Vec<crate::slack::types::File>,
    is_action: bool,
}

pub struct IrcServer<W> {
    writer: W,
    hostname: String,
    self_id: String,
    self_name: String,
    team_name: String,

    nickname: String,
    username: String,
    realname: String,
    registered: bool,

    settings: ServerSettings,
    /// Channels the IRC client has left (or never joined); their traffic is
    /// suppressed, modulo mention-based rejoin.
    parted_channels: HashSet<String>,
    known_threads: HashMap<String, MessageThread>,
    held_events: VecDeque<SlackEvent>,
    mentions_regex_cache: HashMap<String, Option<Regex>>,
}

impl<W: AsyncWrite + Unpin> IrcServer<W> {
    pub fn new(login: &LoginInfo, settings: ServerSettings, writer: W) -> IrcServer<W> {
        IrcServer {
            writer,
            hostname: format!("{}.slack.com", login.team.domain),
            self_id: login.myself.id.clone(),
            self_name: login.myself.name.clone(),
            team_name: login.team.name.clone(),
            nickname: String::new(),
            username: String::new(),
            realname: String::new(),
            registered: false,
            parted_channels: settings.ignored_channels.clone(),
            settings,
            known_threads: HashMap::new(),
            held_events: VecDeque::new(),
            mentions_regex_cache: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Wire helpers
    // ------------------------------------------------------------------

    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        debug!("S - {line}");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await
    }

    async fn sendcmd(
        &mut self,
        sender: Sender<'_>,
        cmd: &str,
        args: &[&str],
    ) -> std::io::Result<()> {
        let prefix = match sender {
            Sender::Server => self.hostname.clone(),
            Sender::Client => format!("{}!{}@127.0.0.1", self.nickname, self.username),
            Sender::Nick(n) => format!("{n}!{n}@127.0.0.1"),
        };
        let mut line = format!(":{prefix} {cmd}");
        if let Some((last, head)) = args.split_last() {
            for arg in head {
                line.push(' ');
                line.push_str(arg);
            }
            line.push(' ');
            if last.contains(' ') || last.starts_with(':') || last.is_empty() {
                line.push(':');
            }
            line.push_str(last);
        }
        self.send_line(&line).await
    }

    async fn reply(&mut self, code: Reply, args: &[&str]) -> std::io::Result<()> {
        let nick = if self.nickname.is_empty() {
            "*".to_string()
        } else {
            self.nickname.clone()
        };
        let cmd = format!("{:03}", code.code());
        let mut full: Vec<&str> = vec![&nick];
        full.extend_from_slice(args);
        self.sendcmd(Sender::Server, &cmd, &full).await
    }

    async fn need_more_params(&mut self, cmd: &str, syntax: &str) -> std::io::Result<()> {
        let hint = format!("Not enough parameters. Syntax: /{cmd} {syntax}");
        self.reply(Reply::ErrNeedMoreParams, &[cmd, &hint]).await
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    pub async fn handle_line(&mut self, sl: &mut SlackClient, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        debug!("R - {line}");

        let (cmd_text, args) = parse_line(line);
        let Some(cmd) = Command::lookup(cmd_text) else {
            self.reply(Reply::ErrUnknownCommand, &[cmd_text, "Unknown command"])
                .await?;
            return Ok(());
        };
        if !self.registered && !cmd.allowed_before_registration() {
            self.reply(Reply::ErrNotRegistered, &["You have not registered"])
                .await?;
            return Ok(());
        }

        let result = match cmd {
            Command::Nick => self.cmd_nick(sl, &args).await,
            Command::User => self.cmd_user(sl, &args).await,
            Command::Ping => self.cmd_ping(&args).await,
            Command::Quit => Err(IrcDisconnect.into()),
            Command::Cap => self.cmd_cap(&args).await,
            Command::Join => self.cmd_join(sl, &args).await,
            Command::Part => self.cmd_part(&args).await,
            Command::Privmsg => self.cmd_privmsg(sl, &args).await,
            Command::List => self.cmd_list(sl).await,
            Command::Who => self.cmd_who(sl, &args).await,
            Command::Whois => self.cmd_whois(sl, &args).await,
            Command::Mode => self.cmd_mode(&args).await,
            Command::Topic => self.cmd_topic(sl, &args).await,
            Command::Kick => self.cmd_kick(sl, &args).await,
            Command::Invite => self.cmd_invite(sl, &args).await,
            Command::Away => self.cmd_away(sl, &args).await,
            Command::Sendfile => self.cmd_sendfile(sl, &args).await,
            Command::Annoy => self.cmd_annoy(sl, &args).await,
            Command::Userhost => self.cmd_userhost(sl, &args).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is::<IrcDisconnect>() => Err(e),
            Err(e) => match e.downcast_ref::<std::io::Error>() {
                // The link itself is gone, give up on the session
                Some(_) => Err(e),
                None => {
                    warn!("{cmd_text} failed: {e}");
                    let text = format!("Error: {e}");
                    self.reply(Reply::ErrUnknownError, &[cmd_text, &text])
                        .await?;
                    Ok(())
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    async fn cmd_user(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        if args.len() < 4 {
            return Ok(self.need_more_params("USER", "username mode _ realname").await?);
        }
        if self.registered {
            return Ok(());
        }
        self.username = args[0].clone();
        self.realname = args[3].clone();
        if !self.nickname.is_empty() {
            self.complete_registration(sl).await?;
        }
        Ok(())
    }

    async fn cmd_nick(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let Some(nickname) = args.first() else {
            return Ok(self.need_more_params("NICK", "nickname").await?);
        };
        if !self.registered {
            self.nickname = nickname.clone();
            if !self.username.is_empty() {
                self.complete_registration(sl).await?;
            }
        } else if *nickname != self.self_name {
            let hint = format!("Incorrect nickname, use {}", self.self_name);
            self.reply(Reply::ErrErroneusNickname, &[nickname, &hint])
                .await?;
        }
        Ok(())
    }

    async fn complete_registration(&mut self, sl: &mut SlackClient) -> Result<()> {
        self.registered = true;
        info!("irc client registered as {} ({})", self.nickname, self.realname);

        let welcome = format!(
            "Welcome to the Slack Server {}, {}!",
            self.team_name, self.nickname
        );
        self.reply(Reply::Welcome, &[&welcome]).await?;
        let host = format!(
            "Your host is {}, running version slirc-{}",
            self.hostname,
            env!("CARGO_PKG_VERSION")
        );
        self.reply(Reply::YourHost, &[&host]).await?;

        if self.settings.autojoin && !self.settings.nouserlist {
            // About to resolve many members per channel; batch load the
            // directory instead of one lookup per user.
            sl.prefetch_users().await;
        }

        let lusers = format!(
            "There are {} users and 0 services on 1 server",
            sl.known_user_count()
        );
        self.reply(Reply::LuserClient, &[&lusers]).await?;

        if self.nickname != self.self_name {
            let hint = format!("Incorrect nickname, use {}", self.self_name);
            let nick = self.nickname.clone();
            self.reply(Reply::ErrErroneusNickname, &[&nick, &hint])
                .await?;
            let new_nick = self.self_name.clone();
            self.sendcmd(Sender::Client, "NICK", &[&new_nick]).await?;
            self.nickname = new_nick;
        }

        if self.settings.autojoin {
            let cutoff =
                (chrono::Utc::now() - chrono::Duration::days(MPIM_HIDE_DAYS)).timestamp() as f64;
            for channel in sl.channels(false).await {
                if !channel.is_member {
                    continue;
                }
                let latest = channel
                    .latest
                    .as_ref()
                    .map(|l| parse_ts(&l.ts))
                    .unwrap_or(0.0);
                if channel.is_mpim && latest < cutoff {
                    continue;
                }
                let name = format!("#{}", channel.name_normalized);
                if self.parted_channels.contains(&name) {
                    info!("not joining {name} on irc, marked as ignored");
                    continue;
                }
                self.join_channel(sl, &name, &channel.id, channel.real_topic())
                    .await?;
            }
        } else {
            for channel in sl.channels(false).await {
                self.parted_channels
                    .insert(format!("#{}", channel.name_normalized));
            }
        }

        // Channel joining done; release whatever arrived early
        while let Some(ev) = self.held_events.pop_front() {
            self.dispatch_event(sl, ev).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plain commands
    // ------------------------------------------------------------------

    async fn cmd_ping(&mut self, args: &[String]) -> Result<()> {
        let token = args.first().map(String::as_str).unwrap_or("");
        let host = self.hostname.clone();
        self.sendcmd(Sender::Server, "PONG", &[&host, token]).await?;
        Ok(())
    }

    async fn cmd_cap(&mut self, args: &[String]) -> Result<()> {
        match args.first().map(String::as_str) {
            Some("LS") => {
                self.sendcmd(Sender::Server, "CAP", &["*", "LS", ""]).await?;
            }
            Some("END") => {}
            Some(other) => {
                let other = other.to_string();
                self.reply(
                    Reply::ErrInvalidCapCmd,
                    &["*", &other, "Invalid CAP subcommand"],
                )
                .await?;
            }
            None => {
                self.need_more_params("CAP", "subcommand").await?;
            }
        }
        Ok(())
    }

    async fn cmd_join(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let Some(channels) = args.first() else {
            return Ok(self.need_more_params("JOIN", "channels").await?);
        };
        for channel_name in channels.split(',') {
            self.parted_channels.remove(channel_name);

            let name = channel_name.strip_prefix('#').unwrap_or(channel_name);
            let channel = match sl.get_channel_by_name(name).await {
                Ok(c) => c,
                Err(_) => {
                    self.reply(Reply::ErrNoSuchChannel, &[channel_name, "No such channel"])
                        .await?;
                    continue;
                }
            };
            if !channel.is_member {
                if let Err(e) = sl.join(&channel.id).await {
                    let text = format!("Unable to join server channel: {e}");
                    self.reply(Reply::ErrNoSuchChannel, &[channel_name, &text])
                        .await?;
                }
            }
            self.join_channel(sl, channel_name, &channel.id, channel.real_topic())
                .await?;
        }
        Ok(())
    }

    async fn cmd_part(&mut self, args: &[String]) -> Result<()> {
        let Some(channel_name) = args.first().cloned() else {
            return Ok(self.need_more_params("PART", "channel [message]").await?);
        };
        self.parted_channels.insert(channel_name.clone());
        self.known_threads.remove(&channel_name);
        let message = args.get(1).cloned();
        match message {
            Some(m) if !m.is_empty() => {
                self.sendcmd(Sender::Client, "PART", &[&channel_name, &m])
                    .await?
            }
            _ => self.sendcmd(Sender::Client, "PART", &[&channel_name]).await?,
        }
        Ok(())
    }

    async fn resolve_dest(
        &mut self,
        sl: &mut SlackClient,
        dest: &str,
    ) -> Result<DestTarget, SlackError> {
        if let Some(thread) = self.known_threads.get(dest) {
            return Ok(DestTarget::Channel(
                thread.channel_id.clone(),
                Some(thread.thread_ts.clone()),
            ));
        }
        if let Some(name) = dest.strip_prefix('#') {
            let channel = sl.get_channel_by_name(name).await?;
            return Ok(DestTarget::Channel(channel.id, None));
        }
        let user = sl.get_user_by_name(dest).await?;
        Ok(DestTarget::User(user.id))
    }

    async fn cmd_privmsg(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let (Some(dest), Some(msg)) = (args.first(), args.get(1)) else {
            return Ok(self.need_more_params("PRIVMSG", "destination message").await?);
        };
        if msg.is_empty() {
            self.reply(Reply::ErrNoTextToSend, &["No text to send"]).await?;
            return Ok(());
        }

        // "/me does something" arrives as \x01ACTION does something\x01
        let (msg, action) = match msg
            .strip_prefix("\x01ACTION ")
            .and_then(|m| m.strip_suffix('\x01'))
        {
            Some(inner) => (inner.to_string(), true),
            None => (msg.clone(), false),
        };

        let target = match self.resolve_dest(sl, dest).await {
            Ok(t) => t,
            Err(_) => {
                let (code, text) = if dest.starts_with('#') {
                    (Reply::ErrNoSuchChannel, "No such channel")
                } else {
                    (Reply::ErrNoSuchNick, "No such nick")
                };
                self.reply(code, &[dest, text]).await?;
                return Ok(());
            }
        };

        match target {
            DestTarget::Channel(channel_id, thread_ts) => {
                let text = self.addmagic(sl, &msg, Some(&channel_id)).await;
                if let Err(e) = sl
                    .send_message(&channel_id, &text, action, false, thread_ts.as_deref())
                    .await
                {
                    let text = format!("Unable to send message: {e}");
                    self.reply(Reply::ErrNoSuchChannel, &[dest, &text]).await?;
                }
            }
            DestTarget::User(user_id) => {
                let text = self.addmagic(sl, &msg, None).await;
                if let Err(e) = sl.send_message_to_user(&user_id, &text, action, false).await {
                    let text = format!("Unable to send message: {e}");
                    self.reply(Reply::ErrNoSuchNick, &[dest, &text]).await?;
                } else if sl.is_user_away(&user_id).await.unwrap_or(false) {
                    let status = sl
                        .get_user(&user_id)
                        .await
                        .map(|u| u.profile.status_text)
                        .unwrap_or_default();
                    let status = if status.is_empty() {
                        "Away".to_string()
                    } else {
                        status
                    };
                    self.reply(Reply::Away, &[dest, &status]).await?;
                }
            }
        }
        Ok(())
    }

    async fn cmd_list(&mut self, sl: &mut SlackClient) -> Result<()> {
        for channel in sl.channels(true).await {
            let topic = self
                .parse_slack_message(sl, channel.real_topic(), "", "")
                .await
                .replace('\n', " | ");
            let name = format!("#{}", channel.name_normalized);
            let members = channel.num_members.to_string();
            self.reply(Reply::List, &[&name, &members, &topic]).await?;
        }
        self.reply(Reply::ListEnd, &["End of LIST"]).await?;
        Ok(())
    }

    async fn cmd_who(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let Some(name) = args.first().cloned() else {
            return Ok(self.need_more_params("WHO", "name").await?);
        };
        let host = self.hostname.clone();
        if let Some(channel_name) = name.strip_prefix('#') {
            if let Ok(channel) = sl.get_channel_by_name(channel_name).await {
                let members = sl.get_members(&channel.id).await.unwrap_or_default();
                let mut members: Vec<_> = members.into_iter().collect();
                members.sort();
                for member in members {
                    let Ok(user) = sl.get_user(&member).await else {
                        continue;
                    };
                    if user.deleted {
                        continue;
                    }
                    let info = format!("0 {}", user.profile.real_name);
                    self.reply(
                        Reply::WhoReply,
                        &[&name, &user.name, &host, &host, &user.name, "H", &info],
                    )
                    .await?;
                }
            }
        } else if let Ok(user) = sl.get_user_by_name(&name).await {
            let info = format!("0 {}", user.profile.real_name);
            self.reply(
                Reply::WhoReply,
                &[&name, &user.name, &host, &host, &user.name, "H", &info],
            )
            .await?;
        }
        self.reply(Reply::EndOfWho, &[&name, "End of WHO list"]).await?;
        Ok(())
    }

    async fn cmd_whois(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let Some(nickname) = args.first().cloned() else {
            return Ok(self.need_more_params("WHOIS", "nickname").await?);
        };
        if nickname.contains('*') {
            self.reply(Reply::ErrUnknownCommand, &["Wildcards are not supported"])
                .await?;
            return Ok(());
        }
        let user = match sl.get_user_by_name(&nickname).await {
            Ok(u) => u,
            Err(_) => {
                self.reply(Reply::ErrNoSuchNick, &[&nickname, "No such nick"])
                    .await?;
                return Ok(());
            }
        };

        let host = self.hostname.clone();
        self.reply(
            Reply::WhoisUser,
            &[&nickname, &user.id, &host, "*", &user.profile.real_name],
        )
        .await?;
        if let Some(email) = &user.profile.email {
            self.reply(Reply::WhoisAccount, &[&nickname, email, "email"])
                .await?;
        }
        let team = self.team_name.clone();
        self.reply(Reply::WhoisServer, &[&nickname, &host, &team]).await?;
        if user.is_admin {
            self.reply(Reply::WhoisOperator, &[&nickname, "is a Workspace Admin"])
                .await?;
        }

        // Common channels, from whatever member sets are already cached
        let mut channels = Vec::new();
        for channel in sl.channels(false).await {
            if sl
                .cached_members(&channel.id)
                .is_some_and(|m| m.contains(&user.id))
            {
                channels.push(format!("#{}", channel.name_normalized));
            }
        }
        if !channels.is_empty() {
            channels.sort();
            let joined = channels.join(" ");
            self.reply(Reply::WhoisChannels, &[&nickname, &joined]).await?;
        }

        self.reply(Reply::EndOfWhois, &[&nickname, "End of /WHOIS list."])
            .await?;
        Ok(())
    }

    async fn cmd_mode(&mut self, args: &[String]) -> Result<()> {
        let Some(target) = args.first().cloned() else {
            return Ok(self.need_more_params("MODE", "target [modes]").await?);
        };
        let modes = args.get(1).cloned();
        if target.starts_with('#') {
            match modes {
                Some(modes) => {
                    for mode in modes.chars() {
                        if mode == 'b' {
                            self.reply(
                                Reply::EndOfBanList,
                                &[&target, "End of Channel Ban List"],
                            )
                            .await?;
                            return Ok(());
                        }
                        if mode != '+' && mode != '-' {
                            let mode = mode.to_string();
                            self.reply(
                                Reply::ErrUnknownMode,
                                &[&mode, "is an unknown mode char to me"],
                            )
                            .await?;
                            return Ok(());
                        }
                    }
                }
                None => {
                    self.reply(Reply::ChannelModeIs, &[&target, "+"]).await?;
                }
            }
        } else if modes.is_some() {
            self.reply(Reply::ErrUModeUnknownFlag, &["Unknown MODE flag"])
                .await?;
        } else {
            self.reply(Reply::UModeIs, &[&target, "+"]).await?;
        }
        Ok(())
    }

    async fn cmd_topic(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let Some(channel_name) = args.first().cloned() else {
            return Ok(self.need_more_params("TOPIC", "channel [topic]").await?);
        };
        let Some(name) = channel_name.strip_prefix('#') else {
            self.reply(Reply::ErrNoSuchChannel, &[&channel_name, "No such channel"])
                .await?;
            return Ok(());
        };
        let channel = match sl.get_channel_by_name(name).await {
            Ok(c) => c,
            Err(_) => {
                self.reply(Reply::ErrNoSuchChannel, &[&channel_name, "No such channel"])
                    .await?;
                return Ok(());
            }
        };

        match args.get(1) {
            None => {
                let topic = self
                    .parse_slack_message(sl, channel.real_topic(), "", &channel_name)
                    .await
                    .replace('\n', " | ");
                if topic.is_empty() {
                    self.reply(Reply::NoTopic, &[&channel_name, "No topic is set."])
                        .await?;
                } else {
                    self.reply(Reply::Topic, &[&channel_name, &topic]).await?;
                }
            }
            Some(topic) => {
                if let Err(e) = sl.set_topic(&channel.id, topic).await {
                    let text = format!("Unable to set topic to {topic}: {e}");
                    self.reply(Reply::ErrUnknownCommand, &[&text]).await?;
                }
            }
        }
        Ok(())
    }

    async fn cmd_kick(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let (Some(channel_name), Some(nickname)) = (args.first().cloned(), args.get(1).cloned())
        else {
            return Ok(self.need_more_params("KICK", "channel nickname [message]").await?);
        };
        let channel = match sl
            .get_channel_by_name(channel_name.strip_prefix('#').unwrap_or(&channel_name))
            .await
        {
            Ok(c) => c,
            Err(_) => {
                self.reply(Reply::ErrNoSuchChannel, &[&channel_name, "No such channel"])
                    .await?;
                return Ok(());
            }
        };
        let user = match sl.get_user_by_name(&nickname).await {
            Ok(u) => u,
            Err(_) => {
                self.reply(Reply::ErrNoSuchNick, &[&nickname, "No such nick"])
                    .await?;
                return Ok(());
            }
        };
        if let Err(e) = sl.kick(&channel.id, &user.id).await {
            let text = format!("Error: {e}");
            self.reply(Reply::ErrUnknownCommand, &[&text]).await?;
        }
        Ok(())
    }

    async fn cmd_invite(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let (Some(nickname), Some(channel_name)) = (args.first().cloned(), args.get(1).cloned())
        else {
            return Ok(self.need_more_params("INVITE", "nickname channel").await?);
        };
        let user = match sl.get_user_by_name(&nickname).await {
            Ok(u) => u,
            Err(_) => {
                self.reply(Reply::ErrNoSuchNick, &[&nickname, "No such nick"])
                    .await?;
                return Ok(());
            }
        };
        let channel = match sl
            .get_channel_by_name(channel_name.strip_prefix('#').unwrap_or(&channel_name))
            .await
        {
            Ok(c) => c,
            Err(_) => {
                self.reply(Reply::ErrNoSuchChannel, &[&channel_name, "No such channel"])
                    .await?;
                return Ok(());
            }
        };
        if let Err(e) = sl.invite(&channel.id, &user.id).await {
            let text = format!("Error: {e}");
            self.reply(Reply::ErrUnknownCommand, &[&text]).await?;
        }
        Ok(())
    }

    async fn cmd_away(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let message = args.first().map(String::as_str).unwrap_or("");
        if !message.is_empty() {
            sl.away(true).await?;
            self.reply(Reply::NowAway, &["You have been marked as being away"])
                .await?;
        } else {
            sl.away(false).await?;
            self.reply(Reply::Unaway, &["You are no longer marked as being away"])
                .await?;
        }
        Ok(())
    }

    async fn cmd_sendfile(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let (Some(dest), Some(filename)) = (args.first().cloned(), args.get(1).cloned()) else {
            return Ok(self.need_more_params("SENDFILE", "destination path").await?);
        };
        let target = match self.resolve_dest(sl, &dest).await {
            Ok(t) => t,
            Err(_) => {
                self.reply(Reply::ErrNoSuchChannel, &[&dest, "No such nick/channel"])
                    .await?;
                return Ok(());
            }
        };
        let content = match tokio::fs::read(&filename).await {
            Ok(c) => c,
            Err(e) => {
                let text = e.to_string();
                self.reply(Reply::ErrFileError, &[&text]).await?;
                return Ok(());
            }
        };
        let short_name = filename.rsplit('/').next().unwrap_or(&filename).to_string();
        let result = match target {
            DestTarget::Channel(channel_id, thread_ts) => {
                sl.send_file(&channel_id, content, &short_name, thread_ts.as_deref())
                    .await
            }
            DestTarget::User(user_id) => {
                sl.send_file_to_user(&user_id, content, &short_name).await
            }
        };
        match result {
            Ok(()) => {
                let nick = self.nickname.clone();
                let text = format!("Upload of {filename} completed");
                self.sendcmd(Sender::Server, "NOTICE", &[&nick, &text]).await?;
            }
            Err(e) => {
                let text = format!("Unable to send file {e}");
                self.reply(Reply::ErrFileError, &[&text]).await?;
            }
        }
        Ok(())
    }

    async fn cmd_annoy(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let Some(nickname) = args.first().cloned() else {
            return Ok(self.need_more_params("ANNOY", "user [duration]").await?);
        };
        let minutes = match args.get(1) {
            None => 10,
            Some(d) => match d.parse::<i64>() {
                Ok(m) => m.unsigned_abs(),
                Err(_) => {
                    self.need_more_params("ANNOY", "user [duration]").await?;
                    return Ok(());
                }
            },
        };
        let user = match sl.get_user_by_name(&nickname).await {
            Ok(u) => u,
            Err(_) => {
                self.reply(Reply::ErrNoSuchNick, &[&nickname, "No such nick"])
                    .await?;
                return Ok(());
            }
        };
        sl.annoy_user(&user.id, minutes);
        let nick = self.nickname.clone();
        let text = format!("Will annoy {nickname} for {minutes} minutes");
        self.sendcmd(Sender::Server, "NOTICE", &[&nick, &text]).await?;
        Ok(())
    }

    async fn cmd_userhost(&mut self, sl: &mut SlackClient, args: &[String]) -> Result<()> {
        let mut replies = Vec::new();
        for nickname in args {
            let Ok(user) = sl.get_user_by_name(nickname).await else {
                continue;
            };
            let admin = if user.is_admin { "*" } else { "" };
            let away = if sl.is_user_away(&user.id).await.unwrap_or(false) {
                "-"
            } else {
                "+"
            };
            replies.push(format!("{nickname}{admin}={away}{}", self.hostname));
        }
        let joined = replies.join(" ");
        self.reply(Reply::Userhost, &[&joined]).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Joining channels
    // ------------------------------------------------------------------

    /// Emit the JOIN/MODE/TOPIC/NAMES block for a channel or thread.
    /// `channel_id` is the Slack-side id (the parent channel for threads).
    async fn join_channel(
        &mut self,
        sl: &mut SlackClient,
        channel_name: &str,
        channel_id: &str,
        raw_topic: &str,
    ) -> Result<()> {
        let mut userlist = String::new();
        if !self.settings.nouserlist {
            let members = sl.get_members(channel_id).await.unwrap_or_default();
            let mut names = Vec::new();
            for member in members {
                match sl.get_user(&member).await {
                    Ok(u) if u.deleted => {}
                    Ok(u) => {
                        let prefix = if u.is_admin { "@" } else { "" };
                        names.push(format!("{prefix}{}", u.name));
                    }
                    Err(_) => {}
                }
            }
            names.sort();
            userlist = names.join(" ");
        }

        let yelldest = match sl.get_channel(channel_id).await {
            Ok(c) => format!("#{}", c.name_normalized),
            Err(_) => String::new(),
        };
        let topic = self
            .parse_slack_message(sl, raw_topic, "", &yelldest)
            .await
            .replace('\n', " | ");

        self.sendcmd(Sender::Client, "JOIN", &[channel_name]).await?;
        self.sendcmd(Sender::Server, "MODE", &[channel_name, "+"]).await?;
        self.reply(Reply::Topic, &[channel_name, &topic]).await?;
        self.reply(Reply::NamReply, &["=", channel_name, &userlist])
            .await?;
        self.reply(Reply::EndOfNames, &[channel_name, "End of NAMES list"])
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound translation (IRC text -> Slack wire)
    // ------------------------------------------------------------------

    /// Escape entities, rewrite yells and turn member handles into
    /// `<@id>` mentions (channels only).
    async fn addmagic(
        &mut self,
        sl: &mut SlackClient,
        msg: &str,
        channel_id: Option<&str>,
    ) -> String {
        let mut msg = msgparsing::encode_entities(msg)
            .replace("@here", "<!here>")
            .replace("@channel", "<!channel>")
            .replace("@everyone", "<!everyone>");

        let Some(channel_id) = channel_id else {
            return msg;
        };
        let Some(regex) = self.mention_regex(sl, channel_id).await else {
            return msg;
        };

        // Replace right to left so earlier offsets stay valid
        let matches: Vec<(usize, usize)> = regex
            .find_iter(&msg)
            .map(|m| (m.start(), m.end()))
            .collect();
        for (start, end) in matches.into_iter().rev() {
            let matched = msg[start..end].to_string();
            if matched.starts_with("://") {
                // Inside a url
                continue;
            }
            if let Ok(user) = sl.get_user_by_name(&matched).await {
                msg.replace_range(start..end, &format!("<@{}>", user.id));
            }
        }
        msg
    }

    async fn mention_regex(&mut self, sl: &mut SlackClient, channel_id: &str) -> Option<Regex> {
        if let Some(cached) = self.mentions_regex_cache.get(channel_id) {
            return cached.clone();
        }
        let mut names = Vec::new();
        if let Ok(members) = sl.get_members(channel_id).await {
            for member in members {
                if let Ok(user) = sl.get_user(&member).await {
                    if !user.deleted {
                        names.push(user.name);
                    }
                }
            }
        }
        let regex = if names.is_empty() {
            None
        } else {
            let pattern = names
                .iter()
                .map(|n| format!(r"((://\S*)?\b{}\b)", regex_lite::escape(n)))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&pattern).ok()
        };
        self.mentions_regex_cache
            .insert(channel_id.to_string(), regex.clone());
        regex
    }

    // ------------------------------------------------------------------
    // Inbound translation (Slack wire -> IRC text)
    // ------------------------------------------------------------------

    /// Render wire text for IRC: resolve mentions and channel refs, expand
    /// yells, inline or file away preformatted blocks, and collect labelled
    /// links into a reference footer.
    async fn parse_slack_message(
        &mut self,
        sl: &mut SlackClient,
        text: &str,
        source: &str,
        destination: &str,
    ) -> String {
        let mut out = String::new();
        let mut links = String::new();
        let mut refn = 1usize;

        for token in msgparsing::tokenize(text) {
            match token {
                Token::Text(t) => out.push_str(&t),
                Token::Pre(block) => {
                    let max = self.settings.formatted_max_lines;
                    if max > 0 && block.lines() > max {
                        match self.store_preformatted(&block.txt) {
                            Ok(path) => {
                                out.push_str(&format!(
                                    "\n === PREFORMATTED TEXT AT file://{}\n",
                                    path.display()
                                ));
                            }
                            Err(e) => {
                                warn!("unable to store preformatted block: {e}");
                                out.push_str(&format!("```{}```", block.txt));
                            }
                        }
                    } else {
                        out.push_str(&format!("```{}```", block.txt));
                    }
                }
                Token::Special(item) => match item.kind {
                    ItemKind::Mention => match sl.get_user(&item.val).await {
                        Ok(u) => out.push_str(&u.name),
                        Err(_) => out.push_str(&item.val),
                    },
                    ItemKind::Channel => match sl.get_channel(&item.val).await {
                        Ok(c) => out.push_str(&format!("#{}", c.name_normalized)),
                        Err(_) => out.push_str("#ERROR_MISSING_CHANNEL"),
                    },
                    ItemKind::Yell => {
                        let silenced = self.settings.silenced_yellers.contains(source)
                            || self.settings.silenced_yellers.contains(destination);
                        let attribution = if silenced {
                            ":".to_string()
                        } else {
                            format!(" [{}]:", self.nickname)
                        };
                        let phrase = match item.val.as_str() {
                            "here" => "yelling",
                            "channel" => "YELLING LOUDER",
                            _ => "DEAFENING YELL",
                        };
                        out.push_str(phrase);
                        out.push_str(&attribution);
                    }
                    ItemKind::Other => match item.human {
                        None => out.push_str(&item.val),
                        Some(label) => {
                            let label = if label.contains("://") {
                                "LINK".to_string()
                            } else {
                                label
                            };
                            let marker = superscript(refn);
                            links.push_str(&format!("\n  {marker} {}", item.val));
                            out.push_str(&label);
                            out.push_str(&marker);
                            refn += 1;
                        }
                    },
                },
            }
        }
        out + &links
    }

    fn store_preformatted(&self, text: &str) -> std::io::Result<PathBuf> {
        let path = self
            .settings
            .downloads_directory
            .join(format!("slirc-attachment-{}.txt", Uuid::new_v4()));
        std::fs::write(&path, text)?;
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Slack events -> IRC lines
    // ------------------------------------------------------------------

    /// Entry point for everything the Slack client produces. Events before
    /// registration are held and replayed by the gate.
    pub async fn slack_event(&mut self, sl: &mut SlackClient, ev: SlackEvent) -> Result<()> {
        if !self.registered {
            self.held_events.push_back(ev);
            if self.held_events.len() > HELD_EVENTS_MAX {
                self.held_events.pop_front();
            }
            return Ok(());
        }
        self.dispatch_event(sl, ev).await
    }

    async fn dispatch_event(&mut self, sl: &mut SlackClient, ev: SlackEvent) -> Result<()> {
        match ev {
            SlackEvent::Message(m) => {
                let view = MsgView {
                    channel: m.channel,
                    user: m.user,
                    username: None,
                    text: m.text,
                    thread_ts: m.thread_ts,
                    files: m.files,
                    is_action: m.is_action,
                };
                self.render_event(sl, view, "").await
            }
            SlackEvent::Bot(b) => {
                let prefix = format!("[{}] ", b.username);
                let text = b.rendered_text();
                let view = MsgView {
                    channel: b.channel,
                    user: String::new(),
                    username: Some(b.username),
                    text,
                    thread_ts: b.thread_ts,
                    files: Vec::new(),
                    is_action: false,
                };
                self.render_event(sl, view, &prefix).await
            }
            SlackEvent::Edit(e) => {
                if !e.is_changed() {
                    return Ok(());
                }
                let view = MsgView {
                    channel: e.channel,
                    user: e.previous.user,
                    username: None,
                    text: seddiff(&e.previous.text, &e.current.text),
                    thread_ts: e.previous.thread_ts,
                    files: Vec::new(),
                    is_action: false,
                };
                self.render_event(sl, view, "").await
            }
            SlackEvent::Delete(d) => {
                let view = MsgView {
                    channel: d.channel,
                    user: d.previous.user,
                    username: None,
                    text: format!("[deleted] {}", d.previous.text),
                    thread_ts: d.previous.thread_ts,
                    files: Vec::new(),
                    is_action: false,
                };
                self.render_event(sl, view, "").await
            }
            SlackEvent::Join(m) => self.member_change(sl, m, true).await,
            SlackEvent::Leave(m) => self.member_change(sl, m, false).await,
            SlackEvent::TopicChange(t) => self.topic_changed(sl, t).await,
            SlackEvent::GroupJoined(g) => {
                let name = format!("#{}", g.channel.name_normalized);
                self.join_channel(sl, &name, &g.channel.id, g.channel.real_topic())
                    .await
            }
            // Consumed inside the Slack client
            SlackEvent::Typing(_) | SlackEvent::UserChange { .. } => Ok(()),
        }
    }

    async fn render_event(
        &mut self,
        sl: &mut SlackClient,
        view: MsgView,
        prefix: &str,
    ) -> Result<()> {
        let source = match &view.username {
            Some(name) => name.clone(),
            None if !view.user.is_empty() => match sl.get_user(&view.user).await {
                Ok(u) => u.name,
                Err(_) => view.user.clone(),
            },
            None => "bot".to_string(),
        };

        let mentioned = view.text.contains(&format!("<@{}>", self.self_id));

        let (mut dest, yelldest, channel) = match sl.get_channel(&view.channel).await {
            Ok(c) => {
                let name = format!("#{}", c.name_normalized);
                (name.clone(), name, Some(c))
            }
            // Not a channel: an IM, delivered as a private message
            Err(SlackError::NotFound) => (self.nickname.clone(), String::new(), None),
            Err(e) => {
                warn!("unable to resolve channel {}: {e}", view.channel);
                return Ok(());
            }
        };

        if let Some(channel) = &channel {
            match &view.thread_ts {
                None => {
                    if self.parted_channels.contains(&dest) {
                        if mentioned && self.settings.rejoin_on_mention {
                            self.parted_channels.remove(&dest);
                            let topic = channel.real_topic().to_string();
                            let id = channel.id.clone();
                            self.join_channel(sl, &dest, &id, &topic).await?;
                        } else {
                            return Ok(());
                        }
                    }
                }
                Some(thread_ts) => {
                    let thread_dest = format!("#t-{}-{}", channel.name_normalized, thread_ts);
                    if self.parted_channels.contains(&thread_dest) {
                        if mentioned && self.settings.rejoin_on_mention {
                            self.parted_channels.remove(&thread_dest);
                        } else {
                            return Ok(());
                        }
                    }
                    // New threads on parted channels stay suppressed unless
                    // the user is mentioned; known threads keep flowing.
                    if self.parted_channels.contains(&dest)
                        && !self.known_threads.contains_key(&thread_dest)
                        && !mentioned
                    {
                        return Ok(());
                    }
                    if !self.known_threads.contains_key(&thread_dest) {
                        let thread = match sl.get_thread(thread_ts, &view.channel).await {
                            Ok(t) => t,
                            Err(e) => {
                                warn!("unable to build thread channel {thread_dest}: {e}");
                                return Ok(());
                            }
                        };
                        let name = format!("#{}", thread.name);
                        let topic = thread.topic.clone();
                        let id = thread.channel_id.clone();
                        self.join_channel(sl, &name, &id, &topic).await?;
                        self.known_threads.insert(name, thread);
                    }
                    dest = thread_dest;
                }
            }
        }

        let mut text = view.text;
        for f in &view.files {
            text.push_str(&format!(
                "\n[file upload] {}\n{} {} bytes\n{}",
                f.name, f.mimetype, f.size, f.url_private
            ));
        }

        let rendered = self
            .parse_slack_message(sl, &format!("{prefix}{text}"), &source, &yelldest)
            .await;
        for line in rendered.split('\n') {
            if line.is_empty() {
                continue;
            }
            let line = if view.is_action {
                format!("\x01ACTION {line}\x01")
            } else {
                line.to_string()
            };
            self.sendcmd(Sender::Nick(&source), "PRIVMSG", &[&dest, &line])
                .await?;
        }
        Ok(())
    }

    async fn member_change(
        &mut self,
        sl: &mut SlackClient,
        ev: MembershipChange,
        joined: bool,
    ) -> Result<()> {
        // Membership changed, the mention regexp is stale
        self.mentions_regex_cache.remove(&ev.channel);

        let user = match sl.get_user(&ev.user).await {
            Ok(u) => u,
            Err(e) => {
                warn!("membership change for unknown user {}: {e}", ev.user);
                return Ok(());
            }
        };
        if user.deleted {
            return Ok(());
        }
        let channel = match sl.get_channel(&ev.channel).await {
            Ok(c) => format!("#{}", c.name_normalized),
            Err(_) => return Ok(()),
        };
        if self.parted_channels.contains(&channel) {
            return Ok(());
        }
        let cmd = if joined { "JOIN" } else { "PART" };
        self.sendcmd(Sender::Nick(&user.name), cmd, &[&channel]).await?;
        Ok(())
    }

    async fn topic_changed(&mut self, sl: &mut SlackClient, ev: TopicChange) -> Result<()> {
        let user = match sl.get_user(&ev.user).await {
            Ok(u) => u,
            Err(_) => return Ok(()),
        };
        let channel = match sl.get_channel_refresh(&ev.channel).await {
            Ok(c) => format!("#{}", c.name_normalized),
            Err(_) => return Ok(()),
        };
        if self.parted_channels.contains(&channel) {
            return Ok(());
        }
        self.sendcmd(Sender::Nick(&user.name), "TOPIC", &[&channel, &ev.topic])
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control socket commands
    // ------------------------------------------------------------------

    /// Requests from local helpers; messages sent this way are echoed back
    /// to the IRC client through the normal RTM path.
    pub async fn handle_control(&mut self, sl: &mut SlackClient, req: ControlRequest) {
        match req {
            ControlRequest::Write { dest, text } => {
                let result = match self.resolve_dest(sl, &dest).await {
                    Ok(DestTarget::Channel(channel_id, thread_ts)) => {
                        let text = self.addmagic(sl, &text, Some(&channel_id)).await;
                        sl.send_message(&channel_id, &text, false, true, thread_ts.as_deref())
                            .await
                    }
                    Ok(DestTarget::User(user_id)) => {
                        let text = self.addmagic(sl, &text, None).await;
                        sl.send_message_to_user(&user_id, &text, false, true).await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("control write to {dest} failed: {e}");
                }
            }
            ControlRequest::SendFile {
                dest,
                filename,
                content,
                reply,
            } => {
                let result = match self.resolve_dest(sl, &dest).await {
                    Ok(DestTarget::Channel(channel_id, thread_ts)) => {
                        sl.send_file(&channel_id, content, &filename, thread_ts.as_deref())
                            .await
                    }
                    Ok(DestTarget::User(user_id)) => {
                        sl.send_file_to_user(&user_id, content, &filename).await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!("control sendfile to {dest} failed: {e}");
                }
                let _ = reply.send(result.is_ok());
            }
        }
    }
}

fn superscript(n: usize) -> String {
    n.to_string()
        .chars()
        .map(|c| match c {
            '0' => '⁰',
            '1' => '¹',
            '2' => '²',
            '3' => '³',
            '4' => '⁴',
            '5' => '⁵',
            '6' => '⁶',
            '7' => '⁷',
            '8' => '⁸',
            '9' => '⁹',
            other => other,
        })
        .collect()
}

#[cfg(test)]
impl<W: AsyncWrite + Unpin> IrcServer<W> {
    pub(crate) fn seed_thread(&mut self, name: &str, thread: MessageThread) {
        self.known_threads.insert(name.to_string(), thread);
    }

    pub(crate) fn seed_mention_regex(&mut self, channel_id: &str, names: &[&str]) {
        let pattern = names
            .iter()
            .map(|n| format!(r"((://\S*)?\b{}\b)", regex_lite::escape(n)))
            .collect::<Vec<_>>()
            .join("|");
        self.mentions_regex_cache
            .insert(channel_id.to_string(), Regex::new(&pattern).ok());
    }

    pub(crate) fn writer_ref(&self) -> &W {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack::types::{Message, MessageEdit, NoChanMessage};

    fn login_info() -> LoginInfo {
        serde_json::from_value(serde_json::json!({
            "team": {"id": "T1", "name": "testteam", "domain": "testteam"},
            "self": {"id": "USELF", "name": "alice"},
            "url": "wss://example.invalid/rtm"
        }))
        .unwrap()
    }

    fn settings() -> ServerSettings {
        ServerSettings {
            nouserlist: true,
            autojoin: true,
            rejoin_on_mention: true,
            ignored_channels: HashSet::new(),
            silenced_yellers: HashSet::new(),
            downloads_directory: std::env::temp_dir(),
            formatted_max_lines: 0,
        }
    }

    fn server(settings: ServerSettings) -> IrcServer<Vec<u8>> {
        IrcServer::new(&login_info(), settings, Vec::new())
    }

    fn client() -> SlackClient {
        let mut sl = SlackClient::test_client();
        sl.seed_user("USELF", "alice");
        sl.seed_user("U1", "bob");
        sl.seed_channel("C1", "general");
        sl
    }

    fn output(server: &IrcServer<Vec<u8>>) -> Vec<String> {
        String::from_utf8(server.writer_ref().clone())
            .unwrap()
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    async fn register(server: &mut IrcServer<Vec<u8>>, sl: &mut SlackClient) {
        server.handle_line(sl, "NICK alice").await.unwrap();
        server.handle_line(sl, "USER alice 0 * :Alice").await.unwrap();
        assert!(server.registered);
    }

    fn message(channel: &str, user: &str, text: &str) -> SlackEvent {
        SlackEvent::Message(Message {
            channel: channel.to_string(),
            user: user.to_string(),
            text: text.to_string(),
            ts: "1.0".to_string(),
            thread_ts: None,
            files: Vec::new(),
            is_action: false,
        })
    }

    #[test]
    fn test_parse_line() {
        let (cmd, args) = parse_line("PRIVMSG #chan :hello world");
        assert_eq!(cmd, "PRIVMSG");
        assert_eq!(args, vec!["#chan", "hello world"]);

        let (cmd, args) = parse_line("JOIN #a,#b");
        assert_eq!(cmd, "JOIN");
        assert_eq!(args, vec!["#a,#b"]);

        let (cmd, args) = parse_line("QUIT");
        assert_eq!(cmd, "QUIT");
        assert!(args.is_empty());

        let (_, args) = parse_line("USER alice 0 * :Alice Wonder");
        assert_eq!(args, vec!["alice", "0", "*", "Alice Wonder"]);
    }

    #[tokio::test]
    async fn test_registration_gate() {
        let mut sl = client();
        let mut server = server(settings());

        server.handle_line(&mut sl, "NICK alice").await.unwrap();
        server
            .handle_line(&mut sl, "PRIVMSG #general :too early")
            .await
            .unwrap();
        let lines = output(&server);
        assert!(
            lines.iter().any(|l| l.contains(" 451 ")),
            "pre-registration PRIVMSG must be rejected: {lines:?}"
        );

        // A chat event arriving before registration is held back
        server
            .slack_event(&mut sl, message("C1", "U1", "early bird"))
            .await
            .unwrap();
        assert!(!output(&server).iter().any(|l| l.contains("early bird")));

        server
            .handle_line(&mut sl, "USER alice 0 * :Alice")
            .await
            .unwrap();
        let lines = output(&server);
        let welcome = lines
            .iter()
            .position(|l| l.contains(" 001 "))
            .expect("welcome sent");
        let held = lines
            .iter()
            .position(|l| l.contains("early bird"))
            .expect("held event drained");
        assert!(welcome < held, "welcome must precede held events: {lines:?}");
    }

    #[tokio::test]
    async fn test_forced_nick_change() {
        let mut sl = client();
        let mut server = server(settings());
        server.handle_line(&mut sl, "NICK wrongnick").await.unwrap();
        server.handle_line(&mut sl, "USER w 0 * :W").await.unwrap();
        let lines = output(&server);
        assert!(lines.iter().any(|l| l.contains(" 432 ")));
        assert!(lines.iter().any(|l| l.contains("NICK alice")));
        assert_eq!(server.nickname, "alice");
    }

    #[tokio::test]
    async fn test_edit_renders_as_seddiff() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        let edit = SlackEvent::Edit(MessageEdit {
            channel: "C1".to_string(),
            previous: NoChanMessage {
                user: "U1".to_string(),
                text: "hello world".to_string(),
                ts: "1.0".to_string(),
                thread_ts: None,
            },
            current: NoChanMessage {
                user: "U1".to_string(),
                text: "hello there".to_string(),
                ts: "1.0".to_string(),
                thread_ts: None,
            },
        });
        server.slack_event(&mut sl, edit).await.unwrap();
        let lines = output(&server);
        assert!(
            lines
                .iter()
                .any(|l| l == ":bob!bob@127.0.0.1 PRIVMSG #general s/world/there/"),
            "{lines:?}"
        );
    }

    #[tokio::test]
    async fn test_unchanged_edit_is_dropped() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;
        let before = output(&server).len();

        let edit = SlackEvent::Edit(MessageEdit {
            channel: "C1".to_string(),
            previous: NoChanMessage {
                user: "U1".to_string(),
                text: "same".to_string(),
                ts: "1.0".to_string(),
                thread_ts: None,
            },
            current: NoChanMessage {
                user: "U1".to_string(),
                text: "same".to_string(),
                ts: "1.0".to_string(),
                thread_ts: None,
            },
        });
        server.slack_event(&mut sl, edit).await.unwrap();
        assert_eq!(output(&server).len(), before);
    }

    #[tokio::test]
    async fn test_delete_prefix_and_bot_prefix() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        let delete = SlackEvent::Delete(crate::slack::types::MessageDelete {
            channel: "C1".to_string(),
            previous: NoChanMessage {
                user: "U1".to_string(),
                text: "oops".to_string(),
                ts: "1.0".to_string(),
                thread_ts: None,
            },
        });
        server.slack_event(&mut sl, delete).await.unwrap();
        assert!(
            output(&server)
                .iter()
                .any(|l| l.ends_with("PRIVMSG #general :[deleted] oops"))
        );

        let bot = SlackEvent::Bot(crate::slack::types::MessageBot {
            channel: "C1".to_string(),
            username: "deploybot".to_string(),
            text: "done".to_string(),
            ts: "2.0".to_string(),
            thread_ts: None,
            attachments: Vec::new(),
        });
        server.slack_event(&mut sl, bot).await.unwrap();
        assert!(
            output(&server)
                .iter()
                .any(|l| l.contains("PRIVMSG #general :[deploybot] done"))
        );
    }

    #[tokio::test]
    async fn test_known_thread_routing_and_part_suppression() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        let thread_name = "#t-general-42.7";
        server.seed_thread(
            thread_name,
            MessageThread {
                channel_id: "C1".to_string(),
                thread_ts: "42.7".to_string(),
                name: "t-general-42.7".to_string(),
                topic: "bob in #general: root".to_string(),
            },
        );

        let threaded = |text: &str| {
            SlackEvent::Message(Message {
                channel: "C1".to_string(),
                user: "U1".to_string(),
                text: text.to_string(),
                ts: "43.0".to_string(),
                thread_ts: Some("42.7".to_string()),
                files: Vec::new(),
                is_action: false,
            })
        };

        server.slack_event(&mut sl, threaded("in thread")).await.unwrap();
        assert!(
            output(&server)
                .iter()
                .any(|l| l.ends_with(&format!("PRIVMSG {thread_name} :in thread")))
        );

        // Leaving the thread channel suppresses its traffic
        server
            .handle_line(&mut sl, &format!("PART {thread_name}"))
            .await
            .unwrap();
        let before = output(&server).len();
        server
            .slack_event(&mut sl, threaded("suppressed"))
            .await
            .unwrap();
        assert_eq!(output(&server).len(), before);
    }

    #[tokio::test]
    async fn test_rejoin_on_mention() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        server.handle_line(&mut sl, "PART #general").await.unwrap();
        let before = output(&server).len();

        // Without a mention, traffic stays suppressed
        server
            .slack_event(&mut sl, message("C1", "U1", "nothing for you"))
            .await
            .unwrap();
        assert_eq!(output(&server).len(), before);

        // A mention triggers the rejoin and delivers the message
        server
            .slack_event(&mut sl, message("C1", "U1", "ping <@USELF> wake up"))
            .await
            .unwrap();
        let lines = output(&server);
        assert!(lines.iter().skip(before).any(|l| l.contains("JOIN #general")));
        assert!(lines.iter().any(|l| l.contains("ping alice wake up")));
    }

    #[tokio::test]
    async fn test_rejoin_on_mention_can_be_disabled() {
        let mut sl = client();
        let mut cfg = settings();
        cfg.rejoin_on_mention = false;
        let mut server = server(cfg);
        register(&mut server, &mut sl).await;

        server.handle_line(&mut sl, "PART #general").await.unwrap();
        let before = output(&server).len();
        server
            .slack_event(&mut sl, message("C1", "U1", "ping <@USELF>"))
            .await
            .unwrap();
        assert_eq!(output(&server).len(), before);
    }

    #[tokio::test]
    async fn test_mode_replies() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        server.handle_line(&mut sl, "MODE #general").await.unwrap();
        server.handle_line(&mut sl, "MODE #general +b").await.unwrap();
        server.handle_line(&mut sl, "MODE #general +x").await.unwrap();
        let lines = output(&server);
        assert!(lines.iter().any(|l| l.contains(" 324 ") && l.ends_with('+')));
        assert!(lines.iter().any(|l| l.contains(" 368 ")));
        assert!(lines.iter().any(|l| l.contains(" 472 ")));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;
        server.handle_line(&mut sl, "FROBNICATE x").await.unwrap();
        assert!(output(&server).iter().any(|l| l.contains(" 421 ")));
    }

    #[tokio::test]
    async fn test_quit_raises_disconnect() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;
        let err = server.handle_line(&mut sl, "QUIT :bye").await.unwrap_err();
        assert!(err.is::<IrcDisconnect>());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mut sl = client();
        let mut server = server(settings());
        server.handle_line(&mut sl, "PING 12345").await.unwrap();
        assert!(
            output(&server)
                .iter()
                .any(|l| l.contains("PONG testteam.slack.com 12345"))
        );
    }

    #[tokio::test]
    async fn test_addmagic_mentions_and_yells() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;
        server.seed_mention_regex("C1", &["bob", "alice"]);

        let out = server
            .addmagic(&mut sl, "hey bob, @here look at https://bob.example", Some("C1"))
            .await;
        assert!(out.starts_with("hey <@U1>, <!here> look at"), "{out}");
        assert!(
            out.contains("https://bob.example"),
            "handle inside a url must not be rewritten: {out}"
        );
    }

    #[tokio::test]
    async fn test_inbound_rendering_links_and_yells() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        let out = server
            .parse_slack_message(
                &mut sl,
                "See <https://e.com/|docs> and <#C1|whatever>. <!channel>",
                "bob",
                "#general",
            )
            .await;
        assert_eq!(
            out,
            "See docs¹ and #general. YELLING LOUDER [alice]:\n  ¹ https://e.com/"
        );
    }

    #[tokio::test]
    async fn test_inbound_rendering_silenced_yeller() {
        let mut sl = client();
        let mut cfg = settings();
        cfg.silenced_yellers.insert("bob".to_string());
        let mut server = server(cfg);
        register(&mut server, &mut sl).await;

        let out = server
            .parse_slack_message(&mut sl, "<!here>", "bob", "#general")
            .await;
        assert_eq!(out, "yelling:");
    }

    #[tokio::test]
    async fn test_preformatted_overflow_goes_to_file() {
        let mut sl = client();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings();
        cfg.formatted_max_lines = 2;
        cfg.downloads_directory = dir.path().to_path_buf();
        let mut server = server(cfg);
        register(&mut server, &mut sl).await;

        let out = server
            .parse_slack_message(&mut sl, "```a\nb\nc\nd```", "bob", "#general")
            .await;
        assert!(out.contains("=== PREFORMATTED TEXT AT file://"), "{out}");
        let stored = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(stored, 1);

        // Under the limit the block is inlined
        let out = server
            .parse_slack_message(&mut sl, "```a\nb```", "bob", "#general")
            .await;
        assert_eq!(out, "```a\nb```");
    }

    #[tokio::test]
    async fn test_file_attachments_rendered() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        let mut msg = Message {
            channel: "C1".to_string(),
            user: "U1".to_string(),
            text: "see attachment".to_string(),
            ts: "9.0".to_string(),
            thread_ts: None,
            files: Vec::new(),
            is_action: false,
        };
        msg.files.push(crate::slack::types::File {
            name: "notes.txt".to_string(),
            mimetype: "text/plain".to_string(),
            size: 42,
            url_private: "https://files.example/notes.txt".to_string(),
            ..Default::default()
        });
        server
            .slack_event(&mut sl, SlackEvent::Message(msg))
            .await
            .unwrap();
        let lines = output(&server);
        assert!(lines.iter().any(|l| l.ends_with(":[file upload] notes.txt")));
        assert!(lines.iter().any(|l| l.ends_with(":text/plain 42 bytes")));
        assert!(
            lines
                .iter()
                .any(|l| l.ends_with("PRIVMSG #general https://files.example/notes.txt"))
        );
    }

    #[tokio::test]
    async fn test_action_message_wrapped() {
        let mut sl = client();
        let mut server = server(settings());
        register(&mut server, &mut sl).await;

        let msg = Message {
            channel: "C1".to_string(),
            user: "U1".to_string(),
            text: "waves".to_string(),
            ts: "9.1".to_string(),
            thread_ts: None,
            files: Vec::new(),
            is_action: true,
        };
        server
            .slack_event(&mut sl, SlackEvent::Message(msg))
            .await
            .unwrap();
        assert!(
            output(&server)
                .iter()
                .any(|l| l.ends_with(":\u{1}ACTION waves\u{1}"))
        );
    }
}
