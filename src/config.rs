use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use directories::UserDirs;

use crate::irc::ServerSettings;

/// Every flag mirrors an environment variable; the variable wins when both
/// are set, per the clap `env` feature.
#[derive(Parser, Debug)]
#[command(name = "slirc")]
#[command(about = "Exposes a Slack workspace as a local single-user IRC server")]
#[command(version)]
pub struct Cli {
    /// IP address to listen on
    #[arg(short, long, env = "IP_ADDRESS", default_value = "127.0.0.1")]
    pub ip: String,

    /// TCP port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 9007)]
    pub port: u16,

    /// Slack token (the TOKEN variable takes the token itself)
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File containing the Slack token
    #[arg(short, long)]
    pub tokenfile: Option<PathBuf>,

    /// Session cookie (required for xoxc- tokens)
    #[arg(long, env = "COOKIE", hide_env_values = true)]
    pub cookie: Option<String>,

    /// File containing the session cookie
    #[arg(short, long)]
    pub cookiefile: Option<PathBuf>,

    /// Don't display userlists on join
    #[arg(short = 'u', long, env = "NOUSERLIST")]
    pub nouserlist: bool,

    /// Automatically join all the channels the user is in
    #[arg(short = 'j', long, env = "AUTOJOIN")]
    pub autojoin: bool,

    /// Don't rejoin parted channels when a message mentions you
    #[arg(long, env = "NO_REJOIN_ON_MENTION")]
    pub no_rejoin_on_mention: bool,

    /// Allow non-loopback listen addresses; the IRC link is cleartext
    #[arg(short = 'o', long = "override", env = "OVERRIDE_LOCAL_IP")]
    pub override_local_ip: bool,

    /// Where to persist the bridge status between runs
    #[arg(short = 'f', long, env = "STATUS_FILE")]
    pub status_file: Option<PathBuf>,

    /// Comma separated channels to not join when autojoin is enabled
    #[arg(long, env = "IGNORED_CHANNELS", default_value = "")]
    pub ignored_channels: String,

    /// Where to store files for automatic downloads
    #[arg(long, env = "DOWNLOADS_DIRECTORY", default_value = "/tmp")]
    pub downloads_directory: PathBuf,

    /// Longest preformatted block to inline; 0 sends everything inline
    #[arg(long, env = "FORMATTED_MAX_LINES", default_value_t = 0)]
    pub formatted_max_lines: usize,

    /// Comma separated nicknames whose @here/@channel don't notify
    #[arg(long, env = "SILENCED_YELLERS", default_value = "")]
    pub silenced_yellers: String,

    /// Path for the unix control socket used by local helpers
    #[arg(long, env = "CONTROL_SOCKET")]
    pub control_socket: Option<PathBuf>,

    /// Enable debug logs
    #[arg(short, long, env = "DEBUG")]
    pub debug: bool,
}

/// Fully validated runtime configuration.
pub struct Settings {
    pub ip: String,
    pub port: u16,
    pub token: String,
    pub cookie: Option<String>,
    pub status_file: Option<PathBuf>,
    pub control_socket: Option<PathBuf>,
    pub server: ServerSettings,
}

fn read_first_line(path: &PathBuf, what: &str) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to open the {what} file {}", path.display()))?;
    Ok(content.lines().next().unwrap_or("").trim().to_string())
}

/// `a,b` or `#a,#b` into a set of `#`-prefixed channel names.
fn parse_channel_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.starts_with('#') {
                s.to_string()
            } else {
                format!("#{s}")
            }
        })
        .collect()
}

fn parse_name_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    pub fn from_cli(cli: Cli) -> Result<Settings> {
        // The IRC link is neither encrypted nor authenticated, so refuse to
        // listen outside the loopback unless explicitly overridden.
        if !cli.ip.starts_with("127") && !cli.override_local_ip {
            bail!(
                "supplied ip isn't local; slirc has no encryption or authentication, \
                 use --override if you really want this"
            );
        }

        let token = match cli.token {
            Some(t) => t,
            None => {
                let path = match cli.tokenfile {
                    Some(p) => p,
                    None => UserDirs::new()
                        .map(|d| d.home_dir().join(".slirc"))
                        .context("unable to locate the home directory")?,
                };
                read_first_line(&path, "token")?
            }
        };
        if token.is_empty() {
            bail!("no token supplied");
        }

        let cookie = match cli.cookie {
            Some(c) => Some(c),
            None => match cli.cookiefile {
                Some(path) => Some(read_first_line(&path, "cookie")?),
                None => None,
            },
        };
        if token.starts_with("xoxc-") && cookie.is_none() {
            bail!("the cookie is needed for this kind of slack token");
        }

        if !cli.downloads_directory.is_dir() {
            bail!("{} is not a directory", cli.downloads_directory.display());
        }

        let ignored_channels = if cli.autojoin {
            parse_channel_set(&cli.ignored_channels)
        } else {
            HashSet::new()
        };

        Ok(Settings {
            ip: cli.ip,
            port: cli.port,
            token,
            cookie,
            status_file: cli.status_file,
            control_socket: cli.control_socket,
            server: ServerSettings {
                nouserlist: cli.nouserlist,
                autojoin: cli.autojoin,
                rejoin_on_mention: !cli.no_rejoin_on_mention,
                ignored_channels,
                silenced_yellers: parse_name_set(&cli.silenced_yellers),
                downloads_directory: cli.downloads_directory,
                formatted_max_lines: cli.formatted_max_lines,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            ip: "127.0.0.1".to_string(),
            port: 9007,
            token: Some("xoxb-test".to_string()),
            tokenfile: None,
            cookie: None,
            cookiefile: None,
            nouserlist: false,
            autojoin: true,
            no_rejoin_on_mention: false,
            override_local_ip: false,
            status_file: None,
            ignored_channels: String::new(),
            downloads_directory: std::env::temp_dir(),
            formatted_max_lines: 0,
            silenced_yellers: String::new(),
            control_socket: None,
            debug: false,
        }
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ignored_channels_get_hash_prefix() {
        let mut cli = base_cli();
        cli.ignored_channels = "general,#random, noise ".to_string();
        let settings = Settings::from_cli(cli).unwrap();
        assert_eq!(
            settings.server.ignored_channels,
            ["#general", "#random", "#noise"]
                .iter()
                .map(|s| s.to_string())
                .collect::<HashSet<String>>()
        );
    }

    #[test]
    fn test_ignored_channels_need_autojoin() {
        let mut cli = base_cli();
        cli.autojoin = false;
        cli.ignored_channels = "general".to_string();
        let settings = Settings::from_cli(cli).unwrap();
        assert!(settings.server.ignored_channels.is_empty());
    }

    #[test]
    fn test_non_loopback_requires_override() {
        let mut cli = base_cli();
        cli.ip = "0.0.0.0".to_string();
        assert!(Settings::from_cli(cli).is_err());

        let mut cli = base_cli();
        cli.ip = "0.0.0.0".to_string();
        cli.override_local_ip = true;
        assert!(Settings::from_cli(cli).is_ok());
    }

    #[test]
    fn test_xoxc_token_requires_cookie() {
        let mut cli = base_cli();
        cli.token = Some("xoxc-browser-token".to_string());
        assert!(Settings::from_cli(cli).is_err());

        let mut cli = base_cli();
        cli.token = Some("xoxc-browser-token".to_string());
        cli.cookie = Some("d=xoxd-something".to_string());
        assert!(Settings::from_cli(cli).is_ok());
    }

    #[test]
    fn test_rejoin_on_mention_flag_inverts() {
        let mut cli = base_cli();
        cli.no_rejoin_on_mention = true;
        let settings = Settings::from_cli(cli).unwrap();
        assert!(!settings.server.rejoin_on_mention);
    }
}
