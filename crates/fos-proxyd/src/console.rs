//! Line-oriented control console on stdin
//!
//! | Command | Action |
//! |---------|--------|
//! | `list` | show stored profiles |
//! | `connect <name\|id>` | connect to a stored profile |
//! | `disconnect` | tear down the session |
//! | `refresh-ip` | re-run the egress lookup |
//! | `status` | show state and telemetry |
//! | `import <url>` | add a profile from `scheme://[user:pass@]host:port` |
//! | `start-local <server> <token>` | start the local helper service |
//! | `quit` | exit |

use anyhow::{Context, Result};
use fos_proxy::{ConnectionManager, LocalServiceConfig, ProfileId, ProxyProfile};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Console parse errors
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    #[error("Unknown command: {0} (try `help`)")]
    Unknown(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
}

/// Parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Connect(String),
    Disconnect,
    RefreshIp,
    Status,
    Import(String),
    StartLocal { server: String, token: String },
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line; blank lines yield `None`
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "list" | "ls" => Self::List,
            "connect" => {
                let target = words.collect::<Vec<_>>().join(" ");
                if target.is_empty() {
                    return Err(ConsoleError::MissingArgument("profile name or id"));
                }
                Self::Connect(target)
            }
            "disconnect" => Self::Disconnect,
            "refresh-ip" => Self::RefreshIp,
            "status" => Self::Status,
            "import" => Self::Import(
                words
                    .next()
                    .ok_or(ConsoleError::MissingArgument("proxy url"))?
                    .to_string(),
            ),
            "start-local" => {
                let server = words.next().ok_or(ConsoleError::MissingArgument("server"))?;
                let token = words.next().ok_or(ConsoleError::MissingArgument("token"))?;
                Self::StartLocal {
                    server: server.to_string(),
                    token: token.to_string(),
                }
            }
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(ConsoleError::Unknown(other.to_string())),
        };

        Ok(Some(command))
    }
}

/// Find a profile by identifier or (case-insensitive) name
pub fn find_profile<'a>(profiles: &'a [ProxyProfile], query: &str) -> Option<&'a ProxyProfile> {
    if let Ok(id) = query.parse::<ProfileId>() {
        if let Some(profile) = profiles.iter().find(|p| p.id == Some(id)) {
            return Some(profile);
        }
    }
    profiles
        .iter()
        .find(|p| p.display_name().eq_ignore_ascii_case(query))
}

/// Read commands until `quit` or end of input
pub async fn run(manager: ConnectionManager) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("fOS proxy console, type `help` for commands");

    while let Some(line) = lines.next_line().await.context("reading console input")? {
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(e) = execute(&manager, command).await {
            error!("Command failed: {:#}", e);
        }
    }

    Ok(())
}

async fn execute(manager: &ConnectionManager, command: ConsoleCommand) -> Result<()> {
    let records = manager.records();

    match command {
        ConsoleCommand::List => {
            let profiles = records.profiles().await?;
            let usage = records.usage().await?;
            let last_used = records.last_used().await?;

            for profile in &profiles {
                let id = profile.id.map(|id| id.to_string()).unwrap_or_default();
                let down = profile.id.and_then(|id| usage.get(&id)).map_or(0, |u| u.down);
                let connected_ms = profile
                    .id
                    .and_then(|id| last_used.get(&id))
                    .map_or(0, |l| l.total_connected_ms);
                println!(
                    "{:<36}  {:<20} {}://{}:{}  down={}B  connected={}s",
                    id,
                    profile.display_name(),
                    profile.scheme.as_deref().unwrap_or("?"),
                    profile.host,
                    profile.port.map(|p| p.to_string()).unwrap_or_default(),
                    down,
                    connected_ms / 1000
                );
            }
        }
        ConsoleCommand::Connect(query) => {
            let profiles = records.profiles().await?;
            let Some(profile) = find_profile(&profiles, &query).cloned() else {
                println!("No profile matches {:?}", query);
                return Ok(());
            };

            // Completion arrives asynchronously; keep the console responsive
            let manager = manager.clone();
            tokio::spawn(async move {
                let name = profile.display_name().to_string();
                match manager.request_connect(profile).await {
                    Ok(outcome) => info!("Connect to {} finished (success: {})", name, outcome.success),
                    Err(e) => warn!("Connect to {} rejected: {}", name, e),
                }
            });
        }
        ConsoleCommand::Disconnect => {
            let outcome = manager.request_disconnect().await?;
            info!("Disconnect finished (success: {})", outcome.success);
        }
        ConsoleCommand::RefreshIp => {
            if !manager.request_ip_refresh().await? {
                println!("Not connected");
            }
        }
        ConsoleCommand::Status => {
            let machine = manager.machine();
            println!("state: {} (retries: {})", machine.state, machine.retry_count);
            if let Some(id) = records.connected_profile_id().await? {
                println!("profile: {}", id);
            }
            if let Some(telemetry) = records.telemetry().await? {
                println!("public ip: {}  location: {}", telemetry.public_ip, telemetry.location);
            }
            println!("local service: {}", if manager.bridge().is_connected().await { "attached" } else { "detached" });
        }
        ConsoleCommand::Import(url) => {
            let profile = ProxyProfile::parse_url(&url)?;
            let mut profiles = records.profiles().await?;
            println!("Imported {}", profile.display_name());
            profiles.push(profile);
            records.set_profiles(&profiles).await?;
        }
        ConsoleCommand::StartLocal { server, token } => {
            let config = LocalServiceConfig::vless(&server, &token)?;
            manager.request_local_service_start(config).await?;
        }
        ConsoleCommand::Help => {
            println!("list | connect <name|id> | disconnect | refresh-ip | status");
            println!("import <url> | start-local <server> <token> | quit");
        }
        ConsoleCommand::Quit => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_network::ProxyScheme;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("  "), Ok(None));
        assert_eq!(ConsoleCommand::parse("LIST"), Ok(Some(ConsoleCommand::List)));
        assert_eq!(
            ConsoleCommand::parse("connect Home Proxy"),
            Ok(Some(ConsoleCommand::Connect("Home Proxy".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("start-local edge.example abc"),
            Ok(Some(ConsoleCommand::StartLocal {
                server: "edge.example".into(),
                token: "abc".into()
            }))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            ConsoleCommand::parse("connect"),
            Err(ConsoleError::MissingArgument("profile name or id"))
        );
        assert_eq!(
            ConsoleCommand::parse("start-local edge.example"),
            Err(ConsoleError::MissingArgument("token"))
        );
        assert_eq!(
            ConsoleCommand::parse("reboot"),
            Err(ConsoleError::Unknown("reboot".into()))
        );
    }

    #[test]
    fn test_find_profile() {
        let mut home = ProxyProfile::new("Home", ProxyScheme::Http, "10.0.0.1", 3128);
        let id = home.ensure_id();
        let profiles = vec![home, ProxyProfile::default_local()];

        assert_eq!(find_profile(&profiles, "home").unwrap().id, Some(id));
        assert_eq!(find_profile(&profiles, &id.to_string()).unwrap().name, "Home");
        assert_eq!(find_profile(&profiles, "localproxy").unwrap().port, Some(10828));
        assert!(find_profile(&profiles, "office").is_none());
    }
}
