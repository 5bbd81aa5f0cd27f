//! # Operator Console
//!
//! Line-oriented front end for the mounted views. It reads commands from stdin, routes
//! intents to the view that accepts them and prints state changes as they arrive:
//!
//! ```text
//! stdin ──parse_command()──► ViewHandle::submit() ──► receipt line
//! watch ──────────────────► link phase changes, new log lines
//! ```
//!
//! A view that could not be mounted (missing broker configuration) answers every
//! command with its configuration error instead of acting.

pub mod common;

use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::session::{MountedView, ViewHandle, ViewKind};
use crate::sync::commands::{CommandReceipt, Intent, PublishOutcome};
use crate::sync::model::{DashboardState, LinkPhase, RELAY_COUNT};
use common::{render_config_error, render_connection, render_dashboard, render_delivery};
use common::{empty_log_hint, render_log_entry, render_relays};

const DEFAULT_LOG_LINES: usize = 20;

const HELP: &str = "\
Commands:
  start | stop | estop      motor control
  freq <value>              set frequency (0-60 Hz)
  relay <1-4>               toggle relay
  status                    dashboard summary
  relays                    relay states
  logs [n]                  last n log lines
  history                   recent commands
  dump                      full state as JSON
  help                      this text
  quit                      close the session";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Intent(Intent),
    Status,
    Relays,
    Logs(usize),
    History,
    Dump,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "start" => ConsoleCommand::Intent(Intent::Start),
        "stop" => ConsoleCommand::Intent(Intent::Stop),
        "estop" | "emergency" => ConsoleCommand::Intent(Intent::EmergencyStop),
        "freq" | "frequency" => ConsoleCommand::Intent(Intent::FrequencyInput(rest.to_string())),
        "relay" => {
            let number: usize = rest
                .parse()
                .map_err(|_| format!("relay expects a number from 1 to {}", RELAY_COUNT))?;
            if !(1..=RELAY_COUNT).contains(&number) {
                return Err(format!("relay expects a number from 1 to {}", RELAY_COUNT));
            }
            ConsoleCommand::Intent(Intent::ToggleRelay(number - 1))
        }
        "status" => ConsoleCommand::Status,
        "relays" => ConsoleCommand::Relays,
        "logs" => {
            if rest.is_empty() {
                ConsoleCommand::Logs(DEFAULT_LOG_LINES)
            } else {
                ConsoleCommand::Logs(
                    rest.parse()
                        .map_err(|_| format!("invalid line count '{}'", rest))?,
                )
            }
        }
        "history" => ConsoleCommand::History,
        "dump" => ConsoleCommand::Dump,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        "" => return Err("empty command".to_string()),
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };
    Ok(command)
}

fn render_receipt(receipt: &CommandReceipt) -> String {
    let command = receipt
        .command
        .as_ref()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "intent".to_string());
    let outcome = match &receipt.outcome {
        PublishOutcome::Published => "published".to_string(),
        PublishOutcome::Suppressed(reason) => format!("not sent ({})", reason),
        PublishOutcome::Failed(error) => format!("failed ({})", error),
        PublishOutcome::Rejected(reason) => format!("rejected ({})", reason),
    };
    format!("#{} {}: {}", receipt.id, command, outcome)
}

struct Console {
    views: Vec<MountedView>,
    last_phase: Option<LinkPhase>,
    next_log_seq: u64,
}

impl Console {
    fn new(views: Vec<MountedView>) -> Self {
        Self {
            views,
            last_phase: None,
            next_log_seq: 0,
        }
    }

    fn live(&self, kind: ViewKind) -> Option<&ViewHandle> {
        self.views.iter().find_map(|view| match view {
            MountedView::Live(handle) if handle.kind() == kind => Some(handle),
            _ => None,
        })
    }

    fn blocked_reason(&self, kind: ViewKind) -> String {
        self.views
            .iter()
            .find_map(|view| match view {
                MountedView::Blocked { kind: k, error } if *k == kind => {
                    Some(render_config_error(&kind.to_string(), error))
                }
                _ => None,
            })
            .unwrap_or_else(|| format!("{} view is not open", kind))
    }

    fn receiver(&self) -> Option<watch::Receiver<DashboardState>> {
        self.views.iter().find_map(|view| match view {
            MountedView::Live(handle) => Some(handle.receiver()),
            MountedView::Blocked { .. } => None,
        })
    }

    fn any_state(&self) -> Option<DashboardState> {
        self.views.iter().find_map(|view| match view {
            MountedView::Live(handle) => Some(handle.state()),
            MountedView::Blocked { .. } => None,
        })
    }

    fn print_startup(&self) {
        for view in &self.views {
            match view {
                MountedView::Live(handle) => println!("{} view ready", handle.kind()),
                MountedView::Blocked { kind, error } => {
                    println!("{}", render_config_error(&kind.to_string(), error))
                }
            }
        }
        println!("Type 'help' for commands.");
    }

    fn on_update(&mut self, state: &DashboardState) {
        if self.last_phase != Some(state.connection.phase) {
            self.last_phase = Some(state.connection.phase);
            println!("{}", render_connection(&state.connection));
        }

        if self.live(ViewKind::Logs).is_some() {
            for entry in state.logs.since(self.next_log_seq) {
                println!("{}", render_log_entry(entry));
            }
        }
        self.next_log_seq = state.logs.next_seq();
    }

    /// Returns `false` once the operator asked to quit.
    async fn handle_line(&mut self, line: &str) -> bool {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                return true;
            }
        };
        debug!("Console command: {:?}", command);

        match command {
            ConsoleCommand::Intent(intent) => self.submit(intent).await,
            ConsoleCommand::Status => self.show(ViewKind::Dashboard, render_dashboard),
            ConsoleCommand::Relays => self.show(ViewKind::RelayControls, render_relays),
            ConsoleCommand::Logs(count) => match self.live(ViewKind::Logs) {
                Some(handle) => {
                    let state = handle.state();
                    if state.logs.is_empty() {
                        println!("{}", empty_log_hint(&state));
                    }
                    let skip = state.logs.len().saturating_sub(count);
                    for entry in state.logs.iter().skip(skip) {
                        println!("{}", render_log_entry(entry));
                    }
                    if state.logs.evicted() > 0 {
                        println!("({} older lines dropped)", state.logs.evicted());
                    }
                }
                None => println!("{}", self.blocked_reason(ViewKind::Logs)),
            },
            ConsoleCommand::History => match self.any_state() {
                Some(state) => {
                    for record in &state.recent_commands {
                        println!(
                            "#{} {} {} {}",
                            record.id,
                            record.issued_at.format("%H:%M:%S"),
                            record.command,
                            render_delivery(&record.delivery)
                        );
                    }
                }
                None => println!("{}", self.blocked_reason(ViewKind::Dashboard)),
            },
            ConsoleCommand::Dump => match self.any_state() {
                Some(state) => match serde_json::to_string_pretty(&state) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("Failed to serialize state: {}", e),
                },
                None => println!("{}", self.blocked_reason(ViewKind::Dashboard)),
            },
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => return false,
        }
        true
    }

    fn show(&self, kind: ViewKind, render: fn(&DashboardState) -> String) {
        match self.live(kind) {
            Some(handle) => print!("{}", render(&handle.state())),
            None => println!("{}", self.blocked_reason(kind)),
        }
    }

    async fn submit(&self, intent: Intent) {
        let Some(kind) = ViewKind::ALL.into_iter().find(|kind| kind.accepts(&intent)) else {
            println!("No view accepts {}", intent);
            return;
        };
        let Some(handle) = self.live(kind) else {
            println!("{}", self.blocked_reason(kind));
            return;
        };

        let relay = matches!(intent, Intent::ToggleRelay(_));
        match handle.submit(intent).await {
            Ok(receipt) => {
                println!("{}", render_receipt(&receipt));
                if relay {
                    print!("{}", render_relays(&handle.state()));
                }
            }
            Err(e) => println!("{}", e),
        }
    }
}

async fn wait_for_change(updates: &mut Option<watch::Receiver<DashboardState>>) -> bool {
    match updates {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Runs the console until quit, end of input or Ctrl-C.
pub async fn run(views: Vec<MountedView>) -> Result<()> {
    let mut console = Console::new(views);
    console.print_startup();

    let mut updates = console.receiver();
    if let Some(rx) = updates.as_mut() {
        let state = rx.borrow_and_update().clone();
        console.on_update(&state);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing console");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !console.handle_line(&line).await {
                        break;
                    }
                }
                None => {
                    info!("Input closed");
                    break;
                }
            },
            alive = wait_for_change(&mut updates) => {
                match (alive, updates.as_mut()) {
                    (true, Some(rx)) => {
                        let state = rx.borrow_and_update().clone();
                        console.on_update(&state);
                    }
                    _ => {
                        warn!("Session closed, no more updates");
                        updates = None;
                    }
                }
            }
        }
    }
    Ok(())
}
