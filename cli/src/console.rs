// Interactive console: stdin lines become commands or session payload,
// session output is printed as it arrives.

use circuitline_core::{ConsoleCommand, PeerNode, SessionOutput};
use colored::*;
use std::io::Write;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Print session lifecycle and received text until the node goes away
pub fn spawn_printer(
    mut output: mpsc::UnboundedReceiver<SessionOutput>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = output.recv().await {
            match event {
                SessionOutput::Opened(info) => {
                    println!(
                        "\n{} Session {} {} {}",
                        "✓".green(),
                        info.id.to_string().bright_cyan(),
                        info.direction,
                        info.remote
                    );
                }
                SessionOutput::Received { text, .. } => {
                    print!("{}", text);
                }
                SessionOutput::Closed { info, termination } => {
                    println!(
                        "\n{} Session {} with {} closed: {}",
                        "•".yellow(),
                        info.id.to_string().bright_cyan(),
                        info.remote,
                        termination
                    );
                }
            }
            prompt();
        }
    })
}

/// Read stdin until EOF or `/quit`
pub async fn run(node: &PeerNode, allow_dial: bool) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    println!("{}", ConsoleCommand::help().dimmed());
    prompt();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Quit => break,
            ConsoleCommand::Help => println!("{}", ConsoleCommand::help()),
            ConsoleCommand::Dial(_) if !allow_dial => {
                println!("{} Dialing is disabled in listen mode", "✗".red());
            }
            ConsoleCommand::Dial(None) => println!("Usage: /dial <multiaddr>"),
            ConsoleCommand::Dial(Some(address)) => match node.dial_text(&address).await {
                Ok(id) => println!("{} Dialed {} (session {})", "✓".green(), address, id),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            ConsoleCommand::Addresses => {
                let addresses = node.addresses();
                if addresses.is_empty() {
                    println!("{}", "(no addresses yet)".dimmed());
                }
                for address in addresses {
                    println!("  {}", address);
                }
            }
            ConsoleCommand::Sessions => {
                let sessions = node.sessions();
                if sessions.is_empty() {
                    println!("{}", "No open sessions.".dimmed());
                }
                for (info, state) in sessions {
                    println!(
                        "  {} {:?} {} {}",
                        info.id.to_string().bright_cyan(),
                        state,
                        info.direction,
                        info.remote
                    );
                }
            }
            // Empty lines are payload too and go out as "\n"
            ConsoleCommand::Payload(text) => {
                if node.input().publish(&text) == 0 {
                    println!("{}", "No open session; line dropped.".dimmed());
                }
            }
        }
        prompt();
    }
}
