// Interactive line commands

/// One line typed into the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `/dial`, `/dialA` or `/dialB` followed by an address
    Dial(Option<String>),
    /// `/addrs`
    Addresses,
    /// `/sessions`
    Sessions,
    /// `/quit` or `/exit`
    Quit,
    /// `/help`
    Help,
    /// Anything else is sent to every open session
    Payload(String),
}

const DIAL_COMMANDS: [&str; 3] = ["/dial", "/dialA", "/dialB"];

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let head = parts.next().unwrap_or_default();
        let rest = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        match head {
            cmd if DIAL_COMMANDS.contains(&cmd) => ConsoleCommand::Dial(rest),
            "/addrs" if rest.is_none() => ConsoleCommand::Addresses,
            "/sessions" if rest.is_none() => ConsoleCommand::Sessions,
            "/quit" | "/exit" if rest.is_none() => ConsoleCommand::Quit,
            "/help" if rest.is_none() => ConsoleCommand::Help,
            _ => ConsoleCommand::Payload(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    pub fn help() -> &'static str {
        "/dial <multiaddr>   open a session (also /dialA, /dialB)\n\
         /addrs              show this node's addresses\n\
         /sessions           list open sessions\n\
         /quit               exit\n\
         anything else is sent to every open session"
    }
}
