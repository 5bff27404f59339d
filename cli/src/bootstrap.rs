// Default relay for circuitline peers
//
// The public relay is embedded at build time so `listen` and `chat` work
// without any configuration.
//
// Build-time customization:
// - Set CIRCUITLINE_RELAY_ADDR during the build
// - Format: comma-separated multiaddrs, each ending in /p2p/<relay-id>
// - Example: export CIRCUITLINE_RELAY_ADDR="/ip4/1.2.3.4/tcp/3001/ws/p2p/12D3Koo..."

/// Public WebSocket relay
pub const DEFAULT_RELAYS: &[&str] =
    &["/ip4/13.60.15.36/tcp/3001/ws/p2p/12D3KooWGMYMmN1RGUYjWaSV6P3XtnBjwnosnJGNMnttfVCRnd6g"];

/// Default relays, with optional build-time override
pub fn default_relays() -> Vec<String> {
    relays_from(option_env!("CIRCUITLINE_RELAY_ADDR"))
}

fn relays_from(override_text: Option<&str>) -> Vec<String> {
    let parsed: Vec<String> = override_text
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if parsed.is_empty() {
        DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
    } else {
        parsed
    }
}
