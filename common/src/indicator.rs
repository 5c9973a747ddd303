use crate::types::LinkState;

/// One blink cadence: LED lit for `on_ms`, dark for `off_ms`, repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkPattern {
    pub on_ms: u64,
    pub off_ms: u64,
}

/// Cadence for each connectivity phase. Pure so the indicator task stays a
/// dumb periodic driver with no state of its own.
pub fn blink_pattern(state: LinkState) -> BlinkPattern {
    let (on_ms, off_ms) = match state {
        LinkState::NetworkConnecting => (500, 500),
        LinkState::NetworkUp => (100, 100),
        LinkState::BrokerConnecting => (150, 150),
        // Short single blink every two seconds once fully connected.
        LinkState::BrokerConnected => (50, 1_950),
        LinkState::NetworkFailed => (1_000, 1_000),
        LinkState::BrokerFailed => (2_000, 2_000),
    };
    BlinkPattern { on_ms, off_ms }
}
