pub const TOPIC_CONFIG: &str = "irrigator/config";
pub const TOPIC_CONTROL: &str = "irrigator/control";
pub const TOPIC_ACK: &str = "irrigator/ack";
pub const TOPIC_HEARTBEAT: &str = "irrigator/heartbeat";

// The decoder matches by suffix so a deployment-specific prefix on the
// subscribed topics does not change the protocol.
pub const CONFIG_SUFFIX: &str = "/config";
pub const CONTROL_SUFFIX: &str = "/control";

pub const HEARTBEAT_PAYLOAD: &str = "alive";
