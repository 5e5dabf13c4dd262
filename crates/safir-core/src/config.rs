use std::time::Duration;

/// Settings shared by every node-type: a plain `Default`-implementing
/// configuration struct rather than a parsed file format.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationConfig {
    pub send_queue_size: usize,
    pub sliding_window_size: usize,
    pub fragment_size: usize,
    pub receive_buffer_size: usize,
    pub max_number_of_undelivered: usize,
    pub light_nodes_exclude_time_limit: Duration,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 1024,
            sliding_window_size: 64,
            fragment_size: 1500,
            receive_buffer_size: 65536,
            max_number_of_undelivered: 256,
            light_nodes_exclude_time_limit: Duration::from_secs(30),
        }
    }
}

impl CommunicationConfig {
    #[must_use]
    pub fn fragment_data_size(&self) -> usize {
        self.fragment_size - safir_wire::MessageHeader::ENCODE_LEN
    }
}

/// Per-node-type settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTypeConfig {
    pub name: String,
    pub heartbeat_interval: Duration,
    pub retry_timeout: Duration,
    pub multicast_address: Option<String>,
    pub use_multicast: bool,
    pub is_light_node: bool,
}

impl NodeTypeConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat_interval: Duration::from_secs(2),
            retry_timeout: Duration::from_millis(500),
            multicast_address: None,
            use_multicast: false,
            is_light_node: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fragment_data_size() {
        let cfg = CommunicationConfig::default();
        assert_eq!(cfg.fragment_data_size(), 1448);
    }
}
