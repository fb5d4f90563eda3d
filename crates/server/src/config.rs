use std::time::Duration;

use voxlink::net::LinkConditions;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    /// Empty accepts any password.
    pub password: String,
    pub peer_timeout: Duration,
    pub tick_interval: Duration,
    pub link: Option<LinkConditions>,
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 32,
            password: String::new(),
            peer_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_millis(20),
            link: None,
            seed: 0,
        }
    }
}
