//! Command-line and environment configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::poll::DEFAULT_POLL_TIMEOUT_SECS;
use crate::store::{LIVE_FEED_CAPACITY, REST_FEED_CAPACITY};

/// Message retention profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// Socket-first chat feed, short history
    Live,
    /// REST / long-poll clients, longer history
    Rest,
}

impl Profile {
    /// Per-conversation retention cap
    pub fn capacity(self) -> usize {
        match self {
            Profile::Live => LIVE_FEED_CAPACITY,
            Profile::Rest => REST_FEED_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "messenger_server", version, about = "Real-time conversation server")]
pub struct Config {
    /// WebSocket listen address
    #[arg(long, env = "MESSENGER_WS_ADDR", default_value = "127.0.0.1:3001")]
    pub ws_addr: SocketAddr,

    /// HTTP listen address (REST and long-poll)
    #[arg(long, env = "MESSENGER_HTTP_ADDR", default_value = "127.0.0.1:3000")]
    pub http_addr: SocketAddr,

    #[arg(long, env = "MESSENGER_PROFILE", value_enum, default_value_t = Profile::Live)]
    pub profile: Profile,

    /// Seconds a long-poll request is held before returning empty
    #[arg(long, env = "MESSENGER_POLL_TIMEOUT_SECS", default_value_t = DEFAULT_POLL_TIMEOUT_SECS)]
    pub poll_timeout_secs: u64,

    /// Serve only the WebSocket listener
    #[arg(long)]
    pub no_http: bool,
}

impl Config {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}
