//! A set of configuration parameters to tune the session and lookup cores.

use std::time::Duration;

/// Configuration parameters for the session service and lookups.
#[derive(Debug, Clone)]
pub struct Config {
    /// The timeout for each outbound UDP request before it is retransmitted. Default: 1 second.
    pub request_timeout: Duration,

    /// The total number of transmissions of an unanswered request before it is reported as
    /// failed. Default: 2.
    pub request_retries: u8,

    /// The lifetime of an established session. Each decrypted packet refreshes the session, an
    /// idle session is removed once this expires. Default: 1 day.
    pub session_timeout: Duration,

    /// The time a handshake may remain incomplete before the half-session is removed.
    /// Default: 15 seconds.
    pub session_establish_timeout: Duration,

    /// The number of nodes a lookup queries in parallel while it is making progress. The `alpha`
    /// parameter in the Kademlia paper. Default: 3.
    pub lookup_parallelism: usize,

    /// The number of closest nodes a lookup must obtain successful responses from before it
    /// terminates. The `k` parameter in the Kademlia paper. Default: 16.
    pub lookup_num_results: usize,

    /// The number of times a single node may be queried within one lookup before its result is
    /// final. Default: 3.
    pub lookup_iterations_per_peer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            request_retries: 2,
            session_timeout: Duration::from_secs(86400),
            session_establish_timeout: Duration::from_secs(15),
            lookup_parallelism: 3,
            lookup_num_results: 16,
            lookup_iterations_per_peer: 3,
        }
    }
}

/// A builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder::default()
    }

    /// The timeout for each outbound UDP request.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.request_timeout = timeout;
        self
    }

    /// The total number of transmissions of an unanswered request.
    pub fn request_retries(&mut self, retries: u8) -> &mut Self {
        self.config.request_retries = retries;
        self
    }

    /// The lifetime of an established session.
    pub fn session_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.session_timeout = timeout;
        self
    }

    /// The time a handshake may remain incomplete.
    pub fn session_establish_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.session_establish_timeout = timeout;
        self
    }

    /// The number of nodes a lookup queries in parallel.
    pub fn lookup_parallelism(&mut self, parallelism: usize) -> &mut Self {
        self.config.lookup_parallelism = parallelism;
        self
    }

    /// The number of closest nodes a lookup terminates with.
    pub fn lookup_num_results(&mut self, num_results: usize) -> &mut Self {
        self.config.lookup_num_results = num_results;
        self
    }

    /// The number of times a single node may be queried within one lookup.
    pub fn lookup_iterations_per_peer(&mut self, iterations: usize) -> &mut Self {
        self.config.lookup_iterations_per_peer = iterations;
        self
    }

    pub fn build(&mut self) -> Config {
        self.config.clone()
    }
}
