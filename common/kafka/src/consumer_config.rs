use rdkafka::ClientConfig;

/// Kafka consumer configuration builder for group consumers.
///
/// Offsets are stored explicitly by the consumer once a record has been
/// handled (`enable.auto.offset.store=false`) and the client's auto-commit
/// flushes whatever was stored. A record is therefore only committed after
/// it was marked.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for a group consumer.
    ///
    /// Sets: bootstrap.servers, group.id, enable.auto.offset.store=false,
    /// enable.auto.commit=true, enable.partition.eof=false.
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Partition assignment strategy used when the group rebalances.
    pub fn with_assignment_strategy(mut self, strategy: &str) -> Self {
        self.config.set("partition.assignment.strategy", strategy);
        self
    }

    /// Pin the broker protocol version assumed for brokers that can't report theirs.
    pub fn with_broker_version_fallback(mut self, version: &str) -> Self {
        self.config.set("broker.version.fallback", version);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_auto_commit_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("auto.commit.interval.ms", ms.to_string());
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
