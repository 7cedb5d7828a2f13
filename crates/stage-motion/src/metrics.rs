use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct StageMetrics {
    pub register_reads: IntCounter,
    pub register_writes: IntCounter,
    pub transport_errors: IntCounter,
    /// Fire-and-forget control commands, labelled by command name.
    pub commands: IntCounterVec,
    pub connected: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub stage: StageMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let register_reads = IntCounter::new("stage_register_reads", "Total register reads")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let register_writes = IntCounter::new("stage_register_writes", "Total register writes")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let transport_errors =
            IntCounter::new("stage_transport_errors", "Register accesses that failed")
                .map_err(|e| format!("metrics init error: {e}"))?;
        let commands = IntCounterVec::new(
            Opts::new("stage_commands", "Control word commands issued"),
            &["command"],
        )
        .map_err(|e| format!("metrics init error: {e}"))?;
        let connected = IntGauge::new("stage_connected", "1 while the controller is connected")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let stage = StageMetrics {
            register_reads,
            register_writes,
            transport_errors,
            commands,
            connected,
        };
        let _ = registry.register(Box::new(stage.register_reads.clone()));
        let _ = registry.register(Box::new(stage.register_writes.clone()));
        let _ = registry.register(Box::new(stage.transport_errors.clone()));
        let _ = registry.register(Box::new(stage.commands.clone()));
        let _ = registry.register(Box::new(stage.connected.clone()));
        Ok(Self { registry, stage })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
