use bon::Builder;

/// Configuration shared by the call-shape combinators and the adapters they assemble.
#[derive(Debug, Clone, Builder)]
pub struct BridgeConfig {
    /// Credits requested from the upstream producer each time the outbound pump refills.
    /// A value of 1 keeps at most one outbound message in flight between refills.
    #[builder(default = 1)]
    pub pump_batch: u32,

    /// Whether an inbound `CANCELLED` status completes the reactive consumer instead of failing it.
    #[builder(default = true)]
    pub cancelled_as_completion: bool,
}

impl BridgeConfig {
    /// Credits per pump refill, never below one.
    pub(crate) fn pump_credits(&self) -> u64 {
        u64::from(self.pump_batch.max(1))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
