use std::time::Duration;

/// Checkout orchestrator settings.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Where the gateway sends the payer back to.
    pub callback_url: String,
    /// Upper bound on a single gateway call.
    pub gateway_timeout: Duration,
    /// A second checkout by the same user within this window is rejected
    /// while the first order is still open.
    pub duplicate_order_window: chrono::Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            callback_url: "http://localhost:3000/payments/callback".to_string(),
            gateway_timeout: Duration::from_secs(10),
            duplicate_order_window: chrono::Duration::seconds(30),
        }
    }
}
