use once_cell::sync::Lazy;
use rust_decimal::Decimal;

use crate::email_client::EmailClient;

static ALERT_NOTIFIER: Lazy<AlertNotifier> = Lazy::new(AlertNotifier::new);

pub fn notify_rate_limit(context: &str, detail: &str) {
    ALERT_NOTIFIER.rate_limit(context, detail);
}

/// Integrity faults are surfaced for the operator and never auto-healed:
/// local state must not override what the exchange reports.
pub fn notify_direction_mismatch(symbol: &str, exchange_qty: Decimal) {
    ALERT_NOTIFIER.direction_mismatch(symbol, exchange_qty);
}

pub fn notify_loop_stall(idle_secs: i64) {
    ALERT_NOTIFIER.loop_stall(idle_secs);
}

struct AlertNotifier {
    agent_name: String,
}

impl AlertNotifier {
    fn new() -> Self {
        let agent_name = std::env::var("AGENT_NAME").unwrap_or_default();
        Self { agent_name }
    }

    fn subject(&self, topic: &str) -> String {
        if self.agent_name.is_empty() {
            format!("[ladderbot] {}", topic)
        } else {
            format!("[{}] {}", self.agent_name, topic)
        }
    }

    fn rate_limit(&self, context: &str, detail: &str) {
        let subject = self.subject(&format!("Rate limit - {}", context));
        let body = format!(
            "HTTP 429 Too Many Requests detected while {}.\nDetail: {}",
            context, detail
        );
        EmailClient::new().send(&subject, &body);
        log::warn!("[ALERT] rate limit notification sent for '{}'", context);
    }

    fn direction_mismatch(&self, symbol: &str, exchange_qty: Decimal) {
        let subject = self.subject(&format!("{} direction mismatch", symbol));
        let body = format!(
            "Exchange reports a position on {} whose direction contradicts the managed side \
             (exchange qty {}).\nThe position is flagged and left untouched; close or take it \
             over manually.",
            symbol, exchange_qty
        );
        EmailClient::new().send(&subject, &body);
        log::warn!("[ALERT] direction mismatch notification sent for {}", symbol);
    }

    fn loop_stall(&self, idle_secs: i64) {
        let subject = self.subject("reconciliation loop stalled");
        let body = format!(
            "No reconciliation tick has completed for {} seconds.",
            idle_secs
        );
        EmailClient::new().send(&subject, &body);
        log::error!("[ALERT] loop stall notification sent ({}s idle)", idle_secs);
    }
}
