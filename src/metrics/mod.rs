//! Process-wide service counters, exposed at `/debug/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counters {
    orders_created: AtomicU64,
    payments_detected: AtomicU64,
    refunds_processed: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_orders_created(&self) {
        self.orders_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payments_detected(&self) {
        self.payments_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refunds_processed(&self) {
        self.refunds_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn orders_created(&self) -> u64 {
        self.orders_created.load(Ordering::Relaxed)
    }

    pub fn payments_detected(&self) -> u64 {
        self.payments_detected.load(Ordering::Relaxed)
    }

    pub fn refunds_processed(&self) -> u64 {
        self.refunds_processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "orders_created_total": self.orders_created(),
            "payments_detected_total": self.payments_detected(),
            "refunds_processed_total": self.refunds_processed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = Counters::new();
        counters.inc_orders_created();
        counters.inc_orders_created();
        counters.inc_payments_detected();

        assert_eq!(counters.orders_created(), 2);
        assert_eq!(counters.payments_detected(), 1);
        assert_eq!(counters.refunds_processed(), 0);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot["orders_created_total"], 2);
        assert_eq!(snapshot["refunds_processed_total"], 0);
    }
}
