//! Operator alerts over Telegram.
//!
//! The trait carries the message formatting as default methods so the
//! controller stays free of presentation concerns; implementations only
//! deliver text. Delivery failures are logged, never propagated.

use async_trait::async_trait;
use std::fmt;

use crate::liquidation::LiquidationOutcome;
use crate::rebalance::RebalanceOutcome;

pub mod telegram;

pub use telegram::TelegramNotifier;

#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Deliver one message. Returns false on delivery failure.
    async fn send(&self, text: String) -> bool;

    async fn rebalance_report(&self, outcome: &RebalanceOutcome) -> bool {
        if !outcome.touched_anything() {
            return true;
        }
        let mut lines = vec!["<b>Margin rebalance report</b>".to_string(), String::new()];
        for record in &outcome.records {
            lines.push(format!(
                "{} {}: {} -> {} USDt",
                record.direction.as_str(),
                record.symbol,
                record.before_margin,
                record.after_margin
            ));
        }
        lines.push(String::new());
        lines.push(format!("succeeded: {}", outcome.success_count));
        if outcome.fail_count > 0 {
            lines.push(format!("failed: {}", outcome.fail_count));
        }
        lines.push(format!("total moved: {} USDt", outcome.total_adjusted));
        self.send(lines.join("\n")).await
    }

    async fn liquidation_alert(&self, outcome: &LiquidationOutcome) -> bool {
        if !outcome.noteworthy() {
            return true;
        }
        let mut lines = vec!["<b>Partial close alert</b>".to_string(), String::new()];
        lines.push(format!("status: {}", outcome.reason));
        if !outcome.plans.is_empty() {
            lines.push(String::new());
            for plan in &outcome.plans {
                lines.push(format!(
                    "{} ({}): close {} @ {}, est. release {} USDt",
                    plan.symbol,
                    plan.side,
                    plan.close_quantity,
                    plan.current_price,
                    plan.estimated_release
                ));
            }
        }
        if outcome.executed {
            lines.push(String::new());
            lines.push(format!("succeeded: {}", outcome.success_count));
            if outcome.fail_count > 0 {
                lines.push(format!("failed: {}", outcome.fail_count));
            }
            lines.push(format!("released: {} USDt", outcome.total_released));
        }
        self.send(lines.join("\n")).await
    }

    async fn account_margin_warning(&self, rate_pct: f64) -> bool {
        self.send(format!(
            "<b>Account margin warning</b>\n\ncurrent account margin rate: {rate_pct:.2}%\n\
             add collateral or reduce exposure"
        ))
        .await
    }

    async fn retry_exhausted_alert(&self, context: &str, error: &str) -> bool {
        self.send(format!(
            "<b>Retries exhausted</b>\n\ncontext: {context}\nerror: {error}"
        ))
        .await
    }
}

/// Notifier that discards everything; used when alerting is disabled.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _text: String) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AdjustmentDirection, AdjustmentRecord, Decimal, TriggerType,
    };
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, text: String) -> bool {
            self.sent.lock().unwrap().push(text);
            true
        }
    }

    fn outcome_with_one_record() -> RebalanceOutcome {
        RebalanceOutcome {
            success_count: 1,
            fail_count: 0,
            total_adjusted: Decimal::parse("72.13").unwrap(),
            records: vec![AdjustmentRecord {
                timestamp: Utc::now(),
                symbol: "BTC".to_string(),
                direction: AdjustmentDirection::Decrease,
                amount: Decimal::parse("72.13").unwrap(),
                before_margin: Decimal::parse("400").unwrap(),
                after_margin: Decimal::parse("327.87").unwrap(),
                trigger: TriggerType::Scheduled,
            }],
        }
    }

    #[tokio::test]
    async fn rebalance_report_includes_amounts() {
        let notifier = RecordingNotifier::default();
        notifier.rebalance_report(&outcome_with_one_record()).await;
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("BTC"));
        assert!(sent[0].contains("72.13"));
    }

    #[tokio::test]
    async fn empty_rebalance_sends_nothing() {
        let notifier = RecordingNotifier::default();
        notifier
            .rebalance_report(&RebalanceOutcome::default())
            .await;
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn warning_message_has_rate() {
        let notifier = RecordingNotifier::default();
        notifier.account_margin_warning(2.5).await;
        let sent = notifier.sent.lock().unwrap();
        assert!(sent[0].contains("2.50%"));
    }
}
