use crate::model::ControlResult;
use serde::Serialize;

/// Summary statistics over an ordered result list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Percentage rounded to one decimal; `None` when there is nothing to rate.
    pub pass_rate: Option<f64>,
}

impl AuditSummary {
    pub fn from_results(results: &[ControlResult]) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let pass_rate = if total == 0 {
            None
        } else {
            Some(round_one_decimal(passed as f64 / total as f64 * 100.0))
        };
        Self {
            total,
            passed,
            failed: total - passed,
            pass_rate,
        }
    }

    pub fn pass_rate_label(&self) -> String {
        match self.pass_rate {
            Some(rate) => format!("{rate:.1}%"),
            None => "N/A".to_string(),
        }
    }
}

fn round_one_decimal(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
