//! Deterministic tax calculation
//!
//! All arithmetic happens in integer cents. Rates come from a configured
//! jurisdiction map with a flat default; this is intentionally not a tax
//! engine, just a stable breakdown for checkout and invoice display.

use serde::Serialize;

use crate::config::TaxSettings;

/// Tax breakdown for a charge, all amounts in cents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxBreakdown {
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub tax_rate_percent: f64,
    pub tax_code: String,
    pub tax_jurisdiction: String,
}

/// Computes tax breakdowns from configured jurisdiction rates
#[derive(Clone)]
pub struct TaxCalculator {
    settings: TaxSettings,
}

impl TaxCalculator {
    pub fn new(settings: TaxSettings) -> Self {
        Self { settings }
    }

    /// Rate for a jurisdiction, falling back to the default rate
    pub fn rate_for(&self, jurisdiction: Option<&str>) -> f64 {
        jurisdiction
            .and_then(|j| self.settings.rate_map.get(j).copied())
            .unwrap_or(self.settings.default_rate)
    }

    /// Compute the breakdown for a base amount in cents.
    /// Tax rounds half away from zero.
    pub fn breakdown(&self, subtotal_cents: i64, jurisdiction: Option<&str>) -> TaxBreakdown {
        let rate = self.rate_for(jurisdiction);
        let tax_cents = ((subtotal_cents as f64) * rate).round() as i64;
        TaxBreakdown {
            subtotal_cents,
            tax_cents,
            total_cents: subtotal_cents + tax_cents,
            tax_rate_percent: rate * 100.0,
            tax_code: self.settings.default_code.clone(),
            tax_jurisdiction: jurisdiction
                .map(str::to_string)
                .unwrap_or_else(|| self.settings.default_jurisdiction.clone()),
        }
    }
}

/// Derive a tax breakdown from invoice totals when the provider payload has
/// no explicit breakdown: subtotal = due - tax, rate = tax / subtotal.
pub fn derive_from_totals(amount_due_cents: i64, tax_cents: i64) -> (i64, f64) {
    let subtotal = amount_due_cents - tax_cents;
    let rate_percent = if subtotal > 0 {
        (tax_cents as f64) / (subtotal as f64) * 100.0
    } else {
        0.0
    };
    (subtotal, rate_percent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn calculator() -> TaxCalculator {
        let mut rate_map = HashMap::new();
        rate_map.insert("DE".to_string(), 0.19);
        TaxCalculator::new(TaxSettings {
            default_rate: 0.02,
            default_code: "IT_DIGITAL".to_string(),
            default_jurisdiction: "Digital/IT Services".to_string(),
            rate_map,
        })
    }

    #[test]
    fn default_rate_applies_for_unknown_jurisdiction() {
        let b = calculator().breakdown(10000, None);
        assert_eq!(b.tax_cents, 200);
        assert_eq!(b.total_cents, 10200);
        assert_eq!(b.tax_rate_percent, 2.0);
        assert_eq!(b.tax_jurisdiction, "Digital/IT Services");
    }

    #[test]
    fn mapped_jurisdiction_rate_applies() {
        let b = calculator().breakdown(10000, Some("DE"));
        assert_eq!(b.tax_cents, 1900);
        assert_eq!(b.tax_jurisdiction, "DE");
    }

    #[test]
    fn tax_rounds_half_away_from_zero() {
        // 1225 * 0.02 = 24.5 -> 25
        let b = calculator().breakdown(1225, None);
        assert_eq!(b.tax_cents, 25);
    }

    #[test]
    fn derive_from_totals_splits_due_amount() {
        let (subtotal, rate) = derive_from_totals(10200, 200);
        assert_eq!(subtotal, 10000);
        assert!((rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn derive_from_totals_zero_subtotal_has_zero_rate() {
        let (subtotal, rate) = derive_from_totals(0, 0);
        assert_eq!(subtotal, 0);
        assert_eq!(rate, 0.0);
    }
}
