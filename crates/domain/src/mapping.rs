use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fakturenn_core::{ExportId, MappingId, SourceId};

use crate::invoice::Invoice;

/// Optional filter evaluated against an extracted invoice before a mapped
/// export is dispatched. All set conditions must hold.
///
/// Unknown keys are rejected at the serde boundary so a typo'd condition
/// cannot silently widen a mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConditions {
    #[serde(default)]
    pub min_amount: Option<f64>,
    #[serde(default)]
    pub max_amount: Option<f64>,
    #[serde(default)]
    pub invoice_id_contains: Option<String>,
    #[serde(default)]
    pub source_equals: Option<String>,
}

impl FilterConditions {
    /// An amount condition against an invoice with no parsed amount fails:
    /// the filter cannot be verified, so the mapping does not apply.
    pub fn matches(&self, invoice: &Invoice) -> bool {
        if let Some(min) = self.min_amount {
            match invoice.amount {
                Some(amount) if amount >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_amount {
            match invoice.amount {
                Some(amount) if amount <= max => {}
                _ => return false,
            }
        }
        if let Some(needle) = &self.invoice_id_contains {
            if !invoice.invoice_id.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(source) = &self.source_equals {
            if &invoice.source_name != source {
                return false;
            }
        }
        true
    }
}

/// Prioritized, conditionally-filtered edge from a source to an export.
///
/// Lower priority values are emitted first. Priority orders emission only;
/// exports complete concurrently and callers must not rely on completion
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: MappingId,
    pub source_id: SourceId,
    pub export_id: ExportId,
    pub priority: i32,
    #[serde(default)]
    pub conditions: Option<FilterConditions>,
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    pub fn new(source_id: SourceId, export_id: ExportId) -> Self {
        Self {
            id: MappingId::new(),
            source_id,
            export_id,
            priority: 1,
            conditions: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conditions(mut self, conditions: FilterConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn passes(&self, invoice: &Invoice) -> bool {
        self.conditions
            .as_ref()
            .map_or(true, |c| c.matches(invoice))
    }
}
