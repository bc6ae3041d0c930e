use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fakturenn_core::{AutomationId, SourceId};

/// Source kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    FreeInvoice,
    FreeMobileInvoice,
    Gmail,
}

impl core::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            SourceKind::FreeInvoice => "FreeInvoice",
            SourceKind::FreeMobileInvoice => "FreeMobileInvoice",
            SourceKind::Gmail => "Gmail",
        };
        f.write_str(name)
    }
}

/// Per-variant extraction configuration.
///
/// A closed sum type: adding a source kind is a compile-time-checked
/// exhaustive match, not a runtime registry lookup. The extraction
/// parameters themselves are opaque to the orchestration core and
/// interpreted only by the extractor collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// Free ISP subscriber-area invoice downloads.
    FreeInvoice {
        #[serde(default)]
        extraction_params: JsonValue,
    },
    /// Free Mobile subscriber-area invoice downloads.
    FreeMobileInvoice {
        #[serde(default)]
        extraction_params: JsonValue,
    },
    /// Mailbox search for invoice attachments.
    Gmail {
        #[serde(default)]
        sender_from: Option<String>,
        #[serde(default)]
        subject_contains: Option<String>,
        #[serde(default)]
        extraction_params: JsonValue,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::FreeInvoice { .. } => SourceKind::FreeInvoice,
            SourceConfig::FreeMobileInvoice { .. } => SourceKind::FreeMobileInvoice,
            SourceConfig::Gmail { .. } => SourceKind::Gmail,
        }
    }
}

/// An invoice source attached to an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub automation_id: AutomationId,
    pub name: String,
    pub config: SourceConfig,
    /// Cap on documents extracted per run.
    pub max_results: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(
        automation_id: AutomationId,
        name: impl Into<String>,
        config: SourceConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SourceId::new(),
            automation_id,
            name: name.into(),
            config,
            max_results: 30,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.config.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_serializes_with_type_tag() {
        let config = SourceConfig::Gmail {
            sender_from: Some("billing@provider.example".into()),
            subject_contains: Some("facture".into()),
            extraction_params: JsonValue::Null,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "Gmail");
        assert_eq!(json["sender_from"], "billing@provider.example");

        let back: SourceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), SourceKind::Gmail);
    }
}
