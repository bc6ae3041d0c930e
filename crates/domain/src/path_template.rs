//! Path/label template rendering for organizing exported documents.
//!
//! Rendering is a total, side-effect-free function over a template string and
//! an invoice-derived context: a single left-to-right pass, failing fast on
//! any unresolved placeholder so a partially-templated destination is never
//! written.

use std::collections::BTreeMap;

use fakturenn_core::DomainError;

use crate::invoice::Invoice;

/// Placeholders accepted by [`validate_template`].
pub const TEMPLATE_VARIABLES: &[&str] = &[
    "year",
    "month",
    "month_name",
    "quarter",
    "date",
    "invoice_id",
    "source",
    "amount",
    "filename",
];

const FRENCH_MONTHS: [&str; 12] = [
    "Janvier",
    "Février",
    "Mars",
    "Avril",
    "Mai",
    "Juin",
    "Juillet",
    "Août",
    "Septembre",
    "Octobre",
    "Novembre",
    "Décembre",
];

/// French month name for a 1-based month number.
pub fn month_name(month: u32) -> Option<&'static str> {
    FRENCH_MONTHS.get(month.checked_sub(1)? as usize).copied()
}

/// Calendar quarter ("Q1".."Q4") for a 1-based month number.
pub fn quarter(month: u32) -> &'static str {
    match month {
        1..=3 => "Q1",
        4..=6 => "Q2",
        7..=9 => "Q3",
        _ => "Q4",
    }
}

/// Resolved placeholder values for one rendering pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Derive the full context from an invoice.
    ///
    /// Date-derived values (`year`, `month`, `month_name`, `quarter`, `date`)
    /// and identity values win over same-named free-form extracted fields.
    pub fn from_invoice(invoice: &Invoice) -> Self {
        let mut values: BTreeMap<String, String> = invoice.fields.clone();

        let date = invoice.date;
        let month = date.format("%m").to_string();
        values.insert("year".into(), date.format("%Y").to_string());
        if let Some(name) = month_name(month.parse().unwrap_or(0)) {
            values.insert("month_name".into(), name.to_string());
        }
        values.insert(
            "quarter".into(),
            quarter(month.parse().unwrap_or(0)).to_string(),
        );
        values.insert("month".into(), month);
        values.insert("date".into(), date.format("%Y-%m-%d").to_string());

        values.insert("invoice_id".into(), invoice.invoice_id.clone());
        values.insert("source".into(), invoice.source_name.clone());
        if let Some(amount) = invoice.amount {
            values.insert("amount".into(), format!("{amount:.2}"));
        }
        if let Some(filename) = invoice.document_filename() {
            values.insert("filename".into(), filename.to_string());
        }

        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

/// Render `template` against `context`.
///
/// `{{` and `}}` escape literal braces. Errors on empty templates, unknown
/// or unterminated placeholders, and stray `}`.
pub fn render_template(template: &str, context: &TemplateContext) -> Result<String, DomainError> {
    if template.is_empty() {
        return Err(DomainError::validation("template cannot be empty"));
    }

    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    rendered.push('{');
                    continue;
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(DomainError::validation(format!(
                                "unterminated placeholder '{{{name}' in template"
                            )));
                        }
                    }
                }
                match context.get(&name) {
                    Some(value) => rendered.push_str(value),
                    None => {
                        return Err(DomainError::validation(format!(
                            "unresolved template placeholder '{name}'"
                        )));
                    }
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    rendered.push('}');
                } else {
                    return Err(DomainError::validation("unmatched '}' in template"));
                }
            }
            c => rendered.push(c),
        }
    }

    Ok(rendered)
}

/// Check a template ahead of time: every placeholder must be a known
/// variable, and at least one placeholder must be present.
pub fn validate_template(template: &str) -> Result<(), DomainError> {
    if template.is_empty() {
        return Err(DomainError::validation("template cannot be empty"));
    }

    let mut found = 0usize;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '{' {
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            continue;
        }
        let mut name = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => name.push(c),
                None => {
                    return Err(DomainError::validation(format!(
                        "unterminated placeholder '{{{name}' in template"
                    )));
                }
            }
        }
        if !TEMPLATE_VARIABLES.contains(&name.as_str()) {
            return Err(DomainError::validation(format!(
                "unknown template variable '{name}'"
            )));
        }
        found += 1;
    }

    if found == 0 {
        return Err(DomainError::validation(
            "template must contain at least one placeholder",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn invoice() -> Invoice {
        Invoice::new(
            "INV-001",
            NaiveDate::from_ymd_opt(2025, 10, 29).unwrap(),
            "Free",
        )
        .with_amount(19.99)
        .with_document("/tmp/downloads/facture_octobre.pdf")
    }

    #[test]
    fn renders_detailed_template_deterministically() {
        let ctx = TemplateContext::from_invoice(&invoice());
        let template = "{year}/{month_name}/[{source}] {invoice_id}.pdf";
        for _ in 0..3 {
            assert_eq!(
                render_template(template, &ctx).unwrap(),
                "2025/Octobre/[Free] INV-001.pdf"
            );
        }
    }

    #[test]
    fn renders_all_derived_variables() {
        let ctx = TemplateContext::from_invoice(&invoice());
        assert_eq!(
            render_template("{date} {month} {quarter} {amount} {filename}", &ctx).unwrap(),
            "2025-10-29 10 Q4 19.99 facture_octobre.pdf"
        );
    }

    #[test]
    fn unresolved_placeholder_fails_before_any_write() {
        let ctx = TemplateContext::from_invoice(&invoice());
        let err = render_template("{year}/{nonexistent}.pdf", &ctx).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn amount_placeholder_unresolved_without_amount() {
        let inv = Invoice::new(
            "INV-002",
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            "Free",
        );
        let ctx = TemplateContext::from_invoice(&inv);
        assert!(render_template("{amount}", &ctx).is_err());
    }

    #[test]
    fn braces_escape() {
        let ctx = TemplateContext::from_invoice(&invoice());
        assert_eq!(render_template("{{{year}}}", &ctx).unwrap(), "{2025}");
    }

    #[test]
    fn derived_values_win_over_extracted_fields() {
        let inv = invoice().with_field("year", "1999");
        let ctx = TemplateContext::from_invoice(&inv);
        assert_eq!(render_template("{year}", &ctx).unwrap(), "2025");
    }

    #[test]
    fn validate_accepts_known_variables() {
        assert!(validate_template("{year}/{month}/{source}_{invoice_id}.pdf").is_ok());
    }

    #[test]
    fn validate_rejects_unknown_variable() {
        assert!(validate_template("{year}/{invalid_var}.pdf").is_err());
    }

    #[test]
    fn validate_requires_a_placeholder() {
        assert!(validate_template("static/path.pdf").is_err());
        assert!(validate_template("").is_err());
    }

    #[test]
    fn quarters_cover_the_year() {
        assert_eq!(quarter(1), "Q1");
        assert_eq!(quarter(3), "Q1");
        assert_eq!(quarter(4), "Q2");
        assert_eq!(quarter(9), "Q3");
        assert_eq!(quarter(12), "Q4");
    }
}
