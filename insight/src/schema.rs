//! Typed dataset schema context.
//!
//! Every querying capability receives a per-field inferred type so it
//! stays inside its declared domain: numeric and date fields belong to
//! quantitative analysis, text fields to semantic matching. Nothing is
//! hardcoded; types are inferred from sampled values of the actual
//! data when the ingestion layer does not supply a profile.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Inferred type of one dataset field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Numeric,
    Date,
    Text,
    Boolean,
}

/// Profile of one field: inferred type, nullability, and a few sample
/// values for prompt grounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldProfile {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub nullable: bool,
    pub sample_values: Vec<String>,
}

/// Schema context for one dataset, keyed by field name in column order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub fields: IndexMap<String, FieldProfile>,
    pub row_count: u64,
}

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\d{4}-\d{2}-\d{2}",
        r"^\d{2}/\d{2}/\d{4}",
        r"^\d{2}-\d{2}-\d{4}",
        r"^\d{1,2}/\d{1,2}/\d{2,4}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static date pattern"))
    .collect()
});

fn is_numeric(value: &str) -> bool {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '%' | ' '))
        .collect();
    !cleaned.is_empty() && cleaned.parse::<f64>().is_ok()
}

fn is_date(value: &str) -> bool {
    if value.len() < 6 {
        return false;
    }
    // A bare year like "2023" is numeric, not a date.
    if value.chars().all(|c| c.is_ascii_digit()) && value.len() <= 4 {
        return false;
    }
    DATE_PATTERNS.iter().any(|p| p.is_match(value))
}

fn is_boolean(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "false" | "yes" | "no" | "0" | "1" | "t" | "f" | "y" | "n"
    )
}

/// Infer a field type from sampled values. A type wins when at least
/// 80% of the non-empty samples match it; otherwise the field is text.
pub fn infer_field_type(samples: &[String]) -> FieldType {
    let mut numeric = 0usize;
    let mut date = 0usize;
    let mut boolean = 0usize;
    let mut total = 0usize;

    for sample in samples {
        let s = sample.trim();
        if s.is_empty() {
            continue;
        }
        total += 1;
        if is_boolean(s) {
            boolean += 1;
        } else if is_numeric(s) {
            numeric += 1;
        } else if is_date(s) {
            date += 1;
        }
    }

    if total == 0 {
        return FieldType::Text;
    }
    let threshold = (total as f64 * 0.8).ceil() as usize;
    if numeric >= threshold {
        FieldType::Numeric
    } else if date >= threshold {
        FieldType::Date
    } else if boolean >= threshold {
        FieldType::Boolean
    } else {
        FieldType::Text
    }
}

impl DatasetSchema {
    pub fn field_names_of_type(&self, field_type: FieldType) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, p)| p.field_type == field_type)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Render the schema for a query-planning prompt, grouped by type
    /// so the prompt can state which fields belong to which domain.
    pub fn render_for_prompt(&self, table: &str) -> String {
        let mut lines = vec![format!("Table: {}", table)];
        lines.push(format!("Total rows: {}", self.row_count));

        let numeric = self.field_names_of_type(FieldType::Numeric);
        if !numeric.is_empty() {
            lines.push("\nNumeric fields (use for math/aggregation):".to_string());
            for name in numeric {
                let samples = self.sample_preview(name);
                if samples.is_empty() {
                    lines.push(format!("  - {}", name));
                } else {
                    lines.push(format!("  - {}  (examples: {})", name, samples));
                }
            }
        }

        let dates = self.field_names_of_type(FieldType::Date);
        if !dates.is_empty() {
            lines.push("\nDate fields (use for date filtering and trends):".to_string());
            for name in dates {
                lines.push(format!("  - {}", name));
            }
        }

        let booleans = self.field_names_of_type(FieldType::Boolean);
        if !booleans.is_empty() {
            lines.push("\nBoolean fields:".to_string());
            for name in booleans {
                lines.push(format!("  - {}", name));
            }
        }

        let text = self.field_names_of_type(FieldType::Text);
        if !text.is_empty() {
            lines.push(format!(
                "\nText fields (meaning and matching only, never arithmetic): {}",
                text.join(", ")
            ));
        }

        lines.join("\n")
    }

    fn sample_preview(&self, field: &str) -> String {
        self.fields
            .get(field)
            .map(|p| {
                p.sample_values
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_infer_numeric_with_formatting() {
        let s = samples(&["$1,200.50", "300", "42%", "7"]);
        assert_eq!(infer_field_type(&s), FieldType::Numeric);
    }

    #[test]
    fn test_infer_date() {
        let s = samples(&["2024-01-15", "2023-11-02", "2022-07-30"]);
        assert_eq!(infer_field_type(&s), FieldType::Date);
    }

    #[test]
    fn test_infer_boolean() {
        let s = samples(&["yes", "no", "yes", "y"]);
        assert_eq!(infer_field_type(&s), FieldType::Boolean);
    }

    #[test]
    fn test_mixed_samples_fall_back_to_text() {
        let s = samples(&["acme corp", "42", "2024-01-01", "hello"]);
        assert_eq!(infer_field_type(&s), FieldType::Text);
    }

    #[test]
    fn test_empty_samples_are_text() {
        assert_eq!(infer_field_type(&[]), FieldType::Text);
        assert_eq!(infer_field_type(&samples(&["", "  "])), FieldType::Text);
    }

    #[test]
    fn test_bare_year_is_numeric_not_date() {
        let s = samples(&["2023", "2024", "2021"]);
        assert_eq!(infer_field_type(&s), FieldType::Numeric);
    }

    #[test]
    fn test_render_groups_fields_by_type() {
        let mut fields = IndexMap::new();
        fields.insert(
            "revenue".to_string(),
            FieldProfile {
                field_type: FieldType::Numeric,
                nullable: false,
                sample_values: samples(&["100", "250"]),
            },
        );
        fields.insert(
            "notes".to_string(),
            FieldProfile {
                field_type: FieldType::Text,
                nullable: true,
                sample_values: vec![],
            },
        );
        let schema = DatasetSchema { fields, row_count: 10 };
        let rendered = schema.render_for_prompt("records");
        assert!(rendered.contains("Numeric fields"));
        assert!(rendered.contains("revenue"));
        assert!(rendered.contains("Text fields"));
        assert!(rendered.contains("notes"));
    }
}
