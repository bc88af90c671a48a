//! Declarative field plans: which fields a backfill sets and how each value is
//! computed.

use std::fmt;

use npe_core::{join_key_string, normalize, FieldMap, Record, SlugError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::merge::AttributeTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compute {
    /// Slug of the text in `source`.
    Slug { source: String },
    /// Fixed default value.
    Constant { value: Value },
    /// `column` of the lookup row joined on the plan's join field.
    Lookup { column: String },
    /// Digits of a text value as an integer ("$30 " -> 30). Numbers pass through.
    IntegerFromText { source: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    /// Written as a one-key map in YAML: `compute: { slug: { source: name } }`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub compute: Compute,
    /// Replace a present value when the computed one differs. Off by default:
    /// present fields are left alone.
    #[serde(default)]
    pub overwrite: bool,
}

impl FieldRule {
    pub fn fill(field: &str, compute: Compute) -> Self {
        Self {
            field: field.to_string(),
            compute,
            overwrite: false,
        }
    }

    pub fn replace(field: &str, compute: Compute) -> Self {
        Self {
            field: field.to_string(),
            compute,
            overwrite: true,
        }
    }

    pub fn slug_from(source: &str) -> Self {
        Self::fill(
            npe_core::SLUG_FIELD,
            Compute::Slug {
                source: source.to_string(),
            },
        )
    }
}

/// External table joined on `join_field` of each record.
#[derive(Debug, Clone)]
pub struct LookupJoin {
    pub join_field: String,
    pub table: AttributeTable,
}

#[derive(Debug, Clone, Default)]
pub struct FieldPlan {
    pub rules: Vec<FieldRule>,
    pub lookup: Option<LookupJoin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    MissingSource { source: String },
    NotText { source: String },
    EmptyInput { source: String },
    EmptySlug { source: String },
    NoDigits { source: String },
    OutOfRange { source: String },
    NoLookupTable,
    MissingJoinKey { field: String },
    NoLookupMatch { key: String },
    MissingColumn { column: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingSource { source } => write!(f, "no `{source}` field"),
            SkipReason::NotText { source } => write!(f, "`{source}` is not text"),
            SkipReason::EmptyInput { source } => write!(f, "`{source}` is blank"),
            SkipReason::EmptySlug { source } => {
                write!(f, "`{source}` has no slug characters")
            }
            SkipReason::NoDigits { source } => write!(f, "`{source}` has no digits"),
            SkipReason::OutOfRange { source } => {
                write!(f, "`{source}` is out of range for an integer")
            }
            SkipReason::NoLookupTable => write!(f, "no lookup table configured"),
            SkipReason::MissingJoinKey { field } => write!(f, "no usable `{field}` to join on"),
            SkipReason::NoLookupMatch { key } => write!(f, "no lookup row for {key:?}"),
            SkipReason::MissingColumn { column } => write!(f, "lookup row has no `{column}`"),
        }
    }
}

/// What a plan wants to do to one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlannedUpdate {
    pub updates: FieldMap,
    pub skipped: Vec<(String, SkipReason)>,
}

impl FieldPlan {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self {
            rules,
            lookup: None,
        }
    }

    pub fn with_lookup(mut self, join_field: &str, table: AttributeTable) -> Self {
        self.lookup = Some(LookupJoin {
            join_field: join_field.to_string(),
            table,
        });
        self
    }

    pub fn needs_lookup(&self) -> bool {
        self.rules
            .iter()
            .any(|r| matches!(r.compute, Compute::Lookup { .. }))
    }

    /// Evaluate every rule against the record as it was read. Rules never see
    /// each other's output.
    pub fn evaluate(&self, record: &Record) -> PlannedUpdate {
        let mut planned = PlannedUpdate::default();
        for rule in &self.rules {
            let existing = record.field(&rule.field);
            if existing.is_some() && !rule.overwrite {
                continue;
            }
            match self.compute(&rule.compute, record) {
                Ok(value) => {
                    if existing != Some(&value) {
                        planned.updates.insert(rule.field.clone(), value);
                    }
                }
                Err(reason) => planned.skipped.push((rule.field.clone(), reason)),
            }
        }
        planned
    }

    fn compute(&self, compute: &Compute, record: &Record) -> Result<Value, SkipReason> {
        match compute {
            Compute::Slug { source } => {
                let text = source_text(record, source)?;
                match normalize(text) {
                    Ok(slug) if slug.is_empty() => Err(SkipReason::EmptySlug {
                        source: source.clone(),
                    }),
                    Ok(slug) => Ok(Value::String(slug)),
                    Err(SlugError::EmptyInput) => Err(SkipReason::EmptyInput {
                        source: source.clone(),
                    }),
                }
            }
            Compute::Constant { value } => Ok(value.clone()),
            Compute::Lookup { column } => {
                let join = self.lookup.as_ref().ok_or(SkipReason::NoLookupTable)?;
                let key = record
                    .field(&join.join_field)
                    .and_then(join_key_string)
                    .ok_or_else(|| SkipReason::MissingJoinKey {
                        field: join.join_field.clone(),
                    })?;
                let row = join
                    .table
                    .get(&key)
                    .ok_or(SkipReason::NoLookupMatch { key })?;
                row.get(column)
                    .cloned()
                    .ok_or_else(|| SkipReason::MissingColumn {
                        column: column.clone(),
                    })
            }
            Compute::IntegerFromText { source } => match record.field(source) {
                None | Some(Value::Null) => Err(SkipReason::MissingSource {
                    source: source.clone(),
                }),
                Some(Value::Number(n)) => Ok(Value::Number(n.clone())),
                Some(Value::String(text)) => {
                    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
                    if digits.is_empty() {
                        return Err(SkipReason::NoDigits {
                            source: source.clone(),
                        });
                    }
                    digits
                        .parse::<i64>()
                        .map(Value::from)
                        .map_err(|_| SkipReason::OutOfRange {
                            source: source.clone(),
                        })
                }
                Some(_) => Err(SkipReason::NotText {
                    source: source.clone(),
                }),
            },
        }
    }
}

fn source_text<'a>(record: &'a Record, source: &str) -> Result<&'a str, SkipReason> {
    match record.field(source) {
        None | Some(Value::Null) => Err(SkipReason::MissingSource {
            source: source.to_string(),
        }),
        Some(Value::String(text)) => Ok(text),
        Some(_) => Err(SkipReason::NotText {
            source: source.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::DuplicatePolicy;
    use serde_json::json;

    fn record(id: &str, fields: Value) -> Record {
        Record::new(id, fields.as_object().cloned().expect("object literal"))
    }

    #[test]
    fn present_fields_are_left_alone() {
        let plan = FieldPlan::new(vec![FieldRule::slug_from("name")]);
        let planned = plan.evaluate(&record("1", json!({"name": "Zion", "slug": "custom"})));
        assert!(planned.updates.is_empty());
        assert!(planned.skipped.is_empty());
    }

    #[test]
    fn absent_slug_is_derived_from_source() {
        let plan = FieldPlan::new(vec![FieldRule::slug_from("title")]);
        let planned = plan.evaluate(&record("1", json!({"title": "Grand Canyon: Rim-to-Rim!"})));
        assert_eq!(planned.updates.get("slug"), Some(&json!("grand-canyon-rim-to-rim")));
    }

    #[test]
    fn unusable_sources_are_skipped_with_reasons() {
        let plan = FieldPlan::new(vec![FieldRule::slug_from("title")]);
        let cases = [
            (json!({}), SkipReason::MissingSource { source: "title".into() }),
            (json!({"title": null}), SkipReason::MissingSource { source: "title".into() }),
            (json!({"title": "   "}), SkipReason::EmptyInput { source: "title".into() }),
            (json!({"title": "!!!"}), SkipReason::EmptySlug { source: "title".into() }),
            (json!({"title": 12}), SkipReason::NotText { source: "title".into() }),
        ];
        for (fields, reason) in cases {
            let planned = plan.evaluate(&record("1", fields));
            assert!(planned.updates.is_empty());
            assert_eq!(planned.skipped, vec![("slug".to_string(), reason)]);
        }
    }

    #[test]
    fn defaults_fill_only_missing_fields() {
        let plan = FieldPlan::new(vec![
            FieldRule::fill("entryFee", Compute::Constant { value: json!("$35") }),
            FieldRule::fill("hours", Compute::Constant { value: json!("24/7") }),
        ]);
        let planned = plan.evaluate(&record("1", json!({"entryFee": "$20"})));
        assert_eq!(Value::Object(planned.updates), json!({"hours": "24/7"}));
    }

    #[test]
    fn overwrite_only_writes_differences() {
        let plan = FieldPlan::new(vec![FieldRule::replace(
            "entryFee",
            Compute::IntegerFromText {
                source: "entryFee".into(),
            },
        )]);
        let planned = plan.evaluate(&record("1", json!({"entryFee": "$30 "})));
        assert_eq!(planned.updates.get("entryFee"), Some(&json!(30)));

        let planned = plan.evaluate(&record("1", json!({"entryFee": 30})));
        assert!(planned.updates.is_empty());
        assert!(planned.skipped.is_empty());

        let planned = plan.evaluate(&record("1", json!({"entryFee": "Free"})));
        assert_eq!(
            planned.skipped,
            vec![("entryFee".to_string(), SkipReason::NoDigits { source: "entryFee".into() })]
        );

        let planned = plan.evaluate(&record("1", json!({"entryFee": "$99999999999999999999"})));
        assert_eq!(
            planned.skipped,
            vec![("entryFee".to_string(), SkipReason::OutOfRange { source: "entryFee".into() })]
        );
    }

    #[test]
    fn lookup_rules_join_on_the_plan_table() {
        let table = AttributeTable::from_rows(
            vec![json!({"id": "zion", "hours": "24/7"})
                .as_object()
                .cloned()
                .unwrap()],
            "id",
            None,
            DuplicatePolicy::Reject,
        )
        .unwrap();
        let plan = FieldPlan::new(vec![
            FieldRule::replace("hours", Compute::Lookup { column: "hours".into() }),
            FieldRule::replace("highlight", Compute::Lookup { column: "highlight".into() }),
        ])
        .with_lookup("parkCode", table);
        assert!(plan.needs_lookup());

        let planned = plan.evaluate(&record("1", json!({"parkCode": "zion", "hours": "9-5"})));
        assert_eq!(planned.updates.get("hours"), Some(&json!("24/7")));
        assert_eq!(
            planned.skipped,
            vec![("highlight".to_string(), SkipReason::MissingColumn { column: "highlight".into() })]
        );

        let planned = plan.evaluate(&record("2", json!({"parkCode": "acad"})));
        assert_eq!(planned.skipped.len(), 2);
        assert_eq!(planned.skipped[0].1, SkipReason::NoLookupMatch { key: "acad".into() });
    }

    #[test]
    fn lookup_without_table_is_a_skip() {
        let plan = FieldPlan::new(vec![FieldRule::fill("hours", Compute::Lookup { column: "hours".into() })]);
        let planned = plan.evaluate(&record("1", json!({"parkCode": "zion"})));
        assert_eq!(planned.skipped, vec![("hours".to_string(), SkipReason::NoLookupTable)]);
    }

    #[test]
    fn rules_deserialize_from_yaml() {
        let rules: Vec<FieldRule> = serde_yaml::from_str(
            r#"
- field: slug
  compute: { slug: { source: name } }
- field: entryFee
  compute: { constant: { value: "$35" } }
- field: hours
  compute: { lookup: { column: hours } }
  overwrite: true
- field: entryFee
  compute:
    integer_from_text:
      source: entryFee
"#,
        )
        .unwrap();
        assert_eq!(rules[0], FieldRule::slug_from("name"));
        assert_eq!(
            rules[1],
            FieldRule::fill("entryFee", Compute::Constant { value: json!("$35") })
        );
        assert!(rules[2].overwrite);
        assert_eq!(
            rules[2].compute,
            Compute::Lookup {
                column: "hours".into()
            }
        );
        assert_eq!(
            rules[3].compute,
            Compute::IntegerFromText {
                source: "entryFee".into()
            }
        );
    }
}
