//! Turn a raw APIC response into flat records
//!
//! An [`ExtractionRule`] is a small path expression evaluated against the decoded response:
//!
//! ```text
//! imdata[*].fvTenant.attributes
//! ```
//!
//! selects the `attributes` object of every `fvTenant` element of the top-level `imdata` array,
//! which is where the APIC puts the objects of an ordinary class query. The gjson form
//! `imdata.#.fvTenant.attributes` is accepted as well.
//!
//! Extraction is pure: no I/O, no logging.

use std::{fmt::Display, str::FromStr};

use serde_json::Value;

use crate::catalog::{KEY_SEPARATOR, RecordKind};

/// The attribute holding an APIC object's distinguished name
pub const DISTINGUISHED_NAME_ATTRIBUTE: &str = "dn";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("extraction rule is empty")]
    Empty,

    #[error("extraction rule '{rule}' has an empty segment at position {position}")]
    EmptySegment { rule: String, position: usize },

    #[error("extraction rule '{rule}' has an invalid selector '{selector}'")]
    InvalidSelector { rule: String, selector: String },

    #[error("extraction rule '{rule}' has a malformed segment '{segment}'")]
    MalformedSegment { rule: String, segment: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("value {index} selected by '{rule}' is {found}, not an object")]
    NotAnObject {
        rule: String,
        index: usize,
        found: &'static str,
    },

    #[error(
        "record {index} selected by '{rule}' has no distinguished name \
        (missing or empty 'dn' attribute)"
    )]
    MissingDistinguishedName { rule: String, index: usize },

    #[error("count rule '{rule}' selected {count} records, at most one is allowed")]
    MultipleCountRecords { rule: String, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// Descend into an object member
    Key(String),
    /// Select one element of an array
    Index(usize),
    /// Select every element of an array
    Wildcard,
}

impl Step {
    fn apply<'a>(&self, value: &'a Value, out: &mut Vec<&'a Value>) {
        match self {
            Self::Key(key) => out.extend(value.as_object().and_then(|o| o.get(key))),
            Self::Index(i) => out.extend(value.as_array().and_then(|a| a.get(*i))),
            Self::Wildcard => {
                if let Some(a) = value.as_array() {
                    out.extend(a.iter());
                }
            }
        }
    }
}

/// A parsed path expression selecting the records of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRule {
    steps: Vec<Step>,
}

impl ExtractionRule {
    /// Parse a rule such as `imdata[*].fvBD.attributes` or `imdata.0.infraSetPol.attributes`
    pub fn parse(rule: &str) -> Result<Self, RuleError> {
        if rule.trim().is_empty() {
            return Err(RuleError::Empty);
        }
        let mut steps = Vec::new();
        for (position, segment) in rule.split('.').enumerate() {
            if segment.is_empty() {
                return Err(RuleError::EmptySegment {
                    rule: rule.to_owned(),
                    position,
                });
            }
            parse_segment(rule, segment, &mut steps)?;
        }
        Ok(Self { steps })
    }

    /// `imdata[*].<class>.attributes`: the attributes of every top-level object of `class`
    pub fn class_attributes(class: &str) -> Self {
        Self {
            steps: vec![
                Step::Key("imdata".to_owned()),
                Step::Wildcard,
                Step::Key(class.to_owned()),
                Step::Key("attributes".to_owned()),
            ],
        }
    }

    /// Every value in `doc` the rule selects, in document order
    pub fn select<'a>(&self, doc: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![doc];
        for step in &self.steps {
            let mut next = Vec::with_capacity(current.len());
            for v in current {
                step.apply(v, &mut next);
            }
            current = next;
        }
        current
    }
}

fn parse_segment(rule: &str, segment: &str, steps: &mut Vec<Step>) -> Result<(), RuleError> {
    let malformed = || RuleError::MalformedSegment {
        rule: rule.to_owned(),
        segment: segment.to_owned(),
    };

    match segment {
        "*" | "#" => {
            steps.push(Step::Wildcard);
            return Ok(());
        }
        s if s.bytes().all(|b| b.is_ascii_digit()) => {
            steps.push(parse_index(rule, s)?);
            return Ok(());
        }
        _ => {}
    }

    let (key, mut rest) = match segment.find('[') {
        Some(i) => segment.split_at(i),
        None => (segment, ""),
    };
    if key.contains(']') {
        return Err(malformed());
    }
    if !key.is_empty() {
        steps.push(Step::Key(key.to_owned()));
    }
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[').ok_or_else(malformed)?;
        let close = inner.find(']').ok_or_else(malformed)?;
        let selector = &inner[..close];
        match selector {
            "*" | "#" => steps.push(Step::Wildcard),
            s => steps.push(parse_index(rule, s)?),
        }
        rest = &inner[close + 1..];
    }
    Ok(())
}

fn parse_index(rule: &str, selector: &str) -> Result<Step, RuleError> {
    let invalid = || RuleError::InvalidSelector {
        rule: rule.to_owned(),
        selector: selector.to_owned(),
    };
    if selector.is_empty() || !selector.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    selector.parse().map(Step::Index).map_err(|_| invalid())
}

impl FromStr for ExtractionRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for ExtractionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for step in &self.steps {
            match step {
                Step::Key(k) => {
                    if !first {
                        f.write_str(".")?;
                    }
                    f.write_str(k)?;
                }
                Step::Index(i) => write!(f, "[{i}]")?,
                Step::Wildcard => f.write_str("[*]")?,
            }
            first = false;
        }
        Ok(())
    }
}

/// A single flat object extracted from a response
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    distinguished_name: Option<String>,
    body: Value,
}

impl Record {
    /// The record's distinguished name; `None` only for count records
    pub fn distinguished_name(&self) -> Option<&str> {
        self.distinguished_name.as_deref()
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The key this record is persisted under in the namespace `prefix`
    pub fn key(&self, prefix: &str) -> String {
        match &self.distinguished_name {
            Some(dn) => format!("{prefix}{KEY_SEPARATOR}{dn}"),
            None => prefix.to_owned(),
        }
    }

    /// The JSON text persisted for this record
    ///
    /// Object members are written in sorted order, so equal records always serialize to the
    /// same text.
    pub fn to_json(&self) -> String {
        self.body.to_string()
    }
}

/// Extract the records selected by `rule` from `response`
///
/// For [`RecordKind::List`] every record must carry a non-empty distinguished name; for
/// [`RecordKind::Count`] at most one record may be selected and none is required.
pub fn extract(
    response: &Value,
    rule: &ExtractionRule,
    kind: RecordKind,
) -> Result<Vec<Record>, ExtractError> {
    let selected = rule.select(response);
    if kind == RecordKind::Count && selected.len() > 1 {
        return Err(ExtractError::MultipleCountRecords {
            rule: rule.to_string(),
            count: selected.len(),
        });
    }

    selected
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let Some(object) = value.as_object() else {
                return Err(ExtractError::NotAnObject {
                    rule: rule.to_string(),
                    index,
                    found: type_name(value),
                });
            };
            let distinguished_name = match kind {
                RecordKind::Count => None,
                RecordKind::List => {
                    let dn = object
                        .get(DISTINGUISHED_NAME_ATTRIBUTE)
                        .and_then(Value::as_str)
                        .filter(|dn| !dn.is_empty())
                        .ok_or_else(|| ExtractError::MissingDistinguishedName {
                            rule: rule.to_string(),
                            index,
                        })?;
                    Some(dn.to_owned())
                }
            };
            Ok(Record {
                distinguished_name,
                body: value.clone(),
            })
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::catalog::{ResourceDescriptor, effective_rule};

    #[test]
    fn parse_forms() {
        let canonical = ExtractionRule::parse("imdata[*].fvTenant.attributes").unwrap();
        assert_eq!(
            ExtractionRule::parse("imdata.#.fvTenant.attributes").unwrap(),
            canonical
        );
        assert_eq!(
            ExtractionRule::parse("imdata.*.fvTenant.attributes").unwrap(),
            canonical
        );
        assert_eq!(ExtractionRule::class_attributes("fvTenant"), canonical);
        assert_eq!(
            ExtractionRule::parse("imdata.0.infraSetPol.attributes").unwrap(),
            ExtractionRule::parse("imdata[0].infraSetPol.attributes").unwrap()
        );
        assert_eq!(
            "a[0][*].b".parse::<ExtractionRule>().unwrap().to_string(),
            "a[0][*].b"
        );
    }

    #[test]
    fn parse_errors() {
        assert_eq!(ExtractionRule::parse(""), Err(RuleError::Empty));
        assert!(matches!(
            ExtractionRule::parse("imdata..attributes"),
            Err(RuleError::EmptySegment { position: 1, .. })
        ));
        assert!(matches!(
            ExtractionRule::parse("imdata[x].fvBD"),
            Err(RuleError::InvalidSelector { ref selector, .. }) if selector == "x"
        ));
        assert!(matches!(
            ExtractionRule::parse("imdata[*"),
            Err(RuleError::MalformedSegment { .. })
        ));
        assert!(matches!(
            ExtractionRule::parse("imdata[*]x"),
            Err(RuleError::MalformedSegment { .. })
        ));
        assert!(matches!(
            ExtractionRule::parse("ab]c"),
            Err(RuleError::MalformedSegment { .. })
        ));
    }

    #[test]
    fn default_rule_extracts_tenant() {
        let response = json!({"imdata":[{"fvTenant":{"attributes":{"dn":"uni/tn-A"}}}]});
        let descriptor = ResourceDescriptor::new("fvTenant");
        let records = extract(
            &response,
            &effective_rule(&descriptor),
            descriptor.kind(),
        )
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].distinguished_name(), Some("uni/tn-A"));
        assert_eq!(records[0].key(descriptor.output_prefix()), "fvTenant:uni/tn-A");
        assert_eq!(records[0].to_json(), r#"{"dn":"uni/tn-A"}"#);
    }

    #[test]
    fn wildcard_skips_other_classes() {
        let response = json!({
            "totalCount": "3",
            "imdata": [
                {"fvBD": {"attributes": {"dn": "uni/tn-a/BD-1", "name": "1"}}},
                {"fvCtx": {"attributes": {"dn": "uni/tn-a/ctx-1"}}},
                {"fvBD": {"attributes": {"dn": "uni/tn-a/BD-2", "name": "2"}}}
            ]
        });
        let records = extract(
            &response,
            &ExtractionRule::class_attributes("fvBD"),
            RecordKind::List,
        )
        .unwrap();
        let dns: Vec<_> = records
            .iter()
            .map(|r| r.distinguished_name().unwrap())
            .collect();
        assert_eq!(dns, vec!["uni/tn-a/BD-1", "uni/tn-a/BD-2"]);
    }

    #[test]
    fn index_selects_one_element() {
        let response = json!({"imdata":[
            {"infraSetPol":{"attributes":{"dn":"uni/infra/settings"}}},
            {"infraSetPol":{"attributes":{"dn":"uni/infra/other"}}}
        ]});
        let rule = ExtractionRule::parse("imdata[0].infraSetPol.attributes").unwrap();
        let records = extract(&response, &rule, RecordKind::List).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].distinguished_name(), Some("uni/infra/settings"));
    }

    #[test]
    fn count_response_yields_one_record_without_dn() {
        let response = json!({"imdata":[{"moCount":{"attributes":{"count":"5"}}}]});
        let rule = ExtractionRule::parse("imdata[*].moCount.attributes").unwrap();
        let records = extract(&response, &rule, RecordKind::Count).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].distinguished_name(), None);
        assert_eq!(records[0].key("fvCEp"), "fvCEp");
        assert_eq!(records[0].body(), &json!({"count": "5"}));
    }

    #[test]
    fn count_response_with_many_records_is_rejected() {
        let response = json!({"imdata":[
            {"moCount":{"attributes":{"count":"5"}}},
            {"moCount":{"attributes":{"count":"6"}}}
        ]});
        let err = extract(
            &response,
            &ExtractionRule::class_attributes("moCount"),
            RecordKind::Count,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::MultipleCountRecords { count: 2, .. }
        ));
    }

    #[test]
    fn missing_or_empty_dn_is_an_integrity_failure() {
        let rule = ExtractionRule::class_attributes("fvTenant");
        for attributes in [json!({"name": "a"}), json!({"dn": ""}), json!({"dn": 7})] {
            let response = json!({"imdata":[
                {"fvTenant":{"attributes":{"dn":"uni/tn-ok"}}},
                {"fvTenant":{"attributes": attributes}}
            ]});
            let err = extract(&response, &rule, RecordKind::List).unwrap_err();
            assert_eq!(
                err,
                ExtractError::MissingDistinguishedName {
                    rule: "imdata[*].fvTenant.attributes".to_owned(),
                    index: 1,
                }
            );
        }
    }

    #[test]
    fn non_object_selection_is_rejected() {
        let response = json!({"imdata":[{"fvTenant":{"attributes":"oops"}}]});
        let err = extract(
            &response,
            &ExtractionRule::class_attributes("fvTenant"),
            RecordKind::List,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::NotAnObject { index: 0, found: "a string", .. }
        ));
    }

    #[test]
    fn empty_and_unexpected_shapes_yield_nothing() {
        let rule = ExtractionRule::class_attributes("fvTenant");
        for response in [
            json!({"imdata": []}),
            json!({"totalCount": "0"}),
            json!({"imdata": {"fvTenant": {}}}),
            json!([]),
        ] {
            assert!(extract(&response, &rule, RecordKind::List).unwrap().is_empty());
        }
    }

    #[test]
    fn record_json_is_key_sorted() {
        let response = json!({"imdata":[{"fvAEPg":{"attributes":{
            "name": "web", "dn": "uni/tn-a/ap-b/epg-web", "descr": ""
        }}}]});
        let records = extract(
            &response,
            &ExtractionRule::class_attributes("fvAEPg"),
            RecordKind::List,
        )
        .unwrap();
        assert_eq!(
            records[0].to_json(),
            r#"{"descr":"","dn":"uni/tn-a/ap-b/epg-web","name":"web"}"#
        );
    }
}
