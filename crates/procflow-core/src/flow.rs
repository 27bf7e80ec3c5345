//! Reference flow loading and multilingual text.
//!
//! Accepts either a catalogue flow document (`flowDataSet` →
//! `flowInformation` → `dataSetInformation`) or a flat summary object with
//! `id`, `base_name`, `unit`, ... keys.

use crate::error::DerivationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text with a language tag (`en`, `zh`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageTaggedText {
    pub lang: String,
    pub text: String,
}

impl LanguageTaggedText {
    pub fn new(lang: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            text: text.into(),
        }
    }

    pub fn en(text: impl Into<String>) -> Self {
        Self::new("en", text)
    }

    /// Non-empty text carrying a plausible language tag.
    pub fn is_well_formed(&self) -> bool {
        let lang = self.lang.trim();
        !self.text.trim().is_empty()
            && (2..=8).contains(&lang.len())
            && lang.chars().all(|c| c.is_ascii_alphabetic() || c == '-')
    }
}

/// One text in several languages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiLangText(pub Vec<LanguageTaggedText>);

impl MultiLangText {
    pub fn single(lang: &str, text: &str) -> Self {
        Self(vec![LanguageTaggedText::new(lang, text)])
    }

    /// Preferred language first, otherwise the first non-empty entry.
    pub fn pick(&self, prefer: &str) -> Option<&str> {
        let prefer = prefer.to_ascii_lowercase();
        self.0
            .iter()
            .find(|entry| entry.lang.to_ascii_lowercase() == prefer && !entry.text.is_empty())
            .or_else(|| self.0.iter().find(|entry| !entry.text.is_empty()))
            .map(|entry| entry.text.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|entry| entry.text.trim().is_empty())
    }

    fn from_value(value: Option<&Value>) -> Self {
        let mut out = Vec::new();
        if let Some(value) = value {
            collect_lang_entries(value, &mut out);
        }
        Self(out)
    }
}

fn collect_lang_entries(value: &Value, out: &mut Vec<LanguageTaggedText>) {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if !text.is_empty() {
                out.push(LanguageTaggedText::en(text));
            }
        }
        Value::Object(map) => {
            let text = ["#text", "text", "@value"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty());
            if let Some(text) = text {
                let lang = ["@xml:lang", "lang", "@language"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_str))
                    .unwrap_or("en");
                out.push(LanguageTaggedText::new(lang.trim(), text));
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_lang_entries(item, out);
            }
        }
        _ => {}
    }
}

/// The single flow a derivation run starts from. Read-only after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFlow {
    pub id: String,
    pub version: Option<String>,
    pub base_name: MultiLangText,
    pub treatment: MultiLangText,
    pub mix_and_location: MultiLangText,
    pub general_comment: MultiLangText,
    pub classification: Vec<String>,
    pub unit: Option<String>,
}

impl ReferenceFlow {
    /// Minimal flow with an English name, mostly for tests and tooling.
    pub fn named(id: &str, name: &str, unit: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            version: None,
            base_name: MultiLangText::single("en", name),
            treatment: MultiLangText::default(),
            mix_and_location: MultiLangText::default(),
            general_comment: MultiLangText::default(),
            classification: Vec::new(),
            unit: unit.map(str::to_string),
        }
    }

    /// English base name, falling back to any language.
    pub fn name(&self) -> &str {
        self.base_name.pick("en").unwrap_or("reference flow")
    }

    pub fn unit_or_default(&self) -> &str {
        self.unit.as_deref().unwrap_or("unit")
    }

    pub fn from_json_str(text: &str) -> Result<Self, DerivationError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| DerivationError::InvalidReferenceFlow(e.to_string()))?;
        Self::from_document(&value)
    }

    pub fn from_document(document: &Value) -> Result<Self, DerivationError> {
        let flow = document.get("flowDataSet").unwrap_or(document);
        let flow = if flow.is_object() {
            flow
        } else {
            return Err(DerivationError::InvalidReferenceFlow(
                "expected a JSON object".to_string(),
            ));
        };

        let info = flow
            .get("flowInformation")
            .and_then(|info| info.get("dataSetInformation"));
        let parsed = match info {
            Some(info) => Self::from_catalogue_document(flow, info),
            None => Self::from_summary(flow),
        };

        if parsed.base_name.is_empty() {
            return Err(DerivationError::InvalidReferenceFlow(
                "flow has no base name".to_string(),
            ));
        }
        Ok(parsed)
    }

    fn from_catalogue_document(flow: &Value, info: &Value) -> Self {
        let name = info.get("name");
        let field = |key: &str| MultiLangText::from_value(name.and_then(|n| n.get(key)));

        let classification = info
            .get("classificationInformation")
            .and_then(|c| {
                c.get("common:classification")
                    .or_else(|| c.get("common:elementaryFlowCategorization"))
            })
            .and_then(|c| c.get("common:class").or_else(|| c.get("common:category")))
            .map(classification_path)
            .unwrap_or_default();

        let version = flow
            .pointer("/administrativeInformation/publicationAndOwnership/common:dataSetVersion")
            .and_then(Value::as_str)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            id: string_field(info, "common:UUID").unwrap_or_default(),
            version,
            base_name: field("baseName"),
            treatment: field("treatmentStandardsRoutes"),
            mix_and_location: field("mixAndLocationTypes"),
            general_comment: MultiLangText::from_value(info.get("common:generalComment")),
            classification,
            unit: string_field(flow, "unit"),
        }
    }

    fn from_summary(flow: &Value) -> Self {
        Self {
            id: string_field(flow, "id")
                .or_else(|| string_field(flow, "uuid"))
                .unwrap_or_default(),
            version: string_field(flow, "version"),
            base_name: MultiLangText::from_value(
                flow.get("base_name").or_else(|| flow.get("name")),
            ),
            treatment: MultiLangText::from_value(flow.get("treatment")),
            mix_and_location: MultiLangText::from_value(flow.get("mix_and_location")),
            general_comment: MultiLangText::from_value(flow.get("general_comment")),
            classification: flow
                .get("classification")
                .map(classification_path)
                .unwrap_or_default(),
            unit: string_field(flow, "unit"),
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn classification_path(value: &Value) -> Vec<String> {
    let mut entries: Vec<(i64, String)> = Vec::new();
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for (position, item) in items.into_iter().enumerate() {
        let level = item
            .get("@level")
            .and_then(|l| l.as_str().and_then(|s| s.parse().ok()).or_else(|| l.as_i64()))
            .unwrap_or(position as i64);
        let text = match item {
            Value::String(text) => Some(text.trim().to_string()),
            other => other
                .get("#text")
                .and_then(Value::as_str)
                .map(|t| t.trim().to_string()),
        };
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            entries.push((level, text));
        }
    }
    entries.sort_by_key(|(level, _)| *level);
    entries.into_iter().map(|(_, text)| text).collect()
}
