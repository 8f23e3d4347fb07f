use serde::{Deserialize, Serialize};

/// Input widget type for one config field, mirrored by the management UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "checkbox")]
    Checkbox,
    #[serde(rename = "select")]
    Select,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectOption {
    pub value: &'static str,
    pub label: &'static str,
}

/// One field of a backend or processor config schema. Schemas are exposed as
/// ordered lists so clients can render forms without knowing the backend.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigField {
    pub key: &'static str,
    pub label: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SelectOption>>,
}

impl ConfigField {
    pub fn required(key: &'static str, label: &'static str, field_type: FieldType) -> Self {
        ConfigField {
            key,
            label,
            field_type,
            required: true,
            default: None,
            placeholder: None,
            options: None,
        }
    }

    pub fn optional(key: &'static str, label: &'static str, field_type: FieldType) -> Self {
        ConfigField {
            required: false,
            ..Self::required(key, label, field_type)
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_placeholder(mut self, placeholder: &'static str) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn with_options(mut self, options: Vec<SelectOption>) -> Self {
        self.options = Some(options);
        self
    }
}
