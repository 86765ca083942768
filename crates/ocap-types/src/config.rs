use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("vat config must set exactly one of sourceSpec, bundleSpec, bundleName")]
    AmbiguousSource,
}

/// Where a vat's code comes from. Exactly one variant, by construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VatSource {
    SourceSpec(String),
    BundleSpec(String),
    BundleName(String),
}

/// Launch-time description of a vat: code source, init parameters, options.
#[derive(Clone, Debug, PartialEq)]
pub struct VatConfig {
    pub source: VatSource,
    pub parameters: Option<Value>,
    pub creation_options: Option<Value>,
}

impl VatConfig {
    pub fn from_source_spec(spec: impl Into<String>) -> Self {
        VatConfig {
            source: VatSource::SourceSpec(spec.into()),
            parameters: None,
            creation_options: None,
        }
    }

    pub fn from_bundle_name(name: impl Into<String>) -> Self {
        VatConfig {
            source: VatSource::BundleName(name.into()),
            parameters: None,
            creation_options: None,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVatConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bundle_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bundle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creation_options: Option<Value>,
}

impl Serialize for VatConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut raw = RawVatConfig {
            parameters: self.parameters.clone(),
            creation_options: self.creation_options.clone(),
            ..RawVatConfig::default()
        };
        match &self.source {
            VatSource::SourceSpec(s) => raw.source_spec = Some(s.clone()),
            VatSource::BundleSpec(s) => raw.bundle_spec = Some(s.clone()),
            VatSource::BundleName(s) => raw.bundle_name = Some(s.clone()),
        }
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VatConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawVatConfig::deserialize(deserializer)?;
        let source = match (raw.source_spec, raw.bundle_spec, raw.bundle_name) {
            (Some(s), None, None) => VatSource::SourceSpec(s),
            (None, Some(s), None) => VatSource::BundleSpec(s),
            (None, None, Some(s)) => VatSource::BundleName(s),
            _ => return Err(serde::de::Error::custom(ConfigError::AmbiguousSource)),
        };
        Ok(VatConfig {
            source,
            parameters: raw.parameters,
            creation_options: raw.creation_options,
        })
    }
}
