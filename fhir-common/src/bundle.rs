//! The subset of the FHIR Bundle document model the relay needs to look at.
//!
//! Only the fields used for date filtering are modelled. Everything else in a bundle is
//! ignored on deserialization, and the payload is always forwarded as the original bytes.
use serde::Deserialize;

/// Resource type that has no inherent event date and always passes the date filter.
pub const PATIENT_RESOURCE_TYPE: &str = "Patient";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub resource_type: Option<String>,
    #[serde(rename = "entry", default)]
    pub entries: Vec<Entry>,
}

impl Bundle {
    /// Parse a bundle from a raw message payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub resource: Option<Resource>,
}

impl Entry {
    pub fn resource_type(&self) -> Option<&str> {
        self.resource.as_ref()?.resource_type.as_deref()
    }

    pub fn temporal_value(&self) -> Option<TemporalValue<'_>> {
        self.resource.as_ref()?.temporal_value()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_type: Option<String>,
    pub effective_date_time: Option<String>,
    pub performed_date_time: Option<String>,
    pub recorded_date: Option<String>,
    pub authored_on: Option<String>,
    pub effective_period: Option<Period>,
    pub period: Option<Period>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Period {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// The date-like value of a resource: either a single timestamp or a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalValue<'a> {
    DateTime(&'a str),
    Period(&'a Period),
}

type Extractor = for<'a> fn(&'a Resource) -> Option<TemporalValue<'a>>;

/// Temporal fields in priority order. The first one present on a resource wins.
const EXTRACTORS: [(&str, Extractor); 6] = [
    ("effectiveDateTime", effective_date_time),
    ("performedDateTime", performed_date_time),
    ("recordedDate", recorded_date),
    ("authoredOn", authored_on),
    ("effectivePeriod", effective_period),
    ("period", period),
];

fn effective_date_time(resource: &Resource) -> Option<TemporalValue<'_>> {
    resource
        .effective_date_time
        .as_deref()
        .map(TemporalValue::DateTime)
}

fn performed_date_time(resource: &Resource) -> Option<TemporalValue<'_>> {
    resource
        .performed_date_time
        .as_deref()
        .map(TemporalValue::DateTime)
}

fn recorded_date(resource: &Resource) -> Option<TemporalValue<'_>> {
    resource.recorded_date.as_deref().map(TemporalValue::DateTime)
}

fn authored_on(resource: &Resource) -> Option<TemporalValue<'_>> {
    resource.authored_on.as_deref().map(TemporalValue::DateTime)
}

fn effective_period(resource: &Resource) -> Option<TemporalValue<'_>> {
    resource.effective_period.as_ref().map(TemporalValue::Period)
}

fn period(resource: &Resource) -> Option<TemporalValue<'_>> {
    resource.period.as_ref().map(TemporalValue::Period)
}

impl Resource {
    /// Return the first present temporal field, following the extraction priority.
    pub fn temporal_value(&self) -> Option<TemporalValue<'_>> {
        self.temporal_field().map(|(_, value)| value)
    }

    /// Same as `temporal_value`, also returning the name of the field that was used.
    pub fn temporal_field(&self) -> Option<(&'static str, TemporalValue<'_>)> {
        EXTRACTORS
            .iter()
            .find_map(|(name, extract)| extract(self).map(|value| (*name, value)))
    }
}
