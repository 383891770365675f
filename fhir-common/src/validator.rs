//! Success criteria for responses returned by a FHIR server.
//!
//! A batch or transaction is posted as a single request, but the server reports the
//! outcome of each entry separately inside the response bundle. A 200 OK can therefore
//! still carry rejected entries, and both levels have to be checked.
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseValidator;

impl ResponseValidator {
    /// Combine the transport status with the status of every entry in the response body.
    ///
    /// The body is optional: when it is absent, or is not a bundle, the transport status
    /// alone decides. Once the body is a bundle, every entry must carry a string
    /// `response.status` with a 2xx code.
    pub fn is_success(&self, status: u16, body: Option<&[u8]>) -> bool {
        if !is_success_status(status) {
            return false;
        }

        let Some(bundle) = body.and_then(parse_response_bundle) else {
            return true;
        };

        match bundle.get("entry") {
            None | Some(Value::Null) => true,
            Some(Value::Array(entries)) => entries.iter().all(|entry| {
                entry
                    .pointer("/response/status")
                    .and_then(Value::as_str)
                    .and_then(entry_status)
                    .is_some_and(is_success_status)
            }),
            Some(_) => false,
        }
    }
}

fn parse_response_bundle(body: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .filter(|value| value.get("resourceType").and_then(Value::as_str) == Some("Bundle"))
}

/// Parse the HTTP status code out of an entry status such as `"201 Created"`.
pub fn entry_status(status: &str) -> Option<u16> {
    status.get(..3)?.parse().ok()
}

fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}
