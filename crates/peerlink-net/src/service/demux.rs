//! Inbound payload classification.

use serde_json::Value;

use super::config::FramingPolicy;

/// Where an inbound payload should go.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// A framed protocol packet; emitted whole, never service-tagged.
    Framed,
    /// The first byte is a registered service tag.
    Service(u8),
    /// A JSON envelope whose `serviceType` / `type` names a registered tag.
    Json {
        /// The resolved tag.
        tag: u8,
        /// The parsed payload.
        value: Value,
    },
    /// Nothing matched.
    Unrecognized,
}

/// Classify `data` against the framing policy and the registered tags.
///
/// Framed packets win over service tags, service tags over JSON envelopes.
pub fn classify(data: &[u8], framing: &FramingPolicy, is_registered: impl Fn(u8) -> bool) -> Route {
    if framing.is_framed(data) {
        return Route::Framed;
    }
    let Some(&first) = data.first() else {
        return Route::Unrecognized;
    };
    if is_registered(first) {
        return Route::Service(first);
    }
    match json_envelope(data) {
        Some((tag, value)) if is_registered(tag) => Route::Json { tag, value },
        _ => Route::Unrecognized,
    }
}

/// Parse `data` as a JSON object carrying a numeric service tag.
fn json_envelope(data: &[u8]) -> Option<(u8, Value)> {
    if !matches!(data.first(), Some(b'{')) {
        return None;
    }
    let value: Value = serde_json::from_slice(data).ok()?;
    let field = value.get("serviceType").or_else(|| value.get("type"))?;
    let tag = match field {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok())?,
        Value::String(s) => s.trim().parse::<u8>().ok()?,
        _ => return None,
    };
    Some((tag, value))
}
