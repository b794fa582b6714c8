//! Building the JSON documents shipped for each log line.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::moby::chunk::Stream;
use crate::sampler::SampleMetadata;

pub type Event = Map<String, Value>;

/// Merges `src` into `dest`. Nested objects are merged key by key;
/// everything else in `src` replaces what `dest` had.
pub fn deep_merge(dest: &mut Event, src: Event) {
    for (key, value) in src {
        match value {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = dest.get_mut(&key) {
                    deep_merge(existing, incoming);
                } else {
                    dest.insert(key, Value::Object(incoming));
                }
            }
            value => {
                dest.insert(key, value);
            }
        }
    }
}

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

/// Parses the RFC 3339 stamp the runtime prefixes to every line, falling
/// back to the current time.
pub fn parse_log_time(stamp: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(stamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Content hash the collector uses to deduplicate re-sent events.
pub fn fingerprint(event: &Event) -> String {
    // serde_json maps are key-ordered, so equal events serialize identically.
    let body = serde_json::to_vec(event).unwrap_or_default();
    let digest = xxhash_rust::xxh3::xxh3_128(&body);
    STANDARD_NO_PAD.encode(digest.to_be_bytes())
}

/// Turns a dotted label suffix into nested objects: `a.b.c` with `v`
/// becomes `{"a": {"b": {"c": "v"}}}`.
pub fn hashify_tag(path: &str, value: &str) -> Event {
    let mut value = Value::String(value.to_string());
    for part in path.rsplit('.') {
        let mut level = Map::new();
        level.insert(part.to_string(), value);
        value = Value::Object(level);
    }
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub struct LogLine<'a> {
    pub message: String,
    pub stream: Stream,
    pub time: DateTime<Utc>,
    pub syslog: Option<Event>,
    pub sampling: Option<&'a SampleMetadata>,
}

/// Assembles the full event: base fields, then syslog fields, then sampling
/// metadata, then container tags, each layer overriding the last.
pub fn assemble(line: LogLine<'_>, tags: &Event) -> Event {
    let mut event = Event::new();
    event.insert("message".to_string(), Value::String(line.message));
    event.insert("labels".to_string(), json!({ "stream": line.stream.as_ref() }));

    if let Some(syslog) = line.syslog {
        deep_merge(&mut event, syslog);
    }
    if let Some(meta) = line.sampling {
        event.insert("sample_key".to_string(), json!(meta.sample_key));
        event.insert("sample_ratio".to_string(), json!(meta.sample_ratio));
    }
    deep_merge(&mut event, tags.clone());

    let line_time = format_timestamp(line.time);
    if event.contains_key("@timestamp") {
        let mut created = Event::new();
        created.insert("event".to_string(), json!({ "created": line_time }));
        deep_merge(&mut event, created);
    } else {
        event.insert("@timestamp".to_string(), Value::String(line_time));
    }

    let document_id = fingerprint(&event);
    event.insert(
        "@metadata".to_string(),
        json!({ "document_id": document_id, "event_type": "moby" }),
    );
    event
}
