//! Splits BSD-style syslog lines (`<PRI>Mmm dd hh:mm:ss REST`) into the
//! inner message and structured fields.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::json;

use super::event::{Event, deep_merge};

const FACILITIES: [&str; 24] = [
    "kern",
    "user",
    "mail",
    "daemon",
    "auth",
    "syslog",
    "lpr",
    "news",
    "uucp",
    "cron",
    "authpriv",
    "ftp",
    "reserved12",
    "reserved13",
    "reserved14",
    "reserved15",
    "local0",
    "local1",
    "local2",
    "local3",
    "local4",
    "local5",
    "local6",
    "local7",
];

const SEVERITIES: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

static SYSLOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<(\d+)>(\w{3} [ 0-9]{2} [0-9:]{8}) (.*)$").expect("valid syslog regex")
});

// hostname, then program with optional pid
static HOST_PROGRAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9._-]*[^:]) (\S+?)(\[(\d+)\])?: (.*)$").expect("valid syslog regex")
});

// hostname, no program
static HOST_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9._-]+) (\S+[^:] .*)$").expect("valid syslog regex")
});

// program, no hostname
static PROGRAM_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+?)(\[(\d+)\])?: (.*)$").expect("valid syslog regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct SyslogMessage {
    pub original: String,
    pub timestamp: DateTime<Utc>,
    pub severity: u32,
    pub facility: u32,
    pub hostname: Option<String>,
    pub program: Option<String>,
    pub pid: Option<u64>,
    pub message: String,
}

impl SyslogMessage {
    /// `None` when `line` does not look like syslog at all.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = SYSLOG_LINE.captures(line)?;
        let pri: u32 = caps[1].parse().ok()?;
        let timestamp = parse_timestamp(&caps[2]);
        let content = &caps[3];

        let owned = |m: Option<regex::Match<'_>>| m.map(|m| m.as_str().to_string());

        let (hostname, program, pid, message) = if let Some(c) = HOST_PROGRAM.captures(content) {
            (owned(c.get(1)), owned(c.get(2)), owned(c.get(4)), owned(c.get(5)))
        } else if let Some(c) = HOST_ONLY.captures(content) {
            (owned(c.get(1)), None, None, owned(c.get(2)))
        } else if let Some(c) = PROGRAM_ONLY.captures(content) {
            (None, owned(c.get(1)), owned(c.get(3)), owned(c.get(4)))
        } else {
            (None, None, None, Some(content.to_string()))
        };

        Some(Self {
            original: line.to_string(),
            timestamp,
            severity: pri % 8,
            facility: pri / 8,
            hostname,
            program,
            pid: pid.and_then(|p| p.parse().ok()),
            message: message.unwrap_or_default(),
        })
    }

    pub fn severity_name(&self) -> Option<&'static str> {
        SEVERITIES.get(self.severity as usize).copied()
    }

    pub fn facility_name(&self) -> Option<&'static str> {
        FACILITIES.get(self.facility as usize).copied()
    }

    /// The event fields this message contributes.
    pub fn fields(&self) -> Event {
        let mut severity = json!({ "code": self.severity });
        if let Some(name) = self.severity_name() {
            severity["name"] = json!(name);
        }
        let mut facility = json!({ "code": self.facility });
        if let Some(name) = self.facility_name() {
            facility["name"] = json!(name);
        }

        let mut fields = Event::new();
        fields.insert(
            "@timestamp".to_string(),
            json!(self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        );
        fields.insert(
            "log".to_string(),
            json!({
                "original": self.original,
                "syslog": {
                    "severity": severity,
                    "facility": facility,
                },
            }),
        );

        if let Some(hostname) = &self.hostname {
            deep_merge(&mut fields, object(json!({ "host": { "hostname": hostname } })));
        }
        if let Some(program) = &self.program {
            deep_merge(&mut fields, object(json!({ "process": { "name": program } })));
        }
        if let Some(pid) = self.pid {
            deep_merge(&mut fields, object(json!({ "process": { "pid": pid } })));
        }

        fields
    }
}

fn object(value: serde_json::Value) -> Event {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Event::new(),
    }
}

/// Syslog timestamps carry no year or zone. Assume the current year, UTC.
/// Unparseable or unsynchronised (`*`-prefixed) stamps become "now".
fn parse_timestamp(stamp: &str) -> DateTime<Utc> {
    let now = Utc::now();
    if stamp.starts_with('*') {
        return now;
    }
    let normalised = stamp.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(
        &format!("{} {}", now.year(), normalised),
        "%Y %b %d %H:%M:%S",
    )
    .map(|t| t.and_utc())
    .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_full_header() {
        let line = "<30>Feb 13 23:31:30 web-1 nginx[1234]: GET / 200";
        let msg = SyslogMessage::parse(line).unwrap();
        assert_eq!(msg.severity, 6);
        assert_eq!(msg.facility, 3);
        assert_eq!(msg.severity_name(), Some("info"));
        assert_eq!(msg.facility_name(), Some("daemon"));
        assert_eq!(msg.hostname.as_deref(), Some("web-1"));
        assert_eq!(msg.program.as_deref(), Some("nginx"));
        assert_eq!(msg.pid, Some(1234));
        assert_eq!(msg.message, "GET / 200");
        assert_eq!(msg.timestamp.hour(), 23);
        assert_eq!(msg.timestamp.day(), 13);
    }

    #[test]
    fn test_host_and_program_without_pid() {
        let msg = SyslogMessage::parse("<13>Jan  2 03:04:05 box cron: ran job").unwrap();
        assert_eq!(msg.hostname.as_deref(), Some("box"));
        assert_eq!(msg.program.as_deref(), Some("cron"));
        assert_eq!(msg.pid, None);
        assert_eq!(msg.message, "ran job");
        assert_eq!(msg.timestamp.day(), 2);
    }

    #[test]
    fn test_host_without_program() {
        let msg = SyslogMessage::parse("<13>Jan  2 03:04:05 box something happened").unwrap();
        assert_eq!(msg.hostname.as_deref(), Some("box"));
        assert_eq!(msg.program, None);
        assert_eq!(msg.message, "something happened");
    }

    #[test]
    fn test_program_without_host() {
        let msg = SyslogMessage::parse("<13>Jan  2 03:04:05 sshd[77]: accepted").unwrap();
        assert_eq!(msg.hostname, None);
        assert_eq!(msg.program.as_deref(), Some("sshd"));
        assert_eq!(msg.pid, Some(77));
        assert_eq!(msg.message, "accepted");
    }

    #[test]
    fn test_unrecognised_content_is_kept_whole() {
        let msg = SyslogMessage::parse("<13>Jan  2 03:04:05 lonely").unwrap();
        assert_eq!(msg.hostname, None);
        assert_eq!(msg.program, None);
        assert_eq!(msg.message, "lonely");
    }

    #[test]
    fn test_not_syslog() {
        assert_eq!(SyslogMessage::parse("plain old log line"), None);
        assert_eq!(SyslogMessage::parse("<13> missing timestamp"), None);
    }

    #[test]
    fn test_fields() {
        let line = "<30>Feb 13 23:31:30 web-1 nginx[1234]: GET / 200";
        let fields = SyslogMessage::parse(line).unwrap().fields();
        let value = serde_json::Value::Object(fields);
        assert_eq!(value["log"]["original"], line);
        assert_eq!(value["log"]["syslog"]["severity"]["code"], 6);
        assert_eq!(value["log"]["syslog"]["severity"]["name"], "info");
        assert_eq!(value["log"]["syslog"]["facility"]["name"], "daemon");
        assert_eq!(value["host"]["hostname"], "web-1");
        assert_eq!(value["process"]["name"], "nginx");
        assert_eq!(value["process"]["pid"], 1234);
        let ts = value["@timestamp"].as_str().unwrap();
        assert!(ts.ends_with("-02-13T23:31:30.000Z"), "{ts}");
    }

    #[test]
    fn test_out_of_range_facility_has_no_name() {
        let msg = SyslogMessage::parse("<200>Feb 13 23:31:30 x").unwrap();
        assert_eq!(msg.facility, 25);
        assert_eq!(msg.facility_name(), None);
        let value = serde_json::Value::Object(msg.fields());
        assert_eq!(value["log"]["syslog"]["facility"]["code"], 25);
        assert!(value["log"]["syslog"]["facility"].get("name").is_none());
    }

    #[test]
    fn test_unsynchronised_timestamp_is_now() {
        let before = Utc::now();
        let t = parse_timestamp("*Feb 13 23:31:30");
        assert!(t >= before);
    }
}
