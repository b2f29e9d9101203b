//! Best-effort extraction of RFC3164-style syslog fields from log lines.
//!
//! Containers that run a syslog-speaking daemon (postfix, cron and friends)
//! emit lines like `<134>May  1 12:34:56 host1 prog[42]: hello`. When a
//! container is labeled for syslog parsing, the priority, timestamp, host,
//! program and pid are lifted into a `syslog` object on the event and the
//! message is reduced to the remaining content. Anything that does not look
//! like syslog passes through untouched.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};

static ENVELOPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<(?P<pri>\d+)>(?P<timestamp>\w{3} [ 0-9]{2} [0-9:]{8}) (?P<content>.*)$")
        .unwrap()
});

// Content shapes, tried in order: "host program[pid]: message",
// "host message", "program[pid]: message", bare message.
static HOST_PROGRAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<host>[a-zA-Z0-9._-]*[^:]) (?P<program>\S+?)(\[(?P<pid>\d+)\])?: (?P<message>.*)$").unwrap()
});
static HOST_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<host>[a-zA-Z0-9._-]+) (?P<message>\S+[^:] .*)$").unwrap());
static PROGRAM_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<program>\S+?)(\[(?P<pid>\d+)\])?: (?P<message>.*)$").unwrap()
});

const SEVERITIES: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

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

/// Parse a message. Returns the (possibly reduced) message and the fields to
/// merge into the event; a non-syslog message comes back unchanged with no
/// fields.
pub fn parse(message: &str) -> (String, Map<String, Value>) {
    let Some(envelope) = ENVELOPE.captures(message) else {
        return (message.to_string(), Map::new());
    };

    // The envelope regex constrains pri to digits; it can still overflow or
    // exceed the facility table, in which case the line is not syslog.
    let Ok(pri) = envelope["pri"].parse::<u32>() else {
        return (message.to_string(), Map::new());
    };
    let severity = (pri % 8) as usize;
    let facility = (pri / 8) as usize;
    if facility >= FACILITIES.len() {
        return (message.to_string(), Map::new());
    }

    let content = &envelope["content"];
    let (host, program, pid, message) = split_content(content);

    let mut fields = Map::new();
    fields.insert("timestamp".into(), json!(envelope["timestamp"]));
    fields.insert("severity_id".into(), json!(severity));
    fields.insert("severity_name".into(), json!(SEVERITIES[severity]));
    fields.insert("facility_id".into(), json!(facility));
    fields.insert("facility_name".into(), json!(FACILITIES[facility]));
    if let Some(host) = host {
        fields.insert("hostname".into(), json!(host));
    }
    if let Some(program) = program {
        fields.insert("program".into(), json!(program));
    }
    if let Some(pid) = pid {
        fields.insert("pid".into(), json!(pid));
    }

    let mut syslog = Map::new();
    syslog.insert("syslog".into(), Value::Object(fields));
    (message, syslog)
}

fn split_content(content: &str) -> (Option<String>, Option<String>, Option<u64>, String) {
    if let Some(c) = HOST_PROGRAM.captures(content) {
        return (
            Some(c["host"].to_string()),
            Some(c["program"].to_string()),
            c.name("pid").and_then(|p| p.as_str().parse().ok()),
            c["message"].to_string(),
        );
    }
    if let Some(c) = HOST_ONLY.captures(content) {
        return (Some(c["host"].to_string()), None, None, c["message"].to_string());
    }
    if let Some(c) = PROGRAM_ONLY.captures(content) {
        return (
            None,
            Some(c["program"].to_string()),
            c.name("pid").and_then(|p| p.as_str().parse().ok()),
            c["message"].to_string(),
        );
    }
    (None, None, None, content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syslog_fields(message: &str) -> Map<String, Value> {
        let (_, fields) = parse(message);
        match fields.get("syslog") {
            Some(Value::Object(map)) => map.clone(),
            _ => panic!("no syslog fields extracted from {message:?}"),
        }
    }

    #[test]
    fn full_line_with_host_program_and_pid() {
        let (message, _) = parse("<134>May  1 12:34:56 host1 prog[42]: hello");
        assert_eq!(message, "hello");

        let fields = syslog_fields("<134>May  1 12:34:56 host1 prog[42]: hello");
        assert_eq!(fields["severity_id"], json!(6));
        assert_eq!(fields["severity_name"], json!("info"));
        assert_eq!(fields["facility_id"], json!(16));
        assert_eq!(fields["facility_name"], json!("local0"));
        assert_eq!(fields["hostname"], json!("host1"));
        assert_eq!(fields["program"], json!("prog"));
        assert_eq!(fields["pid"], json!(42));
        assert_eq!(fields["timestamp"], json!("May  1 12:34:56"));
    }

    #[test]
    fn program_without_pid() {
        let fields = syslog_fields("<13>Jun 10 01:02:03 web01 sshd: accepted");
        assert_eq!(fields["hostname"], json!("web01"));
        assert_eq!(fields["program"], json!("sshd"));
        assert!(!fields.contains_key("pid"));
    }

    #[test]
    fn host_without_program() {
        let (message, fields) = parse("<13>Jun 10 01:02:03 web01 something happened here");
        assert_eq!(message, "something happened here");
        let syslog = fields["syslog"].as_object().unwrap();
        assert_eq!(syslog["hostname"], json!("web01"));
        assert!(!syslog.contains_key("program"));
    }

    #[test]
    fn program_without_host() {
        let (message, fields) = parse("<13>Jun 10 01:02:03 cron[7]: job done");
        assert_eq!(message, "job done");
        let syslog = fields["syslog"].as_object().unwrap();
        assert!(!syslog.contains_key("hostname"));
        assert_eq!(syslog["program"], json!("cron"));
        assert_eq!(syslog["pid"], json!(7));
    }

    #[test]
    fn severity_and_facility_decomposition() {
        // 0 = kern.emerg, 191 = local7.debug
        let fields = syslog_fields("<0>May  1 12:34:56 x");
        assert_eq!(fields["severity_name"], json!("emerg"));
        assert_eq!(fields["facility_name"], json!("kern"));

        let fields = syslog_fields("<191>May  1 12:34:56 x");
        assert_eq!(fields["severity_name"], json!("debug"));
        assert_eq!(fields["facility_name"], json!("local7"));
    }

    #[test]
    fn out_of_range_priority_is_not_syslog() {
        let (message, fields) = parse("<999>May  1 12:34:56 host1 prog: hi");
        assert_eq!(message, "<999>May  1 12:34:56 host1 prog: hi");
        assert!(fields.is_empty());
    }

    #[test]
    fn plain_message_passes_through() {
        let (message, fields) = parse("just an ordinary line");
        assert_eq!(message, "just an ordinary line");
        assert!(fields.is_empty());
    }

    #[test]
    fn single_digit_day_with_leading_space() {
        let fields = syslog_fields("<34>Oct  7 22:14:15 mymachine su: 'su root' failed");
        assert_eq!(fields["timestamp"], json!("Oct  7 22:14:15"));
        assert_eq!(fields["hostname"], json!("mymachine"));
        assert_eq!(fields["program"], json!("su"));
    }
}
