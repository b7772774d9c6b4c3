//! Classify command implementation.

use super::{check_format, CliError, CliResult};
use groupsync_engine::{classify, rule_for, Disposition, Headers, TransportConfig};
use serde::Serialize;

/// What the transport would do with a response.
#[derive(Debug, Serialize)]
pub struct ClassifyResult {
    /// Status code.
    pub status: u16,
    /// Base rule for the status.
    pub rule: String,
    /// Final disposition after headers.
    pub disposition: String,
}

fn parse_headers(raw: &[String]) -> CliResult<Headers> {
    let mut headers = Headers::new();
    for entry in raw {
        let (name, value) = entry
            .split_once(':')
            .ok_or_else(|| CliError::Usage(format!("header {entry:?} is not `Name: value`")))?;
        headers.insert(name.trim(), value.trim());
    }
    Ok(headers)
}

fn describe(disposition: &Disposition) -> String {
    match disposition {
        Disposition::Parse => "decode body and hand it to the command".to_string(),
        Disposition::Finish(outcome) => format!("finish: {outcome}"),
        Disposition::Redirect(url) => format!("resend to {url}"),
        Disposition::TempFail { backoff, reason } if backoff.is_zero() => {
            format!("retry now ({reason})")
        }
        Disposition::TempFail { backoff, reason } => {
            format!("retry after {}ms ({reason})", backoff.as_millis())
        }
        Disposition::Delay { delay, throttled } => format!(
            "wait {}s{}",
            delay.as_secs(),
            if *throttled { " (throttled)" } else { "" }
        ),
    }
}

/// Runs the classify command.
pub fn run(status: u16, raw_headers: &[String], format: &str) -> CliResult<()> {
    let json = check_format(format)?;
    let headers = parse_headers(raw_headers)?;
    let result = ClassifyResult {
        status,
        rule: rule_for(status).to_string(),
        disposition: describe(&classify(status, &headers, &TransportConfig::default())),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("HTTP {}: {}", result.status, result.rule);
        println!("  -> {}", result.disposition);
    }
    Ok(())
}
