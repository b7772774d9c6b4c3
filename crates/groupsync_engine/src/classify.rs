//! HTTP status classification.
//!
//! The mapping from status code to what the transport does next is a fixed
//! table ([`rule_for`]) refined by response headers ([`classify`]).

use crate::command::Outcome;
use crate::config::TransportConfig;
use crate::transport::Headers;
use std::fmt;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Server-directed delay, in seconds.
pub const RETRY_AFTER: &str = "Retry-After";
/// Present on 403/500/302 from a real protocol server.
pub const X_MS_RP: &str = "X-MS-RP";
/// New endpoint on a 451.
pub const X_MS_LOCATION: &str = "X-MS-Location";
/// Present on a 503 when the account is being throttled.
pub const X_MS_ASTHROTTLE: &str = "X-MS-ASThrottle";
/// Days until the password expires.
pub const X_MS_CREDENTIALS_EXPIRE: &str = "X-MS-Credentials-Expire";

/// Base handling of a status code before headers are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRule {
    /// Decode and hand the body to the command.
    Parse,
    /// Permanent failure.
    HardFail,
    /// Credentials rejected.
    AuthFail,
    /// Resync with `X-MS-RP`, rediscover without.
    ResyncOrRediscover,
    /// Device policy required.
    ReProvision,
    /// The mailbox moved; see `X-MS-Location`.
    Relocate,
    /// Temporary gateway failure; retry at once.
    BadGateway,
    /// Server busy; wait as directed.
    ServiceUnavailable,
    /// Server mailbox is full.
    OutOfSpace,
    /// Not a code this client knows.
    Unknown,
}

impl fmt::Display for StatusRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusRule::Parse => "parse",
            StatusRule::HardFail => "hard-fail",
            StatusRule::AuthFail => "auth-fail",
            StatusRule::ResyncOrRediscover => "resync-or-rediscover",
            StatusRule::ReProvision => "re-provision",
            StatusRule::Relocate => "relocate",
            StatusRule::BadGateway => "bad-gateway",
            StatusRule::ServiceUnavailable => "service-unavailable",
            StatusRule::OutOfSpace => "out-of-space",
            StatusRule::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

const STATUS_TABLE: &[(u16, u16, StatusRule)] = &[
    (200, 299, StatusRule::Parse),
    (302, 302, StatusRule::ResyncOrRediscover),
    (400, 400, StatusRule::HardFail),
    (401, 401, StatusRule::AuthFail),
    (403, 403, StatusRule::ResyncOrRediscover),
    (404, 404, StatusRule::HardFail),
    (449, 449, StatusRule::ReProvision),
    (451, 451, StatusRule::Relocate),
    (500, 500, StatusRule::ResyncOrRediscover),
    (502, 502, StatusRule::BadGateway),
    (503, 503, StatusRule::ServiceUnavailable),
    (507, 507, StatusRule::OutOfSpace),
];

/// Looks up the base rule for a status code.
pub fn rule_for(status: u16) -> StatusRule {
    STATUS_TABLE
        .iter()
        .find(|(lo, hi, _)| (*lo..=*hi).contains(&status))
        .map(|(_, _, rule)| *rule)
        .unwrap_or(StatusRule::Unknown)
}

/// What the transport does with a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Decode the body and let the command process it.
    Parse,
    /// End the round trip with this outcome.
    Finish(Outcome),
    /// Resend to a new endpoint right away; no retry budget is used.
    Redirect(Url),
    /// Retry after `backoff`, using one unit of retry budget.
    TempFail {
        /// Wait before the next attempt; zero retries at once.
        backoff: Duration,
        /// Diagnostic.
        reason: String,
    },
    /// Wait as the server asked; no retry budget is used.
    Delay {
        /// How long to wait.
        delay: Duration,
        /// The server said the account is throttled.
        throttled: bool,
    },
}

/// Classifies a response status with its headers.
pub fn classify(status: u16, headers: &Headers, config: &TransportConfig) -> Disposition {
    match rule_for(status) {
        StatusRule::Parse => Disposition::Parse,
        StatusRule::HardFail => Disposition::Finish(Outcome::HardFail(format!("HTTP {status}"))),
        StatusRule::AuthFail => Disposition::Finish(Outcome::AuthFail(format!("HTTP {status}"))),
        StatusRule::ResyncOrRediscover => {
            if headers.contains(X_MS_RP) {
                Disposition::Finish(Outcome::Resync(format!("HTTP {status} with {X_MS_RP}")))
            } else {
                Disposition::Finish(Outcome::Rediscover(format!("HTTP {status}")))
            }
        }
        StatusRule::ReProvision => Disposition::Finish(Outcome::ReProvision),
        StatusRule::Relocate => match headers.get(X_MS_LOCATION) {
            Some(location) => match Url::parse(location.trim()) {
                Ok(url) if url.scheme() == "https" => Disposition::Redirect(url),
                Ok(_) => Disposition::Finish(Outcome::Rediscover(format!(
                    "HTTP 451 to insecure location {location}"
                ))),
                Err(_) => Disposition::Finish(Outcome::Rediscover(format!(
                    "HTTP 451 to unparseable location {location}"
                ))),
            },
            None => Disposition::TempFail {
                backoff: config.temp_fail_backoff,
                reason: format!("HTTP 451 without {X_MS_LOCATION}"),
            },
        },
        StatusRule::BadGateway => Disposition::TempFail {
            backoff: Duration::ZERO,
            reason: "HTTP 502".to_string(),
        },
        StatusRule::ServiceUnavailable => service_unavailable(headers, config),
        StatusRule::OutOfSpace => Disposition::Finish(Outcome::OutOfSpace),
        StatusRule::Unknown => {
            warn!(status, "unknown HTTP status");
            Disposition::Finish(Outcome::HardFail(format!("unknown HTTP status {status}")))
        }
    }
}

fn service_unavailable(headers: &Headers, config: &TransportConfig) -> Disposition {
    let throttled = headers.contains(X_MS_ASTHROTTLE);
    let fallback = if throttled {
        config.throttle_delay
    } else {
        config.default_delay
    };
    let Some(value) = headers.get(RETRY_AFTER) else {
        return Disposition::Delay {
            delay: fallback,
            throttled,
        };
    };
    match value.trim().parse::<u64>() {
        Ok(secs) => {
            let delay = Duration::from_secs(secs);
            if delay > config.max_delay {
                Disposition::TempFail {
                    backoff: config.temp_fail_backoff,
                    reason: format!("{RETRY_AFTER} {secs}s exceeds the longest honoured delay"),
                }
            } else {
                Disposition::Delay { delay, throttled }
            }
        }
        Err(_) => {
            warn!(value, "unparseable {RETRY_AFTER}");
            Disposition::Delay {
                delay: fallback,
                throttled,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TransportConfig {
        TransportConfig::default()
    }

    fn plain(status: u16) -> Disposition {
        classify(status, &Headers::new(), &cfg())
    }

    #[test]
    fn base_table() {
        assert_eq!(rule_for(200), StatusRule::Parse);
        assert_eq!(rule_for(204), StatusRule::Parse);
        assert_eq!(rule_for(401), StatusRule::AuthFail);
        assert_eq!(rule_for(449), StatusRule::ReProvision);
        assert_eq!(rule_for(501), StatusRule::Unknown);
        assert_eq!(rule_for(8035), StatusRule::Unknown);
        assert_eq!(StatusRule::ResyncOrRediscover.to_string(), "resync-or-rediscover");
    }

    #[test]
    fn final_codes() {
        assert_eq!(plain(200), Disposition::Parse);
        assert!(matches!(plain(400), Disposition::Finish(Outcome::HardFail(_))));
        assert!(matches!(plain(404), Disposition::Finish(Outcome::HardFail(_))));
        assert!(matches!(plain(401), Disposition::Finish(Outcome::AuthFail(_))));
        assert_eq!(plain(449), Disposition::Finish(Outcome::ReProvision));
        assert_eq!(plain(507), Disposition::Finish(Outcome::OutOfSpace));
        assert!(matches!(plain(418), Disposition::Finish(Outcome::HardFail(_))));
    }

    #[test]
    fn rp_header_selects_resync() {
        for status in [302, 403, 500] {
            assert!(matches!(plain(status), Disposition::Finish(Outcome::Rediscover(_))));
            let headers = Headers::new().with(X_MS_RP, "2.5,12.0,12.1");
            assert!(matches!(
                classify(status, &headers, &cfg()),
                Disposition::Finish(Outcome::Resync(_))
            ));
        }
    }

    #[test]
    fn relocation() {
        let secure = Headers::new().with(X_MS_LOCATION, "https://new.example.com/eas");
        assert_eq!(
            classify(451, &secure, &cfg()),
            Disposition::Redirect(Url::parse("https://new.example.com/eas").unwrap())
        );

        let insecure = Headers::new().with(X_MS_LOCATION, "http://new.example.com/eas");
        assert!(matches!(
            classify(451, &insecure, &cfg()),
            Disposition::Finish(Outcome::Rediscover(_))
        ));

        let garbage = Headers::new().with(X_MS_LOCATION, "::not a url");
        assert!(matches!(
            classify(451, &garbage, &cfg()),
            Disposition::Finish(Outcome::Rediscover(_))
        ));

        assert_eq!(
            plain(451),
            Disposition::TempFail {
                backoff: cfg().temp_fail_backoff,
                reason: "HTTP 451 without X-MS-Location".into()
            }
        );
    }

    #[test]
    fn bad_gateway_retries_at_once() {
        assert!(matches!(
            plain(502),
            Disposition::TempFail { backoff, .. } if backoff == Duration::ZERO
        ));
    }

    #[test]
    fn service_unavailable_delays() {
        assert_eq!(
            plain(503),
            Disposition::Delay {
                delay: Duration::from_secs(5),
                throttled: false
            }
        );

        let retry_after = Headers::new().with(RETRY_AFTER, "7");
        assert_eq!(
            classify(503, &retry_after, &cfg()),
            Disposition::Delay {
                delay: Duration::from_secs(7),
                throttled: false
            }
        );

        let throttled = Headers::new().with(X_MS_ASTHROTTLE, "CommandFrequency");
        assert_eq!(
            classify(503, &throttled, &cfg()),
            Disposition::Delay {
                delay: Duration::from_secs(60),
                throttled: true
            }
        );

        let junk = Headers::new().with(RETRY_AFTER, "soon");
        assert_eq!(
            classify(503, &junk, &cfg()),
            Disposition::Delay {
                delay: Duration::from_secs(5),
                throttled: false
            }
        );
    }

    #[test]
    fn overlong_retry_after_is_a_temp_failure() {
        let long = Headers::new().with(RETRY_AFTER, "3600");
        assert!(matches!(
            classify(503, &long, &cfg()),
            Disposition::TempFail { .. }
        ));
    }
}
