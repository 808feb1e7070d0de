//! Domain resolution through a public DNS-over-HTTPS JSON endpoint.
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::DnsConfig;
use crate::error::{CheckError, CheckResult};

const RECORD_A: u16 = 1;
const RECORD_AAAA: u16 = 28;

/// Resolves a domain to the address strings that should be probed.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> CheckResult<Vec<String>>;
}

/// JSON body returned by `application/dns-json` resolvers.
#[derive(Deserialize, Debug, Default)]
pub struct DohResponse {
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DohAnswer>,
}

#[derive(Deserialize, Debug)]
pub struct DohAnswer {
    #[serde(rename = "type")]
    pub record_type: u16,
    pub data: String,
}

/// Resolver that fans out A and AAAA queries concurrently.
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    config: DnsConfig,
}

impl DohResolver {
    pub fn new(config: DnsConfig) -> CheckResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CheckError::Resolution(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn query(&self, domain: &str, record_type: &str) -> CheckResult<DohResponse> {
        self.client
            .get(&self.config.doh_endpoint)
            .query(&[("name", domain), ("type", record_type)])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| CheckError::Resolution(format!("{record_type} query failed: {e}")))?
            .json::<DohResponse>()
            .await
            .map_err(|e| CheckError::Resolution(format!("{record_type} answer unreadable: {e}")))
    }
}

#[async_trait]
impl Resolver for DohResolver {
    async fn resolve(&self, domain: &str) -> CheckResult<Vec<String>> {
        let name = strip_port(domain.trim());
        if name.is_empty() {
            return Err(CheckError::Validation("Missing domain parameter".into()));
        }

        let (v4, v6) = tokio::join!(self.query(name, "A"), self.query(name, "AAAA"));
        let (v4, v6) = match (v4, v6) {
            (Ok(v4), Ok(v6)) => (v4, v6),
            (Err(e), _) | (_, Err(e)) => {
                warn!(domain = name, error = %e, "DoH lookup failed");
                return Err(e);
            }
        };

        let ips = merge_answers(&v4, &v6)?;
        debug!(domain = name, count = ips.len(), "domain resolved");
        Ok(ips)
    }
}

/// Drop a trailing `:port` from a domain.
pub fn strip_port(domain: &str) -> &str {
    match domain.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => domain,
    }
}

/// A answers verbatim, then AAAA answers wrapped in brackets.
pub fn merge_answers(v4: &DohResponse, v6: &DohResponse) -> CheckResult<Vec<String>> {
    let ips: Vec<String> = v4
        .answer
        .iter()
        .filter(|a| a.record_type == RECORD_A)
        .map(|a| a.data.clone())
        .chain(
            v6.answer
                .iter()
                .filter(|a| a.record_type == RECORD_AAAA)
                .map(|a| format!("[{}]", a.data)),
        )
        .collect();

    if ips.is_empty() {
        return Err(CheckError::Resolution("No A or AAAA records found".into()));
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doh(json: &str) -> DohResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:8443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("2606:4700::1"), "2606:4700::1");
    }

    #[test]
    fn merge_keeps_order_and_brackets_v6() {
        let v4 = doh(
            r#"{"Status":0,"Answer":[
                {"name":"x.example","type":5,"TTL":60,"data":"edge.example."},
                {"name":"edge.example","type":1,"TTL":60,"data":"104.16.1.1"},
                {"name":"edge.example","type":1,"TTL":60,"data":"104.16.1.2"}]}"#,
        );
        let v6 = doh(r#"{"Status":0,"Answer":[{"name":"x","type":28,"TTL":60,"data":"2606:4700::1"}]}"#);
        let ips = merge_answers(&v4, &v6).unwrap();
        assert_eq!(ips, vec!["104.16.1.1", "104.16.1.2", "[2606:4700::1]"]);
    }

    #[test]
    fn ipv6_only_domain_yields_only_bracketed() {
        let v4 = doh(r#"{"Status":0}"#);
        let v6 = doh(
            r#"{"Status":0,"Answer":[
                {"name":"v6","type":28,"TTL":1,"data":"2001:db8::1"},
                {"name":"v6","type":28,"TTL":1,"data":"2001:db8::2"}]}"#,
        );
        let ips = merge_answers(&v4, &v6).unwrap();
        assert_eq!(ips, vec!["[2001:db8::1]", "[2001:db8::2]"]);
        assert!(ips.iter().all(|ip| ip.starts_with('[') && ip.ends_with(']')));
    }

    #[test]
    fn no_answers_is_resolution_error() {
        let err = merge_answers(&DohResponse::default(), &doh(r#"{"Status":3}"#)).unwrap_err();
        assert!(matches!(err, CheckError::Resolution(_)));
    }

    #[tokio::test]
    async fn transport_failure_is_resolution_error() {
        let resolver = DohResolver::new(DnsConfig {
            doh_endpoint: "http://127.0.0.1:9/dns-query".into(),
            timeout: std::time::Duration::from_secs(2),
        })
        .unwrap();
        let err = resolver.resolve("example.com").await.unwrap_err();
        assert!(matches!(err, CheckError::Resolution(_)), "{err:?}");
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn resolves_real_domain() {
        let resolver = DohResolver::new(DnsConfig::default()).unwrap();
        let ips = resolver.resolve("one.one.one.one").await.unwrap();
        assert!(ips.iter().any(|ip| ip == "1.1.1.1"));
    }
}
