//! Geo-IP annotation of probe hits via ip-api.com.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::GeoConfig;
use crate::error::{CheckError, CheckResult};

const FIELDS: &str = "status,message,query,country,countryCode,regionName,city,isp,as";

/// Geolocation record as returned by ip-api.com.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeoInfo {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_name: Option<String>,
}

impl GeoInfo {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: &str) -> CheckResult<GeoInfo>;

    /// Country code for `ip`, or `None` on any failure.
    async fn country_code(&self, ip: &str) -> Option<String> {
        match self.lookup(ip).await {
            Ok(info) if info.is_success() => info.country_code,
            Ok(_) => None,
            Err(e) => {
                warn!(ip, error = %e, "geo lookup failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IpApiGeo {
    client: reqwest::Client,
    endpoint: String,
}

impl IpApiGeo {
    pub fn new(config: &GeoConfig) -> CheckResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CheckError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiGeo {
    async fn lookup(&self, ip: &str) -> CheckResult<GeoInfo> {
        let ip = strip_brackets(ip);
        if ip.is_empty() {
            return Err(CheckError::Validation("IP parameter not provided".into()));
        }
        let url = format!("{}/{ip}", self.endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[("fields", FIELDS), ("lang", "en")])
            .send()
            .await
            .map_err(|e| CheckError::Upstream(format!("IP Info Fetch Error: {e}")))?;
        if !response.status().is_success() {
            return Err(CheckError::Upstream(format!(
                "IP Info Fetch Error: HTTP error: {}",
                response.status().as_u16()
            )));
        }
        response
            .json::<GeoInfo>()
            .await
            .map_err(|e| CheckError::Upstream(format!("IP Info Fetch Error: {e}")))
    }
}

/// `[2001:db8::1]` → `2001:db8::1`; also drops a `:port` from IPv4 forms.
pub fn strip_brackets(ip: &str) -> &str {
    let ip = ip.trim();
    if let Some(rest) = ip.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match ip.split_once(':') {
        Some((host, _)) if host.contains('.') => host,
        _ => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_brackets_forms() {
        assert_eq!(strip_brackets("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_brackets("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_brackets("1.2.3.4:443"), "1.2.3.4");
        assert_eq!(strip_brackets("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn parses_ip_api_payload() {
        let info: GeoInfo = serde_json::from_str(
            r#"{"status":"success","query":"1.1.1.1","country":"Australia","countryCode":"AU",
                "regionName":"Queensland","city":"South Brisbane","isp":"Cloudflare, Inc",
                "as":"AS13335 Cloudflare, Inc."}"#,
        )
        .unwrap();
        assert!(info.is_success());
        assert_eq!(info.country_code.as_deref(), Some("AU"));
        assert_eq!(info.as_name.as_deref(), Some("AS13335 Cloudflare, Inc."));
    }

    #[test]
    fn parses_ip_api_failure() {
        let info: GeoInfo =
            serde_json::from_str(r#"{"status":"fail","message":"private range","query":"10.0.0.1"}"#)
                .unwrap();
        assert!(!info.is_success());
        assert_eq!(info.message.as_deref(), Some("private range"));
    }
}
