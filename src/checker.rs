//! Entry point composing the endpoint parser, prober and resolver.
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::join_all;
use tracing::info;

use crate::config::{CheckerConfig, ScanConfig};
use crate::dns::{DohResolver, Resolver};
use crate::endpoint::{self, connect_host};
use crate::error::CheckResult;
use crate::geo::{GeoLookup, IpApiGeo};
use crate::probe::{ProbeEngine, Prober};
use crate::scanner::RangeScanner;
use crate::types::{DomainCheck, ProbeResult};

/// Either a single probe or a whole domain's worth of them.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Single(ProbeResult),
    Domain(DomainCheck),
}

#[derive(Clone)]
pub struct Checker {
    prober: Arc<dyn Prober>,
    resolver: Arc<dyn Resolver>,
    geo: Option<Arc<dyn GeoLookup>>,
    config: CheckerConfig,
}

impl Checker {
    /// Build a checker backed by the real TCP prober, DoH resolver and geo client.
    pub fn from_config(config: CheckerConfig) -> CheckResult<Self> {
        let prober = Arc::new(ProbeEngine::new(config.probe.clone()));
        let resolver = Arc::new(DohResolver::new(config.dns.clone())?);
        let geo: Option<Arc<dyn GeoLookup>> = if config.geo.enabled {
            Some(Arc::new(IpApiGeo::new(&config.geo)?))
        } else {
            None
        };
        Ok(Self {
            prober,
            resolver,
            geo,
            config,
        })
    }

    pub fn new(
        prober: Arc<dyn Prober>,
        resolver: Arc<dyn Resolver>,
        geo: Option<Arc<dyn GeoLookup>>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            prober,
            resolver,
            geo,
            config,
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn geo(&self) -> Option<&Arc<dyn GeoLookup>> {
        self.geo.as_ref()
    }

    /// Range scanner sharing this checker's prober and geo client.
    pub fn scanner(&self) -> RangeScanner {
        self.scanner_with(self.config.scan.clone())
    }

    pub fn scanner_with(&self, scan: ScanConfig) -> RangeScanner {
        let scanner = RangeScanner::new(self.prober.clone(), scan);
        match &self.geo {
            Some(geo) => scanner.with_geo(geo.clone()),
            None => scanner,
        }
    }

    /// Parse `raw` (case-insensitively) and probe it once.
    pub async fn check(&self, raw: &str) -> ProbeResult {
        let ep = endpoint::parse(&raw.trim().to_lowercase());
        self.prober.probe(&ep).await
    }

    pub async fn resolve(&self, domain: &str) -> CheckResult<Vec<String>> {
        self.resolver.resolve(domain).await
    }

    /// Resolve the host part of `raw` and probe every address on the parsed port.
    pub async fn check_domain(&self, raw: &str) -> CheckResult<DomainCheck> {
        let ep = endpoint::parse(&raw.trim().to_lowercase());
        let ips = self.resolver.resolve(&ep.host).await?;
        info!(domain = %ep.host, port = ep.port, addresses = ips.len(), "checking resolved domain");

        let probes = ips.iter().map(|ip| {
            let target = endpoint::parse(&format!("{ip}:{}", ep.port));
            let prober = self.prober.clone();
            async move { prober.probe(&target).await }
        });
        let results = join_all(probes).await;

        Ok(DomainCheck {
            domain: ep.host,
            port: ep.port,
            ips,
            results,
        })
    }

    /// IP literals get a single probe; anything else goes through DNS first.
    pub async fn check_auto(&self, raw: &str) -> CheckResult<CheckOutcome> {
        let ep = endpoint::parse(&raw.trim().to_lowercase());
        if connect_host(&ep.host).parse::<IpAddr>().is_ok() {
            Ok(CheckOutcome::Single(self.prober.probe(&ep).await))
        } else {
            self.check_domain(raw).await.map(CheckOutcome::Domain)
        }
    }
}
