//! Routing Rule Compilation
//!
//! Turns a selection snapshot into the address ranges the tunnel routes.
//!
//! # Compilation
//!
//! 1. `EncryptAll` routes everything (`0.0.0.0/0`, `::/0`), whatever is selected
//! 2. `Custom` unions the known domains of every selected app
//! 3. Each domain is resolved to exact host ranges
//! 4. If nothing resolved, the popular-services fallback list is resolved instead
//!
//! Ranges are kept in ordered sets, so two compiles of the same snapshot
//! against the same resolver cache state produce identical rules.

use crate::catalog::equivalent_ids;
use crate::config::full_route_ranges;
use crate::model::{AppSelection, SelectionMode};
use ipnet::IpNet;
use kuza_network::{normalize_domain, AddressResolver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// App id → domain suffixes, plus the popular-services fallback list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRoutingTable {
    /// Domains per app id, in declaration order
    #[serde(default)]
    pub apps: BTreeMap<String, Vec<String>>,
    /// Domains routed when a selection resolves to nothing
    #[serde(default)]
    pub fallback: Vec<String>,
}

impl DomainRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of an app's domains
    pub fn with_app(mut self, id: &str, domains: &[&str]) -> Self {
        self.apps
            .insert(id.to_string(), domains.iter().map(|d| d.to_string()).collect());
        self
    }

    /// Builder-style replacement of the fallback list
    pub fn with_fallback(mut self, domains: &[&str]) -> Self {
        self.fallback = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Domains for an app id, trying its other-platform ids as well.
    ///
    /// Unknown apps have no domains.
    pub fn domains_for(&self, id: &str) -> &[String] {
        equivalent_ids(id)
            .iter()
            .find_map(|candidate| self.apps.get(candidate))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Known social, messaging, streaming and gaming apps.
    pub fn bootstrap() -> Self {
        Self::new()
            .with_app(
                "com.burbn.instagram",
                &[
                    "instagram.com",
                    "cdninstagram.com",
                    "facebook.com",
                    "instagramstatic-a.akamaihd.net",
                    "scontent.cdninstagram.com",
                ],
            )
            .with_app(
                "com.snapchat.Snapchat",
                &["snapchat.com", "sc-cdn.net", "snap-dev.net", "snapkit.com", "snap.com"],
            )
            .with_app(
                "com.zhiliaoapp.musically",
                &["tiktok.com", "muscdn.com", "musical.ly", "byteoversea.com", "tiktokcdn.com"],
            )
            .with_app(
                "com.twitter.app",
                &["twitter.com", "twimg.com", "t.co", "twitterstatus.com", "twitter.map.fastly.net"],
            )
            .with_app(
                "com.facebook.Facebook",
                &["facebook.com", "fbcdn.net", "fb.com", "facebook.net", "fbsbx.com"],
            )
            .with_app(
                "net.whatsapp.WhatsApp",
                &["whatsapp.com", "whatsapp.net", "wa.me", "whatsapp-plus.info"],
            )
            .with_app(
                "com.discord",
                &["discord.com", "discordapp.com", "discord.gg", "discord.media", "discord.co"],
            )
            .with_app(
                "ph.telegra.Telegraph",
                &["telegram.org", "t.me", "telegra.ph", "telegram.me"],
            )
            .with_app(
                "com.spotify.client",
                &["spotify.com", "scdn.co", "spotifycdn.com", "spotify.map.fastly.net"],
            )
            .with_app(
                "com.netflix.Netflix",
                &["netflix.com", "nflxso.net", "nflxext.com", "nflximg.net", "nflxvideo.net"],
            )
            .with_app(
                "com.google.ios.youtube",
                &[
                    "youtube.com",
                    "youtubei.googleapis.com",
                    "ytimg.com",
                    "googlevideo.com",
                    "youtube-nocookie.com",
                ],
            )
            .with_app(
                "com.epicgames.FortniteGame",
                &["epicgames.com", "fortnite.com", "unrealengine.com", "battlebreakers.com"],
            )
            .with_app(
                "com.riotgames.leagueoflegends",
                &["riotgames.com", "leagueoflegends.com", "riot.net", "riotcdn.net"],
            )
            .with_fallback(&[
                "facebook.com",
                "instagram.com",
                "twitter.com",
                "snapchat.com",
                "tiktok.com",
                "youtube.com",
                "fbcdn.net",
                "cdninstagram.com",
                "twimg.com",
                "ytimg.com",
                "googlevideo.com",
                "scdn.co",
                "whatsapp.com",
                "discord.com",
                "telegram.org",
            ])
    }
}

/// Compiled include/exclude address ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub included_ranges: BTreeSet<IpNet>,
    pub excluded_ranges: BTreeSet<IpNet>,
}

impl RoutingRule {
    /// Route all IPv4 and IPv6 traffic
    pub fn full_route() -> Self {
        Self {
            included_ranges: full_route_ranges().into_iter().collect(),
            excluded_ranges: BTreeSet::new(),
        }
    }

    pub fn is_full_route(&self) -> bool {
        full_route_ranges()
            .iter()
            .all(|range| self.included_ranges.contains(range))
    }

    /// True when nothing would be routed
    pub fn is_empty(&self) -> bool {
        self.included_ranges.is_empty()
    }

    /// Included ranges as the ordered allowed-ranges list of a tunnel config
    pub fn allowed_ranges(&self) -> Vec<IpNet> {
        self.included_ranges.iter().copied().collect()
    }
}

/// Result of one compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub mode: SelectionMode,
    pub rule: RoutingRule,
    /// App ids handed to the tunnel engine; empty means no app filter
    pub app_filter_ids: Vec<String>,
    /// The popular-services list was used because the selection resolved to nothing
    pub used_fallback: bool,
    /// Domains that produced no addresses
    pub unresolved_domains: Vec<String>,
}

/// Selection snapshot → routing rule
pub struct RoutingRuleCompiler {
    table: Arc<DomainRoutingTable>,
    resolver: Arc<AddressResolver>,
}

impl RoutingRuleCompiler {
    pub fn new(table: Arc<DomainRoutingTable>, resolver: Arc<AddressResolver>) -> Self {
        Self { table, resolver }
    }

    pub fn table(&self) -> &DomainRoutingTable {
        &self.table
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    /// Compile a plan for `mode` and a selection snapshot.
    pub async fn compile(&self, mode: SelectionMode, selection: &AppSelection) -> RoutePlan {
        if mode == SelectionMode::EncryptAll {
            debug!(selected = selection.len(), "Encrypt-all mode, routing everything");
            return RoutePlan {
                mode,
                rule: RoutingRule::full_route(),
                app_filter_ids: Vec::new(),
                used_fallback: false,
                unresolved_domains: Vec::new(),
            };
        }

        let app_filter_ids = selection.ids();

        let domains: BTreeSet<String> = app_filter_ids
            .iter()
            .flat_map(|id| self.table.domains_for(id))
            .filter_map(|d| normalize_domain(d))
            .collect();

        let (mut included, mut unresolved) = self.resolve_all(&domains).await;
        let mut used_fallback = false;

        if included.is_empty() {
            info!(
                apps = app_filter_ids.len(),
                domains = domains.len(),
                "Selection resolved to nothing, using popular-services fallback"
            );
            let fallback: BTreeSet<String> = self
                .table
                .fallback
                .iter()
                .filter_map(|d| normalize_domain(d))
                .collect();

            let (fallback_included, fallback_unresolved) = self.resolve_all(&fallback).await;
            included = fallback_included;
            unresolved.extend(fallback_unresolved);
            used_fallback = true;

            if included.is_empty() {
                warn!("Fallback domains resolved to nothing, rule is empty");
            }
        }

        info!(
            apps = app_filter_ids.len(),
            domains = domains.len(),
            ranges = included.len(),
            unresolved = unresolved.len(),
            fallback = used_fallback,
            "Routing rule compiled"
        );

        RoutePlan {
            mode,
            rule: RoutingRule {
                included_ranges: included,
                excluded_ranges: BTreeSet::new(),
            },
            app_filter_ids,
            used_fallback,
            unresolved_domains: unresolved,
        }
    }

    async fn resolve_all(&self, domains: &BTreeSet<String>) -> (BTreeSet<IpNet>, Vec<String>) {
        let mut included = BTreeSet::new();
        let mut unresolved = Vec::new();

        for domain in domains {
            let ranges = self.resolver.resolve(domain).await;
            if ranges.is_empty() {
                unresolved.push(domain.clone());
            }
            included.extend(ranges);
        }

        (included, unresolved)
    }
}
