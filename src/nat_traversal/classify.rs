/**
 * nat_traversal/classify.rs
 *
 * Derives a NatProfile from an ordered list of STUN probe results.
 */

use std::net::SocketAddr;
use tracing::debug;

use crate::nat_traversal::stun::{ChangeRequestStatus, ProbeOutcome, ProbeResult, StunResponse};
use crate::nat_traversal::types::{FilteringBehavior, MappingBehavior, NatProfile, NatType};

pub struct NatClassifier;

impl NatClassifier {
    /// Classify the NAT in front of the socket that produced `probes`.
    ///
    /// Differing reflexive addresses across servers always win and give
    /// Symmetric. Filtering is only consulted once mapping is known to be
    /// endpoint independent, and an inconclusive filtering test yields
    /// Unknown rather than a guess.
    pub fn classify(probes: &[ProbeResult]) -> NatProfile {
        let plain: Vec<(SocketAddr, &StunResponse)> = probes
            .iter()
            .filter(|p| p.is_plain())
            .filter_map(|p| p.response().map(|r| (p.server, r)))
            .collect();

        let Some(&(_, first)) = plain.first() else {
            debug!("no STUN server answered");
            return NatProfile::unknown(None);
        };
        let external = first.mapped;

        if plain.iter().any(|(_, r)| r.mapped != external) {
            debug!(%external, "reflexive address differs per destination");
            return NatProfile {
                nat_type: NatType::Symmetric,
                mapping: MappingBehavior::AddressDependent,
                filtering: FilteringBehavior::AddressAndPortDependent,
                external_address: Some(external),
            };
        }

        let mut servers: Vec<SocketAddr> = plain.iter().map(|(s, _)| *s).collect();
        servers.sort();
        servers.dedup();
        if servers.len() < 2 {
            debug!(%external, "single STUN server answered; mapping behaviour unknown");
            return NatProfile::unknown(Some(external));
        }

        let filtering = Self::filtering(probes, &plain);
        let nat_type = match filtering {
            FilteringBehavior::EndpointIndependent => NatType::FullCone,
            FilteringBehavior::AddressDependent => NatType::RestrictedCone,
            FilteringBehavior::AddressAndPortDependent => NatType::PortRestrictedCone,
            FilteringBehavior::Unknown => NatType::Unknown,
        };

        NatProfile {
            nat_type,
            mapping: MappingBehavior::EndpointIndependent,
            filtering,
            external_address: Some(external),
        }
    }

    fn filtering(probes: &[ProbeResult], plain: &[(SocketAddr, &StunResponse)]) -> FilteringBehavior {
        let find = |change_ip: bool| {
            probes
                .iter()
                .find(|p| p.change_ip == change_ip && p.change_port)
                .map(|p| &p.outcome)
        };
        let honored = |outcome: Option<&ProbeOutcome>| {
            matches!(
                outcome,
                Some(ProbeOutcome::Mapped(r)) if r.change == ChangeRequestStatus::Honored
            )
        };

        let full = find(true);
        let port = find(false);

        if honored(full) {
            return FilteringBehavior::EndpointIndependent;
        }
        if honored(port) {
            return FilteringBehavior::AddressDependent;
        }

        let advertised = plain.iter().any(|(_, r)| r.other_address.is_some());
        let silent = |o: Option<&ProbeOutcome>| matches!(o, Some(ProbeOutcome::NoResponse));
        if advertised && silent(full) && silent(port) {
            return FilteringBehavior::AddressAndPortDependent;
        }

        debug!("filtering tests inconclusive");
        FilteringBehavior::Unknown
    }
}
