//! NfTables Chain Config Controller
//!
//! Synthesizes the `ingress` and `prerouting` chains from the machine's
//! network rules. Nothing is published while the firewall is left at its
//! defaults (accept, no rules).

use super::{machine_config, pass_done};
use crate::error::Result;
use crate::machine::{MachineConfig, NetworkRule};
use crate::resources::nethelpers::{
    ChainHook, ChainPriority, ChainType, ConntrackState, DefaultAction, MatchOperator, Protocol,
    Verdict,
};
use crate::resources::{
    Kind, Namespace, NfTablesAddressMatch, NfTablesChain, NfTablesConntrackStateMatch,
    NfTablesIcmpTypeMatch, NfTablesIfNameMatch, NfTablesLayer4Match, NfTablesLimitMatch,
    NfTablesPortMatch, NfTablesRule, NodeAddress, PortRange, HOST_DNS_SERVICE_ADDRESS,
    KUBESPAN_LINK_NAME, NODE_ADDRESS_CURRENT_ID, SIDEROLINK_NAME,
};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::warn;

pub const INGRESS_CHAIN_NAME: &str = "ingress";
pub const PREROUTING_CHAIN_NAME: &str = "prerouting";

/// ICMP timestamp and address mask requests and replies
const DEPRECATED_ICMP_TYPES: [u8; 4] = [13, 14, 17, 18];

const ICMP_RATE_PER_SECOND: u64 = 5;

/// Publishes `NfTablesChain`s for the node firewall
#[derive(Debug, Default)]
pub struct NfTablesChainConfigController;

fn accept_trusted() -> NfTablesRule {
    NfTablesRule {
        match_iif_name: Some(NfTablesIfNameMatch {
            interface_names: vec![
                "lo".to_string(),
                SIDEROLINK_NAME.to_string(),
                KUBESPAN_LINK_NAME.to_string(),
            ],
            operator: MatchOperator::Equal,
        }),
        anon_counter: true,
        verdict: Some(Verdict::Accept),
        ..Default::default()
    }
}

fn conntrack(states: Vec<ConntrackState>, verdict: Verdict) -> NfTablesRule {
    NfTablesRule {
        match_conntrack_state: Some(NfTablesConntrackStateMatch { states }),
        anon_counter: true,
        verdict: Some(verdict),
        ..Default::default()
    }
}

fn layer4(protocol: Protocol) -> NfTablesLayer4Match {
    NfTablesLayer4Match {
        protocol,
        ..Default::default()
    }
}

fn host_prefix(ip: IpAddr) -> Option<IpNetwork> {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(ip, prefix).ok()
}

/// Sorted destination port ranges of a user rule
fn port_match(rule: &NetworkRule) -> Result<NfTablesPortMatch> {
    let mut ranges: Vec<PortRange> = rule
        .port_selector
        .port_ranges()?
        .into_iter()
        .map(|(lo, hi)| PortRange { lo, hi })
        .collect();
    ranges.sort();

    Ok(NfTablesPortMatch { ranges })
}

/// User rules that compile; broken ones are logged and left out
fn user_rules(config: &MachineConfig) -> Vec<(&NetworkRule, NfTablesPortMatch)> {
    let Some(rules) = &config.network_rules else {
        return Vec::new();
    };

    rules
        .rules
        .iter()
        .filter_map(|rule| match port_match(rule) {
            Ok(ports) => Some((rule, ports)),
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "ignoring network rule");
                None
            }
        })
        .collect()
}

fn default_action(config: &MachineConfig) -> DefaultAction {
    config
        .network_rules
        .as_ref()
        .map(|r| r.default_action)
        .unwrap_or_default()
}

pub(crate) fn ingress_chain(config: &MachineConfig) -> NfTablesChain {
    let action = default_action(config);
    let block = action == DefaultAction::Block;

    let mut chain = NfTablesChain {
        chain_type: ChainType::Filter,
        hook: ChainHook::Input,
        priority: ChainPriority::MANGLE.offset(10),
        policy: Verdict::Accept,
        rules: vec![accept_trusted()],
    };

    if block {
        chain.policy = Verdict::Drop;

        chain.rules.push(conntrack(
            vec![ConntrackState::Established, ConntrackState::Related],
            Verdict::Accept,
        ));
        chain
            .rules
            .push(conntrack(vec![ConntrackState::Invalid], Verdict::Drop));

        chain.rules.push(NfTablesRule {
            match_layer4: Some(NfTablesLayer4Match {
                match_icmp_type: Some(NfTablesIcmpTypeMatch {
                    types: DEPRECATED_ICMP_TYPES.to_vec(),
                }),
                ..layer4(Protocol::Icmp)
            }),
            anon_counter: true,
            verdict: Some(Verdict::Drop),
            ..Default::default()
        });

        for protocol in [Protocol::Icmp, Protocol::Icmpv6] {
            chain.rules.push(NfTablesRule {
                match_layer4: Some(layer4(protocol)),
                match_limit: Some(NfTablesLimitMatch {
                    packet_rate_per_second: ICMP_RATE_PER_SECOND,
                }),
                anon_counter: true,
                verdict: Some(Verdict::Accept),
                ..Default::default()
            });
        }

        let cidrs = config.cluster_cidrs();

        if config.cluster.is_some() {
            if config.machine.features.host_dns.forward_kube_dns_to_host {
                for protocol in [Protocol::Udp, Protocol::Tcp] {
                    chain.rules.push(NfTablesRule {
                        match_source_address: Some(NfTablesAddressMatch {
                            include_subnets: cidrs.clone(),
                            ..Default::default()
                        }),
                        match_destination_address: Some(NfTablesAddressMatch {
                            include_subnets: host_prefix(HOST_DNS_SERVICE_ADDRESS)
                                .into_iter()
                                .collect(),
                            ..Default::default()
                        }),
                        match_layer4: Some(NfTablesLayer4Match {
                            match_destination_port: Some(NfTablesPortMatch {
                                ranges: vec![PortRange { lo: 53, hi: 53 }],
                            }),
                            ..layer4(protocol)
                        }),
                        anon_counter: true,
                        verdict: Some(Verdict::Accept),
                        ..Default::default()
                    });
                }
            }

            chain.rules.push(NfTablesRule {
                match_source_address: Some(NfTablesAddressMatch {
                    include_subnets: cidrs.clone(),
                    ..Default::default()
                }),
                match_destination_address: Some(NfTablesAddressMatch {
                    include_subnets: cidrs,
                    ..Default::default()
                }),
                anon_counter: true,
                verdict: Some(Verdict::Accept),
                ..Default::default()
            });
        }
    }

    // with default accept, drop whatever the rule does not admit
    let verdict = if block { Verdict::Accept } else { Verdict::Drop };

    for (rule, ports) in user_rules(config) {
        chain.rules.push(NfTablesRule {
            match_source_address: Some(NfTablesAddressMatch {
                include_subnets: rule.subnets(),
                exclude_subnets: rule.except_subnets(),
                invert: !block,
            }),
            match_layer4: Some(NfTablesLayer4Match {
                match_destination_port: Some(ports),
                ..layer4(rule.port_selector.protocol)
            }),
            anon_counter: true,
            verdict: Some(verdict),
            ..Default::default()
        });
    }

    chain
}

pub(crate) fn prerouting_chain(config: &MachineConfig, node_ips: &[IpAddr]) -> NfTablesChain {
    let block = default_action(config) == DefaultAction::Block;

    let mut chain = NfTablesChain {
        chain_type: ChainType::Filter,
        hook: ChainHook::Prerouting,
        priority: ChainPriority::DSTNAT.offset(-10),
        policy: Verdict::Accept,
        rules: vec![
            accept_trusted(),
            NfTablesRule {
                match_destination_address: Some(NfTablesAddressMatch {
                    include_subnets: node_ips.iter().copied().filter_map(host_prefix).collect(),
                    exclude_subnets: Vec::new(),
                    invert: true,
                }),
                anon_counter: true,
                verdict: Some(Verdict::Accept),
                ..Default::default()
            },
        ],
    };

    let verdict = if block { Verdict::Accept } else { Verdict::Drop };

    for (rule, ports) in user_rules(config) {
        chain.rules.push(NfTablesRule {
            match_conntrack_state: Some(NfTablesConntrackStateMatch {
                states: vec![ConntrackState::New],
            }),
            match_source_address: Some(NfTablesAddressMatch {
                include_subnets: rule.subnets(),
                exclude_subnets: rule.except_subnets(),
                invert: !block,
            }),
            match_layer4: Some(NfTablesLayer4Match {
                match_destination_port: Some(ports),
                ..layer4(rule.port_selector.protocol)
            }),
            anon_counter: true,
            verdict: Some(verdict),
            ..Default::default()
        });
    }

    if block {
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            chain.rules.push(NfTablesRule {
                match_conntrack_state: Some(NfTablesConntrackStateMatch {
                    states: vec![ConntrackState::New],
                }),
                match_layer4: Some(layer4(protocol)),
                anon_counter: true,
                verdict: Some(Verdict::Drop),
                ..Default::default()
            });
        }
    }

    chain
}

/// The firewall is off while it accepts by default and has no rules
fn firewall_enabled(config: &MachineConfig) -> bool {
    match &config.network_rules {
        None => false,
        Some(rules) => rules.default_action == DefaultAction::Block || !rules.rules.is_empty(),
    }
}

impl NfTablesChainConfigController {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        rt.start_tracking_outputs();

        if let Some(config) = machine_config(rt).filter(firewall_enabled) {
            let node_ips = rt
                .get::<NodeAddress>(Namespace::Network, NODE_ADDRESS_CURRENT_ID)
                .map(|r| r.spec.ips())
                .unwrap_or_default();

            for (name, desired) in [
                (INGRESS_CHAIN_NAME, ingress_chain(&config)),
                (PREROUTING_CHAIN_NAME, prerouting_chain(&config, &node_ips)),
            ] {
                rt.modify::<NfTablesChain, _>(Namespace::Network, name, |chain| {
                    *chain = desired;
                    Ok(())
                })?;
            }
        }

        rt.cleanup_outputs::<NfTablesChain>(Namespace::Network)
    }
}

#[async_trait]
impl Controller for NfTablesChainConfigController {
    fn name(&self) -> String {
        "NfTablesChainConfigController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Machine, Kind::MachineConfig),
            Input::weak(Namespace::Network, Kind::NodeAddress).with_id(NODE_ADDRESS_CURRENT_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(Kind::NfTablesChain)]
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt)?;
            pass_done(rt);
        }

        Ok(())
    }
}
