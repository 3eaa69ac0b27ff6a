//! Link Data
//!
//! Kind-specific link settings (`IFLA_INFO_DATA`) in typed form. Bond
//! settings are normalized to what the kernel reports back for the mode,
//! so a desired bond and an observed bond compare equal once applied.

use crate::resources::nethelpers::BondMode;
use crate::resources::{BondMasterSpec, VlanSpec};

/// Kind-specific settings of a link
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkData {
    #[default]
    None,
    Vlan(VlanSpec),
    Bond(BondMasterSpec),
}

impl LinkData {
    pub fn vlan(&self) -> Option<&VlanSpec> {
        match self {
            LinkData::Vlan(vlan) => Some(vlan),
            _ => None,
        }
    }

    pub fn bond(&self) -> Option<&BondMasterSpec> {
        match self {
            LinkData::Bond(bond) => Some(bond),
            _ => None,
        }
    }

    /// The form the kernel reports after applying this data
    pub fn reported(self) -> Self {
        match self {
            LinkData::Bond(bond) => LinkData::Bond(mask_bond(bond)),
            other => other,
        }
    }
}

fn no_arp_modes(mode: BondMode) -> bool {
    matches!(mode, BondMode::Ieee8023ad | BondMode::Alb | BondMode::Tlb)
}

/// Fill zero values with the kernel defaults so desired and observed compare equal
pub fn fill_bond_defaults(bond: &mut BondMasterSpec) {
    if bond.resend_igmp == 0 {
        bond.resend_igmp = 1;
    }

    if bond.lp_interval == 0 {
        bond.lp_interval = 1;
    }

    if bond.packets_per_slave == 0 {
        bond.packets_per_slave = 1;
    }

    if bond.num_peer_notif == 0 {
        bond.num_peer_notif = 1;
    }

    if bond.mode != BondMode::Alb && bond.mode != BondMode::Tlb {
        bond.tlb_dynamic_lb = 1;
    }

    if bond.mode == BondMode::Ieee8023ad && bond.ad_actor_sys_prio == 0 {
        bond.ad_actor_sys_prio = 65535;
    }
}

/// Reset the attributes the current mode does not carry
pub fn mask_bond(mut bond: BondMasterSpec) -> BondMasterSpec {
    let mode = bond.mode;

    if mode != BondMode::Ieee8023ad {
        bond.lacp_rate = Default::default();
        bond.ad_actor_sys_prio = 0;
        bond.ad_user_port_key = 0;
    }

    if no_arp_modes(mode) {
        bond.arp_validate = Default::default();
        bond.arp_interval = 0;
        bond.arp_ip_targets.clear();
    }

    if !matches!(mode, BondMode::ActiveBackup | BondMode::Alb | BondMode::Tlb) {
        bond.primary_index = 0;
    }

    if bond.miimon == 0 {
        bond.up_delay = 0;
        bond.down_delay = 0;
    }

    if mode != BondMode::RoundRobin {
        bond.packets_per_slave = 0;
    }

    if !matches!(mode, BondMode::Alb | BondMode::Tlb) {
        bond.tlb_dynamic_lb = 0;
    }

    bond
}

/// Canonical form of a bond spec: what the kernel would report back
pub fn normalize_bond(bond: &BondMasterSpec) -> BondMasterSpec {
    let mut filled = bond.clone();
    fill_bond_defaults(&mut filled);

    mask_bond(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::nethelpers::{ArpValidate, LacpRate, VlanProtocol};

    #[test]
    fn test_bond_mode_specific_attributes() {
        let bond = BondMasterSpec {
            mode: BondMode::ActiveBackup,
            lacp_rate: LacpRate::Fast,
            miimon: 100,
            up_delay: 200,
            arp_validate: ArpValidate::All,
            arp_ip_targets: vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
            ..Default::default()
        };

        let normalized = normalize_bond(&bond);

        // LACP rate only exists in 802.3ad mode
        assert_eq!(normalized.lacp_rate, LacpRate::Slow);
        assert_eq!(normalized.up_delay, 200);
        assert_eq!(normalized.arp_validate, ArpValidate::All);
        assert_eq!(normalized.arp_ip_targets, bond.arp_ip_targets);
        assert_eq!(normalized.tlb_dynamic_lb, 0);
        assert_eq!(normalized.packets_per_slave, 0);
        assert_eq!(normalized.resend_igmp, 1);
    }

    #[test]
    fn test_bond_lacp_drops_arp_monitoring() {
        let bond = BondMasterSpec {
            mode: BondMode::Ieee8023ad,
            lacp_rate: LacpRate::Fast,
            arp_interval: 100,
            arp_ip_targets: vec!["10.0.0.1".parse().unwrap()],
            up_delay: 100,
            ..Default::default()
        };

        let normalized = normalize_bond(&bond);

        assert_eq!(normalized.lacp_rate, LacpRate::Fast);
        assert_eq!(normalized.arp_interval, 0);
        assert!(normalized.arp_ip_targets.is_empty());
        // no miimon, no link monitor delays
        assert_eq!(normalized.up_delay, 0);
    }

    #[test]
    fn test_bond_normalize_is_stable() {
        let bond = BondMasterSpec {
            mode: BondMode::Ieee8023ad,
            lacp_rate: LacpRate::Fast,
            ..Default::default()
        };

        let once = normalize_bond(&bond);
        let twice = normalize_bond(&once);

        assert_eq!(once, twice);
        assert_eq!(once.ad_actor_sys_prio, 65535);
    }

    #[test]
    fn test_reported_keeps_vlan() {
        let vlan = VlanSpec {
            vid: 25,
            protocol: VlanProtocol::Ieee8021ad,
        };

        assert_eq!(LinkData::Vlan(vlan.clone()).reported(), LinkData::Vlan(vlan.clone()));
        assert_eq!(LinkData::Vlan(vlan).bond(), None);
        assert_eq!(LinkData::None.reported(), LinkData::None);
    }
}
