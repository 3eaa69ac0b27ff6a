//! nftables Rule Compiler
//!
//! Compiles declarative [`NfTablesRule`]s into register-level nftables
//! expressions and anonymous sets, plus the table/chain/rule batch the
//! backend applies in a single transaction.
//!
//! A rule has a part shared by both IP families (`pre` and `post`) and
//! optional per-family parts. A family part that is absent means the rule
//! does not apply to that family; a present but empty part means "match
//! any address of that family".

use crate::error::{Error, Result};
use crate::resources::nethelpers::{
    ChainHook, ChainPriority, ChainType, ConntrackState, MatchOperator, Verdict,
};
use crate::resources::{NfTablesAddressMatch, NfTablesRule, PortRange};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Length of an interface name key
pub const IFNAME_LEN: usize = 16;

/// `NFPROTO_IPV4`
pub const NFPROTO_IPV4: u8 = 2;
/// `NFPROTO_IPV6`
pub const NFPROTO_IPV6: u8 = 10;

const IPPROTO_TCP: u8 = 6;
const TCPOPT_MAXSEG: u8 = 2;

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    NfProto,
    L4Proto,
    IifName,
    OifName,
    Mark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Gt,
}

impl From<MatchOperator> for CmpOp {
    fn from(op: MatchOperator) -> Self {
        match op {
            MatchOperator::Equal => CmpOp::Eq,
            MatchOperator::NotEqual => CmpOp::Neq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadBase {
    NetworkHeader,
    TransportHeader,
}

/// Single nftables expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Load (or with `source_register`, store) a meta key
    Meta {
        key: MetaKey,
        register: u32,
        source_register: bool,
    },
    Cmp {
        op: CmpOp,
        register: u32,
        data: Vec<u8>,
    },
    /// `dst = (src & mask) ^ xor`
    Bitwise {
        source_register: u32,
        dest_register: u32,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    /// Load the conntrack state
    CtState { register: u32 },
    Payload {
        dest_register: u32,
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    /// Set membership; `set_id` indexes the rule's sets until the chain
    /// controller assigns table-wide ids and names
    Lookup {
        source_register: u32,
        set_id: u32,
        set_name: String,
        invert: bool,
    },
    /// Packets per second with an equal burst
    Limit { rate: u64, burst: u32 },
    /// TCP option load, or store with `write`
    TcpOption {
        register: u32,
        option: u8,
        offset: u32,
        len: u32,
        write: bool,
    },
    Immediate { register: u32, data: Vec<u8> },
    Counter,
    Verdict(Verdict),
}

impl Expr {
    fn meta(key: MetaKey) -> Self {
        Expr::Meta {
            key,
            register: 1,
            source_register: false,
        }
    }

    fn cmp(op: CmpOp, data: Vec<u8>) -> Self {
        Expr::Cmp {
            op,
            register: 1,
            data,
        }
    }

    fn lookup(set_id: usize, invert: bool) -> Self {
        Expr::Lookup {
            source_register: 1,
            set_id: set_id as u32,
            set_name: String::new(),
            invert,
        }
    }

    fn payload(base: PayloadBase, offset: u32, len: u32) -> Self {
        Expr::Payload {
            dest_register: 1,
            base,
            offset,
            len,
        }
    }
}

// =============================================================================
// Sets
// =============================================================================

/// Inclusive address range of one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    pub from: IpAddr,
    pub to: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Ipv4,
    Ipv6,
    Port,
    IfName,
    ConntrackState,
    IcmpType,
}

/// Set element; interval sets pair a start key with an end key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetElement {
    pub key: Vec<u8>,
    pub interval_end: bool,
}

/// Anonymous set produced by a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfTablesSet {
    pub kind: SetKind,
    pub addresses: Vec<IpRange>,
    pub ports: Vec<(u16, u16)>,
    pub strings: Vec<Vec<u8>>,
    pub conntrack_states: Vec<ConntrackState>,
    pub icmp_types: Vec<u8>,
}

impl NfTablesSet {
    fn new(kind: SetKind) -> Self {
        Self {
            kind,
            addresses: Vec::new(),
            ports: Vec::new(),
            strings: Vec::new(),
            conntrack_states: Vec::new(),
            icmp_types: Vec::new(),
        }
    }

    pub fn is_interval(&self) -> bool {
        matches!(self.kind, SetKind::Ipv4 | SetKind::Ipv6 | SetKind::Port)
    }

    /// Key data type name as used by nft
    pub fn key_type(&self) -> &'static str {
        match self.kind {
            SetKind::Ipv4 => "ipv4_addr",
            SetKind::Ipv6 => "ipv6_addr",
            SetKind::Port => "inet_service",
            SetKind::IfName => "ifname",
            SetKind::ConntrackState => "ct_state",
            SetKind::IcmpType => "icmp_type",
        }
    }

    /// Kernel set elements; interval ends are exclusive and omitted at the
    /// top of the key space
    pub fn elements(&self) -> Vec<SetElement> {
        let mut elements = Vec::new();

        let mut interval = |from: Vec<u8>, to: Option<Vec<u8>>| {
            elements.push(SetElement {
                key: from,
                interval_end: false,
            });

            if let Some(to) = to {
                elements.push(SetElement {
                    key: to,
                    interval_end: true,
                });
            }
        };

        match self.kind {
            SetKind::Ipv4 | SetKind::Ipv6 => {
                for range in &self.addresses {
                    interval(ip_bytes(range.from), next_ip(range.to).map(ip_bytes));
                }
            }
            SetKind::Port => {
                for (lo, hi) in merge_adjacent_ports(&self.ports) {
                    interval(
                        lo.to_be_bytes().to_vec(),
                        hi.checked_add(1).map(|end| end.to_be_bytes().to_vec()),
                    );
                }
            }
            SetKind::IfName => {
                for s in &self.strings {
                    interval(s.clone(), None);
                }
            }
            SetKind::ConntrackState => {
                for state in &self.conntrack_states {
                    interval(state.value().to_ne_bytes().to_vec(), None);
                }
            }
            SetKind::IcmpType => {
                for t in &self.icmp_types {
                    interval(vec![*t], None);
                }
            }
        }

        elements
    }
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn next_ip(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => u32::from(v4)
            .checked_add(1)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(v6) => u128::from(v6)
            .checked_add(1)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

/// Sort port ranges and join touching neighbours
pub fn merge_adjacent_ports(ports: &[(u16, u16)]) -> Vec<(u16, u16)> {
    let mut ports = ports.to_vec();
    ports.sort_by_key(|p| p.0);

    let mut i = 0;
    while i + 1 < ports.len() {
        if ports[i].1 as u32 + 1 >= ports[i + 1].0 as u32 {
            ports[i].1 = ports[i + 1].1;
            ports.remove(i + 1);
        } else {
            i += 1;
        }
    }

    ports
}

/// Interface name padded to [`IFNAME_LEN`]
pub fn ifname(name: &str) -> Vec<u8> {
    let mut b = vec![0u8; IFNAME_LEN];
    let n = name.len().min(IFNAME_LEN);
    b[..n].copy_from_slice(&name.as_bytes()[..n]);
    b
}

// =============================================================================
// IP Sets
// =============================================================================

fn network_bounds(net: &IpNetwork) -> (u128, u128, bool) {
    match net {
        IpNetwork::V4(n) => (
            u32::from(n.network()) as u128,
            u32::from(n.broadcast()) as u128,
            true,
        ),
        IpNetwork::V6(n) => {
            let lo = u128::from(n.network());
            let hi = if n.prefix() == 0 {
                u128::MAX
            } else {
                lo | (u128::MAX >> n.prefix())
            };
            (lo, hi, false)
        }
    }
}

fn merge_ranges(mut ranges: Vec<(u128, u128)>) -> Vec<(u128, u128)> {
    ranges.sort();

    let mut merged: Vec<(u128, u128)> = Vec::new();
    for (lo, hi) in ranges {
        match merged.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }

    merged
}

fn subtract_ranges(include: Vec<(u128, u128)>, exclude: &[(u128, u128)]) -> Vec<(u128, u128)> {
    let mut result = Vec::new();

    for (mut lo, hi) in include {
        let mut open = true;

        for &(ex_lo, ex_hi) in exclude {
            if ex_hi < lo || ex_lo > hi {
                continue;
            }

            if ex_lo > lo {
                result.push((lo, ex_lo - 1));
            }

            if ex_hi >= hi {
                open = false;
                break;
            }

            lo = ex_hi + 1;
        }

        if open {
            result.push((lo, hi));
        }
    }

    result
}

/// Include minus exclude as merged ranges, split into (IPv4, IPv6)
pub fn build_ip_set(include: &[IpNetwork], exclude: &[IpNetwork]) -> (Vec<IpRange>, Vec<IpRange>) {
    let family = |nets: &[IpNetwork], v4: bool| -> Vec<(u128, u128)> {
        merge_ranges(
            nets.iter()
                .map(network_bounds)
                .filter(|(_, _, is_v4)| *is_v4 == v4)
                .map(|(lo, hi, _)| (lo, hi))
                .collect(),
        )
    };

    let v4 = subtract_ranges(family(include, true), &family(exclude, true))
        .into_iter()
        .map(|(lo, hi)| IpRange {
            from: IpAddr::V4(Ipv4Addr::from(lo as u32)),
            to: IpAddr::V4(Ipv4Addr::from(hi as u32)),
        })
        .collect();

    let v6 = subtract_ranges(family(include, false), &family(exclude, false))
        .into_iter()
        .map(|(lo, hi)| IpRange {
            from: IpAddr::V6(Ipv6Addr::from(lo)),
            to: IpAddr::V6(Ipv6Addr::from(hi)),
        })
        .collect();

    (v4, v6)
}

fn covers_all(set: &[IpRange]) -> bool {
    match set {
        [range] => match (range.from, range.to) {
            (IpAddr::V4(from), IpAddr::V4(to)) => {
                from == Ipv4Addr::UNSPECIFIED && to == Ipv4Addr::BROADCAST
            }
            (IpAddr::V6(from), IpAddr::V6(to)) => {
                u128::from(from) == 0 && u128::from(to) == u128::MAX
            }
            _ => false,
        },
        _ => false,
    }
}

// =============================================================================
// Compilation
// =============================================================================

/// Compiled rule: one or two kernel rules plus the anonymous sets they use
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NfTablesCompiled {
    pub rules: Vec<Vec<Expr>>,
    pub sets: Vec<NfTablesSet>,
}

fn match_family(proto: u8) -> Vec<Expr> {
    vec![Expr::meta(MetaKey::NfProto), Expr::cmp(CmpOp::Eq, vec![proto])]
}

fn clamp_mss(proto: u8, mtu: u16) -> Vec<Expr> {
    // TCP + IP header overhead
    let overhead = if proto == NFPROTO_IPV4 { 40 } else { 60 };
    let mss = mtu.saturating_sub(overhead).to_be_bytes().to_vec();

    vec![
        Expr::meta(MetaKey::L4Proto),
        Expr::cmp(CmpOp::Eq, vec![IPPROTO_TCP]),
        // tcp flags
        Expr::payload(PayloadBase::TransportHeader, 13, 1),
        Expr::Bitwise {
            source_register: 1,
            dest_register: 1,
            len: 1,
            mask: vec![0x02 | 0x04],
            xor: vec![0x00],
        },
        // syn without rst
        Expr::cmp(CmpOp::Eq, vec![0x02]),
        Expr::TcpOption {
            register: 1,
            option: TCPOPT_MAXSEG,
            offset: 2,
            len: 2,
            write: false,
        },
        Expr::cmp(CmpOp::Gt, mss.clone()),
        Expr::Immediate {
            register: 1,
            data: mss,
        },
        Expr::TcpOption {
            register: 1,
            option: TCPOPT_MAXSEG,
            offset: 2,
            len: 2,
            write: true,
        },
    ]
}

struct Compiler {
    pre: Vec<Expr>,
    post: Vec<Expr>,
    rule4: Option<Vec<Expr>>,
    rule6: Option<Vec<Expr>>,
    sets: Vec<NfTablesSet>,
}

impl Compiler {
    fn add_set(&mut self, set: NfTablesSet) -> usize {
        self.sets.push(set);
        self.sets.len() - 1
    }

    fn match_ifnames(&mut self, operator: MatchOperator, names: &[String]) {
        if let [name] = names {
            self.pre.push(Expr::cmp(operator.into(), ifname(name)));
        } else {
            let mut set = NfTablesSet::new(SetKind::IfName);
            set.strings = names.iter().map(|n| ifname(n)).collect();
            let id = self.add_set(set);

            self.pre
                .push(Expr::lookup(id, operator == MatchOperator::NotEqual));
        }
    }

    /// False when the match can never hold
    fn match_address(&mut self, m: &NfTablesAddressMatch, off_v4: u32, off_v6: u32) -> bool {
        let (v4, v6) = build_ip_set(&m.include_subnets, &m.exclude_subnets);

        if v4.is_empty() && v6.is_empty() && !m.invert {
            return false;
        }

        let v4_all = covers_all(&v4);
        let v6_all = covers_all(&v6);

        if v4_all && v6_all && m.invert {
            return false;
        }

        if (v4_all && !m.invert) || (m.invert && v4.is_empty()) {
            self.rule4.get_or_insert_with(Vec::new);
        } else if (!v4_all && m.invert) || (!m.invert && !v4.is_empty()) {
            let mut set = NfTablesSet::new(SetKind::Ipv4);
            set.addresses = v4;
            let id = self.add_set(set);

            let rule = self.rule4.get_or_insert_with(Vec::new);
            rule.push(Expr::payload(PayloadBase::NetworkHeader, off_v4, 4));
            rule.push(Expr::lookup(id, m.invert));
        }

        if (v6_all && !m.invert) || (m.invert && v6.is_empty()) {
            self.rule6.get_or_insert_with(Vec::new);
        } else if (!v6_all && m.invert) || (!m.invert && !v6.is_empty()) {
            let mut set = NfTablesSet::new(SetKind::Ipv6);
            set.addresses = v6;
            let id = self.add_set(set);

            let rule = self.rule6.get_or_insert_with(Vec::new);
            rule.push(Expr::payload(PayloadBase::NetworkHeader, off_v6, 16));
            rule.push(Expr::lookup(id, m.invert));
        }

        true
    }

    fn match_ports(&mut self, offset: u32, ranges: &[PortRange]) {
        let mut set = NfTablesSet::new(SetKind::Port);
        set.ports = ranges.iter().map(|r| (r.lo, r.hi)).collect();
        let id = self.add_set(set);

        self.post
            .push(Expr::payload(PayloadBase::TransportHeader, offset, 2));
        self.post.push(Expr::lookup(id, false));
    }

    fn match_icmp_types(&mut self, types: &[u8]) {
        self.post
            .push(Expr::payload(PayloadBase::TransportHeader, 0, 1));

        if let [t] = types {
            self.post.push(Expr::cmp(CmpOp::Eq, vec![*t]));
        } else {
            let mut set = NfTablesSet::new(SetKind::IcmpType);
            set.icmp_types = types.to_vec();
            let id = self.add_set(set);

            self.post.push(Expr::lookup(id, false));
        }
    }

    fn finish(self) -> NfTablesCompiled {
        let Compiler {
            pre,
            post,
            rule4,
            rule6,
            sets,
        } = self;

        let family_rule = |proto: u8, body: Vec<Expr>| -> Vec<Expr> {
            let mut rule = pre.clone();
            rule.extend(match_family(proto));
            rule.extend(body);
            rule.extend(post.iter().cloned());
            rule
        };

        let rules = match (rule4, rule6) {
            (None, None) if pre.is_empty() && post.is_empty() => Vec::new(),
            (None, None) => {
                let mut rule = pre.clone();
                rule.extend(post.iter().cloned());
                vec![rule]
            }
            (Some(r4), None) => vec![family_rule(NFPROTO_IPV4, r4)],
            (None, Some(r6)) => vec![family_rule(NFPROTO_IPV6, r6)],
            (Some(r4), Some(r6)) => vec![
                family_rule(NFPROTO_IPV4, r4),
                family_rule(NFPROTO_IPV6, r6),
            ],
        };

        NfTablesCompiled { rules, sets }
    }
}

/// Compile a rule into kernel rules and anonymous sets
///
/// Lookup expressions reference sets by their index in the returned
/// `sets`.
pub fn compile(rule: &NfTablesRule) -> Result<NfTablesCompiled> {
    let mut c = Compiler {
        pre: Vec::new(),
        post: Vec::new(),
        rule4: None,
        rule6: None,
        sets: Vec::new(),
    };

    if let Some(m) = &rule.match_iif_name {
        if m.interface_names.is_empty() {
            return Err(Error::NfTablesCompile("empty iifname match".into()));
        }

        c.pre.push(Expr::meta(MetaKey::IifName));
        c.match_ifnames(m.operator, &m.interface_names);
    }

    if let Some(m) = &rule.match_oif_name {
        if m.interface_names.is_empty() {
            return Err(Error::NfTablesCompile("empty oifname match".into()));
        }

        c.pre.push(Expr::meta(MetaKey::OifName));
        c.match_ifnames(m.operator, &m.interface_names);
    }

    if let Some(m) = &rule.match_mark {
        c.pre.push(Expr::meta(MetaKey::Mark));
        c.pre.push(Expr::Bitwise {
            source_register: 1,
            dest_register: 1,
            len: 4,
            mask: m.mask.to_ne_bytes().to_vec(),
            xor: m.xor.to_ne_bytes().to_vec(),
        });
        c.pre.push(Expr::cmp(CmpOp::Eq, m.value.to_ne_bytes().to_vec()));
    }

    if let Some(m) = &rule.match_conntrack_state {
        c.pre.push(Expr::CtState { register: 1 });

        if let [state] = m.states.as_slice() {
            c.pre.push(Expr::Bitwise {
                source_register: 1,
                dest_register: 1,
                len: 4,
                mask: state.value().to_ne_bytes().to_vec(),
                xor: vec![0; 4],
            });
            c.pre.push(Expr::cmp(CmpOp::Neq, vec![0; 4]));
        } else {
            let mut set = NfTablesSet::new(SetKind::ConntrackState);
            set.conntrack_states = m.states.clone();
            let id = c.add_set(set);

            c.pre.push(Expr::lookup(id, false));
        }
    }

    if let Some(m) = &rule.match_source_address {
        if !c.match_address(m, 12, 8) {
            return Ok(NfTablesCompiled::default());
        }
    }

    if let Some(m) = &rule.match_destination_address {
        if !c.match_address(m, 16, 24) {
            return Ok(NfTablesCompiled::default());
        }
    }

    if let Some(m) = &rule.match_layer4 {
        c.pre.push(Expr::meta(MetaKey::L4Proto));
        c.pre.push(Expr::cmp(CmpOp::Eq, vec![m.protocol.value()]));

        if let Some(ports) = &m.match_source_port {
            c.match_ports(0, &ports.ranges);
        }

        if let Some(ports) = &m.match_destination_port {
            c.match_ports(2, &ports.ranges);
        }

        if let Some(icmp) = &m.match_icmp_type {
            if !icmp.types.is_empty() {
                c.match_icmp_types(&icmp.types);
            }
        }
    }

    if let Some(m) = &rule.match_limit {
        c.post.push(Expr::Limit {
            rate: m.packet_rate_per_second,
            burst: m.packet_rate_per_second as u32,
        });
    }

    if let Some(clamp) = &rule.clamp_mss {
        c.rule4
            .get_or_insert_with(Vec::new)
            .extend(clamp_mss(NFPROTO_IPV4, clamp.mtu));
        c.rule6
            .get_or_insert_with(Vec::new)
            .extend(clamp_mss(NFPROTO_IPV6, clamp.mtu));
    }

    if let Some(set) = &rule.set_mark {
        c.post.push(Expr::meta(MetaKey::Mark));
        c.post.push(Expr::Bitwise {
            source_register: 1,
            dest_register: 1,
            len: 4,
            mask: set.mask.to_ne_bytes().to_vec(),
            xor: set.xor.to_ne_bytes().to_vec(),
        });
        c.post.push(Expr::Meta {
            key: MetaKey::Mark,
            register: 1,
            source_register: true,
        });
    }

    if rule.anon_counter {
        c.post.push(Expr::Counter);
    }

    if let Some(verdict) = rule.verdict {
        c.post.push(Expr::Verdict(verdict));
    }

    Ok(c.finish())
}

// =============================================================================
// Tables, Chains and Batches
// =============================================================================

/// Table family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NfFamily {
    Ip,
    Inet,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NfTableRef {
    pub family: NfFamily,
    pub name: String,
}

impl NfTableRef {
    pub fn new(family: NfFamily, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

/// Chain definition; `hook` is `None` for regular (non-base) chains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfChainDef {
    pub name: String,
    pub chain_type: ChainType,
    pub hook: Option<ChainHook>,
    pub priority: ChainPriority,
    pub policy: Verdict,
}

/// Named set in a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfSetDef {
    pub id: u32,
    pub name: String,
    pub key_type: &'static str,
    pub interval: bool,
    pub elements: Vec<SetElement>,
}

impl NfSetDef {
    /// Anonymous set named `__set{id}`
    pub fn anonymous(id: u32, set: &NfTablesSet) -> Self {
        Self {
            id,
            name: format!("__set{}", id),
            key_type: set.key_type(),
            interval: set.is_interval(),
            elements: set.elements(),
        }
    }
}

/// Observed chain with its rules and the sets they reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfChainState {
    pub chain: NfChainDef,
    pub rules: Vec<Vec<Expr>>,
    pub sets: Vec<NfSetDef>,
}

/// Single operation of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NfOp {
    AddTable(NfTableRef),
    DeleteTable(NfTableRef),
    AddChain {
        table: NfTableRef,
        chain: NfChainDef,
    },
    DeleteChain {
        table: NfTableRef,
        chain: String,
    },
    AddSet {
        table: NfTableRef,
        chain: String,
        set: NfSetDef,
    },
    AddRule {
        table: NfTableRef,
        chain: String,
        exprs: Vec<Expr>,
    },
}

/// Operations applied atomically by the backend
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NfBatch {
    pub ops: Vec<NfOp>,
}

impl NfBatch {
    pub fn push(&mut self, op: NfOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
