//! nftables over `nft` JSON
//!
//! Batches are rendered to libnftables JSON commands and applied as one
//! transaction. Rules are read back from the cache of what this process
//! applied; register-level expressions do not survive the JSON round trip.
//! Tables left by an earlier run show up with their chains but no rules,
//! which makes the chain controller rebuild them.

use super::LinuxKernel;
use crate::adapters::kernel::NfTablesBackend;
use crate::adapters::nftables::{
    CmpOp, Expr, MetaKey, NfBatch, NfChainDef, NfChainState, NfFamily, NfOp, NfSetDef,
    NfTableRef, PayloadBase, SetElement, NFPROTO_IPV4, NFPROTO_IPV6,
};
use crate::error::{Error, Result};
use crate::resources::nethelpers::{
    ChainHook, ChainPriority, ChainType, ConntrackState, Verdict,
};
use ::nftables::helper;
use ::nftables::schema::Nftables;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

const TCPOPT_MAXSEG: u8 = 2;

/// Chains applied by this process, per table
#[derive(Default)]
pub(super) struct NftCache {
    tables: Mutex<BTreeMap<NfTableRef, Vec<NfChainState>>>,
}

// =============================================================================
// Objects
// =============================================================================

fn family_name(family: NfFamily) -> &'static str {
    match family {
        NfFamily::Ip => "ip",
        NfFamily::Inet => "inet",
    }
}

fn family_from_name(name: &str) -> Option<NfFamily> {
    match name {
        "ip" => Some(NfFamily::Ip),
        "inet" => Some(NfFamily::Inet),
        _ => None,
    }
}

/// Set name in the ruleset; kernel anonymous names are reserved
fn set_name(chain: &str, set: &str) -> String {
    format!("{}_{}", chain, set.trim_start_matches('_'))
}

fn table_object(table: &NfTableRef) -> Value {
    json!({ "family": family_name(table.family), "name": table.name })
}

fn chain_ref(table: &NfTableRef, chain: &str) -> Value {
    json!({ "family": family_name(table.family), "table": table.name, "name": chain })
}

fn chain_object(table: &NfTableRef, chain: &NfChainDef) -> Value {
    let mut object = chain_ref(table, &chain.name);

    if let Some(hook) = chain.hook {
        object["type"] = json!(chain.chain_type.as_str());
        object["hook"] = json!(hook.as_str());
        object["prio"] = json!(chain.priority.0);
        object["policy"] = json!(chain.policy.as_str());
    }

    object
}

// =============================================================================
// Values
// =============================================================================

fn be_number(bytes: &[u8]) -> u64 {
    bytes.iter().take(8).fold(0, |n, b| (n << 8) | *b as u64)
}

fn ne_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let n = bytes.len().min(4);
    word[..n].copy_from_slice(&bytes[..n]);
    u32::from_ne_bytes(word)
}

fn ifname_value(bytes: &[u8]) -> Value {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    json!(String::from_utf8_lossy(&bytes[..end]))
}

fn ip_value(bytes: &[u8]) -> Option<Value> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(json!(Ipv4Addr::from(octets).to_string()))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(json!(Ipv6Addr::from(octets).to_string()))
        }
        _ => None,
    }
}

/// Big-endian `key - 1`; interval ends are exclusive
fn predecessor(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();

    for byte in out.iter_mut().rev() {
        if *byte > 0 {
            *byte -= 1;
            break;
        }
        *byte = 0xff;
    }

    out
}

fn element_value(key_type: &str, key: &[u8]) -> Result<Value> {
    let value = match key_type {
        "ipv4_addr" | "ipv6_addr" => ip_value(key),
        "inet_service" | "icmp_type" => Some(json!(be_number(key))),
        "ifname" => Some(ifname_value(key)),
        "ct_state" => ConntrackState::from_value(ne_u32(key)).map(|s| json!(s.as_str())),
        _ => None,
    };

    value.ok_or_else(|| {
        Error::NfTablesCompile(format!("cannot render {} set element {:?}", key_type, key))
    })
}

fn key_space_end(key_type: &str) -> Value {
    match key_type {
        "ipv4_addr" => json!(Ipv4Addr::BROADCAST.to_string()),
        "ipv6_addr" => json!(Ipv6Addr::from(u128::MAX).to_string()),
        _ => json!(u16::MAX),
    }
}

/// Set elements; interval pairs become ranges
pub(super) fn set_elements(set: &NfSetDef) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    let mut elements = set.elements.iter().peekable();

    while let Some(SetElement { key, interval_end }) = elements.next() {
        if *interval_end {
            continue;
        }

        let start = element_value(set.key_type, key)?;

        if !set.interval {
            values.push(start);
            continue;
        }

        let end = match elements.peek() {
            Some(next) if next.interval_end => {
                let last = predecessor(&next.key);
                elements.next();

                if last == *key {
                    values.push(start);
                    continue;
                }

                element_value(set.key_type, &last)?
            }
            _ => key_space_end(set.key_type),
        };

        values.push(json!({ "range": [start, end] }));
    }

    Ok(values)
}

fn set_object(table: &NfTableRef, chain: &str, set: &NfSetDef) -> Result<Value> {
    let mut object = json!({
        "family": family_name(table.family),
        "table": table.name,
        "name": set_name(chain, &set.name),
        "type": set.key_type,
    });

    if set.interval {
        object["flags"] = json!(["interval"]);
    }

    let elements = set_elements(set)?;
    if !elements.is_empty() {
        object["elem"] = Value::Array(elements);
    }

    Ok(object)
}

// =============================================================================
// Rules
// =============================================================================

/// How the value in the register renders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    NfProto,
    L4Proto,
    IfName,
    Mark,
    CtState,
    Address,
    Port,
    MaxSeg,
    Number,
}

fn operand_value(operand: Operand, data: &[u8]) -> Result<Value> {
    let value = match operand {
        Operand::NfProto => match data.first().copied() {
            Some(NFPROTO_IPV4) => json!("ipv4"),
            Some(NFPROTO_IPV6) => json!("ipv6"),
            other => {
                return Err(Error::NfTablesCompile(format!(
                    "unknown nfproto {:?}",
                    other
                )))
            }
        },
        Operand::IfName => ifname_value(data),
        Operand::Mark | Operand::CtState => json!(ne_u32(data)),
        Operand::Address => ip_value(data).ok_or_else(|| {
            Error::NfTablesCompile(format!("address of {} bytes", data.len()))
        })?,
        Operand::L4Proto | Operand::Port | Operand::MaxSeg | Operand::Number => {
            json!(be_number(data))
        }
    };

    Ok(value)
}

fn meta_name(key: MetaKey) -> &'static str {
    match key {
        MetaKey::NfProto => "nfproto",
        MetaKey::L4Proto => "l4proto",
        MetaKey::IifName => "iifname",
        MetaKey::OifName => "oifname",
        MetaKey::Mark => "mark",
    }
}

fn meta_operand(key: MetaKey) -> Operand {
    match key {
        MetaKey::NfProto => Operand::NfProto,
        MetaKey::L4Proto => Operand::L4Proto,
        MetaKey::IifName | MetaKey::OifName => Operand::IfName,
        MetaKey::Mark => Operand::Mark,
    }
}

fn payload(base: PayloadBase, offset: u32, len: u32) -> (Value, Operand) {
    let named = |protocol: &str, field: &str| json!({ "payload": { "protocol": protocol, "field": field } });

    match (base, offset, len) {
        (PayloadBase::NetworkHeader, 12, 4) => (named("ip", "saddr"), Operand::Address),
        (PayloadBase::NetworkHeader, 16, 4) => (named("ip", "daddr"), Operand::Address),
        (PayloadBase::NetworkHeader, 8, 16) => (named("ip6", "saddr"), Operand::Address),
        (PayloadBase::NetworkHeader, 24, 16) => (named("ip6", "daddr"), Operand::Address),
        (PayloadBase::TransportHeader, 0, 2) => (named("th", "sport"), Operand::Port),
        (PayloadBase::TransportHeader, 2, 2) => (named("th", "dport"), Operand::Port),
        (PayloadBase::TransportHeader, 13, 1) => (named("tcp", "flags"), Operand::Number),
        (base, offset, len) => {
            let base = match base {
                PayloadBase::NetworkHeader => "nh",
                PayloadBase::TransportHeader => "th",
            };

            (
                json!({ "payload": { "base": base, "offset": offset * 8, "len": len * 8 } }),
                Operand::Number,
            )
        }
    }
}

fn tcp_option(option: u8) -> Result<Value> {
    if option != TCPOPT_MAXSEG {
        return Err(Error::NfTablesCompile(format!("tcp option {}", option)));
    }

    Ok(json!({ "tcp option": { "name": "maxseg", "field": "size" } }))
}

fn cmp_op(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "==",
        CmpOp::Neq => "!=",
        CmpOp::Gt => ">",
    }
}

fn missing_load(what: &str) -> Error {
    Error::NfTablesCompile(format!("{} without a loaded register", what))
}

/// Render one rule's register-level expressions as JSON statements
pub(super) fn rule_statements(chain: &str, exprs: &[Expr]) -> Result<Vec<Value>> {
    let mut statements = Vec::new();
    let mut loaded: Option<(Value, Operand)> = None;
    let mut immediate: Option<Vec<u8>> = None;

    for expr in exprs {
        match expr {
            Expr::Meta {
                key,
                source_register: false,
                ..
            } => {
                loaded = Some((json!({ "meta": { "key": meta_name(*key) } }), meta_operand(*key)));
            }
            Expr::Meta {
                key,
                source_register: true,
                ..
            } => {
                let (value, _) = loaded.take().ok_or_else(|| missing_load("meta set"))?;
                statements.push(json!({
                    "mangle": { "key": { "meta": { "key": meta_name(*key) } }, "value": value }
                }));
            }
            Expr::CtState { .. } => {
                loaded = Some((json!({ "ct": { "key": "state" } }), Operand::CtState));
            }
            Expr::Payload {
                base, offset, len, ..
            } => {
                loaded = Some(payload(*base, *offset, *len));
            }
            Expr::TcpOption {
                option,
                write: false,
                ..
            } => {
                loaded = Some((tcp_option(*option)?, Operand::MaxSeg));
            }
            Expr::TcpOption {
                option,
                write: true,
                ..
            } => {
                let data = immediate.take().ok_or_else(|| missing_load("tcp option set"))?;
                statements.push(json!({
                    "mangle": { "key": tcp_option(*option)?, "value": be_number(&data) }
                }));
            }
            Expr::Bitwise { mask, xor, .. } => {
                let (value, operand) = loaded.take().ok_or_else(|| missing_load("bitwise"))?;
                let masked = json!({ "&": [value, operand_value(operand, mask)?] });

                let result = if xor.iter().all(|b| *b == 0) {
                    masked
                } else {
                    json!({ "^": [masked, operand_value(operand, xor)?] })
                };

                loaded = Some((result, operand));
            }
            Expr::Cmp { op, data, .. } => {
                let (left, operand) = loaded.clone().ok_or_else(|| missing_load("cmp"))?;
                statements.push(json!({
                    "match": { "op": cmp_op(*op), "left": left, "right": operand_value(operand, data)? }
                }));
            }
            Expr::Lookup {
                set_name: name,
                invert,
                ..
            } => {
                let (left, _) = loaded.clone().ok_or_else(|| missing_load("lookup"))?;
                let op = if *invert { "!=" } else { "==" };
                statements.push(json!({
                    "match": { "op": op, "left": left, "right": format!("@{}", set_name(chain, name)) }
                }));
            }
            Expr::Limit { rate, burst } => {
                statements.push(json!({
                    "limit": { "rate": rate, "per": "second", "burst": burst }
                }));
            }
            Expr::Immediate { data, .. } => immediate = Some(data.clone()),
            Expr::Counter => statements.push(json!({ "counter": { "packets": 0, "bytes": 0 } })),
            Expr::Verdict(Verdict::Accept) => statements.push(json!({ "accept": null })),
            Expr::Verdict(Verdict::Drop) => statements.push(json!({ "drop": null })),
        }
    }

    Ok(statements)
}

// =============================================================================
// Batches
// =============================================================================

/// Render a batch against the chains currently applied
pub(super) fn render_batch(
    batch: &NfBatch,
    current: &BTreeMap<NfTableRef, Vec<NfChainState>>,
) -> Result<Vec<Value>> {
    let mut commands = Vec::new();

    for op in &batch.ops {
        match op {
            NfOp::AddTable(table) => {
                commands.push(json!({ "add": { "table": table_object(table) } }));
            }
            NfOp::DeleteTable(table) => {
                commands.push(json!({ "delete": { "table": table_object(table) } }));
            }
            NfOp::AddChain { table, chain } => {
                commands.push(json!({ "add": { "chain": chain_object(table, chain) } }));
            }
            NfOp::DeleteChain { table, chain } => {
                commands.push(json!({ "flush": { "chain": chain_ref(table, chain) } }));
                commands.push(json!({ "delete": { "chain": chain_ref(table, chain) } }));

                let sets = current
                    .get(table)
                    .and_then(|chains| chains.iter().find(|c| c.chain.name == *chain))
                    .map(|c| c.sets.as_slice())
                    .unwrap_or_default();

                for set in sets {
                    commands.push(json!({ "delete": { "set": {
                        "family": family_name(table.family),
                        "table": table.name,
                        "name": set_name(chain, &set.name),
                    } } }));
                }
            }
            NfOp::AddSet { table, chain, set } => {
                commands.push(json!({ "add": { "set": set_object(table, chain, set)? } }));
            }
            NfOp::AddRule {
                table,
                chain,
                exprs,
            } => {
                commands.push(json!({ "add": { "rule": {
                    "family": family_name(table.family),
                    "table": table.name,
                    "chain": chain,
                    "expr": rule_statements(chain, exprs)?,
                } } }));
            }
        }
    }

    Ok(commands)
}

/// Chains after the batch is applied
fn apply_to_cache(tables: &mut BTreeMap<NfTableRef, Vec<NfChainState>>, batch: &NfBatch) {
    for op in &batch.ops {
        match op {
            NfOp::AddTable(table) => {
                tables.entry(table.clone()).or_default();
            }
            NfOp::DeleteTable(table) => {
                tables.remove(table);
            }
            NfOp::AddChain { table, chain } => {
                let chains = tables.entry(table.clone()).or_default();

                if !chains.iter().any(|c| c.chain.name == chain.name) {
                    chains.push(NfChainState {
                        chain: chain.clone(),
                        rules: Vec::new(),
                        sets: Vec::new(),
                    });
                }
            }
            NfOp::DeleteChain { table, chain } => {
                if let Some(chains) = tables.get_mut(table) {
                    chains.retain(|c| c.chain.name != *chain);
                }
            }
            NfOp::AddSet { table, chain, set } => {
                let state = tables
                    .get_mut(table)
                    .and_then(|chains| chains.iter_mut().find(|c| c.chain.name == *chain));

                if let Some(state) = state {
                    state.sets.push(set.clone());
                }
            }
            NfOp::AddRule {
                table,
                chain,
                exprs,
            } => {
                let state = tables
                    .get_mut(table)
                    .and_then(|chains| chains.iter_mut().find(|c| c.chain.name == *chain));

                if let Some(state) = state {
                    state.rules.push(exprs.clone());
                }
            }
        }
    }
}

// =============================================================================
// Ruleset Listing
// =============================================================================

fn ruleset_objects(ruleset: &Value) -> impl Iterator<Item = &Value> {
    ruleset
        .get("nftables")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

pub(super) fn tables_in(ruleset: &Value) -> Vec<NfTableRef> {
    ruleset_objects(ruleset)
        .filter_map(|object| object.get("table"))
        .filter_map(|table| {
            let family = family_from_name(table.get("family")?.as_str()?)?;
            let name = table.get("name")?.as_str()?;
            Some(NfTableRef::new(family, name))
        })
        .collect()
}

/// Chains of a table with the sets named after them; rules are not decoded
pub(super) fn chains_in(ruleset: &Value, table: &NfTableRef) -> Vec<NfChainState> {
    let family = family_name(table.family);
    let in_table = |object: &Value| {
        object.get("family").and_then(Value::as_str) == Some(family)
            && object.get("table").and_then(Value::as_str) == Some(table.name.as_str())
    };

    let set_names: Vec<String> = ruleset_objects(ruleset)
        .filter_map(|object| object.get("set"))
        .filter(|set| in_table(set))
        .filter_map(|set| set.get("name")?.as_str().map(str::to_string))
        .collect();

    ruleset_objects(ruleset)
        .filter_map(|object| object.get("chain"))
        .filter(|chain| in_table(chain))
        .filter_map(|chain| {
            let name = chain.get("name")?.as_str()?.to_string();
            let hook = chain
                .get("hook")
                .and_then(Value::as_str)
                .and_then(|h| h.parse::<ChainHook>().ok());

            let def = NfChainDef {
                chain_type: chain
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(|t| t.parse::<ChainType>().ok())
                    .unwrap_or_default(),
                hook,
                priority: ChainPriority(
                    chain.get("prio").and_then(Value::as_i64).unwrap_or(0) as i32,
                ),
                policy: chain
                    .get("policy")
                    .and_then(Value::as_str)
                    .and_then(|p| p.parse::<Verdict>().ok())
                    .unwrap_or_default(),
                name: name.clone(),
            };

            let prefix = format!("{}_", name);
            let sets = set_names
                .iter()
                .filter(|set| set.starts_with(&prefix))
                .map(|set| NfSetDef {
                    id: 0,
                    // set_name() re-adds the chain prefix
                    name: set[prefix.len()..].to_string(),
                    key_type: "",
                    interval: false,
                    elements: Vec::new(),
                })
                .collect();

            Some(NfChainState {
                chain: def,
                rules: Vec::new(),
                sets,
            })
        })
        .collect()
}

fn nft_error(op: &str, err: impl std::fmt::Display) -> Error {
    Error::Kernel {
        op: op.to_string(),
        reason: err.to_string(),
    }
}

async fn current_ruleset() -> Result<Value> {
    tokio::task::spawn_blocking(|| -> Result<Value> {
        let ruleset = helper::get_current_ruleset(None, None)
            .map_err(|e| nft_error("list ruleset", e))?;

        Ok(serde_json::to_value(&ruleset)?)
    })
    .await
    .map_err(|e| Error::Internal(format!("nft worker failed: {}", e)))?
}

// =============================================================================
// Port
// =============================================================================

#[async_trait]
impl NfTablesBackend for LinuxKernel {
    async fn list_tables(&self) -> Result<Vec<NfTableRef>> {
        Ok(tables_in(&current_ruleset().await?))
    }

    async fn list_chains(&self, table: &NfTableRef) -> Result<Vec<NfChainState>> {
        if let Some(chains) = self.nft.tables.lock().get(table) {
            return Ok(chains.clone());
        }

        let ruleset = current_ruleset().await?;

        if !tables_in(&ruleset).contains(table) {
            return Err(Error::KernelNotFound {
                op: format!("list chains {}", table.name),
            });
        }

        let chains = chains_in(&ruleset, table);
        self.nft
            .tables
            .lock()
            .insert(table.clone(), chains.clone());

        Ok(chains)
    }

    async fn apply(&self, batch: NfBatch) -> Result<()> {
        let mut next = self.nft.tables.lock().clone();
        let commands = render_batch(&batch, &next)?;
        apply_to_cache(&mut next, &batch);

        let count = commands.len();
        let document: Nftables = serde_json::from_value(json!({ "nftables": commands }))?;

        tokio::task::spawn_blocking(move || {
            helper::apply_ruleset(&document, None, None).map_err(|e| nft_error("apply nftables", e))
        })
        .await
        .map_err(|e| Error::Internal(format!("nft worker failed: {}", e)))??;

        *self.nft.tables.lock() = next;

        debug!(commands = count, "nftables batch applied");
        Ok(())
    }
}
