//! NfTables Chain Controller
//!
//! Rebuilds the node's `inet` table from the `NfTablesChain` resources in a
//! single transaction. Rule compilation is deterministic, so the desired
//! table is compared with what the kernel reports first and an unchanged
//! table is left alone.

use super::{pass_done, KernelHandle};
use crate::adapters::nftables::{
    compile, Expr, NfBatch, NfChainDef, NfChainState, NfFamily, NfOp, NfSetDef, NfTableRef,
};
use crate::error::{Result, ResultExt};
use crate::resources::nethelpers::{ChainPriority, ChainType, Verdict};
use crate::resources::{Kind, Namespace, NfTablesChain};
use crate::runtime::{Controller, ControllerRuntime, Input, Output};
use async_trait::async_trait;
use tracing::{debug, info};

/// Table and chain that make iptables-nft pick the nftables backend
pub const IPTABLES_HINT_TABLE: &str = "mangle";
pub const IPTABLES_HINT_CHAIN: &str = "KUBE-IPTABLES-HINT";

/// Syncs `NfTablesChain` resources into the kernel
pub struct NfTablesChainController {
    kernel: KernelHandle,
    table: NfTableRef,
}

/// Compile a chain resource; anonymous set ids continue from `next_set`
pub(crate) fn compile_chain(
    name: &str,
    chain: &NfTablesChain,
    next_set: &mut u32,
) -> Result<NfChainState> {
    let mut state = NfChainState {
        chain: NfChainDef {
            name: name.to_string(),
            chain_type: chain.chain_type,
            hook: Some(chain.hook),
            priority: chain.priority,
            policy: chain.policy,
        },
        rules: Vec::new(),
        sets: Vec::new(),
    };

    for (idx, rule) in chain.rules.iter().enumerate() {
        let compiled = compile(rule).context(format!("chain {} rule {}", name, idx))?;
        let base = *next_set;

        for (offset, set) in compiled.sets.iter().enumerate() {
            state
                .sets
                .push(NfSetDef::anonymous(base + offset as u32, set));
        }

        *next_set += compiled.sets.len() as u32;

        for mut exprs in compiled.rules {
            for expr in &mut exprs {
                if let Expr::Lookup {
                    set_id, set_name, ..
                } = expr
                {
                    *set_id += base;
                    *set_name = format!("__set{}", set_id);
                }
            }

            state.rules.push(exprs);
        }
    }

    Ok(state)
}

impl NfTablesChainController {
    pub fn new(kernel: KernelHandle, table: String) -> Self {
        Self {
            kernel,
            table: NfTableRef::new(NfFamily::Inet, table),
        }
    }

    pub(crate) fn desired(&self, rt: &ControllerRuntime) -> Result<Vec<NfChainState>> {
        let mut next_set = 0;

        rt.list::<NfTablesChain>(Namespace::Network)
            .into_iter()
            .filter(|r| !r.metadata.is_tearing_down())
            .map(|r| compile_chain(&r.metadata.id, &r.spec, &mut next_set))
            .collect()
    }

    /// Stub chain, added once
    async fn iptables_hint(&self, batch: &mut NfBatch) -> Result<()> {
        let hint = NfTableRef::new(NfFamily::Ip, IPTABLES_HINT_TABLE);
        let tables = self.kernel.list_tables().await.context("list tables")?;

        if tables.contains(&hint) {
            let chains = self.kernel.list_chains(&hint).await.context("list chains")?;

            if chains.iter().any(|c| c.chain.name == IPTABLES_HINT_CHAIN) {
                return Ok(());
            }
        } else {
            batch.push(NfOp::AddTable(hint.clone()));
        }

        batch.push(NfOp::AddChain {
            table: hint,
            chain: NfChainDef {
                name: IPTABLES_HINT_CHAIN.to_string(),
                chain_type: ChainType::Filter,
                hook: None,
                priority: ChainPriority::FILTER,
                policy: Verdict::Accept,
            },
        });

        Ok(())
    }

    pub(crate) async fn reconcile(&self, rt: &mut ControllerRuntime) -> Result<()> {
        let desired = self.desired(rt)?;

        let mut batch = NfBatch::default();
        self.iptables_hint(&mut batch).await?;

        let tables = self.kernel.list_tables().await.context("list tables")?;
        let current = if tables.contains(&self.table) {
            self.kernel
                .list_chains(&self.table)
                .await
                .context("list chains")?
        } else {
            batch.push(NfOp::AddTable(self.table.clone()));
            Vec::new()
        };

        if batch.is_empty() && current == desired {
            debug!(table = %self.table.name, "nftables up to date");
            return Ok(());
        }

        for chain in &current {
            batch.push(NfOp::DeleteChain {
                table: self.table.clone(),
                chain: chain.chain.name.clone(),
            });
        }

        let mut rules = 0;

        for chain in desired {
            let name = chain.chain.name.clone();

            batch.push(NfOp::AddChain {
                table: self.table.clone(),
                chain: chain.chain,
            });

            for set in chain.sets {
                batch.push(NfOp::AddSet {
                    table: self.table.clone(),
                    chain: name.clone(),
                    set,
                });
            }

            rules += chain.rules.len();

            for exprs in chain.rules {
                batch.push(NfOp::AddRule {
                    table: self.table.clone(),
                    chain: name.clone(),
                    exprs,
                });
            }
        }

        self.kernel.apply(batch).await.context("apply nftables")?;

        info!(table = %self.table.name, rules, "nftables updated");

        Ok(())
    }
}

#[async_trait]
impl Controller for NfTablesChainController {
    fn name(&self) -> String {
        "NfTablesChainController".to_string()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(Namespace::Network, Kind::NfTablesChain)]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, rt: &mut ControllerRuntime) -> Result<()> {
        while rt.event().await {
            self.reconcile(rt).await?;
            pass_done(rt);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::NfTablesBackend;
    use crate::controllers::nftables_chain_config::ingress_chain;
    use crate::controllers::testutil;
    use crate::machine::MachineConfig;
    use crate::resources::nethelpers::{ChainHook, MatchOperator, Protocol};
    use crate::resources::{
        NfTablesAddressMatch, NfTablesIfNameMatch, NfTablesLayer4Match, NfTablesPortMatch,
        NfTablesRule, PortRange,
    };

    fn chain() -> NfTablesChain {
        NfTablesChain {
            chain_type: ChainType::Filter,
            hook: ChainHook::Input,
            priority: ChainPriority::MANGLE.offset(10),
            policy: Verdict::Drop,
            rules: vec![
                NfTablesRule {
                    match_iif_name: Some(NfTablesIfNameMatch {
                        interface_names: vec!["lo".into(), "kubespan".into()],
                        operator: MatchOperator::Equal,
                    }),
                    verdict: Some(Verdict::Accept),
                    ..Default::default()
                },
                NfTablesRule {
                    match_source_address: Some(NfTablesAddressMatch {
                        include_subnets: vec!["10.0.0.0/8".parse().unwrap()],
                        ..Default::default()
                    }),
                    match_layer4: Some(NfTablesLayer4Match {
                        protocol: Protocol::Tcp,
                        match_destination_port: Some(NfTablesPortMatch {
                            ranges: vec![PortRange { lo: 10250, hi: 10250 }],
                        }),
                        ..Default::default()
                    }),
                    verdict: Some(Verdict::Accept),
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_compile_chain_assigns_table_wide_set_ids() {
        let mut next_set = 0;
        let compiled = compile_chain("ingress", &chain(), &mut next_set).unwrap();

        assert_eq!(next_set, 3);
        let names: Vec<&str> = compiled.sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["__set0", "__set1", "__set2"]);

        let lookups: Vec<(u32, String)> = compiled
            .rules
            .iter()
            .flatten()
            .filter_map(|e| match e {
                Expr::Lookup {
                    set_id, set_name, ..
                } => Some((*set_id, set_name.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            lookups,
            vec![
                (0, "__set0".to_string()),
                (1, "__set1".to_string()),
                (2, "__set2".to_string()),
            ]
        );

        // compiling again from the same offset is byte-identical
        let mut again = 0;
        assert_eq!(compile_chain("ingress", &chain(), &mut again).unwrap(), compiled);
    }

    #[tokio::test]
    async fn test_table_rebuilt_only_on_change() {
        let kernel = testutil::kernel();
        let controller = NfTablesChainController::new(kernel.clone(), "node-netd".into());
        let (state, mut rt) = testutil::runtime(&controller);

        state
            .create("NfTablesChainConfigController", Namespace::Network, "ingress", chain())
            .unwrap();

        controller.reconcile(&mut rt).await.unwrap();

        let hint = NfTableRef::new(NfFamily::Ip, IPTABLES_HINT_TABLE);
        let hint_chains = kernel.list_chains(&hint).await.unwrap();
        assert_eq!(hint_chains[0].chain.name, IPTABLES_HINT_CHAIN);

        let table = NfTableRef::new(NfFamily::Inet, "node-netd");
        let chains = kernel.list_chains(&table).await.unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].chain.policy, Verdict::Drop);
        assert_eq!(chains[0].chain.hook, Some(ChainHook::Input));
        assert_eq!(chains[0].rules.len(), 2);

        let writes = kernel.writes();
        controller.reconcile(&mut rt).await.unwrap();
        assert_eq!(kernel.writes(), writes);

        state
            .destroy::<NfTablesChain>("NfTablesChainConfigController", Namespace::Network, "ingress")
            .unwrap();
        controller.reconcile(&mut rt).await.unwrap();

        assert!(kernel.list_chains(&table).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_block_ingress() {
        let kernel = testutil::kernel();
        let controller = NfTablesChainController::new(kernel.clone(), "node-netd".into());
        let (state, mut rt) = testutil::runtime(&controller);

        let config = MachineConfig::from_yaml(
            r#"
machine: {}
networkRules:
  defaultAction: block
  rules:
    - name: kubelet
      portSelector:
        ports: [10250]
        protocol: tcp
      ingress:
        - subnet: 10.0.0.0/8
          except: 10.3.0.0/16
        - subnet: 192.168.0.0/16
"#,
        )
        .unwrap();

        state
            .create("NfTablesChainConfigController", Namespace::Network, "ingress", ingress_chain(&config))
            .unwrap();

        controller.reconcile(&mut rt).await.unwrap();

        let chains = kernel
            .list_chains(&NfTableRef::new(NfFamily::Inet, "node-netd"))
            .await
            .unwrap();
        let ingress = &chains[0];

        assert_eq!(ingress.chain.policy, Verdict::Drop);
        assert_eq!(
            ingress.rules.last().and_then(|r| r.last()),
            Some(&Expr::Verdict(Verdict::Accept))
        );
        assert!(ingress.sets.iter().all(|s| s.name.starts_with("__set")));
    }
}
