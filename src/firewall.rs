//! Firewall rule injector: one instance per monitored pod group.
//!
//! The backend only lists rules by numeric id, so the ledger kept here is the single record of
//! which rule belongs to which parsed policy. Every mutation goes through it, under the
//! instance lock.

pub mod manager;

use crate::{
    priority::{OrderKey, calculate_default_action, calculate_policy_offset, dir_to_chain},
    sink::{self, Chain, ChainRule, RuleAction, RuleSink, next_rule_id},
    types::{Direction, ParsedPolicy, ParsedRules, Provider},
};
use log::{debug, error, info};
use std::cmp::Reverse;
use std::collections::BTreeMap as Map;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("firewall {0} does not exist anymore")]
    Gone(String),
    #[error(transparent)]
    Sink(#[from] sink::Error),
    #[error("{policy}: {count} rules could not be removed")]
    Leftovers { policy: String, count: usize },
}

/// Result of an injection, per direction.
#[derive(Debug)]
pub struct EnforceOutcome {
    pub incoming: sink::Result<()>,
    pub outgoing: sink::Result<()>,
}

impl EnforceOutcome {
    pub fn is_ok(&self) -> bool {
        self.incoming.is_ok() && self.outgoing.is_ok()
    }
}

struct Applied {
    key: OrderKey,
    policy: Arc<ParsedPolicy>,
    /// rules the policy must have in the chain
    rules: Vec<ChainRule>,
}

#[derive(Default)]
struct Ledger {
    /// rules actually in the backend, per parsed policy name
    rules: Map<String, ParsedRules>,
    /// applied parsed policies per direction, in evaluation order
    applied: Map<Direction, Vec<Applied>>,
    defaults: Map<Chain, RuleAction>,
}

impl Ledger {
    fn recorded(&self, name: &str, dir: Direction) -> &[ChainRule] {
        (self.rules.get(name))
            .map(|r| r.get(dir).as_slice())
            .unwrap_or_default()
    }

    fn record(&mut self, name: &str, dir: Direction, rules: Vec<ChainRule>) {
        if rules.is_empty() {
            return;
        }
        let entry = self.rules.entry(name.to_string()).or_default();
        entry.get_mut(dir).extend(rules);
    }

    /// Follows the backend after rule `id` was deleted from the chain of `dir`: the rule leaves
    /// its record and the rules after it move down one id.
    fn deleted(&mut self, dir: Direction, id: u32) {
        for recorded in self.rules.values_mut() {
            let rules = recorded.get_mut(dir);
            rules.retain(|r| r.id != id);
            for rule in rules.iter_mut().filter(|r| r.id > id) {
                rule.id -= 1;
            }
        }
        self.rules.retain(|_, recorded| !recorded.is_empty());
    }

    /// index of the first applied policy whose rules are not exactly in the backend.
    fn first_out_of_sync(&self, dir: Direction) -> Option<usize> {
        let entries = self.applied.get(&dir)?;
        (entries.iter()).position(|e| !same_rules(self.recorded(&e.policy.name, dir), &e.rules))
    }
}

fn same_rules(a: &[ChainRule], b: &[ChainRule]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_match(b))
}

/// true if `small` is `big` with some rules removed.
fn is_subsequence(small: &[ChainRule], big: &[ChainRule]) -> bool {
    let mut big = big.iter();
    small.iter().all(|s| big.any(|b| b.same_match(s)))
}

fn parent_prefix(provider: Provider, parent: &str) -> String {
    format!("{provider}:{parent}#")
}

pub struct DeployedFirewall<S> {
    name: String,
    sink: Arc<S>,
    ledger: Mutex<Ledger>,
}

impl<S: RuleSink> DeployedFirewall<S> {
    /// Creates the backend firewall, or empties it if it already exists, with forwarding
    /// defaults.
    pub async fn create(name: String, sink: Arc<S>) -> Result<Self> {
        if sink.firewall_exists(&name).await? {
            info!("{name}: firewall already exists, clearing it");
            for chain in Chain::ALL {
                let mut rules = sink.read_chain(&name, chain).await?;
                rules.retain(|r| !r.is_default_policy());
                rules.sort_by_key(|r| Reverse(r.id));
                for rule in rules {
                    sink.delete_rule(&name, chain, rule.id).await?;
                }
            }
        } else {
            sink.create_firewall(&name).await?;
        }

        let mut ledger = Ledger::default();
        for chain in Chain::ALL {
            sink.set_default_action(&name, chain, RuleAction::Forward).await?;
            sink.apply_rules(&name, chain).await?;
            ledger.defaults.insert(chain, RuleAction::Forward);
        }

        info!("{name}: firewall ready");
        Ok(Self {
            name,
            sink,
            ledger: Mutex::new(ledger),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn check_alive(&self) -> Result<()> {
        if self.sink.firewall_exists(&self.name).await? {
            Ok(())
        } else {
            error!("{}: firewall is gone, not touching it", self.name);
            Err(Error::Gone(self.name.clone()))
        }
    }

    /// Appends rules to the chain of `dir` with fresh ids, returning them as injected.
    async fn inject(&self, dir: Direction, rules: &[ChainRule]) -> sink::Result<Vec<ChainRule>> {
        if rules.is_empty() {
            return Ok(vec![]);
        }
        let chain = dir_to_chain(dir);
        let fw = &self.name;

        let current = (self.sink.read_chain(fw, chain).await)
            .inspect_err(|e| error!("{fw}: {chain}: failed to read chain: {e}"))?;

        let first_id = next_rule_id(&current);
        let rules: Vec<_> = (rules.iter().zip(first_id..))
            .map(|(r, id)| ChainRule { id, ..r.clone() })
            .collect();

        (self.sink.append_rules(fw, chain, &rules).await).inspect_err(|e| {
            error!(
                "{fw}: {chain}: failed to inject {} rules from #{first_id}: {e}",
                rules.len()
            )
        })?;

        if let Err(e) = self.sink.apply_rules(fw, chain).await {
            error!("{fw}: {chain}: failed to apply rules: {e}");
        }

        debug!("{fw}: {chain}: injected {} rules from #{first_id}", rules.len());
        Ok(rules)
    }

    /// Deletes rules one by one, highest id first, returning those that could not be deleted
    /// (with their ids as they are after the deletions). The ledger follows the renumbering.
    async fn remove(&self, ledger: &mut Ledger, dir: Direction, rules: &[ChainRule]) -> Vec<ChainRule> {
        if rules.is_empty() {
            return vec![];
        }
        let chain = dir_to_chain(dir);
        let fw = &self.name;

        let mut rules = rules.to_vec();
        rules.sort_by_key(|r| Reverse(r.id));

        let mut deleted = 0;
        let mut failed: Vec<ChainRule> = Vec::new();
        for rule in rules {
            if let Err(e) = self.sink.delete_rule(fw, chain, rule.id).await {
                error!("{fw}: {chain}: failed to delete rule {rule}: {e}");
                failed.push(rule);
                continue;
            }
            deleted += 1;
            ledger.deleted(dir, rule.id);
            for left in failed.iter_mut().filter(|r| r.id > rule.id) {
                left.id -= 1;
            }
        }

        if deleted != 0
            && let Err(e) = self.sink.apply_rules(fw, chain).await
        {
            error!("{fw}: {chain}: failed to apply rules: {e}");
        }
        failed.reverse();
        failed
    }

    /// Appends rules at the end of both chains and records them under `name` (next to any rules
    /// already recorded for it). Directions succeed or fail independently.
    pub async fn enforce_policy(&self, name: &str, rules: &ParsedRules) -> Result<EnforceOutcome> {
        let mut ledger = self.ledger.lock().await;
        self.check_alive().await?;

        let (incoming, outgoing) = futures::join!(
            self.inject(Direction::Incoming, &rules.incoming),
            self.inject(Direction::Outgoing, &rules.outgoing),
        );

        let mut outcome = EnforceOutcome {
            incoming: Ok(()),
            outgoing: Ok(()),
        };
        match incoming {
            Ok(injected) => ledger.record(name, Direction::Incoming, injected),
            Err(e) => outcome.incoming = Err(e),
        }
        match outgoing {
            Ok(injected) => ledger.record(name, Direction::Outgoing, injected),
            Err(e) => outcome.outgoing = Err(e),
        }
        Ok(outcome)
    }

    /// Removes every rule recorded for a parsed policy. Rules that fail to be deleted stay
    /// recorded.
    pub async fn cease_policy(&self, name: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        self.check_alive().await?;

        for entries in ledger.applied.values_mut() {
            entries.retain(|e| e.policy.name != name);
        }

        let ceased = self.cease_locked(&mut ledger, name).await;
        let defaults = self.update_defaults_locked(&mut ledger).await;
        ceased.and(defaults)
    }

    async fn cease_locked(&self, ledger: &mut Ledger, name: &str) -> Result<()> {
        let Some(recorded) = ledger.rules.get(name).cloned() else {
            return Ok(());
        };

        let mut count = 0;
        for dir in Direction::ALL {
            count += self.remove(ledger, dir, recorded.get(dir)).await.len();
        }
        if count == 0 {
            debug!("{}: {name}: ceased", self.name);
            return Ok(());
        }

        // what failed is still recorded under `name`
        Err(Error::Leftovers {
            policy: name.to_string(),
            count,
        })
    }

    /// Low-level removal of rules, by id, from the chain of `dir`. Returns the rules that failed
    /// to be deleted. Deleted rules leave the records they belonged to.
    pub async fn remove_rules(&self, dir: Direction, rules: &[ChainRule]) -> Vec<ChainRule> {
        let mut ledger = self.ledger.lock().await;
        self.remove(&mut ledger, dir, rules).await
    }

    /// Puts a parsed policy, with its resolved rules, at its place in the chain. Rules already in
    /// place are kept when possible.
    pub async fn apply(&self, policy: Arc<ParsedPolicy>, rules: Vec<ChainRule>) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        self.check_alive().await?;

        let dir = policy.direction;
        let key = OrderKey::from(policy.as_ref());

        let entries = ledger.applied.entry(dir).or_default();
        let existing = entries.iter().position(|e| e.policy.name == policy.name);

        if let Some(i) = existing
            && entries[i].key == key
            && is_subsequence(&rules, &entries[i].rules)
            && ledger.first_out_of_sync(dir).is_none()
        {
            return self.shrink_locked(&mut ledger, i, policy, rules).await;
        }

        let entries = ledger.applied.entry(dir).or_default();
        let mut start = usize::MAX;
        if let Some(i) = existing {
            entries.remove(i);
            start = i;
        }

        let keys: Vec<_> = entries.iter().map(|e| e.key.clone()).collect();
        let at = calculate_policy_offset(&key, &keys);
        entries.insert(at, Applied { key, policy, rules });
        start = start.min(at);

        if let Some(i) = ledger.first_out_of_sync(dir) {
            start = start.min(i);
        }

        let spliced = self.resplice_locked(&mut ledger, dir, start).await;
        let defaults = self.update_defaults_locked(&mut ledger).await;
        spliced.and(defaults)
    }

    /// Same place, fewer rules: remove only what's gone.
    async fn shrink_locked(
        &self,
        ledger: &mut Ledger,
        index: usize,
        policy: Arc<ParsedPolicy>,
        rules: Vec<ChainRule>,
    ) -> Result<()> {
        let dir = policy.direction;
        let name = policy.name.clone();

        let stale: Vec<_> = (ledger.recorded(&name, dir).iter())
            .filter(|r| !rules.iter().any(|n| n.same_match(r)))
            .cloned()
            .collect();

        if let Some(entries) = ledger.applied.get_mut(&dir) {
            entries[index].policy = policy;
            entries[index].rules = rules;
        }

        if stale.is_empty() {
            return Ok(());
        }
        debug!("{}: {name}: removing {} stale rules", self.name, stale.len());

        let failed = self.remove(ledger, dir, &stale).await;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Leftovers {
                policy: name,
                count: failed.len(),
            })
        }
    }

    /// Re-injects the applied policies of `dir` from index `start`, so their rules come after
    /// the ones before `start`.
    async fn resplice_locked(&self, ledger: &mut Ledger, dir: Direction, start: usize) -> Result<()> {
        let tail: Vec<(String, Vec<ChainRule>)> = (ledger.applied.get(&dir).into_iter().flatten())
            .skip(start)
            .map(|e| (e.policy.name.clone(), e.rules.clone()))
            .collect();

        if tail.len() > 1 {
            debug!(
                "{}: {}: re-injecting {} policies from position {start}",
                self.name,
                dir_to_chain(dir),
                tail.len()
            );
        }

        let mut result = Ok(());
        for (name, _) in &tail {
            if let Err(e) = self.cease_locked(ledger, name).await {
                result = Err(e);
            }
        }
        // appending now would put rules before leftovers of the tail; retried later
        result?;

        for (name, rules) in &tail {
            let injected = self.inject(dir, rules).await?;
            ledger.record(name, dir, injected);
        }
        Ok(())
    }

    async fn update_defaults_locked(&self, ledger: &mut Ledger) -> Result<()> {
        let restricted: Vec<Direction> = (ledger.applied.iter())
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(dir, _)| *dir)
            .collect();

        let mut result = Ok(());
        for dir in Direction::ALL {
            let chain = dir_to_chain(dir);
            let action = calculate_default_action(dir, restricted.iter().copied());
            if ledger.defaults.get(&chain) == Some(&action) {
                continue;
            }

            let set = async {
                self.sink.set_default_action(&self.name, chain, action).await?;
                self.sink.apply_rules(&self.name, chain).await
            };
            match set.await {
                Ok(()) => {
                    info!("{}: {chain}: default action is now {action}", self.name);
                    ledger.defaults.insert(chain, action);
                }
                Err(e) => {
                    error!("{}: {chain}: failed to set default action to {action}: {e}", self.name);
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Ceases every parsed policy of a parent policy.
    pub async fn cease_parent(&self, provider: Provider, parent: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        self.check_alive().await?;

        let prefix = parent_prefix(provider, parent);
        for entries in ledger.applied.values_mut() {
            entries.retain(|e| !e.policy.name.starts_with(&prefix));
        }

        let names: Vec<_> = (ledger.rules.keys())
            .filter(|n| n.starts_with(&prefix))
            .cloned()
            .collect();

        let mut result = Ok(());
        for name in names {
            if let Err(e) = self.cease_locked(&mut ledger, &name).await {
                result = Err(e);
            }
        }

        let defaults = self.update_defaults_locked(&mut ledger).await;
        result.and(defaults)
    }

    /// Parsed policies currently applied, both directions.
    pub async fn applied_policies(&self) -> Vec<Arc<ParsedPolicy>> {
        let ledger = self.ledger.lock().await;
        (ledger.applied.values().flatten())
            .map(|e| e.policy.clone())
            .collect()
    }

    /// true if anything of a parent policy is applied or still recorded.
    pub async fn implements_parent(&self, provider: Provider, parent: &str) -> bool {
        let prefix = parent_prefix(provider, parent);
        let ledger = self.ledger.lock().await;
        ledger.rules.keys().any(|n| n.starts_with(&prefix))
            || (ledger.applied.values().flatten()).any(|e| e.policy.name.starts_with(&prefix))
    }

    /// Rules recorded for a parsed policy.
    pub async fn recorded(&self, name: &str) -> Option<ParsedRules> {
        self.ledger.lock().await.rules.get(name).cloned()
    }

    /// Deletes the backend firewall.
    pub async fn destroy(&self) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        (self.sink.delete_firewall(&self.name).await)
            .inspect_err(|e| error!("{}: failed to destroy firewall: {e}", self.name))?;
        *ledger = Ledger::default();
        info!("{}: firewall destroyed", self.name);
        Ok(())
    }
}
