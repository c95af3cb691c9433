use super::{Chain, ChainRule, DEFAULT_POLICY, Error, Result, RuleAction, RuleSink};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::Mutex;

/// In-memory rule sink with failure injection. Rule ids behave like the polycube firewall's: they
/// are dense, a listing ends with the default action entry and a deletion renumbers the rules that
/// follow.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    firewalls: Map<String, Firewall>,
    fail_append: Set<Chain>,
    fail_delete: Set<u32>,
}

#[derive(Default, Clone)]
struct Firewall {
    chains: Map<Chain, ChainState>,
}

#[derive(Default, Clone)]
struct ChainState {
    default: Option<RuleAction>,
    rules: Vec<ChainRule>,
    applied: usize,
    appended: usize,
}

fn rejected(method: &'static str, path: String) -> Error {
    status_error(method, path, "rejected")
}

fn status_error(method: &'static str, path: String, body: &str) -> Error {
    Error::Status {
        method: method.into(),
        path,
        status: 500,
        body: body.into(),
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_append(&self, chain: Chain, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_append.insert(chain);
        } else {
            state.fail_append.remove(&chain);
        }
    }

    pub fn fail_delete(&self, id: u32, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_delete.insert(id);
        } else {
            state.fail_delete.remove(&id);
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().firewalls.contains_key(name)
    }

    pub fn firewall_names(&self) -> Vec<String> {
        self.state.lock().unwrap().firewalls.keys().cloned().collect()
    }

    pub fn rules(&self, name: &str, chain: Chain) -> Vec<ChainRule> {
        let state = self.state.lock().unwrap();
        (state.firewalls.get(name))
            .and_then(|fw| fw.chains.get(&chain))
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn default_action(&self, name: &str, chain: Chain) -> Option<RuleAction> {
        let state = self.state.lock().unwrap();
        (state.firewalls.get(name))
            .and_then(|fw| fw.chains.get(&chain))
            .and_then(|c| c.default)
    }

    pub fn applied(&self, name: &str, chain: Chain) -> usize {
        let state = self.state.lock().unwrap();
        (state.firewalls.get(name))
            .and_then(|fw| fw.chains.get(&chain))
            .map(|c| c.applied)
            .unwrap_or_default()
    }

    /// number of successful appends to a chain.
    pub fn appended(&self, name: &str, chain: Chain) -> usize {
        let state = self.state.lock().unwrap();
        (state.firewalls.get(name))
            .and_then(|fw| fw.chains.get(&chain))
            .map(|c| c.appended)
            .unwrap_or_default()
    }

    fn with_chain<R>(
        &self,
        name: &str,
        chain: Chain,
        f: impl FnOnce(&mut ChainState, &State) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        let mut fw = (state.firewalls.get(name).cloned())
            .ok_or_else(|| Error::NoFirewall(name.to_string()))?;
        let chain_state = fw.chains.entry(chain).or_default();
        let result = f(chain_state, &state)?;
        state.firewalls.insert(name.to_string(), fw);
        Ok(result)
    }
}

impl RuleSink for MemorySink {
    async fn create_firewall(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.firewalls.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_firewall(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.firewalls.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NoFirewall(name.to_string())),
        }
    }

    async fn firewall_exists(&self, name: &str) -> Result<bool> {
        Ok(self.exists(name))
    }

    async fn read_chain(&self, name: &str, chain: Chain) -> Result<Vec<ChainRule>> {
        self.with_chain(name, chain, |c, _| {
            let mut rules = c.rules.clone();
            rules.push(ChainRule {
                id: c.rules.len() as u32,
                action: c.default.unwrap_or_default(),
                description: Some(DEFAULT_POLICY.into()),
                ..Default::default()
            });
            Ok(rules)
        })
    }

    async fn append_rules(&self, name: &str, chain: Chain, rules: &[ChainRule]) -> Result<()> {
        self.with_chain(name, chain, |c, state| {
            if state.fail_append.contains(&chain) {
                return Err(rejected("POST", format!("{name}/{chain}/rule")));
            }
            let mut next = c.rules.clone();
            for rule in rules {
                let path = format!("{name}/{chain}/rule/{}", rule.id);
                if rule.id as usize > next.len() {
                    return Err(status_error("POST", path, "rule id not allowed"));
                }
                // the backend overwrites, the ids we computed were wrong
                if (rule.id as usize) < next.len() {
                    return Err(rejected("POST", path));
                }
                next.push(rule.clone());
            }
            c.rules = next;
            c.appended += 1;
            Ok(())
        })
    }

    async fn delete_rule(&self, name: &str, chain: Chain, id: u32) -> Result<()> {
        self.with_chain(name, chain, |c, state| {
            let path = format!("{name}/{chain}/rule/{id}");
            if state.fail_delete.contains(&id) {
                return Err(rejected("DELETE", path));
            }
            let Some(pos) = c.rules.iter().position(|r| r.id == id) else {
                return Err(rejected("DELETE", path));
            };
            c.rules.remove(pos);
            for rule in &mut c.rules[pos..] {
                rule.id -= 1;
            }
            Ok(())
        })
    }

    async fn set_default_action(&self, name: &str, chain: Chain, action: RuleAction) -> Result<()> {
        self.with_chain(name, chain, |c, _| {
            c.default = Some(action);
            Ok(())
        })
    }

    async fn apply_rules(&self, name: &str, chain: Chain) -> Result<()> {
        self.with_chain(name, chain, |c, _| {
            c.applied += 1;
            Ok(())
        })
    }
}
