//! Host firewall control.
//!
//! [`FirewallControl`] is the small set of iptables operations the chain
//! manager needs, over a single table. "Already exists" and "not found" are
//! reported as distinct variants because callers routinely expect them.

use std::collections::{BTreeMap, HashSet};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

/// The chain every peer chain is linked from.
pub const FORWARD_CHAIN: &str = "FORWARD";

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", FORWARD_CHAIN, "OUTPUT"];
const BUILTIN_TARGETS: [&str; 4] = ["ACCEPT", "DROP", "REJECT", "RETURN"];

/// Errors from a firewall operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FirewallError {
    /// The chain being created already exists.
    #[error("chain already exists: {chain}")]
    AlreadyExists {
        /// Chain name.
        chain: String,
    },

    /// The chain, or the rule inside it, does not exist.
    #[error("chain or rule not found: {chain}")]
    NotFound {
        /// Chain name.
        chain: String,
    },

    /// The operation was rejected for another reason.
    #[error("{op} on chain {chain} failed: {message}")]
    Command {
        /// Operation name.
        op: &'static str,
        /// Chain name.
        chain: String,
        /// Error text from the firewall.
        message: String,
    },

    /// The firewall tool could not be run at all.
    #[error("firewall unavailable: {0}")]
    Unavailable(String),
}

/// Operations on one firewall table.
///
/// Rules are iptables rule specifications without the chain, e.g.
/// `["-s", "10.8.0.2/32", "-j", "ACCEPT"]`.
pub trait FirewallControl {
    /// Creates an empty user chain.
    fn new_chain(&self, chain: &str) -> Result<(), FirewallError>;

    /// Appends a rule to the end of a chain.
    fn append(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError>;

    /// Inserts a rule at a 1-based position.
    fn insert(&self, chain: &str, position: u32, rule: &[String]) -> Result<(), FirewallError>;

    /// Deletes the first rule matching `rule` exactly.
    fn delete(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError>;

    /// Removes every rule from a chain.
    fn clear_chain(&self, chain: &str) -> Result<(), FirewallError>;

    /// Deletes an empty, unreferenced user chain.
    fn delete_chain(&self, chain: &str) -> Result<(), FirewallError>;

    /// Lists every chain in the table, built-in chains included.
    fn list_chains(&self) -> Result<Vec<String>, FirewallError>;
}

impl<T: FirewallControl + ?Sized> FirewallControl for Arc<T> {
    fn new_chain(&self, chain: &str) -> Result<(), FirewallError> {
        (**self).new_chain(chain)
    }

    fn append(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        (**self).append(chain, rule)
    }

    fn insert(&self, chain: &str, position: u32, rule: &[String]) -> Result<(), FirewallError> {
        (**self).insert(chain, position, rule)
    }

    fn delete(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        (**self).delete(chain, rule)
    }

    fn clear_chain(&self, chain: &str) -> Result<(), FirewallError> {
        (**self).clear_chain(chain)
    }

    fn delete_chain(&self, chain: &str) -> Result<(), FirewallError> {
        (**self).delete_chain(chain)
    }

    fn list_chains(&self) -> Result<Vec<String>, FirewallError> {
        (**self).list_chains()
    }
}

/// `FirewallControl` backed by the `iptables` command.
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
    table: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new("filter")
    }
}

impl Iptables {
    /// Controls `table` through the `iptables` found on `PATH`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            binary: "iptables".to_string(),
            table: table.into(),
        }
    }

    /// Uses a different binary, e.g. `iptables-legacy`.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn run(
        &self,
        op: &'static str,
        chain: &str,
        args: &[&str],
        rule: &[String],
    ) -> Result<String, FirewallError> {
        trace!(op, chain, rule = ?rule, "iptables");
        let output = Command::new(&self.binary)
            .arg("-w")
            .args(["-t", self.table.as_str()])
            .args(args)
            .args(rule)
            .output()
            .map_err(|e| FirewallError::Unavailable(format!("{}: {e}", self.binary)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_stderr(op, chain, stderr.trim()))
    }
}

/// Maps iptables error text onto [`FirewallError`].
fn classify_stderr(op: &'static str, chain: &str, stderr: &str) -> FirewallError {
    if stderr.contains("Chain already exists") {
        FirewallError::AlreadyExists {
            chain: chain.to_string(),
        }
    } else if stderr.contains("No chain/target/match by that name")
        || stderr.contains("does a matching rule exist")
        || stderr.contains("doesn't exist")
    {
        FirewallError::NotFound {
            chain: chain.to_string(),
        }
    } else {
        FirewallError::Command {
            op,
            chain: chain.to_string(),
            message: stderr.to_string(),
        }
    }
}

/// Extracts chain names from `iptables -S` output.
fn parse_chain_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("-P" | "-N") => parts.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

impl FirewallControl for Iptables {
    fn new_chain(&self, chain: &str) -> Result<(), FirewallError> {
        self.run("new_chain", chain, &["-N", chain], &[]).map(drop)
    }

    fn append(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        self.run("append", chain, &["-A", chain], rule).map(drop)
    }

    fn insert(&self, chain: &str, position: u32, rule: &[String]) -> Result<(), FirewallError> {
        let position = position.to_string();
        self.run("insert", chain, &["-I", chain, position.as_str()], rule)
            .map(drop)
    }

    fn delete(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        self.run("delete", chain, &["-D", chain], rule).map(drop)
    }

    fn clear_chain(&self, chain: &str) -> Result<(), FirewallError> {
        self.run("clear_chain", chain, &["-F", chain], &[]).map(drop)
    }

    fn delete_chain(&self, chain: &str) -> Result<(), FirewallError> {
        self.run("delete_chain", chain, &["-X", chain], &[]).map(drop)
    }

    fn list_chains(&self) -> Result<Vec<String>, FirewallError> {
        let listing = self.run("list_chains", &self.table, &["-S"], &[])?;
        let chains = parse_chain_list(&listing);
        debug!(table = %self.table, chains = chains.len(), "listed chains");
        Ok(chains)
    }
}

/// A recorded call against a [`MemoryFirewall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallCall {
    /// Operation name.
    pub op: &'static str,
    /// Chain operated on (the table name for `list_chains`).
    pub chain: String,
}

#[derive(Debug, Default)]
struct MemoryTable {
    chains: BTreeMap<String, Vec<Vec<String>>>,
    calls: Vec<FirewallCall>,
    failing: HashSet<String>,
}

impl MemoryTable {
    fn record(&mut self, op: &'static str, chain: &str) -> Result<(), FirewallError> {
        self.calls.push(FirewallCall {
            op,
            chain: chain.to_string(),
        });
        if self.failing.contains(chain) {
            return Err(FirewallError::Command {
                op,
                chain: chain.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn rules_mut(&mut self, chain: &str) -> Result<&mut Vec<Vec<String>>, FirewallError> {
        self.chains.get_mut(chain).ok_or_else(|| FirewallError::NotFound {
            chain: chain.to_string(),
        })
    }

    fn check_target(&self, rule: &[String]) -> Result<(), FirewallError> {
        match jump_target(rule) {
            Some(target)
                if !BUILTIN_TARGETS.contains(&target) && !self.chains.contains_key(target) =>
            {
                Err(FirewallError::NotFound {
                    chain: target.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn is_referenced(&self, chain: &str) -> bool {
        self.chains
            .values()
            .flatten()
            .any(|rule| jump_target(rule) == Some(chain))
    }
}

fn jump_target(rule: &[String]) -> Option<&str> {
    rule.iter()
        .position(|arg| arg == "-j")
        .and_then(|i| rule.get(i + 1))
        .map(String::as_str)
}

/// In-memory `FirewallControl` that follows iptables semantics closely
/// enough to exercise chain lifecycles: duplicate chains, missing chains and
/// rules, jumps to unknown chains, and deleting non-empty or referenced
/// chains all fail the way iptables does.
///
/// Every call is logged, and operations on chosen chains can be made to fail.
#[derive(Debug)]
pub struct MemoryFirewall {
    table: Mutex<MemoryTable>,
}

impl Default for MemoryFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFirewall {
    /// Creates a table holding only the built-in chains.
    #[must_use]
    pub fn new() -> Self {
        let mut table = MemoryTable::default();
        for chain in BUILTIN_CHAINS {
            table.chains.insert(chain.to_string(), Vec::new());
        }
        Self {
            table: Mutex::new(table),
        }
    }

    /// Rules currently in `chain`, in order.
    #[must_use]
    pub fn rules(&self, chain: &str) -> Option<Vec<Vec<String>>> {
        self.table.lock().chains.get(chain).cloned()
    }

    /// Whether the chain exists.
    #[must_use]
    pub fn has_chain(&self, chain: &str) -> bool {
        self.table.lock().chains.contains_key(chain)
    }

    /// Names of user-defined chains.
    #[must_use]
    pub fn user_chains(&self) -> Vec<String> {
        self.table
            .lock()
            .chains
            .keys()
            .filter(|name| !BUILTIN_CHAINS.contains(&name.as_str()))
            .cloned()
            .collect()
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<FirewallCall> {
        self.table.lock().calls.clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.table.lock().calls.len()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.table.lock().calls.clear();
    }

    /// Makes every operation on `chain` fail until [`Self::heal`] is called.
    pub fn fail_chain(&self, chain: &str) {
        self.table.lock().failing.insert(chain.to_string());
    }

    /// Stops failing operations on `chain`.
    pub fn heal(&self, chain: &str) {
        self.table.lock().failing.remove(chain);
    }
}

impl FirewallControl for MemoryFirewall {
    fn new_chain(&self, chain: &str) -> Result<(), FirewallError> {
        let mut table = self.table.lock();
        table.record("new_chain", chain)?;
        if table.chains.contains_key(chain) {
            return Err(FirewallError::AlreadyExists {
                chain: chain.to_string(),
            });
        }
        table.chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    fn append(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        let mut table = self.table.lock();
        table.record("append", chain)?;
        table.check_target(rule)?;
        table.rules_mut(chain)?.push(rule.to_vec());
        Ok(())
    }

    fn insert(&self, chain: &str, position: u32, rule: &[String]) -> Result<(), FirewallError> {
        let mut table = self.table.lock();
        table.record("insert", chain)?;
        table.check_target(rule)?;
        let rules = table.rules_mut(chain)?;
        let index = position as usize;
        if index == 0 || index > rules.len() + 1 {
            return Err(FirewallError::Command {
                op: "insert",
                chain: chain.to_string(),
                message: format!("index of insertion too big: {position}"),
            });
        }
        rules.insert(index - 1, rule.to_vec());
        Ok(())
    }

    fn delete(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        let mut table = self.table.lock();
        table.record("delete", chain)?;
        let rules = table.rules_mut(chain)?;
        let index = rules
            .iter()
            .position(|existing| existing.as_slice() == rule)
            .ok_or_else(|| FirewallError::NotFound {
                chain: chain.to_string(),
            })?;
        rules.remove(index);
        Ok(())
    }

    fn clear_chain(&self, chain: &str) -> Result<(), FirewallError> {
        let mut table = self.table.lock();
        table.record("clear_chain", chain)?;
        table.rules_mut(chain)?.clear();
        Ok(())
    }

    fn delete_chain(&self, chain: &str) -> Result<(), FirewallError> {
        let mut table = self.table.lock();
        table.record("delete_chain", chain)?;
        let rules = table.rules_mut(chain)?;
        if !rules.is_empty() {
            return Err(FirewallError::Command {
                op: "delete_chain",
                chain: chain.to_string(),
                message: "Directory not empty".to_string(),
            });
        }
        if table.is_referenced(chain) {
            return Err(FirewallError::Command {
                op: "delete_chain",
                chain: chain.to_string(),
                message: "Too many links".to_string(),
            });
        }
        table.chains.remove(chain);
        Ok(())
    }

    fn list_chains(&self) -> Result<Vec<String>, FirewallError> {
        let mut table = self.table.lock();
        table.calls.push(FirewallCall {
            op: "list_chains",
            chain: "filter".to_string(),
        });
        Ok(table.chains.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn classifies_iptables_errors() {
        assert_eq!(
            classify_stderr("new_chain", "10.8.0.2", "iptables: Chain already exists."),
            FirewallError::AlreadyExists {
                chain: "10.8.0.2".into()
            }
        );
        assert_eq!(
            classify_stderr("clear_chain", "10.8.0.2", "iptables: No chain/target/match by that name."),
            FirewallError::NotFound {
                chain: "10.8.0.2".into()
            }
        );
        assert_eq!(
            classify_stderr(
                "delete",
                "FORWARD",
                "iptables: Bad rule (does a matching rule exist in that chain?)."
            ),
            FirewallError::NotFound {
                chain: "FORWARD".into()
            }
        );
        assert!(matches!(
            classify_stderr("append", "x", "iptables v1.8.7: unknown option \"--bogus\""),
            FirewallError::Command { op: "append", .. }
        ));
    }

    #[test]
    fn parses_chain_listing() {
        let listing = "-P INPUT ACCEPT\n-P FORWARD DROP\n-P OUTPUT ACCEPT\n-N 10.8.0.2\n-A FORWARD -s 10.8.0.2/32 -j 10.8.0.2\n-A 10.8.0.2 -j ACCEPT\n";
        assert_eq!(
            parse_chain_list(listing),
            vec!["INPUT", "FORWARD", "OUTPUT", "10.8.0.2"]
        );
    }

    #[test]
    fn memory_chain_lifecycle() {
        let fw = MemoryFirewall::new();
        fw.new_chain("peer").expect("new chain");
        assert_eq!(
            fw.new_chain("peer"),
            Err(FirewallError::AlreadyExists {
                chain: "peer".into()
            })
        );

        fw.append("peer", &rule(&["-j", "ACCEPT"])).expect("append");
        fw.insert(FORWARD_CHAIN, 1, &rule(&["-j", "peer"])).expect("insert");

        assert!(matches!(
            fw.delete_chain("peer"),
            Err(FirewallError::Command { .. })
        ));
        fw.clear_chain("peer").expect("clear");
        assert!(matches!(
            fw.delete_chain("peer"),
            Err(FirewallError::Command { .. })
        ));
        fw.delete(FORWARD_CHAIN, &rule(&["-j", "peer"])).expect("delete jump");
        fw.delete_chain("peer").expect("delete chain");
        assert!(!fw.has_chain("peer"));
    }

    #[test]
    fn memory_rejects_unknown_jump_target() {
        let fw = MemoryFirewall::new();
        let result = fw.insert(FORWARD_CHAIN, 1, &rule(&["-j", "missing"]));
        assert!(matches!(result, Err(FirewallError::NotFound { .. })));
    }

    #[test]
    fn memory_insert_position() {
        let fw = MemoryFirewall::new();
        fw.append(FORWARD_CHAIN, &rule(&["-j", "DROP"])).expect("append");
        fw.insert(FORWARD_CHAIN, 1, &rule(&["-j", "ACCEPT"])).expect("insert");
        assert_eq!(
            fw.rules(FORWARD_CHAIN).expect("forward"),
            vec![rule(&["-j", "ACCEPT"]), rule(&["-j", "DROP"])]
        );
        assert!(fw.insert(FORWARD_CHAIN, 5, &rule(&["-j", "ACCEPT"])).is_err());
    }

    #[test]
    fn memory_injected_failure_is_recorded() {
        let fw = MemoryFirewall::new();
        fw.fail_chain("peer");
        assert!(matches!(
            fw.new_chain("peer"),
            Err(FirewallError::Command { op: "new_chain", .. })
        ));
        fw.heal("peer");
        fw.new_chain("peer").expect("healed");
        assert_eq!(fw.call_count(), 2);
    }
}
