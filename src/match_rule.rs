//! Match rules and the signal routing table.
//!
//! Handlers are bucketed under the [`SignalTuple`] derived from their rule.
//! A registration that pins both interface and member lives in the strict
//! table; anything looser lives in the generic table. Dispatch unions the
//! handlers of every bucket the signal could satisfy, so a signal reaches
//! every matching registration, never just the most specific one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::dispatch::message_types::Signal;
use crate::error::Result;
use crate::message::{MessageType, MESSAGE_TYPE_SIGNAL};

/// Optional predicates over message metadata; absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub message_type: Option<MessageType>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub sender: Option<String>,
    pub destination: Option<String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Default::default()
    }

    /// A rule for signals of `interface.member`.
    pub fn signal(interface: &str, member: &str) -> Self {
        MatchRule::new().message_type(MESSAGE_TYPE_SIGNAL).interface(interface).member(member)
    }

    pub fn message_type(mut self, t: MessageType) -> Self {
        self.message_type = Some(t);
        self
    }

    pub fn interface(mut self, s: &str) -> Self {
        self.interface = Some(s.to_owned());
        self
    }

    pub fn member(mut self, s: &str) -> Self {
        self.member = Some(s.to_owned());
        self
    }

    pub fn path(mut self, s: &str) -> Self {
        self.path = Some(s.to_owned());
        self
    }

    pub fn sender(mut self, s: &str) -> Self {
        self.sender = Some(s.to_owned());
        self
    }

    pub fn destination(mut self, s: &str) -> Self {
        self.destination = Some(s.to_owned());
        self
    }

    /// True iff every present predicate equals the signal's field.
    pub fn matches(&self, sig: &Signal) -> bool {
        fn check(rule: &Option<String>, field: Option<&str>) -> bool {
            match rule {
                None => true,
                Some(r) => field == Some(r.as_str()),
            }
        }
        self.message_type.map_or(true, |t| t == MESSAGE_TYPE_SIGNAL)
            && check(&self.interface, Some(&sig.interface))
            && check(&self.member, Some(&sig.member))
            && check(&self.path, Some(&sig.path))
            && check(&self.sender, sig.opt.sender.as_deref())
            && check(&self.destination, sig.opt.destination.as_deref())
    }

    fn is_strict(&self) -> bool {
        self.interface.is_some() && self.member.is_some()
    }
}

/// Bus rule syntax, as sent with `AddMatch` / `RemoveMatch`.
impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = self.message_type {
            parts.push(format!("type='{}'", t.name()));
        }
        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("destination", &self.destination),
        ];
        for (key, value) in fields.iter() {
            if let Some(v) = value {
                parts.push(format!("{}='{}'", key, v.replace('\'', "'\\''")));
            }
        }
        f.write_str(&parts.join(","))
    }
}

/// Bucket key: (interface, member, path, sender), each optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalTuple {
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub sender: Option<String>,
}

impl SignalTuple {
    pub fn from_rule(rule: &MatchRule) -> Self {
        SignalTuple {
            interface: rule.interface.clone(),
            member: rule.member.clone(),
            path: rule.path.clone(),
            sender: rule.sender.clone(),
        }
    }

    /// Keys a strict registration for this signal could be filed under.
    pub fn strict_candidates(sig: &Signal) -> Vec<SignalTuple> {
        let mut out = Vec::with_capacity(4);
        for path in [Some(sig.path.clone()), None] {
            for sender in [sig.opt.sender.clone(), None] {
                out.push(SignalTuple {
                    interface: Some(sig.interface.clone()),
                    member: Some(sig.member.clone()),
                    path: path.clone(),
                    sender,
                });
            }
        }
        out.dedup();
        out
    }

    /// Every combination of present/absent fields for this signal.
    pub fn all_possible(sig: &Signal) -> Vec<SignalTuple> {
        let mut out = Vec::with_capacity(16);
        for interface in [Some(sig.interface.clone()), None] {
            for member in [Some(sig.member.clone()), None] {
                for path in [Some(sig.path.clone()), None] {
                    for sender in [sig.opt.sender.clone(), None] {
                        let t = SignalTuple {
                            interface: interface.clone(),
                            member: member.clone(),
                            path: path.clone(),
                            sender,
                        };
                        if !out.contains(&t) {
                            out.push(t);
                        }
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

pub type SignalHandler = Arc<dyn Fn(&Signal) -> Result<()> + Send + Sync>;

struct Registration {
    id: HandlerId,
    rule: MatchRule,
    handler: SignalHandler,
}

/// Routing table from match rules to handlers. Not synchronized; the
/// connection keeps it behind a lock.
#[derive(Default)]
pub struct SignalTable {
    strict: HashMap<SignalTuple, Vec<Registration>>,
    generic: HashMap<SignalTuple, Vec<Registration>>,
    rule_counts: HashMap<MatchRule, usize>,
    next_id: u64,
}

impl SignalTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Files `handler` under the rule's key. The flag is true when this is
    /// the first handler for the rule.
    pub fn add(&mut self, rule: MatchRule, handler: SignalHandler) -> (HandlerId, bool) {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        let key = SignalTuple::from_rule(&rule);
        let table = if rule.is_strict() { &mut self.strict } else { &mut self.generic };
        let count = self.rule_counts.entry(rule.clone()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        table.entry(key).or_default().push(Registration { id, rule, handler });
        (id, first)
    }

    /// Removes one handler. Returns its rule and whether it was the last
    /// handler for that rule.
    pub fn remove(&mut self, id: HandlerId) -> Option<(MatchRule, bool)> {
        for table in [&mut self.strict, &mut self.generic] {
            let mut found = None;
            for (key, regs) in table.iter_mut() {
                if let Some(pos) = regs.iter().position(|r| r.id == id) {
                    let reg = regs.remove(pos);
                    found = Some((key.clone(), regs.is_empty(), reg.rule));
                    break;
                }
            }
            if let Some((key, empty, rule)) = found {
                if empty {
                    table.remove(&key);
                }
                let last = match self.rule_counts.get_mut(&rule) {
                    Some(c) if *c > 1 => {
                        *c -= 1;
                        false
                    }
                    _ => {
                        self.rule_counts.remove(&rule);
                        true
                    }
                };
                return Some((rule, last));
            }
        }
        None
    }

    /// Snapshot of every handler whose rule the signal satisfies.
    pub fn handlers_for(&self, sig: &Signal) -> Vec<(HandlerId, SignalHandler)> {
        let mut out: Vec<(HandlerId, SignalHandler)> = Vec::new();
        let buckets = SignalTuple::strict_candidates(sig)
            .into_iter()
            .filter_map(|k| self.strict.get(&k))
            .chain(SignalTuple::all_possible(sig).into_iter().filter_map(|k| self.generic.get(&k)));
        for regs in buckets {
            for r in regs {
                if r.rule.matches(sig) && !out.iter().any(|(id, _)| *id == r.id) {
                    out.push((r.id, r.handler.clone()));
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.strict.values().chain(self.generic.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatch::message_types::OptionalHeaderFields;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn signal(path: &str, iface: &str, member: &str, sender: Option<&str>) -> Signal {
        Signal {
            path: path.to_owned(),
            interface: iface.to_owned(),
            member: member.to_owned(),
            opt: OptionalHeaderFields { sender: sender.map(str::to_owned), ..Default::default() },
            body: vec![],
        }
    }

    fn counter() -> (Arc<AtomicUsize>, SignalHandler) {
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        (n, Arc::new(move |_: &Signal| -> Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn fire(table: &SignalTable, sig: &Signal) {
        for (_, h) in table.handlers_for(sig) {
            h(sig).unwrap();
        }
    }

    #[test]
    fn test_fan_out_and_removal() {
        let mut table = SignalTable::new();
        let (a, ha) = counter();
        let (b, hb) = counter();
        let rule = MatchRule::signal("org.foo", "Changed");
        let (id_a, first) = table.add(rule.clone(), ha);
        assert!(first);
        let (_, first) = table.add(rule.clone(), hb);
        assert!(!first);

        let sig = signal("/x", "org.foo", "Changed", Some(":1.2"));
        fire(&table, &sig);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        assert_eq!(table.remove(id_a), Some((rule, false)));
        fire(&table, &sig);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_union_across_specificity() {
        let mut table = SignalTable::new();
        let (exact, h1) = counter();
        let (by_path, h2) = counter();
        let (by_iface, h3) = counter();
        let (other, h4) = counter();
        table.add(MatchRule::signal("org.foo", "Changed").path("/x").sender(":1.2"), h1);
        table.add(MatchRule::signal("org.foo", "Changed").path("/x"), h2);
        table.add(MatchRule::new().interface("org.foo"), h3);
        table.add(MatchRule::signal("org.foo", "Changed").path("/y"), h4);

        fire(&table, &signal("/x", "org.foo", "Changed", Some(":1.2")));
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(by_path.load(Ordering::SeqCst), 1);
        assert_eq!(by_iface.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_last_handler_reports_rule() {
        let mut table = SignalTable::new();
        let (_, h) = counter();
        let rule = MatchRule::new().path("/a");
        let (id, _) = table.add(rule.clone(), h);
        assert_eq!(table.remove(id), Some((rule, true)));
        assert!(table.is_empty());
        assert_eq!(table.remove(id), None);
    }

    #[test]
    fn test_candidate_keys() {
        let sig = signal("/x", "org.foo", "Changed", Some(":1.2"));
        assert_eq!(SignalTuple::strict_candidates(&sig).len(), 4);
        assert_eq!(SignalTuple::all_possible(&sig).len(), 16);
        let anon = signal("/x", "org.foo", "Changed", None);
        assert_eq!(SignalTuple::all_possible(&anon).len(), 8);
    }

    #[test]
    fn test_rule_string() {
        let rule = MatchRule::signal("org.foo", "Changed").path("/x");
        assert_eq!(rule.to_string(), "type='signal',interface='org.foo',member='Changed',path='/x'");
    }
}
