//! The RETE discrimination network.
//!
//! Arena-owned nodes and tokens wired by index handles:
//! - Alpha memories index facts per pattern and feed join/negation nodes
//!   from the right.
//! - Beta memories hold partial-match tokens and feed nodes from the left.
//! - Join nodes cross-produce, negation nodes block while inhibited,
//!   production nodes accumulate complete matches.
//! - Unlinking suppresses activations into a join node whose opposite
//!   input is empty; relinking happens on the empty-to-non-empty
//!   transition *before* the triggering activation propagates, so the
//!   propagation itself replays whatever was skipped, exactly once.
//!
//! Memories always store their full contents. The link flags mirror
//! memory emptiness and only gate propagation, which keeps every memory
//! equal to what a naive nested-loop evaluation would hold regardless of
//! activation order.

use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::memory::{AlphaId, AlphaMemory, BetaId, BetaMemory, BetaSuccessor};
use super::node::{BetaNode, NodeId, NodeKind, ProdId, ProductionNode};
use super::pattern::{Constraint, Pattern};
use super::rule::{Activation, Effect, JoinTest, Rule, RuleEffects, TestOp};
use super::token::{Token, TokenId, TokenSource};
use super::working_memory::{Fact, FactId, FactObserver};
use crate::errors::{EngineError, Result};
use crate::types::Value;

const ROOT: BetaId = BetaId(0);
const SENTINEL: TokenId = TokenId(0);

/// One dispatched rule firing
#[derive(Debug, Clone)]
pub struct Firing {
    /// Rule that fired
    pub rule: String,
    /// Supporting facts in condition order (negated slots excluded)
    pub facts: Vec<Rc<Fact>>,
    /// Variable bindings observed at firing time
    pub bindings: HashMap<String, Value>,
}

/// Observable state of one link in a rule's chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    /// Whether the condition is negated
    pub negated: bool,
    /// False while the left beta memory is empty
    pub left_linked: bool,
    /// False while the right alpha memory is empty
    pub right_linked: bool,
    /// Tokens currently in the node's output beta memory
    pub beta_tokens: usize,
}

/// Arena sizes, mostly useful in logs and tests
#[derive(Debug, Clone)]
pub struct NetworkStats {
    /// Alpha memories (shared across rules)
    pub alpha_memories: usize,
    /// Beta memories including the root
    pub beta_memories: usize,
    /// Join and negation nodes ever compiled
    pub nodes: usize,
    /// Production nodes
    pub productions: usize,
    /// Live tokens including the sentinel
    pub live_tokens: usize,
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "network: {} alpha, {} beta, {} nodes, {} productions, {} tokens",
            self.alpha_memories, self.beta_memories, self.nodes, self.productions, self.live_tokens
        )
    }
}

/// The compiled network: arenas plus the activation machinery
pub struct ReteNetwork {
    alphas: Vec<AlphaMemory>,
    betas: Vec<BetaMemory>,
    nodes: Vec<BetaNode>,
    productions: Vec<ProductionNode>,
    production_index: HashMap<String, ProdId>,
    /// Per production, tokens already dispatched (kept off the token so
    /// rules sharing a chain fire independently)
    fired: Vec<HashSet<TokenId>>,
    tokens: Vec<Option<Token>>,
    free_tokens: Vec<TokenId>,
    facts: HashMap<FactId, Rc<Fact>>,
}

impl ReteNetwork {
    /// Empty network holding only the root beta memory and its sentinel
    pub fn new() -> Self {
        let mut root = BetaMemory::new();
        root.tokens.push(SENTINEL);
        Self {
            alphas: Vec::new(),
            betas: vec![root],
            nodes: Vec::new(),
            productions: Vec::new(),
            production_index: HashMap::new(),
            fired: Vec::new(),
            tokens: vec![Some(Token::sentinel())],
            free_tokens: Vec::new(),
            facts: HashMap::new(),
        }
    }

    // ── token arena ──────────────────────────────────────────────────────

    fn token(&self, id: TokenId) -> &Token {
        self.tokens[id.0 as usize]
            .as_ref()
            .expect("token handle must refer to a live token")
    }

    fn token_mut(&mut self, id: TokenId) -> &mut Token {
        self.tokens[id.0 as usize]
            .as_mut()
            .expect("token handle must refer to a live token")
    }

    fn alloc_token(&mut self, token: Token) -> TokenId {
        if let Some(id) = self.free_tokens.pop() {
            self.tokens[id.0 as usize] = Some(token);
            id
        } else {
            let id = TokenId(self.tokens.len() as u32);
            self.tokens.push(Some(token));
            id
        }
    }

    fn free_token(&mut self, id: TokenId) {
        self.tokens[id.0 as usize] = None;
        self.free_tokens.push(id);
    }

    /// Facts supporting a token, one `Option` slot per condition
    fn token_chain(&self, id: TokenId) -> Vec<Option<FactId>> {
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(parent) = self.token(current).parent {
            chain.push(self.token(current).fact);
            current = parent;
        }
        chain.reverse();
        chain
    }

    // ── compilation ──────────────────────────────────────────────────────

    /// Compile a rule into the network.
    ///
    /// Shares alpha memories by pattern value and reuses an equivalent
    /// join/negation node where one already hangs off the current beta
    /// memory, so re-adding a rule name replaces only its production node.
    /// Facts already in working memory are replayed so the new rule sees
    /// them immediately.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if rule.conditions.is_empty() {
            return Err(EngineError::InvalidRule {
                rule: rule.name,
                message: "a rule needs at least one condition".into(),
            });
        }
        let compiled = self.compile_conditions(&rule)?;

        let mut current = ROOT;
        let mut chain = Vec::with_capacity(rule.conditions.len());
        for (i, condition) in rule.conditions.iter().enumerate() {
            let (pattern, tests) = &compiled[i];
            let alpha = self.find_or_create_alpha(pattern);
            let node = match self.find_equivalent_node(current, alpha, tests, condition.negated) {
                Some(existing) => existing,
                None => self.create_node(current, alpha, tests.clone(), condition.negated),
            };
            chain.push(node);
            current = self.nodes[node.0 as usize].successors[0];
        }

        info!(
            "compiled rule '{}' ({} conditions, {} nodes in chain)",
            rule.name,
            rule.conditions.len(),
            chain.len()
        );

        let name = rule.name.clone();
        if let Some(&pid) = self.production_index.get(&name) {
            // Replace the production node in place. The old chain is
            // pruned only after the new production is attached, so a
            // shared (or identical) chain survives untouched.
            let old_beta = self.productions[pid.0 as usize].beta;
            self.betas[old_beta.0 as usize]
                .successors
                .retain(|s| *s != BetaSuccessor::Production(pid));
            self.fired[pid.0 as usize].clear();
            let old_chain = std::mem::take(&mut self.productions[pid.0 as usize].chain);
            self.productions[pid.0 as usize] = ProductionNode {
                rule,
                tokens: Vec::new(),
                chain,
                beta: current,
            };
            self.attach_production(pid, current);
            self.prune_chain(&old_chain);
        } else {
            let pid = ProdId(self.productions.len() as u32);
            self.productions.push(ProductionNode {
                rule,
                tokens: Vec::new(),
                chain,
                beta: current,
            });
            self.fired.push(HashSet::new());
            self.production_index.insert(name, pid);
            self.attach_production(pid, current);
        }
        Ok(())
    }

    /// Derive the effective pattern and join tests for every condition
    fn compile_conditions(&self, rule: &Rule) -> Result<Vec<(Pattern, Vec<JoinTest>)>> {
        let mut binders: HashMap<String, (usize, String)> = HashMap::new();
        let mut negated_only: HashSet<String> = HashSet::new();
        let mut compiled = Vec::with_capacity(rule.conditions.len());

        for (i, condition) in rule.conditions.iter().enumerate() {
            let mut pattern = condition.pattern.clone();
            let mut tests = Vec::new();

            // A conflicting `type` attribute constant overrides the declared
            // type at the join rather than in the alpha filter.
            if let Some(Constraint::Equals(value)) = pattern.constraint("type").cloned() {
                if value != Value::String(pattern.fact_type().to_string()) {
                    pattern.take_constraint("type");
                    tests.push(JoinTest::Constant {
                        fact_attr: "type".into(),
                        value,
                    });
                }
            }

            let bindings: Vec<(String, String)> = pattern
                .bindings()
                .map(|(attr, var)| (attr.to_string(), var.to_string()))
                .collect();
            for (attr, var) in bindings {
                if let Some((j, token_attr)) = binders.get(&var) {
                    tests.push(JoinTest::Variable {
                        token_index: *j,
                        token_attr: token_attr.clone(),
                        fact_attr: attr,
                        op: TestOp::Eq,
                    });
                } else if negated_only.contains(&var) {
                    return Err(EngineError::PatternMismatch {
                        rule: rule.name.clone(),
                        message: format!(
                            "variable {} is only bound by a negated condition",
                            var
                        ),
                    });
                } else if condition.negated {
                    negated_only.insert(var);
                } else {
                    binders.insert(var, (i, attr));
                }
            }

            for test in &condition.tests {
                if let JoinTest::Variable { token_index, .. } = test {
                    if *token_index >= i {
                        return Err(EngineError::InvalidRule {
                            rule: rule.name.clone(),
                            message: format!(
                                "join test on condition {} references condition {}",
                                i, token_index
                            ),
                        });
                    }
                }
                tests.push(test.clone());
            }

            compiled.push((pattern, tests));
        }
        Ok(compiled)
    }

    /// Look up the shared alpha memory for a pattern, creating and
    /// populating it from working memory on first use
    fn find_or_create_alpha(&mut self, pattern: &Pattern) -> AlphaId {
        if let Some(i) = self.alphas.iter().position(|a| a.pattern == *pattern) {
            return AlphaId(i as u32);
        }
        let mut memory = AlphaMemory::new(pattern.clone());
        let mut matching: Vec<FactId> = self
            .facts
            .values()
            .filter(|f| f.matches(pattern))
            .map(|f| f.id)
            .collect();
        matching.sort();
        memory.items = matching;

        let id = AlphaId(self.alphas.len() as u32);
        self.alphas.push(memory);
        id
    }

    fn find_equivalent_node(
        &self,
        left: BetaId,
        right: AlphaId,
        tests: &[JoinTest],
        negated: bool,
    ) -> Option<NodeId> {
        self.betas[left.0 as usize]
            .successors
            .iter()
            .filter_map(|s| match s {
                BetaSuccessor::Node(n) => Some(*n),
                BetaSuccessor::Production(_) => None,
            })
            .find(|n| {
                let node = &self.nodes[n.0 as usize];
                node.right == right && node.tests == tests && node.is_negation() == negated
            })
    }

    fn create_node(
        &mut self,
        left: BetaId,
        right: AlphaId,
        tests: Vec<JoinTest>,
        negated: bool,
    ) -> NodeId {
        let out = BetaId(self.betas.len() as u32);
        self.betas.push(BetaMemory::new());

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(BetaNode {
            kind: if negated {
                NodeKind::Negation {
                    inhibitors: HashMap::new(),
                }
            } else {
                NodeKind::Join
            },
            left,
            right,
            tests,
            successors: vec![out],
            left_linked: !self.betas[left.0 as usize].tokens.is_empty(),
            right_linked: !self.alphas[right.0 as usize].items.is_empty(),
        });
        self.betas[left.0 as usize]
            .successors
            .push(BetaSuccessor::Node(id));
        self.alphas[right.0 as usize].successors.push(id);

        // Seed the new node from the tokens already to its left so a rule
        // added late sees pre-existing facts.
        for token in self.betas[left.0 as usize].tokens.clone() {
            self.node_left_activate(id, token);
        }
        id
    }

    fn attach_production(&mut self, pid: ProdId, beta: BetaId) {
        self.betas[beta.0 as usize]
            .successors
            .push(BetaSuccessor::Production(pid));
        let seed = self.betas[beta.0 as usize].tokens.clone();
        self.productions[pid.0 as usize].tokens = seed;
    }

    /// Prune the tail of a replaced rule's chain: nodes whose output beta
    /// memory no longer feeds anything are unwired and their tokens freed
    fn prune_chain(&mut self, chain: &[NodeId]) {
        for &node in chain.iter().rev() {
            let out = self.nodes[node.0 as usize].successors[0];
            if !self.betas[out.0 as usize].successors.is_empty() {
                break;
            }
            // Tokens in a successor-less memory have no children and no
            // holders below; just detach them from their parents.
            for token in std::mem::take(&mut self.betas[out.0 as usize].tokens) {
                if let Some(parent) = self.token(token).parent {
                    self.token_mut(parent).children.retain(|c| *c != token);
                }
                self.free_token(token);
            }
            let left = self.nodes[node.0 as usize].left;
            let right = self.nodes[node.0 as usize].right;
            self.betas[left.0 as usize]
                .successors
                .retain(|s| *s != BetaSuccessor::Node(node));
            self.alphas[right.0 as usize]
                .successors
                .retain(|n| *n != node);
        }
    }

    // ── activation protocol ──────────────────────────────────────────────

    fn alpha_right_activate(&mut self, alpha: AlphaId, fact: FactId) {
        let was_empty = self.alphas[alpha.0 as usize].items.is_empty();
        self.alphas[alpha.0 as usize].items.push(fact);

        let successors = self.alphas[alpha.0 as usize].successors.clone();
        if was_empty {
            // Relink before propagating: the propagation below replays the
            // work skipped while unlinked.
            for &n in &successors {
                self.nodes[n.0 as usize].right_linked = true;
            }
        }
        for &n in &successors {
            self.node_right_activate(n, fact);
        }
    }

    fn alpha_right_deactivate(&mut self, alpha: AlphaId, fact: FactId) {
        self.alphas[alpha.0 as usize].items.retain(|f| *f != fact);
        let successors = self.alphas[alpha.0 as usize].successors.clone();
        for &n in &successors {
            self.node_right_deactivate(n, fact);
        }
        if self.alphas[alpha.0 as usize].items.is_empty() {
            for &n in &successors {
                self.nodes[n.0 as usize].right_linked = false;
            }
        }
    }

    fn beta_left_activate(&mut self, beta: BetaId, token: TokenId) {
        let was_empty = self.betas[beta.0 as usize].tokens.is_empty();
        self.betas[beta.0 as usize].tokens.push(token);

        let successors = self.betas[beta.0 as usize].successors.clone();
        if was_empty {
            for s in &successors {
                if let BetaSuccessor::Node(n) = s {
                    self.nodes[n.0 as usize].left_linked = true;
                }
            }
        }
        for s in &successors {
            match s {
                BetaSuccessor::Node(n) => self.node_left_activate(*n, token),
                BetaSuccessor::Production(p) => {
                    self.productions[p.0 as usize].tokens.push(token);
                }
            }
        }
    }

    fn node_left_activate(&mut self, node: NodeId, token: TokenId) {
        let negation = self.nodes[node.0 as usize].is_negation();
        let right = self.nodes[node.0 as usize].right;
        let tests = self.nodes[node.0 as usize].tests.clone();

        if negation {
            let inhibitors: Vec<FactId> = self.alphas[right.0 as usize]
                .items
                .clone()
                .into_iter()
                .filter(|f| self.tests_pass(&tests, token, *f))
                .collect();
            if inhibitors.is_empty() {
                self.emit_child(node, token, None);
            } else {
                self.negation_map_mut(node).insert(token, inhibitors);
            }
        } else {
            // Left activation is a no-op while the right side is empty;
            // the relink on the right's first fact replays this token.
            if !self.nodes[node.0 as usize].right_linked {
                return;
            }
            for fact in self.alphas[right.0 as usize].items.clone() {
                if self.tests_pass(&tests, token, fact) {
                    self.emit_child(node, token, Some(fact));
                }
            }
        }
    }

    fn node_right_activate(&mut self, node: NodeId, fact: FactId) {
        let negation = self.nodes[node.0 as usize].is_negation();
        let left = self.nodes[node.0 as usize].left;
        let tests = self.nodes[node.0 as usize].tests.clone();

        if negation {
            for token in self.betas[left.0 as usize].tokens.clone() {
                if !self.tests_pass(&tests, token, fact) {
                    continue;
                }
                let newly_inhibited = !self.negation_map_mut(node).contains_key(&token);
                if newly_inhibited {
                    for child in self.negation_children(node, token) {
                        self.deactivate_token(child);
                    }
                }
                self.negation_map_mut(node)
                    .entry(token)
                    .or_default()
                    .push(fact);
            }
        } else {
            if !self.nodes[node.0 as usize].left_linked {
                return;
            }
            for token in self.betas[left.0 as usize].tokens.clone() {
                if self.tests_pass(&tests, token, fact) {
                    self.emit_child(node, token, Some(fact));
                }
            }
        }
    }

    fn node_right_deactivate(&mut self, node: NodeId, fact: FactId) {
        if self.nodes[node.0 as usize].is_negation() {
            let affected: Vec<TokenId> = self
                .negation_map_mut(node)
                .iter()
                .filter(|(_, facts)| facts.contains(&fact))
                .map(|(t, _)| *t)
                .collect();
            for token in affected {
                let now_clear = {
                    let map = self.negation_map_mut(node);
                    let facts = map.get_mut(&token).expect("inhibitor entry present");
                    facts.retain(|f| *f != fact);
                    if facts.is_empty() {
                        map.remove(&token);
                        true
                    } else {
                        false
                    }
                };
                if now_clear {
                    self.emit_child(node, token, None);
                }
            }
        } else {
            let left = self.nodes[node.0 as usize].left;
            for token in self.betas[left.0 as usize].tokens.clone() {
                let children: Vec<TokenId> = self
                    .token(token)
                    .children
                    .iter()
                    .copied()
                    .filter(|c| {
                        let child = self.token(*c);
                        child.source == TokenSource::Node(node) && child.fact == Some(fact)
                    })
                    .collect();
                for child in children {
                    self.deactivate_token(child);
                }
            }
        }
    }

    fn negation_map_mut(&mut self, node: NodeId) -> &mut HashMap<TokenId, Vec<FactId>> {
        match &mut self.nodes[node.0 as usize].kind {
            NodeKind::Negation { inhibitors } => inhibitors,
            NodeKind::Join => unreachable!("join node has no inhibitor map"),
        }
    }

    /// Children of `token` emitted by a specific negation node
    fn negation_children(&self, node: NodeId, token: TokenId) -> Vec<TokenId> {
        self.token(token)
            .children
            .iter()
            .copied()
            .filter(|c| self.token(*c).source == TokenSource::Node(node))
            .collect()
    }

    fn emit_child(&mut self, node: NodeId, parent: TokenId, fact: Option<FactId>) {
        let child = self.alloc_token(Token::child_of(parent, fact, node));
        self.token_mut(parent).children.push(child);
        debug!("token {} emitted by node {:?}", child, node);
        for out in self.nodes[node.0 as usize].successors.clone() {
            self.beta_left_activate(out, child);
        }
    }

    /// Remove a token from every holder, cascading through its children
    fn deactivate_token(&mut self, token: TokenId) {
        assert!(token != SENTINEL, "the sentinel token is never deactivated");

        for child in std::mem::take(&mut self.token_mut(token).children) {
            self.deactivate_token(child);
        }

        if let TokenSource::Node(node) = self.token(token).source {
            for beta in self.nodes[node.0 as usize].successors.clone() {
                self.betas[beta.0 as usize].tokens.retain(|t| *t != token);
                let successors = self.betas[beta.0 as usize].successors.clone();
                for s in &successors {
                    match s {
                        BetaSuccessor::Production(p) => {
                            self.productions[p.0 as usize].tokens.retain(|t| *t != token);
                            self.fired[p.0 as usize].remove(&token);
                        }
                        BetaSuccessor::Node(n) => {
                            if self.nodes[n.0 as usize].is_negation() {
                                self.negation_map_mut(*n).remove(&token);
                            }
                        }
                    }
                }
                if self.betas[beta.0 as usize].tokens.is_empty() {
                    for s in &successors {
                        if let BetaSuccessor::Node(n) = s {
                            self.nodes[n.0 as usize].left_linked = false;
                        }
                    }
                }
            }
        }

        if let Some(parent) = self.token(token).parent {
            if self.tokens[parent.0 as usize].is_some() {
                self.token_mut(parent).children.retain(|c| *c != token);
            }
        }
        self.free_token(token);
    }

    fn tests_pass(&self, tests: &[JoinTest], token: TokenId, fact: FactId) -> bool {
        if tests.is_empty() {
            return true;
        }
        let Some(candidate) = self.facts.get(&fact) else {
            return false;
        };
        let chain = self.token_chain(token);
        tests.iter().all(|test| match test {
            JoinTest::Variable {
                token_index,
                token_attr,
                fact_attr,
                op,
            } => {
                let Some(Some(earlier_id)) = chain.get(*token_index) else {
                    return false;
                };
                let Some(earlier) = self.facts.get(earlier_id) else {
                    return false;
                };
                match (
                    earlier.attributes.get(token_attr),
                    candidate.attributes.get(fact_attr),
                ) {
                    (Some(a), Some(b)) => match op {
                        TestOp::Eq => a == b,
                        TestOp::Ne => a != b,
                    },
                    _ => false,
                }
            }
            JoinTest::Constant { fact_attr, value } => {
                candidate.attributes.get(fact_attr) == Some(value)
            }
        })
    }

    // ── run ──────────────────────────────────────────────────────────────

    /// Snapshot the eligible matches, dispatch their actions, and return
    /// the firings, the per-token action errors, and the buffered effects.
    ///
    /// Order: rule priority descending, then rule registration order, then
    /// token arrival order. The hook runs before each action (the
    /// blackboard logs firings through it).
    pub(crate) fn run_collected(
        &mut self,
        hook: &mut dyn FnMut(&Firing),
    ) -> (Vec<Firing>, Vec<EngineError>, Vec<Effect>) {
        let mut order: Vec<ProdId> = (0..self.productions.len() as u32).map(ProdId).collect();
        order.sort_by_key(|p| std::cmp::Reverse(self.productions[p.0 as usize].rule.priority));

        let mut schedule = Vec::new();
        for p in order {
            for &t in &self.productions[p.0 as usize].tokens {
                if !self.fired[p.0 as usize].contains(&t) {
                    schedule.push((p, t));
                }
            }
        }

        let mut firings = Vec::new();
        let mut errors = Vec::new();
        let mut effects = RuleEffects::new();
        for (p, t) in schedule {
            let activation = self.activation(p, t);
            let firing = Firing {
                rule: self.productions[p.0 as usize].rule.name.clone(),
                facts: activation.facts.clone(),
                bindings: activation.bindings.clone(),
            };
            hook(&firing);
            let result = (self.productions[p.0 as usize].rule.action)(&activation, &mut effects);
            self.fired[p.0 as usize].insert(t);
            if let Err(err) = result {
                errors.push(EngineError::ActionFailure {
                    rule: firing.rule.clone(),
                    message: err.to_string(),
                });
            }
            debug!("fired rule '{}'", firing.rule);
            firings.push(firing);
        }
        (firings, errors, effects.drain())
    }

    /// Rebuild the activation a token represents
    fn activation(&self, pid: ProdId, token: TokenId) -> Activation {
        let chain = self.token_chain(token);
        let facts: Vec<Rc<Fact>> = chain
            .iter()
            .flatten()
            .filter_map(|id| self.facts.get(id).cloned())
            .collect();

        let mut bindings = HashMap::new();
        let conditions = &self.productions[pid.0 as usize].rule.conditions;
        for (i, condition) in conditions.iter().enumerate() {
            if condition.negated {
                continue;
            }
            let Some(Some(fact_id)) = chain.get(i) else {
                continue;
            };
            let Some(fact) = self.facts.get(fact_id) else {
                continue;
            };
            for (attr, var) in condition.pattern.bindings() {
                if let Some(value) = fact.attributes.get(attr) {
                    bindings.entry(var.to_string()).or_insert_with(|| value.clone());
                }
            }
        }
        Activation { facts, bindings }
    }

    // ── reset ────────────────────────────────────────────────────────────

    /// Clear all runtime state, keeping the compiled structure
    pub fn reset(&mut self) {
        self.facts.clear();
        for alpha in &mut self.alphas {
            alpha.items.clear();
        }
        for beta in &mut self.betas {
            beta.tokens.clear();
        }
        self.betas[ROOT.0 as usize].tokens.push(SENTINEL);
        for production in &mut self.productions {
            production.tokens.clear();
        }
        for fired in &mut self.fired {
            fired.clear();
        }

        self.free_tokens.clear();
        for (i, slot) in self.tokens.iter_mut().enumerate().skip(1) {
            if slot.is_some() {
                *slot = None;
            }
            self.free_tokens.push(TokenId(i as u32));
        }
        if let Some(sentinel) = self.tokens[SENTINEL.0 as usize].as_mut() {
            sentinel.children.clear();
        }

        for node in &mut self.nodes {
            if let NodeKind::Negation { inhibitors } = &mut node.kind {
                inhibitors.clear();
            }
            node.left_linked = node.left == ROOT;
            node.right_linked = false;
        }
    }

    // ── introspection ────────────────────────────────────────────────────

    /// Item count of the alpha memory for a pattern, if one exists
    pub fn alpha_memory_len(&self, pattern: &Pattern) -> Option<usize> {
        self.alphas
            .iter()
            .find(|a| a.pattern == *pattern)
            .map(|a| a.items.len())
    }

    /// Iterate `(pattern, item count)` over all alpha memories
    pub fn alpha_memories(&self) -> impl Iterator<Item = (&Pattern, usize)> {
        self.alphas.iter().map(|a| (&a.pattern, a.items.len()))
    }

    /// Rule names in registration order
    pub fn rule_names(&self) -> Vec<String> {
        self.productions.iter().map(|p| p.rule.name.clone()).collect()
    }

    /// Whether a rule is registered
    pub fn has_rule(&self, name: &str) -> bool {
        self.production_index.contains_key(name)
    }

    /// Number of complete matches currently held for a rule
    pub fn match_count(&self, name: &str) -> Option<usize> {
        self.production_index
            .get(name)
            .map(|p| self.productions[p.0 as usize].tokens.len())
    }

    /// Per-condition chain state for a rule: link flags and output beta
    /// memory sizes, in condition order
    pub fn rule_chain(&self, name: &str) -> Option<Vec<NodeState>> {
        let pid = self.production_index.get(name)?;
        let chain = &self.productions[pid.0 as usize].chain;
        Some(
            chain
                .iter()
                .map(|n| {
                    let node = &self.nodes[n.0 as usize];
                    NodeState {
                        negated: node.is_negation(),
                        left_linked: node.left_linked,
                        right_linked: node.right_linked,
                        beta_tokens: self.betas[node.successors[0].0 as usize].tokens.len(),
                    }
                })
                .collect(),
        )
    }

    /// Arena sizes
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            alpha_memories: self.alphas.len(),
            beta_memories: self.betas.len(),
            nodes: self.nodes.len(),
            productions: self.productions.len(),
            live_tokens: self.tokens.iter().filter(|t| t.is_some()).count(),
        }
    }
}

impl Default for ReteNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl FactObserver for ReteNetwork {
    fn on_assert(&mut self, fact: &Rc<Fact>) {
        self.facts.insert(fact.id, fact.clone());
        let matching: Vec<AlphaId> = (0..self.alphas.len() as u32)
            .map(AlphaId)
            .filter(|a| fact.matches(&self.alphas[a.0 as usize].pattern))
            .collect();
        for alpha in matching {
            self.alpha_right_activate(alpha, fact.id);
        }
    }

    fn on_retract(&mut self, fact: &Rc<Fact>) {
        let holding: Vec<AlphaId> = (0..self.alphas.len() as u32)
            .map(AlphaId)
            .filter(|a| self.alphas[a.0 as usize].items.contains(&fact.id))
            .collect();
        for alpha in holding {
            self.alpha_right_deactivate(alpha, fact.id);
        }
        self.facts.remove(&fact.id);
    }
}
