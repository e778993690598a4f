//! Condition-scoped module sets.
//!
//! The root set holds the registered modules. Every `condition` path seen in
//! the configuration gets its own set made of deep copies of the parent's
//! modules, built on first reference and never replaced afterwards. Requests
//! walk down from the root taking the first child whose condition matches.

use std::sync::{Arc, PoisonError, RwLock};

use super::condition::{Condition, CONDITION_DIRECTIVE};
use super::module::Module;
use super::request::{HandleRequestResult, RequestContext};
use crate::conf::{Block, Command};
use crate::error::{Error, Result};
use crate::proxy::response::ResponseSummary;

/// One node of the condition tree: an ordered module list plus children.
pub struct ModuleSet {
    modules: Vec<Arc<dyn Module>>,
    children: RwLock<Vec<(Condition, Arc<ModuleSet>)>>,
}

impl ModuleSet {
    pub(crate) fn new(modules: Vec<Arc<dyn Module>>) -> Self {
        Self {
            modules,
            children: RwLock::new(Vec::new()),
        }
    }

    pub fn modules(&self) -> &[Arc<dyn Module>] {
        &self.modules
    }

    pub fn module(&self, directive: &str) -> Option<&Arc<dyn Module>> {
        self.modules.iter().find(|m| m.directive() == directive)
    }

    /// The child set for `condition`, cloning this set's modules on first use.
    pub fn child(&self, condition: &Condition) -> Arc<ModuleSet> {
        if let Some(child) = self.find_child(condition) {
            return child;
        }

        let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, child)) = children.iter().find(|(c, _)| c == condition) {
            return child.clone();
        }
        let copies = self.modules.iter().map(|m| m.clone_module()).collect();
        let child = Arc::new(ModuleSet::new(copies));
        children.push((condition.clone(), child.clone()));
        tracing::debug!(condition = %condition, "created conditional module set");
        child
    }

    fn find_child(&self, condition: &Condition) -> Option<Arc<ModuleSet>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(c, _)| c == condition)
            .map(|(_, child)| child.clone())
    }

    fn matching_child(&self, request: &RequestContext) -> Option<Arc<ModuleSet>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(c, _)| c.test(request))
            .map(|(_, child)| child.clone())
    }

    pub fn before_handle_request(&self, request: &RequestContext) {
        for module in &self.modules {
            if let Some(hook) = module.hooks().before_handle_request {
                if let Err(e) = hook.before_handle_request(request) {
                    tracing::warn!(module = module.directive(), error = %e, "before_handle_request hook failed");
                }
            }
        }
    }

    /// Run `HandleRequest` hooks until one settles the response.
    pub fn handle_request(&self, result: &mut HandleRequestResult) {
        for module in &self.modules {
            if let Some(hook) = module.hooks().handle_request {
                if let Err(e) = hook.handle_request(result) {
                    tracing::warn!(module = module.directive(), error = %e, "handle_request hook failed");
                }
                if result.response.is_some() {
                    return;
                }
            }
        }
    }

    pub fn after_write_response(&self, request: &RequestContext, response: &ResponseSummary) {
        for module in &self.modules {
            if let Some(hook) = module.hooks().after_write_response {
                if let Err(e) = hook.after_write_response(request, response) {
                    tracing::warn!(module = module.directive(), error = %e, "after_write_response hook failed");
                }
            }
        }
    }
}

/// Owner of the condition tree.
pub struct ModulesManager {
    root: Arc<ModuleSet>,
}

impl ModulesManager {
    /// Register modules in pipeline order. Directives must be unique.
    pub fn new(modules: Vec<Arc<dyn Module>>) -> Result<Self> {
        for (i, module) in modules.iter().enumerate() {
            if modules[..i].iter().any(|m| m.directive() == module.directive()) {
                return Err(Error::config(format!(
                    "module '{}' registered twice",
                    module.directive()
                )));
            }
        }
        Ok(Self {
            root: Arc::new(ModuleSet::new(modules)),
        })
    }

    pub fn root(&self) -> &Arc<ModuleSet> {
        &self.root
    }

    /// The set for a condition path, creating missing nodes.
    pub fn node(&self, conditions: &[Condition]) -> Arc<ModuleSet> {
        conditions
            .iter()
            .fold(self.root.clone(), |node, condition| node.child(condition))
    }

    /// The module for `directive` in the set selected by `conditions`.
    pub fn module(&self, directive: &str, conditions: &[Condition]) -> Option<Arc<dyn Module>> {
        self.node(conditions).module(directive).cloned()
    }

    /// The module set that applies to `request`.
    pub fn modules_for_request(&self, request: &RequestContext) -> Arc<ModuleSet> {
        let mut node = self.root.clone();
        while let Some(child) = node.matching_child(request) {
            node = child;
        }
        node
    }
}

/// Configuration scope that routes directives to the modules of one
/// condition path and opens nested `condition` scopes.
pub struct ModulesBlock {
    manager: Arc<ModulesManager>,
    conditions: Vec<Condition>,
}

impl ModulesBlock {
    pub fn new(manager: Arc<ModulesManager>) -> Self {
        Self {
            manager,
            conditions: Vec::new(),
        }
    }

    fn module(&self, command: &Command) -> Result<Arc<dyn Module>> {
        self.manager
            .module(command.name(), &self.conditions)
            .ok_or_else(|| Error::unknown_directive(command))
    }
}

impl Block for ModulesBlock {
    fn call(&mut self, command: &Command) -> Result<()> {
        if command.name() == CONDITION_DIRECTIVE {
            return Err(Error::directive(command, "directive requires a block"));
        }
        self.module(command)?.call(command)
    }

    fn call_block(&mut self, command: &Command) -> Result<Box<dyn Block>> {
        if command.name() != CONDITION_DIRECTIVE {
            return self.module(command)?.call_block(command);
        }

        let mut conditions = self.conditions.clone();
        conditions.push(Condition::from_command(command)?);
        self.manager.node(&conditions);
        Ok(Box::new(ModulesBlock {
            manager: self.manager.clone(),
            conditions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Decoder;
    use crate::egress::Dialer;
    use crate::pipeline::module::{HandleRequest, Hooks};
    use crate::pipeline::request::test_request;
    use prifma_test_support::test_report;
    use std::sync::Mutex;

    /// A module holding a list of words, deep-copied on clone.
    struct Words {
        words: Mutex<Vec<String>>,
    }

    impl Words {
        fn new() -> Arc<dyn Module> {
            Arc::new(Words {
                words: Mutex::new(Vec::new()),
            })
        }
    }

    impl Module for Words {
        fn directive(&self) -> &'static str {
            "words"
        }

        fn clone_module(&self) -> Arc<dyn Module> {
            Arc::new(Words {
                words: Mutex::new(self.words.lock().unwrap().clone()),
            })
        }

        fn call(&self, command: &Command) -> Result<()> {
            self.words.lock().unwrap().extend(command.args().iter().cloned());
            Ok(())
        }

        fn hooks(&self) -> Hooks<'_> {
            Hooks {
                handle_request: Some(self),
                ..Hooks::default()
            }
        }
    }

    impl HandleRequest for Words {
        fn handle_request(&self, result: &mut HandleRequestResult) -> Result<()> {
            let joined = self.words.lock().unwrap().join(",");
            result
                .proxy_connect_headers
                .insert("x-words", joined.parse().unwrap());
            Ok(())
        }
    }

    /// Read a set's words back through its `HandleRequest` hook.
    fn words_of(set: &ModuleSet) -> Vec<String> {
        let request = test_request("GET", "http://probe/", "127.0.0.1:1");
        let mut result = HandleRequestResult::new(request, Dialer::default());
        set.handle_request(&mut result);
        let joined = result.proxy_connect_headers["x-words"].to_str().unwrap();
        joined
            .split(',')
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn configured(text: &str) -> Arc<ModulesManager> {
        let manager = Arc::new(ModulesManager::new(vec![Words::new()]).unwrap());
        let mut block = ModulesBlock::new(manager.clone());
        Decoder::new().decode_str(&mut block, text).unwrap();
        manager
    }

    #[test]
    fn test_resolution_and_isolation() {
        let t = test_report!("Conditional clones resolve per request and stay isolated");
        let manager = configured(
            "words base;\n\
             condition src_ip cidr 10.0.0.0/8 { words a; }\n\
             condition src_ip cidr 192.168.0.0/16 { words b; }\n",
        );

        let neither = manager.modules_for_request(&test_request("GET", "http://x/", "8.8.8.8:1"));
        let a = manager.modules_for_request(&test_request("GET", "http://x/", "10.1.2.3:1"));
        let b = manager.modules_for_request(&test_request("GET", "http://x/", "192.168.1.1:1"));

        t.assert_true("neither is root", Arc::ptr_eq(&neither, manager.root()));
        t.assert_eq("root", &words_of(&neither), &vec!["base".to_string()]);
        t.assert_eq("a", &words_of(&a), &vec!["base".to_string(), "a".to_string()]);
        t.assert_eq("b", &words_of(&b), &vec!["base".to_string(), "b".to_string()]);

        t.action("mutate A's clone after resolution");
        a.module("words").unwrap().call(&Command::new(0, "words", vec!["more".into()])).unwrap();
        t.assert_eq("b untouched", &words_of(&b), &vec!["base".to_string(), "b".to_string()]);
        t.assert_eq("root untouched", &words_of(manager.root()), &vec!["base".to_string()]);
    }

    #[test]
    fn test_first_matching_condition_wins() {
        let t = test_report!("Sibling conditions are tried in insertion order");
        let manager = configured(
            "condition src_ip cidr 10.0.0.0/8 { words wide; }\n\
             condition src_ip cidr 10.1.0.0/16 { words narrow; }\n",
        );
        let set = manager.modules_for_request(&test_request("GET", "http://x/", "10.1.2.3:1"));
        t.assert_eq("first wins", &words_of(&set), &vec!["wide".to_string()]);
    }

    #[test]
    fn test_nested_conditions() {
        let t = test_report!("Nested conditions clone the parent clone");
        let manager = configured(
            "condition src_ip cidr 10.0.0.0/8 {\n  words outer;\n  condition user = bob { words inner; }\n}\n",
        );
        let req = crate::pipeline::request::test_request_with(
            "GET",
            "http://x/",
            "10.0.0.1:1",
            &[("proxy-authorization", "Basic Ym9iOng=")],
        );
        let set = manager.modules_for_request(&req);
        t.assert_eq(
            "nested",
            &words_of(&set),
            &vec!["outer".to_string(), "inner".to_string()],
        );
    }

    #[test]
    fn test_same_condition_reuses_node() {
        let t = test_report!("Repeating a condition reconfigures the same clone");
        let manager = configured(
            "condition user = bob { words one; }\ncondition user = bob { words two; }\n",
        );
        let cond = Condition::new("user", "=", "bob").unwrap();
        let first = manager.node(std::slice::from_ref(&cond));
        let second = manager.node(std::slice::from_ref(&cond));
        t.assert_true("same node", Arc::ptr_eq(&first, &second));
        t.assert_eq("words", &words_of(&first), &vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_clone() {
        let t = test_report!("Racing first references to a condition share one clone");
        let manager = Arc::new(ModulesManager::new(vec![Words::new()]).unwrap());
        let cond = Condition::new("dst_domain", "=", "race.test").unwrap();
        let nodes: Vec<Arc<ModuleSet>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| manager.node(std::slice::from_ref(&cond))))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        t.assert_true(
            "all identical",
            nodes.iter().all(|n| Arc::ptr_eq(n, &nodes[0])),
        );
    }

    #[test]
    fn test_unknown_directive_and_condition_errors() {
        let t = test_report!("Unknown directives and malformed conditions fail to load");
        let manager = Arc::new(ModulesManager::new(vec![Words::new()]).unwrap());
        let mut block = ModulesBlock::new(manager);
        let decoder = Decoder::new();
        t.assert_err("unknown", &decoder.decode_str(&mut block, "nope 1;"), "unknown directive");
        t.assert_err(
            "condition without block",
            &decoder.decode_str(&mut block, "condition user = a;"),
            "requires a block",
        );
        t.assert_err(
            "bad comparator",
            &decoder.decode_str(&mut block, "condition user >> a { }"),
            "unknown comparator",
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let t = test_report!("Registering the same directive twice is rejected");
        let err = ModulesManager::new(vec![Words::new(), Words::new()]);
        t.assert_true("rejected", err.is_err());
    }
}
