//! The module pipeline: modules, their hooks, conditions and the
//! condition-scoped module sets requests are resolved against.

pub mod condition;
pub mod manager;
pub mod module;
pub mod request;

pub use condition::{Cidr, Condition, ConditionKey, ConditionTester};
pub use manager::{ModuleSet, ModulesBlock, ModulesManager};
pub use module::{parse_switch, AfterWriteResponse, BeforeHandleRequest, HandleRequest, Hooks, Module};
pub use request::{split_host_port, HandleRequestResult, ProxySelector, RequestContext};
