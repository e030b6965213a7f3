//! Action handlers and the module registry.
//!
//! Handlers are looked up by module, then by action name. The dispatcher is
//! the only caller: the executor never invokes a handler directly, it only
//! publishes a trigger and waits for the completion signal.

use crate::context::Context;
use crate::errors::ActionError;
use async_trait::async_trait;
use conductor_common::{ActionDescriptor, ActionId, Params};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Work performed for one action of one context.
///
/// Returning `Ok` marks the action done for the context; returning an error
/// fails the action and drives the context to `error`.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: Arc<Context>, params: Params) -> Result<(), ActionError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Arc<Context>, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
{
    async fn handle(&self, ctx: Arc<Context>, params: Params) -> Result<(), ActionError> {
        (self.0)(ctx, params).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Arc<Context>, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A registered action: its metadata and the code that runs it.
#[derive(Clone)]
pub struct RegisteredAction {
    pub descriptor: Arc<ActionDescriptor>,
    pub handler: Arc<dyn ActionHandler>,
}

/// All actions registered for one module.
#[derive(Clone, Default)]
pub struct Module {
    name: String,
    actions: HashMap<String, RegisteredAction>,
}

impl Module {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_action(&self, name: &str) -> Option<&RegisteredAction> {
        self.actions.get(name)
    }

    /// Action names, sorted.
    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Module name → module.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action; `false` if the id is already taken (the first one stays).
    pub fn insert(&self, descriptor: Arc<ActionDescriptor>, handler: Arc<dyn ActionHandler>) -> bool {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        let module = modules
            .entry(descriptor.module.clone())
            .or_insert_with(|| Module {
                name: descriptor.module.clone(),
                actions: HashMap::new(),
            });

        if module.actions.contains_key(&descriptor.name) {
            return false;
        }
        module.actions.insert(
            descriptor.name.clone(),
            RegisteredAction {
                descriptor,
                handler,
            },
        );
        true
    }

    /// A snapshot of one module.
    pub fn resolve(&self, module: &str) -> Option<Module> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
    }

    /// Find one action without copying its module.
    pub fn lookup(&self, id: &ActionId) -> Option<RegisteredAction> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.module())
            .and_then(|m| m.get_action(id.name()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|m| m.actions.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
