use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

use crate::host::{Host, LuaBinding};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// Lua keywords cannot be used as global names.
const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Names the gateway owns; host objects may not take them.
pub const RESERVED_NAMES: &[&str] = &["me", "print"];

/// Check whether `name` can be bound as a Lua global.
pub fn is_bindable_name(name: &str) -> bool {
    IDENTIFIER.is_match(name) && !LUA_KEYWORDS.contains(&name) && !RESERVED_NAMES.contains(&name)
}

/// Ordered set of named capability handles installed into the session.
#[derive(Default, Clone)]
pub struct BindingRegistry {
    entries: Vec<(String, Arc<dyn LuaBinding>)>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `game`, `server` and every extension instance the host reports.
    pub fn from_host(host: &dyn Host) -> Self {
        let mut registry = Self::new();
        registry.register("game", host.game());
        registry.register("server", host.server());

        for container in host.extensions() {
            let Some(instance) = container.instance else {
                info!("Not registering extension without an instance: {}", container.id);
                continue;
            };
            let name = instance.short_name().to_string();
            info!("Registering extension object: {name}");
            registry.register(&name, instance);
        }
        registry
    }

    /// Add a binding. Returns false if the name is not bindable.
    /// A binding with an existing name replaces the previous one.
    pub fn register(&mut self, name: &str, binding: Arc<dyn LuaBinding>) -> bool {
        if !is_bindable_name(name) {
            warn!("Skipping binding with invalid name: {name:?}");
            return false;
        }
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            warn!("Binding {name} registered twice; replacing the earlier object");
            entry.1 = binding;
        } else {
            self.entries.push((name.to_string(), binding));
        }
        true
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn LuaBinding>)> {
        self.entries.iter().map(|(n, b)| (n.as_str(), b))
    }
}
