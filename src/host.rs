use mlua::{Lua, Result as LuaResult, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A capability handle that can be installed into a Lua session.
pub trait LuaBinding: Send + Sync {
    /// Produce the Lua value bound under this handle's name.
    fn to_lua(&self, lua: &Lua) -> LuaResult<Value>;
}

/// An extension object loaded by the host.
pub trait Extension: LuaBinding {
    /// Name the extension is bound under inside the session.
    fn short_name(&self) -> &str;
}

/// A loaded extension as reported by the host. The instance may be absent
/// when the extension failed to construct or is disabled.
#[derive(Clone)]
pub struct ExtensionContainer {
    pub id: String,
    pub instance: Option<Arc<dyn Extension>>,
}

/// A table of constants made implicitly resolvable inside the session.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub name: String,
    pub members: BTreeMap<String, serde_json::Value>,
}

/// The game-server host the console is attached to.
pub trait Host: Send + Sync {
    /// Whether the host authenticates player identities.
    fn online_mode(&self) -> bool;

    /// Handle for the host platform itself.
    fn game(&self) -> Arc<dyn LuaBinding>;

    /// Handle for the running server.
    fn server(&self) -> Arc<dyn LuaBinding>;

    /// Every loaded extension, in load order.
    fn extensions(&self) -> Vec<ExtensionContainer>;

    fn namespaces(&self) -> Vec<Namespace> {
        Vec::new()
    }
}
