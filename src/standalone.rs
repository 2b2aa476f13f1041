use mlua::{Lua, LuaSerdeExt, MetaMethod, Result as LuaResult, UserData, UserDataMethods, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

use crate::config::{Config, ExtensionConfig};
use crate::host::{Extension, ExtensionContainer, Host, LuaBinding, Namespace};

const PLATFORM: &str = "lua-console";

/// Host backed by the process configuration. Its objects live in this
/// process and are shared with every evaluation.
pub struct StandaloneHost {
    online_mode: bool,
    game: GameHandle,
    namespaces: Vec<Namespace>,
}

impl StandaloneHost {
    pub fn from_config(config: &Config) -> Self {
        let server = ServerHandle::new(ServerState {
            name: config.server.name.clone(),
            motd: config.server.motd.clone(),
            online_mode: config.server.online_mode,
            max_players: config.server.max_players,
            broadcasts: Vec::new(),
        });

        let extensions = config
            .extensions
            .iter()
            .map(|ext| ExtensionContainer {
                id: ext.id.clone(),
                instance: ext
                    .enabled
                    .then(|| Arc::new(ConfiguredExtension::from_config(ext)) as Arc<dyn Extension>),
            })
            .collect::<Vec<_>>();

        let namespaces = config
            .namespaces
            .iter()
            .map(|(name, members)| Namespace {
                name: name.clone(),
                members: members.clone(),
            })
            .collect();

        Self {
            online_mode: config.server.online_mode,
            game: GameHandle {
                server,
                extensions: extensions.into(),
            },
            namespaces,
        }
    }

    #[cfg(test)]
    pub fn server_handle(&self) -> &ServerHandle {
        &self.game.server
    }
}

impl Host for StandaloneHost {
    fn online_mode(&self) -> bool {
        self.online_mode
    }

    fn game(&self) -> Arc<dyn LuaBinding> {
        Arc::new(self.game.clone())
    }

    fn server(&self) -> Arc<dyn LuaBinding> {
        Arc::new(self.game.server.clone())
    }

    fn extensions(&self) -> Vec<ExtensionContainer> {
        self.game.extensions.to_vec()
    }

    fn namespaces(&self) -> Vec<Namespace> {
        self.namespaces.clone()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Server
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerState {
    pub name: String,
    pub motd: String,
    pub online_mode: bool,
    pub max_players: u32,
    pub broadcasts: Vec<String>,
}

/// Live server object, bound as `server`.
///
/// - `server:name()` / `server:motd()` / `server:set_motd(text)`
/// - `server:online_mode()` / `server:max_players()`
/// - `server:broadcast(text)` / `server:broadcasts()`
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: Arc<RwLock<ServerState>>,
}

impl ServerHandle {
    pub fn new(state: ServerState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> ServerState {
        read(&self.state).clone()
    }

    pub fn broadcast(&self, text: &str) {
        let mut state = write(&self.state);
        info!(server = %state.name, "[broadcast] {text}");
        state.broadcasts.push(text.to_string());
    }
}

impl UserData for ServerHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("name", |_, this, ()| Ok(read(&this.state).name.clone()));
        methods.add_method("motd", |_, this, ()| Ok(read(&this.state).motd.clone()));
        methods.add_method("set_motd", |_, this, motd: String| {
            write(&this.state).motd = motd;
            Ok(())
        });
        methods.add_method("online_mode", |_, this, ()| Ok(read(&this.state).online_mode));
        methods.add_method("max_players", |_, this, ()| Ok(read(&this.state).max_players));
        methods.add_method("broadcast", |_, this, text: String| {
            this.broadcast(&text);
            Ok(())
        });
        methods.add_method("broadcasts", |_, this, ()| Ok(read(&this.state).broadcasts.clone()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("Server({})", read(&this.state).name))
        });
    }
}

impl LuaBinding for ServerHandle {
    fn to_lua(&self, lua: &Lua) -> LuaResult<Value> {
        lua.create_userdata(self.clone()).map(Value::UserData)
    }
}

// =============================================================================
// Game
// =============================================================================

/// Host platform handle, bound as `game`.
///
/// - `game:platform()` / `game:version()`
/// - `game:server()`
/// - `game:extensions()` → ids of extensions with an instance
/// - `game:extension(id)` → extension object or nil
#[derive(Clone)]
pub struct GameHandle {
    server: ServerHandle,
    extensions: Arc<[ExtensionContainer]>,
}

impl GameHandle {
    fn find(&self, id: &str) -> Option<&Arc<dyn Extension>> {
        self.extensions
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.instance.as_ref())
    }
}

impl UserData for GameHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("platform", |_, _, ()| Ok(PLATFORM));
        methods.add_method("version", |_, _, ()| Ok(env!("CARGO_PKG_VERSION")));
        methods.add_method("server", |lua, this, ()| this.server.to_lua(lua));
        methods.add_method("extensions", |_, this, ()| {
            Ok(this
                .extensions
                .iter()
                .filter(|c| c.instance.is_some())
                .map(|c| c.id.clone())
                .collect::<Vec<_>>())
        });
        methods.add_method("extension", |lua, this, id: String| match this.find(&id) {
            Some(ext) => ext.to_lua(lua),
            None => Ok(Value::Nil),
        });
        methods.add_meta_method(MetaMethod::ToString, |_, _, ()| Ok(format!("Game({PLATFORM})")));
    }
}

impl LuaBinding for GameHandle {
    fn to_lua(&self, lua: &Lua) -> LuaResult<Value> {
        lua.create_userdata(self.clone()).map(Value::UserData)
    }
}

// =============================================================================
// Extensions
// =============================================================================

/// Extension declared in the config file, with a mutable property map.
///
/// - `ext:id()` / `ext:name()` / `ext:version()`
/// - `ext:get(key)` / `ext:set(key, value)`
#[derive(Debug, Clone)]
pub struct ConfiguredExtension {
    id: String,
    name: String,
    version: Option<String>,
    short_name: String,
    properties: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
}

impl ConfiguredExtension {
    pub fn from_config(config: &ExtensionConfig) -> Self {
        let short_name = match &config.class {
            Some(class) => class.clone(),
            None => derive_short_name(config.display_name()),
        };
        Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
            version: config.version.clone(),
            short_name,
            properties: Arc::new(RwLock::new(config.properties.clone())),
        }
    }
}

/// Strip everything that cannot appear in a Lua identifier.
fn derive_short_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

impl UserData for ConfiguredExtension {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("id", |_, this, ()| Ok(this.id.clone()));
        methods.add_method("name", |_, this, ()| Ok(this.name.clone()));
        methods.add_method("version", |_, this, ()| Ok(this.version.clone()));
        methods.add_method("get", |lua, this, key: String| {
            match read(&this.properties).get(&key) {
                Some(value) => lua.to_value(value),
                None => Ok(Value::Nil),
            }
        });
        methods.add_method("set", |lua, this, (key, value): (String, Value)| {
            let mut properties = write(&this.properties);
            if value.is_nil() {
                properties.remove(&key);
            } else {
                properties.insert(key, lua.from_value::<serde_json::Value>(value)?);
            }
            Ok(())
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("Extension({})", this.id))
        });
    }
}

impl LuaBinding for ConfiguredExtension {
    fn to_lua(&self, lua: &Lua) -> LuaResult<Value> {
        lua.create_userdata(self.clone()).map(Value::UserData)
    }
}

impl Extension for ConfiguredExtension {
    fn short_name(&self) -> &str {
        &self.short_name
    }
}
