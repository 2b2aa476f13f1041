//! The long-lived Lua session shared by every invocation.
//!
//! Globals seen by evaluated code:
//!
//! - `game`, `server` and each extension under its short name
//! - every host namespace, plus implicit lookup of their members
//! - `me`, re-bound to the caller before each evaluation
//! - `print`, which writes back to the caller instead of stdout

use mlua::{
    HookTriggers, Lua, LuaOptions, LuaSerdeExt, MetaMethod, MultiValue, Result as LuaResult,
    StdLib, Table, UserData, UserDataMethods, Value,
};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::config::ConsoleOptions;
use crate::host::Namespace;
use crate::registry::{is_bindable_name, BindingRegistry};
use crate::security::{Invoker, SourceKind};

/// Registry key for the pristine `tostring`, kept out of reach of user code.
const TOSTRING_KEY: &str = "lua_console.tostring";

/// Makes the members of every namespace resolvable as bare globals.
const OPEN_IMPORTS: &str = r#"
local namespaces = ...
setmetatable(_G, {
    __index = function(_, key)
        for _, ns in ipairs(namespaces) do
            local value = rawget(ns, key)
            if value ~= nil then
                return value
            end
        end
    end,
})
"#;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),
}

/// Maximum bytes of caller output kept per evaluation.
pub const MAX_OUTPUT_BYTES: usize = 32_768;

/// Appended once when output went over `MAX_OUTPUT_BYTES`.
pub const TRUNCATED_MARKER: &str = "... (output truncated)";

/// Base-library loaders that reach the filesystem or compile new chunks.
const RESTRICTED_BASE_GLOBALS: &[&str] = &["dofile", "loadfile", "load"];

#[derive(Debug, Default)]
struct OutboxState {
    lines: Vec<String>,
    bytes: usize,
    truncated: bool,
}

/// Messages sent to the caller during one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Outbox(Arc<Mutex<OutboxState>>);

impl Outbox {
    pub fn push(&self, message: String) {
        let mut state = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.truncated {
            return;
        }
        let size = message.len() + 1; // +1 for newline
        if state.bytes + size > MAX_OUTPUT_BYTES {
            state.truncated = true;
            state.lines.push(TRUNCATED_MARKER.to_string());
            return;
        }
        state.bytes += size;
        state.lines.push(message);
    }

    pub fn drain(&self) -> Vec<String> {
        let mut state = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *state).lines
    }
}

/// The invoking identity, bound as `me`.
///
/// - `me:name()` / `me:kind()` / `me:id()`
/// - `me:send(text)`
struct Caller {
    invoker: Invoker,
    outbox: Outbox,
}

fn kind_name(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Console => "console",
        SourceKind::Player => "player",
        SourceKind::CommandBlock => "command_block",
        SourceKind::Rcon => "rcon",
    }
}

impl UserData for Caller {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("name", |_, this, ()| Ok(this.invoker.display_name()));
        methods.add_method("kind", |_, this, ()| Ok(kind_name(this.invoker.kind())));
        methods.add_method("id", |_, this, ()| Ok(this.invoker.identity_token()));
        methods.add_method("send", |_, this, text: String| {
            this.outbox.push(text);
            Ok(())
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.invoker.display_name())
        });
    }
}

pub struct Session {
    lua: Lua,
    instruction_limit: Option<u32>,
}

impl Session {
    /// Build the interpreter and install bindings and namespaces.
    ///
    /// Individual binding or namespace failures are logged and skipped;
    /// only failing to create the interpreter itself is an error.
    pub fn new(
        registry: &BindingRegistry,
        namespaces: &[Namespace],
        options: &ConsoleOptions,
    ) -> Result<Self, SessionError> {
        let lua = Lua::new_with(std_libs(options.unrestricted), LuaOptions::new())?;
        let tostring: mlua::Function = lua.globals().get("tostring")?;
        lua.set_named_registry_value(TOSTRING_KEY, tostring)?;

        // Base is always loaded; its loaders would reach host files.
        if !options.unrestricted {
            let globals = lua.globals();
            for name in RESTRICTED_BASE_GLOBALS {
                globals.raw_set(*name, Value::Nil)?;
            }
        }

        let session = Self {
            lua,
            instruction_limit: options.instruction_limit,
        };

        if let Err(e) = session.open_namespaces(namespaces) {
            warn!("Exception during interpreter environment initialization: {e}");
        }
        session.install_bindings(registry);

        if let Some(limit) = options.memory_limit {
            session.lua.set_memory_limit(limit)?;
        }
        Ok(session)
    }

    fn install_bindings(&self, registry: &BindingRegistry) {
        let globals = self.lua.globals();
        for (name, binding) in registry.iter() {
            let installed = binding
                .to_lua(&self.lua)
                .and_then(|value| globals.set(name, value));
            if let Err(e) = installed {
                warn!("Failed to bind {name}: {e}");
            }
        }
    }

    fn open_namespaces(&self, namespaces: &[Namespace]) -> LuaResult<()> {
        let globals = self.lua.globals();
        let imports = self.lua.create_table()?;

        for namespace in namespaces {
            if !is_bindable_name(&namespace.name) {
                warn!("Skipping namespace with invalid name: {:?}", namespace.name);
                continue;
            }
            let table = namespace_table(&self.lua, namespace)?;
            globals.set(namespace.name.as_str(), table.clone())?;
            imports.raw_push(table)?;
        }

        self.lua
            .load(OPEN_IMPORTS)
            .set_name("=imports")
            .call::<()>(imports)
    }

    /// Re-bind `me` and `print` to `invoker`. Returns the outbox that
    /// collects what evaluated code sends back.
    pub fn bind_caller(&self, invoker: &Invoker) -> LuaResult<Outbox> {
        let outbox = Outbox::default();
        let globals = self.lua.globals();

        globals.set(
            "me",
            Caller {
                invoker: invoker.clone(),
                outbox: outbox.clone(),
            },
        )?;

        let sink = outbox.clone();
        let print = self.lua.create_function(move |lua, args: MultiValue| {
            let parts = args
                .into_iter()
                .map(|value| display(lua, value))
                .collect::<LuaResult<Vec<_>>>()?;
            sink.push(parts.join("\t"));
            Ok(())
        })?;
        globals.set("print", print)?;

        Ok(outbox)
    }

    /// Evaluate `code` and render its values the way `tostring` does.
    pub fn eval(&self, code: &str) -> LuaResult<String> {
        let chunk = self.lua.load(code).set_name("=eval");

        if let Some(limit) = self.instruction_limit {
            self.lua.set_hook(
                HookTriggers::new().every_nth_instruction(limit),
                move |_lua, _debug| {
                    Err(mlua::Error::RuntimeError(format!(
                        "instruction limit exceeded ({limit})"
                    )))
                },
            );
        }

        // Rendering runs `__tostring` metamethods, so it stays under the hook.
        let result = chunk
            .eval::<MultiValue>()
            .and_then(|values| self.render(values));

        if self.instruction_limit.is_some() {
            self.lua.remove_hook();
        }
        result
    }

    fn render(&self, values: MultiValue) -> LuaResult<String> {
        if values.is_empty() {
            return Ok("nil".to_string());
        }
        let parts = values
            .into_iter()
            .map(|value| display(&self.lua, value))
            .collect::<LuaResult<Vec<_>>>()?;
        Ok(parts.join("\t"))
    }

    #[cfg(test)]
    pub fn global<T: mlua::FromLua>(&self, name: &str) -> LuaResult<T> {
        self.lua.globals().get(name)
    }
}

fn std_libs(unrestricted: bool) -> StdLib {
    if unrestricted {
        StdLib::ALL_SAFE
    } else {
        StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE
    }
}

fn display(lua: &Lua, value: Value) -> LuaResult<String> {
    let tostring: mlua::Function = lua.named_registry_value(TOSTRING_KEY)?;
    tostring.call::<String>(value)
}

fn namespace_table(lua: &Lua, namespace: &Namespace) -> LuaResult<Table> {
    let table = lua.create_table()?;
    for (key, value) in &namespace.members {
        table.set(key.as_str(), lua.to_value(value)?)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::standalone::StandaloneHost;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn session_with(options: ConsoleOptions) -> Session {
        let host = StandaloneHost::from_config(&Config::default());
        Session::new(&BindingRegistry::from_host(&host), &[], &options).unwrap()
    }

    fn session() -> Session {
        session_with(ConsoleOptions::default())
    }

    #[test]
    fn test_expression_evaluates() {
        assert_eq!(session().eval("2+2").unwrap(), "4");
    }

    #[test]
    fn test_statements_evaluate() {
        let session = session();
        assert_eq!(session.eval("x = 10").unwrap(), "nil");
        assert_eq!(session.eval("return x * 2, 'done'").unwrap(), "20\tdone");
    }

    #[test]
    fn test_state_persists_between_evaluations() {
        let session = session();
        session.eval("counter = 1").unwrap();
        session.eval("counter = counter + 1").unwrap();
        assert_eq!(session.global::<i64>("counter").unwrap(), 2);
    }

    #[test]
    fn test_host_objects_are_bound() {
        let session = session();
        assert_eq!(session.eval("server:name()").unwrap(), "server");
        assert_eq!(session.eval("tostring(game)").unwrap(), "Game(lua-console)");
    }

    #[test]
    fn test_restricted_session_has_no_os() {
        let session = session();
        assert!(session.eval("os.time()").is_err());
        assert!(session.eval("io.open('x')").is_err());
        assert_eq!(session.eval("string.upper('a')").unwrap(), "A");
    }

    #[test]
    fn test_unrestricted_session_loads_os() {
        let session = session_with(ConsoleOptions {
            unrestricted: true,
            ..Default::default()
        });
        assert_eq!(session.eval("type(os.time())").unwrap(), "number");
    }

    #[test]
    fn test_caller_rebinding() {
        let session = session();
        let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();

        session.bind_caller(&Invoker::Console).unwrap();
        assert_eq!(session.eval("me:kind()").unwrap(), "console");

        session
            .bind_caller(&Invoker::Player {
                id,
                name: Some("alice".to_string()),
            })
            .unwrap();
        assert_eq!(session.eval("me:name()").unwrap(), "alice");
        assert_eq!(
            session.eval("me:id()").unwrap(),
            "11111111-1111-1111-1111-111111111111"
        );
    }

    #[test]
    fn test_print_and_send_reach_outbox() {
        let session = session();
        let outbox = session.bind_caller(&Invoker::Console).unwrap();
        session.eval("print('a', 1); me:send('b')").unwrap();
        assert_eq!(outbox.drain(), vec!["a\t1".to_string(), "b".to_string()]);
        assert!(outbox.drain().is_empty());
    }

    #[test]
    fn test_namespaces_are_open_imported() {
        let host = StandaloneHost::from_config(&Config::default());
        let namespace = Namespace {
            name: "colors".to_string(),
            members: BTreeMap::from([(
                "BLUE".to_string(),
                serde_json::Value::String("blue".to_string()),
            )]),
        };
        let session = Session::new(
            &BindingRegistry::from_host(&host),
            &[namespace],
            &ConsoleOptions::default(),
        )
        .unwrap();
        assert_eq!(session.eval("colors.BLUE").unwrap(), "blue");
        assert_eq!(session.eval("BLUE").unwrap(), "blue");
        assert_eq!(session.eval("UNKNOWN").unwrap(), "nil");
    }

    #[test]
    fn test_shadowed_tostring_does_not_break_rendering() {
        let session = session();
        assert_eq!(session.eval("tostring = nil; return 5").unwrap(), "5");
    }

    #[test]
    fn test_restricted_session_has_no_file_loaders() {
        let session = session();
        assert_eq!(session.eval("type(dofile)").unwrap(), "nil");
        assert_eq!(session.eval("type(loadfile)").unwrap(), "nil");
        assert_eq!(session.eval("type(load)").unwrap(), "nil");
        assert!(session.eval("dofile('/etc/passwd')").is_err());
    }

    #[test]
    fn test_unrestricted_session_keeps_file_loaders() {
        let session = session_with(ConsoleOptions {
            unrestricted: true,
            ..Default::default()
        });
        assert_eq!(session.eval("type(dofile)").unwrap(), "function");
    }

    #[test]
    fn test_output_is_capped() {
        let session = session();
        let outbox = session.bind_caller(&Invoker::Console).unwrap();
        session
            .eval("for i = 1, 100 do print(string.rep('x', 1000)) end")
            .unwrap();
        let lines = outbox.drain();
        let total: usize = lines.iter().map(|l| l.len() + 1).sum();
        assert!(total <= MAX_OUTPUT_BYTES + TRUNCATED_MARKER.len() + 1);
        assert_eq!(lines.last().map(String::as_str), Some(TRUNCATED_MARKER));
        assert_eq!(
            lines.iter().filter(|l| l.as_str() == TRUNCATED_MARKER).count(),
            1
        );
    }

    #[test]
    fn test_memory_limit_stops_large_allocation() {
        let session = session_with(ConsoleOptions {
            memory_limit: Some(4 * 1024 * 1024),
            ..Default::default()
        });
        let err = session.eval("string.rep('x', 64 * 1024 * 1024)").unwrap_err();
        assert!(matches!(err, mlua::Error::MemoryError(_)));
        assert_eq!(session.eval("1 + 1").unwrap(), "2");
    }

    #[test]
    fn test_instruction_limit_covers_tostring_metamethod() {
        let session = session_with(ConsoleOptions {
            instruction_limit: Some(1000),
            ..Default::default()
        });
        let err = session
            .eval(
                "return setmetatable({}, {__tostring = function() \
                 local n = 0 for i = 1, 1e7 do n = n + 1 end return tostring(n) end})",
            )
            .unwrap_err();
        assert!(err.to_string().contains("instruction limit exceeded"));
        assert_eq!(session.eval("1 + 1").unwrap(), "2");
    }

    #[test]
    fn test_instruction_limit_aborts_loop() {
        let session = session_with(ConsoleOptions {
            instruction_limit: Some(10_000),
            ..Default::default()
        });
        let err = session.eval("while true do end").unwrap_err();
        assert!(err.to_string().contains("instruction limit exceeded"));
        assert_eq!(session.eval("1 + 1").unwrap(), "2");
    }
}
