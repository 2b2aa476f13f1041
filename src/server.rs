use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, ServerHandler,
};
use std::sync::Arc;

use crate::gateway::CommandGateway;
use crate::request::EvalRequest;
use crate::security::Validatable;

/// Sent when bootstrap refused to start the console.
pub const INACTIVE_MESSAGE: &str = "The Lua console is not active on this server.";

#[derive(Clone)]
pub struct LuaConsoleServer {
    tool_router: ToolRouter<Self>,
    gateway: Option<Arc<CommandGateway>>,
}

impl LuaConsoleServer {
    /// `None` keeps the server running but inert.
    pub fn new(gateway: Option<CommandGateway>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            gateway: gateway.map(Arc::new),
        }
    }

    fn run_eval(&self, req: &EvalRequest) -> String {
        let Some(gateway) = &self.gateway else {
            return INACTIVE_MESSAGE.to_string();
        };
        if let Err(e) = req.validate() {
            return e.to_string();
        }
        match req.invoker() {
            Ok(invoker) => gateway.execute(&invoker, &req.code),
            Err(e) => e.to_string(),
        }
    }
}

const SERVER_INSTRUCTIONS: &str = r#"A Lua console for the game server. The host's command dispatcher forwards each /eval invocation as a call to the eval tool.

Only the server console and players whose UUIDs are listed in allowedPlayers.txt may evaluate code. Command blocks and RCON connections are always refused.

Evaluated code can reach:
- game: the host platform (game:server(), game:extensions(), game:extension(id))
- server: the running server (name, motd, broadcast, ...)
- every loaded extension, under its short name
- me: the caller (me:name(), me:kind(), me:id(), me:send(text))
- print(...): sends a line back to the caller"#;

#[rmcp::tool_router]
impl LuaConsoleServer {
    #[tool(description = "Executes Lua code on the server. Only usable by the console and by players whose UUIDs are in allowedPlayers.txt.

Usage: <code>

Expressions return their value (\"2+2\" responds \"Result: 4\"); statements run for their effects. Errors raised by the code are returned as their message.

Example: {\"code\": \"server:name()\", \"source\": \"player\", \"player_id\": \"11111111-1111-1111-1111-111111111111\"}")]
    fn eval(&self, Parameters(req): Parameters<EvalRequest>) -> String {
        self.run_eval(&req)
    }
}

#[rmcp::tool_handler]
impl ServerHandler for LuaConsoleServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(SERVER_INSTRUCTIONS.to_string()),
        }
    }
}
