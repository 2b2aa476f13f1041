use std::path::Path;
use tracing::{error, info};

use crate::config::ConsoleOptions;
use crate::gateway::CommandGateway;
use crate::host::Host;
use crate::registry::BindingRegistry;
use crate::security::AllowList;
use crate::session::{Session, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("the server must be in online-mode to use the Lua console")]
    InsecureAuthentication,

    #[error("failed to create the interpreter session: {0}")]
    Session(#[from] SessionError),
}

/// Build the console for `host`. Called once by `main`, which owns the result.
///
/// Refuses to start when the host does not authenticate player identities,
/// since the allow-list would then be matching ids anyone can claim.
pub fn bootstrap(
    host: &dyn Host,
    options: &ConsoleOptions,
    data_dir: &Path,
) -> Result<CommandGateway, BootstrapError> {
    if !host.online_mode() {
        error!("For security reasons, the server must be in online-mode to use the Lua console.");
        return Err(BootstrapError::InsecureAuthentication);
    }

    let registry = BindingRegistry::from_host(host);
    let session = Session::new(&registry, &host.namespaces(), options)?;
    info!(
        "Lua console session ready with bindings: {}",
        registry.names().collect::<Vec<_>>().join(", ")
    );

    let allow_list = AllowList::new(data_dir.join(&options.allow_list_file));
    if let Err(e) = allow_list.ensure_exists() {
        error!(
            "Failed to create allow-list {}: {e}",
            allow_list.path().display()
        );
    }

    Ok(CommandGateway::new(session, allow_list, options.show_traces))
}
