//! Command registry - validates and dispatches incoming action requests

use super::handler::{ActionHandler, ActionOutcome, Command, UserData};
use super::process::{ProcessRunner, SystemRunner};
use device_cloud_shared::{now_ms, ActionRequest};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Errors raised by registration and dispatch
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Action \"{0}\" already has a callback")]
    Duplicate(String),

    #[error("Action \"{0}\" does not have a callback")]
    Unknown(String),

    #[error("Action \"{name}\" failed: {source}")]
    HandlerExecution {
        name: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
}

/// Maps action names to handlers for one client
///
/// The map lock is only held for lookups and mutation; handlers run after
/// it is released.
pub struct CommandRegistry<C> {
    commands: RwLock<HashMap<String, Arc<Command<C>>>>,
    runner: Arc<dyn ProcessRunner>,
}

impl<C> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CommandRegistry<C> {
    /// Create a registry that runs external commands on the host
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    /// Create a registry with a custom process runner
    pub fn with_runner(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
            runner,
        }
    }

    /// Register a handler under `name`
    pub async fn register(
        &self,
        name: impl Into<String>,
        handler: ActionHandler<C>,
        user_data: Option<UserData>,
    ) -> Result<(), CommandError> {
        let name = name.into();
        let mut commands = self.commands.write().await;

        if commands.contains_key(&name) {
            warn!("[ACTION] Refusing duplicate registration of {}", name);
            return Err(CommandError::Duplicate(name));
        }

        let command = Command::new(name.clone(), handler, user_data);
        info!("[ACTION] Registered {}", command);
        commands.insert(name, Arc::new(command));
        Ok(())
    }

    /// Remove the handler registered under `name`
    pub async fn unregister(&self, name: &str) -> Result<(), CommandError> {
        match self.commands.write().await.remove(name) {
            Some(_) => {
                info!("[ACTION] Deregistered {}", name);
                Ok(())
            }
            None => Err(CommandError::Unknown(name.to_string())),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.commands.read().await.contains_key(name)
    }

    /// Registered action names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.commands.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.commands.read().await.is_empty()
    }

    /// Run the handler registered for `request.name`
    pub async fn dispatch(
        &self,
        client: &C,
        request: &ActionRequest,
    ) -> Result<ActionOutcome, CommandError> {
        let command = self
            .commands
            .read()
            .await
            .get(&request.name)
            .cloned()
            .ok_or_else(|| CommandError::Unknown(request.name.clone()))?;

        let start_time = now_ms();
        debug!(
            "[ACTION] Executing {} (request {})",
            request.name, request.request_id
        );

        let result = command
            .execute(client, request, self.runner.as_ref())
            .await
            .map_err(|source| CommandError::HandlerExecution {
                name: request.name.clone(),
                source: source.into(),
            });

        let elapsed = now_ms().saturating_sub(start_time);
        match &result {
            Ok(outcome) => debug!(
                "[ACTION] {} finished with status {} in {}ms",
                request.name,
                outcome.status(),
                elapsed
            ),
            Err(e) => warn!("[ACTION] {}", e),
        }

        result
    }
}
