//! Action handlers and their results

use super::process::{build_argv, ProcessOutcome, ProcessRunner};
use anyhow::Context;
use device_cloud_shared::{status, ActionRequest, Params};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque context supplied at registration and handed back to the handler
pub type UserData = Arc<dyn Any + Send + Sync>;

/// What an in-process handler returns
pub type HandlerResult = anyhow::Result<ActionOutcome>;

type ClientFn<C> = dyn Fn(&C) -> HandlerResult + Send + Sync;
type ClientParamsFn<C> = dyn Fn(&C, &Params) -> HandlerResult + Send + Sync;
type ClientParamsDataFn<C> = dyn Fn(&C, &Params, Option<&UserData>) -> HandlerResult + Send + Sync;
type FullFn<C> =
    dyn Fn(&C, &Params, Option<&UserData>, &ActionRequest) -> HandlerResult + Send + Sync;

/// Result of running an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Handler ran and succeeded
    Completed { message: String },
    /// Handler ran and reported a failure
    Failed { message: String },
    /// External process ran; any exit code is reported as data
    Process(ProcessOutcome),
}

impl ActionOutcome {
    pub fn completed(message: impl Into<String>) -> Self {
        ActionOutcome::Completed {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ActionOutcome::Failed {
            message: message.into(),
        }
    }

    /// Status code reported to the cloud
    pub fn status(&self) -> i32 {
        match self {
            ActionOutcome::Completed { .. } => status::SUCCESS,
            ActionOutcome::Failed { .. } => status::FAILURE,
            ActionOutcome::Process(outcome) => {
                outcome.output.code.unwrap_or(status::EXECUTION_FAILURE)
            }
        }
    }

    /// Message reported to the cloud
    pub fn message(&self) -> String {
        match self {
            ActionOutcome::Completed { message } | ActionOutcome::Failed { message } => {
                message.clone()
            }
            ActionOutcome::Process(outcome) => outcome.to_string(),
        }
    }
}

/// The executable logic bound to an action name
///
/// In-process handlers come in four shapes and receive a growing prefix of
/// (client, params, user data, request). The shape is picked at registration.
pub enum ActionHandler<C> {
    Client(Arc<ClientFn<C>>),
    ClientParams(Arc<ClientParamsFn<C>>),
    ClientParamsData(Arc<ClientParamsDataFn<C>>),
    Full(Arc<FullFn<C>>),
    /// Run an external program with the parameters as `--key[=value]` flags
    Process { program: String },
}

impl<C> ActionHandler<C> {
    pub fn client<F>(f: F) -> Self
    where
        F: Fn(&C) -> HandlerResult + Send + Sync + 'static,
    {
        ActionHandler::Client(Arc::new(f))
    }

    pub fn client_params<F>(f: F) -> Self
    where
        F: Fn(&C, &Params) -> HandlerResult + Send + Sync + 'static,
    {
        ActionHandler::ClientParams(Arc::new(f))
    }

    pub fn client_params_data<F>(f: F) -> Self
    where
        F: Fn(&C, &Params, Option<&UserData>) -> HandlerResult + Send + Sync + 'static,
    {
        ActionHandler::ClientParamsData(Arc::new(f))
    }

    pub fn full<F>(f: F) -> Self
    where
        F: Fn(&C, &Params, Option<&UserData>, &ActionRequest) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        ActionHandler::Full(Arc::new(f))
    }

    pub fn process(program: impl Into<String>) -> Self {
        ActionHandler::Process {
            program: program.into(),
        }
    }

    /// Number of arguments an in-process handler takes; 0 for processes
    pub fn arity(&self) -> usize {
        match self {
            ActionHandler::Client(_) => 1,
            ActionHandler::ClientParams(_) => 2,
            ActionHandler::ClientParamsData(_) => 3,
            ActionHandler::Full(_) => 4,
            ActionHandler::Process { .. } => 0,
        }
    }
}

impl<C> Clone for ActionHandler<C> {
    fn clone(&self) -> Self {
        match self {
            ActionHandler::Client(f) => ActionHandler::Client(f.clone()),
            ActionHandler::ClientParams(f) => ActionHandler::ClientParams(f.clone()),
            ActionHandler::ClientParamsData(f) => ActionHandler::ClientParamsData(f.clone()),
            ActionHandler::Full(f) => ActionHandler::Full(f.clone()),
            ActionHandler::Process { program } => ActionHandler::Process {
                program: program.clone(),
            },
        }
    }
}

/// A registered action: name, handler and optional user data
pub struct Command<C> {
    name: String,
    handler: ActionHandler<C>,
    user_data: Option<UserData>,
}

impl<C> Command<C> {
    pub fn new(name: impl Into<String>, handler: ActionHandler<C>, user_data: Option<UserData>) -> Self {
        Self {
            name: name.into(),
            handler,
            user_data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &ActionHandler<C> {
        &self.handler
    }

    /// Run the handler for a request
    pub(crate) async fn execute(
        &self,
        client: &C,
        request: &ActionRequest,
        runner: &dyn ProcessRunner,
    ) -> HandlerResult {
        let user_data = self.user_data.as_ref();

        match &self.handler {
            ActionHandler::Client(f) => f(client),
            ActionHandler::ClientParams(f) => f(client, &request.params),
            ActionHandler::ClientParamsData(f) => f(client, &request.params, user_data),
            ActionHandler::Full(f) => f(client, &request.params, user_data, request),
            ActionHandler::Process { program } => {
                let argv = build_argv(program, &request.params);
                let output = runner
                    .run(&argv)
                    .await
                    .with_context(|| format!("failed to run {}", program))?;
                Ok(ActionOutcome::Process(ProcessOutcome { argv, output }))
            }
        }
    }
}

impl<C> fmt::Display for Command<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handler {
            ActionHandler::Process { program } => {
                write!(f, "Action {} --> Command \"{}\"", self.name, program)
            }
            handler => write!(f, "Action {} --> Callback/{}", self.name, handler.arity()),
        }
    }
}

impl<C> fmt::Debug for Command<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("arity", &self.handler.arity())
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProcessOutput;

    #[test]
    fn test_outcome_status() {
        assert_eq!(ActionOutcome::completed("ok").status(), status::SUCCESS);
        assert_eq!(ActionOutcome::failed("no").status(), status::FAILURE);

        let outcome = ActionOutcome::Process(ProcessOutcome {
            argv: vec!["tool".into()],
            output: ProcessOutput {
                code: Some(3),
                stdout: b"out\n".to_vec(),
                stderr: Vec::new(),
            },
        });
        assert_eq!(outcome.status(), 3);
        assert!(outcome.message().contains("stdout: out"));
    }

    #[test]
    fn test_handler_arity() {
        let h: ActionHandler<()> = ActionHandler::client(|_| Ok(ActionOutcome::completed("")));
        assert_eq!(h.arity(), 1);
        let h: ActionHandler<()> =
            ActionHandler::full(|_, _, _, _| Ok(ActionOutcome::completed("")));
        assert_eq!(h.arity(), 4);
        assert_eq!(ActionHandler::<()>::process("ls").arity(), 0);
    }

    #[test]
    fn test_command_display() {
        let cmd: Command<()> = Command::new("list", ActionHandler::process("/bin/ls"), None);
        assert_eq!(cmd.to_string(), "Action list --> Command \"/bin/ls\"");
    }
}
