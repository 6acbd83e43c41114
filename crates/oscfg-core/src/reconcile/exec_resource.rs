//! Exec resource handler.
//!
//! State is defined by scripts: the check script exits 100 for "in desired
//! state" and 101 for "not"; the enforce script exits 100 on success. Any
//! other exit code is an error for that resource.

use std::sync::Arc;

use crate::exec::CommandSpec;
use crate::policy::{
    ExecResourceSpec, ExecStepSpec, Interpreter, Resource, ResourceSpec, EXEC_IN_DESIRED_STATE,
    EXEC_NOT_IN_DESIRED_STATE,
};

use super::{HostCapabilities, ResourceError, ResourceHandler};

/// [`ResourceHandler`] for exec resources.
pub struct ExecResourceHandler {
    spec: Option<ExecResourceSpec>,
    caps: Arc<HostCapabilities>,
}

impl ExecResourceHandler {
    /// Registry constructor.
    #[must_use]
    pub fn boxed(resource: &Resource, caps: &Arc<HostCapabilities>) -> Box<dyn ResourceHandler> {
        let spec = match &resource.spec {
            ResourceSpec::Exec(spec) => Some(spec.clone()),
            _ => None,
        };
        Box::new(Self {
            spec,
            caps: Arc::clone(caps),
        })
    }

    fn spec(&self) -> Result<&ExecResourceSpec, ResourceError> {
        self.spec
            .as_ref()
            .ok_or_else(|| ResourceError::Validation("resource spec is not exec".to_string()))
    }

    async fn run_step(&self, step: &ExecStepSpec) -> Result<Option<i32>, ResourceError> {
        let spec = match step.interpreter {
            Interpreter::Shell => CommandSpec::new("/bin/sh", &["-c", step.script.as_str()]),
            Interpreter::Powershell => {
                return Err(ResourceError::Validation(
                    "powershell interpreter is not supported on this host".to_string(),
                ))
            }
        };
        Ok(self.caps.runner.run(&spec).await?.code)
    }
}

fn validate_step(step: &ExecStepSpec) -> Result<(), ResourceError> {
    if step.script.is_empty() {
        return Err(ResourceError::Validation(
            "exec script must not be empty".to_string(),
        ));
    }
    if step.interpreter == Interpreter::Powershell && cfg!(unix) {
        return Err(ResourceError::Validation(
            "powershell interpreter is not supported on this host".to_string(),
        ));
    }
    Ok(())
}

#[async_trait::async_trait]
impl ResourceHandler for ExecResourceHandler {
    async fn validate(&mut self) -> Result<(), ResourceError> {
        let spec = self.spec()?;
        validate_step(&spec.check)?;
        if let Some(enforce) = &spec.enforce {
            validate_step(enforce)?;
        }
        Ok(())
    }

    async fn check(&mut self) -> Result<bool, ResourceError> {
        let step = self.spec()?.check.clone();
        match self.run_step(&step).await? {
            Some(EXEC_IN_DESIRED_STATE) => Ok(true),
            Some(EXEC_NOT_IN_DESIRED_STATE) => Ok(false),
            code => Err(ResourceError::ExecStepCode {
                script: "check",
                code,
            }),
        }
    }

    async fn enforce(&mut self) -> Result<(), ResourceError> {
        let Some(step) = self.spec()?.enforce.clone() else {
            return Err(ResourceError::Validation(
                "resource is out of desired state and no enforce script is set".to_string(),
            ));
        };
        match self.run_step(&step).await? {
            Some(EXEC_IN_DESIRED_STATE) => Ok(()),
            code => Err(ResourceError::ExecStepCode {
                script: "enforce",
                code,
            }),
        }
    }
}
