//! Command building utilities.

use std::path::PathBuf;

use thiserror::Error;

use crate::shell::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for constructing commands.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command line, e.g. `python3 -I`.
    pub base: String,
    /// Parameters appended after the base.
    pub params: Vec<String>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Split the base and append the parameters.
    ///
    /// # Errors
    /// Returns error if the base cannot be parsed or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = shlex::split(&self.base)
            .ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        parts.extend(self.params.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_with_flags() {
        let parts = CommandBuilder::new("python3 -I")
            .params(["-u", "-c", "print('a b')"])
            .build()
            .unwrap();
        assert_eq!(parts.program, "python3");
        assert_eq!(parts.args, vec!["-I", "-u", "-c", "print('a b')"]);
    }

    #[test]
    fn test_quoted_base() {
        let parts = CommandBuilder::new("'/opt/my python/bin/python3'").build().unwrap();
        assert_eq!(parts.program, "/opt/my python/bin/python3");
        assert!(parts.args.is_empty());
    }

    #[test]
    fn test_invalid_base() {
        assert!(matches!(
            CommandBuilder::new("").build(),
            Err(CommandBuildError::EmptyCommand)
        ));
        assert!(matches!(
            CommandBuilder::new("python3 'unterminated").build(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_executable() {
        let err = CommandParts::new("definitely-not-a-real-interpreter".into(), vec![])
            .into_resolved()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandBuildError::ExecutableNotFound(_)));
    }
}
