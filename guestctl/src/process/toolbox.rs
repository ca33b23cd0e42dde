//! Built-in guest tools.
//!
//! Operations without a dedicated message (stat, mkdir, rm, mktemp) run one
//! of the guest's helper tools and parse its machine-readable stdout.

use super::stream::{GuestProcessStream, StreamBlock};
use super::{ProcessStartupInfo, ProcessStatus, ProcessWaitFlags, ProcessWaitResult};
use crate::session::Session;
use crate::session::wait::Deadline;
use guestctl_shared::constants::{handles, toolbox, transfer};
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::flags::ProcessCreateFlags;
use std::time::Duration;

/// Map a tool's exit code to a guest result code.
pub fn exit_code_to_rc(tool: &str, exit_code: i32) -> GuestRc {
    use toolbox::exit;

    if exit_code == exit::SUCCESS {
        return GuestRc::SUCCESS;
    }
    if exit_code == exit::SYNTAX {
        return GuestRc::INTERNAL_ERROR;
    }

    match (tool, exit_code) {
        (toolbox::STAT, exit::ACCESS_DENIED) => GuestRc::ACCESS_DENIED,
        (toolbox::STAT, exit::FILE_NOT_FOUND) => GuestRc::FILE_NOT_FOUND,
        (toolbox::STAT, exit::PATH_NOT_FOUND) => GuestRc::PATH_NOT_FOUND,
        (toolbox::STAT, exit::NET_PATH_NOT_FOUND) => GuestRc::NET_PATH_NOT_FOUND,
        (toolbox::MKDIR | toolbox::MKTEMP, exit::FAILURE) => GuestRc::CANT_CREATE,
        (toolbox::RM, exit::FAILURE) => GuestRc::FILE_NOT_FOUND,
        (toolbox::LS, exit::FAILURE) => GuestRc::PATH_NOT_FOUND,
        _ => GuestRc::GENERAL_FAILURE,
    }
}

/// One tool invocation.
#[derive(Debug, Clone)]
pub struct ProcessTool {
    tool: &'static str,
    args: Vec<String>,
    /// Path or name reported in errors.
    subject: String,
}

impl ProcessTool {
    pub fn new(tool: &'static str, subject: impl Into<String>) -> Self {
        Self {
            tool,
            args: Vec::new(),
            subject: subject.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run to completion and return the parsed stdout blocks.
    pub async fn run(&self, session: &Session, timeout: Duration) -> GuestctlResult<Vec<StreamBlock>> {
        let startup = ProcessStartupInfo::new(self.tool)
            .arg(self.tool)
            .args(self.args.iter().cloned())
            .flags(ProcessCreateFlags::HIDDEN | ProcessCreateFlags::WAIT_FOR_STDOUT)
            .timeout(timeout);
        let process = session.process_create(startup)?;

        let result = self.drive(&process, timeout).await;
        session.process_unregister(process.object_id());
        let stdout = result?;

        let exit_code = match process.status() {
            ProcessStatus::TerminatedNormally => process.exit_code().unwrap_or(0),
            status => {
                tracing::debug!(tool = self.tool, %status, "Guest tool did not exit normally");
                return Err(GuestctlError::guest(
                    GuestErrorKind::Toolbox,
                    GuestRc::GENERAL_FAILURE,
                    self.subject.clone(),
                ));
            }
        };
        let rc = exit_code_to_rc(self.tool, exit_code);
        if rc.is_failure() {
            tracing::debug!(tool = self.tool, exit_code, rc = rc.0, "Guest tool failed");
            return Err(GuestctlError::guest(GuestErrorKind::Toolbox, rc, self.subject.clone()));
        }

        let mut stream = GuestProcessStream::new();
        stream.add_data(&stdout);
        stream.into_blocks()
    }

    async fn drive(&self, process: &super::GuestProcess, timeout: Duration) -> GuestctlResult<Vec<u8>> {
        let deadline = Deadline::after(timeout);
        process.start().await?;

        let mut stdout = Vec::new();
        let chunk = transfer::CHUNK_SIZE as u32;
        loop {
            let Some(remaining) = deadline.remaining() else {
                return Err(self.timed_out());
            };
            let waited = process
                .wait_for(ProcessWaitFlags::TERMINATE | ProcessWaitFlags::STDOUT, remaining)
                .await?;
            match waited {
                ProcessWaitResult::StdOut | ProcessWaitResult::WaitFlagNotSupported => {
                    let Some(remaining) = deadline.remaining() else {
                        return Err(self.timed_out());
                    };
                    let data = process.read(handles::STDOUT, chunk, remaining).await?;
                    if data.is_empty() {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    stdout.extend_from_slice(&data);
                }
                ProcessWaitResult::Terminate => break,
                ProcessWaitResult::Timeout => return Err(self.timed_out()),
                other => {
                    tracing::trace!(tool = self.tool, ?other, "Guest tool wait");
                }
            }
        }
        Ok(stdout)
    }

    fn timed_out(&self) -> GuestctlError {
        GuestctlError::timeout(format_args!("guest tool {} on \"{}\"", self.tool, self.subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_to_rc(toolbox::STAT, 0), GuestRc::SUCCESS);
        assert_eq!(exit_code_to_rc(toolbox::STAT, 4), GuestRc::FILE_NOT_FOUND);
        assert_eq!(exit_code_to_rc(toolbox::STAT, 5), GuestRc::PATH_NOT_FOUND);
        assert_eq!(exit_code_to_rc(toolbox::MKDIR, 1), GuestRc::CANT_CREATE);
        assert_eq!(exit_code_to_rc(toolbox::RM, 1), GuestRc::FILE_NOT_FOUND);
        assert_eq!(exit_code_to_rc(toolbox::LS, 1), GuestRc::PATH_NOT_FOUND);
        assert_eq!(exit_code_to_rc(toolbox::CAT, 2), GuestRc::INTERNAL_ERROR);
        assert_eq!(exit_code_to_rc(toolbox::CAT, 9), GuestRc::GENERAL_FAILURE);
    }
}
