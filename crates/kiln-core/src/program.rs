//! Program compilation and build diagnostics.

use std::sync::Arc;

use crate::context::Context;
use crate::device::Device;
use crate::error::{KilnError, Result};
use crate::handle::{Handle, ProgramKind};
use crate::info;
use crate::runtime::types::build_status;
use crate::runtime::{BuildInfo, SharedRuntime, Status};

/// Where a program is in its build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    Built,
    /// The last build failed; no kernels can be created.
    Failed,
}

/// A translation unit registered from source text or a prebuilt binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    handle: Handle<ProgramKind>,
    state: BuildState,
}

impl Program {
    /// Register `source` with the context. Nothing is compiled until
    /// [`Program::build`].
    pub fn from_source(context: &Context, source: &str) -> Result<Program> {
        let (raw_context, rt) = context.handle().parts()?;
        let raw = rt
            .create_program_with_source(raw_context, source)
            .map_err(|status| KilnError::resource("clCreateProgramWithSource", status))?;
        tracing::debug!("created program {} from {} bytes of source", raw, source.len());
        Ok(Program { handle: Handle::adopt(Arc::clone(rt), raw), state: BuildState::Unbuilt })
    }

    /// Load a prebuilt binary for `device`. The binary still has to be
    /// built before kernels can be created from it.
    pub fn from_binary(device: &Device, context: &Context, binary: &[u8]) -> Result<Program> {
        let (raw_context, rt) = context.handle().parts()?;
        let raw = rt
            .create_program_with_binary(raw_context, device.handle().get()?, binary)
            .map_err(|status| KilnError::resource("clCreateProgramWithBinary", status))?;
        tracing::debug!("created program {} from {} byte binary", raw, binary.len());
        Ok(Program { handle: Handle::adopt(Arc::clone(rt), raw), state: BuildState::Unbuilt })
    }

    pub fn handle(&self) -> &Handle<ProgramKind> {
        &self.handle
    }

    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.handle.runtime()
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Compile for `device`. `options` are joined with spaces and handed to
    /// the compiler as-is.
    ///
    /// When compilation fails the full build log is written to stderr and
    /// returned in [`KilnError::Build`]; the program is then unusable for
    /// kernels. Other rejections (a live kernel, a foreign device) are
    /// [`KilnError::Resource`] errors and leave the program as it was.
    pub fn build(&mut self, device: &Device, options: &[&str]) -> Result<()> {
        let (raw, rt) = self.handle.parts()?;
        let raw_device = device.handle().get()?;
        let options = options.join(" ");
        match rt.build_program(raw, raw_device, &options) {
            Ok(()) => {
                tracing::debug!("built program {} (options {:?})", raw, options);
                self.state = BuildState::Built;
                Ok(())
            }
            Err(status) if status != Status::BUILD_PROGRAM_FAILURE && status != Status::INVALID_BUILD_OPTIONS => {
                // Not a compile failure: the previous build, if any, stands.
                tracing::error!("runtime rejected build of program {}: {}", raw, status);
                Err(KilnError::resource("clBuildProgram", status))
            }
            Err(status) => {
                self.state = BuildState::Failed;
                let log = match self.build_log(device) {
                    Ok(log) => log,
                    Err(e) => {
                        tracing::warn!("no build log for program {}: {}", raw, e);
                        String::new()
                    }
                };
                tracing::error!("build of program {} failed: {}", raw, status);
                if !log.is_empty() {
                    eprintln!("{}", log);
                }
                Err(KilnError::Build { status, log })
            }
        }
    }

    /// The compiler output of the last build for `device`.
    pub fn build_log(&self, device: &Device) -> Result<String> {
        let (raw, rt) = self.handle.parts()?;
        let raw_device = device.handle().get()?;
        info::read_string("clGetProgramBuildInfo(Log)", |out| {
            rt.program_build_info(raw, raw_device, BuildInfo::Log, out)
        })
    }

    /// Raw build status for `device` as reported by the runtime.
    pub fn build_status(&self, device: &Device) -> Result<BuildState> {
        let (raw, rt) = self.handle.parts()?;
        let raw_device = device.handle().get()?;
        let status: i32 = info::read_pod("clGetProgramBuildInfo(Status)", |out| {
            rt.program_build_info(raw, raw_device, BuildInfo::Status, out)
        })?;
        match status {
            build_status::SUCCESS => Ok(BuildState::Built),
            build_status::ERROR => Ok(BuildState::Failed),
            build_status::NONE => Ok(BuildState::Unbuilt),
            other => Err(KilnError::query(
                format!("clGetProgramBuildInfo(Status) returned {}", other),
                Status::INVALID_VALUE,
            )),
        }
    }
}
