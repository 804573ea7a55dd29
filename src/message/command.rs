//! Commands sent by the controller.

use crate::error::Result;
use crate::version::DecodeContext;
use crate::wire::{WireReader, WireWriter};

use super::{tags, WireMessage};

/// Start instrumenting from a set of root classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateProfilingCommand {
    /// Instrumentation mode understood by the agent (CPU, memory, ...).
    pub instr_type: i32,
    pub instrument_spawned_threads: bool,
    /// Class name patterns instrumentation starts from.
    pub root_classes: Vec<String>,
}

impl WireMessage for InitiateProfilingCommand {
    const TAG: i32 = tags::INITIATE_PROFILING;
    const NAME: &'static str = "initiate_profiling";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        out.put_i32(self.instr_type);
        out.put_bool(self.instrument_spawned_threads);
        out.put_utf_list("root_classes", &self.root_classes)
    }

    fn decode(input: &mut WireReader<'_>, _ctx: &DecodeContext) -> Result<Self> {
        Ok(Self {
            instr_type: input.get_i32("instr_type")?,
            instrument_spawned_threads: input.get_bool("instrument_spawned_threads")?,
            root_classes: input.get_utf_list("root_classes")?,
        })
    }
}

/// Resolve agent-side method ids to class/method/signature names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMethodNamesCommand {
    pub method_ids: Vec<i32>,
}

impl WireMessage for GetMethodNamesCommand {
    const TAG: i32 = tags::GET_METHOD_NAMES;
    const NAME: &'static str = "get_method_names";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        out.put_len("method_ids", self.method_ids.len())?;
        for &id in &self.method_ids {
            out.put_i32(id);
        }
        Ok(())
    }

    fn decode(input: &mut WireReader<'_>, _ctx: &DecodeContext) -> Result<Self> {
        let count = input.get_len("method_ids", 4)?;
        let method_ids = (0..count)
            .map(|_| input.get_i32("method_ids"))
            .collect::<Result<_>>()?;
        Ok(Self { method_ids })
    }
}

/// Every command the controller can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CheckConnection,
    GetVmProperties,
    InitiateProfiling(InitiateProfilingCommand),
    GetMethodNames(GetMethodNamesCommand),
    DumpResults,
    SuspendTargetApp,
    ResumeTargetApp,
    /// Controller disconnects; the agent keeps the target running.
    Detach,
    TerminateTargetJvm,
}

impl Command {
    pub const fn tag(&self) -> i32 {
        match self {
            Self::CheckConnection => tags::CHECK_CONNECTION,
            Self::GetVmProperties => tags::GET_VM_PROPERTIES,
            Self::InitiateProfiling(_) => InitiateProfilingCommand::TAG,
            Self::GetMethodNames(_) => GetMethodNamesCommand::TAG,
            Self::DumpResults => tags::DUMP_RESULTS,
            Self::SuspendTargetApp => tags::SUSPEND_TARGET_APP,
            Self::ResumeTargetApp => tags::RESUME_TARGET_APP,
            Self::Detach => tags::DETACH,
            Self::TerminateTargetJvm => tags::TERMINATE_TARGET_JVM,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::CheckConnection => "check_connection",
            Self::GetVmProperties => "get_vm_properties",
            Self::InitiateProfiling(_) => InitiateProfilingCommand::NAME,
            Self::GetMethodNames(_) => GetMethodNamesCommand::NAME,
            Self::DumpResults => "dump_results",
            Self::SuspendTargetApp => "suspend_target_app",
            Self::ResumeTargetApp => "resume_target_app",
            Self::Detach => "detach",
            Self::TerminateTargetJvm => "terminate_target_jvm",
        }
    }

    /// Tag of the reply this command expects when it succeeds.
    ///
    /// An error acknowledgement is accepted for every command on top of this.
    pub const fn expected_reply(&self) -> i32 {
        match self {
            Self::GetVmProperties => tags::VM_PROPERTIES,
            Self::GetMethodNames(_) => tags::METHOD_NAMES,
            Self::DumpResults => tags::DUMP_RESULTS_RESPONSE,
            _ => tags::ACK,
        }
    }

    /// Whether the agent stops serving after acknowledging this command.
    pub const fn ends_session(&self) -> bool {
        matches!(self, Self::Detach | Self::TerminateTargetJvm)
    }

    pub(crate) fn encode_payload(&self, out: &mut WireWriter) -> Result<()> {
        match self {
            Self::InitiateProfiling(c) => c.encode(out),
            Self::GetMethodNames(c) => c.encode(out),
            _ => Ok(()),
        }
    }
}
