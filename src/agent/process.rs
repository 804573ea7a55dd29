//! Agent that reports on the process it runs in.
//!
//! Answers every command with facts the operating system exposes about the
//! current process. It has no bytecode instrumentation, so method lookups
//! and result dumps carry no data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, info};

use super::CommandHandler;
use crate::message::{
    AckResponse, Command, DumpResultsResponse, InitiateProfilingCommand, MethodNamesResponse,
    Response, VmFacts, VmPropertiesResponse,
};
use crate::version::ProtocolVersion;

/// [`CommandHandler`] for the process hosting it.
#[derive(Debug)]
pub struct ProcessAgent {
    version: ProtocolVersion,
    agent_id: i32,
    startup_time_millis: i64,
    startup_time_in_counts: i64,
    suspended: AtomicBool,
    profiling: Mutex<Option<InitiateProfilingCommand>>,
}

impl ProcessAgent {
    /// Agent implementing `version`, identified to controllers as `agent_id`.
    #[must_use]
    pub fn new(version: ProtocolVersion, agent_id: i32) -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            version,
            agent_id,
            startup_time_millis: i64::try_from(since_epoch.as_millis()).unwrap_or(i64::MAX),
            startup_time_in_counts: i64::try_from(since_epoch.as_nanos()).unwrap_or(i64::MAX),
            suspended: AtomicBool::new(false),
            profiling: Mutex::new(None),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    pub fn is_profiling(&self) -> bool {
        self.profiling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn facts(&self) -> VmFacts {
        let mut args = std::env::args();
        let command = args.next();
        let arguments = args.collect::<Vec<_>>().join(" ");

        VmFacts {
            jdk_version: Some(concat!("profiler-wire ", env!("CARGO_PKG_VERSION")).to_string()),
            // no class loader, so no class or boot paths to report
            java_class_path: None,
            java_ext_dirs: None,
            boot_class_path: None,
            working_dir: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
            jvm_arguments: Some(arguments),
            java_command: command,
            target_machine_os_name: Some(std::env::consts::OS.to_string()),
            can_instrument_constructor: false,
            max_heap_size: 0,
            startup_time_millis: self.startup_time_millis,
            startup_time_in_counts: self.startup_time_in_counts,
            agent_id: self.agent_id,
        }
    }
}

#[async_trait]
impl CommandHandler for ProcessAgent {
    async fn handle(&self, command: Command) -> Response {
        match command {
            Command::CheckConnection | Command::Detach => Response::Ack(AckResponse::ok()),
            Command::GetVmProperties => {
                Response::VmProperties(VmPropertiesResponse::new(self.version, self.facts()))
            }
            Command::InitiateProfiling(cmd) => {
                if cmd.root_classes.is_empty() {
                    return Response::Ack(AckResponse::error("no root classes given"));
                }
                info!(instr_type = cmd.instr_type, roots = cmd.root_classes.len(), "Profiling initiated");
                *self.profiling.lock().unwrap_or_else(PoisonError::into_inner) = Some(cmd);
                Response::Ack(AckResponse::ok())
            }
            Command::GetMethodNames(cmd) => match cmd.method_ids.first() {
                None => Response::MethodNames(MethodNamesResponse { names: Vec::new() }),
                Some(id) => Response::Ack(AckResponse::error(format!("unknown method id {id}"))),
            },
            Command::DumpResults => {
                if self.is_profiling() {
                    Response::DumpResults(DumpResultsResponse::default())
                } else {
                    Response::Ack(AckResponse::error("profiling has not been initiated"))
                }
            }
            Command::SuspendTargetApp => {
                self.suspended.store(true, Ordering::Relaxed);
                debug!("Target marked suspended");
                Response::Ack(AckResponse::ok())
            }
            Command::ResumeTargetApp => {
                self.suspended.store(false, Ordering::Relaxed);
                debug!("Target marked resumed");
                Response::Ack(AckResponse::ok())
            }
            Command::TerminateTargetJvm => {
                Response::Ack(AckResponse::error("this agent does not terminate its host"))
            }
        }
    }
}
