//! Registry mapping type tags to decoders.
//!
//! Frames arrive untyped; the registry turns `(tag, payload)` into a typed
//! [`Message`]. Range checks run before lookup so a cross-wired tag is a
//! protocol violation rather than a silent decode into the wrong type.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::message::{
    tags, AckResponse, AgentLogEvent, BufferDumpedEvent, Command, DumpResultsResponse, Endpoint,
    Event, GetMethodNamesCommand, InitiateProfilingCommand, Message, MessageKind,
    MethodNamesResponse, Response, VmPropertiesResponse, WireMessage,
};
use crate::version::DecodeContext;
use crate::wire::{Frame, WireReader};

/// Decoder for one tag's payload.
pub type DecodeFn = fn(&mut WireReader<'_>, &DecodeContext) -> Result<Message>;

struct Entry {
    name: &'static str,
    decode: DecodeFn,
}

/// Tag → decoder dispatch table.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<i32, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every message type this build knows.
    pub fn standard() -> Self {
        let mut registry = Self::new();

        registry.register(tags::CHECK_CONNECTION, "check_connection", |_, _| {
            Ok(Command::CheckConnection.into())
        });
        registry.register(tags::GET_VM_PROPERTIES, "get_vm_properties", |_, _| {
            Ok(Command::GetVmProperties.into())
        });
        registry.register(
            InitiateProfilingCommand::TAG,
            InitiateProfilingCommand::NAME,
            |input, ctx| {
                let cmd = InitiateProfilingCommand::decode(input, ctx)?;
                Ok(Command::InitiateProfiling(cmd).into())
            },
        );
        registry.register(
            GetMethodNamesCommand::TAG,
            GetMethodNamesCommand::NAME,
            |input, ctx| Ok(Command::GetMethodNames(GetMethodNamesCommand::decode(input, ctx)?).into()),
        );
        registry.register(tags::DUMP_RESULTS, "dump_results", |_, _| {
            Ok(Command::DumpResults.into())
        });
        registry.register(tags::SUSPEND_TARGET_APP, "suspend_target_app", |_, _| {
            Ok(Command::SuspendTargetApp.into())
        });
        registry.register(tags::RESUME_TARGET_APP, "resume_target_app", |_, _| {
            Ok(Command::ResumeTargetApp.into())
        });
        registry.register(tags::DETACH, "detach", |_, _| Ok(Command::Detach.into()));
        registry.register(tags::TERMINATE_TARGET_JVM, "terminate_target_jvm", |_, _| {
            Ok(Command::TerminateTargetJvm.into())
        });

        registry.register(AckResponse::TAG, AckResponse::NAME, |input, ctx| {
            Ok(Response::Ack(AckResponse::decode(input, ctx)?).into())
        });
        registry.register(VmPropertiesResponse::TAG, VmPropertiesResponse::NAME, |input, ctx| {
            Ok(Response::VmProperties(VmPropertiesResponse::decode(input, ctx)?).into())
        });
        registry.register(MethodNamesResponse::TAG, MethodNamesResponse::NAME, |input, ctx| {
            Ok(Response::MethodNames(MethodNamesResponse::decode(input, ctx)?).into())
        });
        registry.register(DumpResultsResponse::TAG, DumpResultsResponse::NAME, |input, ctx| {
            Ok(Response::DumpResults(DumpResultsResponse::decode(input, ctx)?).into())
        });

        registry.register(BufferDumpedEvent::TAG, BufferDumpedEvent::NAME, |input, ctx| {
            Ok(Event::BufferDumped(BufferDumpedEvent::decode(input, ctx)?).into())
        });
        registry.register(AgentLogEvent::TAG, AgentLogEvent::NAME, |input, ctx| {
            Ok(Event::AgentLog(AgentLogEvent::decode(input, ctx)?).into())
        });

        registry
    }

    /// Register a decoder. Returns false, keeping the existing entry, if the
    /// tag is already taken.
    pub fn register(&mut self, tag: i32, name: &'static str, decode: DecodeFn) -> bool {
        if let Some(existing) = self.entries.get(&tag) {
            warn!(tag, name, existing = existing.name, "Tag already registered");
            return false;
        }
        self.entries.insert(tag, Entry { name, decode });
        true
    }

    pub fn contains(&self, tag: i32) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn name_of(&self, tag: i32) -> Option<&'static str> {
        self.entries.get(&tag).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode a frame received by `receiver`.
    ///
    /// Trailing payload bytes are ignored: a newer peer may append fields.
    pub fn decode(&self, receiver: Endpoint, frame: &Frame, ctx: &DecodeContext) -> Result<Message> {
        let tag = frame.tag;
        let kind =
            MessageKind::of_tag(tag).ok_or(ProtocolError::UnsupportedMessageType { tag })?;
        if !receiver.may_receive(kind) {
            return Err(ProtocolError::violation(format!(
                "{kind:?} tag {tag} is not valid for the {receiver:?} to receive"
            )));
        }

        let entry = self
            .entries
            .get(&tag)
            .ok_or(ProtocolError::UnsupportedMessageType { tag })?;

        let mut input = WireReader::new(&frame.payload);
        let message = (entry.decode)(&mut input, ctx).map_err(|e| match e {
            ProtocolError::MalformedMessage(reason) => {
                ProtocolError::MalformedMessage(format!("{}: {reason}", entry.name))
            }
            other => other,
        })?;

        if input.remaining() > 0 {
            debug!(
                tag,
                name = entry.name,
                trailing = input.remaining(),
                "Ignoring trailing payload bytes"
            );
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{LogLevel, VmFacts};
    use crate::version::CURRENT_PROTOCOL_VERSION;
    use bytes::Bytes;

    fn samples() -> Vec<Message> {
        vec![
            Command::CheckConnection.into(),
            Command::GetVmProperties.into(),
            Command::InitiateProfiling(InitiateProfilingCommand {
                instr_type: 1,
                instrument_spawned_threads: false,
                root_classes: vec!["com.acme.*".to_string()],
            })
            .into(),
            Command::GetMethodNames(GetMethodNamesCommand {
                method_ids: vec![1, 2, 3],
            })
            .into(),
            Command::DumpResults.into(),
            Command::SuspendTargetApp.into(),
            Command::ResumeTargetApp.into(),
            Command::Detach.into(),
            Command::TerminateTargetJvm.into(),
            Response::Ack(AckResponse::error("no such class")).into(),
            Response::VmProperties(VmPropertiesResponse::new(
                CURRENT_PROTOCOL_VERSION,
                VmFacts {
                    jdk_version: Some("21.0.2".to_string()),
                    agent_id: 3,
                    ..VmFacts::default()
                },
            ))
            .into(),
            Response::MethodNames(MethodNamesResponse { names: vec![] }).into(),
            Response::DumpResults(DumpResultsResponse {
                data: vec![0xCA, 0xFE],
                truncated: false,
            })
            .into(),
            Event::BufferDumped(BufferDumpedEvent {
                buffer_size: 2,
                data: vec![5, 6],
            })
            .into(),
            Event::AgentLog(AgentLogEvent {
                level: LogLevel::Info,
                text: "attached".to_string(),
            })
            .into(),
        ]
    }

    #[test]
    fn standard_registry_decodes_every_known_message() {
        let registry = Registry::standard();
        let ctx = DecodeContext::default();
        let all = samples();
        assert_eq!(registry.len(), all.len());

        for message in all {
            let receiver = if message.is_response() {
                Endpoint::Controller
            } else {
                Endpoint::Agent
            };
            let frame = message.to_frame().unwrap();
            assert_eq!(registry.name_of(frame.tag), Some(message.name()));
            let decoded = registry.decode(receiver, &frame, &ctx).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let registry = Registry::standard();
        let ctx = DecodeContext::default();

        // inside the response range but never registered
        let frame = Frame::new(100, Bytes::from_static(&[1, 2, 3]));
        assert_eq!(
            registry.decode(Endpoint::Controller, &frame, &ctx).unwrap_err(),
            ProtocolError::UnsupportedMessageType { tag: 100 }
        );

        // outside every range
        let frame = Frame::new(4000, Bytes::new());
        assert_eq!(
            registry.decode(Endpoint::Controller, &frame, &ctx).unwrap_err(),
            ProtocolError::UnsupportedMessageType { tag: 4000 }
        );
    }

    #[test]
    fn cross_wired_tag_is_a_violation() {
        let registry = Registry::standard();
        let ctx = DecodeContext::default();

        let command = Message::from(Command::DumpResults).to_frame().unwrap();
        let err = registry.decode(Endpoint::Controller, &command, &ctx).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));

        let ack = Message::from(Response::Ack(AckResponse::ok())).to_frame().unwrap();
        let err = registry.decode(Endpoint::Agent, &ack, &ctx).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let registry = Registry::standard();
        let mut payload = Message::from(Response::Ack(AckResponse::ok()))
            .to_frame()
            .unwrap()
            .payload
            .to_vec();
        payload.extend_from_slice(&[0xAA, 0xBB]);

        let frame = Frame::new(tags::ACK, payload);
        let decoded = registry
            .decode(Endpoint::Controller, &frame, &DecodeContext::default())
            .unwrap();
        assert_eq!(decoded, Response::Ack(AckResponse::ok()).into());
    }

    #[test]
    fn malformed_payload_names_the_message() {
        let registry = Registry::standard();
        let frame = Frame::new(tags::VM_PROPERTIES, Bytes::from_static(&[0, 0, 0, 7, 0]));
        match registry.decode(Endpoint::Controller, &frame, &DecodeContext::default()) {
            Err(ProtocolError::MalformedMessage(reason)) => {
                assert!(reason.starts_with("vm_properties: "), "{reason}");
            }
            other => panic!("expected malformed message, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let mut registry = Registry::new();
        assert!(registry.register(tags::DETACH, "detach", |_, _| Ok(Command::Detach.into())));
        assert!(!registry.register(tags::DETACH, "other", |_, _| {
            Ok(Command::CheckConnection.into())
        }));
        assert_eq!(registry.name_of(tags::DETACH), Some("detach"));
    }
}
