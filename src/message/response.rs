//! Solicited replies sent by the agent.

use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::version::{
    DecodeContext, ProtocolVersion, AGENT_ID_SINCE, DUMP_LEGACY_OFFSET_REMOVED_IN,
    DUMP_TRUNCATED_FLAG_SINCE,
};
use crate::wire::{WireReader, WireWriter};

use super::{tags, WireMessage};

/// Only the low 7 bytes of the high-resolution startup counter fit the wire.
pub const STARTUP_COUNTER_MASK: i64 = 0x00FF_FFFF_FFFF_FFFF;

/// Agent id reported by agents that predate the field.
pub const UNKNOWN_AGENT_ID: i32 = -1;

/// Generic yes/no reply. `ok == false` reports a failed or unsupported command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResponse {
    pub ok: bool,
    /// Empty unless `ok` is false.
    pub error_message: String,
}

impl AckResponse {
    pub const fn ok() -> Self {
        Self {
            ok: true,
            error_message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_message: message.into(),
        }
    }
}

impl WireMessage for AckResponse {
    const TAG: i32 = tags::ACK;
    const NAME: &'static str = "ack";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        out.put_bool(self.ok);
        out.put_utf("error_message", &self.error_message)
    }

    fn decode(input: &mut WireReader<'_>, _ctx: &DecodeContext) -> Result<Self> {
        Ok(Self {
            ok: input.get_bool("ok")?,
            error_message: input.get_utf("error_message")?,
        })
    }
}

/// Facts gathered by the agent before building a [`VmPropertiesResponse`].
///
/// Strings the target VM may not define are optional here; the response
/// stores them as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmFacts {
    pub jdk_version: Option<String>,
    pub java_class_path: Option<String>,
    pub java_ext_dirs: Option<String>,
    pub boot_class_path: Option<String>,
    pub working_dir: Option<String>,
    pub jvm_arguments: Option<String>,
    pub java_command: Option<String>,
    pub target_machine_os_name: Option<String>,
    pub can_instrument_constructor: bool,
    pub max_heap_size: i64,
    pub startup_time_millis: i64,
    pub startup_time_in_counts: i64,
    pub agent_id: i32,
}

/// Static facts about the target VM and its process environment.
///
/// Immutable once built. The agent version is fixed at construction, not at
/// encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPropertiesResponse {
    agent_version: ProtocolVersion,
    jdk_version: String,
    java_class_path: String,
    java_ext_dirs: String,
    boot_class_path: String,
    working_dir: String,
    jvm_arguments: String,
    java_command: String,
    target_machine_os_name: String,
    can_instrument_constructor: bool,
    max_heap_size: i64,
    startup_time_millis: i64,
    startup_time_in_counts: i64,
    agent_id: i32,
}

impl VmPropertiesResponse {
    /// Build the reply for an agent implementing `agent_version`.
    ///
    /// Absent strings become empty and the startup counter keeps its low 56 bits.
    pub fn new(agent_version: ProtocolVersion, facts: VmFacts) -> Self {
        Self {
            agent_version,
            jdk_version: facts.jdk_version.unwrap_or_default(),
            java_class_path: facts.java_class_path.unwrap_or_default(),
            java_ext_dirs: facts.java_ext_dirs.unwrap_or_default(),
            boot_class_path: facts.boot_class_path.unwrap_or_default(),
            working_dir: facts.working_dir.unwrap_or_default(),
            jvm_arguments: facts.jvm_arguments.unwrap_or_default(),
            java_command: facts.java_command.unwrap_or_default(),
            target_machine_os_name: facts.target_machine_os_name.unwrap_or_default(),
            can_instrument_constructor: facts.can_instrument_constructor,
            max_heap_size: facts.max_heap_size,
            startup_time_millis: facts.startup_time_millis,
            startup_time_in_counts: facts.startup_time_in_counts & STARTUP_COUNTER_MASK,
            agent_id: facts.agent_id,
        }
    }

    pub const fn agent_version(&self) -> ProtocolVersion {
        self.agent_version
    }

    pub fn jdk_version(&self) -> &str {
        &self.jdk_version
    }

    pub fn java_class_path(&self) -> &str {
        &self.java_class_path
    }

    pub fn java_ext_dirs(&self) -> &str {
        &self.java_ext_dirs
    }

    pub fn boot_class_path(&self) -> &str {
        &self.boot_class_path
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn jvm_arguments(&self) -> &str {
        &self.jvm_arguments
    }

    pub fn java_command(&self) -> &str {
        &self.java_command
    }

    pub fn target_machine_os_name(&self) -> &str {
        &self.target_machine_os_name
    }

    pub const fn can_instrument_constructor(&self) -> bool {
        self.can_instrument_constructor
    }

    pub const fn max_heap_size(&self) -> i64 {
        self.max_heap_size
    }

    pub const fn startup_time_millis(&self) -> i64 {
        self.startup_time_millis
    }

    /// High-resolution startup counter, low 56 bits only.
    pub const fn startup_time_in_counts(&self) -> i64 {
        self.startup_time_in_counts
    }

    /// [`UNKNOWN_AGENT_ID`] when the agent predates the field.
    pub const fn agent_id(&self) -> i32 {
        self.agent_id
    }
}

impl WireMessage for VmPropertiesResponse {
    const TAG: i32 = tags::VM_PROPERTIES;
    const NAME: &'static str = "vm_properties";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        // agent_version must stay the first field.
        out.put_i32(self.agent_version.0);
        out.put_utf("jdk_version", &self.jdk_version)?;
        out.put_object_string("java_class_path", &self.java_class_path)?;
        out.put_utf("java_ext_dirs", &self.java_ext_dirs)?;
        out.put_utf("boot_class_path", &self.boot_class_path)?;
        out.put_utf("working_dir", &self.working_dir)?;
        out.put_utf("jvm_arguments", &self.jvm_arguments)?;
        out.put_utf("java_command", &self.java_command)?;
        out.put_utf("target_machine_os_name", &self.target_machine_os_name)?;
        out.put_bool(self.can_instrument_constructor);
        out.put_i64(self.max_heap_size);
        out.put_i64(self.startup_time_millis);
        out.put_i64(self.startup_time_in_counts);
        if self.agent_version >= AGENT_ID_SINCE {
            out.put_i32(self.agent_id);
        }
        Ok(())
    }

    fn decode(input: &mut WireReader<'_>, _ctx: &DecodeContext) -> Result<Self> {
        // The reply describes its own revision; that beats whatever was negotiated.
        let agent_version = ProtocolVersion(input.get_i32("agent_version")?);
        let mut response = Self {
            agent_version,
            jdk_version: input.get_utf("jdk_version")?,
            java_class_path: input.get_object_string("java_class_path")?,
            java_ext_dirs: input.get_utf("java_ext_dirs")?,
            boot_class_path: input.get_utf("boot_class_path")?,
            working_dir: input.get_utf("working_dir")?,
            jvm_arguments: input.get_utf("jvm_arguments")?,
            java_command: input.get_utf("java_command")?,
            target_machine_os_name: input.get_utf("target_machine_os_name")?,
            can_instrument_constructor: input.get_bool("can_instrument_constructor")?,
            max_heap_size: input.get_i64("max_heap_size")?,
            startup_time_millis: input.get_i64("startup_time_millis")?,
            startup_time_in_counts: input.get_i64("startup_time_in_counts")? & STARTUP_COUNTER_MASK,
            agent_id: UNKNOWN_AGENT_ID,
        };
        if agent_version >= AGENT_ID_SINCE {
            response.agent_id = input.get_i32("agent_id")?;
        }
        Ok(response)
    }
}

impl fmt::Display for VmPropertiesResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VM properties (agent {}):", self.agent_version)?;
        writeln!(f, "  jdk_version:               {}", self.jdk_version)?;
        writeln!(f, "  java_class_path:           {}", self.java_class_path)?;
        writeln!(f, "  java_ext_dirs:             {}", self.java_ext_dirs)?;
        writeln!(f, "  boot_class_path:           {}", self.boot_class_path)?;
        writeln!(f, "  working_dir:               {}", self.working_dir)?;
        writeln!(f, "  jvm_arguments:             {}", self.jvm_arguments)?;
        writeln!(f, "  java_command:              {}", self.java_command)?;
        writeln!(f, "  target_machine_os_name:    {}", self.target_machine_os_name)?;
        writeln!(f, "  can_instrument_constructor: {}", self.can_instrument_constructor)?;
        writeln!(f, "  max_heap_size:             {}", self.max_heap_size)?;
        writeln!(f, "  startup_time_millis:       {}", self.startup_time_millis)?;
        writeln!(f, "  startup_time_in_counts:    {}", self.startup_time_in_counts)?;
        write!(f, "  agent_id:                  {}", self.agent_id)
    }
}

/// Fully qualified name of one instrumented method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodName {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

/// Names for the ids of a `get_method_names` command, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodNamesResponse {
    pub names: Vec<MethodName>,
}

impl WireMessage for MethodNamesResponse {
    const TAG: i32 = tags::METHOD_NAMES;
    const NAME: &'static str = "method_names";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        out.put_len("names", self.names.len())?;
        for name in &self.names {
            out.put_utf("class_name", &name.class_name)?;
            out.put_utf("method_name", &name.method_name)?;
            out.put_utf("signature", &name.signature)?;
        }
        Ok(())
    }

    fn decode(input: &mut WireReader<'_>, _ctx: &DecodeContext) -> Result<Self> {
        let count = input.get_len("names", 6)?;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(MethodName {
                class_name: input.get_utf("class_name")?,
                method_name: input.get_utf("method_name")?,
                signature: input.get_utf("signature")?,
            });
        }
        Ok(Self { names })
    }
}

/// Collected profiling data snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpResultsResponse {
    /// Opaque result buffer; interpreted by the results layer, not here.
    pub data: Vec<u8>,
    /// The agent had to cut the buffer short. Always false from agents before v6.
    pub truncated: bool,
}

impl DumpResultsResponse {
    /// Encode in the shape an agent implementing `version` writes.
    pub fn encode_for(&self, out: &mut WireWriter, version: ProtocolVersion) -> Result<()> {
        if version < DUMP_LEGACY_OFFSET_REMOVED_IN {
            out.put_i32(0);
        }
        out.put_bytes("data", &self.data)?;
        if version >= DUMP_TRUNCATED_FLAG_SINCE {
            out.put_bool(self.truncated);
        }
        Ok(())
    }
}

impl WireMessage for DumpResultsResponse {
    const TAG: i32 = tags::DUMP_RESULTS_RESPONSE;
    const NAME: &'static str = "dump_results";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        self.encode_for(out, crate::version::CURRENT_PROTOCOL_VERSION)
    }

    fn decode(input: &mut WireReader<'_>, ctx: &DecodeContext) -> Result<Self> {
        if !ctx.peer_at_least(DUMP_LEGACY_OFFSET_REMOVED_IN) {
            let _legacy_offset = input.get_i32("legacy_offset")?;
        }
        let data = input.get_bytes("data")?;
        let truncated = if ctx.peer_at_least(DUMP_TRUNCATED_FLAG_SINCE) {
            input.get_bool("truncated")?
        } else {
            false
        };
        Ok(Self { data, truncated })
    }
}

/// Every solicited reply the agent can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack(AckResponse),
    VmProperties(VmPropertiesResponse),
    MethodNames(MethodNamesResponse),
    DumpResults(DumpResultsResponse),
}

impl Response {
    pub const fn tag(&self) -> i32 {
        match self {
            Self::Ack(_) => AckResponse::TAG,
            Self::VmProperties(_) => VmPropertiesResponse::TAG,
            Self::MethodNames(_) => MethodNamesResponse::TAG,
            Self::DumpResults(_) => DumpResultsResponse::TAG,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ack(_) => AckResponse::NAME,
            Self::VmProperties(_) => VmPropertiesResponse::NAME,
            Self::MethodNames(_) => MethodNamesResponse::NAME,
            Self::DumpResults(_) => DumpResultsResponse::NAME,
        }
    }

    /// Turn an error acknowledgement into [`ProtocolError::CommandRejected`].
    pub fn into_accepted(self, command: &'static str) -> Result<Self> {
        match self {
            Self::Ack(AckResponse {
                ok: false,
                error_message,
            }) => Err(ProtocolError::CommandRejected {
                command,
                message: error_message,
            }),
            other => Ok(other),
        }
    }

    /// Encode in the shape an agent implementing `version` writes.
    ///
    /// VM properties carry their own revision and ignore `version`.
    pub(crate) fn encode_payload(&self, out: &mut WireWriter, version: ProtocolVersion) -> Result<()> {
        match self {
            Self::Ack(r) => r.encode(out),
            Self::VmProperties(r) => r.encode(out),
            Self::MethodNames(r) => r.encode(out),
            Self::DumpResults(r) => r.encode_for(out, version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::CURRENT_PROTOCOL_VERSION;

    fn sample_facts() -> VmFacts {
        VmFacts {
            jdk_version: Some("17.0.1".to_string()),
            java_class_path: Some("/app/lib/a.jar:/app/lib/b.jar".to_string()),
            java_ext_dirs: Some("/usr/lib/jvm/ext".to_string()),
            boot_class_path: Some("/usr/lib/jvm/lib/modules".to_string()),
            working_dir: Some("/srv/app".to_string()),
            jvm_arguments: Some("-Xmx512m -XX:+UseG1GC".to_string()),
            java_command: Some("com.acme.Main --port 8080".to_string()),
            target_machine_os_name: Some("Linux".to_string()),
            can_instrument_constructor: true,
            max_heap_size: 536_870_912,
            startup_time_millis: 1_700_000_000_123,
            startup_time_in_counts: 0x01FF_FFFF_FFFF_FFFF,
            agent_id: 42,
        }
    }

    fn encode<M: WireMessage>(msg: &M) -> Vec<u8> {
        let mut out = WireWriter::new();
        msg.encode(&mut out).unwrap();
        out.freeze().to_vec()
    }

    fn decode<M: WireMessage>(bytes: &[u8], ctx: &DecodeContext) -> M {
        let mut input = WireReader::new(bytes);
        let msg = M::decode(&mut input, ctx).unwrap();
        assert_eq!(input.remaining(), 0, "decoder left bytes behind");
        msg
    }

    #[test]
    fn vm_properties_scenario() {
        let sent = VmPropertiesResponse::new(ProtocolVersion(7), sample_facts());
        let received: VmPropertiesResponse = decode(&encode(&sent), &DecodeContext::default());

        assert_eq!(received.agent_version(), ProtocolVersion(7));
        assert_eq!(received.jdk_version(), "17.0.1");
        assert_eq!(received.max_heap_size(), 536_870_912);
        assert_eq!(received.startup_time_in_counts(), 0x00FF_FFFF_FFFF_FFFF);
        assert_eq!(received.java_class_path(), "/app/lib/a.jar:/app/lib/b.jar");
        assert_eq!(received.java_command(), "com.acme.Main --port 8080");
        assert_eq!(received.agent_id(), 42);
        assert_eq!(received, sent);
    }

    #[test]
    fn agent_version_is_the_first_field() {
        let sent = VmPropertiesResponse::new(ProtocolVersion(7), sample_facts());
        let bytes = encode(&sent);
        assert_eq!(&bytes[..4], &[0, 0, 0, 7]);
        // jdk version follows as u16-prefixed text, then the object-form class path
        assert_eq!(&bytes[4..6], &[0, 6]);
        assert_eq!(&bytes[6..12], b"17.0.1");
        assert_eq!(bytes[12], 0x74);
    }

    #[test]
    fn startup_counter_keeps_low_56_bits() {
        for input in [0_i64, 1, -1, i64::MAX, i64::MIN, 0x0123_4567_89AB_CDEF, 0x00FF_FFFF_FFFF_FFFF] {
            let facts = VmFacts {
                startup_time_in_counts: input,
                ..VmFacts::default()
            };
            let sent = VmPropertiesResponse::new(CURRENT_PROTOCOL_VERSION, facts);
            let received: VmPropertiesResponse = decode(&encode(&sent), &DecodeContext::default());
            assert_eq!(received.startup_time_in_counts(), input & STARTUP_COUNTER_MASK);
        }
    }

    #[test]
    fn absent_strings_encode_like_empty_strings() {
        let absent = VmPropertiesResponse::new(
            CURRENT_PROTOCOL_VERSION,
            VmFacts {
                jvm_arguments: None,
                java_command: None,
                java_class_path: None,
                ..sample_facts()
            },
        );
        let empty = VmPropertiesResponse::new(
            CURRENT_PROTOCOL_VERSION,
            VmFacts {
                jvm_arguments: Some(String::new()),
                java_command: Some(String::new()),
                java_class_path: Some(String::new()),
                ..sample_facts()
            },
        );
        assert_eq!(encode(&absent), encode(&empty));
        assert_eq!(absent.jvm_arguments(), "");
    }

    #[test]
    fn agents_before_v5_omit_agent_id() {
        let old = VmPropertiesResponse::new(ProtocolVersion(4), sample_facts());
        let old_bytes = encode(&old);
        let new_bytes = encode(&VmPropertiesResponse::new(ProtocolVersion(5), sample_facts()));
        assert_eq!(old_bytes.len() + 4, new_bytes.len());

        // the negotiated context is ignored: the reply's own version decides
        let received: VmPropertiesResponse = decode(&old_bytes, &DecodeContext::default());
        assert_eq!(received.agent_id(), UNKNOWN_AGENT_ID);
        assert_eq!(received.agent_version(), ProtocolVersion(4));
    }

    #[test]
    fn truncated_vm_properties_are_malformed() {
        let bytes = encode(&VmPropertiesResponse::new(ProtocolVersion(7), sample_facts()));
        for cut in [2, 10, bytes.len() - 1] {
            let err = VmPropertiesResponse::decode(
                &mut WireReader::new(&bytes[..cut]),
                &DecodeContext::default(),
            )
            .unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedMessage(_)), "cut at {cut}");
        }
    }

    #[test]
    fn dump_results_version_shims() {
        let dump = DumpResultsResponse {
            data: vec![1, 2, 3, 4],
            truncated: true,
        };

        let mut out = WireWriter::new();
        dump.encode_for(&mut out, ProtocolVersion(3)).unwrap();
        let v3: DumpResultsResponse =
            decode(&out.freeze(), &DecodeContext::for_peer(ProtocolVersion(3)));
        assert_eq!(v3.data, dump.data);
        assert!(!v3.truncated);

        let mut out = WireWriter::new();
        dump.encode_for(&mut out, ProtocolVersion(5)).unwrap();
        let v5: DumpResultsResponse =
            decode(&out.freeze(), &DecodeContext::for_peer(ProtocolVersion(5)));
        assert_eq!(v5.data, dump.data);
        assert!(!v5.truncated);

        let current: DumpResultsResponse = decode(&encode(&dump), &DecodeContext::default());
        assert_eq!(current, dump);
    }

    #[test]
    fn method_names_roundtrip() {
        let names = MethodNamesResponse {
            names: vec![
                MethodName {
                    class_name: "com.acme.Main".to_string(),
                    method_name: "main".to_string(),
                    signature: "([Ljava/lang/String;)V".to_string(),
                },
                MethodName {
                    class_name: "com.acme.Worker".to_string(),
                    method_name: "<init>".to_string(),
                    signature: "()V".to_string(),
                },
            ],
        };
        let received: MethodNamesResponse = decode(&encode(&names), &DecodeContext::default());
        assert_eq!(received, names);
    }

    #[test]
    fn error_ack_becomes_rejection() {
        let err = Response::Ack(AckResponse::error("not attached"))
            .into_accepted("dump_results")
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::CommandRejected {
                command: "dump_results",
                message: "not attached".to_string()
            }
        );
        assert!(Response::Ack(AckResponse::ok()).into_accepted("detach").is_ok());
    }
}
