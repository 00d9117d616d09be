//! Service channel protocol
//!
//! Every message is a fixed 8-byte header `{command: u32, data_size: u32}` in
//! host byte order followed by `data_size` bytes of payload. The supervisor
//! sends a payload-less GET; the instance answers with OK_REPLY carrying a JSON
//! document with its interface counters.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::module::inventory::Instance;
use crate::module::traits::ModuleError;

/// Size of the message header
pub const HEADER_LEN: usize = 8;

const SERVICE_GET_COM: u32 = 10;
const SERVICE_SET_COM: u32 = 11;
const SERVICE_OK_REPLY: u32 = 12;

/// Command field of a service message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    Get,
    Set,
    OkReply,
    Unknown(u32),
}

impl From<u32> for ServiceCommand {
    fn from(value: u32) -> Self {
        match value {
            SERVICE_GET_COM => ServiceCommand::Get,
            SERVICE_SET_COM => ServiceCommand::Set,
            SERVICE_OK_REPLY => ServiceCommand::OkReply,
            other => ServiceCommand::Unknown(other),
        }
    }
}

impl From<ServiceCommand> for u32 {
    fn from(command: ServiceCommand) -> Self {
        match command {
            ServiceCommand::Get => SERVICE_GET_COM,
            ServiceCommand::Set => SERVICE_SET_COM,
            ServiceCommand::OkReply => SERVICE_OK_REPLY,
            ServiceCommand::Unknown(other) => other,
        }
    }
}

/// One framed service message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFrame {
    pub command: ServiceCommand,
    pub payload: Bytes,
}

impl ServiceFrame {
    pub fn get_request() -> Self {
        Self {
            command: ServiceCommand::Get,
            payload: Bytes::new(),
        }
    }
}

/// Header + payload framing
#[derive(Debug, Clone)]
pub struct ServiceCodec {
    max_payload: usize,
}

impl ServiceCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for ServiceCodec {
    type Item = ServiceFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut header = [0u8; 4];
        header.copy_from_slice(&src[0..4]);
        let command = u32::from_ne_bytes(header);
        header.copy_from_slice(&src[4..8]);
        let data_size = u32::from_ne_bytes(header) as usize;

        if data_size > self.max_payload {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "service payload of {} bytes exceeds limit of {}",
                    data_size, self.max_payload
                ),
            ));
        }

        if src.len() < HEADER_LEN + data_size {
            src.reserve(HEADER_LEN + data_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(data_size).freeze();
        Ok(Some(ServiceFrame {
            command: command.into(),
            payload,
        }))
    }
}

impl Encoder<ServiceFrame> for ServiceCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: ServiceFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data_size = u32::try_from(item.payload.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "payload too large")
        })?;
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.extend_from_slice(&u32::from(item.command).to_ne_bytes());
        dst.extend_from_slice(&data_size.to_ne_bytes());
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

/// Counters of one input interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCounters {
    pub messages: u64,
    pub buffers: u64,
    pub ifc_type: i64,
    pub ifc_state: i32,
    pub ifc_id: String,
}

/// Counters of one output interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCounters {
    #[serde(rename = "sent-messages")]
    pub sent_messages: u64,
    #[serde(rename = "dropped-messages")]
    pub dropped_messages: u64,
    pub buffers: u64,
    pub autoflushes: u64,
    pub num_clients: i32,
    #[serde(rename = "type")]
    pub ifc_type: i64,
    pub ifc_id: String,
}

/// Stats reply document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub in_cnt: u32,
    pub out_cnt: u32,
    #[serde(rename = "in", default)]
    pub inputs: Vec<InputCounters>,
    #[serde(rename = "out", default)]
    pub outputs: Vec<OutputCounters>,
}

impl StatsPayload {
    /// Decode a reply payload; trailing NUL bytes are ignored
    pub fn from_bytes(payload: &[u8]) -> Result<Self, ModuleError> {
        let end = payload
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |last| last + 1);
        serde_json::from_slice(&payload[..end])
            .map_err(|e| ModuleError::MalformedStats(e.to_string()))
    }

    /// Check the reply against the instance's configuration and store the counters
    pub fn apply_to(&self, instance: &mut Instance) -> Result<(), ModuleError> {
        if self.in_cnt as usize != instance.inputs.len() {
            return Err(ModuleError::StatsMismatch(format!(
                "instance {} reports {} IN interfaces, {} configured",
                instance.name,
                self.in_cnt,
                instance.inputs.len()
            )));
        }
        if self.out_cnt as usize != instance.outputs.len() {
            return Err(ModuleError::StatsMismatch(format!(
                "instance {} reports {} OUT interfaces, {} configured",
                instance.name,
                self.out_cnt,
                instance.outputs.len()
            )));
        }
        if self.inputs.len() > instance.inputs.len() || self.outputs.len() > instance.outputs.len()
        {
            return Err(ModuleError::StatsMismatch(format!(
                "instance {} reports counters for more interfaces than configured",
                instance.name
            )));
        }

        for (ifc, counters) in instance.inputs.iter_mut().zip(&self.inputs) {
            ifc.stats.messages = counters.messages;
            ifc.stats.buffers = counters.buffers;
            ifc.stats.reported_type = counters.ifc_type;
            ifc.stats.state = counters.ifc_state;
            ifc.stats.reported_id = Some(counters.ifc_id.clone());
        }
        for (ifc, counters) in instance.outputs.iter_mut().zip(&self.outputs) {
            ifc.stats.messages = counters.sent_messages;
            ifc.stats.dropped_messages = counters.dropped_messages;
            ifc.stats.buffers = counters.buffers;
            ifc.stats.autoflushes = counters.autoflushes;
            ifc.stats.num_clients = counters.num_clients;
            ifc.stats.reported_type = counters.ifc_type;
            ifc.stats.reported_id = Some(counters.ifc_id.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::interface::{Direction, Interface, Transport};
    use crate::module::inventory::{ModuleCapabilities, ModuleKind};
    use std::path::PathBuf;

    fn instance() -> Instance {
        let kind = ModuleKind {
            name: "m".into(),
            path: PathBuf::from("/bin/m"),
            group: None,
            capabilities: ModuleCapabilities::all(),
        };
        let mut inst = Instance::new("i", &kind, 3);
        inst.add_interface(Interface::new("in", Direction::In, Transport::Blackhole));
        inst.add_interface(Interface::new("out", Direction::Out, Transport::Blackhole));
        inst
    }

    const REPLY: &str = r#"{
        "in_cnt": 1, "out_cnt": 1,
        "in": [{"messages": 10, "buffers": 2, "ifc_type": 116, "ifc_state": 1, "ifc_id": "8000"}],
        "out": [{"sent-messages": 7, "dropped-messages": 1, "buffers": 3, "autoflushes": 4,
                 "num_clients": 2, "type": 117, "ifc_id": "sock"}]
    }"#;

    #[test]
    fn test_codec_waits_for_full_frame() {
        let mut codec = ServiceCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&12u32.to_ne_bytes());
        buf.extend_from_slice(&5u32.to_ne_bytes());
        buf.extend_from_slice(b"ab");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"cde");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, ServiceCommand::OkReply);
        assert_eq!(&frame.payload[..], b"abcde");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_encodes_get_request() {
        let mut codec = ServiceCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(ServiceFrame::get_request(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[0..4], &10u32.to_ne_bytes());
        assert_eq!(&buf[4..8], &0u32.to_ne_bytes());
    }

    #[test]
    fn test_codec_rejects_oversized_payload() {
        let mut codec = ServiceCodec::new(4);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&12u32.to_ne_bytes());
        buf.extend_from_slice(&5u32.to_ne_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_stats_applied_to_interfaces() {
        let mut payload = REPLY.as_bytes().to_vec();
        payload.push(0);
        let stats = StatsPayload::from_bytes(&payload).unwrap();
        let mut inst = instance();
        stats.apply_to(&mut inst).unwrap();

        assert_eq!(inst.inputs[0].stats.messages, 10);
        assert_eq!(inst.inputs[0].stats.state, 1);
        assert_eq!(inst.outputs[0].stats.messages, 7);
        assert_eq!(inst.outputs[0].stats.dropped_messages, 1);
        assert_eq!(inst.outputs[0].stats.num_clients, 2);
        assert_eq!(inst.outputs[0].stats.reported_id.as_deref(), Some("sock"));
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let stats = StatsPayload {
            in_cnt: 2,
            out_cnt: 1,
            inputs: vec![],
            outputs: vec![],
        };
        let mut inst = instance();
        assert!(matches!(
            stats.apply_to(&mut inst),
            Err(ModuleError::StatsMismatch(_))
        ));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            StatsPayload::from_bytes(b"{not json"),
            Err(ModuleError::MalformedStats(_))
        ));
    }
}
