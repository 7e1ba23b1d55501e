//! Protocolo binário do canal de controle (UDP).
//!
//! Cada datagrama carrega exatamente uma mensagem:
//!
//! ```text
//! ┌─────────────┬────────┬─────────────────────┐
//! │ Magic (4)   │ Cmd(1) │ Payload (N)         │
//! │ 0x5A7D0001  │ 21..28 │ específico do cmd   │
//! └─────────────┴────────┴─────────────────────┘
//! ```
//!
//! Todos os inteiros são big-endian. O payload precisa ser consumido por
//! inteiro: qualquer byte faltando ou sobrando torna a mensagem inválida.

use crate::types::{EventLevel, ProbeState, ProgramId, StorageType};

/// Magic number no início de todo datagrama.
pub const MAGIC_NUMBER: u32 = 0x5A7D_0001;

/// Tamanho do header (magic + comando).
pub const HEADER_SIZE: usize = 5;

/// Tamanho máximo de pacote UDP seguro (sem fragmentação).
pub const MAX_DATAGRAM: usize = 65507;

const ENABLED_BIT: u8 = 1 << 7;
const DISPLAYED_BIT: u8 = 1 << 6;

/// Erros do protocolo.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Pacote muito curto ({0} bytes, mínimo {HEADER_SIZE})")]
    TooShort(usize),

    #[error("Magic number inválido: 0x{0:08X} (esperado 0x{MAGIC_NUMBER:08X})")]
    InvalidMagic(u32),

    #[error("Comando desconhecido: {0}")]
    UnknownCommand(u8),

    #[error("Campo '{field}' truncado: {needed} bytes necessários, {available} disponíveis")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{0} bytes sobrando após o último campo")]
    TrailingBytes(usize),

    #[error("Estado de probe inválido: {0}")]
    InvalidProbeState(u8),

    #[error("Tipo de armazenamento desconhecido: {0}")]
    UnknownStorageType(u8),

    #[error("Campo '{field}' longo demais para o protocolo ({len} > 255)")]
    FieldTooLong { field: &'static str, len: usize },
}

// ──────────────────────────────────────────────
// Comandos
// ──────────────────────────────────────────────

/// Código de comando do header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Register = 21,
    RegisterProgram = 22,
    UnregisterProgram = 23,
    SetProbeStatus = 24,
    SendProbes = 25,
    SendEvent = 26,
    Unregister = 27,
    RegisterAck = 28,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            21 => Command::Register,
            22 => Command::RegisterProgram,
            23 => Command::UnregisterProgram,
            24 => Command::SetProbeStatus,
            25 => Command::SendProbes,
            26 => Command::SendEvent,
            27 => Command::Unregister,
            28 => Command::RegisterAck,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

// ──────────────────────────────────────────────
// Descrições de programa (REGISTER_PROGRAM)
// ──────────────────────────────────────────────

/// Probe tal como anunciada em `REGISTER_PROGRAM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub name: String,
    pub unit: String,
    pub storage: StorageType,
    pub enabled: bool,
    pub displayed: bool,
}

/// Tipo de evento tal como anunciado em `REGISTER_PROGRAM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    pub ident: String,
    pub level: EventLevel,
}

/// Payload completo de `REGISTER_PROGRAM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDescriptor {
    pub id: ProgramId,
    pub name: String,
    pub probes: Vec<ProbeDescriptor>,
    pub events: Vec<EventDescriptor>,
}

impl ProgramDescriptor {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let host_id = r.u8("host_id")?;
        let program_id = r.u8("program_id")?;
        let num_probes = r.u8("num_probes")?;
        let num_events = r.u8("num_events")?;
        let name_len = r.u8("name_len")? as usize;
        let name = r.string("name", name_len)?;

        let mut probes = Vec::with_capacity(num_probes as usize);
        for _ in 0..num_probes {
            let storage_byte = r.u8("storage_type")?;
            let name_len = r.u8("probe_name_len")? as usize;
            let unit_len = r.u8("unit_len")? as usize;
            let name = r.string("probe_name", name_len)?;
            let unit = r.string("unit", unit_len)?;
            probes.push(ProbeDescriptor {
                name,
                unit,
                storage: StorageType::new(storage_byte),
                enabled: storage_byte & ENABLED_BIT != 0,
                displayed: storage_byte & DISPLAYED_BIT != 0,
            });
        }

        let mut events = Vec::with_capacity(num_events as usize);
        for _ in 0..num_events {
            let level = r.u8("level")?;
            let ident_len = r.u8("ident_len")? as usize;
            let ident = r.string("ident", ident_len)?;
            events.push(EventDescriptor {
                ident,
                level: EventLevel(level),
            });
        }

        Ok(Self {
            id: ProgramId::new(host_id, program_id),
            name,
            probes,
            events,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        out.push(self.id.host_id());
        out.push(self.id.program_id());
        out.push(short_len("num_probes", self.probes.len())?);
        out.push(short_len("num_events", self.events.len())?);
        out.push(short_len("name", self.name.len())?);
        out.extend_from_slice(self.name.as_bytes());

        for probe in &self.probes {
            let mut storage_byte = probe.storage.tag();
            if probe.enabled {
                storage_byte |= ENABLED_BIT;
            }
            if probe.displayed {
                storage_byte |= DISPLAYED_BIT;
            }
            out.push(storage_byte);
            out.push(short_len("probe_name", probe.name.len())?);
            out.push(short_len("unit", probe.unit.len())?);
            out.extend_from_slice(probe.name.as_bytes());
            out.extend_from_slice(probe.unit.as_bytes());
        }

        for event in &self.events {
            out.push(event.level.0);
            out.push(short_len("ident", event.ident.len())?);
            out.extend_from_slice(event.ident.as_bytes());
        }

        Ok(())
    }
}

// ──────────────────────────────────────────────
// Mensagens
// ──────────────────────────────────────────────

/// Mensagem decodificada, uma variante por comando.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register,
    RegisterProgram(ProgramDescriptor),
    UnregisterProgram(ProgramId),
    SetProbeStatus {
        program: ProgramId,
        probe_id: u8,
        state: ProbeState,
    },
    /// `samples` são os pares `(probe_id, valor)` ainda codificados: o
    /// tamanho de cada valor depende do tipo da probe, conhecido só pelo
    /// registro.
    SendProbes {
        program: ProgramId,
        timestamp: u32,
        samples: Vec<u8>,
    },
    SendEvent {
        program: ProgramId,
        event_id: u8,
        message: Vec<u8>,
    },
    Unregister,
    RegisterAck,
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Register => Command::Register,
            Message::RegisterProgram(_) => Command::RegisterProgram,
            Message::UnregisterProgram(_) => Command::UnregisterProgram,
            Message::SetProbeStatus { .. } => Command::SetProbeStatus,
            Message::SendProbes { .. } => Command::SendProbes,
            Message::SendEvent { .. } => Command::SendEvent,
            Message::Unregister => Command::Unregister,
            Message::RegisterAck => Command::RegisterAck,
        }
    }

    /// Codifica a mensagem em um datagrama completo (header incluso).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + 16);
        frame.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
        frame.push(self.command() as u8);

        match self {
            Message::Register | Message::Unregister | Message::RegisterAck => {}
            Message::RegisterProgram(desc) => desc.encode(&mut frame)?,
            Message::UnregisterProgram(id) => {
                frame.push(id.host_id());
                frame.push(id.program_id());
            }
            Message::SetProbeStatus {
                program,
                probe_id,
                state,
            } => {
                frame.extend_from_slice(&[program.host_id(), program.program_id(), *probe_id, *state as u8]);
            }
            Message::SendProbes {
                program,
                timestamp,
                samples,
            } => {
                frame.push(program.host_id());
                frame.push(program.program_id());
                frame.extend_from_slice(&timestamp.to_be_bytes());
                frame.extend_from_slice(samples);
            }
            Message::SendEvent {
                program,
                event_id,
                message,
            } => {
                frame.extend_from_slice(&[program.host_id(), program.program_id(), *event_id]);
                frame.extend_from_slice(message);
            }
        }

        Ok(frame)
    }

    /// Decodifica um datagrama recebido.
    ///
    /// Valida tamanho mínimo e magic number antes de olhar o comando.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort(data.len()));
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC_NUMBER {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let command = Command::try_from(data[4])?;
        let mut r = WireReader::new(&data[HEADER_SIZE..]);

        let message = match command {
            Command::Register => Message::Register,
            Command::Unregister => Message::Unregister,
            Command::RegisterAck => Message::RegisterAck,
            Command::RegisterProgram => Message::RegisterProgram(ProgramDescriptor::decode(&mut r)?),
            Command::UnregisterProgram => {
                let host_id = r.u8("host_id")?;
                let program_id = r.u8("program_id")?;
                Message::UnregisterProgram(ProgramId::new(host_id, program_id))
            }
            Command::SetProbeStatus => {
                let host_id = r.u8("host_id")?;
                let program_id = r.u8("program_id")?;
                let probe_id = r.u8("probe_id")?;
                let raw_state = r.u8("state")?;
                let state = ProbeState::from_wire(raw_state).ok_or(ProtocolError::InvalidProbeState(raw_state))?;
                Message::SetProbeStatus {
                    program: ProgramId::new(host_id, program_id),
                    probe_id,
                    state,
                }
            }
            Command::SendProbes => {
                let host_id = r.u8("host_id")?;
                let program_id = r.u8("program_id")?;
                let timestamp = r.u32("timestamp")?;
                Message::SendProbes {
                    program: ProgramId::new(host_id, program_id),
                    timestamp,
                    samples: r.rest().to_vec(),
                }
            }
            Command::SendEvent => {
                let host_id = r.u8("host_id")?;
                let program_id = r.u8("program_id")?;
                let event_id = r.u8("event_id")?;
                Message::SendEvent {
                    program: ProgramId::new(host_id, program_id),
                    event_id,
                    message: r.rest().to_vec(),
                }
            }
        };

        r.finish()?;
        Ok(message)
    }
}

fn short_len(field: &'static str, len: usize) -> Result<u8, ProtocolError> {
    u8::try_from(len).map_err(|_| ProtocolError::FieldTooLong { field, len })
}

// ──────────────────────────────────────────────
// Leitor de campos
// ──────────────────────────────────────────────

/// Cursor sobre um payload; cada leitura checa os limites.
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn bytes(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.data.len().saturating_sub(self.pos);
        if len > available {
            return Err(ProtocolError::Truncated {
                field,
                needed: len,
                available,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(field, N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>(field)?[0])
    }

    pub(crate) fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    /// Strings do fio não são necessariamente UTF-8; bytes inválidos viram U+FFFD.
    pub(crate) fn string(&mut self, field: &'static str, len: usize) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.bytes(field, len)?).into_owned())
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub(crate) fn finish(&self) -> Result<(), ProtocolError> {
        match self.data.len().saturating_sub(self.pos) {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes(extra)),
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// REGISTER_PROGRAM de um programa "st1" com duas probes e um evento.
    fn register_program_frame() -> Vec<u8> {
        let mut frame = MAGIC_NUMBER.to_be_bytes().to_vec();
        frame.push(22);
        frame.extend_from_slice(&[1, 4, 2, 1, 3]);
        frame.extend_from_slice(b"st1");
        // probe 0: enabled + displayed, int
        frame.extend_from_slice(&[0b1100_0000, 4, 5]);
        frame.extend_from_slice(b"cwndbytes");
        // probe 1: desabilitada, double
        frame.extend_from_slice(&[2, 3, 0]);
        frame.extend_from_slice(b"snr");
        // evento 0
        frame.extend_from_slice(&[3, 7]);
        frame.extend_from_slice(b"logon_x");
        frame
    }

    #[test]
    fn register_program_decodes_fields() {
        let Message::RegisterProgram(desc) = Message::decode(&register_program_frame()).unwrap() else {
            panic!("esperado REGISTER_PROGRAM");
        };

        assert_eq!(desc.id, ProgramId::new(1, 4));
        assert_eq!(desc.name, "st1");
        assert_eq!(desc.probes.len(), 2);
        assert_eq!(desc.probes[0].name, "cwnd");
        assert_eq!(desc.probes[0].unit, "bytes");
        assert!(desc.probes[0].enabled);
        assert!(desc.probes[0].displayed);
        assert_eq!(desc.probes[0].storage.tag(), 0);
        assert_eq!(desc.probes[1].storage.tag(), 2);
        assert!(!desc.probes[1].enabled);
        assert_eq!(desc.probes[1].unit, "");
        assert_eq!(desc.events[0].ident, "logon_x");
        assert_eq!(desc.events[0].level, EventLevel(3));
    }

    #[test]
    fn register_program_reencodes_identically() {
        let frame = register_program_frame();
        let message = Message::decode(&frame).unwrap();
        assert_eq!(message.encode().unwrap(), frame);
    }

    #[test]
    fn name_len_overrun_is_truncated() {
        let mut frame = MAGIC_NUMBER.to_be_bytes().to_vec();
        frame.push(22);
        frame.extend_from_slice(&[1, 4, 0, 0, 10]);
        frame.extend_from_slice(b"st1");

        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::Truncated {
                field: "name",
                needed: 10,
                available: 3
            })
        );
    }

    #[test]
    fn probe_count_overrun_is_rejected() {
        let mut frame = register_program_frame();
        // Declara 3 probes mas só descreve 2
        frame[7] = 3;
        assert!(matches!(Message::decode(&frame), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut frame = register_program_frame();
        frame.push(0);
        assert_eq!(Message::decode(&frame), Err(ProtocolError::TrailingBytes(1)));

        let mut ack = Message::RegisterAck.encode().unwrap();
        ack.extend_from_slice(&[1, 2]);
        assert_eq!(Message::decode(&ack), Err(ProtocolError::TrailingBytes(2)));
    }

    #[test]
    fn rejects_short_packet() {
        assert_eq!(Message::decode(&[0x5A, 0x7D, 0x00, 0x01]), Err(ProtocolError::TooShort(4)));
    }

    #[test]
    fn rejects_invalid_magic() {
        let mut frame = Message::Register.encode().unwrap();
        frame[0] = 0xFF;
        assert_eq!(Message::decode(&frame), Err(ProtocolError::InvalidMagic(0xFF7D_0001)));
    }

    #[test]
    fn rejects_unknown_command() {
        let mut frame = MAGIC_NUMBER.to_be_bytes().to_vec();
        frame.push(99);
        assert_eq!(Message::decode(&frame), Err(ProtocolError::UnknownCommand(99)));
    }

    #[test]
    fn header_only_commands() {
        assert_eq!(Message::Register.encode().unwrap(), vec![0x5A, 0x7D, 0x00, 0x01, 21]);
        assert_eq!(Message::Unregister.encode().unwrap(), vec![0x5A, 0x7D, 0x00, 0x01, 27]);
        assert_eq!(Message::decode(&[0x5A, 0x7D, 0x00, 0x01, 28]), Ok(Message::RegisterAck));
    }

    #[test]
    fn set_probe_status_layout() {
        let frame = Message::SetProbeStatus {
            program: ProgramId::new(2, 9),
            probe_id: 4,
            state: ProbeState::Displayed,
        }
        .encode()
        .unwrap();
        assert_eq!(frame, vec![0x5A, 0x7D, 0x00, 0x01, 24, 2, 9, 4, 2]);
    }

    #[test]
    fn set_probe_status_rejects_unknown_state() {
        let frame = vec![0x5A, 0x7D, 0x00, 0x01, 24, 2, 9, 4, 7];
        assert_eq!(Message::decode(&frame), Err(ProtocolError::InvalidProbeState(7)));
    }

    #[test]
    fn unregister_program_needs_exactly_two_bytes() {
        let ok = vec![0x5A, 0x7D, 0x00, 0x01, 23, 1, 4];
        assert_eq!(Message::decode(&ok), Ok(Message::UnregisterProgram(ProgramId::new(1, 4))));

        let short = vec![0x5A, 0x7D, 0x00, 0x01, 23, 1];
        assert!(matches!(Message::decode(&short), Err(ProtocolError::Truncated { .. })));

        let long = vec![0x5A, 0x7D, 0x00, 0x01, 23, 1, 4, 0];
        assert_eq!(Message::decode(&long), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn send_probes_keeps_raw_samples() {
        let frame = vec![0x5A, 0x7D, 0x00, 0x01, 25, 1, 4, 0, 0, 1, 0, 0, 0, 0, 0, 42];
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(
            decoded,
            Message::SendProbes {
                program: ProgramId::new(1, 4),
                timestamp: 256,
                samples: vec![0, 0, 0, 0, 42],
            }
        );
    }

    #[test]
    fn send_event_message_is_remaining_bytes() {
        let mut frame = vec![0x5A, 0x7D, 0x00, 0x01, 26, 1, 4, 0];
        frame.extend_from_slice(b"logon ok");
        let Message::SendEvent { event_id, message, .. } = Message::decode(&frame).unwrap() else {
            panic!("esperado SEND_EVENT");
        };
        assert_eq!(event_id, 0);
        assert_eq!(message, b"logon ok");
    }

    #[test]
    fn encode_rejects_long_names() {
        let desc = ProgramDescriptor {
            id: ProgramId::new(0, 0),
            name: "x".repeat(300),
            probes: vec![],
            events: vec![],
        };
        assert_eq!(
            Message::RegisterProgram(desc).encode(),
            Err(ProtocolError::FieldTooLong { field: "name", len: 300 })
        );
    }

    #[test]
    fn invalid_utf8_names_are_kept_lossily() {
        let mut frame = MAGIC_NUMBER.to_be_bytes().to_vec();
        frame.push(22);
        frame.extend_from_slice(&[0, 1, 0, 0, 2, 0xFF, b'a']);
        let Message::RegisterProgram(desc) = Message::decode(&frame).unwrap() else {
            panic!("esperado REGISTER_PROGRAM");
        };
        assert_eq!(desc.name, "\u{FFFD}a");
    }
}
