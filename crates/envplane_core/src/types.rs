//! Entidades do plano de ambiente: programas, probes e tipos de evento.
//!
//! Um [`Program`] é criado a partir de um [`ProgramDescriptor`] recebido em
//! `REGISTER_PROGRAM` e pertence exclusivamente ao registro. Probes e tipos
//! de evento pertencem ao programa; o restante do código só recebe
//! referências emprestadas.

use std::fmt;

use crate::protocol::ProgramDescriptor;

// ──────────────────────────────────────────────
// Identificadores
// ──────────────────────────────────────────────

/// Identificador composto `(host_id, program_id)` empacotado em 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramId(u16);

impl ProgramId {
    pub fn new(host_id: u8, program_id: u8) -> Self {
        Self(((host_id as u16) << 8) | program_id as u16)
    }

    pub fn packed(self) -> u16 {
        self.0
    }

    pub fn host_id(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn program_id(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.host_id(), self.program_id())
    }
}

/// Tag de armazenamento de uma probe (6 bits baixos do `storage_byte`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageType(u8);

impl StorageType {
    pub const MASK: u8 = 0x3F;

    /// Trunca para os 6 bits válidos.
    pub fn new(tag: u8) -> Self {
        Self(tag & Self::MASK)
    }

    pub fn tag(self) -> u8 {
        self.0
    }
}

/// Severidade de um tipo de evento, transportada como está no fio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventLevel(pub u8);

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

// ──────────────────────────────────────────────
// Probe
// ──────────────────────────────────────────────

/// Estado de uma probe tal como enviado em `SET_PROBE_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeState {
    Disabled = 0,
    Enabled = 1,
    Displayed = 2,
}

impl ProbeState {
    /// `displayed` tem prioridade sobre `enabled`.
    pub fn from_flags(enabled: bool, displayed: bool) -> Self {
        if displayed {
            ProbeState::Displayed
        } else if enabled {
            ProbeState::Enabled
        } else {
            ProbeState::Disabled
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ProbeState::Disabled),
            1 => Some(ProbeState::Enabled),
            2 => Some(ProbeState::Displayed),
            _ => None,
        }
    }
}

/// Métrica numérica exposta por um programa.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    id: u8,
    name: String,
    unit: String,
    storage: StorageType,
    enabled: bool,
    displayed: bool,
}

impl Probe {
    pub fn new(id: u8, name: impl Into<String>, unit: impl Into<String>, storage: StorageType) -> Self {
        Self {
            id,
            name: name.into(),
            unit: unit.into(),
            storage,
            enabled: false,
            displayed: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn storage(&self) -> StorageType {
        self.storage
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_displayed(&self) -> bool {
        self.displayed
    }

    /// Atualiza as flags mantendo `displayed ⇒ enabled`.
    pub fn set_status(&mut self, enabled: bool, displayed: bool) {
        self.displayed = displayed;
        self.enabled = enabled || displayed;
    }

    pub fn state(&self) -> ProbeState {
        ProbeState::from_flags(self.enabled, self.displayed)
    }
}

// ──────────────────────────────────────────────
// Eventos
// ──────────────────────────────────────────────

/// Tipo de mensagem discreta exposta por um programa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    pub id: u8,
    pub ident: String,
    pub level: EventLevel,
}

// ──────────────────────────────────────────────
// Programa
// ──────────────────────────────────────────────

/// Processo instrumentado conhecido pelo coletor.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    id: ProgramId,
    name: String,
    probes: Vec<Probe>,
    events: Vec<EventType>,
}

impl Program {
    pub fn new(id: ProgramId, name: impl Into<String>, probes: Vec<Probe>, events: Vec<EventType>) -> Self {
        Self {
            id,
            name: name.into(),
            probes,
            events,
        }
    }

    /// Constrói o programa a partir da descrição recebida no fio.
    /// O índice de cada probe/evento na lista é o seu id.
    pub fn from_descriptor(desc: &ProgramDescriptor) -> Self {
        let probes = desc
            .probes
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut probe = Probe::new(i as u8, p.name.clone(), p.unit.clone(), p.storage);
                probe.set_status(p.enabled, p.displayed);
                probe
            })
            .collect();

        let events = desc
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| EventType {
                id: i as u8,
                ident: e.ident.clone(),
                level: e.level,
            })
            .collect();

        Self::new(desc.id, desc.name.clone(), probes, events)
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn events(&self) -> &[EventType] {
        &self.events
    }

    pub fn probe(&self, id: u8) -> Option<&Probe> {
        self.probes.get(id as usize)
    }

    pub fn probe_mut(&mut self, id: u8) -> Option<&mut Probe> {
        self.probes.get_mut(id as usize)
    }

    pub fn event(&self, id: u8) -> Option<&EventType> {
        self.events.get(id as usize)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.name)
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
