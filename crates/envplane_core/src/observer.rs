//! Fronteira de notificações entre o núcleo e a interface.
//!
//! O núcleo guarda no máximo um [`ObserverSink`], definido na construção.
//! Sem sink, as notificações são simplesmente descartadas.

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::debug;

use crate::registry::ProgramRegistry;
use crate::transfer::{TransferProgress, TransferSummary};
use crate::types::{EventLevel, EventType, Probe, Program, ProgramId};
use crate::value::ProbeValue;

/// Interface notificada das mudanças do registro e das amostras recebidas.
pub trait ObserverSink {
    /// Um programa foi registrado ou removido.
    fn program_list_changed(&mut self, programs: &ProgramRegistry);

    fn new_probe_value(&mut self, program: &Program, probe: &Probe, timestamp: u32, value: ProbeValue);

    /// `event` é `None` quando o id não existe no programa; a mensagem
    /// é entregue mesmo assim.
    fn new_event(&mut self, program: &Program, event_id: u8, event: Option<&EventType>, message: &str);

    /// O coletor confirmou (ou deixou de confirmar) o registro.
    fn collector_status_changed(&mut self, _functional: bool) {}
}

/// Slot opcional do sink.
#[derive(Default)]
pub struct Notifier {
    sink: Option<Box<dyn ObserverSink>>,
}

impl Notifier {
    pub fn new(sink: Option<Box<dyn ObserverSink>>) -> Self {
        Self { sink }
    }

    pub fn program_list_changed(&mut self, programs: &ProgramRegistry) {
        if let Some(sink) = self.sink.as_mut() {
            sink.program_list_changed(programs);
        }
    }

    pub fn new_probe_value(&mut self, program: &Program, probe: &Probe, timestamp: u32, value: ProbeValue) {
        if let Some(sink) = self.sink.as_mut() {
            sink.new_probe_value(program, probe, timestamp, value);
        }
    }

    pub fn new_event(&mut self, program: &Program, event_id: u8, event: Option<&EventType>, message: &str) {
        if let Some(sink) = self.sink.as_mut() {
            sink.new_event(program, event_id, event, message);
        }
    }

    pub fn collector_status_changed(&mut self, functional: bool) {
        if let Some(sink) = self.sink.as_mut() {
            sink.collector_status_changed(functional);
        }
    }
}

// ──────────────────────────────────────────────
// Notificações por channel
// ──────────────────────────────────────────────

/// Resumo de um programa registrado.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramSummary {
    pub id: ProgramId,
    pub name: String,
    pub probes: usize,
    pub events: usize,
}

/// Amostra de probe, desacoplada do registro.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSample {
    pub program: ProgramId,
    pub probe_id: u8,
    pub probe_name: String,
    pub unit: String,
    pub timestamp: u32,
    pub value: ProbeValue,
}

/// Evento recebido de um programa.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub program: ProgramId,
    pub program_name: String,
    pub event_id: u8,
    pub name: Option<String>,
    pub level: Option<EventLevel>,
    pub message: String,
}

/// Mensagem enviada do plano para quem consome o channel.
#[derive(Debug, Clone)]
pub enum Notification {
    ProgramList(Vec<ProgramSummary>),
    ProbeValue(ProbeSample),
    Event(EventRecord),
    CollectorStatus(bool),
    TransferProgress(TransferProgress),
    /// Erro já formatado: o [`crate::PlaneError`] não é `Clone`.
    TransferFinished(Result<TransferSummary, String>),
}

impl Notification {
    /// Amostras e progresso são periódicos: perder um não muda o estado
    /// visto pelo consumidor.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Notification::ProbeValue(_) | Notification::TransferProgress(_))
    }
}

/// Sink que converte cada notificação em [`Notification`] e a envia por
/// um channel limitado.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Notification>,
}

impl ChannelSink {
    /// Cria o sink e o receiver correspondente.
    pub fn channel(capacity: usize) -> (Self, Receiver<Notification>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }

    /// Amostras e progresso são descartados se o consumidor está lento.
    /// As demais notificações esperam espaço no channel.
    pub fn send(&self, notification: Notification) {
        if notification.is_droppable() {
            if self.tx.try_send(notification).is_err() {
                debug!("Channel cheio ou fechado, descartando notificação");
            }
        } else if self.tx.send(notification).is_err() {
            debug!("Channel fechado, notificação perdida");
        }
    }
}

impl ObserverSink for ChannelSink {
    fn program_list_changed(&mut self, programs: &ProgramRegistry) {
        let list = programs
            .programs()
            .map(|p| ProgramSummary {
                id: p.id(),
                name: p.name().to_string(),
                probes: p.probes().len(),
                events: p.events().len(),
            })
            .collect();
        self.send(Notification::ProgramList(list));
    }

    fn new_probe_value(&mut self, program: &Program, probe: &Probe, timestamp: u32, value: ProbeValue) {
        self.send(Notification::ProbeValue(ProbeSample {
            program: program.id(),
            probe_id: probe.id(),
            probe_name: probe.name().to_string(),
            unit: probe.unit().to_string(),
            timestamp,
            value,
        }));
    }

    fn new_event(&mut self, program: &Program, event_id: u8, event: Option<&EventType>, message: &str) {
        self.send(Notification::Event(EventRecord {
            program: program.id(),
            program_name: program.name().to_string(),
            event_id,
            name: event.map(|e| e.ident.clone()),
            level: event.map(|e| e.level),
            message: message.to_string(),
        }));
    }

    fn collector_status_changed(&mut self, functional: bool) {
        self.send(Notification::CollectorStatus(functional));
    }
}
